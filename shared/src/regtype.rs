//! Reg-type parsing and the keys that tie leaf instances to their
//! aggregated service type.
//!
//! A service type is `_<name>._<proto>` with `<proto>` one of `_tcp`/`_udp`.
//! The type-enumeration browse reports each type split differently: the
//! instance name carries `_<name>` and the reg type carries `_<proto>.<domain>`.
//! Both shapes must land on the same [`AggregateKey`].

use std::fmt;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use crate::protocol::{EMPTY_DOMAIN, REG_TYPE_SEPARATOR, TCP_REG_TYPE_SUFFIX, UDP_REG_TYPE_SUFFIX};
use crate::types::{normalize_domain, BrowseKey, ServiceInstance};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegTypeError {
    #[error("reg type '{0}' does not have two dot-separated parts")]
    Malformed(String),

    #[error("unknown protocol suffix '{suffix}' in reg type '{reg_type}'")]
    UnknownProtocol { reg_type: String, suffix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn suffix(&self) -> &'static str {
        match self {
            Protocol::Tcp => TCP_REG_TYPE_SUFFIX,
            Protocol::Udp => UDP_REG_TYPE_SUFFIX,
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            TCP_REG_TYPE_SUFFIX => Some(Protocol::Tcp),
            UDP_REG_TYPE_SUFFIX => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Identity of an aggregated service type.
///
/// Fed by (protocol, domain, name) in that order; the string form is
/// `"." + proto + "." + domain + name`, e.g. `._tcp.local._http`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub protocol: Protocol,
    pub domain: String,
    pub name: String,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}{}{}", EMPTY_DOMAIN, self.protocol, REG_TYPE_SEPARATOR, self.domain, self.name)
    }
}

/// A parsed service type such as `_http._tcp` in `local.`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceType {
    pub name: String,
    pub protocol: Protocol,
    pub domain: String,
}

/// Split a reg type into exactly two non-empty parts, ignoring trailing dots.
pub fn split_reg_type(reg_type: &str) -> Result<(&str, &str), RegTypeError> {
    let trimmed = reg_type.trim_end_matches(REG_TYPE_SEPARATOR);
    let mut parts = trimmed.split(REG_TYPE_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(first), Some(second), None) if !first.is_empty() && !second.is_empty() => Ok((first, second)),
        _ => Err(RegTypeError::Malformed(reg_type.to_string())),
    }
}

fn protocol(reg_type: &str, suffix: &str) -> Result<Protocol, RegTypeError> {
    Protocol::from_suffix(suffix).ok_or_else(|| RegTypeError::UnknownProtocol {
        reg_type: reg_type.to_string(),
        suffix: suffix.to_string(),
    })
}

impl ServiceType {
    /// Parse a plain service type (`_http._tcp`) browsed in `domain`.
    pub fn parse(reg_type: &str, domain: &str) -> Result<Self, RegTypeError> {
        let (name, suffix) = split_reg_type(reg_type)?;
        Ok(Self {
            name: name.to_string(),
            protocol: protocol(reg_type, suffix)?,
            domain: normalize_domain(domain),
        })
    }

    /// Parse a record from the type-enumeration browse: name `_http`,
    /// reg type `_tcp.local.`
    pub fn from_enumerated(instance: &ServiceInstance) -> Result<Self, RegTypeError> {
        // The domain may have any number of labels; only the first is the protocol
        let (suffix, domain) = instance
            .reg_type
            .trim_end_matches(REG_TYPE_SEPARATOR)
            .split_once(REG_TYPE_SEPARATOR)
            .filter(|(suffix, domain)| !suffix.is_empty() && !domain.is_empty())
            .ok_or_else(|| RegTypeError::Malformed(instance.reg_type.clone()))?;
        Ok(Self {
            name: instance.name.clone(),
            protocol: protocol(&instance.reg_type, suffix)?,
            domain: normalize_domain(domain),
        })
    }

    /// Parse the type a leaf instance belongs to: reg type `_http._tcp.`
    /// in the instance's own domain.
    pub fn from_leaf(reg_type: &str, domain: &str) -> Result<Self, RegTypeError> {
        Self::parse(reg_type, domain)
    }

    pub fn reg_type(&self) -> String {
        format!("{}{}{}", self.name, REG_TYPE_SEPARATOR, self.protocol)
    }

    /// The nested browse that counts instances of this type
    pub fn browse_key(&self) -> BrowseKey {
        BrowseKey::new(self.reg_type(), &self.domain)
    }

    pub fn aggregate_key(&self) -> AggregateKey {
        AggregateKey {
            protocol: self.protocol,
            domain: self.domain.clone(),
            name: self.name.clone(),
        }
    }
}
