use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{FLAG_MORE_COMING, LOCAL_DOMAIN, SERVICES_DOMAIN};

/// Stable identity of a service instance.
/// Field order makes the derived ordering sort by instance name first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub name: String,
    pub reg_type: String,
    pub domain: String,
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.name, self.reg_type.trim_end_matches('.'), self.domain)
    }
}

/// A browse target: one (service type, domain) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrowseKey {
    /// Service type without trailing dot, e.g. "_http._tcp"
    pub reg_type: String,
    /// Domain with trailing dot, e.g. "local."
    pub domain: String,
}

impl BrowseKey {
    pub fn new(reg_type: impl AsRef<str>, domain: impl AsRef<str>) -> Self {
        Self {
            reg_type: reg_type.as_ref().trim_end_matches('.').to_string(),
            domain: normalize_domain(domain.as_ref()),
        }
    }

    /// The meta-browse that enumerates service types in `domain`
    pub fn type_enumeration(domain: impl AsRef<str>) -> Self {
        Self::new(SERVICES_DOMAIN, domain)
    }

    pub fn is_type_enumeration(&self) -> bool {
        self.reg_type == SERVICES_DOMAIN
    }
}

impl Default for BrowseKey {
    fn default() -> Self {
        Self::type_enumeration(LOCAL_DOMAIN)
    }
}

impl std::fmt::Display for BrowseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.reg_type, self.domain)
    }
}

/// Domains always carry a trailing dot; an empty domain means the root.
pub fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim_end_matches('.');
    format!("{}.", trimmed)
}

/// One advertised service instance, or an aggregated service type when
/// `service_count` is set.
///
/// Equality and hashing use only the (domain, reg_type, name) identity so
/// found/lost/updated events about the same instance collapse together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance name, e.g. "MyPrinter"; for enumerated types, "_http"
    pub name: String,

    /// Service type as reported by the backend, e.g. "_http._tcp."
    pub reg_type: String,

    /// Domain, e.g. "local."
    pub domain: String,

    /// Interface the record was seen on (0 = any)
    pub if_index: u32,

    /// Raw backend flags
    pub flags: u32,

    /// Target hostname, unset until resolved
    pub hostname: Option<String>,

    /// Service port
    pub port: u16,

    /// TXT record key-value pairs
    pub txt: HashMap<String, String>,

    /// IPv4/IPv6 addresses of the host
    pub addresses: Vec<IpAddr>,

    /// Last time resolution data was written
    pub updated_at: Option<DateTime<Utc>>,

    /// Live instance count, only set on aggregated service types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_count: Option<usize>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, reg_type: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reg_type: reg_type.into(),
            domain: domain.into(),
            if_index: 0,
            flags: 0,
            hostname: None,
            port: 0,
            txt: HashMap::new(),
            addresses: Vec::new(),
            updated_at: None,
            service_count: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            name: self.name.clone(),
            reg_type: self.reg_type.clone(),
            domain: self.domain.clone(),
        }
    }

    pub fn more_coming(&self) -> bool {
        self.flags & FLAG_MORE_COMING != 0
    }

    pub fn is_resolved(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Add addresses not already present, keeping arrival order.
    pub fn merge_addresses(&mut self, addresses: impl IntoIterator<Item = IpAddr>) {
        for address in addresses {
            if !self.addresses.contains(&address) {
                self.addresses.push(address);
            }
        }
    }

    /// Overwrite the mutable fields from a newer sighting of the same instance.
    /// Identity is never touched, and resolution data is only replaced when
    /// the newer record carries it.
    pub fn update_from(&mut self, other: &ServiceInstance) {
        self.if_index = other.if_index;
        self.flags = other.flags;
        if other.hostname.is_some() {
            self.hostname = other.hostname.clone();
            self.port = other.port;
            self.txt = other.txt.clone();
        }
        if !other.addresses.is_empty() {
            self.addresses = other.addresses.clone();
        }
        if other.updated_at.is_some() {
            self.updated_at = other.updated_at;
        }
    }

    /// "address:port" endpoints, empty until the address query answered
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect()
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.reg_type == other.reg_type && self.domain == other.domain
    }
}

impl Eq for ServiceInstance {}

impl Hash for ServiceInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.reg_type.hash(state);
        self.domain.hash(state);
    }
}

/// A delta delivered by a browse operation.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Found { instance: ServiceInstance, more_coming: bool },
    Lost { key: InstanceKey, more_coming: bool },
    OperationFailed { key: BrowseKey, cause: String },
}

impl ServiceEvent {
    pub fn more_coming(&self) -> bool {
        match self {
            ServiceEvent::Found { more_coming, .. } | ServiceEvent::Lost { more_coming, .. } => *more_coming,
            ServiceEvent::OperationFailed { .. } => false,
        }
    }

    pub fn instance_key(&self) -> Option<InstanceKey> {
        match self {
            ServiceEvent::Found { instance, .. } => Some(instance.key()),
            ServiceEvent::Lost { key, .. } => Some(key.clone()),
            ServiceEvent::OperationFailed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    #[test]
    fn test_identity_ignores_mutable_fields() {
        let a = ServiceInstance::new("printer", "_ipp._tcp.", "local.");
        let mut b = a.clone();
        b.port = 631;
        b.hostname = Some("printer.local.".to_string());
        b.txt.insert("rp".to_string(), "ipp/print".to_string());

        assert_eq!(a, b);
        let set: HashSet<ServiceInstance> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_browse_key_normalization() {
        assert_eq!(BrowseKey::new("_http._tcp.", "local"), BrowseKey::new("_http._tcp", "local."));
        assert!(BrowseKey::type_enumeration("local").is_type_enumeration());
        assert_eq!(normalize_domain(""), ".");
    }

    #[test]
    fn test_merge_addresses_augments() {
        let mut instance = ServiceInstance::new("nas", "_smb._tcp.", "local.");
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5));
        instance.merge_addresses([v4]);
        instance.merge_addresses([v4, "fd00::1".parse().unwrap()]);
        assert_eq!(instance.addresses.len(), 2);
        instance.port = 445;
        assert_eq!(instance.socket_addrs()[0].to_string(), "192.0.2.5:445");
    }

    #[test]
    fn test_update_keeps_resolution_when_absent() {
        let mut known = ServiceInstance::new("nas", "_smb._tcp.", "local.");
        known.hostname = Some("nas.local.".to_string());
        known.port = 445;

        let mut sighting = ServiceInstance::new("nas", "_smb._tcp.", "local.");
        sighting.if_index = 3;
        known.update_from(&sighting);

        assert_eq!(known.if_index, 3);
        assert_eq!(known.hostname.as_deref(), Some("nas.local."));
        assert_eq!(known.port, 445);
    }
}
