use std::collections::BTreeMap;
use std::net::IpAddr;
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::ServiceInstance;

/// Only fields that describe the service; `updated_at` changes on every
/// re-resolve. TXT goes through a BTreeMap so key order is stable.
#[derive(Serialize)]
struct HashView<'a> {
    name: &'a str,
    reg_type: &'a str,
    domain: &'a str,
    hostname: Option<&'a str>,
    addresses: &'a [IpAddr],
    port: u16,
    txt: BTreeMap<&'a str, &'a str>,
    service_count: Option<usize>,
}

/// SHA-256 over a snapshot, independent of input order
pub fn compute_hash(instances: &[ServiceInstance]) -> String {
    let mut sorted: Vec<&ServiceInstance> = instances.iter().collect();
    sorted.sort_by(|a, b| a.key().cmp(&b.key()));

    let views: Vec<HashView<'_>> = sorted
        .into_iter()
        .map(|i| HashView {
            name: &i.name,
            reg_type: &i.reg_type,
            domain: &i.domain,
            hostname: i.hostname.as_deref(),
            addresses: &i.addresses,
            port: i.port,
            txt: i.txt.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
            service_count: i.service_count,
        })
        .collect();

    // Serializing plain strings and numbers cannot fail
    let json = serde_json::to_string(&views).unwrap_or_default();
    hex::encode(Sha256::digest(json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use chrono::Utc;

    fn test_instance(name: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(name, "_http._tcp.", "local.");
        instance.hostname = Some("test.local.".to_string());
        instance.addresses = vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))];
        instance.port = 8080;
        instance.txt.insert("path".to_string(), "/".to_string());
        instance.txt.insert("model".to_string(), "x1".to_string());
        instance
    }

    #[test]
    fn test_hash_deterministic() {
        let a = test_instance("a");
        let b = test_instance("b");

        let hash1 = compute_hash(&[a.clone(), b.clone()]);
        let hash2 = compute_hash(&[b, a]);

        assert_eq!(hash1, hash2, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let a = test_instance("a");
        let mut changed = test_instance("a");
        changed.port = 9090;

        assert_ne!(compute_hash(&[a]), compute_hash(&[changed]));
    }

    #[test]
    fn test_hash_tracks_service_count() {
        let mut a = test_instance("a");
        a.service_count = Some(1);
        let mut b = test_instance("a");
        b.service_count = Some(2);

        assert_ne!(compute_hash(&[a]), compute_hash(&[b]));
    }

    #[test]
    fn test_hash_stable_across_timestamp_changes() {
        let a = test_instance("a");
        let mut b = test_instance("a");
        b.updated_at = Some(Utc::now() + chrono::Duration::seconds(60));

        assert_eq!(compute_hash(&[a]), compute_hash(&[b]));
    }
}
