//! Aggregation store: the single owner of every known instance and
//! service-type aggregate.
//!
//! Leaf instances live in one table per live browse session. An aggregate's
//! `service_count` is never stored; it is the size of the leaf table of the
//! aggregate's own nested browse, so replays cannot double-count and the
//! count cannot go negative.

use std::collections::{btree_map::Entry, BTreeMap, HashMap, HashSet};
use chrono::Utc;
use shared::regtype::{AggregateKey, ServiceType};
use shared::types::{BrowseKey, InstanceKey, ServiceEvent, ServiceInstance};

/// What an applied event changed, and what the caller must do next
#[derive(Debug, Default)]
pub struct Applied {
    /// Observer keys whose snapshot changed
    pub changed: Vec<BrowseKey>,
    /// Nested browse to start for a newly enumerated service type
    pub browse: Option<BrowseKey>,
    /// Instance whose resolution should (re)start
    pub resolve: Option<ServiceInstance>,
    /// Instance whose in-flight resolution is obsolete
    pub cancel_resolve: Option<InstanceKey>,
    /// The event was dropped because its reg type did not parse
    pub malformed: bool,
}

#[derive(Debug, Default)]
pub struct Store {
    leaves: HashMap<BrowseKey, BTreeMap<InstanceKey, ServiceInstance>>,
    aggregates: BTreeMap<AggregateKey, ServiceInstance>,
    type_domains: HashSet<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start keeping state for a browse key
    pub fn track(&mut self, key: &BrowseKey) {
        if key.is_type_enumeration() {
            self.type_domains.insert(key.domain.clone());
        } else {
            self.leaves.entry(key.clone()).or_default();
        }
    }

    /// Drop all state for a browse key. Returns the discarded leaf instances.
    pub fn forget(&mut self, key: &BrowseKey) -> Vec<InstanceKey> {
        if key.is_type_enumeration() {
            self.type_domains.remove(&key.domain);
            self.aggregates.retain(|aggregate, _| aggregate.domain != key.domain);
            return Vec::new();
        }
        self.leaves
            .remove(key)
            .map(|table| table.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn apply_event(&mut self, key: &BrowseKey, event: &ServiceEvent) -> Applied {
        let mut applied = Applied::default();
        if key.is_type_enumeration() {
            self.apply_type_event(event, &mut applied);
        } else {
            self.apply_leaf_event(key, event, &mut applied);
        }
        applied
    }

    fn apply_type_event(&mut self, event: &ServiceEvent, applied: &mut Applied) {
        match event {
            ServiceEvent::Found { instance, .. } => {
                let service_type = match ServiceType::from_enumerated(instance) {
                    Ok(service_type) => service_type,
                    Err(e) => {
                        tracing::warn!("Dropping enumerated type {}: {}", instance.name, e);
                        applied.malformed = true;
                        return;
                    }
                };
                if !self.type_domains.contains(&service_type.domain) {
                    tracing::debug!("Ignoring type {} in untracked domain", service_type.reg_type());
                    return;
                }

                match self.aggregates.entry(service_type.aggregate_key()) {
                    Entry::Occupied(mut entry) => entry.get_mut().update_from(instance),
                    Entry::Vacant(entry) => {
                        tracing::info!("Discovered new service type: {}", service_type.reg_type());
                        entry.insert(instance.clone());
                        applied.browse = Some(service_type.browse_key());
                        applied.changed.push(BrowseKey::type_enumeration(&service_type.domain));
                    }
                }
            }
            // Aggregates live as long as the enumeration browse does
            ServiceEvent::Lost { key, .. } => tracing::debug!("Ignoring lost service type {}", key),
            ServiceEvent::OperationFailed { .. } => {}
        }
    }

    fn apply_leaf_event(&mut self, key: &BrowseKey, event: &ServiceEvent, applied: &mut Applied) {
        let Some(instance_key) = event.instance_key() else {
            return;
        };
        let service_type = match ServiceType::from_leaf(&instance_key.reg_type, &instance_key.domain) {
            Ok(service_type) => service_type,
            Err(e) => {
                tracing::warn!("Dropping event for {}: {}", instance_key, e);
                applied.malformed = true;
                return;
            }
        };
        let Some(table) = self.leaves.get_mut(key) else {
            tracing::debug!("Dropping event for untracked browse {}", key);
            return;
        };

        let membership_changed = match event {
            ServiceEvent::Found { instance, .. } => {
                let inserted = !table.contains_key(&instance_key);
                let entry = table
                    .entry(instance_key)
                    .and_modify(|known| known.update_from(instance))
                    .or_insert_with(|| instance.clone());
                applied.resolve = Some(entry.clone());
                applied.changed.push(key.clone());
                inserted
            }
            ServiceEvent::Lost { .. } => {
                let removed = table.remove(&instance_key).is_some();
                applied.cancel_resolve = Some(instance_key);
                if removed {
                    applied.changed.push(key.clone());
                }
                removed
            }
            ServiceEvent::OperationFailed { .. } => false,
        };

        if membership_changed && self.type_domains.contains(&service_type.domain) {
            let aggregate_key = service_type.aggregate_key();
            if self.aggregates.contains_key(&aggregate_key) {
                applied.changed.push(BrowseKey::type_enumeration(&service_type.domain));
            } else {
                tracing::warn!("Service from unknown service type {}", aggregate_key);
            }
        }
    }

    /// Write a finished resolution back. Returns false if the instance is gone.
    pub fn apply_resolved(&mut self, key: &BrowseKey, resolved: ServiceInstance) -> bool {
        let Some(known) = self
            .leaves
            .get_mut(key)
            .and_then(|table| table.get_mut(&resolved.key()))
        else {
            return false;
        };

        known.hostname = resolved.hostname;
        known.port = resolved.port;
        known.txt = resolved.txt;
        known.addresses = resolved.addresses;
        known.updated_at = Some(resolved.updated_at.unwrap_or_else(Utc::now));
        true
    }

    pub fn service_count(&self, key: &AggregateKey) -> usize {
        let browse = ServiceType {
            name: key.name.clone(),
            protocol: key.protocol,
            domain: key.domain.clone(),
        }
        .browse_key();
        self.leaves.get(&browse).map_or(0, BTreeMap::len)
    }

    /// Current state for an observer key, sorted by name
    pub fn snapshot(&self, key: &BrowseKey) -> Vec<ServiceInstance> {
        if key.is_type_enumeration() {
            return self.types_snapshot(&key.domain);
        }
        self.leaves
            .get(key)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn types_snapshot(&self, domain: &str) -> Vec<ServiceInstance> {
        let mut types: Vec<ServiceInstance> = self
            .aggregates
            .iter()
            .filter(|(aggregate, _)| aggregate.domain == domain)
            .map(|(aggregate, record)| {
                let mut record = record.clone();
                record.service_count = Some(self.service_count(aggregate));
                record
            })
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.reg_type.cmp(&b.reg_type)));
        types
    }

    /// Instances under `key` that have not been through the resolve pipeline
    pub fn unresolved(&self, key: &BrowseKey) -> Vec<ServiceInstance> {
        self.leaves
            .get(key)
            .map(|table| table.values().filter(|i| !i.is_resolved()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn locate(&self, instance: &InstanceKey) -> Option<(BrowseKey, ServiceInstance)> {
        self.leaves.iter().find_map(|(key, table)| {
            table.get(instance).map(|known| (key.clone(), known.clone()))
        })
    }
}

/// The type view as shown to users: only types with live instances
pub fn non_zero_types(snapshot: &[ServiceInstance]) -> Vec<ServiceInstance> {
    snapshot
        .iter()
        .filter(|record| record.service_count.unwrap_or(0) > 0)
        .cloned()
        .collect()
}
