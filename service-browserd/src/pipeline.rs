use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use chrono::Utc;
use tokio::task::AbortHandle;
use shared::types::{InstanceKey, ServiceEvent, ServiceInstance};
use crate::backend::{EventStream, ResolverBackend};
use crate::error::BackendError;

/// Browse -> resolve -> address query for one instance.
///
/// A failed address query is not fatal: the instance comes back with
/// hostname, port and TXT filled in and an empty address list.
#[derive(Clone)]
pub struct ResolvePipeline {
    backend: Arc<dyn ResolverBackend>,
}

impl ResolvePipeline {
    pub fn new(backend: Arc<dyn ResolverBackend>) -> Self {
        Self { backend }
    }

    /// Lost events pass through untouched and without backend calls
    pub async fn process(&self, event: ServiceEvent) -> Result<ServiceEvent, BackendError> {
        match event {
            ServiceEvent::Found { instance, more_coming } => Ok(ServiceEvent::Found {
                instance: self.resolve(instance).await?,
                more_coming,
            }),
            other => Ok(other),
        }
    }

    pub async fn resolve(&self, instance: ServiceInstance) -> Result<ServiceInstance, BackendError> {
        let mut resolved = self.backend.resolve(instance).await?;
        resolved.updated_at = Some(Utc::now());
        resolved.addresses.clear();

        let Some(hostname) = resolved.hostname.clone() else {
            return Ok(resolved);
        };

        match self.query_addresses(&hostname, resolved.if_index).await {
            Ok(addresses) => resolved.merge_addresses(addresses),
            Err(e) => tracing::warn!("Address query for {} failed, keeping partial resolution: {}", resolved.key(), e),
        }
        Ok(resolved)
    }

    /// Collect address records until the backend stops signalling more
    async fn query_addresses(&self, hostname: &str, if_index: u32) -> Result<Vec<IpAddr>, BackendError> {
        let EventStream { events, mut stop } = self.backend.query_addresses(hostname, if_index)?;
        let mut addresses: Vec<IpAddr> = Vec::new();

        while let Ok(record) = events.recv_async().await {
            let record = match record {
                Ok(record) => record,
                Err(e) if addresses.is_empty() => return Err(e),
                Err(e) => {
                    tracing::debug!("Address query for {} ended early: {}", hostname, e);
                    break;
                }
            };
            for address in record.addresses {
                if !addresses.contains(&address) {
                    addresses.push(address);
                }
            }
            if !record.more_coming {
                break;
            }
        }

        stop.stop();
        Ok(addresses)
    }
}

/// At most one in-flight resolution per instance.
///
/// Starting a new one aborts the previous task; a result whose generation
/// is no longer current is discarded by `finish`.
#[derive(Default)]
pub struct InFlight {
    running: HashMap<InstanceKey, (u64, AbortHandle)>,
    next_generation: u64,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin<F>(&mut self, key: InstanceKey, spawn: F) -> u64
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = spawn(generation);
        self.running.insert(key, (generation, handle));
        generation
    }

    /// Returns true if `generation` is still the current run for `key`
    pub fn finish(&mut self, key: &InstanceKey, generation: u64) -> bool {
        match self.running.get(key) {
            Some((current, _)) if *current == generation => {
                self.running.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, key: &InstanceKey) -> bool {
        match self.running.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.running.drain() {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
