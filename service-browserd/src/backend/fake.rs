//! Scriptable in-memory backend for engine tests.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use shared::types::{BrowseKey, InstanceKey, ServiceEvent, ServiceInstance};
use crate::error::BackendError;
use super::{AddressRecord, EventStream, ResolverBackend, StopHandle};

#[derive(Default)]
struct FakeState {
    browsers: HashMap<BrowseKey, Vec<(u64, flume::Sender<ServiceEvent>)>>,
    next_id: u64,
    opened: HashMap<BrowseKey, usize>,
    stopped: HashMap<BrowseKey, usize>,
    refused: HashSet<BrowseKey>,
    resolutions: HashMap<String, (String, u16, HashMap<String, String>)>,
    addresses: HashMap<String, Vec<Vec<IpAddr>>>,
    resolve_calls: usize,
    held: Option<Arc<Notify>>,
    query_calls: usize,
    registered: Vec<ServiceInstance>,
    unregistered: Vec<InstanceKey>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every open browse for `key`
    pub fn emit(&self, key: &BrowseKey, event: ServiceEvent) {
        let state = self.state.lock();
        if let Some(senders) = state.browsers.get(key) {
            for (_, tx) in senders {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn found(&self, key: &BrowseKey, name: &str, more_coming: bool) {
        let instance = ServiceInstance::new(name, format!("{}.", key.reg_type), key.domain.clone());
        self.emit(key, ServiceEvent::Found { instance, more_coming });
    }

    pub fn lost(&self, key: &BrowseKey, name: &str, more_coming: bool) {
        let instance = ServiceInstance::new(name, format!("{}.", key.reg_type), key.domain.clone());
        self.emit(key, ServiceEvent::Lost { key: instance.key(), more_coming });
    }

    /// A type-enumeration record, e.g. `_http` over `_tcp` in local.
    pub fn found_type(&self, name: &str, protocol: &str) {
        let meta = BrowseKey::type_enumeration("local.");
        let instance = ServiceInstance::new(name, format!("{}.local.", protocol), ".");
        self.emit(&meta, ServiceEvent::Found { instance, more_coming: false });
    }

    pub fn fail(&self, key: &BrowseKey, cause: &str) {
        self.emit(key, ServiceEvent::OperationFailed {
            key: key.clone(),
            cause: cause.to_string(),
        });
    }

    pub fn refuse_browse(&self, key: &BrowseKey) {
        self.state.lock().refused.insert(key.clone());
    }

    pub fn set_resolution(&self, name: &str, hostname: &str, port: u16, txt: &[(&str, &str)]) {
        let txt = txt.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.state.lock().resolutions.insert(name.to_string(), (hostname.to_string(), port, txt));
    }

    /// Each inner vec is delivered as one record; all but the last carry more_coming
    pub fn set_addresses(&self, hostname: &str, batches: Vec<Vec<IpAddr>>) {
        self.state.lock().addresses.insert(hostname.to_string(), batches);
    }

    /// Resolves started from now on wait for the returned gate before
    /// completing with the resolution that was current when they started
    pub fn hold_resolves(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().held = Some(gate.clone());
        gate
    }

    pub fn release_resolves(&self) {
        self.state.lock().held = None;
    }

    pub fn opened(&self, key: &BrowseKey) -> usize {
        self.state.lock().opened.get(key).copied().unwrap_or(0)
    }

    pub fn stopped(&self, key: &BrowseKey) -> usize {
        self.state.lock().stopped.get(key).copied().unwrap_or(0)
    }

    /// Browses opened and not yet stopped, across all keys
    pub fn live(&self) -> usize {
        self.state.lock().browsers.values().map(Vec::len).sum()
    }

    pub fn resolve_calls(&self) -> usize {
        self.state.lock().resolve_calls
    }

    pub fn query_calls(&self) -> usize {
        self.state.lock().query_calls
    }

    pub fn registered(&self) -> Vec<ServiceInstance> {
        self.state.lock().registered.clone()
    }

    pub fn unregistered(&self) -> Vec<InstanceKey> {
        self.state.lock().unregistered.clone()
    }
}

impl ResolverBackend for FakeBackend {
    fn browse(&self, key: &BrowseKey) -> Result<EventStream<ServiceEvent>, BackendError> {
        let mut state = self.state.lock();
        if state.refused.contains(key) {
            return Err(BackendError::BrowseFailed {
                reg_type: key.reg_type.clone(),
                domain: key.domain.clone(),
                reason: "refused".to_string(),
            });
        }

        let (tx, rx) = flume::unbounded();
        state.next_id += 1;
        let id = state.next_id;
        state.browsers.entry(key.clone()).or_default().push((id, tx));
        *state.opened.entry(key.clone()).or_default() += 1;

        let shared = self.state.clone();
        let key = key.clone();
        let stop = StopHandle::new(move || {
            let mut state = shared.lock();
            if let Some(senders) = state.browsers.get_mut(&key) {
                senders.retain(|(sender_id, _)| *sender_id != id);
                if senders.is_empty() {
                    state.browsers.remove(&key);
                }
            }
            *state.stopped.entry(key).or_default() += 1;
        });

        Ok(EventStream::new(rx, stop))
    }

    fn resolve(&self, mut instance: ServiceInstance) -> BoxFuture<'static, Result<ServiceInstance, BackendError>> {
        let mut state = self.state.lock();
        state.resolve_calls += 1;
        let result = match state.resolutions.get(&instance.name) {
            Some((hostname, port, txt)) => {
                instance.hostname = Some(hostname.clone());
                instance.port = *port;
                instance.txt = txt.clone();
                Ok(instance)
            }
            None => Err(BackendError::ResolveFailed {
                name: instance.name.clone(),
                reason: "no such instance".to_string(),
            }),
        };
        match state.held.clone() {
            Some(gate) => async move {
                gate.notified().await;
                result
            }
            .boxed(),
            None => future::ready(result).boxed(),
        }
    }

    fn query_addresses(
        &self,
        hostname: &str,
        _if_index: u32,
    ) -> Result<EventStream<Result<AddressRecord, BackendError>>, BackendError> {
        let mut state = self.state.lock();
        state.query_calls += 1;
        let Some(batches) = state.addresses.get(hostname) else {
            return Err(BackendError::QueryFailed {
                hostname: hostname.to_string(),
                reason: "no address records".to_string(),
            });
        };

        let (tx, rx) = flume::unbounded();
        let last = batches.len().saturating_sub(1);
        for (i, batch) in batches.iter().enumerate() {
            let _ = tx.send(Ok(AddressRecord {
                addresses: batch.clone(),
                more_coming: i < last,
            }));
        }
        Ok(EventStream::new(rx, StopHandle::noop()))
    }

    fn register(&self, instance: ServiceInstance) -> BoxFuture<'static, Result<ServiceInstance, BackendError>> {
        self.state.lock().registered.push(instance.clone());
        future::ready(Ok(instance)).boxed()
    }

    fn unregister(&self, instance: &ServiceInstance) -> Result<(), BackendError> {
        self.state.lock().unregistered.push(instance.key());
        Ok(())
    }
}
