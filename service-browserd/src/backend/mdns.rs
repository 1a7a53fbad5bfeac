use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use futures::future::{self, BoxFuture, FutureExt};
use mdns_sd::{ServiceDaemon, ServiceEvent as MdnsEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use shared::protocol::EMPTY_DOMAIN;
use shared::types::{BrowseKey, InstanceKey, ServiceEvent, ServiceInstance};
use crate::error::BackendError;
use super::{AddressRecord, EventStream, ResolverBackend, StopHandle};

/// Resolver backend on top of an `mdns_sd` daemon.
///
/// The daemon resolves instances as part of browsing, so resolved records are
/// cached by fullname and `resolve`/`query_addresses` answer from that cache.
#[derive(Clone)]
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    resolved: ResolvedCache,
}

impl MdnsBackend {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self {
            daemon,
            resolved: ResolvedCache::default(),
        }
    }
}

/// Resolved `ServiceInfo`s seen on leaf browses, by fullname
#[derive(Clone, Default)]
struct ResolvedCache {
    infos: Arc<Mutex<HashMap<String, ServiceInfo>>>,
}

impl ResolvedCache {
    fn insert(&self, info: ServiceInfo) {
        self.infos.lock().insert(info.get_fullname().to_string(), info);
    }

    fn remove(&self, fullname: &str) {
        self.infos.lock().remove(fullname);
    }

    fn resolve(&self, mut instance: ServiceInstance) -> Result<ServiceInstance, BackendError> {
        let name = fullname(&instance);
        match self.infos.lock().get(&name) {
            Some(info) => {
                fill_from_info(&mut instance, info);
                Ok(instance)
            }
            None => Err(BackendError::ResolveFailed {
                name,
                reason: "no resolved record cached".to_string(),
            }),
        }
    }

    /// Union of the addresses of every cached record on `hostname`
    fn addresses(&self, hostname: &str) -> Result<Vec<IpAddr>, BackendError> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for info in self.infos.lock().values() {
            if info.get_hostname() != hostname {
                continue;
            }
            for address in info.get_addresses().iter() {
                if !addresses.contains(address) {
                    addresses.push(*address);
                }
            }
        }

        if addresses.is_empty() {
            return Err(BackendError::QueryFailed {
                hostname: hostname.to_string(),
                reason: "no address records".to_string(),
            });
        }
        Ok(addresses)
    }
}

/// "_http._tcp" + "local." -> "_http._tcp.local."
fn ty_domain(reg_type: &str, domain: &str) -> String {
    format!("{}.{}", reg_type.trim_end_matches('.'), domain)
}

fn fullname(instance: &ServiceInstance) -> String {
    format!("{}.{}", instance.name, ty_domain(&instance.reg_type, &instance.domain))
}

/// "_http._tcp.local." from the meta-query -> name "_http", reg type "_tcp.local."
fn enumerated_type(fullname: &str) -> ServiceInstance {
    let (name, reg_type) = fullname.split_once('.').unwrap_or((fullname, ""));
    ServiceInstance::new(name, reg_type, EMPTY_DOMAIN)
}

fn leaf_key(key: &BrowseKey, ty: &str, fullname: &str) -> InstanceKey {
    let name = fullname
        .strip_suffix(ty)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname);
    InstanceKey {
        name: name.to_string(),
        reg_type: format!("{}.", key.reg_type),
        domain: key.domain.clone(),
    }
}

/// Empty keys and empty values are dropped
fn txt_records(info: &ServiceInfo) -> HashMap<String, String> {
    info.get_properties()
        .iter()
        .filter(|prop| !prop.key().is_empty() && !prop.val_str().is_empty())
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect()
}

fn fill_from_info(instance: &mut ServiceInstance, info: &ServiceInfo) {
    instance.hostname = Some(info.get_hostname().to_string());
    instance.port = info.get_port();
    instance.txt = txt_records(info);
}

/// Map one daemon event. Events with no engine counterpart give None.
fn convert_event(
    key: &BrowseKey,
    ty: &str,
    event: MdnsEvent,
    resolved: &ResolvedCache,
) -> Option<ServiceEvent> {
    let more_coming = false;
    if key.is_type_enumeration() {
        return match event {
            MdnsEvent::ServiceFound(_, fullname) => Some(ServiceEvent::Found {
                instance: enumerated_type(&fullname),
                more_coming,
            }),
            MdnsEvent::ServiceRemoved(_, fullname) => Some(ServiceEvent::Lost {
                key: enumerated_type(&fullname).key(),
                more_coming,
            }),
            _ => None,
        };
    }

    match event {
        MdnsEvent::ServiceResolved(info) => {
            let instance_key = leaf_key(key, ty, info.get_fullname());
            let mut instance = ServiceInstance::new(instance_key.name, instance_key.reg_type, instance_key.domain);
            fill_from_info(&mut instance, &info);
            instance.merge_addresses(info.get_addresses().iter().copied());
            resolved.insert(info);
            Some(ServiceEvent::Found { instance, more_coming })
        }
        MdnsEvent::ServiceRemoved(_, fullname) => {
            resolved.remove(&fullname);
            Some(ServiceEvent::Lost {
                key: leaf_key(key, ty, &fullname),
                more_coming,
            })
        }
        MdnsEvent::ServiceFound(_, fullname) => {
            tracing::debug!("Found {}, waiting for resolution", fullname);
            None
        }
        _ => None,
    }
}

fn set_more_coming(event: &mut ServiceEvent, more: bool) {
    match event {
        ServiceEvent::Found { more_coming, .. } | ServiceEvent::Lost { more_coming, .. } => *more_coming = more,
        ServiceEvent::OperationFailed { .. } => {}
    }
}

/// Convert `first` plus everything already queued behind it. Only the last
/// converted event has `more_coming` cleared, so dropped daemon events can
/// never leave a batch open.
fn drain_batch(
    key: &BrowseKey,
    ty: &str,
    first: MdnsEvent,
    receiver: &flume::Receiver<MdnsEvent>,
    resolved: &ResolvedCache,
) -> Vec<ServiceEvent> {
    let mut batch: Vec<ServiceEvent> = convert_event(key, ty, first, resolved).into_iter().collect();
    while let Ok(event) = receiver.try_recv() {
        batch.extend(convert_event(key, ty, event, resolved));
    }

    let last = batch.len().saturating_sub(1);
    for (i, event) in batch.iter_mut().enumerate() {
        set_more_coming(event, i < last);
    }
    batch
}

async fn forward_events(
    key: BrowseKey,
    ty: String,
    receiver: flume::Receiver<MdnsEvent>,
    tx: flume::Sender<ServiceEvent>,
    resolved: ResolvedCache,
    cancel: CancellationToken,
) {
    'forward: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = receiver.recv_async() => {
                match event {
                    Ok(event) => {
                        for event in drain_batch(&key, &ty, event, &receiver, &resolved) {
                            if tx.send(event).is_err() {
                                break 'forward;
                            }
                        }
                    }
                    Err(e) => {
                        if !cancel.is_cancelled() {
                            let _ = tx.send(ServiceEvent::OperationFailed {
                                key: key.clone(),
                                cause: format!("mDNS browse channel closed: {}", e),
                            });
                        }
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("Stopped forwarding {}", ty);
}

impl ResolverBackend for MdnsBackend {
    fn browse(&self, key: &BrowseKey) -> Result<EventStream<ServiceEvent>, BackendError> {
        let ty = ty_domain(&key.reg_type, &key.domain);
        let receiver = self.daemon.browse(&ty).map_err(|e| BackendError::BrowseFailed {
            reg_type: key.reg_type.clone(),
            domain: key.domain.clone(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        tokio::spawn(forward_events(
            key.clone(),
            ty.clone(),
            receiver,
            tx,
            self.resolved.clone(),
            cancel.clone(),
        ));

        let daemon = self.daemon.clone();
        let stop = StopHandle::new(move || {
            cancel.cancel();
            if let Err(e) = daemon.stop_browse(&ty) {
                tracing::debug!("stop_browse {} failed: {}", ty, e);
            }
        });
        Ok(EventStream::new(rx, stop))
    }

    fn resolve(&self, instance: ServiceInstance) -> BoxFuture<'static, Result<ServiceInstance, BackendError>> {
        future::ready(self.resolved.resolve(instance)).boxed()
    }

    fn query_addresses(
        &self,
        hostname: &str,
        _if_index: u32,
    ) -> Result<EventStream<Result<AddressRecord, BackendError>>, BackendError> {
        let addresses = self.resolved.addresses(hostname)?;
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(Ok(AddressRecord { addresses, more_coming: false }));
        Ok(EventStream::new(rx, StopHandle::noop()))
    }

    fn register(&self, mut instance: ServiceInstance) -> BoxFuture<'static, Result<ServiceInstance, BackendError>> {
        let result = (|| {
            let host = match &instance.hostname {
                Some(host) => host.clone(),
                None => {
                    let host = hostname::get()
                        .map_err(|e| BackendError::RegisterFailed {
                            name: instance.name.clone(),
                            reason: format!("failed to get system hostname: {}", e),
                        })?
                        .to_string_lossy()
                        .to_string();
                    format!("{}.local.", host)
                }
            };

            let info = ServiceInfo::new(
                &ty_domain(&instance.reg_type, &instance.domain),
                &instance.name,
                &host,
                "",
                instance.port,
                instance.txt.clone(),
            )
            .map_err(|e| BackendError::RegisterFailed {
                name: instance.name.clone(),
                reason: e.to_string(),
            })?
            .enable_addr_auto();

            self.daemon.register(info).map_err(|e| BackendError::RegisterFailed {
                name: instance.name.clone(),
                reason: e.to_string(),
            })?;

            tracing::info!("Registered {} as {} on port {}", instance.reg_type, instance.name, instance.port);
            instance.hostname = Some(host);
            Ok(instance)
        })();
        future::ready(result).boxed()
    }

    fn unregister(&self, instance: &ServiceInstance) -> Result<(), BackendError> {
        let name = fullname(instance);
        self.daemon
            .unregister(&name)
            .map_err(|e| BackendError::RegisterFailed {
                name: name.clone(),
                reason: format!("failed to unregister: {}", e),
            })?;
        tracing::info!("Unregistered {}", name);
        Ok(())
    }
}
