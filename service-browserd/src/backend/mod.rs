//! The resolver capability the engine consumes.
//!
//! The wire protocol lives behind [`ResolverBackend`]; the engine only sees
//! event streams and one-shot futures. Every long-lived operation hands back
//! an [`EventStream`] whose [`StopHandle`] cancels it synchronously.

pub mod mdns;

#[cfg(test)]
pub(crate) mod fake;

use std::net::IpAddr;
use futures::future::BoxFuture;
use shared::types::{BrowseKey, ServiceEvent, ServiceInstance};
use crate::error::BackendError;

pub use self::mdns::MdnsBackend;

/// Cancels a backend operation. Runs at most once: on `stop()` or on drop.
pub struct StopHandle(Option<Box<dyn FnOnce() + Send>>);

impl StopHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(stop)))
    }

    /// For operations that end on their own
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.0.take() {
            stop();
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Events from a long-lived backend operation
pub struct EventStream<T> {
    pub events: flume::Receiver<T>,
    pub stop: StopHandle,
}

impl<T> EventStream<T> {
    pub fn new(events: flume::Receiver<T>, stop: StopHandle) -> Self {
        Self { events, stop }
    }
}

/// One batch of address records for a hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub addresses: Vec<IpAddr>,
    pub more_coming: bool,
}

pub trait ResolverBackend: Send + Sync + 'static {
    /// Start browsing. Found/Lost events arrive until the stream is stopped;
    /// a failure arrives as `ServiceEvent::OperationFailed`.
    fn browse(&self, key: &BrowseKey) -> Result<EventStream<ServiceEvent>, BackendError>;

    /// Fill in hostname, port and TXT records for an instance
    fn resolve(&self, instance: ServiceInstance) -> BoxFuture<'static, Result<ServiceInstance, BackendError>>;

    /// Look up the addresses of a resolved hostname
    fn query_addresses(
        &self,
        hostname: &str,
        if_index: u32,
    ) -> Result<EventStream<Result<AddressRecord, BackendError>>, BackendError>;

    /// Advertise a service; completes with the advertised instance
    fn register(&self, instance: ServiceInstance) -> BoxFuture<'static, Result<ServiceInstance, BackendError>>;

    fn unregister(&self, instance: &ServiceInstance) -> Result<(), BackendError>;
}
