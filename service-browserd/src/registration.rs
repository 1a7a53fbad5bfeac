use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::Mutex;
use shared::regtype::ServiceType;
use shared::types::{InstanceKey, ServiceInstance};
use crate::backend::ResolverBackend;
use crate::error::Result;

/// Services this host advertises, keyed by their advertised identity
pub struct RegistrationManager {
    backend: Arc<dyn ResolverBackend>,
    registrations: Mutex<BTreeMap<InstanceKey, ServiceInstance>>,
}

impl RegistrationManager {
    pub fn new(backend: Arc<dyn ResolverBackend>) -> Self {
        Self {
            backend,
            registrations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Advertise a service. The returned instance carries the name the
    /// network actually accepted, which may differ after conflict resolution.
    pub async fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        ServiceType::from_leaf(&instance.reg_type, &instance.domain)?;

        let advertised = self.backend.register(instance).await?;
        tracing::info!("Advertising {}", advertised.key());
        self.registrations
            .lock()
            .insert(advertised.key(), advertised.clone());
        Ok(advertised)
    }

    /// Returns false if `key` was not registered
    pub fn unregister(&self, key: &InstanceKey) -> Result<bool> {
        let Some(instance) = self.registrations.lock().remove(key) else {
            return Ok(false);
        };

        if let Err(e) = self.backend.unregister(&instance) {
            self.registrations.lock().insert(key.clone(), instance);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Current registrations, sorted by name
    pub fn registered(&self) -> Vec<ServiceInstance> {
        self.registrations.lock().values().cloned().collect()
    }

    pub fn unregister_all(&self) {
        let drained = std::mem::take(&mut *self.registrations.lock());
        for (key, instance) in drained {
            if let Err(e) = self.backend.unregister(&instance) {
                tracing::warn!("Failed to unregister {}: {}", key, e);
            }
        }
    }
}
