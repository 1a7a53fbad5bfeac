//! Subscription hub: observers per browse key, and the engine state they
//! share.
//!
//! All engine state sits behind one mutex, which is the only serialization
//! point. Backend events are applied by one pump task per browse session, in
//! arrival order. Observers are unbounded channels written under the same
//! lock, so every observer sees snapshots in mutation order and a delivery
//! can never block or re-enter the engine.
//!
//! A browse session exists for a key exactly while that key has observers,
//! or while the type enumeration that discovered the type is observed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use shared::regtype::ServiceType;
use shared::types::{BrowseKey, InstanceKey, ServiceEvent, ServiceInstance};
use crate::backend::ResolverBackend;
use crate::error::{BackendError, EngineError};
use crate::pipeline::{InFlight, ResolvePipeline};
use crate::session::{Opened, SessionTable};
use crate::store::{Applied, Store};

/// What an observer receives
#[derive(Debug, Clone)]
pub enum Update {
    /// Full current state for the key, sorted by name
    Snapshot(Arc<Vec<ServiceInstance>>),
    /// The key's browse, or one of its resolutions, failed
    Failed(EngineError),
}

struct Observer {
    id: u64,
    tx: mpsc::UnboundedSender<Update>,
}

#[derive(Default)]
struct Interest {
    observers: Vec<Observer>,
    /// Session reference held on behalf of these observers
    session: Option<u64>,
}

#[derive(Default)]
struct State {
    store: Store,
    sessions: SessionTable,
    interests: HashMap<BrowseKey, Interest>,
    /// Nested type browses held by each observed type enumeration
    nested: HashMap<BrowseKey, Vec<(BrowseKey, u64)>>,
    resolves: InFlight,
    next_observer: u64,
}

struct Shared {
    backend: Arc<dyn ResolverBackend>,
    pipeline: ResolvePipeline,
    state: Mutex<State>,
}

/// The discovery engine. Cheap to clone; construct once and pass it around.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    pub fn new(backend: Arc<dyn ResolverBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipeline: ResolvePipeline::new(backend.clone()),
                backend,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Observe a browse key. Use [`BrowseKey::type_enumeration`] for the
    /// service-type view. The first update is always the current snapshot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, key: BrowseKey) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();

        state.next_observer += 1;
        let id = state.next_observer;
        let interest = state.interests.entry(key.clone()).or_default();
        interest.observers.push(Observer { id, tx: tx.clone() });
        let needs_session = interest.session.is_none();

        let opened = if needs_session {
            Some(open_session(&self.shared, &mut state, &key))
        } else {
            None
        };

        let snapshot = state.store.snapshot(&key);
        let _ = tx.send(Update::Snapshot(Arc::new(snapshot)));

        match opened {
            Some(Ok(session)) => {
                if let Some(interest) = state.interests.get_mut(&key) {
                    interest.session = Some(session);
                }
                if !key.is_type_enumeration() {
                    for instance in state.store.unresolved(&key) {
                        spawn_resolve(&self.shared, &mut state, &key, instance);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!("Failed to browse {}: {}", key, e);
                let _ = tx.send(Update::Failed(e.into()));
            }
            None => {}
        }

        tracing::debug!("Observer {} subscribed to {}", id, key);
        Subscription {
            key,
            id,
            hub: Arc::downgrade(&self.shared),
            updates: rx,
            active: true,
        }
    }

    /// Re-run the resolve pipeline for one instance, cancelling any run
    /// already in flight. Returns false if the instance is not known.
    pub fn refresh(&self, instance: &InstanceKey) -> bool {
        let mut state = self.shared.state.lock();
        let Some((key, known)) = state.store.locate(instance) else {
            return false;
        };
        spawn_resolve(&self.shared, &mut state, &key, known);
        true
    }

    /// Keys with a live backend browse
    pub fn open_sessions(&self) -> Vec<BrowseKey> {
        self.shared.state.lock().sessions.keys()
    }

    pub fn observer_count(&self, key: &BrowseKey) -> usize {
        self.shared
            .state
            .lock()
            .interests
            .get(key)
            .map_or(0, |interest| interest.observers.len())
    }

    /// Stop every session and drop all observers' interest
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.interests.clear();
        state.nested.clear();
        state.resolves.cancel_all();
        state.sessions.close_all();
        state.store = Store::new();
        tracing::info!("Discovery engine shut down");
    }
}

/// An observer's handle. Dropping it unsubscribes.
pub struct Subscription {
    key: BrowseKey,
    id: u64,
    hub: Weak<Shared>,
    updates: mpsc::UnboundedReceiver<Update>,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &BrowseKey {
        &self.key
    }

    /// Next update; None once the engine is gone
    pub async fn recv(&mut self) -> Option<Update> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Update> {
        self.updates.try_recv().ok()
    }

    /// Immediate and idempotent. When this was the key's last observer the
    /// browse is stopped before this returns.
    pub fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(shared) = self.hub.upgrade() {
            unsubscribe(&shared, &self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn unsubscribe(shared: &Arc<Shared>, key: &BrowseKey, id: u64) {
    let mut state = shared.state.lock();
    let Some(interest) = state.interests.get_mut(key) else {
        return;
    };
    interest.observers.retain(|observer| observer.id != id);
    tracing::debug!("Observer {} unsubscribed from {}", id, key);
    if !interest.observers.is_empty() {
        return;
    }

    let Some(interest) = state.interests.remove(key) else {
        return;
    };
    if let Some(session) = interest.session {
        close_session(&mut state, key, session);
    }

    if key.is_type_enumeration() {
        for (nested, session) in state.nested.remove(key).unwrap_or_default() {
            close_session(&mut state, &nested, session);
        }
    } else {
        // Session may live on for a type count; nobody needs resolutions
        for instance in state.store.snapshot(key) {
            state.resolves.cancel(&instance.key());
        }
    }
}

/// Open (or share) the session for `key` and start its pump if new
fn open_session(shared: &Arc<Shared>, state: &mut State, key: &BrowseKey) -> Result<u64, BackendError> {
    let opened = state.sessions.open(key, shared.backend.as_ref())?;
    let id = opened.id();
    if let Opened::Started { id, events, cancel } = opened {
        state.store.track(key);
        tokio::spawn(pump(Arc::downgrade(shared), key.clone(), id, events, cancel));
    }
    Ok(id)
}

fn close_session(state: &mut State, key: &BrowseKey, session: u64) {
    if state.sessions.release(key, session) {
        for instance in state.store.forget(key) {
            state.resolves.cancel(&instance);
        }
    }
}

async fn pump(
    hub: Weak<Shared>,
    key: BrowseKey,
    session: u64,
    events: flume::Receiver<ServiceEvent>,
    cancel: CancellationToken,
) {
    let mut dirty: BTreeSet<BrowseKey> = BTreeSet::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv_async() => event,
        };
        let Some(shared) = hub.upgrade() else {
            break;
        };
        let mut state = shared.state.lock();
        if !state.sessions.is_live(&key, session) {
            break;
        }

        let event = match event {
            Ok(ServiceEvent::OperationFailed { cause, .. }) => {
                flush(&mut state, &mut dirty);
                fail_session(&mut state, &key, session, cause);
                break;
            }
            Ok(event) => event,
            Err(_) => {
                flush(&mut state, &mut dirty);
                fail_session(&mut state, &key, session, "browse ended unexpectedly".to_string());
                break;
            }
        };

        let more_coming = event.more_coming();
        let applied = state.store.apply_event(&key, &event);
        follow_up(&shared, &mut state, &key, applied, &mut dirty);
        if !more_coming {
            flush(&mut state, &mut dirty);
        }
    }
    tracing::debug!("Pump for {} (session {}) exited", key, session);
}

fn follow_up(
    shared: &Arc<Shared>,
    state: &mut State,
    key: &BrowseKey,
    applied: Applied,
    dirty: &mut BTreeSet<BrowseKey>,
) {
    dirty.extend(applied.changed);

    if let Some(nested) = applied.browse {
        match open_session(shared, state, &nested) {
            Ok(session) => state.nested.entry(key.clone()).or_default().push((nested, session)),
            Err(e) => {
                tracing::error!("Failed to browse {}: {}", nested, e);
                notify(state, &nested, Update::Failed(e.into()));
            }
        }
    }

    if let Some(instance) = applied.cancel_resolve {
        state.resolves.cancel(&instance);
    }

    if let Some(instance) = applied.resolve {
        if has_observers(state, key) {
            spawn_resolve(shared, state, key, instance);
        }
    }
}

/// Terminal failure of one session: every holder loses it, observers hear
/// about it, and nothing is retried.
fn fail_session(state: &mut State, key: &BrowseKey, session: u64, cause: String) {
    if !state.sessions.fail(key, session) {
        return;
    }
    tracing::error!("Browse for {} failed: {}", key, cause);

    for instance in state.store.forget(key) {
        state.resolves.cancel(&instance);
    }
    if let Some(interest) = state.interests.get_mut(key) {
        if interest.session == Some(session) {
            interest.session = None;
        }
    }

    if key.is_type_enumeration() {
        for (nested, nested_session) in state.nested.remove(key).unwrap_or_default() {
            close_session(state, &nested, nested_session);
        }
    } else {
        for held in state.nested.values_mut() {
            held.retain(|(nested, id)| !(nested == key && *id == session));
        }
        // The type count for this key just dropped to zero
        let mut dirty = BTreeSet::new();
        if let Ok(service_type) = ServiceType::parse(&key.reg_type, &key.domain) {
            dirty.insert(BrowseKey::type_enumeration(&service_type.domain));
        }
        flush(state, &mut dirty);
    }

    let error = EngineError::Backend(BackendError::BrowseFailed {
        reg_type: key.reg_type.clone(),
        domain: key.domain.clone(),
        reason: cause,
    });
    notify(state, key, Update::Failed(error));
}

fn spawn_resolve(shared: &Arc<Shared>, state: &mut State, key: &BrowseKey, instance: ServiceInstance) {
    let pipeline = shared.pipeline.clone();
    let weak = Arc::downgrade(shared);
    let instance_key = instance.key();
    let browse_key = key.clone();

    state.resolves.begin(instance_key.clone(), move |generation| {
        tokio::spawn(async move {
            let result = pipeline.resolve(instance).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut state = shared.state.lock();
            if !state.resolves.finish(&instance_key, generation) {
                return;
            }
            match result {
                Ok(resolved) => {
                    tracing::debug!("Resolved {}", instance_key);
                    if state.store.apply_resolved(&browse_key, resolved) {
                        let mut dirty = BTreeSet::from([browse_key]);
                        flush(&mut state, &mut dirty);
                    }
                }
                Err(e) => {
                    tracing::warn!("Resolve of {} failed: {}", instance_key, e);
                    notify(&state, &browse_key, Update::Failed(e.into()));
                }
            }
        })
        .abort_handle()
    });
}

fn has_observers(state: &State, key: &BrowseKey) -> bool {
    state
        .interests
        .get(key)
        .is_some_and(|interest| !interest.observers.is_empty())
}

fn notify(state: &State, key: &BrowseKey, update: Update) {
    if let Some(interest) = state.interests.get(key) {
        for observer in &interest.observers {
            let _ = observer.tx.send(update.clone());
        }
    }
}

/// Push a fresh snapshot to every observer of each dirty key
fn flush(state: &mut State, dirty: &mut BTreeSet<BrowseKey>) {
    for key in std::mem::take(dirty) {
        if !has_observers(state, &key) {
            continue;
        }
        let snapshot = Arc::new(state.store.snapshot(&key));
        notify(state, &key, Update::Snapshot(snapshot));
    }
}
