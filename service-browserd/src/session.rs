use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use shared::types::{BrowseKey, ServiceEvent};
use crate::backend::{EventStream, ResolverBackend, StopHandle};
use crate::error::BackendError;

/// Result of opening a browse session
pub enum Opened {
    /// A new backend browse was started; the caller must consume `events`
    Started {
        id: u64,
        events: flume::Receiver<ServiceEvent>,
        cancel: CancellationToken,
    },
    /// The key was already being browsed; one more reference was taken
    Shared { id: u64 },
}

impl Opened {
    pub fn id(&self) -> u64 {
        match self {
            Opened::Started { id, .. } | Opened::Shared { id } => *id,
        }
    }
}

struct Session {
    id: u64,
    refs: usize,
    stop: StopHandle,
    cancel: CancellationToken,
}

impl Session {
    fn close(mut self) {
        self.cancel.cancel();
        self.stop.stop();
    }
}

/// Outstanding browse operations, one per (reg type, domain).
///
/// Holders identify their reference by session id, so a stale holder can never
/// release a session that was reopened after a failure.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<BrowseKey, Session>,
    next_id: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, key: &BrowseKey, backend: &dyn ResolverBackend) -> Result<Opened, BackendError> {
        if let Some(session) = self.sessions.get_mut(key) {
            session.refs += 1;
            tracing::debug!("Sharing browse session for {} (refs={})", key, session.refs);
            return Ok(Opened::Shared { id: session.id });
        }

        let EventStream { events, stop } = backend.browse(key)?;
        self.next_id += 1;
        let id = self.next_id;
        let cancel = CancellationToken::new();
        self.sessions.insert(key.clone(), Session {
            id,
            refs: 1,
            stop,
            cancel: cancel.clone(),
        });
        tracing::info!("Started browse session {} for {}", id, key);

        Ok(Opened::Started { id, events, cancel })
    }

    /// Drop one reference. Returns true when this stopped the backend browse.
    pub fn release(&mut self, key: &BrowseKey, id: u64) -> bool {
        let Some(session) = self.sessions.get_mut(key) else {
            return false;
        };
        if session.id != id {
            return false;
        }

        session.refs -= 1;
        if session.refs > 0 {
            return false;
        }

        if let Some(session) = self.sessions.remove(key) {
            session.close();
        }
        tracing::info!("Stopped browse session {} for {}", id, key);
        true
    }

    /// Remove a failed session regardless of its reference count
    pub fn fail(&mut self, key: &BrowseKey, id: u64) -> bool {
        if !self.is_live(key, id) {
            return false;
        }
        if let Some(session) = self.sessions.remove(key) {
            session.close();
        }
        true
    }

    pub fn is_live(&self, key: &BrowseKey, id: u64) -> bool {
        self.sessions.get(key).is_some_and(|session| session.id == id)
    }

    pub fn refs(&self, key: &BrowseKey) -> usize {
        self.sessions.get(key).map_or(0, |session| session.refs)
    }

    pub fn keys(&self) -> Vec<BrowseKey> {
        let mut keys: Vec<BrowseKey> = self.sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn close_all(&mut self) {
        for (key, session) in self.sessions.drain() {
            tracing::debug!("Closing browse session {} for {}", session.id, key);
            session.close();
        }
    }
}
