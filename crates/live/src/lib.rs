use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use serde::Serialize;
use shared::domain::UserId;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug)]
struct Entry {
    session: u64,
    handle: mpsc::UnboundedSender<String>,
}

/// Mapping from user id to the active delivery handle.
///
/// Owned once at startup and passed by handle to everything that fans out;
/// at most one connection per user, a later registration supersedes the
/// earlier one.
#[derive(Clone, Default)]
pub struct LiveRegistry {
    connections: Arc<DashMap<UserId, Entry>>,
    next_session: Arc<AtomicU64>,
}

/// Scoped handle for one registered connection. Dropping it removes the
/// registry entry, but only while the entry still belongs to this session,
/// so a superseded connection's late cleanup cannot evict its successor.
#[must_use = "dropping the session unregisters the connection"]
pub struct LiveSession {
    registry: LiveRegistry,
    user_id: UserId,
    session: u64,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the user's delivery handle. The superseded
    /// connection, if any, is left to close through its own lifecycle.
    pub fn register(&self, user_id: UserId, handle: mpsc::UnboundedSender<String>) -> LiveSession {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(user_id, Entry { session, handle });
        LiveSession {
            registry: self.clone(),
            user_id,
            session,
        }
    }

    pub fn unregister(&self, user_id: UserId) {
        self.connections.remove(&user_id);
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Serializes the payload once and sends it to every recipient with a
    /// live handle. Absent or closed handles are skipped silently; there is
    /// no queueing or retry. Returns how many sends went through.
    pub fn fanout<T: Serialize>(&self, recipients: &[UserId], payload: &T) -> usize {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "live payload failed to serialize, dropping fanout");
                return 0;
            }
        };

        let mut delivered = 0;
        for user_id in recipients {
            let Some(entry) = self.connections.get(user_id) else {
                continue;
            };
            if entry.handle.send(text.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.registry
            .connections
            .remove_if(&self.user_id, |_, entry| entry.session == self.session);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
