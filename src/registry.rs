use crate::{
    connection::{Connection, ConnectionRef},
    stack::Stack,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// The party that creates connections and can re-establish stack-side
/// bookkeeping when a callback reports a handle that disagrees with a
/// connection's recorded one.
pub trait ConnectionOwner: Send + Sync {
    /// Re-establish the bindings for every live connection.
    fn repair_bindings(&self);
}

/// Raw-handle to connection dispatch table. Stack callbacks enter here keyed
/// by the stack's opaque handle; a callback for an untracked handle carries
/// no state to update and is dropped.
pub struct Registry<S: Stack> {
    connections: Mutex<HashMap<S::Raw, Arc<Connection<S>>>>,
}

impl<S: Stack> Registry<S> {
    pub fn new() -> Self {
        Self { connections: Mutex::new(HashMap::new()) }
    }

    /// Bind `conn` under `raw`, replacing whatever was there. Drivers use
    /// this when the stack reassigns the handle behind a live connection.
    pub fn bind(&self, raw: S::Raw, conn: &ConnectionRef<S>) {
        self.bind_arc(raw, Arc::clone(conn.as_arc()));
    }

    pub(crate) fn bind_arc(&self, raw: S::Raw, conn: Arc<Connection<S>>) {
        if let Some(old) = self.connections.lock().unwrap().insert(raw, conn) {
            warn!(id = %old.id(), ?raw, "handle rebound while a connection was still tracked");
        }
    }

    fn get(&self, raw: &S::Raw) -> Option<Arc<Connection<S>>> {
        self.connections.lock().unwrap().get(raw).cloned()
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected(&self, raw: S::Raw) {
        if let Some(conn) = self.get(&raw) {
            conn.stack_connected(raw);
        }
    }

    pub fn failed(&self, raw: S::Raw) {
        if let Some(conn) = self.get(&raw) {
            conn.stack_failed(raw);
        }
    }

    pub fn received(&self, raw: S::Raw, data: &[u8]) {
        if let Some(conn) = self.get(&raw) {
            conn.stack_received(data);
        }
    }

    pub fn sent(&self, raw: S::Raw) {
        if let Some(conn) = self.get(&raw) {
            conn.stack_sent();
        }
    }

    pub fn disconnected(&self, raw: S::Raw) {
        // The handle's validity window ends here: unbind before fanning out.
        let conn = self.connections.lock().unwrap().remove(&raw);
        if let Some(conn) = conn {
            conn.stack_disconnected(raw);
        }
    }

    /// Re-key every entry under its connection's recorded handle and drop
    /// entries whose connection is already fully closed. Owners call this
    /// from [`ConnectionOwner::repair_bindings`].
    pub fn rebind_all(&self) {
        let mut connections = self.connections.lock().unwrap();
        let entries: Vec<_> = connections.drain().collect();
        for (bound, conn) in entries {
            match conn.raw() {
                Some(recorded) => {
                    if recorded != bound {
                        debug!(id = %conn.id(), "re-keyed drifted binding");
                    }
                    connections.insert(recorded, conn);
                }
                None => debug!(id = %conn.id(), "dropped binding for closed connection"),
            }
        }
    }
}

impl<S: Stack> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Stack> fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("connections", &self.len()).finish()
    }
}
