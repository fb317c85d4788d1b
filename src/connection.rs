use crate::{
    observer::ConnectionObserver,
    registry::{ConnectionOwner, Registry},
    stack::Stack,
    SendError,
};
use bytes::Bytes;
use std::{
    collections::VecDeque,
    fmt,
    ops::Deref,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Wrapper around one stack-owned connection. The stack's raw handle is held
/// as a back-reference that is invalidated exactly once, by the disconnect
/// callback; every operation checks it first.
pub struct Connection<S: Stack> {
    id: Uuid,
    stack: Arc<S>,
    owner: Option<Weak<dyn ConnectionOwner>>,
    inner: Mutex<Inner<S>>,
}

struct Inner<S: Stack> {
    raw: Option<S::Raw>,
    refs: usize,
    observers: Vec<Arc<dyn ConnectionObserver<S>>>,
    sending: bool,
    disconnecting: bool,
    backlog: VecDeque<Bytes>,
}

impl<S: Stack> Connection<S> {
    /// Wrap a freshly accepted stack handle and bind it in `registry` so
    /// stack callbacks reach it. The returned guard is the birth reference;
    /// dropping the last guard while the handle is still live converts into
    /// a stack-level disconnect request instead of a teardown.
    pub fn open(
        stack: Arc<S>,
        raw: S::Raw,
        owner: Option<Weak<dyn ConnectionOwner>>,
        registry: &Registry<S>,
    ) -> ConnectionRef<S> {
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            stack,
            owner,
            inner: Mutex::new(Inner {
                raw: Some(raw),
                refs: 1,
                observers: Vec::new(),
                sending: false,
                disconnecting: false,
                backlog: VecDeque::new(),
            }),
        });
        registry.bind_arc(raw, Arc::clone(&conn));
        trace!(id = %conn.id, ?raw, "connection opened");
        ConnectionRef { conn }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The recorded raw handle; `None` once the stack reported disconnection.
    pub fn raw(&self) -> Option<S::Raw> {
        self.inner.lock().unwrap().raw
    }

    pub fn is_open(&self) -> bool {
        self.raw().is_some()
    }

    /// Current protocol reference count: guards plus registered observers.
    pub fn ref_count(&self) -> usize {
        self.inner.lock().unwrap().refs
    }

    /// Register `observer` for data/sent/disconnect notifications. A second
    /// registration of the same observer is a no-op.
    pub fn add_observer(&self, observer: &Arc<dyn ConnectionObserver<S>>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.observers.iter().any(|o| Arc::ptr_eq(o, observer)) {
            return;
        }
        inner.observers.push(Arc::clone(observer));
        inner.refs += 1;
        trace!(id = %self.id, refs = inner.refs, "observer added");
    }

    /// Unregister `observer`, releasing the reference its registration held.
    /// Removing an observer that is not registered is a no-op.
    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver<S>>) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.observers.len();
            inner.observers.retain(|o| !Arc::ptr_eq(o, observer));
            inner.observers.len() != before
        };
        if removed {
            self.release();
        }
    }

    /// Hand `data` to the stack, or queue it if a send is still in flight.
    /// `Ok` means the bytes were either issued or copied into the backlog;
    /// queued entries go out strictly in submission order.
    pub fn send(&self, data: &[u8]) -> Result<(), SendError> {
        let raw = {
            let mut inner = self.inner.lock().unwrap();
            let Some(raw) = inner.raw else {
                return Err(SendError::Closed);
            };
            if inner.disconnecting {
                return Err(SendError::Disconnecting);
            }
            if inner.sending {
                inner.backlog.push_back(Bytes::copy_from_slice(data));
                trace!(id = %self.id, len = data.len(), queued = inner.backlog.len(), "send queued");
                return Ok(());
            }
            inner.sending = true;
            raw
        };
        match self.stack.send(raw, data) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.lock().unwrap().sending = false;
                Err(SendError::Refused(err))
            }
        }
    }

    /// Idle-disconnect timer for this connection only. No-op once closed.
    pub fn set_timeout(&self, timeout: Duration) {
        let raw = self.inner.lock().unwrap().raw;
        if let Some(raw) = raw {
            self.stack.set_timeout(raw, timeout);
        }
    }

    /// Request disconnection. Forced: drop the whole backlog and close
    /// immediately; safe to call repeatedly. Graceful: stop taking new sends
    /// and close once the in-flight send and the backlog have drained.
    pub fn disconnect(&self, force: bool) {
        let raw = {
            let mut inner = self.inner.lock().unwrap();
            let Some(raw) = inner.raw else { return };
            if force {
                inner.backlog.clear();
                inner.disconnecting = true;
                Some(raw)
            } else if !inner.disconnecting {
                inner.disconnecting = true;
                (!inner.sending).then_some(raw)
            } else {
                None
            }
        };
        if let Some(raw) = raw {
            debug!(id = %self.id, force, "requesting stack disconnect");
            self.stack.disconnect(raw);
        }
    }

    fn add_ref(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.refs += 1;
        trace!(id = %self.id, refs = inner.refs, "retain");
    }

    fn release(&self) {
        let live = {
            let mut inner = self.inner.lock().unwrap();
            inner.refs -= 1;
            trace!(id = %self.id, refs = inner.refs, "release");
            if inner.refs > 0 {
                return;
            }
            match inner.raw {
                Some(raw) => Some(raw),
                None => {
                    inner.backlog.clear();
                    None
                }
            }
        };
        match live {
            // The stack still owns a live handle: ask it to close and let
            // the eventual disconnect callback finish the teardown.
            Some(raw) => {
                debug!(id = %self.id, "last reference released while open, requesting disconnect");
                self.stack.disconnect(raw);
            }
            None => trace!(id = %self.id, "torn down"),
        }
    }

    fn retain(conn: &Arc<Self>) -> ConnectionRef<S> {
        conn.add_ref();
        ConnectionRef { conn: Arc::clone(conn) }
    }

    fn check_binding(&self, reported: S::Raw) {
        let mismatch = {
            let inner = self.inner.lock().unwrap();
            matches!(inner.raw, Some(recorded) if recorded != reported)
        };
        if mismatch {
            warn!(id = %self.id, ?reported, "stack reported a foreign handle, asking owner to repair");
            if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
                owner.repair_bindings();
            }
        }
    }

    pub(crate) fn stack_connected(&self, raw: S::Raw) {
        trace!(id = %self.id, ?raw, "stack reports connected");
        self.check_binding(raw);
    }

    pub(crate) fn stack_failed(&self, raw: S::Raw) {
        debug!(id = %self.id, ?raw, "stack reports connection failure");
        self.check_binding(raw);
    }

    pub(crate) fn stack_received(self: Arc<Self>, data: &[u8]) {
        let snapshot = self.inner.lock().unwrap().observers.clone();
        if snapshot.is_empty() {
            return;
        }
        let guard = Self::retain(&self);
        for observer in &snapshot {
            observer.on_data(&guard, data);
        }
    }

    pub(crate) fn stack_sent(self: Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(raw) = inner.raw else { return };

        if let Some(next) = inner.backlog.pop_front() {
            // `sending` stays set: the drained entry is the new in-flight send
            drop(inner);
            if let Err(err) = self.stack.send(raw, &next) {
                warn!(id = %self.id, %err, "stack refused a backlog send");
            }
            return;
        }

        inner.sending = false;
        if inner.disconnecting {
            drop(inner);
            debug!(id = %self.id, "backlog drained, completing deferred disconnect");
            self.stack.disconnect(raw);
            return;
        }

        let snapshot = inner.observers.clone();
        drop(inner);
        if snapshot.is_empty() {
            return;
        }
        let guard = Self::retain(&self);
        for observer in &snapshot {
            observer.on_send_complete(&guard);
        }
    }

    pub(crate) fn stack_disconnected(self: Arc<Self>, raw: S::Raw) {
        self.check_binding(raw);
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            inner.raw = None;
            // One extra reference held for the duration of the fan-out; the
            // per-observer releases below must not hit zero mid-loop.
            inner.refs += 1;
            std::mem::take(&mut inner.observers)
        };
        debug!(id = %self.id, observers = snapshot.len(), "disconnected");
        let guard = ConnectionRef { conn: Arc::clone(&self) };
        for observer in snapshot {
            observer.on_disconnected(&guard);
            self.release();
        }
    }
}

impl<S: Stack> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl<S: Stack> Drop for Connection<S> {
    fn drop(&mut self) {
        trace!(id = %self.id, "connection dropped");
    }
}

/// Counted reference to a [`Connection`]. Cloning retains, dropping releases;
/// when the last reference goes while the stack handle is still live, the
/// drop requests a stack-level disconnect and teardown waits for the
/// disconnect callback.
pub struct ConnectionRef<S: Stack> {
    conn: Arc<Connection<S>>,
}

impl<S: Stack> ConnectionRef<S> {
    /// Liveness probe for tests and bookkeeping; an upgraded `Arc` does not
    /// participate in the reference protocol.
    pub fn downgrade(&self) -> Weak<Connection<S>> {
        Arc::downgrade(&self.conn)
    }

    pub(crate) fn as_arc(&self) -> &Arc<Connection<S>> {
        &self.conn
    }
}

impl<S: Stack> Deref for ConnectionRef<S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<S: Stack> Clone for ConnectionRef<S> {
    fn clone(&self) -> Self {
        self.conn.add_ref();
        Self { conn: Arc::clone(&self.conn) }
    }
}

impl<S: Stack> Drop for ConnectionRef<S> {
    fn drop(&mut self) {
        self.conn.release();
    }
}

impl<S: Stack> fmt::Debug for ConnectionRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.conn, f)
    }
}
