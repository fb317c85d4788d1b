use crate::{connection::ConnectionRef, stack::Stack};

/// Consumer-side notifications for one connection. All callbacks run
/// synchronously from within a stack callback and may call back into the
/// connection (send, disconnect, observer add/remove). Observers are
/// identity-compared, so registering the same `Arc` twice counts once.
pub trait ConnectionObserver<S: Stack>: Send + Sync {
    /// Bytes arrived. `data` is only valid for the duration of the call;
    /// copy it out to keep it.
    fn on_data(&self, conn: &ConnectionRef<S>, data: &[u8]) {
        let _ = (conn, data);
    }

    /// The in-flight send completed and nothing remains queued.
    fn on_send_complete(&self, conn: &ConnectionRef<S>) {
        let _ = conn;
    }

    /// The stack closed the connection; delivered exactly once per observer
    /// registered at that moment. The connection no longer reaches the
    /// network once this returns.
    fn on_disconnected(&self, conn: &ConnectionRef<S>) {
        let _ = conn;
    }
}
