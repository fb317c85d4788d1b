mod memory;
mod tcp;

use std::{fmt::Debug, hash::Hash, time::Duration};
use thiserror::Error;

pub use self::{
    memory::{MemoryStack, SlotId},
    tcp::{SocketId, TcpConfig, TcpServer, TcpStack},
};

#[derive(Debug, Error)]
pub enum StackError {
    /// The stack no longer tracks the handle.
    #[error("disconnected")]
    Disconnected,
    /// Backend-specific failure.
    #[error("stack")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// The event-driven network stack as consumed by a connection: an opaque
/// handle plus the raw send/disconnect/timeout primitives. Completion of a
/// send and closure of the connection are reported back asynchronously
/// through the registry's callback entry points.
pub trait Stack: Send + Sync + 'static {
    type Raw: Debug + Copy + PartialEq + Eq + Hash + Send + Sync + 'static;

    /// Hand one buffer to the stack. `Ok` means the stack took it and will
    /// acknowledge through the sent callback; it does not mean delivery.
    fn send(&self, raw: Self::Raw, data: &[u8]) -> Result<(), StackError>;

    /// Ask the stack to close the connection behind `raw`.
    fn disconnect(&self, raw: Self::Raw);

    /// Idle-disconnect timer, scoped to this connection only.
    fn set_timeout(&self, raw: Self::Raw, timeout: Duration);
}
