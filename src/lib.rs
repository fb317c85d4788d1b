//! Reference-counted wrapper around a single tcp connection delivered by an
//! event-driven network stack: observer fan-out, a transparent send backlog
//! and a two-phase (graceful/forced) disconnect.

mod connection;
mod observer;
mod registry;

pub mod stack;

use thiserror::Error;

pub use {
    self::{
        connection::{Connection, ConnectionRef},
        observer::ConnectionObserver,
        registry::{ConnectionOwner, Registry},
        stack::{Stack, StackError},
    },
    bytes::Bytes,
};

/// Why a send was not accepted.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is already fully closed at the stack level.
    #[error("connection closed")]
    Closed,
    /// A graceful disconnect was requested; no new sends are taken.
    #[error("disconnect already requested")]
    Disconnecting,
    /// The stack refused to take the buffer.
    #[error("stack refused the send")]
    Refused(#[source] StackError),
}
