//! Stream transport abstraction for the tunnel engine
//!
//! This crate defines the boundary between the protocol core and whatever
//! carries its bytes: a connector that establishes a bidirectional stream,
//! split reader/writer halves with minimum/maximum read semantics, a shared
//! cancellation handle, and a notification channel reporting the connection's
//! state transitions. The core never constructs the physical connection
//! itself; it only consumes this interface.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod tcp;

#[cfg(test)]
pub mod tests;

pub use tcp::TcpConnector;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Connection state notifications emitted by a stream implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected,
    Cancelled,
    Failed(String),
}

/// Sending side of the notification channel, handed to implementations.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<TransportEvent>);

impl EventSender {
    pub fn emit(&self, event: TransportEvent) {
        // A dropped receiver means nobody is watching this connection anymore
        let _ = self.0.send(event);
    }
}

/// Receiving side of the notification channel, kept by the caller.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the notification channel for one connection attempt.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}

/// Cancellation handle shared by both stream halves.
///
/// Cloneable. The first `cancel()` wins and emits the `Cancelled`
/// notification; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
    events: EventSender,
}

impl CancelHandle {
    pub fn new(events: EventSender) -> Self {
        Self {
            token: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn cancel(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.token.cancel();
            self.events.emit(TransportEvent::Cancelled);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token for implementations to select against in blocking reads/writes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Receiving half of a tunnel stream
#[async_trait]
pub trait StreamReader: Send + Sync + Debug {
    /// Read at least `min_len` and at most `max_len` bytes.
    ///
    /// `min_len` must be at least 1 and no greater than `max_len`.
    /// Implementations must buffer internally so a dropped read future
    /// loses no data. EOF before `min_len` bytes are available is
    /// `TransportError::ConnectionClosed`; an in-flight cancel resolves
    /// the read with `TransportError::Cancelled`.
    async fn read(&mut self, min_len: usize, max_len: usize) -> TransportResult<Bytes>;
}

/// Sending half of a tunnel stream
#[async_trait]
pub trait StreamWriter: Send + Sync + Debug {
    /// Write the whole buffer to the stream.
    async fn write(&mut self, data: Bytes) -> TransportResult<()>;
}

/// A connected stream: split halves plus the shared cancellation handle.
#[derive(Debug)]
pub struct StreamHandle {
    pub reader: Box<dyn StreamReader>,
    pub writer: Box<dyn StreamWriter>,
    pub cancel: CancelHandle,
}

/// Establishes the physical connection for a tunnel
#[async_trait]
pub trait StreamConnector: Send + Sync + Debug {
    /// Connect to `address`, emitting state notifications on `events` for
    /// the attempt and for the lifetime of the returned stream.
    ///
    /// A failed attempt emits `Failed` in addition to returning the error,
    /// so observers that only watch the channel still see the outcome.
    async fn connect(&self, address: &str, events: EventSender)
        -> TransportResult<StreamHandle>;
}
