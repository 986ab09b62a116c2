//! Tunnel engine errors.

use culvert_proto::{FrameError, MessageError};
use culvert_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the tunnel engine.
///
/// Start completions, send calls, and the diagnostic log all report failures
/// through this type. Frame and transport errors are fatal to the session;
/// a malformed message payload is not.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The tunnel configuration is missing or unusable.
    #[error("Bad configuration: {0}")]
    BadConfiguration(String),

    /// An operation needed an active stream and none was present.
    #[error("No active tunnel connection")]
    BadConnection,

    /// A send was attempted outside the Connected state.
    #[error("Tunnel is not connected")]
    NotConnected,

    /// The attempt was cancelled, locally or by the transport.
    #[error("Tunnel cancelled")]
    Cancelled,

    /// The transport dropped underneath an established session.
    #[error("Tunnel disconnected: {0}")]
    Disconnected(String),

    /// A frame length prefix exceeded the message size ceiling.
    #[error("Message too large: {0} bytes")]
    OversizedMessage(usize),

    /// A frame length prefix was smaller than the prefix itself.
    #[error("Malformed frame length: {0}")]
    Malformed(usize),

    /// A message payload failed to decode or carried an unusable command.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The peer closed the stream.
    #[error("Tunnel connection closed by peer")]
    ConnectionClosed,

    /// A state the engine should never reach.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TunnelError {
    /// Whether this error must tear the session down.
    ///
    /// Framing and transport failures leave the stream position unknowable,
    /// so there is no resynchronizing past them. A single undecodable
    /// message payload is skipped instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TunnelError::InvalidMessage(_))
    }
}

impl From<FrameError> for TunnelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Oversized(total) => TunnelError::OversizedMessage(total),
            FrameError::Malformed(total) => TunnelError::Malformed(total),
        }
    }
}

impl From<MessageError> for TunnelError {
    fn from(err: MessageError) -> Self {
        TunnelError::InvalidMessage(err.to_string())
    }
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed => TunnelError::ConnectionClosed,
            TransportError::Cancelled => TunnelError::Cancelled,
            TransportError::InvalidAddress(msg) => TunnelError::BadConfiguration(msg),
            other => TunnelError::Disconnected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_map_to_fatal_kinds() {
        assert_eq!(
            TunnelError::from(FrameError::Oversized(200_000)),
            TunnelError::OversizedMessage(200_000)
        );
        assert_eq!(
            TunnelError::from(FrameError::Malformed(2)),
            TunnelError::Malformed(2)
        );
        assert!(TunnelError::OversizedMessage(200_000).is_fatal());
        assert!(TunnelError::Malformed(2).is_fatal());
    }

    #[test]
    fn test_message_errors_are_non_fatal() {
        let err = TunnelError::from(MessageError::UnknownCommand(0xAA));
        assert!(matches!(err, TunnelError::InvalidMessage(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transport_errors_map_by_kind() {
        assert_eq!(
            TunnelError::from(TransportError::ConnectionClosed),
            TunnelError::ConnectionClosed
        );
        assert_eq!(
            TunnelError::from(TransportError::Cancelled),
            TunnelError::Cancelled
        );
        assert!(matches!(
            TunnelError::from(TransportError::ConnectFailed("refused".to_string())),
            TunnelError::Disconnected(_)
        ));
    }
}
