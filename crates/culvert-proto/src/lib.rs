//! Tunnel Protocol Definitions
//!
//! Wire model for the tunnel control channel: length-prefixed frames
//! carrying typed command messages whose properties use a small tagged
//! value vocabulary.

pub mod frame;
pub mod message;

pub use frame::{Frame, FrameError};
pub use message::{key, Command, Message, MessageError, OpenResultCode, Properties, Value};

/// Ceiling on a frame's total length, prefix included (128 KiB)
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest legal length prefix value (a frame counts its own prefix)
pub const MIN_FRAME_LEN: usize = LENGTH_PREFIX_LEN;

/// Connection identifier reserved for control-channel messages
pub const CONTROL_CONNECTION_ID: u32 = 0;
