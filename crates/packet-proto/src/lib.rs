//! Packet Control Protocol
//!
//! This crate defines the frames exchanged between a participation agent and
//! the control servers of the relay network, plus the preamble an agent sends
//! on a freshly opened peer relay connection.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
