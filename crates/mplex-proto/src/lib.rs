//! Stream Multiplexing Protocol Definitions
//!
//! This crate defines the wire frames exchanged by two multiplexing peers and
//! the codec that carries them over a reliable byte transport.
//!
//! # Frame Layout
//!
//! ```text
//! ┌──────────────────────────┬──────────┬───────────────┬───────────────┐
//! │ varint(id << 1 | init)   │ type (1) │ varint(len)   │ payload (len) │
//! └──────────────────────────┴──────────┴───────────────┴───────────────┘
//! ```
//!
//! `init` is set when the sender of the frame is the peer that opened the
//! stream. Frame types are NEW=0, MESSAGE=1, CLOSE=2 and RESET=3.

pub mod codec;
pub mod frame;
pub mod varint;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameError, FrameType, StreamId};

/// Default maximum payload accepted in a single frame (1MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
