//! Stream multiplexing over a single reliable byte transport
//!
//! A [`Connection`] wraps an already-connected duplex transport (anything
//! implementing `AsyncRead + AsyncWrite`) and lets both peers open any number
//! of independent, ordered, duplex [`Stream`]s over it.
//!
//! # Example
//!
//! ```ignore
//! use mplex_connection::Connection;
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let dialer = Connection::dial(a);
//! let listener = Connection::listen(b);
//!
//! let mut incoming = listener.incoming();
//! let stream = dialer.new_stream().await?;
//! stream.write("hey").await?;
//! stream.close().await?;
//!
//! let remote = incoming.accept().await.unwrap();
//! assert_eq!(remote.read_to_end().await?, vec![bytes::Bytes::from("hey")]);
//! ```
//!
//! # Failure Model
//!
//! - Resetting or closing a stream never affects its siblings.
//! - Malformed input, a duplicate NEW or a reused stream id aborts the whole
//!   connection with a [`ProtocolError`].
//! - When the transport ends, every live stream is terminated exactly once:
//!   streams the remote already closed end cleanly, the rest fail.

pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod stream;

pub use config::MuxConfig;
pub use connection::{Connection, ConnectionStats, Incoming};
pub use error::{ConnectionError, ConnectionResult, ProtocolError, StreamError, StreamResult};
pub use mplex_proto::StreamId;
pub use registry::Role;
pub use stream::{ReadState, Stream, WriteState};
