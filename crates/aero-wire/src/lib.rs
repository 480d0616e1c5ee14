//! Client and server halves of the GPU API wire.
//!
//! A [`WireClient`] turns API calls into [`aero_wire_protocol::WireCommand`]s and resolves the
//! futures the server completes; a [`WireServer`] replays those commands against a [`Procs`]
//! backend and streams completions back. Both sides keep per-type [`ObjectStore`]s whose handles
//! agree across the boundary.
//!
//! Mapped-buffer bytes move through a [`memory_transfer`] strategy picked per buffer at creation.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod memory_transfer;
pub mod objects;
pub mod server;
pub mod transport;

/// Software backend and loopback harness for tests.
///
/// Only available in this crate's own tests or with the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::{WireClient, WireClientConfig};
pub use error::{ClientError, ObjectError, WireError};
pub use objects::{ObjectStore, ObjectTable};
pub use server::{Procs, WireServer, WireServerConfig};
pub use transport::{channel_transport, ChannelTransport, Transport};
