//! Wire format for remoting an object/handle-based GPU API.
//!
//! This crate is transport- and backend-agnostic: it defines the cross-boundary identities
//! ([`ObjectHandle`], [`HandleTable`]), the framed little-endian command encoding
//! ([`WireCommand`] client → server, [`ReturnCommand`] server → client) and the descriptor types
//! they carry. Decoding always produces an owned, fully validated value.

pub mod command;
pub mod error;
pub mod frame;
pub mod handle;
pub mod return_command;
pub mod table;
pub mod types;
pub mod wire;

pub use command::WireCommand;
pub use error::DecodeError;
pub use frame::CommandHeader;
pub use handle::{ObjectGeneration, ObjectHandle, ObjectId, ObjectType};
pub use return_command::ReturnCommand;
pub use table::{HandleTable, OccupyError};
pub use types::*;
pub use wire::{WireReader, WireWriter};
