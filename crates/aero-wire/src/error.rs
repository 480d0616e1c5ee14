use aero_wire_protocol::{DecodeError, ObjectHandle, ObjectType, OccupyError};
use thiserror::Error;

use crate::memory_transfer::TransferError;

/// Object table failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("unknown {object_type} {handle}")]
    UnknownObject {
        object_type: ObjectType,
        handle: ObjectHandle,
    },
    #[error("{object_type} {handle} is reserved but was never created")]
    NotAllocated {
        object_type: ObjectType,
        handle: ObjectHandle,
    },
    #[error(transparent)]
    Occupy(#[from] OccupyError),
}

/// A failure that desynchronizes the command stream. After this is returned the connection must
/// be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed command: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error("invalid memory transfer payload: {0}")]
    Transfer(#[from] TransferError),
    #[error("{command}: {reason}")]
    Protocol {
        command: &'static str,
        reason: &'static str,
    },
}

/// Local misuse of the client API. Nothing is sent when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("unknown {object_type} {handle}")]
    UnknownObject {
        object_type: ObjectType,
        handle: ObjectHandle,
    },
    #[error("no {0} id is left to reserve")]
    IdSpaceExhausted(ObjectType),
    #[error("buffer {0} is not mapped")]
    NotMapped(ObjectHandle),
    #[error("buffer {0} is mapped for reading only")]
    NotWritable(ObjectHandle),
    #[error("range offset={offset} size={size} is outside the mapped range")]
    OutsideMappedRange { offset: u64, size: u64 },
    #[error(transparent)]
    Transfer(#[from] TransferError),
}
