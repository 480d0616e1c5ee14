//! How mapped-buffer bytes cross the boundary.
//!
//! A mappable buffer gets a read and/or write handle pair when it is created: the client creates
//! its half and sends a create payload (`u8 kind, u64 size, kind-specific tail`), the server
//! deserializes the matching half. Two strategies exist:
//!
//! - [`inline`]: bytes travel inside the command stream as data-update payloads.
//! - [`shared`]: bytes travel through a region of a [`SharedMemoryRegistry`] visible to both sides;
//!   data-update payloads are empty.
//!
//! The set of strategies is closed: the per-side handle enums below dispatch to one of the two
//! implementations, chosen once per buffer.

use std::fmt;

use aero_wire_protocol::{WireReader, WireWriter};
use thiserror::Error;

pub mod inline;
pub mod shared;

pub use inline::InlineMemoryTransferService;
pub use shared::{SharedMemoryRegistry, SharedMemoryTransferService};

pub const KIND_INLINE: u8 = 0;
pub const KIND_SHARED: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("data update of {actual} bytes does not match the declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("range offset={offset} size={size} exceeds the handle size {handle_size}")]
    OutOfRange {
        offset: u64,
        size: u64,
        handle_size: u64,
    },
    #[error("unknown memory transfer kind {0}")]
    UnknownKind(u8),
    #[error("memory transfer kind {0} is not enabled on this side")]
    Unsupported(u8),
    #[error("malformed memory transfer payload")]
    Malformed,
    #[error("unknown shared memory region {0}")]
    UnknownRegion(u64),
    #[error("{0} bytes cannot be addressed on this host")]
    AllocationTooLarge(u64),
}

/// Validate `offset..offset + size` against a handle of `handle_size` bytes and convert it to a
/// host range.
pub(crate) fn checked_range(
    offset: u64,
    size: u64,
    handle_size: u64,
) -> Result<std::ops::Range<usize>, TransferError> {
    let out_of_range = TransferError::OutOfRange {
        offset,
        size,
        handle_size,
    };
    let end = offset.checked_add(size).ok_or(out_of_range.clone())?;
    if end > handle_size {
        return Err(out_of_range);
    }
    let start = usize::try_from(offset).map_err(|_| TransferError::AllocationTooLarge(offset))?;
    let end = usize::try_from(end).map_err(|_| TransferError::AllocationTooLarge(end))?;
    Ok(start..end)
}

/// Decoded create payload header plus its kind-specific tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateDesc {
    Inline { size: u64 },
    Shared { size: u64, region: u64 },
}

impl CreateDesc {
    pub(crate) fn size(&self) -> u64 {
        match self {
            CreateDesc::Inline { size } | CreateDesc::Shared { size, .. } => *size,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            CreateDesc::Inline { size } => {
                w.u8(KIND_INLINE);
                w.u64(*size);
            }
            CreateDesc::Shared { size, region } => {
                w.u8(KIND_SHARED);
                w.u64(*size);
                w.u64(*region);
            }
        }
        w.into_bytes()
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        let mut r = WireReader::new(bytes);
        let kind = r.u8().map_err(|_| TransferError::Malformed)?;
        let size = r.u64().map_err(|_| TransferError::Malformed)?;
        let desc = match kind {
            KIND_INLINE => CreateDesc::Inline { size },
            KIND_SHARED => CreateDesc::Shared {
                size,
                region: r.u64().map_err(|_| TransferError::Malformed)?,
            },
            other => return Err(TransferError::UnknownKind(other)),
        };
        r.finish().map_err(|_| TransferError::Malformed)?;
        Ok(desc)
    }
}

/// Client half of a buffer's read path.
pub trait ReadHandle {
    fn size(&self) -> u64;

    /// Payload sent once with the buffer creation command.
    fn serialize_create(&self) -> Vec<u8>;

    /// Apply the server's data update for a resolved read map.
    fn deserialize_data_update(
        &mut self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError>;

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError>;
}

/// Client half of a buffer's write path.
pub trait WriteHandle {
    fn size(&self) -> u64;

    fn serialize_create(&self) -> Vec<u8>;

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError>;

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError>;

    /// Payload flushing `offset..offset + size` to the server on unmap.
    fn serialize_data_update(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError>;
}

/// Server half of a buffer's read path.
pub trait ReadSource {
    fn size(&self) -> u64;

    /// Produce the update for a read map resolving over `offset..offset + src.len()`.
    fn serialize_data_update(&self, src: &[u8], offset: u64) -> Result<Vec<u8>, TransferError>;
}

/// Server half of a buffer's write path.
pub trait WriteSink {
    fn size(&self) -> u64;

    /// Check a client data update without touching buffer storage.
    fn validate_data_update(&self, update: &[u8], offset: u64, size: u64)
        -> Result<(), TransferError>;

    /// Apply a validated update to the mapped storage `dest` (exactly `size` bytes long).
    fn apply_data_update(&self, update: &[u8], offset: u64, dest: &mut [u8]);
}

macro_rules! dispatch {
    ($self:ident, $h:ident => $e:expr) => {
        match $self {
            Self::Inline($h) => $e,
            Self::Shared($h) => $e,
        }
    };
}

pub enum ClientReadHandle {
    Inline(inline::InlineReadHandle),
    Shared(shared::SharedReadHandle),
}

impl ReadHandle for ClientReadHandle {
    fn size(&self) -> u64 {
        dispatch!(self, h => h.size())
    }

    fn serialize_create(&self) -> Vec<u8> {
        dispatch!(self, h => h.serialize_create())
    }

    fn deserialize_data_update(
        &mut self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        dispatch!(self, h => h.deserialize_data_update(update, offset, size))
    }

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        dispatch!(self, h => h.read_range(offset, size))
    }
}

pub enum ClientWriteHandle {
    Inline(inline::InlineWriteHandle),
    Shared(shared::SharedWriteHandle),
}

impl WriteHandle for ClientWriteHandle {
    fn size(&self) -> u64 {
        dispatch!(self, h => h.size())
    }

    fn serialize_create(&self) -> Vec<u8> {
        dispatch!(self, h => h.serialize_create())
    }

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        dispatch!(self, h => h.read_range(offset, size))
    }

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        dispatch!(self, h => h.write_range(offset, data))
    }

    fn serialize_data_update(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        dispatch!(self, h => h.serialize_data_update(offset, size))
    }
}

pub enum ServerReadHandle {
    Inline(inline::InlineReadSource),
    Shared(shared::SharedReadSource),
}

impl ReadSource for ServerReadHandle {
    fn size(&self) -> u64 {
        dispatch!(self, h => h.size())
    }

    fn serialize_data_update(&self, src: &[u8], offset: u64) -> Result<Vec<u8>, TransferError> {
        dispatch!(self, h => h.serialize_data_update(src, offset))
    }
}

pub enum ServerWriteHandle {
    Inline(inline::InlineWriteSink),
    Shared(shared::SharedWriteSink),
}

impl WriteSink for ServerWriteHandle {
    fn size(&self) -> u64 {
        dispatch!(self, h => h.size())
    }

    fn validate_data_update(
        &self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        dispatch!(self, h => h.validate_data_update(update, offset, size))
    }

    fn apply_data_update(&self, update: &[u8], offset: u64, dest: &mut [u8]) {
        dispatch!(self, h => h.apply_data_update(update, offset, dest))
    }
}

macro_rules! opaque_debug {
    ($($ty:ident),+) => {
        $(
            impl fmt::Debug for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let kind = match self {
                        Self::Inline(_) => "Inline",
                        Self::Shared(_) => "Shared",
                    };
                    f.debug_struct(stringify!($ty))
                        .field("kind", &kind)
                        .field("size", &self.size())
                        .finish()
                }
            }
        )+
    };
}

opaque_debug!(ClientReadHandle, ClientWriteHandle, ServerReadHandle, ServerWriteHandle);

/// Client-side factory. Returns `None` when a handle of `size` bytes cannot be provided, in which
/// case the buffer is created as an error buffer.
pub trait ClientMemoryTransferService: Send {
    fn create_read_handle(&mut self, size: u64) -> Option<ClientReadHandle>;
    fn create_write_handle(&mut self, size: u64) -> Option<ClientWriteHandle>;
}

/// Server-side factory. A failure is fatal to the command stream.
pub trait ServerMemoryTransferService: Send {
    fn deserialize_read_handle(&mut self, bytes: &[u8]) -> Result<ServerReadHandle, TransferError>;
    fn deserialize_write_handle(&mut self, bytes: &[u8])
        -> Result<ServerWriteHandle, TransferError>;
}

/// Server factory accepting inline handles and, when a registry is attached, shared ones.
#[derive(Debug, Clone, Default)]
pub struct ServerTransferService {
    shared: Option<SharedMemoryRegistry>,
}

impl ServerTransferService {
    pub fn inline() -> Self {
        Self::default()
    }

    pub fn with_shared(registry: SharedMemoryRegistry) -> Self {
        Self {
            shared: Some(registry),
        }
    }
}

impl ServerMemoryTransferService for ServerTransferService {
    fn deserialize_read_handle(&mut self, bytes: &[u8]) -> Result<ServerReadHandle, TransferError> {
        match CreateDesc::decode(bytes)? {
            CreateDesc::Inline { size } => {
                Ok(ServerReadHandle::Inline(inline::InlineReadSource::new(size)))
            }
            CreateDesc::Shared { size, region } => {
                let registry = self
                    .shared
                    .as_ref()
                    .ok_or(TransferError::Unsupported(KIND_SHARED))?;
                Ok(ServerReadHandle::Shared(shared::SharedReadSource::open(
                    registry, region, size,
                )?))
            }
        }
    }

    fn deserialize_write_handle(
        &mut self,
        bytes: &[u8],
    ) -> Result<ServerWriteHandle, TransferError> {
        match CreateDesc::decode(bytes)? {
            CreateDesc::Inline { size } => {
                Ok(ServerWriteHandle::Inline(inline::InlineWriteSink::new(size)))
            }
            CreateDesc::Shared { size, region } => {
                let registry = self
                    .shared
                    .as_ref()
                    .ok_or(TransferError::Unsupported(KIND_SHARED))?;
                Ok(ServerWriteHandle::Shared(shared::SharedWriteSink::open(
                    registry, region, size,
                )?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn create_payload_layout() {
        let bytes = CreateDesc::Shared { size: 16, region: 3 }.encode();
        assert_eq!(bytes.len(), 1 + 8 + 8);
        assert_eq!(bytes[0], KIND_SHARED);
        assert_eq!(
            CreateDesc::decode(&bytes),
            Ok(CreateDesc::Shared { size: 16, region: 3 })
        );
    }

    #[test]
    fn malformed_create_payloads_are_rejected() {
        assert_eq!(CreateDesc::decode(&[]), Err(TransferError::Malformed));
        assert_eq!(
            CreateDesc::decode(&[7, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(TransferError::UnknownKind(7))
        );
        let mut trailing = CreateDesc::Inline { size: 4 }.encode();
        trailing.push(0);
        assert_eq!(CreateDesc::decode(&trailing), Err(TransferError::Malformed));
    }

    #[test]
    fn range_check_rejects_overflow() {
        assert!(checked_range(u64::MAX, 2, 8).is_err());
        assert!(checked_range(4, 5, 8).is_err());
        assert_eq!(checked_range(4, 4, 8), Ok(4..8));
    }

    #[test]
    fn inline_server_rejects_shared_payloads() {
        let mut service = ServerTransferService::inline();
        let bytes = CreateDesc::Shared { size: 4, region: 1 }.encode();
        assert_eq!(
            service.deserialize_read_handle(&bytes).unwrap_err(),
            TransferError::Unsupported(KIND_SHARED)
        );
    }
}
