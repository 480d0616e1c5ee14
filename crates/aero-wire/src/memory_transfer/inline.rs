//! Inline transfer: mapped bytes are copied into the command stream.

use super::{
    checked_range, ClientMemoryTransferService, ClientReadHandle, ClientWriteHandle, CreateDesc,
    ReadHandle, ReadSource, TransferError, WriteHandle, WriteSink,
};

/// Client factory for inline handles.
#[derive(Debug, Clone, Default)]
pub struct InlineMemoryTransferService;

impl InlineMemoryTransferService {
    pub fn new() -> Self {
        Self
    }
}

fn zeroed(size: u64) -> Option<Vec<u8>> {
    let len = usize::try_from(size).ok()?;
    Some(vec![0; len])
}

impl ClientMemoryTransferService for InlineMemoryTransferService {
    fn create_read_handle(&mut self, size: u64) -> Option<ClientReadHandle> {
        Some(ClientReadHandle::Inline(InlineReadHandle {
            data: zeroed(size)?,
        }))
    }

    fn create_write_handle(&mut self, size: u64) -> Option<ClientWriteHandle> {
        Some(ClientWriteHandle::Inline(InlineWriteHandle {
            data: zeroed(size)?,
        }))
    }
}

pub struct InlineReadHandle {
    data: Vec<u8>,
}

impl ReadHandle for InlineReadHandle {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn serialize_create(&self) -> Vec<u8> {
        CreateDesc::Inline { size: self.size() }.encode()
    }

    fn deserialize_data_update(
        &mut self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        let range = checked_range(offset, size, self.size())?;
        if update.len() as u64 != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: update.len() as u64,
            });
        }
        self.data[range].copy_from_slice(update);
        Ok(())
    }

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        let range = checked_range(offset, size, self.size())?;
        Ok(self.data[range].to_vec())
    }
}

pub struct InlineWriteHandle {
    data: Vec<u8>,
}

impl WriteHandle for InlineWriteHandle {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn serialize_create(&self) -> Vec<u8> {
        CreateDesc::Inline { size: self.size() }.encode()
    }

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        let range = checked_range(offset, size, self.size())?;
        Ok(self.data[range].to_vec())
    }

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let range = checked_range(offset, data.len() as u64, self.size())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn serialize_data_update(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        self.read_range(offset, size)
    }
}

pub struct InlineReadSource {
    size: u64,
}

impl InlineReadSource {
    pub(crate) fn new(size: u64) -> Self {
        Self { size }
    }
}

impl ReadSource for InlineReadSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn serialize_data_update(&self, src: &[u8], offset: u64) -> Result<Vec<u8>, TransferError> {
        checked_range(offset, src.len() as u64, self.size)?;
        Ok(src.to_vec())
    }
}

pub struct InlineWriteSink {
    size: u64,
}

impl InlineWriteSink {
    pub(crate) fn new(size: u64) -> Self {
        Self { size }
    }
}

impl WriteSink for InlineWriteSink {
    fn size(&self) -> u64 {
        self.size
    }

    fn validate_data_update(
        &self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        checked_range(offset, size, self.size)?;
        if update.len() as u64 != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: update.len() as u64,
            });
        }
        Ok(())
    }

    fn apply_data_update(&self, update: &[u8], _offset: u64, dest: &mut [u8]) {
        let n = dest.len().min(update.len());
        dest[..n].copy_from_slice(&update[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn read_handle_starts_zeroed_and_accepts_updates() {
        let mut service = InlineMemoryTransferService::new();
        let mut handle = service.create_read_handle(8).unwrap();
        assert_eq!(handle.read_range(0, 8).unwrap(), vec![0; 8]);

        handle.deserialize_data_update(&[1, 2, 3, 4], 4, 4).unwrap();
        assert_eq!(handle.read_range(0, 8).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn read_update_must_match_declared_size() {
        let mut service = InlineMemoryTransferService::new();
        let mut handle = service.create_read_handle(8).unwrap();
        assert_eq!(
            handle.deserialize_data_update(&[1, 2], 0, 4),
            Err(TransferError::SizeMismatch {
                expected: 4,
                actual: 2
            })
        );
        assert!(handle.deserialize_data_update(&[0; 4], 6, 4).is_err());
    }

    #[test]
    fn write_update_round_trips_through_the_sink() {
        let mut service = InlineMemoryTransferService::new();
        let mut client = service.create_write_handle(4).unwrap();
        client.write_range(1, &[7, 8]).unwrap();
        let update = client.serialize_data_update(0, 4).unwrap();

        let sink = InlineWriteSink::new(4);
        sink.validate_data_update(&update, 0, 4).unwrap();
        let mut storage = [0xffu8; 4];
        sink.apply_data_update(&update, 0, &mut storage);
        assert_eq!(storage, [0, 7, 8, 0]);
    }

    #[test]
    fn sink_rejects_out_of_bounds_updates() {
        let sink = InlineWriteSink::new(4);
        assert_eq!(
            sink.validate_data_update(&[0; 4], 2, 4),
            Err(TransferError::OutOfRange {
                offset: 2,
                size: 4,
                handle_size: 4
            })
        );
        assert!(sink.validate_data_update(&[0; 3], 0, 4).is_err());
    }
}
