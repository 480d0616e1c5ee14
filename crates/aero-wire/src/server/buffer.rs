use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, FutureId, MapAsyncStatus, MapMode, ObjectHandle, ObjectType,
    ReturnCommand,
};
use tracing::debug;

use super::procs::{Callback, Procs};
use super::reply::ServerReply;
use super::{ServerObject, ServerObjectKind, WireServer};
use crate::error::WireError;
use crate::memory_transfer::{
    ReadSource, ServerReadHandle, ServerWriteHandle, TransferError, WriteSink,
};
use crate::objects::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingMap {
    pub future: FutureId,
    pub mode: MapMode,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MappedRange {
    pub mode: MapMode,
    pub offset: u64,
    pub size: u64,
}

impl MappedRange {
    fn contains(&self, offset: u64, size: u64) -> bool {
        offset >= self.offset
            && offset
                .checked_add(size)
                .is_some_and(|end| end <= self.offset.saturating_add(self.size))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ServerBufferState {
    pub usage: BufferUsages,
    pub read_handle: Option<ServerReadHandle>,
    pub write_handle: Option<ServerWriteHandle>,
    /// Set until the first unmap of a buffer created mapped.
    pub mapped_at_creation: bool,
    pub pending_map: Option<PendingMap>,
    pub mapped: Option<MappedRange>,
}

fn buffer_state<'a, O>(
    objects: &'a mut ObjectStore<ServerObject<O>>,
    handle: ObjectHandle,
    command: &'static str,
) -> Result<&'a mut ServerBufferState, WireError> {
    objects
        .lookup_mut(ObjectType::Buffer, handle)?
        .buffer_mut()
        .ok_or(WireError::Protocol {
            command,
            reason: "buffer record has no buffer state",
        })
}

impl<P: Procs> WireServer<P> {
    pub(super) fn create_buffer(
        &mut self,
        device: ObjectHandle,
        result: ObjectHandle,
        descriptor: BufferDescriptor,
        read_handle: Option<Vec<u8>>,
        write_handle: Option<Vec<u8>>,
    ) -> Result<(), WireError> {
        let device = self.resolve(ObjectType::Device, device)?;
        self.check_result(ObjectType::Buffer, result)?;

        let read_handle = read_handle
            .map(|bytes| self.memory_transfer.deserialize_read_handle(&bytes))
            .transpose()?;
        let write_handle = write_handle
            .map(|bytes| self.memory_transfer.deserialize_write_handle(&bytes))
            .transpose()?;
        let sizes = read_handle
            .iter()
            .map(ReadSource::size)
            .chain(write_handle.iter().map(WriteSink::size));
        for actual in sizes {
            if actual != descriptor.size {
                return Err(TransferError::SizeMismatch {
                    expected: descriptor.size,
                    actual,
                }
                .into());
            }
        }
        if descriptor.mapped_at_creation && write_handle.is_none() {
            return Err(WireError::Protocol {
                command: "DeviceCreateBuffer",
                reason: "buffer mapped at creation without a write handle",
            });
        }

        let object = self.procs.device_create_buffer(&device, &descriptor);
        let state = ServerBufferState {
            usage: descriptor.usage,
            read_handle,
            write_handle,
            mapped_at_creation: descriptor.mapped_at_creation,
            pending_map: None,
            mapped: descriptor.mapped_at_creation.then_some(MappedRange {
                mode: MapMode::WRITE,
                offset: 0,
                size: descriptor.size,
            }),
        };
        self.insert(
            ObjectType::Buffer,
            result,
            ServerObject {
                backing: Some(object),
                kind: ServerObjectKind::Buffer(state),
            },
        )
    }

    pub(super) fn create_error_buffer(
        &mut self,
        device: ObjectHandle,
        result: ObjectHandle,
        descriptor: BufferDescriptor,
    ) -> Result<(), WireError> {
        let device = self.resolve(ObjectType::Device, device)?;
        self.check_result(ObjectType::Buffer, result)?;
        let object = self.procs.device_create_error_buffer(&device, &descriptor);
        self.insert(
            ObjectType::Buffer,
            result,
            ServerObject {
                backing: Some(object),
                kind: ServerObjectKind::Buffer(ServerBufferState {
                    usage: descriptor.usage,
                    ..ServerBufferState::default()
                }),
            },
        )
    }

    pub(super) fn map_async(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
    ) -> Result<(), WireError> {
        let backing = self.resolve(ObjectType::Buffer, buffer)?;
        let state = buffer_state(&mut self.objects, buffer, "BufferMapAsync")?;
        let busy = if state.pending_map.is_some() {
            Some("buffer already has an outstanding map pending")
        } else if state.mapped.is_some() {
            Some("buffer is already mapped")
        } else {
            None
        };
        if let Some(reason) = busy {
            debug!(%buffer, future = future.0, reason, "rejecting map");
            self.send_return(ReturnCommand::BufferMapAsyncCallback {
                buffer,
                future,
                status: MapAsyncStatus::Error,
                message: reason.to_owned(),
                read_data: Vec::new(),
            });
            return Ok(());
        }
        state.pending_map = Some(PendingMap {
            future,
            mode,
            offset,
            size,
        });
        let replies = self.replies_tx.clone();
        let callback = Callback::new(move |(status, message)| {
            // A failed send means the server is gone.
            let _ = replies.send(ServerReply::Map {
                buffer,
                future,
                status,
                message,
            });
        });
        self.procs
            .buffer_map_async(&backing, mode, offset, size, callback);
        Ok(())
    }

    /// Validate a write-map data update against the mapping and the write handle, then copy it
    /// into the backend's mapped storage.
    pub(super) fn update_mapped_data(
        &mut self,
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
        data: &[u8],
    ) -> Result<(), WireError> {
        const COMMAND: &str = "BufferUpdateMappedData";
        let protocol = |reason| WireError::Protocol {
            command: COMMAND,
            reason,
        };

        let backing = self.resolve(ObjectType::Buffer, buffer)?;
        let state = buffer_state(&mut self.objects, buffer, COMMAND)?;
        let mapped = state
            .mapped
            .filter(|mapped| mapped.mode == MapMode::WRITE)
            .ok_or_else(|| protocol("buffer is not mapped for writing"))?;
        if !mapped.contains(offset, size) {
            return Err(protocol("update lies outside the mapped range"));
        }
        let sink = state
            .write_handle
            .as_ref()
            .ok_or_else(|| protocol("buffer has no write handle"))?;
        sink.validate_data_update(data, offset, size)?;

        let dest = self
            .procs
            .buffer_mapped_range(&backing, offset, size)
            .ok_or_else(|| protocol("backend storage is not mapped"))?;
        if dest.len() as u64 != size {
            return Err(protocol("backend returned a range of the wrong size"));
        }
        sink.apply_data_update(data, offset, dest);
        Ok(())
    }

    pub(super) fn unmap(&mut self, buffer: ObjectHandle) -> Result<(), WireError> {
        let backing = self.resolve(ObjectType::Buffer, buffer)?;
        let state = buffer_state(&mut self.objects, buffer, "BufferUnmap")?;
        state.pending_map = None;
        state.mapped = None;
        if std::mem::take(&mut state.mapped_at_creation)
            && !state.usage.contains(BufferUsages::MAP_WRITE)
        {
            debug!(%buffer, "retiring the mapped-at-creation write handle");
            state.write_handle = None;
        }
        self.procs.buffer_unmap(&backing);
        Ok(())
    }

    pub(super) fn destroy_buffer(&mut self, buffer: ObjectHandle) -> Result<(), WireError> {
        let backing = self.resolve(ObjectType::Buffer, buffer)?;
        let state = buffer_state(&mut self.objects, buffer, "BufferDestroy")?;
        state.pending_map = None;
        state.mapped = None;
        self.procs.buffer_destroy(&backing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_range_containment() {
        let range = MappedRange {
            mode: MapMode::WRITE,
            offset: 4,
            size: 8,
        };
        assert!(range.contains(4, 8));
        assert!(range.contains(6, 2));
        assert!(!range.contains(0, 4));
        assert!(!range.contains(8, 8));
        assert!(!range.contains(u64::MAX, 2));
    }
}
