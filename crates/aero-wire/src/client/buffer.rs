use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, FutureId, MapAsyncStatus, MapMode, ObjectHandle, ObjectType,
    WireCommand,
};
use tracing::debug;

use super::callback::MapAsyncCallbackInfo;
use super::event::{CancelReason, EventKind, EventPayload, Resolution};
use super::objects::{Buffer, BufferState, ClientObject, ClientObjectKind, MapRequest, MapState};
use super::{Device, WireClient};
use crate::error::{ClientError, WireError};
use crate::memory_transfer::{ReadHandle, WriteHandle};
use crate::objects::ObjectStore;

/// Client-visible map state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMapState {
    Unmapped,
    Pending,
    Mapped,
}

impl WireClient {
    /// Create a buffer. Mappable buffers get memory-transfer handles; when a handle cannot be
    /// provided the buffer is created as an error buffer instead.
    pub fn create_buffer(
        &mut self,
        device: Device,
        descriptor: &BufferDescriptor,
    ) -> Result<Buffer, ClientError> {
        self.require(ObjectType::Device, device.handle())?;

        let mut state = BufferState::reserved(descriptor.size, descriptor.usage);
        let mut failed = descriptor.size > self.max_allocation_size;
        if !failed && descriptor.usage.contains(BufferUsages::MAP_READ) {
            state.read_handle = self.memory_transfer.create_read_handle(descriptor.size);
            failed = state.read_handle.is_none();
        }
        if !failed
            && (descriptor.usage.contains(BufferUsages::MAP_WRITE) || descriptor.mapped_at_creation)
        {
            state.write_handle = self.memory_transfer.create_write_handle(descriptor.size);
            failed = state.write_handle.is_none();
        }

        if failed {
            debug!(size = descriptor.size, "creating error buffer");
            state = BufferState::reserved(descriptor.size, descriptor.usage);
            state.is_error = true;
        } else if descriptor.mapped_at_creation {
            state.map = MapState::MappedAtCreation {
                size: descriptor.size,
            };
        }

        let read_payload = state.read_handle.as_ref().map(ReadHandle::serialize_create);
        let write_payload = state
            .write_handle
            .as_ref()
            .map(WriteHandle::serialize_create);
        let result = self.reserve(
            ObjectType::Buffer,
            ClientObject {
                parent: device.handle(),
                kind: ClientObjectKind::Buffer(state),
            },
        )?;
        let command = if failed {
            WireCommand::DeviceCreateErrorBuffer {
                device: device.handle(),
                result,
                descriptor: descriptor.clone(),
            }
        } else {
            WireCommand::DeviceCreateBuffer {
                device: device.handle(),
                result,
                descriptor: descriptor.clone(),
                read_handle: read_payload,
                write_handle: write_payload,
            }
        };
        self.serialize(command);
        Ok(Buffer::from_handle(result))
    }

    fn buffer_state(&self, buffer: Buffer) -> Result<&BufferState, ClientError> {
        self.require(ObjectType::Buffer, buffer.handle())?
            .buffer()
            .ok_or(ClientError::UnknownObject {
                object_type: ObjectType::Buffer,
                handle: buffer.handle(),
            })
    }

    pub fn buffer_map_state(&self, buffer: Buffer) -> Result<BufferMapState, ClientError> {
        Ok(match self.buffer_state(buffer)?.map {
            MapState::Unmapped => BufferMapState::Unmapped,
            MapState::Pending(_) => BufferMapState::Pending,
            MapState::Mapped { .. } | MapState::MappedAtCreation { .. } => BufferMapState::Mapped,
        })
    }

    pub fn buffer_size(&self, buffer: Buffer) -> Result<u64, ClientError> {
        Ok(self.buffer_state(buffer)?.size)
    }

    /// Request a map of `offset..offset + size`. Local validation failures complete the returned
    /// future with [`MapAsyncStatus::Error`] without a round trip.
    pub fn map_async(
        &mut self,
        buffer: Buffer,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: MapAsyncCallbackInfo,
    ) -> Result<FutureId, ClientError> {
        let handle = buffer.handle();
        let invalid = validate_map(self.buffer_state(buffer)?, mode, offset, size);

        let MapAsyncCallbackInfo { mode: cb_mode, callback } = callback;
        let future = self.events.track(
            cb_mode,
            EventKind::MapAsync,
            Some((ObjectType::Buffer, handle)),
            Box::new(move |client: &mut WireClient, future: FutureId, resolution: Resolution| {
                let (status, message) = client.finish_map(handle, future, resolution);
                callback(client, status, message);
            }),
        );

        if let Some(message) = invalid {
            debug!(buffer = %handle, message, "map rejected locally");
            self.events.mark_ready(
                future,
                EventPayload::MapAsync {
                    status: MapAsyncStatus::Error,
                    message: message.to_owned(),
                },
            );
        } else if !self.events.is_resolved(future) {
            buffer_mut(&mut self.objects, buffer)?.map = MapState::Pending(MapRequest {
                future,
                mode,
                offset,
                size,
            });
            self.serialize(WireCommand::BufferMapAsync {
                buffer: handle,
                future,
                mode,
                offset,
                size,
            });
        }
        self.deliver_spontaneous();
        Ok(future)
    }

    /// Apply a server map completion. Stale completions (the request was cancelled or replaced)
    /// are dropped before any data is copied.
    pub(super) fn on_map_completion(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        status: MapAsyncStatus,
        message: String,
        read_data: &[u8],
    ) -> Result<(), WireError> {
        let command = "BufferMapAsyncCallback";
        if !self.events.is_pending(future) {
            debug!(%buffer, future = future.0, "discarding stale map completion");
            return Ok(());
        }
        if self.events.kind(future) != Some(EventKind::MapAsync) {
            return Err(WireError::Protocol {
                command,
                reason: "completion does not match the future's operation",
            });
        }
        let Some(state) = self
            .objects
            .get_mut(ObjectType::Buffer, buffer)
            .and_then(ClientObject::buffer_mut)
        else {
            debug!(%buffer, "map completion for a released buffer");
            return Ok(());
        };
        let Some(request) = state.pending_map().filter(|request| request.future == future) else {
            debug!(%buffer, future = future.0, "map completion for a replaced request");
            return Ok(());
        };

        if status == MapAsyncStatus::Success && request.mode == MapMode::READ {
            let handle = state.read_handle.as_mut().ok_or(WireError::Protocol {
                command,
                reason: "read map resolved on a buffer without a read handle",
            })?;
            handle.deserialize_data_update(read_data, request.offset, request.size)?;
        }
        self.complete(command, future, EventPayload::MapAsync { status, message })
    }

    /// Settle the buffer's map state when its map future is delivered.
    fn finish_map(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        resolution: Resolution,
    ) -> (MapAsyncStatus, String) {
        let (status, message) = match resolution {
            Ok(EventPayload::MapAsync { status, message }) => (status, message),
            Ok(other) => (
                MapAsyncStatus::Error,
                format!("unexpected {:?} completion", other.kind()),
            ),
            Err(reason) => (reason.map_status(), reason.message()),
        };
        if let Some(state) = self
            .objects
            .get_mut(ObjectType::Buffer, buffer)
            .and_then(ClientObject::buffer_mut)
        {
            if let Some(request) = state.pending_map().filter(|request| request.future == future) {
                state.map = if status == MapAsyncStatus::Success {
                    MapState::Mapped {
                        mode: request.mode,
                        offset: request.offset,
                        size: request.size,
                    }
                } else {
                    MapState::Unmapped
                };
            }
        }
        (status, message)
    }

    /// Copy of the mapped bytes in `offset..offset + size`.
    pub fn get_mapped_range(
        &self,
        buffer: Buffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, ClientError> {
        let state = self.buffer_state(buffer)?;
        let mode = mapped_mode(state, buffer.handle(), offset, size)?;
        let bytes = if mode == MapMode::READ {
            state
                .read_handle
                .as_ref()
                .ok_or(ClientError::NotMapped(buffer.handle()))?
                .read_range(offset, size)?
        } else {
            state
                .write_handle
                .as_ref()
                .ok_or(ClientError::NotMapped(buffer.handle()))?
                .read_range(offset, size)?
        };
        Ok(bytes)
    }

    /// Write into a write-mapped (or mapped-at-creation) range. Bytes reach the server on unmap.
    pub fn write_mapped_range(
        &mut self,
        buffer: Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let handle = buffer.handle();
        let state = buffer_mut(&mut self.objects, buffer)?;
        if mapped_mode(state, handle, offset, data.len() as u64)? != MapMode::WRITE {
            return Err(ClientError::NotWritable(handle));
        }
        state
            .write_handle
            .as_mut()
            .ok_or(ClientError::NotWritable(handle))?
            .write_range(offset, data)?;
        Ok(())
    }

    /// Unmap. A pending map is aborted; a write mapping is flushed to the server first.
    pub fn unmap(&mut self, buffer: Buffer) -> Result<(), ClientError> {
        self.end_mapping(buffer, "unmapped before mapping was resolved")?;
        self.serialize(WireCommand::BufferUnmap {
            buffer: buffer.handle(),
        });
        self.deliver_spontaneous();
        Ok(())
    }

    /// Destroy the buffer's storage. The identity stays alive until released. Like [`unmap`],
    /// written bytes of a write mapping reach the server before the destroy does.
    ///
    /// [`unmap`]: WireClient::unmap
    pub fn destroy_buffer(&mut self, buffer: Buffer) -> Result<(), ClientError> {
        buffer_mut(&mut self.objects, buffer)?.destroyed = true;
        self.end_mapping(buffer, "destroyed before mapping was resolved")?;
        self.serialize(WireCommand::BufferDestroy {
            buffer: buffer.handle(),
        });
        self.deliver_spontaneous();
        Ok(())
    }

    /// Leave the current map state: abort a pending map with `abort_message`, or serialize the
    /// data update of a write mapping.
    fn end_mapping(&mut self, buffer: Buffer, abort_message: &str) -> Result<(), ClientError> {
        let handle = buffer.handle();
        let state = buffer_mut(&mut self.objects, buffer)?;
        let map = std::mem::replace(&mut state.map, MapState::Unmapped);

        let mut update = None;
        match map {
            MapState::Pending(request) => {
                self.events.cancel(
                    request.future,
                    CancelReason::Aborted(abort_message.to_owned()),
                );
            }
            MapState::Mapped {
                mode,
                offset,
                size,
            } if mode == MapMode::WRITE => {
                update = flush_write(state, offset, size)?;
            }
            MapState::MappedAtCreation { size } => {
                update = flush_write(state, 0, size)?;
                if !state.usage.contains(BufferUsages::MAP_WRITE) {
                    state.write_handle = None;
                }
            }
            MapState::Mapped { .. } | MapState::Unmapped => {}
        }

        if let Some((offset, size, data)) = update {
            self.serialize(WireCommand::BufferUpdateMappedData {
                buffer: handle,
                offset,
                size,
                data,
            });
        }
        Ok(())
    }
}

fn buffer_mut(
    objects: &mut ObjectStore<ClientObject>,
    buffer: Buffer,
) -> Result<&mut BufferState, ClientError> {
    let unknown = ClientError::UnknownObject {
        object_type: ObjectType::Buffer,
        handle: buffer.handle(),
    };
    objects
        .get_mut(ObjectType::Buffer, buffer.handle())
        .and_then(ClientObject::buffer_mut)
        .ok_or(unknown)
}

/// Reason a map request is rejected without a round trip.
fn validate_map(state: &BufferState, mode: MapMode, offset: u64, size: u64) -> Option<&'static str> {
    if state.is_error {
        return Some("buffer is an error buffer");
    }
    if state.destroyed {
        return Some("buffer is destroyed");
    }
    match state.map {
        MapState::Pending(_) => return Some("buffer already has an outstanding map pending"),
        MapState::Mapped { .. } | MapState::MappedAtCreation { .. } => {
            return Some("buffer is already mapped")
        }
        MapState::Unmapped => {}
    }
    if mode == MapMode::READ {
        if !state.usage.contains(BufferUsages::MAP_READ) || state.read_handle.is_none() {
            return Some("buffer does not allow read mapping");
        }
    } else if mode == MapMode::WRITE {
        if !state.usage.contains(BufferUsages::MAP_WRITE) || state.write_handle.is_none() {
            return Some("buffer does not allow write mapping");
        }
    } else {
        return Some("map mode must be exactly READ or WRITE");
    }
    match offset.checked_add(size) {
        Some(end) if end <= state.size => None,
        _ => Some("mapped range is out of bounds"),
    }
}

/// Mode of the current mapping, checking that `offset..offset + size` lies inside it.
fn mapped_mode(
    state: &BufferState,
    handle: ObjectHandle,
    offset: u64,
    size: u64,
) -> Result<MapMode, ClientError> {
    let (mode, start, len) = match state.map {
        MapState::Mapped { mode, offset, size } => (mode, offset, size),
        MapState::MappedAtCreation { size } => (MapMode::WRITE, 0, size),
        MapState::Unmapped | MapState::Pending(_) => return Err(ClientError::NotMapped(handle)),
    };
    let inside = offset >= start
        && offset
            .checked_add(size)
            .is_some_and(|end| end <= start.saturating_add(len));
    if !inside {
        return Err(ClientError::OutsideMappedRange { offset, size });
    }
    Ok(mode)
}

fn flush_write(
    state: &BufferState,
    offset: u64,
    size: u64,
) -> Result<Option<(u64, u64, Vec<u8>)>, ClientError> {
    match state.write_handle.as_ref() {
        Some(handle) => Ok(Some((offset, size, handle.serialize_data_update(offset, size)?))),
        None => Ok(None),
    }
}
