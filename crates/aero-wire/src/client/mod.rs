//! Client side of the wire.
//!
//! [`WireClient`] mints object handles, serializes API calls into an outgoing buffer, and turns
//! server completions into callback deliveries through its [`EventManager`]. Nothing here blocks
//! except [`WireClient::wait_any`].

use std::time::{Duration, Instant};

use aero_wire_protocol::{
    BufferDescriptor, FutureId, ObjectHandle, ObjectType, ReturnCommand, WireCommand,
};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, WireError};
use crate::memory_transfer::{ClientMemoryTransferService, InlineMemoryTransferService};
use crate::objects::ObjectStore;
use crate::transport::Transport;

mod api;
mod buffer;
pub mod callback;
pub mod event;
pub mod objects;

pub use buffer::BufferMapState;
pub use callback::{
    DeviceCallbacks, DeviceLostCallbackInfo, MapAsyncCallbackInfo, PopErrorScopeCallbackInfo,
    QueueWorkDoneCallbackInfo, RequestAdapterCallbackInfo, RequestDeviceCallbackInfo,
};
pub use event::{CallbackMode, CancelReason, EventManager};
pub use objects::{
    Adapter, Buffer, CommandBuffer, CommandEncoder, Device, Instance, Queue, ShaderModule, Surface,
    Texture, TextureView, WireObject,
};

use event::EventPayload;
use objects::{BufferState, ClientObject, ClientObjectKind, MapState};

pub const DEFAULT_MAX_ALLOCATION_SIZE: u64 = 1 << 30;

pub struct WireClientConfig {
    pub memory_transfer: Box<dyn ClientMemoryTransferService>,
    /// Buffers larger than this are created as error buffers.
    pub max_allocation_size: u64,
}

impl Default for WireClientConfig {
    fn default() -> Self {
        Self {
            memory_transfer: Box::new(InlineMemoryTransferService::new()),
            max_allocation_size: DEFAULT_MAX_ALLOCATION_SIZE,
        }
    }
}

impl std::fmt::Debug for WireClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClientConfig")
            .field("max_allocation_size", &self.max_allocation_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutureWaitInfo {
    pub future: FutureId,
    pub completed: bool,
}

impl FutureWaitInfo {
    pub fn new(future: FutureId) -> Self {
        Self {
            future,
            completed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one future completed and had its callback delivered.
    Success,
    TimedOut,
    /// A null future was passed, or the incoming stream failed to decode.
    Error,
}

/// Identity reserved for an object the server embedder creates and injects itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedBuffer {
    pub buffer: Buffer,
    pub handle: ObjectHandle,
    pub device: ObjectHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedTexture {
    pub texture: Texture,
    pub handle: ObjectHandle,
    pub device: ObjectHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedSurface {
    pub surface: Surface,
    pub handle: ObjectHandle,
    pub instance: ObjectHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedInstance {
    pub instance: Instance,
    pub handle: ObjectHandle,
}

pub struct WireClient {
    transport: Box<dyn Transport>,
    memory_transfer: Box<dyn ClientMemoryTransferService>,
    max_allocation_size: u64,
    objects: ObjectStore<ClientObject>,
    events: EventManager<WireClient>,
    outgoing: Vec<u8>,
    disconnected: bool,
    delivering: bool,
}

impl WireClient {
    pub fn new(transport: Box<dyn Transport>, config: WireClientConfig) -> Self {
        Self {
            transport,
            memory_transfer: config.memory_transfer,
            max_allocation_size: config.max_allocation_size,
            objects: ObjectStore::new(),
            events: EventManager::new(),
            outgoing: Vec::new(),
            disconnected: false,
            delivering: false,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Serialized bytes waiting for the next [`WireClient::flush`].
    pub fn pending_bytes(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of futures not yet delivered.
    pub fn outstanding_futures(&self) -> usize {
        self.events.len()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.live_objects()
    }

    fn serialize(&mut self, command: WireCommand) {
        if self.disconnected {
            return;
        }
        trace!(command = command.name(), "serialize");
        command.encode_into(&mut self.outgoing);
    }

    /// Send everything serialized so far. Returns `false` (and disconnects) if the transport is
    /// gone.
    pub fn flush(&mut self) -> bool {
        if self.disconnected {
            self.outgoing.clear();
            return false;
        }
        if self.outgoing.is_empty() {
            return true;
        }
        let bytes = std::mem::take(&mut self.outgoing);
        if self.transport.send(&bytes) {
            return true;
        }
        warn!(len = bytes.len(), "transport closed while flushing");
        self.disconnect();
        false
    }

    /// Handle every run the transport has already received.
    pub fn receive_pending(&mut self) -> Result<usize, WireError> {
        let mut handled = 0;
        while let Some(bytes) = self.transport.receive(None) {
            handled += self.handle_commands(&bytes)?;
        }
        Ok(handled)
    }

    /// Decode and apply a run of return commands. Spontaneous callbacks fire between commands.
    pub fn handle_commands(&mut self, bytes: &[u8]) -> Result<usize, WireError> {
        if self.disconnected {
            debug!(len = bytes.len(), "ignoring return commands after disconnect");
            return Ok(bytes.len());
        }
        let mut pos = 0;
        while pos < bytes.len() {
            let (command, consumed) = ReturnCommand::decode(&bytes[pos..]).map_err(|err| {
                warn!(offset = pos, error = %err, "malformed return command");
                WireError::from(err)
            })?;
            trace!(command = command.name(), "handle return command");
            if let Err(err) = self.handle_return(command) {
                warn!(offset = pos, error = %err, "fatal return command");
                return Err(err);
            }
            pos += consumed;
            self.deliver_spontaneous();
        }
        Ok(pos)
    }

    fn handle_return(&mut self, command: ReturnCommand) -> Result<(), WireError> {
        let name = command.name();
        match command {
            ReturnCommand::InstanceRequestAdapterCallback {
                future,
                status,
                message,
                info,
                features,
            } => self.complete(
                name,
                future,
                EventPayload::RequestAdapter {
                    status,
                    message,
                    info,
                    features,
                },
            ),
            ReturnCommand::AdapterRequestDeviceCallback {
                future,
                status,
                message,
                features,
            } => self.complete(
                name,
                future,
                EventPayload::RequestDevice {
                    status,
                    message,
                    features,
                },
            ),
            ReturnCommand::BufferMapAsyncCallback {
                buffer,
                future,
                status,
                message,
                read_data,
            } => self.on_map_completion(buffer, future, status, message, &read_data),
            ReturnCommand::QueueWorkDoneCallback {
                future,
                status,
                message,
            } => self.complete(name, future, EventPayload::WorkDone { status, message }),
            ReturnCommand::DevicePopErrorScopeCallback {
                future,
                status,
                error_type,
                message,
            } => self.complete(
                name,
                future,
                EventPayload::PopErrorScope {
                    status,
                    error_type,
                    message,
                },
            ),
            ReturnCommand::DeviceLostCallback {
                device,
                future,
                reason,
                message,
            } => {
                let Some(state) = self
                    .objects
                    .get_mut(ObjectType::Device, device)
                    .and_then(ClientObject::device_mut)
                else {
                    debug!(%device, "device lost for a released device");
                    return Ok(());
                };
                if state.lost_future != future {
                    return Err(WireError::Protocol {
                        command: name,
                        reason: "future does not belong to the device",
                    });
                }
                state.lost = true;
                debug!(%device, ?reason, "device lost");
                self.abort_device_maps(device, "device was lost before mapping was resolved");
                self.complete(name, future, EventPayload::DeviceLost { reason, message })
            }
            ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                error_type,
                message,
            } => {
                let callback = self
                    .objects
                    .get_mut(ObjectType::Device, device)
                    .and_then(ClientObject::device_mut)
                    .and_then(|state| state.uncaptured_error.as_mut());
                match callback {
                    Some(callback) => callback(Device::from_handle(device), error_type, &message),
                    None => debug!(%device, ?error_type, "dropping uncaptured error"),
                }
                Ok(())
            }
        }
    }

    /// Ready `future` with `payload` unless it was already resolved or cancelled.
    fn complete(
        &mut self,
        command: &'static str,
        future: FutureId,
        payload: EventPayload,
    ) -> Result<(), WireError> {
        match self.events.kind(future) {
            Some(kind) if kind != payload.kind() => Err(WireError::Protocol {
                command,
                reason: "completion does not match the future's operation",
            }),
            _ => {
                if !self.events.mark_ready(future, payload) {
                    debug!(future = future.0, command, "discarding stale completion");
                }
                Ok(())
            }
        }
    }

    fn deliver(&mut self, id: FutureId) -> bool {
        match self.events.take(id) {
            Some((deliver, resolution)) => {
                deliver(self, id, resolution);
                true
            }
            None => false,
        }
    }

    /// Deliver spontaneous futures, or every resolved future once disconnected.
    fn deliver_spontaneous(&mut self) {
        if self.delivering {
            return;
        }
        self.delivering = true;
        loop {
            let next = if self.disconnected {
                self.events.all_resolved().first().copied()
            } else {
                self.events.next_spontaneous()
            };
            let Some(id) = next else { break };
            self.deliver(id);
        }
        self.delivering = false;
    }

    /// Deliver resolved futures whose mode allows `process_events`. Futures readied by those
    /// callbacks wait for the next call.
    pub fn process_events(&mut self) {
        for id in self.events.process_events_batch() {
            self.deliver(id);
        }
    }

    /// Block until at least one of `futures` completes or `timeout` elapses, pumping the transport
    /// meanwhile. Completed entries get `completed = true` and their callbacks run in any mode.
    pub fn wait_any(&mut self, futures: &mut [FutureWaitInfo], timeout: Duration) -> WaitStatus {
        if futures.iter().any(|info| info.future.is_null()) {
            return WaitStatus::Error;
        }
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let mut any = false;
            for info in futures.iter_mut() {
                if !self.events.is_tracked(info.future) {
                    info.completed = true;
                    any = true;
                } else if self.events.is_resolved(info.future) {
                    self.deliver(info.future);
                    info.completed = true;
                    any = true;
                }
            }
            if any {
                self.deliver_spontaneous();
                return WaitStatus::Success;
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            let received = if remaining.is_zero() {
                self.transport.receive(None)
            } else {
                self.transport.receive(Some(remaining))
            };
            match received {
                Some(bytes) => {
                    if self.handle_commands(&bytes).is_err() {
                        return WaitStatus::Error;
                    }
                }
                None if remaining.is_zero() => return WaitStatus::TimedOut,
                None => {}
            }
        }
    }

    /// Terminal and idempotent: drop pending output, deliver every outstanding future with
    /// [`CancelReason::Dropped`], and cancel every future created afterwards at creation.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        debug!(outstanding = self.events.len(), "wire client disconnected");
        self.disconnected = true;
        self.outgoing.clear();
        self.events.drop_all();
        self.deliver_spontaneous();
    }

    fn require(
        &self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<&ClientObject, ClientError> {
        self.objects
            .get(object_type, handle)
            .ok_or(ClientError::UnknownObject {
                object_type,
                handle,
            })
    }

    /// Mint a client identity for `object`.
    fn reserve(
        &mut self,
        object_type: ObjectType,
        object: ClientObject,
    ) -> Result<ObjectHandle, ClientError> {
        self.objects
            .table_mut(object_type)
            .reserve(object)
            .ok_or(ClientError::IdSpaceExhausted(object_type))
    }

    fn require_mut(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<&mut ClientObject, ClientError> {
        self.objects
            .get_mut(object_type, handle)
            .ok_or(ClientError::UnknownObject {
                object_type,
                handle,
            })
    }

    pub fn add_ref<O: WireObject>(&mut self, object: O) -> Result<(), ClientError> {
        let handle = object.handle();
        self.objects
            .table_mut(O::TYPE)
            .add_ref(handle)
            .map(|_| ())
            .map_err(|_| ClientError::UnknownObject {
                object_type: O::TYPE,
                handle,
            })
    }

    /// Drop one reference. The last release cancels the object's outstanding futures with
    /// [`CancelReason::CallbackCancelled`] and tells the server to drop the object.
    pub fn release<O: WireObject>(&mut self, object: O) -> Result<(), ClientError> {
        self.release_handle(O::TYPE, object.handle())?;
        self.deliver_spontaneous();
        Ok(())
    }

    fn release_handle(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<(), ClientError> {
        let freed = match self.objects.release(object_type, handle) {
            Ok(freed) => freed,
            Err(_) if self.disconnected => {
                debug!(%object_type, %handle, "ignoring release after disconnect");
                return Ok(());
            }
            Err(_) => {
                return Err(ClientError::UnknownObject {
                    object_type,
                    handle,
                })
            }
        };
        if let Some(object) = freed {
            self.events
                .cancel_owned_by((object_type, handle), CancelReason::CallbackCancelled);
            self.serialize(WireCommand::DestroyObject {
                object_type,
                handle,
            });
            self.drop_children(object);
        }
        Ok(())
    }

    /// Remove a reservation the server never turned into a live object and let the server free
    /// the identity as well.
    fn discard_reservation(&mut self, object_type: ObjectType, handle: ObjectHandle) {
        if let Some(object) = self.objects.table_mut(object_type).remove(handle) {
            self.serialize(WireCommand::DestroyObject {
                object_type,
                handle,
            });
            self.drop_children(object);
        }
    }

    /// A device holds one reference on its queue.
    fn drop_children(&mut self, object: ClientObject) {
        if let ClientObjectKind::Device(device) = object.kind {
            if self.release_handle(ObjectType::Queue, device.queue).is_err() {
                debug!(queue = %device.queue, "device queue already released");
            }
        }
    }

    /// Cancel pending maps of every buffer created from `device`.
    fn abort_device_maps(&mut self, device: ObjectHandle, message: &str) {
        let mut aborted = Vec::new();
        for (_, object) in self.objects.table_mut(ObjectType::Buffer).iter_mut() {
            if object.parent != device {
                continue;
            }
            if let Some(buffer) = object.buffer_mut() {
                if let MapState::Pending(request) = buffer.map {
                    buffer.map = MapState::Unmapped;
                    aborted.push(request.future);
                }
            }
        }
        for future in aborted {
            self.events
                .cancel(future, CancelReason::Aborted(message.to_owned()));
        }
    }

    pub fn reserve_instance(&mut self) -> Result<ReservedInstance, ClientError> {
        let handle = self.reserve(ObjectType::Instance, ClientObject::plain(ObjectHandle::NULL))?;
        Ok(ReservedInstance {
            instance: Instance::from_handle(handle),
            handle,
        })
    }

    pub fn reserve_surface(&mut self, instance: Instance) -> Result<ReservedSurface, ClientError> {
        self.require(ObjectType::Instance, instance.handle())?;
        let handle = self.reserve(ObjectType::Surface, ClientObject::plain(instance.handle()))?;
        Ok(ReservedSurface {
            surface: Surface::from_handle(handle),
            handle,
            instance: instance.handle(),
        })
    }

    pub fn reserve_texture(&mut self, device: Device) -> Result<ReservedTexture, ClientError> {
        self.require(ObjectType::Device, device.handle())?;
        let handle = self.reserve(ObjectType::Texture, ClientObject::plain(device.handle()))?;
        Ok(ReservedTexture {
            texture: Texture::from_handle(handle),
            handle,
            device: device.handle(),
        })
    }

    /// Reserve a buffer identity. The buffer has no memory-transfer handles, so mapping it fails
    /// locally.
    pub fn reserve_buffer(
        &mut self,
        device: Device,
        descriptor: &BufferDescriptor,
    ) -> Result<ReservedBuffer, ClientError> {
        self.require(ObjectType::Device, device.handle())?;
        let handle = self.reserve(
            ObjectType::Buffer,
            ClientObject {
                parent: device.handle(),
                kind: ClientObjectKind::Buffer(BufferState::reserved(
                    descriptor.size,
                    descriptor.usage,
                )),
            },
        )?;
        Ok(ReservedBuffer {
            buffer: Buffer::from_handle(handle),
            handle,
            device: device.handle(),
        })
    }

    /// Give back a reservation that was never injected on the server. Nothing is sent.
    pub fn reclaim_instance_reservation(&mut self, reservation: ReservedInstance) {
        self.objects
            .table_mut(ObjectType::Instance)
            .remove(reservation.handle);
    }

    pub fn reclaim_surface_reservation(&mut self, reservation: ReservedSurface) {
        self.objects
            .table_mut(ObjectType::Surface)
            .remove(reservation.handle);
    }

    pub fn reclaim_texture_reservation(&mut self, reservation: ReservedTexture) {
        self.objects
            .table_mut(ObjectType::Texture)
            .remove(reservation.handle);
    }

    pub fn reclaim_buffer_reservation(&mut self, reservation: ReservedBuffer) {
        self.objects
            .table_mut(ObjectType::Buffer)
            .remove(reservation.handle);
    }
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("objects", &self.objects.live_objects())
            .field("futures", &self.events.len())
            .field("pending_bytes", &self.outgoing.len())
            .field("disconnected", &self.disconnected)
            .finish_non_exhaustive()
    }
}
