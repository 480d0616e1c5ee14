//! Server side of the wire.
//!
//! [`WireServer`] decodes client commands, resolves every handle argument against its object
//! tables and forwards the call to a [`Procs`] backend. Backend completions come back through
//! [`Callback`]s over an `mpsc` channel and are serialized as return commands in the order they
//! are drained.

use std::sync::mpsc::{channel, Receiver, Sender};

use aero_wire_protocol::{FutureId, ObjectHandle, ObjectType, WireCommand};
use tracing::{debug, trace, warn};

use crate::error::{ObjectError, WireError};
use crate::memory_transfer::{ServerMemoryTransferService, ServerTransferService};
use crate::objects::ObjectStore;
use crate::transport::Transport;

mod buffer;
pub mod procs;
mod reply;

pub use procs::{
    Callback, DeviceCallbacks, Procs, RequestAdapterResult, RequestDeviceResult,
    UncapturedErrorSink,
};

use buffer::ServerBufferState;
use reply::ServerReply;

pub struct WireServerConfig {
    pub memory_transfer: Box<dyn ServerMemoryTransferService>,
}

impl Default for WireServerConfig {
    fn default() -> Self {
        Self {
            memory_transfer: Box::new(ServerTransferService::inline()),
        }
    }
}

impl std::fmt::Debug for WireServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireServerConfig").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) enum ServerObjectKind {
    Plain,
    Device { lost_future: FutureId },
    Buffer(ServerBufferState),
}

/// A server record. `backing` is `None` while an adapter or device request is outstanding.
#[derive(Debug)]
pub(crate) struct ServerObject<O> {
    pub backing: Option<O>,
    pub kind: ServerObjectKind,
}

impl<O> ServerObject<O> {
    fn allocated(backing: O) -> Self {
        Self {
            backing: Some(backing),
            kind: ServerObjectKind::Plain,
        }
    }

    fn awaiting(kind: ServerObjectKind) -> Self {
        Self {
            backing: None,
            kind,
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut ServerBufferState> {
        match &mut self.kind {
            ServerObjectKind::Buffer(state) => Some(state),
            _ => None,
        }
    }
}

pub struct WireServer<P: Procs> {
    procs: P,
    transport: Box<dyn Transport>,
    memory_transfer: Box<dyn ServerMemoryTransferService>,
    objects: ObjectStore<ServerObject<P::Object>>,
    replies_tx: Sender<ServerReply<P::Object>>,
    replies_rx: Receiver<ServerReply<P::Object>>,
    outgoing: Vec<u8>,
}

impl<P: Procs> WireServer<P> {
    pub fn new(procs: P, transport: Box<dyn Transport>, config: WireServerConfig) -> Self {
        let (replies_tx, replies_rx) = channel();
        Self {
            procs,
            transport,
            memory_transfer: config.memory_transfer,
            objects: ObjectStore::new(),
            replies_tx,
            replies_rx,
            outgoing: Vec::new(),
        }
    }

    pub fn procs(&self) -> &P {
        &self.procs
    }

    pub fn procs_mut(&mut self) -> &mut P {
        &mut self.procs
    }

    pub fn live_objects(&self) -> usize {
        self.objects.live_objects()
    }

    /// Serialized return bytes waiting for the next [`WireServer::flush`].
    pub fn pending_bytes(&self) -> usize {
        self.outgoing.len()
    }

    /// Send serialized return commands. Returns `false` if the transport is gone.
    pub fn flush(&mut self) -> bool {
        if self.outgoing.is_empty() {
            return true;
        }
        let bytes = std::mem::take(&mut self.outgoing);
        let sent = self.transport.send(&bytes);
        if !sent {
            warn!(len = bytes.len(), "transport closed while flushing returns");
        }
        sent
    }

    pub fn receive_pending(&mut self) -> Result<usize, WireError> {
        let mut handled = 0;
        while let Some(bytes) = self.transport.receive(None) {
            handled += self.handle_commands(&bytes)?;
        }
        Ok(handled)
    }

    /// Let the backend fire deferred callbacks and serialize their completions.
    pub fn process_events(&mut self) {
        self.procs.process_events();
        self.drain_replies();
    }

    /// Decode and apply a run of commands. The first invalid command stops the run; nothing of
    /// it is applied and the stream must be torn down.
    pub fn handle_commands(&mut self, bytes: &[u8]) -> Result<usize, WireError> {
        let mut pos = 0;
        while pos < bytes.len() {
            let (command, consumed) = WireCommand::decode(&bytes[pos..]).map_err(|err| {
                warn!(offset = pos, error = %err, "malformed command");
                WireError::from(err)
            })?;
            let name = command.name();
            trace!(command = name, "handle command");
            if let Err(err) = self.apply(command) {
                warn!(command = name, offset = pos, error = %err, "fatal command");
                return Err(err);
            }
            pos += consumed;
            self.drain_replies();
        }
        Ok(pos)
    }

    /// Resolve a handle argument to its backend object.
    fn resolve(
        &self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<P::Object, WireError> {
        let object = self.objects.lookup(object_type, handle)?;
        object.backing.clone().ok_or_else(|| {
            ObjectError::NotAllocated {
                object_type,
                handle,
            }
            .into()
        })
    }

    fn check_result(&self, object_type: ObjectType, handle: ObjectHandle) -> Result<(), WireError> {
        self.objects
            .table(object_type)
            .check_insert(handle)
            .map_err(ObjectError::from)?;
        Ok(())
    }

    fn insert(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
        object: ServerObject<P::Object>,
    ) -> Result<(), WireError> {
        self.objects
            .table_mut(object_type)
            .insert_at(handle, object)
            .map_err(ObjectError::from)?;
        Ok(())
    }

    /// Resolve `parent`, create a child through the backend and record it under `result`.
    fn create(
        &mut self,
        parent_type: ObjectType,
        parent: ObjectHandle,
        result_type: ObjectType,
        result: ObjectHandle,
        create: impl FnOnce(&mut P, &P::Object) -> P::Object,
    ) -> Result<(), WireError> {
        let parent = self.resolve(parent_type, parent)?;
        self.check_result(result_type, result)?;
        let object = create(&mut self.procs, &parent);
        self.insert(result_type, result, ServerObject::allocated(object))
    }

    fn apply(&mut self, command: WireCommand) -> Result<(), WireError> {
        match command {
            WireCommand::DestroyObject {
                object_type,
                handle,
            } => {
                if let Some(object) = self.objects.release(object_type, handle)? {
                    if let Some(backing) = object.backing {
                        self.procs.release(backing);
                    }
                }
                Ok(())
            }
            WireCommand::InstanceRequestAdapter {
                instance,
                future,
                adapter,
                options,
            } => {
                let instance = self.resolve(ObjectType::Instance, instance)?;
                let surface = if options.compatible_surface.is_null() {
                    None
                } else {
                    Some(self.resolve(ObjectType::Surface, options.compatible_surface)?)
                };
                self.insert(
                    ObjectType::Adapter,
                    adapter,
                    ServerObject::awaiting(ServerObjectKind::Plain),
                )?;
                let replies = self.replies_tx.clone();
                let callback = Callback::new(move |result| {
                    // A failed send means the server is gone.
                    let _ = replies.send(ServerReply::Adapter {
                        adapter,
                        future,
                        result,
                    });
                });
                self.procs
                    .instance_request_adapter(&instance, &options, surface.as_ref(), callback);
                Ok(())
            }
            WireCommand::AdapterRequestDevice {
                adapter,
                future,
                device_lost_future,
                device,
                queue,
                descriptor,
            } => {
                let adapter = self.resolve(ObjectType::Adapter, adapter)?;
                self.check_result(ObjectType::Device, device)?;
                self.check_result(ObjectType::Queue, queue)?;
                self.insert(
                    ObjectType::Device,
                    device,
                    ServerObject::awaiting(ServerObjectKind::Device {
                        lost_future: device_lost_future,
                    }),
                )?;
                self.insert(
                    ObjectType::Queue,
                    queue,
                    ServerObject::awaiting(ServerObjectKind::Plain),
                )?;

                let lost_replies = self.replies_tx.clone();
                let callbacks = DeviceCallbacks {
                    lost: Callback::new(move |(reason, message)| {
                        let _ = lost_replies.send(ServerReply::DeviceLost {
                            device,
                            future: device_lost_future,
                            reason,
                            message,
                        });
                    }),
                    uncaptured_error: UncapturedErrorSink::new(device, self.replies_tx.clone()),
                };
                let replies = self.replies_tx.clone();
                let callback = Callback::new(move |result| {
                    let _ = replies.send(ServerReply::Device {
                        device,
                        queue,
                        future,
                        result,
                    });
                });
                self.procs
                    .adapter_request_device(&adapter, &descriptor, callbacks, callback);
                Ok(())
            }
            WireCommand::DeviceCreateBuffer {
                device,
                result,
                descriptor,
                read_handle,
                write_handle,
            } => self.create_buffer(device, result, descriptor, read_handle, write_handle),
            WireCommand::DeviceCreateErrorBuffer {
                device,
                result,
                descriptor,
            } => self.create_error_buffer(device, result, descriptor),
            WireCommand::DeviceCreateTexture {
                device,
                result,
                descriptor,
            } => self.create(
                ObjectType::Device,
                device,
                ObjectType::Texture,
                result,
                |procs, device| procs.device_create_texture(device, &descriptor),
            ),
            WireCommand::TextureCreateView {
                texture,
                result,
                descriptor,
            } => self.create(
                ObjectType::Texture,
                texture,
                ObjectType::TextureView,
                result,
                |procs, texture| procs.texture_create_view(texture, &descriptor),
            ),
            WireCommand::DeviceCreateShaderModule {
                device,
                result,
                descriptor,
            } => self.create(
                ObjectType::Device,
                device,
                ObjectType::ShaderModule,
                result,
                |procs, device| procs.device_create_shader_module(device, &descriptor),
            ),
            WireCommand::DeviceCreateCommandEncoder {
                device,
                result,
                label,
            } => self.create(
                ObjectType::Device,
                device,
                ObjectType::CommandEncoder,
                result,
                |procs, device| procs.device_create_command_encoder(device, label.as_deref()),
            ),
            WireCommand::CommandEncoderCopyBufferToBuffer {
                encoder,
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => {
                let encoder = self.resolve(ObjectType::CommandEncoder, encoder)?;
                let source = self.resolve(ObjectType::Buffer, source)?;
                let destination = self.resolve(ObjectType::Buffer, destination)?;
                self.procs.command_encoder_copy_buffer_to_buffer(
                    &encoder,
                    &source,
                    source_offset,
                    &destination,
                    destination_offset,
                    size,
                );
                Ok(())
            }
            WireCommand::CommandEncoderFinish {
                encoder,
                result,
                label,
            } => self.create(
                ObjectType::CommandEncoder,
                encoder,
                ObjectType::CommandBuffer,
                result,
                |procs, encoder| procs.command_encoder_finish(encoder, label.as_deref()),
            ),
            WireCommand::QueueSubmit {
                queue,
                command_buffers,
            } => {
                let queue = self.resolve(ObjectType::Queue, queue)?;
                let command_buffers = command_buffers
                    .iter()
                    .map(|handle| self.resolve(ObjectType::CommandBuffer, *handle))
                    .collect::<Result<Vec<_>, _>>()?;
                self.procs.queue_submit(&queue, &command_buffers);
                Ok(())
            }
            WireCommand::QueueWriteBuffer {
                queue,
                buffer,
                offset,
                data,
            } => {
                let queue = self.resolve(ObjectType::Queue, queue)?;
                let buffer = self.resolve(ObjectType::Buffer, buffer)?;
                self.procs.queue_write_buffer(&queue, &buffer, offset, &data);
                Ok(())
            }
            WireCommand::QueueOnSubmittedWorkDone { queue, future } => {
                let queue = self.resolve(ObjectType::Queue, queue)?;
                let replies = self.replies_tx.clone();
                let callback = Callback::new(move |(status, message)| {
                    let _ = replies.send(ServerReply::WorkDone {
                        future,
                        status,
                        message,
                    });
                });
                self.procs.queue_on_submitted_work_done(&queue, callback);
                Ok(())
            }
            WireCommand::DevicePushErrorScope { device, filter } => {
                let device = self.resolve(ObjectType::Device, device)?;
                self.procs.device_push_error_scope(&device, filter);
                Ok(())
            }
            WireCommand::DevicePopErrorScope { device, future } => {
                let device = self.resolve(ObjectType::Device, device)?;
                let replies = self.replies_tx.clone();
                let callback = Callback::new(move |(status, error_type, message)| {
                    let _ = replies.send(ServerReply::PopErrorScope {
                        future,
                        status,
                        error_type,
                        message,
                    });
                });
                self.procs.device_pop_error_scope(&device, callback);
                Ok(())
            }
            WireCommand::DeviceDestroy { device } => {
                let device = self.resolve(ObjectType::Device, device)?;
                self.procs.device_destroy(&device);
                Ok(())
            }
            WireCommand::BufferMapAsync {
                buffer,
                future,
                mode,
                offset,
                size,
            } => self.map_async(buffer, future, mode, offset, size),
            WireCommand::BufferUpdateMappedData {
                buffer,
                offset,
                size,
                data,
            } => self.update_mapped_data(buffer, offset, size, &data),
            WireCommand::BufferUnmap { buffer } => self.unmap(buffer),
            WireCommand::BufferDestroy { buffer } => self.destroy_buffer(buffer),
        }
    }

    /// Bind an embedder-created object to a client-reserved identity. Forwards one
    /// [`Procs::add_ref`] on success; the client's later release forwards one [`Procs::release`].
    fn inject(
        &mut self,
        object_type: ObjectType,
        object: P::Object,
        handle: ObjectHandle,
        parent: Option<(ObjectType, ObjectHandle)>,
        kind: ServerObjectKind,
    ) -> bool {
        if let Some((parent_type, parent)) = parent {
            if self.resolve(parent_type, parent).is_err() {
                debug!(%object_type, %handle, %parent, "injection parent is not live");
                return false;
            }
        }
        let record = ServerObject {
            backing: Some(object.clone()),
            kind,
        };
        match self.objects.table_mut(object_type).insert_at(handle, record) {
            Ok(()) => {
                self.procs.add_ref(&object);
                debug!(%object_type, %handle, "injected object");
                true
            }
            Err(err) => {
                debug!(%object_type, %handle, error = %err, "injection rejected");
                false
            }
        }
    }

    pub fn inject_instance(&mut self, instance: P::Object, handle: ObjectHandle) -> bool {
        self.inject(
            ObjectType::Instance,
            instance,
            handle,
            None,
            ServerObjectKind::Plain,
        )
    }

    pub fn inject_surface(
        &mut self,
        surface: P::Object,
        handle: ObjectHandle,
        instance: ObjectHandle,
    ) -> bool {
        self.inject(
            ObjectType::Surface,
            surface,
            handle,
            Some((ObjectType::Instance, instance)),
            ServerObjectKind::Plain,
        )
    }

    pub fn inject_texture(
        &mut self,
        texture: P::Object,
        handle: ObjectHandle,
        device: ObjectHandle,
    ) -> bool {
        self.inject(
            ObjectType::Texture,
            texture,
            handle,
            Some((ObjectType::Device, device)),
            ServerObjectKind::Plain,
        )
    }

    /// Injected buffers have no memory-transfer handles.
    pub fn inject_buffer(
        &mut self,
        buffer: P::Object,
        handle: ObjectHandle,
        device: ObjectHandle,
    ) -> bool {
        self.inject(
            ObjectType::Buffer,
            buffer,
            handle,
            Some((ObjectType::Device, device)),
            ServerObjectKind::Buffer(ServerBufferState::default()),
        )
    }

    fn backing(&self, object_type: ObjectType, handle: ObjectHandle) -> Option<&P::Object> {
        self.objects
            .get(object_type, handle)
            .and_then(|object| object.backing.as_ref())
    }

    pub fn instance(&self, handle: ObjectHandle) -> Option<&P::Object> {
        self.backing(ObjectType::Instance, handle)
    }

    pub fn surface(&self, handle: ObjectHandle) -> Option<&P::Object> {
        self.backing(ObjectType::Surface, handle)
    }

    pub fn device(&self, handle: ObjectHandle) -> Option<&P::Object> {
        self.backing(ObjectType::Device, handle)
    }

    pub fn buffer(&self, handle: ObjectHandle) -> Option<&P::Object> {
        self.backing(ObjectType::Buffer, handle)
    }

    pub fn texture(&self, handle: ObjectHandle) -> Option<&P::Object> {
        self.backing(ObjectType::Texture, handle)
    }

    /// Live, allocated devices in ascending id order.
    pub fn devices(&self) -> impl Iterator<Item = (ObjectHandle, &P::Object)> + '_ {
        self.objects
            .table(ObjectType::Device)
            .iter()
            .filter_map(|(handle, object)| object.backing.as_ref().map(|backing| (handle, backing)))
    }

    /// Device-lost future registered for `device` by the client.
    pub fn device_lost_future(&self, device: ObjectHandle) -> Option<FutureId> {
        match self.objects.get(ObjectType::Device, device)?.kind {
            ServerObjectKind::Device { lost_future } => Some(lost_future),
            _ => None,
        }
    }
}

impl<P: Procs> Drop for WireServer<P> {
    fn drop(&mut self) {
        // Children before parents: ObjectType::ALL lists roots first.
        for object_type in ObjectType::ALL.into_iter().rev() {
            let table = self.objects.table_mut(object_type);
            for handle in table.handles() {
                if let Some(backing) = table.remove(handle).and_then(|object| object.backing) {
                    self.procs.release(backing);
                }
            }
        }
    }
}

impl<P: Procs + std::fmt::Debug> std::fmt::Debug for WireServer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireServer")
            .field("procs", &self.procs)
            .field("objects", &self.objects.live_objects())
            .field("pending_bytes", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}
