use aero_wire_protocol::{
    AdapterInfo, DeviceDescriptor, DeviceLostReason, ErrorFilter, ErrorType, FutureId,
    ObjectHandle, ObjectType, PopErrorScopeStatus, QueueWorkDoneStatus, RequestAdapterOptions,
    RequestAdapterStatus, RequestDeviceStatus, ShaderModuleDescriptor, TextureDescriptor,
    TextureViewDescriptor, WireCommand,
};

use super::callback::{
    DeviceCallbacks, DeviceLostCallbackInfo, PopErrorScopeCallbackInfo, QueueWorkDoneCallbackInfo,
    RequestAdapterCallbackInfo, RequestDeviceCallbackInfo,
};
use super::event::{EventKind, EventPayload, Resolution};
use super::objects::{
    Adapter, AdapterState, Buffer, ClientObject, ClientObjectKind, CommandBuffer, CommandEncoder,
    Device, DeviceState, Instance, Queue, ShaderModule, Texture, TextureView, WireObject,
};
use super::WireClient;
use crate::error::ClientError;

impl WireClient {
    /// Reserve a child of `parent` and serialize the command creating it.
    fn create_child(
        &mut self,
        child: ObjectType,
        parent_type: ObjectType,
        parent: ObjectHandle,
        command: impl FnOnce(ObjectHandle) -> WireCommand,
    ) -> Result<ObjectHandle, ClientError> {
        self.require(parent_type, parent)?;
        let result = self.reserve(child, ClientObject::plain(parent))?;
        self.serialize(command(result));
        Ok(result)
    }

    fn require_all<O: WireObject>(&self, objects: &[O]) -> Result<(), ClientError> {
        for object in objects {
            self.require(O::TYPE, object.handle())?;
        }
        Ok(())
    }

    pub fn request_adapter(
        &mut self,
        instance: Instance,
        options: &RequestAdapterOptions,
        callback: RequestAdapterCallbackInfo,
    ) -> Result<FutureId, ClientError> {
        self.require(ObjectType::Instance, instance.handle())?;
        if !options.compatible_surface.is_null() {
            self.require(ObjectType::Surface, options.compatible_surface)?;
        }
        let adapter = self.reserve(
            ObjectType::Adapter,
            ClientObject {
                parent: instance.handle(),
                kind: ClientObjectKind::Adapter(AdapterState::default()),
            },
        )?;

        let RequestAdapterCallbackInfo { mode, callback } = callback;
        let future = self.events.track(
            mode,
            EventKind::RequestAdapter,
            Some((ObjectType::Instance, instance.handle())),
            Box::new(move |client: &mut WireClient, _: FutureId, resolution: Resolution| {
                let (status, message, adapter) = client.finish_request_adapter(adapter, resolution);
                callback(client, status, adapter, message);
            }),
        );
        self.serialize(WireCommand::InstanceRequestAdapter {
            instance: instance.handle(),
            future,
            adapter,
            options: options.clone(),
        });
        self.deliver_spontaneous();
        Ok(future)
    }

    fn finish_request_adapter(
        &mut self,
        handle: ObjectHandle,
        resolution: Resolution,
    ) -> (RequestAdapterStatus, String, Option<Adapter>) {
        let (status, message, info, features) = match resolution {
            Ok(EventPayload::RequestAdapter {
                status,
                message,
                info,
                features,
            }) => (status, message, info, features),
            Ok(other) => (
                RequestAdapterStatus::Error,
                format!("unexpected {:?} completion", other.kind()),
                AdapterInfo::default(),
                Vec::new(),
            ),
            Err(reason) => (
                reason.request_adapter_status(),
                reason.message(),
                AdapterInfo::default(),
                Vec::new(),
            ),
        };
        if status == RequestAdapterStatus::Success {
            if let Some(object) = self.objects.get_mut(ObjectType::Adapter, handle) {
                object.kind = ClientObjectKind::Adapter(AdapterState { info, features });
                return (status, message, Some(Adapter::from_handle(handle)));
            }
        }
        self.discard_reservation(ObjectType::Adapter, handle);
        (status, message, None)
    }

    /// Request a device and its queue. The device-lost callback in `callbacks` fires exactly once
    /// for the device, including with [`DeviceLostReason::FailedCreation`] if the request fails.
    pub fn request_device(
        &mut self,
        adapter: Adapter,
        descriptor: &DeviceDescriptor,
        callbacks: DeviceCallbacks,
        callback: RequestDeviceCallbackInfo,
    ) -> Result<FutureId, ClientError> {
        self.require(ObjectType::Adapter, adapter.handle())?;
        let DeviceCallbacks {
            lost,
            uncaptured_error,
        } = callbacks;

        let device = self.reserve(
            ObjectType::Device,
            ClientObject {
                parent: adapter.handle(),
                kind: ClientObjectKind::Device(DeviceState {
                    queue: ObjectHandle::NULL,
                    lost_future: FutureId::NULL,
                    lost: false,
                    features: Vec::new(),
                    uncaptured_error,
                }),
            },
        )?;
        let queue = match self.reserve(ObjectType::Queue, ClientObject::plain(device)) {
            Ok(queue) => queue,
            Err(err) => {
                self.objects.table_mut(ObjectType::Device).remove(device);
                return Err(err);
            }
        };

        let DeviceLostCallbackInfo {
            mode: lost_mode,
            callback: lost_callback,
        } = lost;
        let lost_future = self.events.track(
            lost_mode,
            EventKind::DeviceLost,
            Some((ObjectType::Device, device)),
            Box::new(move |client: &mut WireClient, _: FutureId, resolution: Resolution| {
                let (reason, message) = match resolution {
                    Ok(EventPayload::DeviceLost { reason, message }) => (reason, message),
                    Ok(other) => (
                        DeviceLostReason::Unknown,
                        format!("unexpected {:?} completion", other.kind()),
                    ),
                    Err(reason) => (reason.device_lost_reason(), reason.message()),
                };
                lost_callback(client, Device::from_handle(device), reason, message);
            }),
        );
        if let Some(state) = self
            .objects
            .get_mut(ObjectType::Device, device)
            .and_then(ClientObject::device_mut)
        {
            state.queue = queue;
            state.lost_future = lost_future;
        }

        let RequestDeviceCallbackInfo { mode, callback } = callback;
        let future = self.events.track(
            mode,
            EventKind::RequestDevice,
            Some((ObjectType::Adapter, adapter.handle())),
            Box::new(move |client: &mut WireClient, _: FutureId, resolution: Resolution| {
                let (status, message, device) = client.finish_request_device(device, resolution);
                callback(client, status, device, message);
            }),
        );
        self.serialize(WireCommand::AdapterRequestDevice {
            adapter: adapter.handle(),
            future,
            device_lost_future: lost_future,
            device,
            queue,
            descriptor: descriptor.clone(),
        });
        self.deliver_spontaneous();
        Ok(future)
    }

    fn finish_request_device(
        &mut self,
        handle: ObjectHandle,
        resolution: Resolution,
    ) -> (RequestDeviceStatus, String, Option<Device>) {
        let (status, message, features) = match resolution {
            Ok(EventPayload::RequestDevice {
                status,
                message,
                features,
            }) => (status, message, features),
            Ok(other) => (
                RequestDeviceStatus::Error,
                format!("unexpected {:?} completion", other.kind()),
                Vec::new(),
            ),
            Err(reason) => (reason.request_device_status(), reason.message(), Vec::new()),
        };
        let Some(state) = self
            .objects
            .get_mut(ObjectType::Device, handle)
            .and_then(ClientObject::device_mut)
        else {
            return (status, message, None);
        };
        if status == RequestDeviceStatus::Success {
            state.features = features;
            return (status, message, Some(Device::from_handle(handle)));
        }

        let lost_future = state.lost_future;
        self.events.mark_ready(
            lost_future,
            EventPayload::DeviceLost {
                reason: DeviceLostReason::FailedCreation,
                message: message.clone(),
            },
        );
        self.discard_reservation(ObjectType::Device, handle);
        (status, message, None)
    }

    pub fn adapter_info(&self, adapter: Adapter) -> Result<AdapterInfo, ClientError> {
        Ok(self
            .require(ObjectType::Adapter, adapter.handle())?
            .adapter()
            .map(|state| state.info.clone())
            .unwrap_or_default())
    }

    pub fn adapter_features(&self, adapter: Adapter) -> Result<Vec<u32>, ClientError> {
        Ok(self
            .require(ObjectType::Adapter, adapter.handle())?
            .adapter()
            .map(|state| state.features.clone())
            .unwrap_or_default())
    }

    pub fn device_features(&self, device: Device) -> Result<Vec<u32>, ClientError> {
        Ok(self
            .require(ObjectType::Device, device.handle())?
            .device()
            .map(|state| state.features.clone())
            .unwrap_or_default())
    }

    pub fn is_device_lost(&self, device: Device) -> Result<bool, ClientError> {
        Ok(self
            .require(ObjectType::Device, device.handle())?
            .device()
            .is_some_and(|state| state.lost))
    }

    /// The device's queue, with a new reference the caller must release.
    pub fn device_queue(&mut self, device: Device) -> Result<Queue, ClientError> {
        let queue = self
            .require(ObjectType::Device, device.handle())?
            .device()
            .map(|state| state.queue)
            .unwrap_or_default();
        self.add_ref(Queue::from_handle(queue))?;
        Ok(Queue::from_handle(queue))
    }

    pub fn destroy_device(&mut self, device: Device) -> Result<(), ClientError> {
        self.require(ObjectType::Device, device.handle())?;
        self.serialize(WireCommand::DeviceDestroy {
            device: device.handle(),
        });
        Ok(())
    }

    pub fn create_texture(
        &mut self,
        device: Device,
        descriptor: &TextureDescriptor,
    ) -> Result<Texture, ClientError> {
        let descriptor = descriptor.clone();
        self.create_child(
            ObjectType::Texture,
            ObjectType::Device,
            device.handle(),
            |result| WireCommand::DeviceCreateTexture {
                device: device.handle(),
                result,
                descriptor,
            },
        )
        .map(Texture::from_handle)
    }

    pub fn create_view(
        &mut self,
        texture: Texture,
        descriptor: &TextureViewDescriptor,
    ) -> Result<TextureView, ClientError> {
        let descriptor = descriptor.clone();
        self.create_child(
            ObjectType::TextureView,
            ObjectType::Texture,
            texture.handle(),
            |result| WireCommand::TextureCreateView {
                texture: texture.handle(),
                result,
                descriptor,
            },
        )
        .map(TextureView::from_handle)
    }

    pub fn create_shader_module(
        &mut self,
        device: Device,
        descriptor: &ShaderModuleDescriptor,
    ) -> Result<ShaderModule, ClientError> {
        let descriptor = descriptor.clone();
        self.create_child(
            ObjectType::ShaderModule,
            ObjectType::Device,
            device.handle(),
            |result| WireCommand::DeviceCreateShaderModule {
                device: device.handle(),
                result,
                descriptor,
            },
        )
        .map(ShaderModule::from_handle)
    }

    pub fn create_command_encoder(
        &mut self,
        device: Device,
        label: Option<&str>,
    ) -> Result<CommandEncoder, ClientError> {
        let label = label.map(str::to_owned);
        self.create_child(
            ObjectType::CommandEncoder,
            ObjectType::Device,
            device.handle(),
            |result| WireCommand::DeviceCreateCommandEncoder {
                device: device.handle(),
                result,
                label,
            },
        )
        .map(CommandEncoder::from_handle)
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        encoder: CommandEncoder,
        source: Buffer,
        source_offset: u64,
        destination: Buffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), ClientError> {
        self.require(ObjectType::CommandEncoder, encoder.handle())?;
        self.require_all(&[source, destination])?;
        self.serialize(WireCommand::CommandEncoderCopyBufferToBuffer {
            encoder: encoder.handle(),
            source: source.handle(),
            source_offset,
            destination: destination.handle(),
            destination_offset,
            size,
        });
        Ok(())
    }

    pub fn finish(
        &mut self,
        encoder: CommandEncoder,
        label: Option<&str>,
    ) -> Result<CommandBuffer, ClientError> {
        let label = label.map(str::to_owned);
        self.create_child(
            ObjectType::CommandBuffer,
            ObjectType::CommandEncoder,
            encoder.handle(),
            |result| WireCommand::CommandEncoderFinish {
                encoder: encoder.handle(),
                result,
                label,
            },
        )
        .map(CommandBuffer::from_handle)
    }

    pub fn queue_submit(
        &mut self,
        queue: Queue,
        command_buffers: &[CommandBuffer],
    ) -> Result<(), ClientError> {
        self.require(ObjectType::Queue, queue.handle())?;
        self.require_all(command_buffers)?;
        self.serialize(WireCommand::QueueSubmit {
            queue: queue.handle(),
            command_buffers: command_buffers.iter().map(CommandBuffer::handle).collect(),
        });
        Ok(())
    }

    pub fn queue_write_buffer(
        &mut self,
        queue: Queue,
        buffer: Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ClientError> {
        self.require(ObjectType::Queue, queue.handle())?;
        self.require(ObjectType::Buffer, buffer.handle())?;
        self.serialize(WireCommand::QueueWriteBuffer {
            queue: queue.handle(),
            buffer: buffer.handle(),
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub fn on_submitted_work_done(
        &mut self,
        queue: Queue,
        callback: QueueWorkDoneCallbackInfo,
    ) -> Result<FutureId, ClientError> {
        self.require(ObjectType::Queue, queue.handle())?;
        let QueueWorkDoneCallbackInfo { mode, callback } = callback;
        let future = self.events.track(
            mode,
            EventKind::WorkDone,
            Some((ObjectType::Queue, queue.handle())),
            Box::new(move |client: &mut WireClient, _: FutureId, resolution: Resolution| {
                let (status, message) = match resolution {
                    Ok(EventPayload::WorkDone { status, message }) => (status, message),
                    Ok(other) => (
                        QueueWorkDoneStatus::Error,
                        format!("unexpected {:?} completion", other.kind()),
                    ),
                    Err(reason) => (reason.work_done_status(), reason.message()),
                };
                callback(client, status, message);
            }),
        );
        self.serialize(WireCommand::QueueOnSubmittedWorkDone {
            queue: queue.handle(),
            future,
        });
        self.deliver_spontaneous();
        Ok(future)
    }

    pub fn push_error_scope(
        &mut self,
        device: Device,
        filter: ErrorFilter,
    ) -> Result<(), ClientError> {
        self.require(ObjectType::Device, device.handle())?;
        self.serialize(WireCommand::DevicePushErrorScope {
            device: device.handle(),
            filter,
        });
        Ok(())
    }

    pub fn pop_error_scope(
        &mut self,
        device: Device,
        callback: PopErrorScopeCallbackInfo,
    ) -> Result<FutureId, ClientError> {
        self.require(ObjectType::Device, device.handle())?;
        let PopErrorScopeCallbackInfo { mode, callback } = callback;
        let future = self.events.track(
            mode,
            EventKind::PopErrorScope,
            Some((ObjectType::Device, device.handle())),
            Box::new(move |client: &mut WireClient, _: FutureId, resolution: Resolution| {
                let (status, error_type, message) = match resolution {
                    Ok(EventPayload::PopErrorScope {
                        status,
                        error_type,
                        message,
                    }) => (status, error_type, message),
                    Ok(other) => (
                        PopErrorScopeStatus::Error,
                        ErrorType::Unknown,
                        format!("unexpected {:?} completion", other.kind()),
                    ),
                    Err(reason) => (
                        reason.pop_error_scope_status(),
                        ErrorType::NoError,
                        reason.message(),
                    ),
                };
                callback(client, status, error_type, message);
            }),
        );
        self.serialize(WireCommand::DevicePopErrorScope {
            device: device.handle(),
            future,
        });
        self.deliver_spontaneous();
        Ok(future)
    }
}
