//! The backend boundary: one method per forwarded call.

use std::fmt;
use std::sync::mpsc::Sender;

use aero_wire_protocol::{
    AdapterInfo, BufferDescriptor, DeviceDescriptor, DeviceLostReason, ErrorFilter, ErrorType,
    MapAsyncStatus, MapMode, ObjectHandle, PopErrorScopeStatus, QueueWorkDoneStatus,
    RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus, ShaderModuleDescriptor,
    TextureDescriptor, TextureViewDescriptor,
};

use super::reply::ServerReply;

pub type RequestAdapterResult<O> = Result<O, (RequestAdapterStatus, String)>;
pub type RequestDeviceResult<O> = Result<O, (RequestDeviceStatus, String)>;

/// One-shot completion handed to an asynchronous backend call. It may be completed from any
/// thread; the server picks the result up on its next `process_events` or `handle_commands`.
/// Dropping it without completing leaves the client future pending.
pub struct Callback<T> {
    complete: Box<dyn FnOnce(T) + Send>,
}

impl<T> Callback<T> {
    pub(crate) fn new(complete: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            complete: Box::new(complete),
        }
    }

    pub fn complete(self, value: T) {
        (self.complete)(value)
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}

/// Repeatable sink for a device's uncaptured errors.
pub struct UncapturedErrorSink<O> {
    device: ObjectHandle,
    replies: Sender<ServerReply<O>>,
}

impl<O> UncapturedErrorSink<O> {
    pub(crate) fn new(device: ObjectHandle, replies: Sender<ServerReply<O>>) -> Self {
        Self { device, replies }
    }

    pub fn report(&self, error_type: ErrorType, message: impl Into<String>) {
        // The server is gone when the send fails; nothing is listening for the error.
        let _ = self.replies.send(ServerReply::UncapturedError {
            device: self.device,
            error_type,
            message: message.into(),
        });
    }
}

impl<O> Clone for UncapturedErrorSink<O> {
    fn clone(&self) -> Self {
        Self {
            device: self.device,
            replies: self.replies.clone(),
        }
    }
}

impl<O> fmt::Debug for UncapturedErrorSink<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncapturedErrorSink")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Device-lifetime callbacks handed to the backend with a device request.
#[derive(Debug)]
pub struct DeviceCallbacks<O> {
    pub lost: Callback<(DeviceLostReason, String)>,
    pub uncaptured_error: UncapturedErrorSink<O>,
}

/// The underlying GPU API, driven by the server.
///
/// `Object` is the backend's opaque object reference. Every handle argument is resolved to a
/// live, allocated object before a method is called, so implementations never see dangling
/// references. Objects returned from creation methods carry one reference owned by the server;
/// it is given back through [`Procs::release`].
pub trait Procs {
    type Object: Clone + fmt::Debug + Send + 'static;

    fn add_ref(&mut self, object: &Self::Object);
    fn release(&mut self, object: Self::Object);

    fn instance_request_adapter(
        &mut self,
        instance: &Self::Object,
        options: &RequestAdapterOptions,
        compatible_surface: Option<&Self::Object>,
        callback: Callback<RequestAdapterResult<Self::Object>>,
    );
    fn adapter_info(&mut self, adapter: &Self::Object) -> AdapterInfo;
    fn adapter_features(&mut self, adapter: &Self::Object) -> Vec<u32>;
    fn adapter_request_device(
        &mut self,
        adapter: &Self::Object,
        descriptor: &DeviceDescriptor,
        callbacks: DeviceCallbacks<Self::Object>,
        callback: Callback<RequestDeviceResult<Self::Object>>,
    );

    fn device_queue(&mut self, device: &Self::Object) -> Self::Object;
    fn device_features(&mut self, device: &Self::Object) -> Vec<u32>;
    fn device_create_buffer(
        &mut self,
        device: &Self::Object,
        descriptor: &BufferDescriptor,
    ) -> Self::Object;
    fn device_create_error_buffer(
        &mut self,
        device: &Self::Object,
        descriptor: &BufferDescriptor,
    ) -> Self::Object;
    fn device_create_texture(
        &mut self,
        device: &Self::Object,
        descriptor: &TextureDescriptor,
    ) -> Self::Object;
    fn device_create_shader_module(
        &mut self,
        device: &Self::Object,
        descriptor: &ShaderModuleDescriptor,
    ) -> Self::Object;
    fn device_create_command_encoder(
        &mut self,
        device: &Self::Object,
        label: Option<&str>,
    ) -> Self::Object;
    fn device_push_error_scope(&mut self, device: &Self::Object, filter: ErrorFilter);
    fn device_pop_error_scope(
        &mut self,
        device: &Self::Object,
        callback: Callback<(PopErrorScopeStatus, ErrorType, String)>,
    );
    fn device_destroy(&mut self, device: &Self::Object);

    fn texture_create_view(
        &mut self,
        texture: &Self::Object,
        descriptor: &TextureViewDescriptor,
    ) -> Self::Object;

    fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: &Self::Object,
        source: &Self::Object,
        source_offset: u64,
        destination: &Self::Object,
        destination_offset: u64,
        size: u64,
    );
    fn command_encoder_finish(&mut self, encoder: &Self::Object, label: Option<&str>)
        -> Self::Object;

    fn queue_submit(&mut self, queue: &Self::Object, command_buffers: &[Self::Object]);
    fn queue_write_buffer(
        &mut self,
        queue: &Self::Object,
        buffer: &Self::Object,
        offset: u64,
        data: &[u8],
    );
    fn queue_on_submitted_work_done(
        &mut self,
        queue: &Self::Object,
        callback: Callback<(QueueWorkDoneStatus, String)>,
    );

    fn buffer_map_async(
        &mut self,
        buffer: &Self::Object,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: Callback<(MapAsyncStatus, String)>,
    );
    /// Mapped storage for `offset..offset + size`, or `None` if that range is not mapped.
    fn buffer_mapped_range(
        &mut self,
        buffer: &Self::Object,
        offset: u64,
        size: u64,
    ) -> Option<&mut [u8]>;
    fn buffer_unmap(&mut self, buffer: &Self::Object);
    fn buffer_destroy(&mut self, buffer: &Self::Object);

    /// Give the backend a chance to fire deferred callbacks.
    fn process_events(&mut self) {}
}
