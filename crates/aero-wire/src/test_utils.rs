//! A software [`Procs`] backend and an in-process client/server pair.
//!
//! [`SoftProcs`] keeps buffer contents in host memory and defers every asynchronous completion
//! until [`Procs::process_events`], so tests can observe the window between a request and its
//! callback.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use aero_wire_protocol::{
    AdapterInfo, BufferDescriptor, BufferUsages, DeviceDescriptor, DeviceLostReason, ErrorFilter,
    ErrorType, MapAsyncStatus, MapMode, PopErrorScopeStatus, QueueWorkDoneStatus,
    RequestAdapterOptions, RequestAdapterStatus, RequestDeviceStatus, ShaderModuleDescriptor,
    TextureDescriptor, TextureViewDescriptor,
};

use crate::client::{
    Adapter, CallbackMode, Device, DeviceCallbacks, DeviceLostCallbackInfo, Instance,
    RequestAdapterCallbackInfo, RequestDeviceCallbackInfo, WireClient, WireClientConfig,
};
use crate::error::WireError;
use crate::server::{
    Callback, DeviceCallbacks as ServerDeviceCallbacks, Procs, RequestAdapterResult,
    RequestDeviceResult, UncapturedErrorSink, WireServer, WireServerConfig,
};
use crate::transport::channel_transport;

pub type SoftObject = u64;

/// Features every [`SoftProcs`] adapter advertises.
pub const SOFT_FEATURES: [u32; 2] = [1, 2];

#[derive(Debug, Clone, Copy)]
struct CopyOp {
    source: SoftObject,
    source_offset: u64,
    destination: SoftObject,
    destination_offset: u64,
    size: u64,
}

struct SoftDevice {
    queue: SoftObject,
    features: Vec<u32>,
    destroyed: bool,
    lost: Option<Callback<(DeviceLostReason, String)>>,
    uncaptured_error: UncapturedErrorSink<SoftObject>,
    /// Innermost scope last. Each scope keeps the first error it captured.
    error_scopes: Vec<(ErrorFilter, Option<(ErrorType, String)>)>,
}

#[derive(Debug, Default)]
struct SoftBuffer {
    usage: BufferUsages,
    data: Vec<u8>,
    destroyed: bool,
    /// A deferred map only lands if `pending_map` still holds its serial.
    map_serial: u64,
    pending_map: Option<u64>,
    mapped: Option<(MapMode, u64, u64)>,
}

enum SoftKind {
    Instance,
    Surface,
    Adapter,
    Device(Box<SoftDevice>),
    Queue { device: SoftObject },
    Buffer(SoftBuffer),
    Texture,
    TextureView,
    ShaderModule,
    CommandEncoder { device: SoftObject, ops: Vec<CopyOp> },
    CommandBuffer { device: SoftObject, ops: Vec<CopyOp> },
}

struct SoftEntry {
    refcount: u32,
    kind: SoftKind,
}

type Deferred = Box<dyn FnOnce(&mut SoftProcs)>;

/// Objects whose last reference was released, in release order. Outlives the backend.
pub type ReleaseLog = Rc<RefCell<Vec<SoftObject>>>;

/// Host-memory GPU backend. Object references are plain ids with explicit refcounts.
#[derive(Default)]
pub struct SoftProcs {
    next_id: SoftObject,
    objects: BTreeMap<SoftObject, SoftEntry>,
    deferred: Vec<Deferred>,
    released: ReleaseLog,
}

impl std::fmt::Debug for SoftProcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftProcs")
            .field("objects", &self.objects.len())
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl SoftProcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, kind: SoftKind) -> SoftObject {
        self.next_id += 1;
        self.objects.insert(
            self.next_id,
            SoftEntry {
                refcount: 1,
                kind,
            },
        );
        self.next_id
    }

    fn defer(&mut self, f: impl FnOnce(&mut SoftProcs) + 'static) {
        self.deferred.push(Box::new(f));
    }

    /// Embedder-side creation for injection. The caller owns the returned reference.
    pub fn create_instance(&mut self) -> SoftObject {
        self.alloc(SoftKind::Instance)
    }

    pub fn create_surface(&mut self) -> SoftObject {
        self.alloc(SoftKind::Surface)
    }

    pub fn create_texture(&mut self) -> SoftObject {
        self.alloc(SoftKind::Texture)
    }

    pub fn create_buffer(&mut self, size: u64, usage: BufferUsages) -> SoftObject {
        self.alloc(SoftKind::Buffer(SoftBuffer {
            usage,
            data: vec![0; size as usize],
            ..SoftBuffer::default()
        }))
    }

    pub fn is_live(&self, object: SoftObject) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn refcount(&self, object: SoftObject) -> u32 {
        self.objects.get(&object).map_or(0, |entry| entry.refcount)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn released(&self) -> Vec<SoftObject> {
        self.released.borrow().clone()
    }

    pub fn release_log(&self) -> ReleaseLog {
        Rc::clone(&self.released)
    }

    pub fn pending_completions(&self) -> usize {
        self.deferred.len()
    }

    pub fn buffer_data(&self, buffer: SoftObject) -> Option<&[u8]> {
        match &self.objects.get(&buffer)?.kind {
            SoftKind::Buffer(state) => Some(&state.data),
            _ => None,
        }
    }

    fn buffer(&mut self, buffer: SoftObject) -> Option<&mut SoftBuffer> {
        match &mut self.objects.get_mut(&buffer)?.kind {
            SoftKind::Buffer(state) => Some(state),
            _ => None,
        }
    }

    fn device(&mut self, device: SoftObject) -> Option<&mut SoftDevice> {
        match &mut self.objects.get_mut(&device)?.kind {
            SoftKind::Device(state) => Some(state),
            _ => None,
        }
    }

    /// Lose `device` as if the GPU went away.
    pub fn lose_device(&mut self, device: SoftObject, message: &str) {
        let message = message.to_owned();
        if let Some(lost) = self.device(device).and_then(|state| state.lost.take()) {
            self.defer(move |_| lost.complete((DeviceLostReason::Unknown, message)));
        }
    }

    /// Route an error through `device`'s error scopes, falling back to its uncaptured sink.
    pub fn report_error(&mut self, device: SoftObject, error_type: ErrorType, message: &str) {
        let Some(state) = self.device(device) else {
            return;
        };
        let scope = state
            .error_scopes
            .iter_mut()
            .rev()
            .find(|(filter, _)| filter_matches(*filter, error_type));
        match scope {
            Some((_, captured)) => {
                captured.get_or_insert_with(|| (error_type, message.to_owned()));
            }
            None => state.uncaptured_error.report(error_type, message),
        }
    }

    fn execute(&mut self, device: SoftObject, op: CopyOp) {
        let source = match self.buffer(op.source) {
            Some(buffer) if !buffer.destroyed && buffer.mapped.is_none() => {
                range(op.source_offset, op.size, buffer.data.len())
                    .map(|range| buffer.data[range].to_vec())
            }
            _ => None,
        };
        let Some(bytes) = source else {
            self.report_error(device, ErrorType::Validation, "invalid copy source");
            return;
        };
        let written = match self.buffer(op.destination) {
            Some(buffer) if !buffer.destroyed && buffer.mapped.is_none() => {
                match range(op.destination_offset, op.size, buffer.data.len()) {
                    Some(range) => {
                        buffer.data[range].copy_from_slice(&bytes);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };
        if !written {
            self.report_error(device, ErrorType::Validation, "invalid copy destination");
        }
    }

    fn finish_map(
        &mut self,
        buffer: SoftObject,
        serial: u64,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: Callback<(MapAsyncStatus, String)>,
    ) {
        match self.buffer(buffer) {
            Some(state) if state.pending_map == Some(serial) => {
                state.pending_map = None;
                state.mapped = Some((mode, offset, size));
                callback.complete((MapAsyncStatus::Success, String::new()));
            }
            _ => callback.complete((
                MapAsyncStatus::Aborted,
                "buffer was unmapped before the mapping resolved".to_owned(),
            )),
        }
    }
}

fn filter_matches(filter: ErrorFilter, error_type: ErrorType) -> bool {
    matches!(
        (filter, error_type),
        (ErrorFilter::Validation, ErrorType::Validation)
            | (ErrorFilter::OutOfMemory, ErrorType::OutOfMemory)
            | (ErrorFilter::Internal, ErrorType::Internal)
    )
}

fn range(offset: u64, size: u64, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    (end <= len).then_some(start..end)
}

impl Procs for SoftProcs {
    type Object = SoftObject;

    fn add_ref(&mut self, object: &SoftObject) {
        if let Some(entry) = self.objects.get_mut(object) {
            entry.refcount += 1;
        }
    }

    fn release(&mut self, object: SoftObject) {
        let Some(entry) = self.objects.get_mut(&object) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        let removed = self.objects.remove(&object);
        self.released.borrow_mut().push(object);
        // A device owns one reference on its queue.
        if let Some(SoftEntry {
            kind: SoftKind::Device(device),
            ..
        }) = removed
        {
            self.release(device.queue);
        }
    }

    fn instance_request_adapter(
        &mut self,
        _instance: &SoftObject,
        options: &RequestAdapterOptions,
        _compatible_surface: Option<&SoftObject>,
        callback: Callback<RequestAdapterResult<SoftObject>>,
    ) {
        let result = if options.force_fallback_adapter {
            Err((
                RequestAdapterStatus::Unavailable,
                "no fallback adapter is available".to_owned(),
            ))
        } else {
            Ok(self.alloc(SoftKind::Adapter))
        };
        self.defer(move |_| callback.complete(result));
    }

    fn adapter_info(&mut self, _adapter: &SoftObject) -> AdapterInfo {
        AdapterInfo {
            vendor: "aero".to_owned(),
            architecture: "soft".to_owned(),
            device: "software rasterizer".to_owned(),
            description: "host memory backend".to_owned(),
            backend_type: 1,
            adapter_type: 3,
            vendor_id: 0x1af4,
            device_id: 1,
        }
    }

    fn adapter_features(&mut self, _adapter: &SoftObject) -> Vec<u32> {
        SOFT_FEATURES.to_vec()
    }

    fn adapter_request_device(
        &mut self,
        _adapter: &SoftObject,
        descriptor: &DeviceDescriptor,
        callbacks: ServerDeviceCallbacks<SoftObject>,
        callback: Callback<RequestDeviceResult<SoftObject>>,
    ) {
        if let Some(feature) = descriptor
            .required_features
            .iter()
            .find(|feature| !SOFT_FEATURES.contains(feature))
        {
            let message = format!("feature {feature} is not supported");
            self.defer(move |_| callback.complete(Err((RequestDeviceStatus::Error, message))));
            return;
        }
        let ServerDeviceCallbacks {
            lost,
            uncaptured_error,
        } = callbacks;
        let device = self.alloc(SoftKind::Device(Box::new(SoftDevice {
            queue: 0,
            features: descriptor.required_features.clone(),
            destroyed: false,
            lost: Some(lost),
            uncaptured_error,
            error_scopes: Vec::new(),
        })));
        let queue = self.alloc(SoftKind::Queue { device });
        if let Some(state) = self.device(device) {
            state.queue = queue;
        }
        self.defer(move |_| callback.complete(Ok(device)));
    }

    fn device_queue(&mut self, device: &SoftObject) -> SoftObject {
        let queue = self.device(*device).map_or(0, |state| state.queue);
        self.add_ref(&queue);
        queue
    }

    fn device_features(&mut self, device: &SoftObject) -> Vec<u32> {
        self.device(*device)
            .map(|state| state.features.clone())
            .unwrap_or_default()
    }

    fn device_create_buffer(
        &mut self,
        _device: &SoftObject,
        descriptor: &BufferDescriptor,
    ) -> SoftObject {
        let buffer = self.create_buffer(descriptor.size, descriptor.usage);
        if descriptor.mapped_at_creation {
            if let Some(state) = self.buffer(buffer) {
                state.mapped = Some((MapMode::WRITE, 0, descriptor.size));
            }
        }
        buffer
    }

    fn device_create_error_buffer(
        &mut self,
        device: &SoftObject,
        descriptor: &BufferDescriptor,
    ) -> SoftObject {
        self.report_error(
            *device,
            ErrorType::OutOfMemory,
            "buffer allocation failed on the client",
        );
        let buffer = self.create_buffer(0, descriptor.usage);
        if let Some(state) = self.buffer(buffer) {
            state.destroyed = true;
        }
        buffer
    }

    fn device_create_texture(
        &mut self,
        _device: &SoftObject,
        _descriptor: &TextureDescriptor,
    ) -> SoftObject {
        self.alloc(SoftKind::Texture)
    }

    fn device_create_shader_module(
        &mut self,
        _device: &SoftObject,
        _descriptor: &ShaderModuleDescriptor,
    ) -> SoftObject {
        self.alloc(SoftKind::ShaderModule)
    }

    fn device_create_command_encoder(
        &mut self,
        device: &SoftObject,
        _label: Option<&str>,
    ) -> SoftObject {
        self.alloc(SoftKind::CommandEncoder {
            device: *device,
            ops: Vec::new(),
        })
    }

    fn device_push_error_scope(&mut self, device: &SoftObject, filter: ErrorFilter) {
        if let Some(state) = self.device(*device) {
            state.error_scopes.push((filter, None));
        }
    }

    fn device_pop_error_scope(
        &mut self,
        device: &SoftObject,
        callback: Callback<(PopErrorScopeStatus, ErrorType, String)>,
    ) {
        let result = match self.device(*device) {
            Some(state) if state.destroyed => {
                (PopErrorScopeStatus::Success, ErrorType::NoError, String::new())
            }
            Some(state) => match state.error_scopes.pop() {
                Some((_, Some((error_type, message)))) => {
                    (PopErrorScopeStatus::Success, error_type, message)
                }
                Some((_, None)) => (PopErrorScopeStatus::Success, ErrorType::NoError, String::new()),
                None => (
                    PopErrorScopeStatus::Error,
                    ErrorType::NoError,
                    "no error scope to pop".to_owned(),
                ),
            },
            None => (
                PopErrorScopeStatus::Error,
                ErrorType::NoError,
                "unknown device".to_owned(),
            ),
        };
        self.defer(move |_| callback.complete(result));
    }

    fn device_destroy(&mut self, device: &SoftObject) {
        let Some(state) = self.device(*device) else {
            return;
        };
        state.destroyed = true;
        if let Some(lost) = state.lost.take() {
            self.defer(move |_| {
                lost.complete((DeviceLostReason::Destroyed, "device was destroyed".to_owned()))
            });
        }
    }

    fn texture_create_view(
        &mut self,
        _texture: &SoftObject,
        _descriptor: &TextureViewDescriptor,
    ) -> SoftObject {
        self.alloc(SoftKind::TextureView)
    }

    fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: &SoftObject,
        source: &SoftObject,
        source_offset: u64,
        destination: &SoftObject,
        destination_offset: u64,
        size: u64,
    ) {
        if let Some(SoftEntry {
            kind: SoftKind::CommandEncoder { ops, .. },
            ..
        }) = self.objects.get_mut(encoder)
        {
            ops.push(CopyOp {
                source: *source,
                source_offset,
                destination: *destination,
                destination_offset,
                size,
            });
        }
    }

    fn command_encoder_finish(&mut self, encoder: &SoftObject, _label: Option<&str>) -> SoftObject {
        let (device, ops) = match self.objects.get_mut(encoder) {
            Some(SoftEntry {
                kind: SoftKind::CommandEncoder { device, ops },
                ..
            }) => (*device, std::mem::take(ops)),
            _ => (0, Vec::new()),
        };
        self.alloc(SoftKind::CommandBuffer { device, ops })
    }

    fn queue_submit(&mut self, _queue: &SoftObject, command_buffers: &[SoftObject]) {
        for command_buffer in command_buffers {
            let (device, ops) = match self.objects.get_mut(command_buffer) {
                Some(SoftEntry {
                    kind: SoftKind::CommandBuffer { device, ops },
                    ..
                }) => (*device, std::mem::take(ops)),
                _ => continue,
            };
            for op in ops {
                self.execute(device, op);
            }
        }
    }

    fn queue_write_buffer(
        &mut self,
        queue: &SoftObject,
        buffer: &SoftObject,
        offset: u64,
        data: &[u8],
    ) {
        let device = match self.objects.get(queue) {
            Some(SoftEntry {
                kind: SoftKind::Queue { device },
                ..
            }) => *device,
            _ => return,
        };
        let written = match self.buffer(*buffer) {
            Some(state) if !state.destroyed && state.mapped.is_none() => {
                match range(offset, data.len() as u64, state.data.len()) {
                    Some(range) => {
                        state.data[range].copy_from_slice(data);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };
        if !written {
            self.report_error(device, ErrorType::Validation, "invalid buffer write");
        }
    }

    fn queue_on_submitted_work_done(
        &mut self,
        _queue: &SoftObject,
        callback: Callback<(QueueWorkDoneStatus, String)>,
    ) {
        self.defer(move |_| callback.complete((QueueWorkDoneStatus::Success, String::new())));
    }

    fn buffer_map_async(
        &mut self,
        buffer: &SoftObject,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: Callback<(MapAsyncStatus, String)>,
    ) {
        let buffer = *buffer;
        let required = if mode == MapMode::READ {
            BufferUsages::MAP_READ
        } else {
            BufferUsages::MAP_WRITE
        };
        let outcome = match self.buffer(buffer) {
            None => Err("not a buffer"),
            Some(state) if state.destroyed => Err("buffer is destroyed"),
            Some(state) if !state.usage.contains(required) => Err("buffer usage forbids this map mode"),
            Some(state) if state.pending_map.is_some() || state.mapped.is_some() => {
                Err("buffer is already mapped")
            }
            Some(state) if range(offset, size, state.data.len()).is_none() => {
                Err("mapped range is out of bounds")
            }
            Some(state) => {
                state.map_serial += 1;
                state.pending_map = Some(state.map_serial);
                Ok(state.map_serial)
            }
        };
        match outcome {
            Ok(serial) => self.defer(move |procs| {
                procs.finish_map(buffer, serial, mode, offset, size, callback)
            }),
            Err(message) => {
                let message = message.to_owned();
                self.defer(move |_| callback.complete((MapAsyncStatus::Error, message)));
            }
        }
    }

    fn buffer_mapped_range(
        &mut self,
        buffer: &SoftObject,
        offset: u64,
        size: u64,
    ) -> Option<&mut [u8]> {
        let state = self.buffer(*buffer)?;
        let (_, mapped_offset, mapped_size) = state.mapped?;
        let end = offset.checked_add(size)?;
        if offset < mapped_offset || end > mapped_offset.saturating_add(mapped_size) {
            return None;
        }
        let range = range(offset, size, state.data.len())?;
        Some(&mut state.data[range])
    }

    fn buffer_unmap(&mut self, buffer: &SoftObject) {
        if let Some(state) = self.buffer(*buffer) {
            state.pending_map = None;
            state.mapped = None;
        }
    }

    fn buffer_destroy(&mut self, buffer: &SoftObject) {
        if let Some(state) = self.buffer(*buffer) {
            state.destroyed = true;
            state.pending_map = None;
            state.mapped = None;
        }
    }

    fn process_events(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for completion in deferred {
            completion(self);
        }
    }
}

/// A [`WireClient`] and a [`WireServer`] over an in-process channel transport.
pub struct WirePair {
    pub client: WireClient,
    pub server: WireServer<SoftProcs>,
}

impl Default for WirePair {
    fn default() -> Self {
        Self::new()
    }
}

impl WirePair {
    pub fn new() -> Self {
        Self::with_configs(WireClientConfig::default(), WireServerConfig::default())
    }

    pub fn with_configs(client: WireClientConfig, server: WireServerConfig) -> Self {
        let (client_end, server_end) = channel_transport();
        Self {
            client: WireClient::new(Box::new(client_end), client),
            server: WireServer::new(SoftProcs::new(), Box::new(server_end), server),
        }
    }

    pub fn procs(&self) -> &SoftProcs {
        self.server.procs()
    }

    pub fn procs_mut(&mut self) -> &mut SoftProcs {
        self.server.procs_mut()
    }

    /// Send the client's commands and apply them on the server.
    pub fn flush_client(&mut self) -> Result<usize, WireError> {
        self.client.flush();
        self.server.receive_pending()
    }

    /// Run the backend's deferred completions, send the returns and apply them on the client.
    pub fn flush_server(&mut self) -> Result<usize, WireError> {
        self.server.process_events();
        self.server.flush();
        self.client.receive_pending()
    }

    pub fn roundtrip(&mut self) -> Result<(), WireError> {
        self.flush_client()?;
        self.flush_server()?;
        Ok(())
    }

    /// Reserve an instance on the client and inject a fresh backend instance for it.
    pub fn instance(&mut self) -> Instance {
        let reservation = self
            .client
            .reserve_instance()
            .expect("instance ids are available");
        let object = self.procs_mut().create_instance();
        assert!(self.server.inject_instance(object, reservation.handle));
        self.procs_mut().release(object);
        reservation.instance
    }

    pub fn adapter(&mut self, instance: Instance) -> Adapter {
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        self.client
            .request_adapter(
                instance,
                &RequestAdapterOptions::default(),
                RequestAdapterCallbackInfo::new(
                    CallbackMode::AllowSpontaneous,
                    move |_, status, adapter, message| {
                        assert_eq!(status, RequestAdapterStatus::Success, "{message}");
                        *sink.borrow_mut() = adapter;
                    },
                ),
            )
            .expect("instance is live");
        self.roundtrip().expect("adapter request round trip");
        slot.take().expect("adapter callback delivered")
    }

    /// Request a device with no required features. Device loss is ignored.
    pub fn device(&mut self, adapter: Adapter) -> Device {
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        self.client
            .request_device(
                adapter,
                &DeviceDescriptor::default(),
                DeviceCallbacks::new(DeviceLostCallbackInfo::new(
                    CallbackMode::AllowSpontaneous,
                    |_, _, _, _| {},
                )),
                RequestDeviceCallbackInfo::new(
                    CallbackMode::AllowSpontaneous,
                    move |_, status, device, message| {
                        assert_eq!(status, RequestDeviceStatus::Success, "{message}");
                        *sink.borrow_mut() = device;
                    },
                ),
            )
            .expect("adapter is live");
        self.roundtrip().expect("device request round trip");
        slot.take().expect("device callback delivered")
    }

    /// Instance, adapter and device in one go.
    pub fn ready_device(&mut self) -> (Instance, Adapter, Device) {
        let instance = self.instance();
        let adapter = self.adapter(instance);
        let device = self.device(adapter);
        (instance, adapter, device)
    }
}

impl std::fmt::Debug for WirePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirePair")
            .field("client", &self.client)
            .field("server", &self.server)
            .finish()
    }
}
