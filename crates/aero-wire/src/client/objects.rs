//! Typed client-side object handles and the per-object state behind them.

use aero_wire_protocol::{
    AdapterInfo, BufferUsages, ErrorType, FutureId, MapMode, ObjectHandle, ObjectType,
};

use crate::memory_transfer::{ClientReadHandle, ClientWriteHandle};

/// A client object of a fixed [`ObjectType`].
pub trait WireObject: Copy {
    const TYPE: ObjectType;

    fn handle(&self) -> ObjectHandle;
}

macro_rules! define_object {
    ($($name:ident),+ $(,)?) => {
        $(
            /// Handle to a live client object. Only the client mints these.
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(ObjectHandle);

            impl $name {
                pub(crate) const fn from_handle(handle: ObjectHandle) -> Self {
                    Self(handle)
                }

                pub const fn handle(&self) -> ObjectHandle {
                    self.0
                }
            }

            impl WireObject for $name {
                const TYPE: ObjectType = ObjectType::$name;

                fn handle(&self) -> ObjectHandle {
                    self.0
                }
            }
        )+
    };
}

define_object!(
    Instance,
    Adapter,
    Device,
    Queue,
    Buffer,
    Texture,
    TextureView,
    Surface,
    ShaderModule,
    CommandEncoder,
    CommandBuffer,
);

pub type UncapturedErrorCallback = Box<dyn FnMut(Device, ErrorType, &str)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapRequest {
    pub future: FutureId,
    pub mode: MapMode,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapState {
    Unmapped,
    Pending(MapRequest),
    Mapped { mode: MapMode, offset: u64, size: u64 },
    MappedAtCreation { size: u64 },
}

#[derive(Debug)]
pub(crate) struct BufferState {
    pub size: u64,
    pub usage: BufferUsages,
    pub is_error: bool,
    pub destroyed: bool,
    pub read_handle: Option<ClientReadHandle>,
    pub write_handle: Option<ClientWriteHandle>,
    pub map: MapState,
}

impl BufferState {
    pub fn reserved(size: u64, usage: BufferUsages) -> Self {
        Self {
            size,
            usage,
            is_error: false,
            destroyed: false,
            read_handle: None,
            write_handle: None,
            map: MapState::Unmapped,
        }
    }

    pub fn pending_map(&self) -> Option<MapRequest> {
        match self.map {
            MapState::Pending(request) => Some(request),
            _ => None,
        }
    }
}

pub(crate) struct DeviceState {
    pub queue: ObjectHandle,
    pub lost_future: FutureId,
    pub lost: bool,
    pub features: Vec<u32>,
    pub uncaptured_error: Option<UncapturedErrorCallback>,
}

#[derive(Debug, Default)]
pub(crate) struct AdapterState {
    pub info: AdapterInfo,
    pub features: Vec<u32>,
}

pub(crate) enum ClientObjectKind {
    Plain,
    Adapter(AdapterState),
    Device(DeviceState),
    Buffer(BufferState),
}

pub(crate) struct ClientObject {
    /// Creating object (device for buffers, instance for adapters, ...); null for roots.
    pub parent: ObjectHandle,
    pub kind: ClientObjectKind,
}

impl ClientObject {
    pub fn plain(parent: ObjectHandle) -> Self {
        Self {
            parent,
            kind: ClientObjectKind::Plain,
        }
    }

    pub fn buffer(&self) -> Option<&BufferState> {
        match &self.kind {
            ClientObjectKind::Buffer(state) => Some(state),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut BufferState> {
        match &mut self.kind {
            ClientObjectKind::Buffer(state) => Some(state),
            _ => None,
        }
    }

    pub fn device(&self) -> Option<&DeviceState> {
        match &self.kind {
            ClientObjectKind::Device(state) => Some(state),
            _ => None,
        }
    }

    pub fn device_mut(&mut self) -> Option<&mut DeviceState> {
        match &mut self.kind {
            ClientObjectKind::Device(state) => Some(state),
            _ => None,
        }
    }

    pub fn adapter(&self) -> Option<&AdapterState> {
        match &self.kind {
            ClientObjectKind::Adapter(state) => Some(state),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ClientObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ClientObjectKind::Plain => "Plain",
            ClientObjectKind::Adapter(_) => "Adapter",
            ClientObjectKind::Device(_) => "Device",
            ClientObjectKind::Buffer(_) => "Buffer",
        };
        f.debug_struct("ClientObject")
            .field("parent", &self.parent)
            .field("kind", &kind)
            .finish()
    }
}
