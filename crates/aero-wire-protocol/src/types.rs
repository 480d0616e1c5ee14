//! Descriptors, status codes and flag sets carried by commands.
//!
//! Enumerations whose meaning belongs to the backend (texture formats, dimensions, power
//! preference, feature names) travel as raw `u32` and are never interpreted here. Status codes
//! that drive the completion machinery are strict: an unknown value fails decode.

use bitflags::bitflags;

use crate::error::DecodeError;
use crate::handle::ObjectHandle;
use crate::wire::{WireReader, WireWriter};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $value:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u32(value: u32) -> Result<Self, DecodeError> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err(DecodeError::InvalidEnum {
                        kind: stringify!($name),
                        value,
                    }),
                }
            }

            pub const fn to_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

wire_enum! {
    pub enum MapAsyncStatus {
        Success = 1,
        InstanceDropped = 2,
        Error = 3,
        Aborted = 4,
        CallbackCancelled = 5,
    }
}

wire_enum! {
    pub enum RequestAdapterStatus {
        Success = 1,
        InstanceDropped = 2,
        CallbackCancelled = 3,
        Unavailable = 4,
        Error = 5,
    }
}

wire_enum! {
    pub enum RequestDeviceStatus {
        Success = 1,
        InstanceDropped = 2,
        CallbackCancelled = 3,
        Error = 4,
    }
}

wire_enum! {
    pub enum QueueWorkDoneStatus {
        Success = 1,
        InstanceDropped = 2,
        CallbackCancelled = 3,
        Error = 4,
    }
}

wire_enum! {
    pub enum PopErrorScopeStatus {
        Success = 1,
        InstanceDropped = 2,
        CallbackCancelled = 3,
        Error = 4,
    }
}

wire_enum! {
    pub enum DeviceLostReason {
        Unknown = 1,
        Destroyed = 2,
        InstanceDropped = 3,
        CallbackCancelled = 4,
        FailedCreation = 5,
    }
}

wire_enum! {
    pub enum ErrorType {
        NoError = 1,
        Validation = 2,
        OutOfMemory = 3,
        Internal = 4,
        Unknown = 5,
    }
}

wire_enum! {
    pub enum ErrorFilter {
        Validation = 1,
        OutOfMemory = 2,
        Internal = 3,
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
        const INDIRECT = 1 << 8;
        const QUERY_RESOLVE = 1 << 9;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsages: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MapMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

fn read_flags<F: bitflags::Flags<Bits = u32>>(
    r: &mut WireReader<'_>,
    kind: &'static str,
) -> Result<F, DecodeError> {
    let bits = r.u32()?;
    F::from_bits(bits).ok_or(DecodeError::InvalidFlags { kind, bits })
}

pub(crate) fn read_buffer_usages(r: &mut WireReader<'_>) -> Result<BufferUsages, DecodeError> {
    read_flags(r, "BufferUsages")
}

pub(crate) fn read_texture_usages(r: &mut WireReader<'_>) -> Result<TextureUsages, DecodeError> {
    read_flags(r, "TextureUsages")
}

pub(crate) fn read_map_mode(r: &mut WireReader<'_>) -> Result<MapMode, DecodeError> {
    read_flags(r, "MapMode")
}

/// Identifier of one asynchronous operation. `0` is the null future.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(pub u64);

impl FutureId {
    pub const NULL: Self = Self(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

pub const STYPE_SHADER_SOURCE_WGSL: u32 = 1;
pub const STYPE_SHADER_SOURCE_SPIRV: u32 = 2;
pub const STYPE_TOGGLES_DESCRIPTOR: u32 = 3;

/// One link of an extensible descriptor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainedStruct {
    ShaderSourceWgsl {
        code: String,
    },
    ShaderSourceSpirv {
        code: Vec<u32>,
    },
    TogglesDescriptor {
        enabled: Vec<String>,
        disabled: Vec<String>,
    },
    /// A link whose type tag is zero or not known to this build. The payload is skipped on decode
    /// and not reproduced on encode.
    Unknown {
        s_type: u32,
    },
}

impl ChainedStruct {
    pub fn s_type(&self) -> u32 {
        match self {
            ChainedStruct::ShaderSourceWgsl { .. } => STYPE_SHADER_SOURCE_WGSL,
            ChainedStruct::ShaderSourceSpirv { .. } => STYPE_SHADER_SOURCE_SPIRV,
            ChainedStruct::TogglesDescriptor { .. } => STYPE_TOGGLES_DESCRIPTOR,
            ChainedStruct::Unknown { s_type } => *s_type,
        }
    }

    fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            ChainedStruct::ShaderSourceWgsl { code } => w.raw(code.as_bytes()),
            ChainedStruct::ShaderSourceSpirv { code } => {
                for word in code {
                    w.u32(*word);
                }
            }
            ChainedStruct::TogglesDescriptor { enabled, disabled } => {
                write_strings(w, enabled);
                write_strings(w, disabled);
            }
            ChainedStruct::Unknown { .. } => {}
        }
    }

    fn decode_payload(s_type: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(payload);
        let link = match s_type {
            STYPE_SHADER_SOURCE_WGSL => {
                let code = core::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
                return Ok(ChainedStruct::ShaderSourceWgsl {
                    code: code.to_owned(),
                });
            }
            STYPE_SHADER_SOURCE_SPIRV => {
                if payload.len() % 4 != 0 {
                    return Err(DecodeError::TrailingBytes(payload.len() % 4));
                }
                let mut code = Vec::with_capacity(payload.len() / 4);
                while r.remaining() > 0 {
                    code.push(r.u32()?);
                }
                ChainedStruct::ShaderSourceSpirv { code }
            }
            STYPE_TOGGLES_DESCRIPTOR => ChainedStruct::TogglesDescriptor {
                enabled: read_strings(&mut r)?,
                disabled: read_strings(&mut r)?,
            },
            _ => return Ok(ChainedStruct::Unknown { s_type }),
        };
        r.finish()?;
        Ok(link)
    }
}

fn write_strings(w: &mut WireWriter, values: &[String]) {
    w.u32(values.len() as u32);
    for v in values {
        w.str(v);
    }
}

fn read_strings(r: &mut WireReader<'_>) -> Result<Vec<String>, DecodeError> {
    // Each string costs at least its 4-byte length prefix.
    let n = r.count(4)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(r.string()?);
    }
    Ok(out)
}

pub fn write_chain(w: &mut WireWriter, chain: &[ChainedStruct]) {
    w.u32(chain.len() as u32);
    for link in chain {
        w.u32(link.s_type());
        let len_at = w.len();
        w.u32(0);
        let start = w.len();
        link.encode_payload(w);
        let payload_len = (w.len() - start) as u32;
        w.patch_u32(len_at, payload_len);
    }
}

pub fn read_chain(r: &mut WireReader<'_>) -> Result<Vec<ChainedStruct>, DecodeError> {
    // Each link is at least `s_type` + `payload_len`.
    let n = r.count(8)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let s_type = r.u32()?;
        let payload = r.bytes()?;
        out.push(ChainedStruct::decode_payload(s_type, payload)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAdapterOptions {
    pub power_preference: u32,
    pub force_fallback_adapter: bool,
    /// Null when no surface constrains the choice.
    pub compatible_surface: ObjectHandle,
    pub chain: Vec<ChainedStruct>,
}

impl RequestAdapterOptions {
    pub fn encode(&self, w: &mut WireWriter) {
        w.u32(self.power_preference);
        w.bool(self.force_fallback_adapter);
        w.handle(self.compatible_surface);
        write_chain(w, &self.chain);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            power_preference: r.u32()?,
            force_fallback_adapter: r.bool()?,
            compatible_surface: r.handle()?,
            chain: read_chain(r)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub label: Option<String>,
    pub required_features: Vec<u32>,
    pub chain: Vec<ChainedStruct>,
}

impl DeviceDescriptor {
    pub fn encode(&self, w: &mut WireWriter) {
        w.opt_str(self.label.as_deref());
        w.u32_array(&self.required_features);
        write_chain(w, &self.chain);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            label: r.opt_string()?,
            required_features: r.u32_array()?,
            chain: read_chain(r)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub usage: BufferUsages,
    pub size: u64,
    pub mapped_at_creation: bool,
}

impl BufferDescriptor {
    pub fn encode(&self, w: &mut WireWriter) {
        w.opt_str(self.label.as_deref());
        w.u32(self.usage.bits());
        w.u64(self.size);
        w.bool(self.mapped_at_creation);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            label: r.opt_string()?,
            usage: read_buffer_usages(r)?,
            size: r.u64()?,
            mapped_at_creation: r.bool()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub size: Extent3d,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub dimension: u32,
    pub format: u32,
    pub usage: TextureUsages,
    pub view_formats: Vec<u32>,
}

impl TextureDescriptor {
    pub fn encode(&self, w: &mut WireWriter) {
        w.opt_str(self.label.as_deref());
        w.u32(self.size.width);
        w.u32(self.size.height);
        w.u32(self.size.depth_or_array_layers);
        w.u32(self.mip_level_count);
        w.u32(self.sample_count);
        w.u32(self.dimension);
        w.u32(self.format);
        w.u32(self.usage.bits());
        w.u32_array(&self.view_formats);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            label: r.opt_string()?,
            size: Extent3d {
                width: r.u32()?,
                height: r.u32()?,
                depth_or_array_layers: r.u32()?,
            },
            mip_level_count: r.u32()?,
            sample_count: r.u32()?,
            dimension: r.u32()?,
            format: r.u32()?,
            usage: read_texture_usages(r)?,
            view_formats: r.u32_array()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureViewDescriptor {
    pub label: Option<String>,
    /// `0` inherits the texture's format.
    pub format: u32,
    pub dimension: u32,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}

impl TextureViewDescriptor {
    pub fn encode(&self, w: &mut WireWriter) {
        w.opt_str(self.label.as_deref());
        w.u32(self.format);
        w.u32(self.dimension);
        w.u32(self.base_mip_level);
        w.u32(self.mip_level_count);
        w.u32(self.base_array_layer);
        w.u32(self.array_layer_count);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            label: r.opt_string()?,
            format: r.u32()?,
            dimension: r.u32()?,
            base_mip_level: r.u32()?,
            mip_level_count: r.u32()?,
            base_array_layer: r.u32()?,
            array_layer_count: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderModuleDescriptor {
    pub label: Option<String>,
    pub chain: Vec<ChainedStruct>,
}

impl ShaderModuleDescriptor {
    pub fn encode(&self, w: &mut WireWriter) {
        w.opt_str(self.label.as_deref());
        write_chain(w, &self.chain);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            label: r.opt_string()?,
            chain: read_chain(r)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterInfo {
    pub vendor: String,
    pub architecture: String,
    pub device: String,
    pub description: String,
    pub backend_type: u32,
    pub adapter_type: u32,
    pub vendor_id: u32,
    pub device_id: u32,
}

impl AdapterInfo {
    pub fn encode(&self, w: &mut WireWriter) {
        w.str(&self.vendor);
        w.str(&self.architecture);
        w.str(&self.device);
        w.str(&self.description);
        w.u32(self.backend_type);
        w.u32(self.adapter_type);
        w.u32(self.vendor_id);
        w.u32(self.device_id);
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            vendor: r.string()?,
            architecture: r.string()?,
            device: r.string()?,
            description: r.string()?,
            backend_type: r.u32()?,
            adapter_type: r.u32()?,
            vendor_id: r.u32()?,
            device_id: r.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chain_round_trip(chain: &[ChainedStruct]) -> Vec<ChainedStruct> {
        let mut w = WireWriter::new();
        write_chain(&mut w, chain);
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        let out = read_chain(&mut r).unwrap();
        r.finish().unwrap();
        out
    }

    #[test]
    fn known_chain_links_survive_a_round_trip() {
        let chain = vec![
            ChainedStruct::ShaderSourceWgsl {
                code: "@compute @workgroup_size(1) fn main() {}".into(),
            },
            ChainedStruct::ShaderSourceSpirv {
                code: vec![0x0723_0203, 0x0001_0000],
            },
            ChainedStruct::TogglesDescriptor {
                enabled: vec!["dump_shaders".into()],
                disabled: vec![],
            },
        ];
        assert_eq!(chain_round_trip(&chain), chain);
    }

    #[test]
    fn unknown_and_zero_stypes_decode_as_markers() {
        let mut w = WireWriter::new();
        w.u32(2);
        w.u32(0);
        w.bytes(&[]);
        w.u32(0xdead);
        w.bytes(&[1, 2, 3, 4, 5]);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let chain = read_chain(&mut r).unwrap();
        r.finish().unwrap();
        assert_eq!(
            chain,
            vec![
                ChainedStruct::Unknown { s_type: 0 },
                ChainedStruct::Unknown { s_type: 0xdead },
            ]
        );
        assert_eq!(chain_round_trip(&chain), chain);
    }

    #[test]
    fn misaligned_spirv_is_rejected() {
        let mut w = WireWriter::new();
        w.u32(1);
        w.u32(STYPE_SHADER_SOURCE_SPIRV);
        w.bytes(&[1, 2, 3, 4, 5, 6]);
        let bytes = w.into_bytes();
        assert!(read_chain(&mut WireReader::new(&bytes)).is_err());
    }

    #[test]
    fn strict_status_decoding() {
        assert_eq!(MapAsyncStatus::from_u32(4), Ok(MapAsyncStatus::Aborted));
        assert_eq!(
            MapAsyncStatus::from_u32(0),
            Err(DecodeError::InvalidEnum {
                kind: "MapAsyncStatus",
                value: 0
            })
        );
    }

    #[test]
    fn unknown_usage_bits_are_rejected() {
        let mut w = WireWriter::new();
        w.u32(1 << 31);
        let bytes = w.into_bytes();
        assert_eq!(
            read_buffer_usages(&mut WireReader::new(&bytes)),
            Err(DecodeError::InvalidFlags {
                kind: "BufferUsages",
                bits: 1 << 31
            })
        );
    }
}
