//! Client → server commands.

use crate::error::DecodeError;
use crate::frame::{read_frame, write_frame};
use crate::handle::{ObjectHandle, ObjectType};
use crate::types::{
    read_map_mode, BufferDescriptor, DeviceDescriptor, ErrorFilter, FutureId, MapMode,
    RequestAdapterOptions, ShaderModuleDescriptor, TextureDescriptor, TextureViewDescriptor,
};
use crate::wire::{WireReader, WireWriter};

const OP_DESTROY_OBJECT: u32 = 1;
const OP_INSTANCE_REQUEST_ADAPTER: u32 = 2;
const OP_ADAPTER_REQUEST_DEVICE: u32 = 3;
const OP_DEVICE_CREATE_BUFFER: u32 = 4;
const OP_DEVICE_CREATE_ERROR_BUFFER: u32 = 5;
const OP_DEVICE_CREATE_TEXTURE: u32 = 6;
const OP_TEXTURE_CREATE_VIEW: u32 = 7;
const OP_DEVICE_CREATE_SHADER_MODULE: u32 = 8;
const OP_DEVICE_CREATE_COMMAND_ENCODER: u32 = 9;
const OP_COMMAND_ENCODER_COPY_BUFFER_TO_BUFFER: u32 = 10;
const OP_COMMAND_ENCODER_FINISH: u32 = 11;
const OP_QUEUE_SUBMIT: u32 = 12;
const OP_QUEUE_WRITE_BUFFER: u32 = 13;
const OP_QUEUE_ON_SUBMITTED_WORK_DONE: u32 = 14;
const OP_DEVICE_PUSH_ERROR_SCOPE: u32 = 15;
const OP_DEVICE_POP_ERROR_SCOPE: u32 = 16;
const OP_BUFFER_MAP_ASYNC: u32 = 17;
const OP_BUFFER_UPDATE_MAPPED_DATA: u32 = 18;
const OP_BUFFER_UNMAP: u32 = 19;
const OP_BUFFER_DESTROY: u32 = 20;
const OP_DEVICE_DESTROY: u32 = 21;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Drop the client's last reference to an object.
    DestroyObject {
        object_type: ObjectType,
        handle: ObjectHandle,
    },
    InstanceRequestAdapter {
        instance: ObjectHandle,
        future: FutureId,
        /// Reserved by the client; filled by the server on success.
        adapter: ObjectHandle,
        options: RequestAdapterOptions,
    },
    AdapterRequestDevice {
        adapter: ObjectHandle,
        future: FutureId,
        device_lost_future: FutureId,
        device: ObjectHandle,
        queue: ObjectHandle,
        descriptor: DeviceDescriptor,
    },
    DeviceCreateBuffer {
        device: ObjectHandle,
        result: ObjectHandle,
        descriptor: BufferDescriptor,
        /// Memory-transfer create payloads.
        read_handle: Option<Vec<u8>>,
        write_handle: Option<Vec<u8>>,
    },
    DeviceCreateErrorBuffer {
        device: ObjectHandle,
        result: ObjectHandle,
        descriptor: BufferDescriptor,
    },
    DeviceCreateTexture {
        device: ObjectHandle,
        result: ObjectHandle,
        descriptor: TextureDescriptor,
    },
    TextureCreateView {
        texture: ObjectHandle,
        result: ObjectHandle,
        descriptor: TextureViewDescriptor,
    },
    DeviceCreateShaderModule {
        device: ObjectHandle,
        result: ObjectHandle,
        descriptor: ShaderModuleDescriptor,
    },
    DeviceCreateCommandEncoder {
        device: ObjectHandle,
        result: ObjectHandle,
        label: Option<String>,
    },
    CommandEncoderCopyBufferToBuffer {
        encoder: ObjectHandle,
        source: ObjectHandle,
        source_offset: u64,
        destination: ObjectHandle,
        destination_offset: u64,
        size: u64,
    },
    CommandEncoderFinish {
        encoder: ObjectHandle,
        result: ObjectHandle,
        label: Option<String>,
    },
    QueueSubmit {
        queue: ObjectHandle,
        command_buffers: Vec<ObjectHandle>,
    },
    QueueWriteBuffer {
        queue: ObjectHandle,
        buffer: ObjectHandle,
        offset: u64,
        data: Vec<u8>,
    },
    QueueOnSubmittedWorkDone {
        queue: ObjectHandle,
        future: FutureId,
    },
    DevicePushErrorScope {
        device: ObjectHandle,
        filter: ErrorFilter,
    },
    DevicePopErrorScope {
        device: ObjectHandle,
        future: FutureId,
    },
    BufferMapAsync {
        buffer: ObjectHandle,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    /// Write-handle data update flushed on unmap.
    BufferUpdateMappedData {
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
        data: Vec<u8>,
    },
    BufferUnmap {
        buffer: ObjectHandle,
    },
    BufferDestroy {
        buffer: ObjectHandle,
    },
    DeviceDestroy {
        device: ObjectHandle,
    },
}

impl WireCommand {
    pub fn opcode(&self) -> u32 {
        match self {
            WireCommand::DestroyObject { .. } => OP_DESTROY_OBJECT,
            WireCommand::InstanceRequestAdapter { .. } => OP_INSTANCE_REQUEST_ADAPTER,
            WireCommand::AdapterRequestDevice { .. } => OP_ADAPTER_REQUEST_DEVICE,
            WireCommand::DeviceCreateBuffer { .. } => OP_DEVICE_CREATE_BUFFER,
            WireCommand::DeviceCreateErrorBuffer { .. } => OP_DEVICE_CREATE_ERROR_BUFFER,
            WireCommand::DeviceCreateTexture { .. } => OP_DEVICE_CREATE_TEXTURE,
            WireCommand::TextureCreateView { .. } => OP_TEXTURE_CREATE_VIEW,
            WireCommand::DeviceCreateShaderModule { .. } => OP_DEVICE_CREATE_SHADER_MODULE,
            WireCommand::DeviceCreateCommandEncoder { .. } => OP_DEVICE_CREATE_COMMAND_ENCODER,
            WireCommand::CommandEncoderCopyBufferToBuffer { .. } => {
                OP_COMMAND_ENCODER_COPY_BUFFER_TO_BUFFER
            }
            WireCommand::CommandEncoderFinish { .. } => OP_COMMAND_ENCODER_FINISH,
            WireCommand::QueueSubmit { .. } => OP_QUEUE_SUBMIT,
            WireCommand::QueueWriteBuffer { .. } => OP_QUEUE_WRITE_BUFFER,
            WireCommand::QueueOnSubmittedWorkDone { .. } => OP_QUEUE_ON_SUBMITTED_WORK_DONE,
            WireCommand::DevicePushErrorScope { .. } => OP_DEVICE_PUSH_ERROR_SCOPE,
            WireCommand::DevicePopErrorScope { .. } => OP_DEVICE_POP_ERROR_SCOPE,
            WireCommand::BufferMapAsync { .. } => OP_BUFFER_MAP_ASYNC,
            WireCommand::BufferUpdateMappedData { .. } => OP_BUFFER_UPDATE_MAPPED_DATA,
            WireCommand::BufferUnmap { .. } => OP_BUFFER_UNMAP,
            WireCommand::BufferDestroy { .. } => OP_BUFFER_DESTROY,
            WireCommand::DeviceDestroy { .. } => OP_DEVICE_DESTROY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WireCommand::DestroyObject { .. } => "DestroyObject",
            WireCommand::InstanceRequestAdapter { .. } => "InstanceRequestAdapter",
            WireCommand::AdapterRequestDevice { .. } => "AdapterRequestDevice",
            WireCommand::DeviceCreateBuffer { .. } => "DeviceCreateBuffer",
            WireCommand::DeviceCreateErrorBuffer { .. } => "DeviceCreateErrorBuffer",
            WireCommand::DeviceCreateTexture { .. } => "DeviceCreateTexture",
            WireCommand::TextureCreateView { .. } => "TextureCreateView",
            WireCommand::DeviceCreateShaderModule { .. } => "DeviceCreateShaderModule",
            WireCommand::DeviceCreateCommandEncoder { .. } => "DeviceCreateCommandEncoder",
            WireCommand::CommandEncoderCopyBufferToBuffer { .. } => {
                "CommandEncoderCopyBufferToBuffer"
            }
            WireCommand::CommandEncoderFinish { .. } => "CommandEncoderFinish",
            WireCommand::QueueSubmit { .. } => "QueueSubmit",
            WireCommand::QueueWriteBuffer { .. } => "QueueWriteBuffer",
            WireCommand::QueueOnSubmittedWorkDone { .. } => "QueueOnSubmittedWorkDone",
            WireCommand::DevicePushErrorScope { .. } => "DevicePushErrorScope",
            WireCommand::DevicePopErrorScope { .. } => "DevicePopErrorScope",
            WireCommand::BufferMapAsync { .. } => "BufferMapAsync",
            WireCommand::BufferUpdateMappedData { .. } => "BufferUpdateMappedData",
            WireCommand::BufferUnmap { .. } => "BufferUnmap",
            WireCommand::BufferDestroy { .. } => "BufferDestroy",
            WireCommand::DeviceDestroy { .. } => "DeviceDestroy",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        write_frame(out, self.opcode(), |w| self.encode_payload(w));
    }

    fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            WireCommand::DestroyObject {
                object_type,
                handle,
            } => {
                w.u32(*object_type as u32);
                w.handle(*handle);
            }
            WireCommand::InstanceRequestAdapter {
                instance,
                future,
                adapter,
                options,
            } => {
                w.handle(*instance);
                w.u64(future.0);
                w.handle(*adapter);
                options.encode(w);
            }
            WireCommand::AdapterRequestDevice {
                adapter,
                future,
                device_lost_future,
                device,
                queue,
                descriptor,
            } => {
                w.handle(*adapter);
                w.u64(future.0);
                w.u64(device_lost_future.0);
                w.handle(*device);
                w.handle(*queue);
                descriptor.encode(w);
            }
            WireCommand::DeviceCreateBuffer {
                device,
                result,
                descriptor,
                read_handle,
                write_handle,
            } => {
                w.handle(*device);
                w.handle(*result);
                descriptor.encode(w);
                w.opt_bytes(read_handle.as_deref());
                w.opt_bytes(write_handle.as_deref());
            }
            WireCommand::DeviceCreateErrorBuffer {
                device,
                result,
                descriptor,
            } => {
                w.handle(*device);
                w.handle(*result);
                descriptor.encode(w);
            }
            WireCommand::DeviceCreateTexture {
                device,
                result,
                descriptor,
            } => {
                w.handle(*device);
                w.handle(*result);
                descriptor.encode(w);
            }
            WireCommand::TextureCreateView {
                texture,
                result,
                descriptor,
            } => {
                w.handle(*texture);
                w.handle(*result);
                descriptor.encode(w);
            }
            WireCommand::DeviceCreateShaderModule {
                device,
                result,
                descriptor,
            } => {
                w.handle(*device);
                w.handle(*result);
                descriptor.encode(w);
            }
            WireCommand::DeviceCreateCommandEncoder {
                device,
                result,
                label,
            } => {
                w.handle(*device);
                w.handle(*result);
                w.opt_str(label.as_deref());
            }
            WireCommand::CommandEncoderCopyBufferToBuffer {
                encoder,
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => {
                w.handle(*encoder);
                w.handle(*source);
                w.u64(*source_offset);
                w.handle(*destination);
                w.u64(*destination_offset);
                w.u64(*size);
            }
            WireCommand::CommandEncoderFinish {
                encoder,
                result,
                label,
            } => {
                w.handle(*encoder);
                w.handle(*result);
                w.opt_str(label.as_deref());
            }
            WireCommand::QueueSubmit {
                queue,
                command_buffers,
            } => {
                w.handle(*queue);
                w.handles(command_buffers);
            }
            WireCommand::QueueWriteBuffer {
                queue,
                buffer,
                offset,
                data,
            } => {
                w.handle(*queue);
                w.handle(*buffer);
                w.u64(*offset);
                w.bytes(data);
            }
            WireCommand::QueueOnSubmittedWorkDone { queue, future } => {
                w.handle(*queue);
                w.u64(future.0);
            }
            WireCommand::DevicePushErrorScope { device, filter } => {
                w.handle(*device);
                w.u32(filter.to_u32());
            }
            WireCommand::DevicePopErrorScope { device, future } => {
                w.handle(*device);
                w.u64(future.0);
            }
            WireCommand::BufferMapAsync {
                buffer,
                future,
                mode,
                offset,
                size,
            } => {
                w.handle(*buffer);
                w.u64(future.0);
                w.u32(mode.bits());
                w.u64(*offset);
                w.u64(*size);
            }
            WireCommand::BufferUpdateMappedData {
                buffer,
                offset,
                size,
                data,
            } => {
                w.handle(*buffer);
                w.u64(*offset);
                w.u64(*size);
                w.bytes(data);
            }
            WireCommand::BufferUnmap { buffer }
            | WireCommand::BufferDestroy { buffer } => w.handle(*buffer),
            WireCommand::DeviceDestroy { device } => w.handle(*device),
        }
    }

    /// Decode the first command of `bytes`, returning it with the number of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (opcode, payload, consumed) = read_frame(bytes)?;
        let mut r = WireReader::new(payload);
        let cmd = Self::decode_payload(opcode, &mut r)?;
        r.finish()?;
        Ok((cmd, consumed))
    }

    fn decode_payload(opcode: u32, r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(match opcode {
            OP_DESTROY_OBJECT => {
                let raw = r.u32()?;
                let object_type = ObjectType::from_u32(raw).ok_or(DecodeError::InvalidEnum {
                    kind: "ObjectType",
                    value: raw,
                })?;
                WireCommand::DestroyObject {
                    object_type,
                    handle: r.handle()?,
                }
            }
            OP_INSTANCE_REQUEST_ADAPTER => WireCommand::InstanceRequestAdapter {
                instance: r.handle()?,
                future: FutureId(r.u64()?),
                adapter: r.handle()?,
                options: RequestAdapterOptions::decode(r)?,
            },
            OP_ADAPTER_REQUEST_DEVICE => WireCommand::AdapterRequestDevice {
                adapter: r.handle()?,
                future: FutureId(r.u64()?),
                device_lost_future: FutureId(r.u64()?),
                device: r.handle()?,
                queue: r.handle()?,
                descriptor: DeviceDescriptor::decode(r)?,
            },
            OP_DEVICE_CREATE_BUFFER => WireCommand::DeviceCreateBuffer {
                device: r.handle()?,
                result: r.handle()?,
                descriptor: BufferDescriptor::decode(r)?,
                read_handle: r.opt_bytes()?.map(<[u8]>::to_vec),
                write_handle: r.opt_bytes()?.map(<[u8]>::to_vec),
            },
            OP_DEVICE_CREATE_ERROR_BUFFER => WireCommand::DeviceCreateErrorBuffer {
                device: r.handle()?,
                result: r.handle()?,
                descriptor: BufferDescriptor::decode(r)?,
            },
            OP_DEVICE_CREATE_TEXTURE => WireCommand::DeviceCreateTexture {
                device: r.handle()?,
                result: r.handle()?,
                descriptor: TextureDescriptor::decode(r)?,
            },
            OP_TEXTURE_CREATE_VIEW => WireCommand::TextureCreateView {
                texture: r.handle()?,
                result: r.handle()?,
                descriptor: TextureViewDescriptor::decode(r)?,
            },
            OP_DEVICE_CREATE_SHADER_MODULE => WireCommand::DeviceCreateShaderModule {
                device: r.handle()?,
                result: r.handle()?,
                descriptor: ShaderModuleDescriptor::decode(r)?,
            },
            OP_DEVICE_CREATE_COMMAND_ENCODER => WireCommand::DeviceCreateCommandEncoder {
                device: r.handle()?,
                result: r.handle()?,
                label: r.opt_string()?,
            },
            OP_COMMAND_ENCODER_COPY_BUFFER_TO_BUFFER => {
                WireCommand::CommandEncoderCopyBufferToBuffer {
                    encoder: r.handle()?,
                    source: r.handle()?,
                    source_offset: r.u64()?,
                    destination: r.handle()?,
                    destination_offset: r.u64()?,
                    size: r.u64()?,
                }
            }
            OP_COMMAND_ENCODER_FINISH => WireCommand::CommandEncoderFinish {
                encoder: r.handle()?,
                result: r.handle()?,
                label: r.opt_string()?,
            },
            OP_QUEUE_SUBMIT => WireCommand::QueueSubmit {
                queue: r.handle()?,
                command_buffers: r.handles()?,
            },
            OP_QUEUE_WRITE_BUFFER => WireCommand::QueueWriteBuffer {
                queue: r.handle()?,
                buffer: r.handle()?,
                offset: r.u64()?,
                data: r.bytes()?.to_vec(),
            },
            OP_QUEUE_ON_SUBMITTED_WORK_DONE => WireCommand::QueueOnSubmittedWorkDone {
                queue: r.handle()?,
                future: FutureId(r.u64()?),
            },
            OP_DEVICE_PUSH_ERROR_SCOPE => WireCommand::DevicePushErrorScope {
                device: r.handle()?,
                filter: ErrorFilter::from_u32(r.u32()?)?,
            },
            OP_DEVICE_POP_ERROR_SCOPE => WireCommand::DevicePopErrorScope {
                device: r.handle()?,
                future: FutureId(r.u64()?),
            },
            OP_BUFFER_MAP_ASYNC => WireCommand::BufferMapAsync {
                buffer: r.handle()?,
                future: FutureId(r.u64()?),
                mode: read_map_mode(r)?,
                offset: r.u64()?,
                size: r.u64()?,
            },
            OP_BUFFER_UPDATE_MAPPED_DATA => WireCommand::BufferUpdateMappedData {
                buffer: r.handle()?,
                offset: r.u64()?,
                size: r.u64()?,
                data: r.bytes()?.to_vec(),
            },
            OP_BUFFER_UNMAP => WireCommand::BufferUnmap {
                buffer: r.handle()?,
            },
            OP_BUFFER_DESTROY => WireCommand::BufferDestroy {
                buffer: r.handle()?,
            },
            OP_DEVICE_DESTROY => WireCommand::DeviceDestroy {
                device: r.handle()?,
            },
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }
}
