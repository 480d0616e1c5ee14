//! Server → client completions.

use crate::error::DecodeError;
use crate::frame::{read_frame, write_frame};
use crate::handle::ObjectHandle;
use crate::types::{
    AdapterInfo, DeviceLostReason, ErrorType, FutureId, MapAsyncStatus, PopErrorScopeStatus,
    QueueWorkDoneStatus, RequestAdapterStatus, RequestDeviceStatus,
};
use crate::wire::{WireReader, WireWriter};

const RET_INSTANCE_REQUEST_ADAPTER_CALLBACK: u32 = 0x1001;
const RET_ADAPTER_REQUEST_DEVICE_CALLBACK: u32 = 0x1002;
const RET_BUFFER_MAP_ASYNC_CALLBACK: u32 = 0x1003;
const RET_QUEUE_WORK_DONE_CALLBACK: u32 = 0x1004;
const RET_DEVICE_POP_ERROR_SCOPE_CALLBACK: u32 = 0x1005;
const RET_DEVICE_LOST_CALLBACK: u32 = 0x1006;
const RET_DEVICE_UNCAPTURED_ERROR_CALLBACK: u32 = 0x1007;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnCommand {
    InstanceRequestAdapterCallback {
        future: FutureId,
        status: RequestAdapterStatus,
        message: String,
        info: AdapterInfo,
        features: Vec<u32>,
    },
    AdapterRequestDeviceCallback {
        future: FutureId,
        status: RequestDeviceStatus,
        message: String,
        features: Vec<u32>,
    },
    BufferMapAsyncCallback {
        buffer: ObjectHandle,
        future: FutureId,
        status: MapAsyncStatus,
        message: String,
        /// Read-handle data update; empty unless a read map succeeded.
        read_data: Vec<u8>,
    },
    QueueWorkDoneCallback {
        future: FutureId,
        status: QueueWorkDoneStatus,
        message: String,
    },
    DevicePopErrorScopeCallback {
        future: FutureId,
        status: PopErrorScopeStatus,
        error_type: ErrorType,
        message: String,
    },
    DeviceLostCallback {
        device: ObjectHandle,
        future: FutureId,
        reason: DeviceLostReason,
        message: String,
    },
    DeviceUncapturedErrorCallback {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
}

impl ReturnCommand {
    pub fn opcode(&self) -> u32 {
        match self {
            ReturnCommand::InstanceRequestAdapterCallback { .. } => {
                RET_INSTANCE_REQUEST_ADAPTER_CALLBACK
            }
            ReturnCommand::AdapterRequestDeviceCallback { .. } => {
                RET_ADAPTER_REQUEST_DEVICE_CALLBACK
            }
            ReturnCommand::BufferMapAsyncCallback { .. } => RET_BUFFER_MAP_ASYNC_CALLBACK,
            ReturnCommand::QueueWorkDoneCallback { .. } => RET_QUEUE_WORK_DONE_CALLBACK,
            ReturnCommand::DevicePopErrorScopeCallback { .. } => {
                RET_DEVICE_POP_ERROR_SCOPE_CALLBACK
            }
            ReturnCommand::DeviceLostCallback { .. } => RET_DEVICE_LOST_CALLBACK,
            ReturnCommand::DeviceUncapturedErrorCallback { .. } => {
                RET_DEVICE_UNCAPTURED_ERROR_CALLBACK
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReturnCommand::InstanceRequestAdapterCallback { .. } => {
                "InstanceRequestAdapterCallback"
            }
            ReturnCommand::AdapterRequestDeviceCallback { .. } => "AdapterRequestDeviceCallback",
            ReturnCommand::BufferMapAsyncCallback { .. } => "BufferMapAsyncCallback",
            ReturnCommand::QueueWorkDoneCallback { .. } => "QueueWorkDoneCallback",
            ReturnCommand::DevicePopErrorScopeCallback { .. } => "DevicePopErrorScopeCallback",
            ReturnCommand::DeviceLostCallback { .. } => "DeviceLostCallback",
            ReturnCommand::DeviceUncapturedErrorCallback { .. } => {
                "DeviceUncapturedErrorCallback"
            }
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
            ReturnCommand::InstanceRequestAdapterCallback {
                future,
                status,
                message,
                info,
                features,
            } => {
                w.u64(future.0);
                w.u32(status.to_u32());
                w.str(message);
                info.encode(w);
                w.u32_array(features);
            }
            ReturnCommand::AdapterRequestDeviceCallback {
                future,
                status,
                message,
                features,
            } => {
                w.u64(future.0);
                w.u32(status.to_u32());
                w.str(message);
                w.u32_array(features);
            }
            ReturnCommand::BufferMapAsyncCallback {
                buffer,
                future,
                status,
                message,
                read_data,
            } => {
                w.handle(*buffer);
                w.u64(future.0);
                w.u32(status.to_u32());
                w.str(message);
                w.bytes(read_data);
            }
            ReturnCommand::QueueWorkDoneCallback {
                future,
                status,
                message,
            } => {
                w.u64(future.0);
                w.u32(status.to_u32());
                w.str(message);
            }
            ReturnCommand::DevicePopErrorScopeCallback {
                future,
                status,
                error_type,
                message,
            } => {
                w.u64(future.0);
                w.u32(status.to_u32());
                w.u32(error_type.to_u32());
                w.str(message);
            }
            ReturnCommand::DeviceLostCallback {
                device,
                future,
                reason,
                message,
            } => {
                w.handle(*device);
                w.u64(future.0);
                w.u32(reason.to_u32());
                w.str(message);
            }
            ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                error_type,
                message,
            } => {
                w.handle(*device);
                w.u32(error_type.to_u32());
                w.str(message);
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (opcode, payload, consumed) = read_frame(bytes)?;
        let mut r = WireReader::new(payload);
        let cmd = Self::decode_payload(opcode, &mut r)?;
        r.finish()?;
        Ok((cmd, consumed))
    }

    fn decode_payload(opcode: u32, r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(match opcode {
            RET_INSTANCE_REQUEST_ADAPTER_CALLBACK => {
                ReturnCommand::InstanceRequestAdapterCallback {
                    future: FutureId(r.u64()?),
                    status: RequestAdapterStatus::from_u32(r.u32()?)?,
                    message: r.string()?,
                    info: AdapterInfo::decode(r)?,
                    features: r.u32_array()?,
                }
            }
            RET_ADAPTER_REQUEST_DEVICE_CALLBACK => ReturnCommand::AdapterRequestDeviceCallback {
                future: FutureId(r.u64()?),
                status: RequestDeviceStatus::from_u32(r.u32()?)?,
                message: r.string()?,
                features: r.u32_array()?,
            },
            RET_BUFFER_MAP_ASYNC_CALLBACK => ReturnCommand::BufferMapAsyncCallback {
                buffer: r.handle()?,
                future: FutureId(r.u64()?),
                status: MapAsyncStatus::from_u32(r.u32()?)?,
                message: r.string()?,
                read_data: r.bytes()?.to_vec(),
            },
            RET_QUEUE_WORK_DONE_CALLBACK => ReturnCommand::QueueWorkDoneCallback {
                future: FutureId(r.u64()?),
                status: QueueWorkDoneStatus::from_u32(r.u32()?)?,
                message: r.string()?,
            },
            RET_DEVICE_POP_ERROR_SCOPE_CALLBACK => ReturnCommand::DevicePopErrorScopeCallback {
                future: FutureId(r.u64()?),
                status: PopErrorScopeStatus::from_u32(r.u32()?)?,
                error_type: ErrorType::from_u32(r.u32()?)?,
                message: r.string()?,
            },
            RET_DEVICE_LOST_CALLBACK => ReturnCommand::DeviceLostCallback {
                device: r.handle()?,
                future: FutureId(r.u64()?),
                reason: DeviceLostReason::from_u32(r.u32()?)?,
                message: r.string()?,
            },
            RET_DEVICE_UNCAPTURED_ERROR_CALLBACK => {
                ReturnCommand::DeviceUncapturedErrorCallback {
                    device: r.handle()?,
                    error_type: ErrorType::from_u32(r.u32()?)?,
                    message: r.string()?,
                }
            }
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_callback_round_trips() {
        let cmd = ReturnCommand::BufferMapAsyncCallback {
            buffer: ObjectHandle::new(7, 0),
            future: FutureId(3),
            status: MapAsyncStatus::Success,
            message: String::new(),
            read_data: vec![1, 2, 3, 4],
        };
        let bytes = cmd.encode();
        assert_eq!(ReturnCommand::decode(&bytes).unwrap(), (cmd, bytes.len()));
    }

    #[test]
    fn adapter_callback_round_trips() {
        let cmd = ReturnCommand::InstanceRequestAdapterCallback {
            future: FutureId(1),
            status: RequestAdapterStatus::Success,
            message: String::new(),
            info: AdapterInfo {
                vendor: "soft".into(),
                description: "deterministic".into(),
                vendor_id: 0x1af4,
                ..Default::default()
            },
            features: vec![1, 5],
        };
        let bytes = cmd.encode();
        assert_eq!(ReturnCommand::decode(&bytes).unwrap(), (cmd, bytes.len()));
    }

    #[test]
    fn unknown_status_is_fatal() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, RET_QUEUE_WORK_DONE_CALLBACK, |w| {
            w.u64(1);
            w.u32(99);
            w.str("");
        });
        assert_eq!(
            ReturnCommand::decode(&bytes),
            Err(DecodeError::InvalidEnum {
                kind: "QueueWorkDoneStatus",
                value: 99
            })
        );
    }

    #[test]
    fn client_opcodes_are_not_return_opcodes() {
        let bytes = crate::command::WireCommand::BufferUnmap {
            buffer: ObjectHandle::new(1, 0),
        }
        .encode();
        assert!(matches!(
            ReturnCommand::decode(&bytes),
            Err(DecodeError::UnknownOpcode(_))
        ));
    }
}
