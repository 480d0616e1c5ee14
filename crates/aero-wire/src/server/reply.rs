//! Backend completions queued for serialization on the server thread.

use aero_wire_protocol::{
    AdapterInfo, DeviceLostReason, ErrorType, FutureId, MapAsyncStatus, MapMode, ObjectHandle,
    ObjectType, PopErrorScopeStatus, QueueWorkDoneStatus, RequestAdapterStatus,
    RequestDeviceStatus, ReturnCommand,
};
use tracing::{debug, trace};

use super::buffer::MappedRange;
use super::procs::{Procs, RequestAdapterResult, RequestDeviceResult};
use super::WireServer;
use crate::memory_transfer::ReadSource;

#[derive(Debug)]
pub enum ServerReply<O> {
    Adapter {
        adapter: ObjectHandle,
        future: FutureId,
        result: RequestAdapterResult<O>,
    },
    Device {
        device: ObjectHandle,
        queue: ObjectHandle,
        future: FutureId,
        result: RequestDeviceResult<O>,
    },
    Map {
        buffer: ObjectHandle,
        future: FutureId,
        status: MapAsyncStatus,
        message: String,
    },
    WorkDone {
        future: FutureId,
        status: QueueWorkDoneStatus,
        message: String,
    },
    PopErrorScope {
        future: FutureId,
        status: PopErrorScopeStatus,
        error_type: ErrorType,
        message: String,
    },
    DeviceLost {
        device: ObjectHandle,
        future: FutureId,
        reason: DeviceLostReason,
        message: String,
    },
    UncapturedError {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
}

impl<P: Procs> WireServer<P> {
    pub(super) fn send_return(&mut self, command: ReturnCommand) {
        trace!(command = command.name(), "serialize return");
        command.encode_into(&mut self.outgoing);
    }

    /// Serialize every completion the backend produced so far.
    pub(super) fn drain_replies(&mut self) {
        while let Ok(reply) = self.replies_rx.try_recv() {
            self.apply_reply(reply);
        }
    }

    /// Whether `handle` names a record that was reserved by a request and not yet filled.
    fn awaiting_backing(&self, object_type: ObjectType, handle: ObjectHandle) -> bool {
        self.objects
            .get(object_type, handle)
            .is_some_and(|object| object.backing.is_none())
    }

    fn apply_reply(&mut self, reply: ServerReply<P::Object>) {
        match reply {
            ServerReply::Adapter {
                adapter,
                future,
                result,
            } => {
                let live = self.awaiting_backing(ObjectType::Adapter, adapter);
                match result {
                    Ok(object) if live => {
                        let info = self.procs.adapter_info(&object);
                        let features = self.procs.adapter_features(&object);
                        if let Some(record) = self.objects.get_mut(ObjectType::Adapter, adapter) {
                            record.backing = Some(object);
                        }
                        self.send_return(ReturnCommand::InstanceRequestAdapterCallback {
                            future,
                            status: RequestAdapterStatus::Success,
                            message: String::new(),
                            info,
                            features,
                        });
                    }
                    Ok(object) => {
                        debug!(%adapter, "adapter request resolved for a released handle");
                        self.procs.release(object);
                    }
                    Err((status, message)) if live => {
                        self.send_return(ReturnCommand::InstanceRequestAdapterCallback {
                            future,
                            status,
                            message,
                            info: AdapterInfo::default(),
                            features: Vec::new(),
                        });
                    }
                    Err(_) => debug!(%adapter, "adapter request failed for a released handle"),
                }
            }
            ServerReply::Device {
                device,
                queue,
                future,
                result,
            } => {
                let live = self.awaiting_backing(ObjectType::Device, device);
                match result {
                    Ok(object) if live => {
                        let queue_object = self.procs.device_queue(&object);
                        let features = self.procs.device_features(&object);
                        match self.objects.get_mut(ObjectType::Queue, queue) {
                            Some(record) => record.backing = Some(queue_object),
                            None => self.procs.release(queue_object),
                        }
                        if let Some(record) = self.objects.get_mut(ObjectType::Device, device) {
                            record.backing = Some(object);
                        }
                        self.send_return(ReturnCommand::AdapterRequestDeviceCallback {
                            future,
                            status: RequestDeviceStatus::Success,
                            message: String::new(),
                            features,
                        });
                    }
                    Ok(object) => {
                        debug!(%device, "device request resolved for a released handle");
                        self.procs.release(object);
                    }
                    Err((status, message)) if live => {
                        self.send_return(ReturnCommand::AdapterRequestDeviceCallback {
                            future,
                            status,
                            message,
                            features: Vec::new(),
                        });
                    }
                    Err(_) => debug!(%device, "device request failed for a released handle"),
                }
            }
            ServerReply::Map {
                buffer,
                future,
                status,
                message,
            } => self.complete_map(buffer, future, status, message),
            ServerReply::WorkDone {
                future,
                status,
                message,
            } => self.send_return(ReturnCommand::QueueWorkDoneCallback {
                future,
                status,
                message,
            }),
            ServerReply::PopErrorScope {
                future,
                status,
                error_type,
                message,
            } => self.send_return(ReturnCommand::DevicePopErrorScopeCallback {
                future,
                status,
                error_type,
                message,
            }),
            ServerReply::DeviceLost {
                device,
                future,
                reason,
                message,
            } => {
                if self.objects.get(ObjectType::Device, device).is_none() {
                    debug!(%device, ?reason, "device lost after release");
                    return;
                }
                self.send_return(ReturnCommand::DeviceLostCallback {
                    device,
                    future,
                    reason,
                    message,
                });
            }
            ServerReply::UncapturedError {
                device,
                error_type,
                message,
            } => {
                if self.objects.get(ObjectType::Device, device).is_none() {
                    debug!(%device, ?error_type, "uncaptured error after release");
                    return;
                }
                self.send_return(ReturnCommand::DeviceUncapturedErrorCallback {
                    device,
                    error_type,
                    message,
                });
            }
        }
    }

    /// Settle the buffer's pending map and reply, carrying the read data for a successful read
    /// map.
    fn complete_map(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        mut status: MapAsyncStatus,
        mut message: String,
    ) {
        let Some(record) = self.objects.get_mut(ObjectType::Buffer, buffer) else {
            debug!(%buffer, "map resolved for a released buffer");
            return;
        };
        let backing = record.backing.clone();
        let mut read_data = Vec::new();
        if let (Some(state), Some(backing)) = (record.buffer_mut(), backing) {
            if let Some(pending) = state.pending_map.filter(|pending| pending.future == future) {
                state.pending_map = None;
                if status == MapAsyncStatus::Success {
                    let range = MappedRange {
                        mode: pending.mode,
                        offset: pending.offset,
                        size: pending.size,
                    };
                    let read = if pending.mode == MapMode::READ {
                        let source = self
                            .procs
                            .buffer_mapped_range(&backing, pending.offset, pending.size);
                        match (state.read_handle.as_ref(), source) {
                            (Some(handle), Some(source)) => handle
                                .serialize_data_update(source, pending.offset)
                                .map_err(|err| err.to_string()),
                            (None, _) => Err("buffer has no read handle".to_owned()),
                            (_, None) => Err("backend did not expose the mapped range".to_owned()),
                        }
                    } else {
                        Ok(Vec::new())
                    };
                    match read {
                        Ok(data) => {
                            read_data = data;
                            state.mapped = Some(range);
                        }
                        Err(reason) => {
                            debug!(%buffer, reason, "failing read map");
                            status = MapAsyncStatus::Error;
                            message = reason;
                            self.procs.buffer_unmap(&backing);
                        }
                    }
                }
            }
        }
        self.send_return(ReturnCommand::BufferMapAsyncCallback {
            buffer,
            future,
            status,
            message,
            read_data,
        });
    }
}
