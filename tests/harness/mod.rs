#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use aero_wire::client::{
    Adapter, CallbackMode, Device, DeviceCallbacks, DeviceLostCallbackInfo,
    MapAsyncCallbackInfo, PopErrorScopeCallbackInfo, QueueWorkDoneCallbackInfo,
    RequestDeviceCallbackInfo,
};
use aero_wire::test_utils::WirePair;
use aero_wire_protocol::{
    DeviceDescriptor, DeviceLostReason, ErrorType, MapAsyncStatus, PopErrorScopeStatus,
    QueueWorkDoneStatus, RequestDeviceStatus,
};
use anyhow::{anyhow, Result};

/// Shared, append-only record of callback invocations.
pub type Log<T> = Rc<RefCell<Vec<T>>>;

pub fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn record_map(log: &Log<(MapAsyncStatus, String)>) -> MapAsyncCallbackInfo {
    record_map_with(CallbackMode::AllowSpontaneous, log)
}

pub fn record_map_with(
    mode: CallbackMode,
    log: &Log<(MapAsyncStatus, String)>,
) -> MapAsyncCallbackInfo {
    let log = Rc::clone(log);
    MapAsyncCallbackInfo::new(mode, move |_, status, message| {
        log.borrow_mut().push((status, message))
    })
}

pub fn record_work_done(
    mode: CallbackMode,
    log: &Log<(QueueWorkDoneStatus, String)>,
) -> QueueWorkDoneCallbackInfo {
    let log = Rc::clone(log);
    QueueWorkDoneCallbackInfo::new(mode, move |_, status, message| {
        log.borrow_mut().push((status, message))
    })
}

pub fn record_pop(
    log: &Log<(PopErrorScopeStatus, ErrorType, String)>,
) -> PopErrorScopeCallbackInfo {
    let log = Rc::clone(log);
    PopErrorScopeCallbackInfo::new(CallbackMode::AllowSpontaneous, move |_, status, ty, message| {
        log.borrow_mut().push((status, ty, message))
    })
}

/// Everything a device request reported back.
#[derive(Default)]
pub struct DeviceRecord {
    pub requests: Vec<(RequestDeviceStatus, Option<Device>, String)>,
    pub lost: Vec<(DeviceLostReason, String)>,
    pub uncaptured: Vec<(ErrorType, String)>,
}

/// Request a device, recording the request, device-lost and uncaptured-error callbacks, and run
/// one round trip.
pub fn request_device(
    pair: &mut WirePair,
    adapter: Adapter,
    descriptor: &DeviceDescriptor,
) -> Result<Rc<RefCell<DeviceRecord>>> {
    let record = Rc::new(RefCell::new(DeviceRecord::default()));
    let lost = Rc::clone(&record);
    let uncaptured = Rc::clone(&record);
    let requested = Rc::clone(&record);
    let callbacks = DeviceCallbacks::new(DeviceLostCallbackInfo::new(
        CallbackMode::AllowSpontaneous,
        move |_, _, reason, message| lost.borrow_mut().lost.push((reason, message)),
    ))
    .with_uncaptured_error(move |_, error_type, message| {
        uncaptured
            .borrow_mut()
            .uncaptured
            .push((error_type, message.to_owned()))
    });
    pair.client.request_device(
        adapter,
        descriptor,
        callbacks,
        RequestDeviceCallbackInfo::new(
            CallbackMode::AllowSpontaneous,
            move |_, status, device, message| {
                requested.borrow_mut().requests.push((status, device, message))
            },
        ),
    )?;
    pair.roundtrip()?;
    Ok(record)
}

/// The device from a successful [`request_device`].
pub fn requested_device(record: &Rc<RefCell<DeviceRecord>>) -> Result<Device> {
    match record.borrow().requests.as_slice() {
        [(RequestDeviceStatus::Success, Some(device), _)] => Ok(*device),
        other => Err(anyhow!("device request did not succeed: {other:?}")),
    }
}
