mod harness;

use aero_wire::client::CallbackMode;
use aero_wire::test_utils::WirePair;
use aero_wire::ClientError;
use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, DeviceDescriptor, DeviceLostReason, MapAsyncStatus, MapMode,
    QueueWorkDoneStatus, ReturnCommand, TextureDescriptor,
};
use anyhow::Result;
use pretty_assertions::assert_eq;

use harness::{
    init_tracing, log, record_map_with, record_work_done, request_device, requested_device,
};

#[test]
fn disconnect_delivers_every_outstanding_future_once() -> Result<()> {
    init_tracing();
    let mut pair = WirePair::new();
    let instance = pair.instance();
    let adapter = pair.adapter(instance);
    let record = request_device(&mut pair, adapter, &DeviceDescriptor::default())?;
    let device = requested_device(&record)?;
    let queue = pair.client.device_queue(device)?;
    let buffer = pair.client.create_buffer(
        device,
        &BufferDescriptor {
            size: 4,
            usage: BufferUsages::MAP_READ,
            ..BufferDescriptor::default()
        },
    )?;

    let work = log();
    let maps = log();
    pair.client
        .on_submitted_work_done(queue, record_work_done(CallbackMode::AllowProcessEvents, &work))?;
    pair.client
        .on_submitted_work_done(queue, record_work_done(CallbackMode::WaitAnyOnly, &work))?;
    pair.client.map_async(
        buffer,
        MapMode::READ,
        0,
        4,
        record_map_with(CallbackMode::WaitAnyOnly, &maps),
    )?;
    assert!(pair.client.pending_bytes() > 0);

    pair.client.disconnect();
    assert!(pair.client.is_disconnected());
    assert_eq!(pair.client.outstanding_futures(), 0);
    assert_eq!(pair.client.pending_bytes(), 0);

    let dropped = "the wire client was disconnected".to_owned();
    assert_eq!(
        *work.borrow(),
        vec![
            (QueueWorkDoneStatus::InstanceDropped, dropped.clone()),
            (QueueWorkDoneStatus::InstanceDropped, dropped.clone()),
        ]
    );
    assert_eq!(
        *maps.borrow(),
        vec![(MapAsyncStatus::InstanceDropped, dropped.clone())]
    );
    assert_eq!(
        record.borrow().lost,
        vec![(DeviceLostReason::InstanceDropped, dropped)]
    );

    pair.client.disconnect();
    pair.client.process_events();
    assert_eq!(work.borrow().len(), 2);
    assert_eq!(maps.borrow().len(), 1);
    assert_eq!(record.borrow().lost.len(), 1);
    Ok(())
}

#[test]
fn futures_created_after_disconnect_are_dropped_immediately() -> Result<()> {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device)?;
    pair.client.disconnect();

    let work = log();
    pair.client
        .on_submitted_work_done(queue, record_work_done(CallbackMode::WaitAnyOnly, &work))?;
    assert_eq!(work.borrow().len(), 1);
    assert_eq!(work.borrow()[0].0, QueueWorkDoneStatus::InstanceDropped);

    // Objects can still be created locally but nothing goes out.
    pair.client
        .create_texture(device, &TextureDescriptor::default())?;
    assert_eq!(pair.client.pending_bytes(), 0);
    assert!(!pair.client.flush());
    Ok(())
}

#[test]
fn returns_after_disconnect_are_ignored() -> Result<()> {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device)?;
    let work = log();
    let future = pair
        .client
        .on_submitted_work_done(queue, record_work_done(CallbackMode::AllowSpontaneous, &work))?;
    pair.flush_client()?;
    pair.server.process_events();
    pair.server.flush();

    pair.client.disconnect();
    pair.client.receive_pending()?;
    let bytes = ReturnCommand::QueueWorkDoneCallback {
        future,
        status: QueueWorkDoneStatus::Success,
        message: String::new(),
    }
    .encode();
    assert_eq!(pair.client.handle_commands(&bytes)?, bytes.len());
    assert_eq!(
        *work.borrow(),
        vec![(
            QueueWorkDoneStatus::InstanceDropped,
            "the wire client was disconnected".to_owned()
        )]
    );
    Ok(())
}

#[test]
fn closed_transport_disconnects_on_flush() -> Result<()> {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device)?;

    let WirePair { mut client, server } = pair;
    drop(server);

    let work = log();
    client.on_submitted_work_done(queue, record_work_done(CallbackMode::WaitAnyOnly, &work))?;
    assert!(!client.flush());
    assert!(client.is_disconnected());
    assert_eq!(
        *work.borrow(),
        vec![(
            QueueWorkDoneStatus::InstanceDropped,
            "the wire client was disconnected".to_owned()
        )]
    );
    Ok(())
}

#[test]
fn releasing_unknown_objects_is_ignored_after_disconnect() -> Result<()> {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let texture = pair
        .client
        .create_texture(device, &TextureDescriptor::default())?;
    pair.client.release(texture)?;
    assert!(matches!(
        pair.client.release(texture),
        Err(ClientError::UnknownObject { .. })
    ));

    pair.client.release(device)?;
    pair.client.disconnect();
    pair.client.release(device)?;
    pair.client.release(texture)?;
    assert_eq!(pair.client.pending_bytes(), 0);
    Ok(())
}
