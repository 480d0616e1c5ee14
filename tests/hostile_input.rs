mod harness;

use aero_wire::client::CallbackMode;
use aero_wire::error::ObjectError;
use aero_wire::test_utils::WirePair;
use aero_wire::WireError;
use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, DecodeError, DeviceDescriptor, FutureId, MapAsyncStatus,
    MapMode, ObjectHandle, ObjectType, OccupyError, QueueWorkDoneStatus, RequestAdapterOptions,
    ReturnCommand, TextureDescriptor, WireCommand,
};
use pretty_assertions::assert_eq;

use harness::{init_tracing, log, record_map_with};

fn unknown(object_type: ObjectType, handle: ObjectHandle) -> WireError {
    WireError::Object(ObjectError::UnknownObject {
        object_type,
        handle,
    })
}

#[test]
fn dangling_handle_is_rejected() {
    init_tracing();
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device).unwrap();
    pair.flush_client().unwrap();

    let dangling = ObjectHandle::new(99, 0);
    let bytes = WireCommand::QueueWriteBuffer {
        queue: queue.handle(),
        buffer: dangling,
        offset: 0,
        data: vec![1],
    }
    .encode();
    assert_eq!(
        pair.server.handle_commands(&bytes),
        Err(unknown(ObjectType::Buffer, dangling))
    );
}

#[test]
fn stale_generation_does_not_reach_the_new_object() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device).unwrap();
    let descriptor = BufferDescriptor {
        size: 4,
        usage: BufferUsages::COPY_DST,
        ..BufferDescriptor::default()
    };

    let old = pair.client.create_buffer(device, &descriptor).unwrap();
    pair.client.release(old).unwrap();
    let new = pair.client.create_buffer(device, &descriptor).unwrap();
    pair.flush_client().unwrap();
    assert_eq!(new.handle().id, old.handle().id);
    assert!(new.handle().generation > old.handle().generation);

    let bytes = WireCommand::QueueWriteBuffer {
        queue: queue.handle(),
        buffer: old.handle(),
        offset: 0,
        data: vec![0xff; 4],
    }
    .encode();
    assert_eq!(
        pair.server.handle_commands(&bytes),
        Err(unknown(ObjectType::Buffer, old.handle()))
    );
    let backing = *pair.server.buffer(new.handle()).unwrap();
    assert_eq!(pair.procs().buffer_data(backing), Some(&[0, 0, 0, 0][..]));
}

#[test]
fn submit_with_one_bad_handle_applies_nothing() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device).unwrap();

    let source = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                size: 4,
                usage: BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
                ..BufferDescriptor::default()
            },
        )
        .unwrap();
    let destination = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                size: 4,
                usage: BufferUsages::COPY_DST,
                ..BufferDescriptor::default()
            },
        )
        .unwrap();
    pair.client
        .queue_write_buffer(queue, source, 0, &[1, 2, 3, 4])
        .unwrap();
    let encoder = pair.client.create_command_encoder(device, None).unwrap();
    pair.client
        .copy_buffer_to_buffer(encoder, source, 0, destination, 0, 4)
        .unwrap();
    let commands = pair.client.finish(encoder, None).unwrap();
    pair.flush_client().unwrap();

    let bogus = ObjectHandle::new(commands.handle().id + 10, 0);
    let bytes = WireCommand::QueueSubmit {
        queue: queue.handle(),
        command_buffers: vec![commands.handle(), bogus],
    }
    .encode();
    assert_eq!(
        pair.server.handle_commands(&bytes),
        Err(unknown(ObjectType::CommandBuffer, bogus))
    );

    let backing = *pair.server.buffer(destination.handle()).unwrap();
    assert_eq!(pair.procs().buffer_data(backing), Some(&[0, 0, 0, 0][..]));
}

#[test]
fn truncated_and_unknown_commands_fail_to_decode() {
    let mut pair = WirePair::new();
    let instance = pair.instance();

    let mut bytes = WireCommand::InstanceRequestAdapter {
        instance: instance.handle(),
        future: FutureId(1),
        adapter: ObjectHandle::new(1, 0),
        options: RequestAdapterOptions::default(),
    }
    .encode();
    bytes.pop();
    assert!(matches!(
        pair.server.handle_commands(&bytes),
        Err(WireError::Decode(_))
    ));
    assert_eq!(pair.server.live_objects(), 1);

    let mut header = Vec::new();
    header.extend_from_slice(&0xdead_u32.to_le_bytes());
    header.extend_from_slice(&8u32.to_le_bytes());
    assert_eq!(
        pair.server.handle_commands(&header),
        Err(WireError::Decode(DecodeError::UnknownOpcode(0xdead)))
    );
}

#[test]
fn commands_against_an_unresolved_adapter_are_rejected() {
    let mut pair = WirePair::new();
    let instance = pair.instance();

    let adapter = ObjectHandle::new(1, 0);
    let bytes = WireCommand::InstanceRequestAdapter {
        instance: instance.handle(),
        future: FutureId(1),
        adapter,
        options: RequestAdapterOptions::default(),
    }
    .encode();
    pair.server.handle_commands(&bytes).unwrap();

    // The backend has not answered yet, so the adapter has no backing object.
    let bytes = WireCommand::AdapterRequestDevice {
        adapter,
        future: FutureId(2),
        device_lost_future: FutureId(3),
        device: ObjectHandle::new(1, 0),
        queue: ObjectHandle::new(1, 0),
        descriptor: DeviceDescriptor::default(),
    }
    .encode();
    assert_eq!(
        pair.server.handle_commands(&bytes),
        Err(WireError::Object(ObjectError::NotAllocated {
            object_type: ObjectType::Adapter,
            handle: adapter,
        }))
    );
}

#[test]
fn result_handles_cannot_overwrite_live_objects() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let texture = pair
        .client
        .create_texture(device, &TextureDescriptor::default())
        .unwrap();
    pair.flush_client().unwrap();
    let objects = pair.server.live_objects();

    let bytes = WireCommand::DeviceCreateTexture {
        device: device.handle(),
        result: texture.handle(),
        descriptor: TextureDescriptor::default(),
    }
    .encode();
    assert_eq!(
        pair.server.handle_commands(&bytes),
        Err(WireError::Object(ObjectError::Occupy(OccupyError::AlreadyLive(
            texture.handle().id
        ))))
    );
    assert_eq!(pair.server.live_objects(), objects);

    let bytes = WireCommand::DeviceCreateTexture {
        device: device.handle(),
        result: ObjectHandle::NULL,
        descriptor: TextureDescriptor::default(),
    }
    .encode();
    assert_eq!(
        pair.server.handle_commands(&bytes),
        Err(WireError::Object(ObjectError::Occupy(OccupyError::Null)))
    );
}

#[test]
fn client_rejects_a_completion_of_the_wrong_kind() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                size: 4,
                usage: BufferUsages::MAP_READ,
                ..BufferDescriptor::default()
            },
        )
        .unwrap();
    let maps = log();
    let future = pair
        .client
        .map_async(
            buffer,
            MapMode::READ,
            0,
            4,
            record_map_with(CallbackMode::WaitAnyOnly, &maps),
        )
        .unwrap();

    let bytes = ReturnCommand::QueueWorkDoneCallback {
        future,
        status: QueueWorkDoneStatus::Success,
        message: String::new(),
    }
    .encode();
    assert_eq!(
        pair.client.handle_commands(&bytes),
        Err(WireError::Protocol {
            command: "QueueWorkDoneCallback",
            reason: "completion does not match the future's operation",
        })
    );
    assert!(maps.borrow().is_empty());

    // Completions for futures the client never issued are ignored.
    let bytes = ReturnCommand::QueueWorkDoneCallback {
        future: FutureId(future.0 + 100),
        status: QueueWorkDoneStatus::Success,
        message: String::new(),
    }
    .encode();
    assert_eq!(pair.client.handle_commands(&bytes), Ok(bytes.len()));
}

#[test]
fn second_map_request_does_not_replace_the_pending_one() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device).unwrap();
    let buffer = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                size: 4,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                ..BufferDescriptor::default()
            },
        )
        .unwrap();
    pair.client
        .queue_write_buffer(queue, buffer, 0, &[1, 2, 3, 4])
        .unwrap();
    let maps = log();
    let future = pair
        .client
        .map_async(
            buffer,
            MapMode::READ,
            0,
            4,
            record_map_with(CallbackMode::AllowSpontaneous, &maps),
        )
        .unwrap();
    pair.flush_client().unwrap();
    let queued = pair.server.pending_bytes();

    // The rejection is answered right away, without consulting the backend.
    let bytes = WireCommand::BufferMapAsync {
        buffer: buffer.handle(),
        future: FutureId(future.0 + 100),
        mode: MapMode::READ,
        offset: 0,
        size: 4,
    }
    .encode();
    assert_eq!(pair.server.handle_commands(&bytes), Ok(bytes.len()));
    assert!(pair.server.pending_bytes() > queued);

    pair.flush_server().unwrap();
    assert_eq!(
        *maps.borrow(),
        vec![(MapAsyncStatus::Success, String::new())]
    );
    assert_eq!(
        pair.client.get_mapped_range(buffer, 0, 4),
        Ok(vec![1, 2, 3, 4])
    );
}
