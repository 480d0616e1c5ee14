mod harness;

use aero_wire::client::{BufferMapState, CallbackMode, WireClientConfig};
use aero_wire::memory_transfer::{
    ServerTransferService, SharedMemoryRegistry, SharedMemoryTransferService,
};
use aero_wire::test_utils::WirePair;
use aero_wire::{ClientError, WireServerConfig};
use aero_wire_protocol::{BufferDescriptor, BufferUsages, MapAsyncStatus, MapMode};
use pretty_assertions::assert_eq;

use harness::{init_tracing, log, record_map, record_map_with};

fn descriptor(size: u64, usage: BufferUsages) -> BufferDescriptor {
    BufferDescriptor {
        label: None,
        usage,
        size,
        mapped_at_creation: false,
    }
}

#[test]
fn read_map_delivers_server_contents() {
    init_tracing();
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device).unwrap();
    let buffer = pair
        .client
        .create_buffer(
            device,
            &descriptor(16, BufferUsages::MAP_READ | BufferUsages::COPY_DST),
        )
        .unwrap();
    pair.client
        .queue_write_buffer(queue, buffer, 4, &[9, 8, 7, 6])
        .unwrap();

    let maps = log();
    pair.client
        .map_async(buffer, MapMode::READ, 4, 4, record_map(&maps))
        .unwrap();
    assert_eq!(pair.client.buffer_map_state(buffer), Ok(BufferMapState::Pending));
    pair.roundtrip().unwrap();

    assert_eq!(*maps.borrow(), vec![(MapAsyncStatus::Success, String::new())]);
    assert_eq!(pair.client.buffer_map_state(buffer), Ok(BufferMapState::Mapped));
    assert_eq!(
        pair.client.get_mapped_range(buffer, 4, 4),
        Ok(vec![9, 8, 7, 6])
    );
    assert_eq!(
        pair.client.get_mapped_range(buffer, 0, 4),
        Err(ClientError::OutsideMappedRange { offset: 0, size: 4 })
    );
    assert_eq!(
        pair.client.write_mapped_range(buffer, 4, &[0]),
        Err(ClientError::NotWritable(buffer.handle()))
    );

    pair.client.unmap(buffer).unwrap();
    assert_eq!(pair.client.buffer_map_state(buffer), Ok(BufferMapState::Unmapped));
    assert_eq!(
        pair.client.get_mapped_range(buffer, 4, 4),
        Err(ClientError::NotMapped(buffer.handle()))
    );
}

#[test]
fn destroy_before_the_success_arrives_aborts_the_map() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(device, &descriptor(16, BufferUsages::MAP_READ))
        .unwrap();

    let maps = log();
    pair.client
        .map_async(buffer, MapMode::READ, 0, 4, record_map(&maps))
        .unwrap();
    pair.flush_client().unwrap();
    pair.server.process_events();
    pair.server.flush();

    // The success is in flight; the client has not processed it yet.
    pair.client.destroy_buffer(buffer).unwrap();
    assert_eq!(
        *maps.borrow(),
        vec![(
            MapAsyncStatus::Aborted,
            "destroyed before mapping was resolved".to_owned()
        )]
    );

    pair.client.receive_pending().unwrap();
    pair.client.process_events();
    assert_eq!(maps.borrow().len(), 1);
    assert_eq!(pair.client.buffer_map_state(buffer), Ok(BufferMapState::Unmapped));
}

#[test]
fn unmap_while_pending_aborts_and_discards_the_late_success() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(device, &descriptor(8, BufferUsages::MAP_READ))
        .unwrap();

    let maps = log();
    pair.client
        .map_async(buffer, MapMode::READ, 0, 8, record_map(&maps))
        .unwrap();
    pair.flush_client().unwrap();
    pair.client.unmap(buffer).unwrap();
    pair.flush_server().unwrap();
    pair.roundtrip().unwrap();

    assert_eq!(
        *maps.borrow(),
        vec![(
            MapAsyncStatus::Aborted,
            "unmapped before mapping was resolved".to_owned()
        )]
    );
    assert_eq!(pair.client.buffer_map_state(buffer), Ok(BufferMapState::Unmapped));
}

#[test]
fn second_map_while_pending_fails_without_touching_the_first() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(device, &descriptor(8, BufferUsages::MAP_READ))
        .unwrap();

    let first = log();
    let second = log();
    pair.client
        .map_async(buffer, MapMode::READ, 0, 8, record_map(&first))
        .unwrap();
    let bytes = pair.client.pending_bytes();
    pair.client
        .map_async(buffer, MapMode::READ, 0, 4, record_map(&second))
        .unwrap();

    assert_eq!(pair.client.pending_bytes(), bytes);
    assert_eq!(
        *second.borrow(),
        vec![(
            MapAsyncStatus::Error,
            "buffer already has an outstanding map pending".to_owned()
        )]
    );
    assert!(first.borrow().is_empty());

    pair.roundtrip().unwrap();
    assert_eq!(*first.borrow(), vec![(MapAsyncStatus::Success, String::new())]);
    assert_eq!(second.borrow().len(), 1);
}

#[test]
fn local_validation_rejects_bad_requests() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(device, &descriptor(8, BufferUsages::MAP_READ))
        .unwrap();
    pair.flush_client().unwrap();

    let maps = log();
    for (mode, offset, size) in [
        (MapMode::WRITE, 0, 4),
        (MapMode::READ | MapMode::WRITE, 0, 4),
        (MapMode::READ, 4, 8),
        (MapMode::READ, u64::MAX, 2),
    ] {
        pair.client
            .map_async(buffer, mode, offset, size, record_map(&maps))
            .unwrap();
    }
    assert_eq!(pair.client.pending_bytes(), 0);
    let messages: Vec<_> = maps
        .borrow()
        .iter()
        .map(|(status, message)| {
            assert_eq!(*status, MapAsyncStatus::Error);
            message.clone()
        })
        .collect();
    assert_eq!(
        messages,
        vec![
            "buffer does not allow write mapping",
            "map mode must be exactly READ or WRITE",
            "mapped range is out of bounds",
            "mapped range is out of bounds",
        ]
    );
}

#[test]
fn write_map_flushes_on_unmap() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(
            device,
            &descriptor(8, BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC),
        )
        .unwrap();

    let maps = log();
    pair.client
        .map_async(buffer, MapMode::WRITE, 4, 4, record_map(&maps))
        .unwrap();
    pair.roundtrip().unwrap();
    assert_eq!(*maps.borrow(), vec![(MapAsyncStatus::Success, String::new())]);

    pair.client
        .write_mapped_range(buffer, 4, &[5, 6, 7, 8])
        .unwrap();
    assert_eq!(
        pair.client.write_mapped_range(buffer, 0, &[1]),
        Err(ClientError::OutsideMappedRange { offset: 0, size: 1 })
    );
    pair.client.unmap(buffer).unwrap();
    pair.flush_client().unwrap();

    let backing = *pair.server.buffer(buffer.handle()).unwrap();
    assert_eq!(
        pair.procs().buffer_data(backing),
        Some(&[0, 0, 0, 0, 5, 6, 7, 8][..])
    );
}

#[test]
fn mapped_at_creation_contents_survive_a_copy() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let queue = pair.client.device_queue(device).unwrap();

    let source = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                mapped_at_creation: true,
                ..descriptor(8, BufferUsages::COPY_SRC)
            },
        )
        .unwrap();
    assert_eq!(pair.client.buffer_map_state(source), Ok(BufferMapState::Mapped));
    pair.client
        .write_mapped_range(source, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();
    pair.client.unmap(source).unwrap();

    let destination = pair
        .client
        .create_buffer(
            device,
            &descriptor(8, BufferUsages::MAP_READ | BufferUsages::COPY_DST),
        )
        .unwrap();
    let encoder = pair.client.create_command_encoder(device, Some("copy")).unwrap();
    pair.client
        .copy_buffer_to_buffer(encoder, source, 0, destination, 0, 8)
        .unwrap();
    let commands = pair.client.finish(encoder, None).unwrap();
    pair.client.queue_submit(queue, &[commands]).unwrap();

    let maps = log();
    pair.client
        .map_async(destination, MapMode::READ, 0, 8, record_map(&maps))
        .unwrap();
    pair.roundtrip().unwrap();

    assert_eq!(*maps.borrow(), vec![(MapAsyncStatus::Success, String::new())]);
    assert_eq!(
        pair.client.get_mapped_range(destination, 0, 8),
        Ok(vec![1, 2, 3, 4, 5, 6, 7, 8])
    );

    // Without MAP_WRITE the creation mapping was the buffer's only write mapping.
    let again = log();
    pair.client
        .map_async(source, MapMode::WRITE, 0, 8, record_map(&again))
        .unwrap();
    assert_eq!(again.borrow()[0].0, MapAsyncStatus::Error);
}

#[test]
fn oversized_buffer_becomes_an_error_buffer() {
    let mut pair = WirePair::with_configs(
        WireClientConfig {
            max_allocation_size: 64,
            ..WireClientConfig::default()
        },
        WireServerConfig::default(),
    );
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(device, &descriptor(128, BufferUsages::MAP_READ))
        .unwrap();
    pair.flush_client().unwrap();
    assert!(pair.server.buffer(buffer.handle()).is_some());

    let maps = log();
    pair.client
        .map_async(buffer, MapMode::READ, 0, 4, record_map(&maps))
        .unwrap();
    assert_eq!(
        *maps.borrow(),
        vec![(MapAsyncStatus::Error, "buffer is an error buffer".to_owned())]
    );
}

#[test]
fn releasing_a_buffer_cancels_its_pending_map() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(device, &descriptor(8, BufferUsages::MAP_READ))
        .unwrap();

    let maps = log();
    pair.client
        .map_async(
            buffer,
            MapMode::READ,
            0,
            8,
            record_map_with(CallbackMode::AllowProcessEvents, &maps),
        )
        .unwrap();
    pair.client.release(buffer).unwrap();
    assert!(maps.borrow().is_empty());
    pair.client.process_events();
    assert_eq!(maps.borrow().len(), 1);
    assert_eq!(maps.borrow()[0].0, MapAsyncStatus::CallbackCancelled);

    pair.roundtrip().unwrap();
    pair.client.process_events();
    assert_eq!(maps.borrow().len(), 1);
    assert!(pair.server.buffer(buffer.handle()).is_none());
}

#[test]
fn shared_memory_transfer_moves_bytes_without_inline_payloads() {
    let registry = SharedMemoryRegistry::new();
    let mut pair = WirePair::with_configs(
        WireClientConfig {
            memory_transfer: Box::new(SharedMemoryTransferService::new(registry.clone())),
            ..WireClientConfig::default()
        },
        WireServerConfig {
            memory_transfer: Box::new(ServerTransferService::with_shared(registry.clone())),
        },
    );
    let (_, _, device) = pair.ready_device();

    let staging = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                mapped_at_creation: true,
                ..descriptor(4, BufferUsages::MAP_READ | BufferUsages::COPY_DST)
            },
        )
        .unwrap();
    assert_eq!(registry.region_count(), 2);
    pair.client
        .write_mapped_range(staging, 0, &[0xde, 0xad, 0xbe, 0xef])
        .unwrap();
    pair.client.unmap(staging).unwrap();
    // The server has not opened the transient write region yet.
    assert_eq!(registry.region_count(), 2);

    let maps = log();
    pair.client
        .map_async(staging, MapMode::READ, 0, 4, record_map(&maps))
        .unwrap();
    pair.roundtrip().unwrap();
    assert_eq!(registry.region_count(), 1);
    assert_eq!(*maps.borrow(), vec![(MapAsyncStatus::Success, String::new())]);
    assert_eq!(
        pair.client.get_mapped_range(staging, 0, 4),
        Ok(vec![0xde, 0xad, 0xbe, 0xef])
    );
}

fn shared_pair(registry: &SharedMemoryRegistry) -> WirePair {
    WirePair::with_configs(
        WireClientConfig {
            memory_transfer: Box::new(SharedMemoryTransferService::new(registry.clone())),
            ..WireClientConfig::default()
        },
        WireServerConfig {
            memory_transfer: Box::new(ServerTransferService::with_shared(registry.clone())),
        },
    )
}

#[test]
fn shared_regions_survive_release_before_the_server_sees_the_buffer() {
    let registry = SharedMemoryRegistry::new();
    let mut pair = shared_pair(&registry);
    let (_, _, device) = pair.ready_device();
    let objects = pair.server.live_objects();

    let buffer = pair
        .client
        .create_buffer(device, &descriptor(8, BufferUsages::MAP_READ))
        .unwrap();
    pair.client.release(buffer).unwrap();
    assert_eq!(registry.region_count(), 1);

    pair.flush_client().unwrap();
    assert_eq!(registry.region_count(), 0);
    assert_eq!(pair.server.live_objects(), objects);
}

#[test]
fn destroying_a_mapped_at_creation_buffer_flushes_its_contents() {
    let mut pair = WirePair::new();
    let (_, _, device) = pair.ready_device();
    let buffer = pair
        .client
        .create_buffer(
            device,
            &BufferDescriptor {
                mapped_at_creation: true,
                ..descriptor(4, BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC)
            },
        )
        .unwrap();
    pair.client
        .write_mapped_range(buffer, 0, &[1, 2, 3, 4])
        .unwrap();
    pair.client.destroy_buffer(buffer).unwrap();
    assert_eq!(
        pair.client.buffer_map_state(buffer),
        Ok(BufferMapState::Unmapped)
    );
    pair.flush_client().unwrap();

    let backing = *pair.server.buffer(buffer.handle()).unwrap();
    assert_eq!(pair.procs().buffer_data(backing), Some(&[1, 2, 3, 4][..]));
}
