//! Shared-region transfer: both sides address the same bytes and updates carry no data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    checked_range, ClientMemoryTransferService, ClientReadHandle, ClientWriteHandle, CreateDesc,
    ReadHandle, ReadSource, TransferError, WriteHandle, WriteSink,
};

type Region = Arc<Mutex<Vec<u8>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Regions visible to both the client and server of one connection.
///
/// In-process stand-in for an OS shared-memory mapping: a region is identified by a `u64` id
/// that travels in the create payload. An entry lives until the client handle is gone and the
/// server has opened the region; whichever happens last removes it. The bytes themselves stay
/// alive for as long as either half holds them.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryRegistry {
    regions: Arc<Mutex<HashMap<u64, Entry>>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Entry {
    region: Region,
    client_dropped: bool,
    opened: bool,
}

impl SharedMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, size: u64) -> Option<(u64, Region)> {
        let len = usize::try_from(size).ok()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let region = Arc::new(Mutex::new(vec![0; len]));
        lock(&self.regions).insert(
            id,
            Entry {
                region: region.clone(),
                client_dropped: false,
                opened: false,
            },
        );
        Some((id, region))
    }

    fn open(&self, id: u64, size: u64) -> Result<Region, TransferError> {
        let mut regions = lock(&self.regions);
        let entry = regions.get_mut(&id).ok_or(TransferError::UnknownRegion(id))?;
        let actual = lock(&entry.region).len() as u64;
        if actual != size {
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual,
            });
        }
        let region = entry.region.clone();
        let client_dropped = entry.client_dropped;
        entry.opened = true;
        if client_dropped {
            regions.remove(&id);
        }
        Ok(region)
    }

    /// The client handle of `id` is gone.
    fn release(&self, id: u64) {
        let mut regions = lock(&self.regions);
        let Some(entry) = regions.get_mut(&id) else {
            return;
        };
        entry.client_dropped = true;
        if entry.opened {
            regions.remove(&id);
        }
    }

    /// Registered regions, including ones whose client handle is gone but which the server has
    /// not opened yet.
    pub fn region_count(&self) -> usize {
        lock(&self.regions).len()
    }
}

/// Client factory allocating shared regions from a registry.
#[derive(Debug, Clone)]
pub struct SharedMemoryTransferService {
    registry: SharedMemoryRegistry,
}

impl SharedMemoryTransferService {
    pub fn new(registry: SharedMemoryRegistry) -> Self {
        Self { registry }
    }
}

impl ClientMemoryTransferService for SharedMemoryTransferService {
    fn create_read_handle(&mut self, size: u64) -> Option<ClientReadHandle> {
        let (id, region) = self.registry.allocate(size)?;
        Some(ClientReadHandle::Shared(SharedReadHandle(ClientRegion {
            registry: self.registry.clone(),
            id,
            size,
            region,
        })))
    }

    fn create_write_handle(&mut self, size: u64) -> Option<ClientWriteHandle> {
        let (id, region) = self.registry.allocate(size)?;
        Some(ClientWriteHandle::Shared(SharedWriteHandle(ClientRegion {
            registry: self.registry.clone(),
            id,
            size,
            region,
        })))
    }
}

/// A region owned by a client handle. Dropping it hands the registry entry over to the server's
/// pending open, if any.
struct ClientRegion {
    registry: SharedMemoryRegistry,
    id: u64,
    size: u64,
    region: Region,
}

impl ClientRegion {
    fn create_payload(&self) -> Vec<u8> {
        CreateDesc::Shared {
            size: self.size,
            region: self.id,
        }
        .encode()
    }

    fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        let range = checked_range(offset, size, self.size)?;
        Ok(lock(&self.region)[range].to_vec())
    }
}

impl Drop for ClientRegion {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

fn expect_empty(update: &[u8]) -> Result<(), TransferError> {
    if update.is_empty() {
        Ok(())
    } else {
        Err(TransferError::SizeMismatch {
            expected: 0,
            actual: update.len() as u64,
        })
    }
}

pub struct SharedReadHandle(ClientRegion);

impl ReadHandle for SharedReadHandle {
    fn size(&self) -> u64 {
        self.0.size
    }

    fn serialize_create(&self) -> Vec<u8> {
        self.0.create_payload()
    }

    fn deserialize_data_update(
        &mut self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        checked_range(offset, size, self.0.size)?;
        expect_empty(update)
    }

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        self.0.read(offset, size)
    }
}

pub struct SharedWriteHandle(ClientRegion);

impl WriteHandle for SharedWriteHandle {
    fn size(&self) -> u64 {
        self.0.size
    }

    fn serialize_create(&self) -> Vec<u8> {
        self.0.create_payload()
    }

    fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        self.0.read(offset, size)
    }

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let range = checked_range(offset, data.len() as u64, self.0.size)?;
        lock(&self.0.region)[range].copy_from_slice(data);
        Ok(())
    }

    fn serialize_data_update(&self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        checked_range(offset, size, self.0.size)?;
        Ok(Vec::new())
    }
}

pub struct SharedReadSource {
    size: u64,
    region: Region,
}

impl SharedReadSource {
    pub(crate) fn open(
        registry: &SharedMemoryRegistry,
        id: u64,
        size: u64,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            size,
            region: registry.open(id, size)?,
        })
    }
}

impl ReadSource for SharedReadSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn serialize_data_update(&self, src: &[u8], offset: u64) -> Result<Vec<u8>, TransferError> {
        let range = checked_range(offset, src.len() as u64, self.size)?;
        lock(&self.region)[range].copy_from_slice(src);
        Ok(Vec::new())
    }
}

pub struct SharedWriteSink {
    size: u64,
    region: Region,
}

impl SharedWriteSink {
    pub(crate) fn open(
        registry: &SharedMemoryRegistry,
        id: u64,
        size: u64,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            size,
            region: registry.open(id, size)?,
        })
    }
}

impl WriteSink for SharedWriteSink {
    fn size(&self) -> u64 {
        self.size
    }

    fn validate_data_update(
        &self,
        update: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<(), TransferError> {
        checked_range(offset, size, self.size)?;
        expect_empty(update)
    }

    fn apply_data_update(&self, _update: &[u8], offset: u64, dest: &mut [u8]) {
        let Ok(range) = checked_range(offset, dest.len() as u64, self.size) else {
            return;
        };
        dest.copy_from_slice(&lock(&self.region)[range]);
    }
}
