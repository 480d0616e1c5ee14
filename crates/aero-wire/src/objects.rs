//! Reference-counted object tables layered over [`HandleTable`].

use aero_wire_protocol::{HandleTable, ObjectHandle, ObjectType, OccupyError};

use crate::error::ObjectError;

#[derive(Debug)]
pub struct ObjectRecord<T> {
    pub refcount: u32,
    pub data: T,
}

/// Objects of one [`ObjectType`].
#[derive(Debug)]
pub struct ObjectTable<T> {
    object_type: ObjectType,
    table: HandleTable<ObjectRecord<T>>,
}

impl<T> ObjectTable<T> {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            table: HandleTable::new(),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn unknown(&self, handle: ObjectHandle) -> ObjectError {
        ObjectError::UnknownObject {
            object_type: self.object_type,
            handle,
        }
    }

    /// Mint a new identity holding one reference. `None` when the id space is used up.
    pub fn reserve(&mut self, data: T) -> Option<ObjectHandle> {
        self.table.allocate(ObjectRecord { refcount: 1, data })
    }

    /// Bind `data` to a peer-chosen identity with one reference.
    pub fn insert_at(&mut self, handle: ObjectHandle, data: T) -> Result<(), OccupyError> {
        self.table
            .try_occupy(handle, ObjectRecord { refcount: 1, data })
    }

    pub fn check_insert(&self, handle: ObjectHandle) -> Result<(), OccupyError> {
        self.table.check_occupy(handle)
    }

    pub fn add_ref(&mut self, handle: ObjectHandle) -> Result<u32, ObjectError> {
        let unknown = self.unknown(handle);
        let record = self.table.get_mut(handle).ok_or(unknown)?;
        record.refcount = record.refcount.saturating_add(1);
        Ok(record.refcount)
    }

    /// Drop one reference. Returns the data once the last reference is gone; the identity is
    /// freed at that point.
    pub fn release(&mut self, handle: ObjectHandle) -> Result<Option<T>, ObjectError> {
        let unknown = self.unknown(handle);
        let record = self.table.get_mut(handle).ok_or(unknown)?;
        record.refcount -= 1;
        if record.refcount > 0 {
            return Ok(None);
        }
        Ok(self.table.free(handle).map(|record| record.data))
    }

    /// Free an identity regardless of its reference count.
    pub fn remove(&mut self, handle: ObjectHandle) -> Option<T> {
        self.table.free(handle).map(|record| record.data)
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&T> {
        self.table.get(handle).map(|record| &record.data)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        self.table.get_mut(handle).map(|record| &mut record.data)
    }

    pub fn lookup(&self, handle: ObjectHandle) -> Result<&T, ObjectError> {
        self.get(handle).ok_or_else(|| self.unknown(handle))
    }

    pub fn lookup_mut(&mut self, handle: ObjectHandle) -> Result<&mut T, ObjectError> {
        let unknown = self.unknown(handle);
        self.get_mut(handle).ok_or(unknown)
    }

    pub fn refcount(&self, handle: ObjectHandle) -> Option<u32> {
        self.table.get(handle).map(|record| record.refcount)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.table.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &T)> {
        self.table.iter().map(|(handle, record)| (handle, &record.data))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut T)> {
        self.table
            .iter_mut()
            .map(|(handle, record)| (handle, &mut record.data))
    }

    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.table.handles()
    }
}

/// One [`ObjectTable`] per [`ObjectType`], each with its own id space.
#[derive(Debug)]
pub struct ObjectStore<T> {
    tables: [ObjectTable<T>; ObjectType::COUNT],
}

impl<T> Default for ObjectStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectStore<T> {
    pub fn new() -> Self {
        Self {
            tables: std::array::from_fn(|i| ObjectTable::new(ObjectType::ALL[i])),
        }
    }

    pub fn table(&self, object_type: ObjectType) -> &ObjectTable<T> {
        &self.tables[object_type.index()]
    }

    pub fn table_mut(&mut self, object_type: ObjectType) -> &mut ObjectTable<T> {
        &mut self.tables[object_type.index()]
    }

    pub fn get(&self, object_type: ObjectType, handle: ObjectHandle) -> Option<&T> {
        self.table(object_type).get(handle)
    }

    pub fn get_mut(&mut self, object_type: ObjectType, handle: ObjectHandle) -> Option<&mut T> {
        self.table_mut(object_type).get_mut(handle)
    }

    pub fn lookup(&self, object_type: ObjectType, handle: ObjectHandle) -> Result<&T, ObjectError> {
        self.table(object_type).lookup(handle)
    }

    pub fn lookup_mut(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<&mut T, ObjectError> {
        self.table_mut(object_type).lookup_mut(handle)
    }

    pub fn release(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<Option<T>, ObjectError> {
        self.table_mut(object_type).release(handle)
    }

    pub fn live_objects(&self) -> usize {
        self.tables.iter().map(ObjectTable::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn release_returns_data_only_at_zero() {
        let mut table = ObjectTable::new(ObjectType::Buffer);
        let h = table.reserve("buf").unwrap();
        assert_eq!(table.add_ref(h), Ok(2));
        assert_eq!(table.release(h), Ok(None));
        assert_eq!(table.release(h), Ok(Some("buf")));
        assert!(!table.contains(h));
        assert_eq!(
            table.release(h),
            Err(ObjectError::UnknownObject {
                object_type: ObjectType::Buffer,
                handle: h
            })
        );
    }

    #[test]
    fn released_identity_is_not_reoccupiable_at_the_same_generation() {
        let mut table = ObjectTable::new(ObjectType::Texture);
        let h = ObjectHandle::new(7, 0);
        table.insert_at(h, ()).unwrap();
        table.release(h).unwrap();
        assert!(table.insert_at(h, ()).is_err());
        table.insert_at(ObjectHandle::new(7, 1), ()).unwrap();
    }

    #[test]
    fn types_have_independent_id_spaces() {
        let mut store = ObjectStore::new();
        let buffer = store.table_mut(ObjectType::Buffer).reserve(1).unwrap();
        let texture = store.table_mut(ObjectType::Texture).reserve(2).unwrap();
        assert_eq!(buffer, texture);
        assert_eq!(store.get(ObjectType::Buffer, buffer), Some(&1));
        assert_eq!(store.get(ObjectType::Texture, texture), Some(&2));
        assert_eq!(store.live_objects(), 2);
    }
}
