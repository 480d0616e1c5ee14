//! Id/generation slot table shared by both ends of the wire.
//!
//! The client mints identities with [`HandleTable::allocate`]; the server accepts identities chosen
//! by the client with [`HandleTable::try_occupy`]. Both sides retain the generation of a freed id
//! as a floor so a destroyed object's identity can never become valid again.
//!
//! Slots are kept in an ordered map rather than a vector indexed by id: ids arrive from the peer
//! and a hostile id must not turn into a multi-gigabyte resize.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::handle::{ObjectGeneration, ObjectHandle, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OccupyError {
    #[error("the null handle cannot be occupied")]
    Null,
    #[error("object id {0} is already live")]
    AlreadyLive(ObjectId),
    #[error("generation {requested} for object id {id} is not newer than {last}")]
    StaleGeneration {
        id: ObjectId,
        requested: ObjectGeneration,
        last: ObjectGeneration,
    },
}

#[derive(Debug)]
struct Slot<T> {
    /// Generation of the current (live) or most recent (freed) lifetime.
    generation: ObjectGeneration,
    value: Option<T>,
}

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: BTreeMap<ObjectId, Slot<T>>,
    /// Free ids whose generation can still grow, most recently freed last. An id leaves the list
    /// when it is reused by either side.
    free_ids: Vec<ObjectId>,
    next_fresh_id: ObjectId,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            free_ids: Vec::new(),
            next_fresh_id: 1,
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Mint a new identity and store `value` under it. Returns `None` once every 32-bit id has
    /// been handed out and none can be reused.
    pub fn allocate(&mut self, value: T) -> Option<ObjectHandle> {
        if let Some(id) = self.free_ids.pop() {
            if let Some(slot) = self.slots.get_mut(&id) {
                // `free` only lists ids whose generation can still grow.
                let generation = slot.generation.checked_add(1)?;
                slot.generation = generation;
                slot.value = Some(value);
                self.live += 1;
                return Some(ObjectHandle::new(id, generation));
            }
        }

        loop {
            let id = self.next_fresh_id;
            if id == 0 {
                return None;
            }
            // Wraps to 0 after `u32::MAX`, which marks the fresh range as used up.
            self.next_fresh_id = id.wrapping_add(1);
            if self.slots.contains_key(&id) {
                continue;
            }
            self.slots.insert(
                id,
                Slot {
                    generation: 0,
                    value: Some(value),
                },
            );
            self.live += 1;
            return Some(ObjectHandle::new(id, 0));
        }
    }

    /// Whether `handle` could be occupied right now, without occupying it.
    pub fn check_occupy(&self, handle: ObjectHandle) -> Result<(), OccupyError> {
        if handle.is_null() {
            return Err(OccupyError::Null);
        }
        match self.slots.get(&handle.id) {
            Some(slot) if slot.value.is_some() => Err(OccupyError::AlreadyLive(handle.id)),
            Some(slot) if handle.generation <= slot.generation => {
                Err(OccupyError::StaleGeneration {
                    id: handle.id,
                    requested: handle.generation,
                    last: slot.generation,
                })
            }
            _ => Ok(()),
        }
    }

    /// Store `value` under an identity chosen by the peer.
    ///
    /// Fails without mutating anything if the id is live, or if the generation is not strictly
    /// newer than the last one recorded for the id.
    pub fn try_occupy(&mut self, handle: ObjectHandle, value: T) -> Result<(), OccupyError> {
        self.check_occupy(handle)?;
        self.free_ids.retain(|&id| id != handle.id);
        self.slots.insert(
            handle.id,
            Slot {
                generation: handle.generation,
                value: Some(value),
            },
        );
        self.live += 1;
        Ok(())
    }

    /// Free a live identity, returning its value. The generation stays recorded as the floor for
    /// the next lifetime of the id.
    pub fn free(&mut self, handle: ObjectHandle) -> Option<T> {
        let slot = self.slots.get_mut(&handle.id)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.live -= 1;
        if slot.generation < ObjectGeneration::MAX {
            self.free_ids.push(handle.id);
        }
        Some(value)
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&T> {
        let slot = self.slots.get(&handle.id)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(&handle.id)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Last generation recorded for `id`, live or not.
    pub fn last_generation(&self, id: ObjectId) -> Option<ObjectGeneration> {
        self.slots.get(&id).map(|slot| slot.generation)
    }

    /// Live entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &T)> {
        self.slots.iter().filter_map(|(&id, slot)| {
            slot.value
                .as_ref()
                .map(|value| (ObjectHandle::new(id, slot.generation), value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut T)> {
        self.slots.iter_mut().filter_map(|(&id, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (ObjectHandle::new(id, generation), value))
        })
    }

    pub fn handles(&self) -> Vec<ObjectHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocate_never_returns_null_and_starts_at_generation_zero() {
        let mut table = HandleTable::new();
        let a = table.allocate("a").unwrap();
        let b = table.allocate("b").unwrap();
        assert_eq!(a, ObjectHandle::new(1, 0));
        assert_eq!(b, ObjectHandle::new(2, 0));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn freed_id_is_reused_with_a_newer_generation() {
        let mut table = HandleTable::new();
        let a = table.allocate(1u32).unwrap();
        assert_eq!(table.free(a), Some(1));
        assert!(table.get(a).is_none());

        let b = table.allocate(2u32).unwrap();
        assert_eq!(b.id, a.id);
        assert_eq!(b.generation, a.generation + 1);
        assert_eq!(table.get(b), Some(&2));
        assert!(table.get(a).is_none(), "stale handle must not resolve");
    }

    #[test]
    fn try_occupy_rejects_live_and_stale_identities() {
        let mut table = HandleTable::new();
        let h = ObjectHandle::new(7, 0);
        table.try_occupy(h, "first").unwrap();
        assert_eq!(
            table.try_occupy(ObjectHandle::new(7, 1), "live"),
            Err(OccupyError::AlreadyLive(7))
        );

        table.free(h).unwrap();
        assert_eq!(
            table.try_occupy(h, "again"),
            Err(OccupyError::StaleGeneration {
                id: 7,
                requested: 0,
                last: 0
            })
        );
        table.try_occupy(ObjectHandle::new(7, 1), "second").unwrap();
        assert_eq!(table.get(ObjectHandle::new(7, 1)), Some(&"second"));
    }

    #[test]
    fn try_occupy_rejects_null() {
        let mut table = HandleTable::new();
        assert_eq!(table.try_occupy(ObjectHandle::NULL, ()), Err(OccupyError::Null));
        assert!(table.is_empty());
    }

    #[test]
    fn hostile_id_does_not_allocate_proportionally() {
        let mut table = HandleTable::new();
        table
            .try_occupy(ObjectHandle::new(u32::MAX, 0), ())
            .unwrap();
        assert_eq!(table.len(), 1);
        // Fresh allocation is unaffected by the far-away id.
        assert_eq!(table.allocate(()).unwrap(), ObjectHandle::new(1, 0));
    }

    #[test]
    fn allocate_skips_ids_occupied_by_the_peer() {
        let mut table = HandleTable::new();
        table.try_occupy(ObjectHandle::new(1, 0), "peer").unwrap();
        assert_eq!(table.allocate("local").unwrap(), ObjectHandle::new(2, 0));
    }

    #[test]
    fn exhausted_generation_retires_the_id() {
        let mut table = HandleTable::new();
        let h = ObjectHandle::new(3, u32::MAX);
        table.try_occupy(h, ()).unwrap();
        table.free(h).unwrap();
        assert_eq!(table.allocate(()).unwrap().id, 1);
        assert!(table.try_occupy(ObjectHandle::new(3, u32::MAX), ()).is_err());
    }

    #[test]
    fn occupy_cycles_keep_the_free_list_bounded() {
        let mut table = HandleTable::new();
        for generation in 0..64 {
            let h = ObjectHandle::new(5, generation);
            table.try_occupy(h, ()).unwrap();
            table.free(h).unwrap();
        }
        assert_eq!(table.free_ids, vec![5]);

        table.try_occupy(ObjectHandle::new(5, 64), ()).unwrap();
        assert!(table.free_ids.is_empty());
        assert_eq!(table.allocate(()).unwrap(), ObjectHandle::new(1, 0));
    }

    #[test]
    fn exhausted_id_space_is_reported() {
        let mut table = HandleTable::new();
        table.next_fresh_id = u32::MAX;
        assert_eq!(table.allocate(()), Some(ObjectHandle::new(u32::MAX, 0)));
        assert_eq!(table.allocate(()), None);
        assert_eq!(table.len(), 1);

        table.free(ObjectHandle::new(u32::MAX, 0)).unwrap();
        assert_eq!(table.allocate(()), Some(ObjectHandle::new(u32::MAX, 1)));
    }

    #[test]
    fn free_with_wrong_generation_is_a_no_op() {
        let mut table = HandleTable::new();
        let h = table.allocate(5u8).unwrap();
        assert_eq!(table.free(ObjectHandle::new(h.id, h.generation + 1)), None);
        assert_eq!(table.get(h), Some(&5));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Occupy { id: u32, generation: u32 },
        FreeNth(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Allocate),
            (1u32..8, 0u32..6).prop_map(|(id, generation)| Op::Occupy { id, generation }),
            (0usize..16).prop_map(Op::FreeNth),
        ]
    }

    fn observe(
        observed: &mut BTreeMap<ObjectId, ObjectGeneration>,
        h: ObjectHandle,
    ) -> Result<(), TestCaseError> {
        if let Some(prev) = observed.insert(h.id, h.generation) {
            prop_assert!(h.generation > prev, "id {} went {} -> {}", h.id, prev, h.generation);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn generations_strictly_increase_per_id(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut table = HandleTable::new();
            let mut live: Vec<ObjectHandle> = Vec::new();
            let mut observed: BTreeMap<ObjectId, ObjectGeneration> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Allocate => {
                        let h = table.allocate(()).unwrap();
                        prop_assert!(!h.is_null());
                        observe(&mut observed, h)?;
                        live.push(h);
                    }
                    Op::Occupy { id, generation } => {
                        let h = ObjectHandle::new(id, generation);
                        let was_live = live.iter().any(|l| l.id == id);
                        let floor = observed.get(&id).copied();
                        let result = table.try_occupy(h, ());
                        let expected_ok = !was_live && floor.map_or(true, |f| generation > f);
                        prop_assert_eq!(result.is_ok(), expected_ok);
                        if result.is_ok() {
                            observe(&mut observed, h)?;
                            live.push(h);
                        }
                    }
                    Op::FreeNth(n) => {
                        if !live.is_empty() {
                            let h = live.remove(n % live.len());
                            prop_assert!(table.free(h).is_some());
                            prop_assert!(table.get(h).is_none());
                        }
                    }
                }
                prop_assert_eq!(table.len(), live.len());
                for h in &live {
                    prop_assert!(table.get(*h).is_some());
                }
            }
        }
    }
}
