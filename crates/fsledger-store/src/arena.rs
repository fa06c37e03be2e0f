//! Slot arena holding one kind's records
//!
//! Records occupy fixed slots addressed by [`ItemLocator`]. Freeing a slot
//! keeps its generation so the next record placed there gets a new one;
//! the lowest vacant index is always reused first, which keeps the layout
//! dense and makes WAL replay reproduce the same locators.

use fsledger_common::{Error, ItemLocator, Result};
use std::collections::BTreeSet;

#[derive(Clone, Debug)]
struct Slot<R> {
    /// Generation of the current or most recent occupant, 0 if never used
    generation: u32,
    record: Option<R>,
}

/// Raw view of one slot, used by checkpoints
#[derive(Debug)]
pub struct SlotImage<'a, R> {
    pub index: u32,
    pub generation: u32,
    pub record: Option<&'a R>,
}

#[derive(Clone, Debug)]
pub struct SlotArena<R> {
    slots: Vec<Slot<R>>,
    vacant: BTreeSet<u32>,
    live: usize,
}

impl<R> Default for SlotArena<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> SlotArena<R> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: BTreeSet::new(),
            live: 0,
        }
    }

    /// Rebuild from raw `(generation, record)` slots in index order
    pub fn from_slots(slots: Vec<(u32, Option<R>)>) -> Result<Self> {
        let mut arena = Self::new();
        for (index, (generation, record)) in slots.into_iter().enumerate() {
            let index = slot_index(index)?;
            if record.is_some() {
                arena.live += 1;
            } else {
                arena.vacant.insert(index);
            }
            arena.slots.push(Slot { generation, record });
        }
        Ok(arena)
    }

    /// Locator the next `insert` will return
    pub fn next_locator(&self) -> Result<ItemLocator> {
        match self.vacant.first() {
            Some(&index) => {
                let generation = self.slots[index as usize].generation;
                Ok(ItemLocator::new(index, next_generation(generation)))
            }
            None => Ok(ItemLocator::new(slot_index(self.slots.len())?, 1)),
        }
    }

    pub fn insert(&mut self, record: R) -> Result<ItemLocator> {
        let locator = self.next_locator()?;
        self.place(locator, record)?;
        Ok(locator)
    }

    /// Put a record at an exact locator, growing the table as needed
    ///
    /// Used by WAL replay; fails if the slot is occupied.
    pub fn place(&mut self, locator: ItemLocator, record: R) -> Result<()> {
        if locator.generation == 0 {
            return Err(Error::corruption(format!(
                "cannot place a record at generation 0 ({locator})"
            )));
        }
        let index = locator.index as usize;
        while self.slots.len() <= index {
            let new_index = slot_index(self.slots.len())?;
            self.vacant.insert(new_index);
            self.slots.push(Slot {
                generation: 0,
                record: None,
            });
        }

        let slot = &mut self.slots[index];
        if slot.record.is_some() {
            return Err(Error::corruption(format!("slot {locator} is already occupied")));
        }
        slot.generation = locator.generation;
        slot.record = Some(record);
        self.vacant.remove(&locator.index);
        self.live += 1;
        Ok(())
    }

    pub fn get(&self, locator: ItemLocator) -> Option<&R> {
        self.slots
            .get(locator.index as usize)
            .filter(|slot| slot.generation == locator.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(&mut self, locator: ItemLocator) -> Option<&mut R> {
        self.slots
            .get_mut(locator.index as usize)
            .filter(|slot| slot.generation == locator.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Vacate a slot, returning its record
    pub fn remove(&mut self, locator: ItemLocator) -> Option<R> {
        let slot = self
            .slots
            .get_mut(locator.index as usize)
            .filter(|slot| slot.generation == locator.generation)?;
        let record = slot.record.take()?;
        self.vacant.insert(locator.index);
        self.live -= 1;
        Some(record)
    }

    /// Live records in physical order
    pub fn iter(&self) -> impl Iterator<Item = (ItemLocator, &R)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let record = slot.record.as_ref()?;
            let index = u32::try_from(index).ok()?;
            Some((ItemLocator::new(index, slot.generation), record))
        })
    }

    /// First live record at or after physical position `start`
    pub fn next_from(&self, start: usize) -> Option<(usize, ItemLocator, &R)> {
        self.slots
            .iter()
            .enumerate()
            .skip(start)
            .find_map(|(index, slot)| {
                let record = slot.record.as_ref()?;
                let locator = ItemLocator::new(u32::try_from(index).ok()?, slot.generation);
                Some((index, locator, record))
            })
    }

    /// Every slot, vacant ones included
    pub fn slot_images(&self) -> impl Iterator<Item = SlotImage<'_, R>> {
        self.slots.iter().enumerate().map(|(index, slot)| SlotImage {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            generation: slot.generation,
            record: slot.record.as_ref(),
        })
    }

    /// Number of live records
    pub const fn len(&self) -> usize {
        self.live
    }

    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever allocated
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

fn slot_index(index: usize) -> Result<u32> {
    u32::try_from(index).map_err(|_| Error::storage("ledger table is full"))
}

const fn next_generation(generation: u32) -> u32 {
    match generation.checked_add(1) {
        Some(next) => next,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut arena = SlotArena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();

        assert_eq!(a, ItemLocator::new(0, 1));
        assert_eq!(b, ItemLocator::new(1, 1));
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(ItemLocator::ZERO), None);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_freed_slot_reused_with_new_generation() {
        let mut arena = SlotArena::new();
        let a = arena.insert(1).unwrap();
        let b = arena.insert(2).unwrap();
        let _c = arena.insert(3).unwrap();

        assert_eq!(arena.remove(b), Some(2));
        assert_eq!(arena.remove(a), Some(1));
        assert_eq!(arena.remove(a), None);

        // Lowest vacant index first, generation bumped
        let d = arena.insert(4).unwrap();
        assert_eq!(d, ItemLocator::new(0, 2));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(d), Some(&4));

        let e = arena.insert(5).unwrap();
        assert_eq!(e, ItemLocator::new(1, 2));
        assert_eq!(arena.slot_count(), 3);
    }

    #[test]
    fn test_place_grows_and_rejects_occupied() {
        let mut arena = SlotArena::new();
        arena.place(ItemLocator::new(3, 2), "x").unwrap();
        assert_eq!(arena.slot_count(), 4);
        assert_eq!(arena.next_locator().unwrap(), ItemLocator::new(0, 1));
        assert!(arena.place(ItemLocator::new(3, 3), "y").is_err());
        assert!(arena.place(ItemLocator::new(1, 0), "z").is_err());
    }

    #[test]
    fn test_from_slots_roundtrip() {
        let mut arena = SlotArena::new();
        let a = arena.insert('a').unwrap();
        arena.insert('b').unwrap();
        arena.remove(a);

        let raw: Vec<_> = arena
            .slot_images()
            .map(|s| (s.generation, s.record.copied()))
            .collect();
        let rebuilt = SlotArena::from_slots(raw).unwrap();

        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt.next_locator().unwrap(), ItemLocator::new(0, 2));
        let order: Vec<_> = rebuilt.iter().map(|(l, r)| (l, *r)).collect();
        assert_eq!(order, vec![(ItemLocator::new(1, 1), 'b')]);
    }

    #[test]
    fn test_next_from_walks_physical_order() {
        let mut arena = SlotArena::new();
        for v in 0..4 {
            arena.insert(v).unwrap();
        }
        arena.remove(ItemLocator::new(1, 1));

        let (pos, loc, v) = arena.next_from(1).unwrap();
        assert_eq!((pos, loc, *v), (2, ItemLocator::new(2, 1), 2));
        assert!(arena.next_from(4).is_none());
    }
}
