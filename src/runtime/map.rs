use std::fmt::{self, Debug, Formatter};
use std::mem;

use crate::gc::{Cell, Handle, Heap, ObjBody, ObjType};
use crate::vm::Vm;

use super::error::Result;
use super::value::{hash_value, values_equal, Value};

/// The initial (and minimum) capacity of a non-empty map.
pub const MIN_CAPACITY: usize = 16;

/// Capacity growth factor when the load ceiling is hit.
pub const GROW_FACTOR: usize = 2;

/// The maximum percentage of entries that may be filled before the map grows.
/// A lower load takes more memory but reduces collisions, making lookup
/// faster.
pub const LOAD_PERCENT: usize = 75;

/// One slot of the entry array. Three states:
/// - empty: key is undefined, value is false;
/// - tombstone (a deleted entry whose probe chain must stay walkable): key is
///   undefined, value is true;
/// - occupied: anything else.
#[derive(Clone, Copy)]
pub struct MapEntry {
    pub key: Value,
    pub value: Value,
}

impl MapEntry {
    const EMPTY: MapEntry = MapEntry {
        key: Value::UNDEFINED,
        value: Value::FALSE,
    };

    const TOMBSTONE: MapEntry = MapEntry {
        key: Value::UNDEFINED,
        value: Value::TRUE,
    };

    fn is_unused(&self) -> bool {
        self.key.is_undefined()
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_undefined() && self.value.is_true()
    }
}

/// An open-addressed hash table from values to values, with linear probing
/// and tombstoned deletes.
#[derive(Default)]
pub struct Map {
    entries: Box<[MapEntry]>,
    count: usize,
}

impl Map {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    /// Looks up the slot holding [key]. Probing walks from the key's home
    /// slot, past tombstones, until the key or an empty slot is found.
    fn find_entry(&self, key: Value) -> Result<Option<usize>> {
        // An empty map has no entry array at all.
        if self.entries.is_empty() {
            return Ok(None);
        }

        let mut index = hash_value(key)? as usize % self.entries.len();

        // The load ceiling guarantees empty slots, so this terminates.
        loop {
            let entry = &self.entries[index];

            if entry.is_unused() {
                if !entry.is_tombstone() {
                    return Ok(None);
                }
            } else if values_equal(entry.key, key) {
                return Ok(Some(index));
            }

            index = (index + 1) % self.entries.len();
        }
    }

    /// Inserts [key] into [entries], which must have room. Returns whether a
    /// new key was added.
    ///
    /// The first tombstone on the probe chain is remembered but not stopped
    /// at: the key may still live beyond it, and stopping there would orphan
    /// it. Only once an empty slot proves the key absent is the remembered
    /// tombstone reused.
    fn add_entry(entries: &mut [MapEntry], key: Value, value: Value) -> Result<bool> {
        let mut index = hash_value(key)? as usize % entries.len();
        let mut tombstone = None;

        loop {
            let entry = &entries[index];

            if entry.is_unused() {
                if entry.is_tombstone() {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                } else {
                    let target = tombstone.unwrap_or(index);
                    entries[target] = MapEntry { key, value };

                    return Ok(true);
                }
            } else if values_equal(entry.key, key) {
                entries[index].value = value;

                return Ok(false);
            }

            index = (index + 1) % entries.len();
        }
    }

    /// Replaces the entry array with one of [capacity] slots, reinserting
    /// only the occupied entries. Tombstones are dropped, compacting every
    /// probe chain.
    fn resize(&mut self, heap: &mut Heap, capacity: usize) {
        let old = mem::replace(
            &mut self.entries,
            vec![MapEntry::EMPTY; capacity].into_boxed_slice(),
        );

        for entry in old.iter() {
            if entry.is_unused() {
                continue;
            }

            // Keys were hashable when they went in.
            Self::add_entry(&mut self.entries, entry.key, entry.value)
                .expect("rehash of an existing key");
        }

        heap.adjust(
            (capacity as isize - old.len() as isize) * mem::size_of::<MapEntry>() as isize,
        );
    }

    fn free_entries(&mut self, heap: &mut Heap) {
        heap.adjust(-((self.entries.len() * mem::size_of::<MapEntry>()) as isize));
        self.entries = Box::default();
        self.count = 0;
    }
}

impl ObjBody for Map {
    const TY: ObjType = ObjType::Map;

    fn trace(&self, heap: &mut Heap) {
        for entry in self.entries.iter() {
            // Skipping tombstones avoids re-marking their sentinel value.
            if entry.is_unused() {
                continue;
            }

            heap.gray_value(entry.key);
            heap.gray_value(entry.value);
        }
    }

    fn size_bytes(&self) -> usize {
        mem::size_of::<Cell<Map>>() + self.entries.len() * mem::size_of::<MapEntry>()
    }
}

impl Debug for Map {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Map(count: {})", self.count)
    }
}

impl Vm {
    pub fn new_map(&mut self) -> Result<Handle<Map>> {
        let class = self.classes.map;
        self.allocate(Map::default(), class)
    }

    /// Associates [key] with [value], replacing any existing association.
    /// An unhashable key is rejected before the map is touched.
    pub fn map_set(&mut self, mut map: Handle<Map>, key: Value, value: Value) -> Result<()> {
        hash_value(key)?;

        // Neither the key nor the value is reachable from the map until the
        // entry is written, and growing may collect.
        self.heap.push_root(map.erase());
        self.heap.push_root_value(key);
        self.heap.push_root_value(value);

        // If the map is getting too full, make room first.
        if (map.count + 1) * 100 > map.capacity() * LOAD_PERCENT {
            let capacity = (map.capacity() * GROW_FACTOR).max(MIN_CAPACITY);
            map.resize(&mut self.heap, capacity);
            self.maybe_collect();
        }

        let added = Map::add_entry(&mut map.entries, key, value);

        self.heap.pop_root();
        self.heap.pop_root();
        self.heap.pop_root();

        if added? {
            map.count += 1;
        }

        Ok(())
    }

    /// Returns the value for [key], or the undefined sentinel when absent.
    pub fn map_get(&self, map: Handle<Map>, key: Value) -> Result<Value> {
        Ok(match map.find_entry(key)? {
            Some(index) => map.entries[index].value,
            None => Value::UNDEFINED,
        })
    }

    pub fn map_contains(&self, map: Handle<Map>, key: Value) -> Result<bool> {
        Ok(map.find_entry(key)?.is_some())
    }

    /// Removes [key], returning its value (null when the key was absent).
    /// The slot becomes a tombstone: lookups stop on empty slots but continue
    /// past deleted ones.
    pub fn map_remove_key(&mut self, mut map: Handle<Map>, key: Value) -> Result<Value> {
        let Some(index) = map.find_entry(key)? else {
            return Ok(Value::NULL);
        };

        let value = map.entries[index].value;
        map.entries[index] = MapEntry::TOMBSTONE;
        map.count -= 1;

        self.heap.push_root(map.erase());
        self.heap.push_root_value(value);

        if map.count == 0 {
            // Removed the last entry, so drop the array entirely.
            map.free_entries(&mut self.heap);
        } else if map.capacity() > MIN_CAPACITY
            && map.count * 100 < map.capacity() / GROW_FACTOR * LOAD_PERCENT
        {
            let capacity = (map.capacity() / GROW_FACTOR).max(MIN_CAPACITY);
            map.resize(&mut self.heap, capacity);
            self.maybe_collect();
        }

        self.heap.pop_root();
        self.heap.pop_root();

        Ok(value)
    }

    /// Removes every entry and frees the entry array.
    pub fn map_clear(&mut self, mut map: Handle<Map>) {
        map.free_entries(&mut self.heap);
    }
}
