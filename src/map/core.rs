//! Open-addressing table with a separate insertion-order sequence.
//!
//! Slots are an explicit sum type: a slot is always either `Empty` or a
//! fully written `Occupied` pair, never partially initialized, so a
//! traversal racing a mutation (under the owning container's lock) only
//! ever observes valid states.
//!
//! Placement invariant: a live key occupies the first open slot found by
//! linear probing from `hash & (capacity - 1)`. Load invariant:
//! `2 * len < capacity`, restored by growing *before* any insert that would
//! break it, so probes always terminate at an empty slot.

use crate::util::DetHashBuilder;
use std::hash::{BuildHasher, Hash};

/// Smallest table ever allocated.
pub(crate) const MIN_CAPACITY: usize = 8;

/// One table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot<K, V> {
    /// Sentinel; safe to observe at any time.
    Empty,
    /// A live entry.
    Occupied { key: K, value: V },
}

/// Probe outcome: where a key is, or where it would go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// The key is in this slot.
    Hit(usize),
    /// The key is absent; this is the first open slot on its probe path.
    Miss(usize),
}

/// The structural map: pair table, sequence table, element count.
#[derive(Debug, Clone)]
pub(crate) struct MapCore<K, V> {
    /// `capacity` slots, capacity a power of two >= [`MIN_CAPACITY`].
    pairs: Box<[Slot<K, V>]>,
    /// Insertion order: the n-th inserted entry's slot index.
    seq: Vec<u32>,
    len: usize,
    hasher: DetHashBuilder,
}

fn empty_pairs<K, V>(capacity: usize) -> Box<[Slot<K, V>]> {
    debug_assert!(capacity.is_power_of_two() && capacity >= MIN_CAPACITY);
    let mut pairs = Vec::with_capacity(capacity);
    pairs.resize_with(capacity, || Slot::Empty);
    pairs.into_boxed_slice()
}

/// Capacity at which `elements` entries satisfy `2 * len < capacity`.
fn capacity_for(elements: usize) -> usize {
    (2 * elements + 1).next_power_of_two().max(MIN_CAPACITY)
}

impl<K, V> Default for MapCore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MapCore<K, V> {
    /// Creates an empty table of minimum capacity.
    pub fn new() -> Self {
        Self {
            pairs: empty_pairs(MIN_CAPACITY),
            seq: Vec::new(),
            len: 0,
            hasher: DetHashBuilder,
        }
    }

    /// Creates an empty table sized so `elements` inserts need no growth.
    pub fn with_capacity(elements: usize) -> Self {
        Self {
            pairs: empty_pairs(capacity_for(elements)),
            seq: Vec::with_capacity(elements),
            len: 0,
            hasher: DetHashBuilder,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.pairs.len()
    }

    /// Bytes held by the pair and sequence buffers, reported to the
    /// collector as opaque auxiliary allocations.
    pub fn aux_bytes(&self) -> usize {
        self.pairs.len() * core::mem::size_of::<Slot<K, V>>()
            + self.seq.capacity() * core::mem::size_of::<u32>()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.seq.iter().map(|&slot| match &self.pairs[slot as usize] {
            Slot::Occupied { key, value } => (key, value),
            Slot::Empty => unreachable!("sequence table points at empty slot"),
        })
    }

    /// Pairwise equality in insertion order. Keys compare with `Eq`; values
    /// go through `value_eq` so callers can handle placeholder values
    /// without forcing them.
    pub fn eq_with<W>(
        &self,
        other: &MapCore<K, W>,
        value_eq: &mut dyn FnMut(&V, &W) -> bool,
    ) -> bool
    where
        K: Eq,
    {
        self.len == other.len
            && self
                .iter()
                .zip(other.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && value_eq(va, vb))
    }
}

impl<K: Hash + Eq, V> MapCore<K, V> {
    /// Hashes a key with the table's fixed-seed hasher.
    pub fn hash_of(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Linear probe over an arbitrary pair table, bounded by its capacity so
    /// it terminates even on a full table.
    fn probe_slots(pairs: &[Slot<K, V>], hash: u64, key: &K) -> Probe {
        let mask = pairs.len() - 1;
        let mut index = (hash as usize) & mask;
        for _ in 0..pairs.len() {
            match &pairs[index] {
                Slot::Empty => return Probe::Miss(index),
                Slot::Occupied { key: occupant, .. } if occupant == key => {
                    return Probe::Hit(index);
                }
                Slot::Occupied { .. } => index = (index + 1) & mask,
            }
        }
        unreachable!("probe exhausted a table kept under half load");
    }

    /// Probes for `key` starting at `hash & (capacity - 1)`. Returns the
    /// value on a hit, plus the slot index either way, so an insert that
    /// follows a miss can reuse the probe.
    pub fn find_with_hash(&self, hash: u64, key: &K) -> (Option<&V>, usize) {
        match Self::probe_slots(&self.pairs, hash, key) {
            Probe::Hit(slot) => match &self.pairs[slot] {
                Slot::Occupied { value, .. } => (Some(value), slot),
                Slot::Empty => unreachable!(),
            },
            Probe::Miss(slot) => (None, slot),
        }
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_with_hash(self.hash_of(key), key).0
    }

    /// Grows to at least `new_capacity` slots (rounded up to a power of two,
    /// no smaller than [`MIN_CAPACITY`]); no-op when not larger than the
    /// current capacity.
    ///
    /// The fresh pair buffer starts fully `Empty` before any entry moves in,
    /// so a traversal never sees an invalid slot. Entries rehash into the
    /// new table while the sequence table is rebuilt in the same order,
    /// keeping iteration order independent of slot layout.
    pub fn reserve(&mut self, new_capacity: usize) {
        let target = new_capacity.next_power_of_two().max(MIN_CAPACITY);
        if target <= self.pairs.len() {
            return;
        }
        let mut old_pairs = core::mem::replace(&mut self.pairs, empty_pairs(target));
        let old_seq = core::mem::take(&mut self.seq);
        self.seq = Vec::with_capacity(old_seq.len().max(self.len));
        for slot in old_seq {
            let taken = core::mem::replace(&mut old_pairs[slot as usize], Slot::Empty);
            let Slot::Occupied { key, value } = taken else {
                unreachable!("sequence table points at empty slot");
            };
            let hash = self.hasher.hash_one(&key);
            match Self::probe_slots(&self.pairs, hash, &key) {
                Probe::Miss(new_slot) => {
                    self.pairs[new_slot] = Slot::Occupied { key, value };
                    self.seq.push(u32::try_from(new_slot).expect("capacity overflow"));
                }
                Probe::Hit(_) => unreachable!("duplicate key during rehash"),
            }
        }
    }

    /// Inserts or updates, growing first when the insert would push load
    /// factor to 1/2 or beyond. Returns the slot index and whether an
    /// existing entry was replaced.
    pub fn add_or_update(&mut self, key: K, value: V) -> (usize, bool)
    where
        V: PartialEq,
    {
        if 2 * (self.len + 1) >= self.pairs.len() {
            // Grow before inserting, never after: the load invariant holds
            // at every point a traversal could observe.
            let doubled = self.pairs.len() * 2;
            self.reserve(doubled);
        }
        let hash = self.hash_of(&key);
        match Self::probe_slots(&self.pairs, hash, &key) {
            Probe::Hit(slot) => {
                match &mut self.pairs[slot] {
                    Slot::Occupied { value: existing, .. } => {
                        // Only write when the value actually changes.
                        if *existing != value {
                            *existing = value;
                        }
                    }
                    Slot::Empty => unreachable!(),
                }
                (slot, true)
            }
            Probe::Miss(slot) => {
                self.pairs[slot] = Slot::Occupied { key, value };
                self.seq.push(u32::try_from(slot).expect("capacity overflow"));
                self.len += 1;
                (slot, false)
            }
        }
    }
}
