//! Transactional, insertion-ordered associative containers.
//!
//! [`TransactMap`] is the mutable container. All structural access goes
//! through one per-container mutex, so growth and insertion are mutually
//! exclusive with iteration and with collector traversal; the handle itself
//! is cheap to clone and share.
//!
//! # Speculative writes
//!
//! A write made inside an open transaction is speculative: it lands in the
//! live table immediately (so readers and the collector see it, exactly as
//! they would a plain write), while the first such write snapshots the
//! pre-transaction table and registers an abort handler. On abort the
//! snapshot is republished wholesale under the lock, so the transaction's
//! writes observably never happened and no traversal can catch a
//! half-reverted table. On commit the substrate drops the handler, which
//! discards the snapshot; the writes simply stand. There is no per-entry
//! revert logic to get wrong.
//!
//! Because every slot is always a valid `Empty`-or-pair sum and writes only
//! replace whole slots, a collector traversing under the lock during the
//! abort race sees one of two valid tables, never a mixture.
//!
//! [`FrozenMap`] is the immutable variant produced by freezing; it supports
//! lookup and iteration only.

pub(crate) mod core;

use self::core::MapCore;
use crate::gc::{Trace, Visitor};
use crate::tracing_compat::{debug, trace};
use crate::txn::Substrate;
use crate::types::Op;
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

struct MapInner<K, V> {
    /// The live table every reader sees.
    current: MapCore<K, V>,
    /// Pre-transaction table, held while an open transaction has made
    /// speculative writes. Abort republishes it; commit discards it.
    rollback: Option<MapCore<K, V>>,
}

/// Mutable, insertion-ordered map with transaction-safe writes.
pub struct TransactMap<K, V> {
    inner: Arc<Mutex<MapInner<K, V>>>,
}

impl<K, V> Clone for TransactMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for TransactMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for TransactMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransactMap")
            .field("len", &inner.current.len())
            .field("capacity", &inner.current.capacity())
            .field("speculative", &inner.rollback.is_some())
            .finish()
    }
}

/// Restores the snapshot on abort; discards it when dropped unrun (commit).
struct RollbackGuard<K, V> {
    inner: Arc<Mutex<MapInner<K, V>>>,
}

impl<K, V> RollbackGuard<K, V> {
    fn abort(&self) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.rollback.take() {
            inner.current = previous;
            trace!("speculative writes reverted");
        }
    }
}

impl<K, V> Drop for RollbackGuard<K, V> {
    fn drop(&mut self) {
        // After an abort the snapshot is already gone and this is a no-op.
        // After a commit it discards the snapshot, making the speculative
        // writes final.
        self.inner.lock().rollback = None;
    }
}

impl<K, V> TransactMap<K, V> {
    /// Creates an empty map of minimum capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::from_core(MapCore::new())
    }

    /// Creates an empty map sized so `elements` inserts need no growth.
    #[must_use]
    pub fn with_capacity(elements: usize) -> Self {
        Self::from_core(MapCore::with_capacity(elements))
    }

    fn from_core(core: MapCore<K, V>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MapInner {
                current: core,
                rollback: None,
            })),
        }
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().current.len()
    }

    /// Returns true if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().current.is_empty()
    }

    /// Returns the current slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().current.capacity()
    }
}

impl<K: Hash + Eq, V> TransactMap<K, V> {
    /// Hashes a key with the map's fixed-seed hasher.
    pub fn hash_of(&self, key: &K) -> u64 {
        self.inner.lock().current.hash_of(key)
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().current.get(key).cloned()
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().current.get(key).is_some()
    }

    /// Linear-probe lookup from a caller-supplied hash. Returns the value on
    /// a hit plus the probed slot index either way.
    pub fn find_with_hash(&self, hash: u64, key: &K) -> (Option<V>, usize)
    where
        V: Clone,
    {
        let inner = self.inner.lock();
        let (found, slot) = inner.current.find_with_hash(hash, key);
        (found.cloned(), slot)
    }

    /// Clones the keys in insertion order.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.inner.lock().current.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Clones the entries in insertion order.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.inner
            .lock()
            .current
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Sequence-order equality against another map. Keys compare with `Eq`;
    /// values go through `value_eq`, so entries holding not-yet-available
    /// placeholders can be compared without forcing them.
    pub fn eq_with(&self, other: &Self, mut value_eq: impl FnMut(&V, &V) -> bool) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            let inner = self.inner.lock();
            return inner.current.eq_with(&inner.current, &mut value_eq);
        }
        // Address-ordered locking so two concurrent comparisons of the same
        // pair cannot deadlock.
        let self_first = Arc::as_ptr(&self.inner) as usize <= Arc::as_ptr(&other.inner) as usize;
        let (first, second) = if self_first {
            (&self.inner, &other.inner)
        } else {
            (&other.inner, &self.inner)
        };
        let first_guard = first.lock();
        let second_guard = second.lock();
        let (self_inner, other_inner) = if self_first {
            (&first_guard, &second_guard)
        } else {
            (&second_guard, &first_guard)
        };
        self_inner.current.eq_with(&other_inner.current, &mut value_eq)
    }

    /// Sequence-order equality against a frozen map.
    pub fn eq_frozen(&self, other: &FrozenMap<K, V>, mut value_eq: impl FnMut(&V, &V) -> bool) -> bool {
        self.inner.lock().current.eq_with(&other.core, &mut value_eq)
    }
}

impl<K, V> TransactMap<K, V>
where
    K: Hash + Eq + Clone + Trace + Send + 'static,
    V: Clone + PartialEq + Trace + Send + 'static,
{
    /// Takes the pre-transaction snapshot and registers the rollback
    /// discipline, once per transaction: the container is rooted for the
    /// collector, the snapshot's buffers are accounted as aux roots, and the
    /// abort handler republishes the snapshot under the lock.
    fn ensure_rollback(&self, inner: &mut MapInner<K, V>, txn: &dyn Substrate) {
        if inner.rollback.is_some() {
            return;
        }
        let snapshot = inner.current.clone();
        txn.add_root(Box::new(self.clone()));
        txn.add_aux_root(snapshot.aux_bytes());
        inner.rollback = Some(snapshot);
        let guard = RollbackGuard {
            inner: Arc::clone(&self.inner),
        };
        txn.register_abort_handler(Box::new(move || guard.abort()));
        trace!("speculative snapshot taken");
    }

    /// Inserts or updates `key`, growing first when needed. Inside an open
    /// transaction the write is speculative and reverts wholesale on abort;
    /// outside one it is final immediately. Returns the slot index and
    /// whether an existing entry was replaced.
    pub fn insert(&self, txn: &dyn Substrate, key: K, value: V) -> (usize, bool) {
        let mut inner = self.inner.lock();
        if txn.in_transaction() {
            self.ensure_rollback(&mut inner, txn);
        }
        let before = inner.current.capacity();
        let (slot, replaced) = inner.current.add_or_update(key, value);
        if inner.current.capacity() != before {
            debug!(capacity = inner.current.capacity(), "table grown");
        }
        (slot, replaced)
    }

    /// Grows the table to at least `new_capacity` slots ahead of bulk
    /// inserts. Follows the same speculative discipline as [`insert`](Self::insert).
    pub fn reserve(&self, txn: &dyn Substrate, new_capacity: usize) {
        let mut inner = self.inner.lock();
        if txn.in_transaction() {
            self.ensure_rollback(&mut inner, txn);
        }
        inner.current.reserve(new_capacity);
    }
}

impl<K, V> TransactMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{

    /// Copies the map into an immutable [`FrozenMap`], passing every value
    /// through `transform` in insertion order.
    ///
    /// A transform that suspends ([`Op::Yield`]) or reports cancellation
    /// makes the whole freeze yield that same answer, leaving no partial
    /// destination behind; the host re-runs the freeze after resuming.
    pub fn freeze_with(
        &self,
        mut transform: impl FnMut(&V) -> Op<V>,
    ) -> Op<FrozenMap<K, V>> {
        // Snapshot under the lock, transform outside it, so a transform that
        // re-enters this map cannot deadlock.
        let entries = {
            let inner = self.inner.lock();
            inner
                .current
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
        };
        let mut dest = MapCore::with_capacity(entries.len());
        for (key, value) in entries {
            match transform(&value) {
                Op::Return(transformed) => {
                    dest.add_or_update(key, transformed);
                }
                Op::Yield(token) => return Op::Yield(token),
                Op::Cancelled => return Op::Cancelled,
            }
        }
        Op::Return(FrozenMap { core: dest })
    }

    /// Copies the map into an immutable [`FrozenMap`] without transforming
    /// values.
    #[must_use]
    pub fn freeze(&self) -> FrozenMap<K, V> {
        FrozenMap {
            core: self.inner.lock().current.clone(),
        }
    }
}

impl<K: Trace, V: Trace> Trace for TransactMap<K, V> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        let inner = self.inner.lock();
        inner.current.trace_into(visitor);
        if let Some(rollback) = &inner.rollback {
            rollback.trace_into(visitor);
        }
    }
}

impl<K: Trace, V: Trace> MapCore<K, V> {
    fn trace_into(&self, visitor: &mut dyn Visitor) {
        visitor.visit_aux(self.aux_bytes());
        for (key, value) in self.iter() {
            key.trace(visitor);
            value.trace(visitor);
        }
    }
}

/// Immutable, insertion-ordered map produced by freezing.
#[derive(Debug, Clone)]
pub struct FrozenMap<K, V> {
    core: MapCore<K, V>,
}

impl<K, V> FrozenMap<K, V> {
    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns true if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    /// Returns the slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.core.iter()
    }
}

impl<K: Hash + Eq, V> FrozenMap<K, V> {
    /// Hashes a key with the map's fixed-seed hasher.
    pub fn hash_of(&self, key: &K) -> u64 {
        self.core.hash_of(key)
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.core.get(key)
    }

    /// Linear-probe lookup from a caller-supplied hash.
    pub fn find_with_hash(&self, hash: u64, key: &K) -> (Option<&V>, usize) {
        self.core.find_with_hash(hash, key)
    }

    /// Sequence-order equality against another frozen map, with values
    /// compared through `value_eq`.
    pub fn eq_with(&self, other: &Self, mut value_eq: impl FnMut(&V, &V) -> bool) -> bool {
        self.core.eq_with(&other.core, &mut value_eq)
    }
}

impl<K, V> FrozenMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Copies this map back into a mutable [`TransactMap`], passing every
    /// value through `transform` in insertion order. Suspension and
    /// cancellation propagate exactly as in
    /// [`TransactMap::freeze_with`].
    pub fn melt_with(
        &self,
        mut transform: impl FnMut(&V) -> Op<V>,
    ) -> Op<TransactMap<K, V>> {
        let mut dest = MapCore::with_capacity(self.len());
        for (key, value) in self.iter() {
            match transform(value) {
                Op::Return(transformed) => {
                    dest.add_or_update(key.clone(), transformed);
                }
                Op::Yield(token) => return Op::Yield(token),
                Op::Cancelled => return Op::Cancelled,
            }
        }
        Op::Return(TransactMap::from_core(dest))
    }

    /// Copies this map back into a mutable [`TransactMap`] without
    /// transforming values.
    #[must_use]
    pub fn melt(&self) -> TransactMap<K, V> {
        TransactMap::from_core(self.core.clone())
    }
}

impl<K: Trace, V: Trace> Trace for FrozenMap<K, V> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.core.trace_into(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::UntrackedSubstrate;

    #[test]
    fn insert_find_and_order() {
        let map = TransactMap::new();
        let txn = UntrackedSubstrate;
        map.insert(&txn, "a".to_string(), 1u32);
        map.insert(&txn, "b".to_string(), 2);
        map.insert(&txn, "c".to_string(), 3);

        assert_eq!(map.get(&"b".to_string()), Some(2));
        assert_eq!(
            map.keys(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn replace_reports_and_updates() {
        let map = TransactMap::new();
        let txn = UntrackedSubstrate;
        let (slot, replaced) = map.insert(&txn, 1u32, 10u32);
        assert!(!replaced);
        let (slot2, replaced) = map.insert(&txn, 1u32, 20u32);
        assert!(replaced);
        assert_eq!(slot, slot2);
        assert_eq!(map.get(&1), Some(20));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn freeze_then_melt_round_trip() {
        let map = TransactMap::new();
        let txn = UntrackedSubstrate;
        for (i, key) in ["x", "y", "z"].into_iter().enumerate() {
            map.insert(&txn, key.to_string(), i as u32);
        }

        let frozen = map.freeze();
        assert_eq!(frozen.len(), 3);
        assert_eq!(frozen.get(&"y".to_string()), Some(&1));
        let order: Vec<_> = frozen.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(order, vec!["x", "y", "z"]);

        let melted = frozen.melt();
        assert!(melted.eq_frozen(&frozen, |a, b| a == b));
    }

    #[test]
    fn freeze_with_propagates_suspension_without_partial_result() {
        use crate::types::{ResumeToken, TaskId};

        let map = TransactMap::new();
        let txn = UntrackedSubstrate;
        map.insert(&txn, 1u32, 1u32);
        map.insert(&txn, 2u32, 2u32);

        let token = ResumeToken::new(TaskId::new_for_test(0, 0), 1);
        let mut calls = 0;
        let result = map.freeze_with(|v| {
            calls += 1;
            if calls == 2 {
                Op::Yield(token)
            } else {
                Op::Return(*v)
            }
        });
        match result {
            Op::Yield(yielded) => assert_eq!(yielded, token),
            _ => panic!("expected the freeze to yield"),
        }
        assert_eq!(calls, 2, "stops at the suspending transform");
    }

    #[test]
    fn frozen_map_equality_uses_handler() {
        let map = TransactMap::new();
        let txn = UntrackedSubstrate;
        map.insert(&txn, 1u32, 5u32);

        let a = map.freeze();
        let b = map.freeze();
        assert!(a.eq_with(&b, |x, y| x == y));
        assert!(!a.eq_with(&b, |_, _| false));
    }
}
