//! Weak-reference identity tracker.
//!
//! # Responsibility
//! - Register instances per `(kind, id)` without owning them.
//! - Return the live instances for one record, pruning dead ones.
//! - Forget a record entirely once it is deleted from storage.
//!
//! # Invariants
//! - `find` never returns an instance whose strong count reached zero.
//! - A key whose set becomes empty during `find` is removed.
//! - One instance is registered at most once per key.

use crate::model::entity::{same_instance, AnyEntityRef, EntityId, WeakEntityRef};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type KindMap = HashMap<EntityId, Vec<WeakEntityRef>>;

/// Thread-safe weak identity map keyed by entity kind then id.
///
/// One mutex guards the whole map; lookups are short and never call back
/// into user code while the lock is held.
#[derive(Default)]
pub struct IdentityTracker {
    kinds: Mutex<HashMap<&'static str, KindMap>>,
}

impl IdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `instance` to the live set of `(kind, id)`.
    ///
    /// Dead references in that set are dropped first; re-registering the same
    /// instance is a no-op.
    pub fn register(&self, kind: &'static str, id: EntityId, instance: &AnyEntityRef) {
        let mut kinds = self.kinds.lock();
        let set = kinds.entry(kind).or_default().entry(id).or_default();
        let pruned = prune(set);
        if pruned > 0 {
            debug!(
                "event=identity_prune module=identity status=ok kind={} id={} pruned={}",
                kind, id, pruned
            );
        }

        let already_present = set
            .iter()
            .filter_map(|weak| weak.upgrade())
            .any(|live| same_instance(&live, instance));
        if !already_present {
            set.push(Arc::downgrade(instance));
        }
    }

    /// Returns every still-reachable instance of `(kind, id)`.
    ///
    /// Never fails; returns an empty list when nothing is alive.
    pub fn find(&self, kind: &'static str, id: EntityId) -> Vec<AnyEntityRef> {
        let mut kinds = self.kinds.lock();
        let Some(by_id) = kinds.get_mut(kind) else {
            return Vec::new();
        };
        let Some(set) = by_id.get_mut(&id) else {
            return Vec::new();
        };

        let live: Vec<AnyEntityRef> = set.iter().filter_map(|weak| weak.upgrade()).collect();
        let pruned = set.len() - live.len();
        if pruned > 0 {
            set.retain(|weak| weak.strong_count() > 0);
            debug!(
                "event=identity_prune module=identity status=ok kind={} id={} pruned={}",
                kind, id, pruned
            );
        }

        if set.is_empty() {
            by_id.remove(&id);
            if by_id.is_empty() {
                kinds.remove(kind);
            }
        }
        live
    }

    /// Drops the whole `(kind, id)` entry.
    pub fn unregister(&self, kind: &'static str, id: EntityId) {
        let mut kinds = self.kinds.lock();
        if let Some(by_id) = kinds.get_mut(kind) {
            by_id.remove(&id);
            if by_id.is_empty() {
                kinds.remove(kind);
            }
        }
    }

    /// Returns true when an entry exists for `(kind, id)`, live or not.
    pub fn contains_key(&self, kind: &'static str, id: EntityId) -> bool {
        self.kinds
            .lock()
            .get(kind)
            .is_some_and(|by_id| by_id.contains_key(&id))
    }

    /// Number of tracked keys, including keys whose instances died but were
    /// not looked up since.
    pub fn key_count(&self) -> usize {
        self.kinds.lock().values().map(HashMap::len).sum()
    }
}

fn prune(set: &mut Vec<WeakEntityRef>) -> usize {
    let before = set.len();
    set.retain(|weak| weak.strong_count() > 0);
    before - set.len()
}
