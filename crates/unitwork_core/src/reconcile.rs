//! Row-callback consumer that keeps duplicate instances consistent.
//!
//! # Responsibility
//! - Register loaded and inserted instances with the identity tracker.
//! - Record created, updated and removed instances in the pending log.
//! - Copy persisted fields from an updated instance into its live siblings.
//!
//! # Invariants
//! - The identity column is never copied; only `Entity::fields()` is.
//! - A field whose value already matches is not written again.
//! - A sibling that rejects a field is logged and skipped; the remaining
//!   fields and siblings are still reconciled.

use crate::event::pending::PendingEventLog;
use crate::identity::IdentityTracker;
use crate::model::change::ChangeKind;
use crate::model::entity::{same_instance, AnyEntityRef, IdentityKey};
use crate::store::RowListener;
use log::warn;
use std::sync::Arc;

/// Storage callback surface feeding the tracker and the pending log.
pub struct ReconciliationHook {
    tracker: Arc<IdentityTracker>,
}

impl ReconciliationHook {
    pub fn new(tracker: Arc<IdentityTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<IdentityTracker> {
        &self.tracker
    }
}

impl RowListener for ReconciliationHook {
    fn after_insert(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef) {
        self.tracker.register(key.kind, key.id, entity);
        events.append(ChangeKind::Created, Arc::clone(entity));
    }

    fn after_update(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef) {
        events.append(ChangeKind::Updated, Arc::clone(entity));
        for sibling in self.tracker.find(key.kind, key.id) {
            if same_instance(&sibling, entity) {
                continue;
            }
            copy_persisted_fields(entity, &sibling);
        }
    }

    fn after_delete(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef) {
        self.tracker.unregister(key.kind, key.id);
        events.append(ChangeKind::Removed, Arc::clone(entity));
    }

    fn after_load(&self, _events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef) {
        self.tracker.register(key.kind, key.id, entity);
    }
}

/// Copies every persisted field of `source` that differs in `target`.
///
/// Returns the number of fields written.
pub fn copy_persisted_fields(source: &AnyEntityRef, target: &AnyEntityRef) -> usize {
    if same_instance(source, target) {
        return 0;
    }

    let mut written = 0;
    for (name, value) in source.snapshot_fields() {
        if target.field(name).as_ref() == Some(&value) {
            continue;
        }
        match target.write_field(name, value) {
            Ok(()) => written += 1,
            Err(err) => {
                warn!(
                    "event=reconcile_field_skipped module=reconcile status=error kind={} id={} field={} error={}",
                    target.kind().name,
                    target
                        .id()
                        .map_or_else(|| "none".to_string(), |id| id.to_string()),
                    name,
                    err
                );
            }
        }
    }
    written
}
