//! Per-transaction pending event log and notification grouping.
//!
//! # Responsibility
//! - Record `(change, instance)` pairs in the order storage reports them.
//! - Collapse the log into one notification per `(kind, change)` pair.
//!
//! # Invariants
//! - Groups come out in first-seen order.
//! - A group never carries an empty entity list.
//! - Within one group an instance appears once, at its first position.

use crate::model::change::ChangeKind;
use crate::model::entity::{same_instance, AnyEntityRef, Entity, EntityKind, EntityRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

/// One entry of the pending log.
#[derive(Clone)]
pub struct PendingEvent {
    pub change: ChangeKind,
    pub entity: AnyEntityRef,
}

/// Batched change notification for one `(kind, change)` pair.
#[derive(Clone)]
pub struct GroupedNotification {
    change: ChangeKind,
    kind: EntityKind,
    entities: Vec<AnyEntityRef>,
}

impl GroupedNotification {
    pub fn change(&self) -> ChangeKind {
        self.change
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn entities(&self) -> &[AnyEntityRef] {
        &self.entities
    }

    /// Typed handles for every entity of concrete type `T` in this group.
    pub fn entities_of<T: Entity>(&self) -> Vec<EntityRef<T>> {
        self.entities
            .iter()
            .filter_map(EntityRef::<T>::from_any)
            .collect()
    }

    /// Returns true when `entity` is one of the grouped instances.
    pub fn contains(&self, entity: &AnyEntityRef) -> bool {
        self.entities
            .iter()
            .any(|candidate| same_instance(candidate, entity))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Debug for GroupedNotification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<Option<i64>> = self.entities.iter().map(|entity| entity.id()).collect();
        f.debug_struct("GroupedNotification")
            .field("change", &self.change)
            .field("kind", &self.kind.name)
            .field("ids", &ids)
            .finish()
    }
}

/// Append-only log of changes recorded while one transaction is open.
#[derive(Default)]
pub struct PendingEventLog {
    entries: Mutex<Vec<PendingEvent>>,
}

impl PendingEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, change: ChangeKind, entity: AnyEntityRef) {
        self.entries.lock().push(PendingEvent { change, entity });
    }

    /// Discards every entry without producing notifications.
    ///
    /// Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the raw entries in append order.
    pub fn snapshot(&self) -> Vec<PendingEvent> {
        self.entries.lock().clone()
    }

    /// Empties the log and groups its entries by `(kind, change)`.
    pub fn drain_grouped(&self) -> Vec<GroupedNotification> {
        let entries = std::mem::take(&mut *self.entries.lock());
        group_events(entries)
    }
}

fn group_events(entries: Vec<PendingEvent>) -> Vec<GroupedNotification> {
    let mut groups: Vec<GroupedNotification> = Vec::new();
    let mut index_by_pair: HashMap<(&'static str, ChangeKind), usize> = HashMap::new();

    for PendingEvent { change, entity } in entries {
        let kind = entity.kind();
        let slot = *index_by_pair.entry((kind.name, change)).or_insert_with(|| {
            groups.push(GroupedNotification {
                change,
                kind,
                entities: Vec::new(),
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        if !group.contains(&entity) {
            group.entities.push(entity);
        }
    }

    groups
}
