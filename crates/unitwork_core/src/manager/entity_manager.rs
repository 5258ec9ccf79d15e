//! Typed CRUD over one entity kind.
//!
//! # Responsibility
//! - Run each batch operation as one unit of work on the coordinator.
//! - Keep list/size scoped to non-archived rows for archivable kinds.
//!
//! # Invariants
//! - A batch either applies to every record or to none of them.
//! - Notifications for a batch arrive as one group per change kind.

use super::{ManagerError, ManagerResult};
use crate::coordinator::Coordinator;
use crate::event::registry::{KindFilter, Observer, RegistryResult};
use crate::model::change::ChangeMask;
use crate::model::entity::{Archivable, Entity, EntityId, EntityRef};
use crate::store::{ListScope, SqliteEngine};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Manager for records of type `T`.
pub struct EntityManager<'c, T: Entity> {
    coordinator: &'c Coordinator<SqliteEngine>,
    _entity: PhantomData<fn() -> T>,
}

impl<'c, T: Entity> EntityManager<'c, T> {
    pub fn new(coordinator: &'c Coordinator<SqliteEngine>) -> Self {
        Self {
            coordinator,
            _entity: PhantomData,
        }
    }

    /// Inserts every record, stamping creation and modification dates.
    ///
    /// # Errors
    /// - `ArchivedRecord` when any record already carries an archive date.
    pub fn add(&self, entities: &[EntityRef<T>]) -> ManagerResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.coordinator
            .run(|session| -> ManagerResult<()> {
                let now = now_epoch_ms();
                for entity in entities {
                    ensure_not_archived(entity)?;
                    {
                        let mut record = entity.write();
                        record.set_creation_date(now);
                        record.set_modification_date(now);
                    }
                    session.insert(entity)?;
                }
                Ok(())
            })
            .map_err(ManagerError::from)
    }

    /// Writes every record back, stamping the modification date.
    pub fn update(&self, entities: &[EntityRef<T>]) -> ManagerResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.coordinator
            .run(|session| -> ManagerResult<()> {
                let now = now_epoch_ms();
                for entity in entities {
                    ensure_not_archived(entity)?;
                    entity.write().set_modification_date(now);
                    session.update(entity)?;
                }
                Ok(())
            })
            .map_err(ManagerError::from)
    }

    /// Deletes every record.
    pub fn remove(&self, entities: &[EntityRef<T>]) -> ManagerResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.coordinator
            .run(|session| -> ManagerResult<()> {
                for entity in entities {
                    ensure_not_archived(entity)?;
                    session.delete(entity)?;
                }
                Ok(())
            })
            .map_err(ManagerError::from)
    }

    /// Loads a fresh instance of row `id`.
    pub fn get(&self, id: EntityId) -> ManagerResult<Option<EntityRef<T>>> {
        self.coordinator
            .run(|session| -> ManagerResult<_> {
                Ok(session.get::<T>(id)?)
            })
            .map_err(ManagerError::from)
    }

    /// Every record, excluding archived ones.
    pub fn list(&self) -> ManagerResult<Vec<EntityRef<T>>> {
        self.list_scope(ListScope::Active)
    }

    /// Archived records only; empty for non-archivable kinds.
    pub fn list_archived(&self) -> ManagerResult<Vec<EntityRef<T>>> {
        self.list_scope(ListScope::Archived)
    }

    /// Number of records `list` would return.
    pub fn size(&self) -> ManagerResult<u64> {
        self.coordinator
            .run(|session| -> ManagerResult<_> {
                Ok(session.count::<T>(ListScope::Active)?)
            })
            .map_err(ManagerError::from)
    }

    /// Subscribes `observer` to changes of `T` (and of kinds declaring `T`'s
    /// kind name as a supertype).
    pub fn subscribe(&self, mask: ChangeMask, observer: Arc<dyn Observer>) -> RegistryResult<()> {
        self.coordinator
            .subscribe(mask, KindFilter::of::<T>(), observer)
    }

    pub fn unsubscribe(&self, mask: ChangeMask, observer: &Arc<dyn Observer>) -> bool {
        self.coordinator
            .unsubscribe(mask, KindFilter::of::<T>(), observer)
    }

    fn list_scope(&self, scope: ListScope) -> ManagerResult<Vec<EntityRef<T>>> {
        self.coordinator
            .run(|session| -> ManagerResult<_> {
                Ok(session.list::<T>(scope)?)
            })
            .map_err(ManagerError::from)
    }
}

impl<T: Archivable> EntityManager<'_, T> {
    /// Stamps the archive and modification dates on every record.
    ///
    /// Archived records leave `list`/`size` and show up in `list_archived`.
    pub fn archive(&self, entities: &[EntityRef<T>]) -> ManagerResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.coordinator
            .run(|session| -> ManagerResult<()> {
                let now = now_epoch_ms();
                for entity in entities {
                    {
                        let mut record = entity.write();
                        record.set_modification_date(now);
                        record.set_archived_date(Some(now));
                    }
                    session.update(entity)?;
                }
                Ok(())
            })
            .map_err(ManagerError::from)
    }
}

fn ensure_not_archived<T: Entity>(entity: &EntityRef<T>) -> ManagerResult<()> {
    let record = entity.read();
    if record.archived_date().is_some() {
        return Err(ManagerError::ArchivedRecord {
            kind: T::KIND.name,
            id: record.id(),
        });
    }
    Ok(())
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}
