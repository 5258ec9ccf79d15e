//! Persistence coordination layer for SQLite-backed domain records.
//! This crate owns transaction boundaries, change notification and
//! in-memory identity reconciliation; applications own their schema.

pub mod coordinator;
pub mod db;
pub mod event;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod model;
pub mod reconcile;
pub mod store;

pub use coordinator::{
    Coordinator, CoordinatorError, CoordinatorErrorKind, CoordinatorResult, SafeWork,
    TransactionState,
};
pub use db::{DbError, Migration};
pub use event::{
    GroupedNotification, KindFilter, Observer, ObserverRegistry, PendingEvent, PendingEventLog,
    RegistryError,
};
pub use identity::IdentityTracker;
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use manager::{EntityManager, ManagerError, ManagerResult};
pub use model::change::{ChangeKind, ChangeMask};
pub use model::entity::{
    AnyEntityRef, Archivable, Entity, EntityId, EntityKind, EntityRef, FieldError, IdentityKey,
};
pub use reconcile::ReconciliationHook;
pub use store::{
    ListScope, RowListener, SqliteConfig, SqliteEngine, SqliteSession, StorageEngine,
    StorageError, StorageResult, StorageSession,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
