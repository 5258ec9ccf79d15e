//! Storage-engine boundary consumed by the transaction coordinator.
//!
//! # Responsibility
//! - Define the session lifecycle (`begin` / `commit` / `rollback` / `close`).
//! - Define the row-level callback surface the engine reports changes through.
//! - Provide the SQLite-backed engine used by applications and tests.
//!
//! # Invariants
//! - An engine accepts exactly one row listener for its lifetime.
//! - Every session owns the pending event log of its current transaction.

use crate::db::DbError;
use crate::event::pending::PendingEventLog;
use crate::model::entity::{AnyEntityRef, EntityId, FieldError, IdentityKey};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub mod config;
mod sqlite;

pub use config::SqliteConfig;
pub use sqlite::{ListScope, SqliteEngine, SqliteSession};

pub type StorageResult<T> = Result<T, StorageError>;

/// Error for storage sessions and row operations.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
    /// Connection bootstrap or migration failure.
    Db(DbError),
    /// The entity has no identity yet.
    NotPersisted { kind: &'static str },
    /// No row exists for this identity.
    NotFound { kind: &'static str, id: EntityId },
    /// A row operation or commit ran outside an open transaction.
    TransactionNotActive,
    /// `begin` was called on a session with an open transaction.
    TransactionAlreadyActive,
    /// The session was closed.
    SessionClosed,
    /// A row listener was already installed on the engine.
    ListenerAlreadyInstalled,
    /// Stored row could not be applied to a fresh instance.
    Field(FieldError),
    /// Failure reported by a non-SQLite engine.
    Backend(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotPersisted { kind } => write!(f, "{kind} instance has no identity yet"),
            Self::NotFound { kind, id } => write!(f, "{kind} row not found: {id}"),
            Self::TransactionNotActive => write!(f, "no transaction is active on this session"),
            Self::TransactionAlreadyActive => {
                write!(f, "a transaction is already active on this session")
            }
            Self::SessionClosed => write!(f, "session is closed"),
            Self::ListenerAlreadyInstalled => write!(f, "a row listener is already installed"),
            Self::Field(err) => write!(f, "{err}"),
            Self::Backend(message) => write!(f, "storage backend error: {message}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Field(err) => Some(err),
            Self::NotPersisted { .. }
            | Self::NotFound { .. }
            | Self::TransactionNotActive
            | Self::TransactionAlreadyActive
            | Self::SessionClosed
            | Self::ListenerAlreadyInstalled
            | Self::Backend(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<DbError> for StorageError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<FieldError> for StorageError {
    fn from(value: FieldError) -> Self {
        Self::Field(value)
    }
}

/// Row-level change callbacks delivered by a storage engine.
///
/// `events` is the pending log of the transaction the change belongs to.
pub trait RowListener: Send + Sync {
    fn after_insert(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef);

    fn after_update(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef);

    fn after_delete(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef);

    fn after_load(&self, events: &PendingEventLog, key: IdentityKey, entity: &AnyEntityRef);
}

/// One storage session; hosts at most one open transaction at a time.
pub trait StorageSession: Send + Sync {
    fn begin(&self) -> StorageResult<()>;

    fn commit(&self) -> StorageResult<()>;

    fn rollback(&self) -> StorageResult<()>;

    /// Releases the session, rolling back any open transaction.
    fn close(&self) -> StorageResult<()>;

    fn is_active(&self) -> bool;

    fn pending_events(&self) -> &PendingEventLog;
}

/// Factory for storage sessions.
pub trait StorageEngine: Send + Sync {
    type Session: StorageSession + 'static;

    fn open_session(&self) -> StorageResult<Self::Session>;

    /// Registers the sole consumer of row-level callbacks.
    ///
    /// # Errors
    /// - `ListenerAlreadyInstalled` on every call after the first.
    fn install_row_listener(&self, listener: Arc<dyn RowListener>) -> StorageResult<()>;
}
