//! Typed per-entity record managers built on the coordinator.
//!
//! # Responsibility
//! - Offer add/update/remove/list/get/size for one entity type.
//! - Stamp creation, modification and archive dates.
//! - Refuse changes to archived records.
//!
//! # Invariants
//! - Every manager call is exactly one unit of work (or joins the caller's).

use crate::coordinator::CoordinatorError;
use crate::model::entity::EntityId;
use crate::store::StorageError;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod entity_manager;

pub use entity_manager::EntityManager;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug)]
pub enum ManagerError {
    /// A row operation failed.
    Storage(StorageError),
    /// The transaction could not start or commit.
    Transaction(Box<CoordinatorError<ManagerError>>),
    /// Archived records cannot be added, updated or removed.
    ArchivedRecord {
        kind: &'static str,
        id: Option<EntityId>,
    },
}

impl ManagerError {
    /// Innermost error of the source chain.
    pub fn root_cause(&self) -> &(dyn Error + 'static) {
        let mut current: &(dyn Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }
}

impl Display for ManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(err) => write!(f, "{err}"),
            Self::Transaction(err) => write!(f, "{err}"),
            Self::ArchivedRecord { kind, id } => match id {
                Some(id) => write!(f, "{kind} record {id} is archived and cannot be changed"),
                None => write!(f, "{kind} record is archived and cannot be changed"),
            },
        }
    }
}

impl Error for ManagerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Transaction(err) => Some(err.as_ref()),
            Self::ArchivedRecord { .. } => None,
        }
    }
}

impl From<StorageError> for ManagerError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<CoordinatorError<ManagerError>> for ManagerError {
    fn from(value: CoordinatorError<ManagerError>) -> Self {
        match value {
            CoordinatorError::OperationFailed(inner) => inner,
            other => Self::Transaction(Box::new(other)),
        }
    }
}
