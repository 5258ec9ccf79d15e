use crate::store::StorageError;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

pub type CoordinatorResult<T, E> = Result<T, CoordinatorError<E>>;

/// Stable classification of a coordinator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorErrorKind {
    SessionUnavailable,
    TransactionBeginFailed,
    OperationFailed,
    CommitFailed,
}

impl CoordinatorErrorKind {
    /// Stable snake_case code used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionUnavailable => "session_unavailable",
            Self::TransactionBeginFailed => "transaction_begin_failed",
            Self::OperationFailed => "operation_failed",
            Self::CommitFailed => "commit_failed",
        }
    }
}

/// Failure of one unit of work, carrying the original cause.
///
/// `E` is the error type of the unit of work itself.
pub enum CoordinatorError<E> {
    /// No storage session could be opened.
    SessionUnavailable(StorageError),
    /// A session was opened but the transaction did not start.
    TransactionBeginFailed(StorageError),
    /// The unit of work returned an error; the transaction was rolled back.
    OperationFailed(E),
    /// The unit of work succeeded but commit failed; the transaction was
    /// rolled back where still possible.
    CommitFailed(StorageError),
}

impl<E> CoordinatorError<E> {
    pub fn kind(&self) -> CoordinatorErrorKind {
        match self {
            Self::SessionUnavailable(_) => CoordinatorErrorKind::SessionUnavailable,
            Self::TransactionBeginFailed(_) => CoordinatorErrorKind::TransactionBeginFailed,
            Self::OperationFailed(_) => CoordinatorErrorKind::OperationFailed,
            Self::CommitFailed(_) => CoordinatorErrorKind::CommitFailed,
        }
    }

    /// The unit of work's own error, when that is what failed.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::OperationFailed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed(err) => Some(err),
            _ => None,
        }
    }

    /// The storage failure, for every kind except `OperationFailed`.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::SessionUnavailable(err)
            | Self::TransactionBeginFailed(err)
            | Self::CommitFailed(err) => Some(err),
            Self::OperationFailed(_) => None,
        }
    }

    /// Converts the operation error, keeping storage failures as they are.
    pub fn map_operation<F, M>(self, map: M) -> CoordinatorError<F>
    where
        M: FnOnce(E) -> F,
    {
        match self {
            Self::SessionUnavailable(err) => CoordinatorError::SessionUnavailable(err),
            Self::TransactionBeginFailed(err) => CoordinatorError::TransactionBeginFailed(err),
            Self::OperationFailed(err) => CoordinatorError::OperationFailed(map(err)),
            Self::CommitFailed(err) => CoordinatorError::CommitFailed(err),
        }
    }
}

impl<E: Debug> Debug for CoordinatorError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionUnavailable(err) => f.debug_tuple("SessionUnavailable").field(err).finish(),
            Self::TransactionBeginFailed(err) => {
                f.debug_tuple("TransactionBeginFailed").field(err).finish()
            }
            Self::OperationFailed(err) => f.debug_tuple("OperationFailed").field(err).finish(),
            Self::CommitFailed(err) => f.debug_tuple("CommitFailed").field(err).finish(),
        }
    }
}

impl<E: Display> Display for CoordinatorError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionUnavailable(err) => write!(f, "could not open storage session: {err}"),
            Self::TransactionBeginFailed(err) => write!(f, "could not begin transaction: {err}"),
            Self::OperationFailed(err) => write!(f, "unit of work failed: {err}"),
            Self::CommitFailed(err) => write!(f, "could not commit transaction: {err}"),
        }
    }
}

impl<E> Error for CoordinatorError<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SessionUnavailable(err)
            | Self::TransactionBeginFailed(err)
            | Self::CommitFailed(err) => Some(err),
            Self::OperationFailed(err) => Some(err),
        }
    }
}
