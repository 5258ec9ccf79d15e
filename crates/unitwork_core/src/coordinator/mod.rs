//! Transaction coordination for units of work.
//!
//! # Responsibility
//! - Give every logical operation one transaction boundary per thread.
//! - Turn committed row changes into grouped observer notifications.
//!
//! # Invariants
//! - Callers see either success with dispatch already completed, or an error
//!   with nothing dispatched for that attempt.

mod error;
mod runner;

pub use error::{CoordinatorError, CoordinatorErrorKind, CoordinatorResult};
pub use runner::{Coordinator, SafeWork, TransactionState};
