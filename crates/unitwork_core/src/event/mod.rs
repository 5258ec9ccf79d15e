//! Change events: per-transaction log, grouping and observer dispatch.
//!
//! # Responsibility
//! - Buffer row-level changes until the owning transaction commits.
//! - Deliver batched notifications to registered observers.
//!
//! # Invariants
//! - Nothing is dispatched for a transaction that did not commit.

pub mod pending;
pub mod registry;

pub use pending::{GroupedNotification, PendingEvent, PendingEventLog};
pub use registry::{KindFilter, Observer, ObserverRegistry, RegistryError, RegistryResult};
