//! Domain-facing model types shared by every coordination component.
//!
//! # Responsibility
//! - Define the entity contract storage, tracker and observers agree on.
//! - Define change kinds and subscription masks.
//!
//! # Invariants
//! - Every stored record is identified by an `IdentityKey` (kind + id).
//! - In-memory instances are compared by identity, never by value.

pub mod change;
pub mod entity;

#[cfg(test)]
pub(crate) mod fixtures;
