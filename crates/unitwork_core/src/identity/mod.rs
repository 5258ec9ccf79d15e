//! Weak identity map for live in-memory instances.
//!
//! # Responsibility
//! - Map each stored record to the instances currently loaded for it.
//!
//! # Invariants
//! - The tracker never keeps an instance alive.
//! - Dead references are pruned lazily on lookup or insert.

mod tracker;

pub use tracker::IdentityTracker;
