//! Change kinds and subscription masks.
//!
//! # Responsibility
//! - Name the three row-level changes observers can react to.
//! - Provide a bitmask so one subscription can match several kinds.
//!
//! # Invariants
//! - Bit values are stable: created = 1, removed = 2, updated = 4.
//! - `ChangeMask::ALL` is exactly the union of the three kinds.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};

/// Row-level change recorded while a transaction is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row inserted.
    Created,
    /// One or more persisted fields changed.
    Updated,
    /// Row deleted.
    Removed,
}

impl ChangeKind {
    /// Single-bit mask for this kind.
    pub fn mask(self) -> ChangeMask {
        match self {
            Self::Created => ChangeMask::CREATED,
            Self::Updated => ChangeMask::UPDATED,
            Self::Removed => ChangeMask::REMOVED,
        }
    }

    /// Stable lowercase name used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of change kinds a subscription is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeMask(u8);

impl ChangeMask {
    pub const NONE: Self = Self(0);
    pub const CREATED: Self = Self(1);
    pub const REMOVED: Self = Self(1 << 1);
    pub const UPDATED: Self = Self(1 << 2);
    pub const ALL: Self = Self(Self::CREATED.0 | Self::REMOVED.0 | Self::UPDATED.0);

    /// Builds a mask from raw bits, dropping unknown bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// Returns true when both masks share at least one kind.
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true when every kind of `other` is also in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ChangeMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<ChangeKind> for ChangeMask {
    fn from(value: ChangeKind) -> Self {
        value.mask()
    }
}
