//! Entity contract, identity keys and shared instance handles.
//!
//! # Responsibility
//! - Describe how a domain record maps onto one storage table.
//! - Provide the shared, interior-mutable handle (`EntityRef`) callers own.
//! - Provide a type-erased view used by the tracker, event log and observers.
//!
//! # Invariants
//! - `Entity::fields()` lists persisted, non-transient columns only and never
//!   includes the identity column.
//! - Instance identity is pointer identity of the shared cell, never value
//!   equality: two handles loaded for the same row are distinct instances.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rusqlite::types::Value;
use serde::Serialize;
use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Weak};

/// Primary key of a stored row.
pub type EntityId = i64;

/// Static descriptor shared by every instance of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKind {
    /// Kind name used for identity keys and observer filters.
    pub name: &'static str,
    /// Backing table. The identity column is always `id`.
    pub table: &'static str,
    /// Persisted, non-transient columns in `SELECT` order.
    pub columns: &'static [&'static str],
    /// Abstract kinds this kind satisfies, for polymorphic observer matching.
    pub supertypes: &'static [&'static str],
    /// Column holding the archive timestamp, for archivable kinds.
    pub archived_column: Option<&'static str>,
}

impl EntityKind {
    /// Returns true when `name` is this kind or one of its supertypes.
    pub fn satisfies(&self, name: &str) -> bool {
        self.name == name || self.supertypes.iter().any(|candidate| *candidate == name)
    }

    pub fn is_archivable(&self) -> bool {
        self.archived_column.is_some()
    }
}

/// Identity of one stored record: kind name plus primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey {
    pub kind: &'static str,
    pub id: EntityId,
}

impl IdentityKey {
    pub fn new(kind: &'static str, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl Display for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Errors raised when a persisted field value cannot be applied to an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldError {
    /// The entity has no persisted field with this name.
    UnknownField {
        kind: &'static str,
        field: String,
    },
    /// Stored value type does not match the field type.
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
    /// The instance refused the value.
    Rejected { field: String, reason: String },
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField { kind, field } => {
                write!(f, "entity kind `{kind}` has no persisted field `{field}`")
            }
            Self::TypeMismatch { field, expected } => {
                write!(f, "field `{field}` expects a {expected} value")
            }
            Self::Rejected { field, reason } => {
                write!(f, "field `{field}` rejected value: {reason}")
            }
        }
    }
}

impl Error for FieldError {}

/// Domain record that can be stored, tracked and reconciled.
///
/// Implementors own their field storage; the coordination layer only reads
/// and writes fields through `fields()` / `set_field()`.
pub trait Entity: Default + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Option<EntityId>;

    fn set_id(&mut self, id: EntityId);

    /// Persisted, non-transient field values keyed by column name.
    fn fields(&self) -> Vec<(&'static str, Value)>;

    /// Applies one persisted field value.
    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError>;

    /// Reads one persisted field value by column name.
    fn field(&self, name: &str) -> Option<Value> {
        self.fields()
            .into_iter()
            .find(|(column, _)| *column == name)
            .map(|(_, value)| value)
    }

    fn set_creation_date(&mut self, _epoch_ms: i64) {}

    fn set_modification_date(&mut self, _epoch_ms: i64) {}

    /// Archive timestamp; always `None` for non-archivable kinds.
    fn archived_date(&self) -> Option<i64> {
        None
    }
}

/// Entity whose rows can be soft-deleted by stamping an archive date.
pub trait Archivable: Entity {
    fn set_archived_date(&mut self, epoch_ms: Option<i64>);
}

/// Type-erased view over one live instance.
pub trait ErasedEntity: Send + Sync {
    fn kind(&self) -> EntityKind;

    fn id(&self) -> Option<EntityId>;

    fn snapshot_fields(&self) -> Vec<(&'static str, Value)>;

    fn field(&self, name: &str) -> Option<Value>;

    fn write_field(&self, name: &str, value: Value) -> Result<(), FieldError>;

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn identity_key(&self) -> Option<IdentityKey> {
        let kind = self.kind();
        self.id().map(|id| IdentityKey::new(kind.name, id))
    }
}

/// Shared type-erased handle to one instance.
pub type AnyEntityRef = Arc<dyn ErasedEntity>;

/// Weak counterpart of [`AnyEntityRef`], held by the identity tracker.
pub type WeakEntityRef = Weak<dyn ErasedEntity>;

/// Returns true when both handles point at the same instance.
pub fn same_instance(left: &AnyEntityRef, right: &AnyEntityRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

struct EntityCell<T> {
    inner: RwLock<T>,
}

impl<T: Entity> ErasedEntity for EntityCell<T> {
    fn kind(&self) -> EntityKind {
        T::KIND
    }

    fn id(&self) -> Option<EntityId> {
        self.inner.read().id()
    }

    fn snapshot_fields(&self) -> Vec<(&'static str, Value)> {
        self.inner.read().fields()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.inner.read().field(name)
    }

    fn write_field(&self, name: &str, value: Value) -> Result<(), FieldError> {
        self.inner.write().set_field(name, value)
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Strong, cloneable handle to one in-memory instance of `T`.
///
/// Cloning the handle shares the instance; loading the same row twice yields
/// two handles that are *not* `ptr_eq`.
pub struct EntityRef<T: Entity> {
    cell: Arc<EntityCell<T>>,
}

impl<T: Entity> EntityRef<T> {
    pub fn new(entity: T) -> Self {
        Self {
            cell: Arc::new(EntityCell {
                inner: RwLock::new(entity),
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.inner.write()
    }

    pub fn id(&self) -> Option<EntityId> {
        self.read().id()
    }

    pub fn identity_key(&self) -> Option<IdentityKey> {
        self.id().map(|id| IdentityKey::new(T::KIND.name, id))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Type-erased handle sharing the same instance.
    pub fn to_any(&self) -> AnyEntityRef {
        self.cell.clone()
    }

    /// Recovers a typed handle from an erased one of the same instance.
    pub fn from_any(any: &AnyEntityRef) -> Option<Self> {
        any.clone()
            .into_any_arc()
            .downcast::<EntityCell<T>>()
            .ok()
            .map(|cell| Self { cell })
    }

    /// Number of strong handles currently sharing this instance.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }
}

impl<T: Entity> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Entity> From<T> for EntityRef<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Entity + Debug> Debug for EntityRef<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EntityRef").field(&*self.read()).finish()
    }
}

/// Converts a stored value into an optional text field.
pub fn text_value(field: &'static str, value: Value) -> Result<Option<String>, FieldError> {
    match value {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        _ => Err(FieldError::TypeMismatch {
            field,
            expected: "text",
        }),
    }
}

/// Converts a stored value into an optional integer field.
pub fn integer_value(field: &'static str, value: Value) -> Result<Option<i64>, FieldError> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(number) => Ok(Some(number)),
        _ => Err(FieldError::TypeMismatch {
            field,
            expected: "integer",
        }),
    }
}

/// Converts a stored value into an optional real field. Integers widen.
pub fn real_value(field: &'static str, value: Value) -> Result<Option<f64>, FieldError> {
    match value {
        Value::Null => Ok(None),
        Value::Real(number) => Ok(Some(number)),
        Value::Integer(number) => Ok(Some(number as f64)),
        _ => Err(FieldError::TypeMismatch {
            field,
            expected: "real",
        }),
    }
}

/// Wraps an optional string as a stored value.
pub fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// Wraps an optional integer as a stored value.
pub fn optional_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}
