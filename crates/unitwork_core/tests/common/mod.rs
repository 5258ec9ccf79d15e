#![allow(dead_code)]

use parking_lot::Mutex;
use rusqlite::types::Value;
use std::path::Path;
use std::sync::Arc;
use unitwork_core::model::entity::{
    integer_value, optional_integer, optional_text, same_instance, text_value,
};
use unitwork_core::{
    AnyEntityRef, Archivable, ChangeKind, Coordinator, Entity, EntityId, EntityKind, EntityRef,
    FieldError, GroupedNotification, Migration, Observer, SqliteConfig, SqliteEngine,
};

pub const MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        "CREATE TABLE tasks (
            id INTEGER PRIMARY KEY,
            name TEXT,
            creation_date INTEGER,
            modification_date INTEGER,
            archived_date INTEGER
        );
        CREATE TABLE projects (
            id INTEGER PRIMARY KEY,
            name TEXT
        );",
    ),
    Migration::new(
        2,
        "CREATE TABLE assignments (
            id INTEGER PRIMARY KEY,
            project_id INTEGER REFERENCES projects(id) DEFERRABLE INITIALLY DEFERRED
        );",
    ),
];

/// Archivable record with one transient field.
#[derive(Debug, Default, Clone)]
pub struct Task {
    pub id: Option<EntityId>,
    pub name: Option<String>,
    pub creation_date: Option<i64>,
    pub modification_date: Option<i64>,
    pub archived_date: Option<i64>,
    /// UI-only state, never persisted.
    pub selected: bool,
}

impl Task {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind {
        name: "Task",
        table: "tasks",
        columns: &["name", "creation_date", "modification_date", "archived_date"],
        supertypes: &["ManagedObject", "ArchivableObject"],
        archived_column: Some("archived_date"),
    };

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", optional_text(self.name.as_deref())),
            ("creation_date", optional_integer(self.creation_date)),
            ("modification_date", optional_integer(self.modification_date)),
            ("archived_date", optional_integer(self.archived_date)),
        ]
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "name" => self.name = text_value("name", value)?,
            "creation_date" => self.creation_date = integer_value("creation_date", value)?,
            "modification_date" => {
                self.modification_date = integer_value("modification_date", value)?
            }
            "archived_date" => self.archived_date = integer_value("archived_date", value)?,
            other => {
                return Err(FieldError::UnknownField {
                    kind: Self::KIND.name,
                    field: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn set_creation_date(&mut self, epoch_ms: i64) {
        self.creation_date = Some(epoch_ms);
    }

    fn set_modification_date(&mut self, epoch_ms: i64) {
        self.modification_date = Some(epoch_ms);
    }

    fn archived_date(&self) -> Option<i64> {
        self.archived_date
    }
}

impl Archivable for Task {
    fn set_archived_date(&mut self, epoch_ms: Option<i64>) {
        self.archived_date = epoch_ms;
    }
}

/// Plain record sharing the `ManagedObject` supertype with `Task`.
#[derive(Debug, Default, Clone)]
pub struct Project {
    pub id: Option<EntityId>,
    pub name: Option<String>,
}

impl Project {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: Some(name.to_string()),
        }
    }
}

impl Entity for Project {
    const KIND: EntityKind = EntityKind {
        name: "Project",
        table: "projects",
        columns: &["name"],
        supertypes: &["ManagedObject"],
        archived_column: None,
    };

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn fields(&self) -> Vec<(&'static str, Value)> {
        vec![("name", optional_text(self.name.as_deref()))]
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "name" => self.name = text_value("name", value)?,
            other => {
                return Err(FieldError::UnknownField {
                    kind: Self::KIND.name,
                    field: other.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// Row with a deferred foreign key, checked only at commit.
#[derive(Debug, Default, Clone)]
pub struct Assignment {
    pub id: Option<EntityId>,
    pub project_id: Option<EntityId>,
}

impl Entity for Assignment {
    const KIND: EntityKind = EntityKind {
        name: "Assignment",
        table: "assignments",
        columns: &["project_id"],
        supertypes: &[],
        archived_column: None,
    };

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn fields(&self) -> Vec<(&'static str, Value)> {
        vec![("project_id", optional_integer(self.project_id))]
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "project_id" => self.project_id = integer_value("project_id", value)?,
            other => {
                return Err(FieldError::UnknownField {
                    kind: Self::KIND.name,
                    field: other.to_string(),
                })
            }
        }
        Ok(())
    }
}

pub fn memory_coordinator() -> Coordinator<SqliteEngine> {
    let engine = SqliteEngine::open_in_memory(MIGRATIONS, SqliteConfig::default()).unwrap();
    Coordinator::new(engine).unwrap()
}

pub fn file_coordinator(path: &Path, config: SqliteConfig) -> Coordinator<SqliteEngine> {
    let engine = SqliteEngine::open(path, MIGRATIONS, config).unwrap();
    Coordinator::new(engine).unwrap()
}

/// One delivered notification as an observer saw it.
pub struct Seen {
    pub change: ChangeKind,
    pub kind: &'static str,
    pub entities: Vec<AnyEntityRef>,
}

impl Seen {
    pub fn holds<T: Entity>(&self, expected: &EntityRef<T>) -> bool {
        let expected = expected.to_any();
        self.entities
            .iter()
            .any(|entity| same_instance(entity, &expected))
    }
}

pub type SeenLog = Arc<Mutex<Vec<Seen>>>;

/// Observer that records every notification it receives.
pub fn recorder() -> (Arc<dyn Observer>, SeenLog) {
    let log: SeenLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let observer: Arc<dyn Observer> = Arc::new(move |group: &GroupedNotification| {
        sink.lock().push(Seen {
            change: group.change(),
            kind: group.kind().name,
            entities: group.entities().to_vec(),
        });
    });
    (observer, log)
}
