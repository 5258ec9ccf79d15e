//! In-crate test entity shared by unit tests.

use super::entity::{optional_text, text_value, Entity, EntityId, EntityKind, FieldError};
use rusqlite::types::Value;

#[derive(Debug, Default)]
pub(crate) struct Note {
    pub(crate) id: Option<EntityId>,
    pub(crate) body: Option<String>,
    pub(crate) title: Option<String>,
    /// Not persisted; reconciliation must leave it alone.
    pub(crate) cursor: usize,
    pub(crate) body_writes: usize,
}

impl Note {
    pub(crate) fn with_id(id: EntityId, body: Option<&str>) -> Self {
        Self {
            id: Some(id),
            body: body.map(str::to_string),
            ..Self::default()
        }
    }
}

impl Entity for Note {
    const KIND: EntityKind = EntityKind {
        name: "Note",
        table: "notes",
        columns: &["body", "title"],
        supertypes: &["Document"],
        archived_column: None,
    };

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("body", optional_text(self.body.as_deref())),
            ("title", optional_text(self.title.as_deref())),
        ]
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "body" => {
                self.body = text_value("body", value)?;
                self.body_writes += 1;
            }
            "title" => {
                if matches!(&value, Value::Text(text) if text == "forbidden") {
                    return Err(FieldError::Rejected {
                        field: name.to_string(),
                        reason: "reserved title".to_string(),
                    });
                }
                self.title = text_value("title", value)?;
            }
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

#[derive(Debug, Default)]
pub(crate) struct Tag {
    pub(crate) id: Option<EntityId>,
    pub(crate) label: Option<String>,
}

impl Entity for Tag {
    const KIND: EntityKind = EntityKind {
        name: "Tag",
        table: "tags",
        columns: &["label"],
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
        vec![("label", optional_text(self.label.as_deref()))]
    }

    fn set_field(&mut self, name: &str, value: Value) -> Result<(), FieldError> {
        match name {
            "label" => self.label = text_value("label", value)?,
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
