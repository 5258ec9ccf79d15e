//! SQLite-backed storage engine and session.
//!
//! # Responsibility
//! - Open one configured connection per session against a file or a named
//!   shared-cache memory database.
//! - Execute entity row operations built from `EntityKind` descriptors.
//! - Report row changes to the installed `RowListener`.
//!
//! # Invariants
//! - Row operations require an open transaction on the session.
//! - Row callbacks fire right after the statement that changed or loaded the
//!   row, inside the open transaction and outside the session lock.
//! - The identity column of every table is `id INTEGER PRIMARY KEY`.

use super::{RowListener, SqliteConfig, StorageEngine, StorageError, StorageResult, StorageSession};
use crate::db::{configure_connection, open_db, open_db_uri, uri_flags, Migration};
use crate::event::pending::PendingEventLog;
use crate::model::entity::{AnyEntityRef, Entity, EntityId, EntityKind, EntityRef, IdentityKey};
use log::warn;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Row filter for `list` and `count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// Every row.
    All,
    /// Rows without an archive date. Same as `All` for non-archivable kinds.
    Active,
    /// Rows with an archive date. Always empty for non-archivable kinds.
    Archived,
}

#[derive(Debug)]
enum Location {
    File(PathBuf),
    SharedMemory(String),
}

/// SQLite storage engine.
pub struct SqliteEngine {
    location: Location,
    config: SqliteConfig,
    listener: OnceCell<Arc<dyn RowListener>>,
    // Keeps a shared-cache memory database alive between sessions.
    _anchor: Option<Mutex<Connection>>,
}

impl SqliteEngine {
    /// Opens (or creates) a database file and applies `migrations`.
    pub fn open(
        path: impl AsRef<Path>,
        migrations: &[Migration],
        config: SqliteConfig,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let bootstrap = open_db(&path, migrations, &config)?;
        drop(bootstrap);
        Ok(Self {
            location: Location::File(path),
            config,
            listener: OnceCell::new(),
            _anchor: None,
        })
    }

    /// Creates a fresh named in-memory database shared by this engine's
    /// sessions and applies `migrations`.
    pub fn open_in_memory(migrations: &[Migration], config: SqliteConfig) -> StorageResult<Self> {
        let uri = format!(
            "file:unitwork-{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        let anchor = open_db_uri(&uri, migrations, &config)?;
        Ok(Self {
            location: Location::SharedMemory(uri),
            config,
            listener: OnceCell::new(),
            _anchor: Some(Mutex::new(anchor)),
        })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Database file path, `None` for in-memory engines.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path.as_path()),
            Location::SharedMemory(_) => None,
        }
    }
}

impl StorageEngine for SqliteEngine {
    type Session = SqliteSession;

    fn open_session(&self) -> StorageResult<SqliteSession> {
        let conn = match &self.location {
            Location::File(path) => Connection::open(path)?,
            Location::SharedMemory(uri) => Connection::open_with_flags(uri, uri_flags())?,
        };
        configure_connection(&conn, &self.config)?;
        Ok(SqliteSession::new(conn, self.listener.get().cloned()))
    }

    fn install_row_listener(&self, listener: Arc<dyn RowListener>) -> StorageResult<()> {
        self.listener
            .set(listener)
            .map_err(|_| StorageError::ListenerAlreadyInstalled)
    }
}

#[derive(Debug, Clone, Copy)]
enum RowOp {
    Insert,
    Update,
    Delete,
}

struct SessionInner {
    conn: Option<Connection>,
    active: bool,
}

/// One SQLite connection plus the pending state of its transaction.
pub struct SqliteSession {
    inner: Mutex<SessionInner>,
    events: PendingEventLog,
    listener: Option<Arc<dyn RowListener>>,
}

impl SqliteSession {
    fn new(conn: Connection, listener: Option<Arc<dyn RowListener>>) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                conn: Some(conn),
                active: false,
            }),
            events: PendingEventLog::new(),
            listener,
        }
    }

    /// Inserts `entity` and assigns its id.
    ///
    /// An entity that already carries an id is inserted under that id.
    pub fn insert<T: Entity>(&self, entity: &EntityRef<T>) -> StorageResult<EntityId> {
        let kind = T::KIND;
        let (existing_id, fields) = {
            let guard = entity.read();
            (guard.id(), guard.fields())
        };

        let mut columns: Vec<&str> = Vec::with_capacity(fields.len() + 1);
        let mut values: Vec<Value> = Vec::with_capacity(fields.len() + 1);
        if let Some(id) = existing_id {
            columns.push("id");
            values.push(Value::Integer(id));
        }
        for (column, value) in fields {
            columns.push(column);
            values.push(value);
        }
        let sql = insert_sql(kind.table, &columns);

        let id = self.with_open_transaction(|conn| {
            conn.execute(&sql, params_from_iter(values.iter()))?;
            Ok(conn.last_insert_rowid())
        })?;
        entity.write().set_id(id);
        self.report_change(RowOp::Insert, IdentityKey::new(kind.name, id), &entity.to_any());
        Ok(id)
    }

    /// Writes every persisted field of `entity` to its row.
    pub fn update<T: Entity>(&self, entity: &EntityRef<T>) -> StorageResult<()> {
        let kind = T::KIND;
        let (id, fields) = {
            let guard = entity.read();
            let id = guard.id().ok_or(StorageError::NotPersisted { kind: kind.name })?;
            (id, guard.fields())
        };

        let columns: Vec<&str> = fields.iter().map(|(column, _)| *column).collect();
        let mut values: Vec<Value> = fields.into_iter().map(|(_, value)| value).collect();
        values.push(Value::Integer(id));

        self.with_open_transaction(|conn| {
            let affected = if columns.is_empty() {
                row_exists(conn, kind.table, id)? as usize
            } else {
                conn.execute(
                    &update_sql(kind.table, &columns),
                    params_from_iter(values.iter()),
                )?
            };
            if affected == 0 {
                return Err(StorageError::NotFound {
                    kind: kind.name,
                    id,
                });
            }
            Ok(())
        })?;
        self.report_change(RowOp::Update, IdentityKey::new(kind.name, id), &entity.to_any());
        Ok(())
    }

    /// Deletes the row backing `entity`.
    pub fn delete<T: Entity>(&self, entity: &EntityRef<T>) -> StorageResult<()> {
        let kind = T::KIND;
        let id = entity
            .id()
            .ok_or(StorageError::NotPersisted { kind: kind.name })?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", quote_ident(kind.table));

        self.with_open_transaction(|conn| {
            if conn.execute(&sql, [id])? == 0 {
                return Err(StorageError::NotFound {
                    kind: kind.name,
                    id,
                });
            }
            Ok(())
        })?;
        self.report_change(RowOp::Delete, IdentityKey::new(kind.name, id), &entity.to_any());
        Ok(())
    }

    /// Loads a fresh instance of row `id`, or `None` when it does not exist.
    pub fn get<T: Entity>(&self, id: EntityId) -> StorageResult<Option<EntityRef<T>>> {
        let kind = T::KIND;
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            select_columns(&kind),
            quote_ident(kind.table)
        );
        let width = kind.columns.len() + 1;

        let loaded = self.with_open_transaction(|conn| {
            let values = conn
                .query_row(&sql, [id], |row| read_values(row, width))
                .optional()?;
            values.map(build_entity::<T>).transpose()
        })?;

        if let Some(entity) = &loaded {
            self.report_load(entity);
        }
        Ok(loaded)
    }

    /// Loads fresh instances of every row in `scope`, ordered by id.
    pub fn list<T: Entity>(&self, scope: ListScope) -> StorageResult<Vec<EntityRef<T>>> {
        let kind = T::KIND;
        let Some(filter) = scope_filter(&kind, scope) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY id",
            select_columns(&kind),
            quote_ident(kind.table),
            filter
        );
        let width = kind.columns.len() + 1;

        let loaded = self.with_open_transaction(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| read_values(row, width))?;
            let mut entities = Vec::new();
            for values in rows {
                entities.push(build_entity::<T>(values?)?);
            }
            Ok(entities)
        })?;

        for entity in &loaded {
            self.report_load(entity);
        }
        Ok(loaded)
    }

    /// Counts rows in `scope`.
    pub fn count<T: Entity>(&self, scope: ListScope) -> StorageResult<u64> {
        let kind = T::KIND;
        let Some(filter) = scope_filter(&kind, scope) else {
            return Ok(0);
        };
        let sql = format!("SELECT COUNT(*) FROM {}{}", quote_ident(kind.table), filter);

        self.with_open_transaction(|conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    /// Runs raw SQL access inside the open transaction.
    ///
    /// Changes made here bypass row callbacks and produce no notifications.
    pub fn with_connection<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R>,
    {
        self.with_open_transaction(|conn| Ok(f(conn)?))
    }

    fn with_open_transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&Connection) -> StorageResult<R>,
    {
        let guard = self.inner.lock();
        let conn = guard.conn.as_ref().ok_or(StorageError::SessionClosed)?;
        if !guard.active {
            return Err(StorageError::TransactionNotActive);
        }
        f(conn)
    }

    fn report_load<T: Entity>(&self, entity: &EntityRef<T>) {
        let (Some(listener), Some(key)) = (&self.listener, entity.identity_key()) else {
            return;
        };
        listener.after_load(&self.events, key, &entity.to_any());
    }

    fn report_change(&self, op: RowOp, key: IdentityKey, entity: &AnyEntityRef) {
        let Some(listener) = &self.listener else {
            return;
        };
        match op {
            RowOp::Insert => listener.after_insert(&self.events, key, entity),
            RowOp::Update => listener.after_update(&self.events, key, entity),
            RowOp::Delete => listener.after_delete(&self.events, key, entity),
        }
    }
}

impl StorageSession for SqliteSession {
    fn begin(&self) -> StorageResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or(StorageError::SessionClosed)?;
        if inner.active {
            return Err(StorageError::TransactionAlreadyActive);
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        inner.active = true;
        Ok(())
    }

    fn commit(&self) -> StorageResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or(StorageError::SessionClosed)?;
        if !inner.active {
            return Err(StorageError::TransactionNotActive);
        }
        conn.execute_batch("COMMIT")?;
        inner.active = false;
        Ok(())
    }

    fn rollback(&self) -> StorageResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let conn = inner.conn.as_ref().ok_or(StorageError::SessionClosed)?;
        if !inner.active {
            return Err(StorageError::TransactionNotActive);
        }
        inner.active = false;
        // A failed COMMIT may already have ended the transaction.
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        let conn = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.active {
                inner.active = false;
                if let Some(conn) = inner.conn.as_ref() {
                    if !conn.is_autocommit() {
                        if let Err(err) = conn.execute_batch("ROLLBACK") {
                            warn!(
                                "event=session_close module=store status=error error_code=rollback_failed error={}",
                                err
                            );
                        }
                    }
                }
            }
            inner.conn.take()
        };

        match conn {
            Some(conn) => conn.close().map_err(|(_, err)| StorageError::Sqlite(err)),
            None => Ok(()),
        }
    }

    fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    fn pending_events(&self) -> &PendingEventLog {
        &self.events
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn select_columns(kind: &EntityKind) -> String {
    std::iter::once("id")
        .chain(kind.columns.iter().copied())
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
    }
    let names = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names,
        placeholders
    )
}

fn update_sql(table: &str, columns: &[&str]) -> String {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{} = ?{}", quote_ident(column), index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        quote_ident(table),
        assignments,
        columns.len() + 1
    )
}

/// `None` when the scope can never match rows of `kind`.
fn scope_filter(kind: &EntityKind, scope: ListScope) -> Option<String> {
    match (scope, kind.archived_column) {
        (ListScope::All, _) | (ListScope::Active, None) => Some(String::new()),
        (ListScope::Active, Some(column)) => Some(format!(" WHERE {} IS NULL", quote_ident(column))),
        (ListScope::Archived, Some(column)) => {
            Some(format!(" WHERE {} IS NOT NULL", quote_ident(column)))
        }
        (ListScope::Archived, None) => None,
    }
}

fn row_exists(conn: &Connection, table: &str, id: EntityId) -> rusqlite::Result<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", quote_ident(table));
    conn.query_row(&sql, [id], |row| row.get(0))
}

fn read_values(row: &Row<'_>, width: usize) -> rusqlite::Result<Vec<Value>> {
    (0..width).map(|index| row.get::<_, Value>(index)).collect()
}

fn build_entity<T: Entity>(values: Vec<Value>) -> StorageResult<EntityRef<T>> {
    let kind = T::KIND;
    let mut values = values.into_iter();
    let id = match values.next() {
        Some(Value::Integer(id)) => id,
        _ => {
            return Err(StorageError::Backend(format!(
                "{} row without integer id",
                kind.name
            )))
        }
    };

    let mut entity = T::default();
    entity.set_id(id);
    for (column, value) in kind.columns.iter().zip(values) {
        entity.set_field(column, value)?;
    }
    Ok(EntityRef::new(entity))
}

#[cfg(test)]
mod tests {
    use super::{insert_sql, scope_filter, update_sql, ListScope, SqliteEngine};
    use crate::db::Migration;
    use crate::event::pending::PendingEventLog;
    use crate::model::entity::{AnyEntityRef, Entity, EntityRef, IdentityKey};
    use crate::model::fixtures::Note;
    use crate::store::{RowListener, SqliteConfig, StorageEngine, StorageError, StorageSession};
    use parking_lot::Mutex;
    use std::sync::Arc;

    const SCHEMA: &[Migration] = &[Migration::new(
        1,
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, title TEXT);",
    )];

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(&'static str, IdentityKey)>>,
    }

    impl RowListener for Recorder {
        fn after_insert(&self, _: &PendingEventLog, key: IdentityKey, _: &AnyEntityRef) {
            self.calls.lock().push(("insert", key));
        }

        fn after_update(&self, _: &PendingEventLog, key: IdentityKey, _: &AnyEntityRef) {
            self.calls.lock().push(("update", key));
        }

        fn after_delete(&self, _: &PendingEventLog, key: IdentityKey, _: &AnyEntityRef) {
            self.calls.lock().push(("delete", key));
        }

        fn after_load(&self, _: &PendingEventLog, key: IdentityKey, _: &AnyEntityRef) {
            self.calls.lock().push(("load", key));
        }
    }

    fn engine_with_recorder() -> (SqliteEngine, Arc<Recorder>) {
        let engine =
            SqliteEngine::open_in_memory(SCHEMA, SqliteConfig::default()).expect("open engine");
        let recorder = Arc::new(Recorder::default());
        engine
            .install_row_listener(recorder.clone())
            .expect("install listener");
        (engine, recorder)
    }

    #[test]
    fn sql_builders_quote_identifiers() {
        assert_eq!(
            insert_sql("notes", &["body", "title"]),
            "INSERT INTO \"notes\" (\"body\", \"title\") VALUES (?1, ?2)"
        );
        assert_eq!(insert_sql("notes", &[]), "INSERT INTO \"notes\" DEFAULT VALUES");
        assert_eq!(
            update_sql("notes", &["body"]),
            "UPDATE \"notes\" SET \"body\" = ?1 WHERE id = ?2"
        );
        assert_eq!(scope_filter(&Note::KIND, ListScope::Archived), None);
        assert_eq!(
            scope_filter(&Note::KIND, ListScope::Active),
            Some(String::new())
        );
    }

    #[test]
    fn second_listener_is_rejected() {
        let (engine, _) = engine_with_recorder();
        let err = engine
            .install_row_listener(Arc::new(Recorder::default()))
            .expect_err("only one listener");
        assert!(matches!(err, StorageError::ListenerAlreadyInstalled));
    }

    #[test]
    fn mutation_callbacks_fire_per_statement() {
        let (engine, recorder) = engine_with_recorder();
        let session = engine.open_session().expect("open session");
        session.begin().expect("begin");

        let note = EntityRef::new(Note {
            body: Some("draft".to_string()),
            ..Note::default()
        });
        let id = session.insert(&note).expect("insert");
        assert_eq!(note.id(), Some(id));
        let key = IdentityKey::new("Note", id);
        assert_eq!(*recorder.calls.lock(), vec![("insert", key)]);

        note.write().body = Some("final".to_string());
        session.update(&note).expect("update");
        assert_eq!(*recorder.calls.lock(), vec![("insert", key), ("update", key)]);

        session.delete(&note).expect("delete");
        session.commit().expect("commit");
        assert_eq!(
            *recorder.calls.lock(),
            vec![("insert", key), ("update", key), ("delete", key)]
        );
        session.close().expect("close");
    }

    #[test]
    fn rollback_discards_rows_after_callbacks_fired() {
        let (engine, recorder) = engine_with_recorder();
        let session = engine.open_session().expect("open session");
        session.begin().expect("begin");
        let note = EntityRef::new(Note::default());
        session.insert(&note).expect("insert");
        assert_eq!(recorder.calls.lock().len(), 1);
        session.rollback().expect("rollback");
        assert_eq!(recorder.calls.lock().len(), 1);

        session.begin().expect("begin again");
        assert_eq!(session.count::<Note>(ListScope::All).expect("count"), 0);
        session.commit().expect("commit");
    }

    #[test]
    fn loads_report_immediately_and_build_fresh_instances() {
        let (engine, recorder) = engine_with_recorder();
        let session = engine.open_session().expect("open session");
        session.begin().expect("begin");
        let note = EntityRef::new(Note::default());
        note.write().body = Some("x".to_string());
        let id = session.insert(&note).expect("insert");

        let loaded = session
            .get::<Note>(id)
            .expect("get")
            .expect("row exists");
        assert!(!loaded.ptr_eq(&note));
        assert_eq!(loaded.read().body.as_deref(), Some("x"));
        let key = IdentityKey::new("Note", id);
        assert_eq!(*recorder.calls.lock(), vec![("insert", key), ("load", key)]);
        assert!(session.get::<Note>(id + 100).expect("get missing").is_none());
        session.commit().expect("commit");
    }

    #[test]
    fn row_operations_need_an_open_transaction() {
        let (engine, _) = engine_with_recorder();
        let session = engine.open_session().expect("open session");
        let err = session
            .insert(&EntityRef::new(Note::default()))
            .expect_err("no transaction");
        assert!(matches!(err, StorageError::TransactionNotActive));
        assert!(matches!(
            session.commit().expect_err("nothing to commit"),
            StorageError::TransactionNotActive
        ));
    }

    #[test]
    fn update_and_delete_report_missing_rows() {
        let (engine, _) = engine_with_recorder();
        let session = engine.open_session().expect("open session");
        session.begin().expect("begin");

        let unsaved = EntityRef::new(Note::default());
        assert!(matches!(
            session.update(&unsaved).expect_err("no id"),
            StorageError::NotPersisted { kind: "Note" }
        ));
        let ghost = EntityRef::new(Note::with_id(404, None));
        assert!(matches!(
            session.delete(&ghost).expect_err("no row"),
            StorageError::NotFound { kind: "Note", id: 404 }
        ));
        session.rollback().expect("rollback");
    }

    #[test]
    fn closed_session_rejects_work() {
        let (engine, _) = engine_with_recorder();
        let session = engine.open_session().expect("open session");
        session.begin().expect("begin");
        session.close().expect("close rolls back");
        assert!(!session.is_active());
        assert!(matches!(
            session.begin().expect_err("closed"),
            StorageError::SessionClosed
        ));
        session.close().expect("second close is a no-op");
    }

    #[test]
    fn sessions_of_one_engine_share_the_memory_database() {
        let (engine, _) = engine_with_recorder();
        let writer = engine.open_session().expect("writer");
        writer.begin().expect("begin");
        writer
            .insert(&EntityRef::new(Note::default()))
            .expect("insert");
        writer.commit().expect("commit");
        writer.close().expect("close");

        let reader = engine.open_session().expect("reader");
        reader.begin().expect("begin");
        assert_eq!(reader.count::<Note>(ListScope::Active).expect("count"), 1);
        reader.commit().expect("commit");
    }
}
