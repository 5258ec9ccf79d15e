//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file, in-memory or URI SQLite connections.
//! - Configure connection pragmas from `SqliteConfig`.
//! - Trigger schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned bootstrap connections have migrations fully applied.
//! - `foreign_keys` and `busy_timeout` always reflect the supplied config.

use super::migrations::{apply_migrations, Migration};
use super::DbResult;
use crate::store::SqliteConfig;
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Instant;

/// Opens a SQLite database file and applies all pending migrations.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(
    path: impl AsRef<Path>,
    migrations: &[Migration],
    config: &SqliteConfig,
) -> DbResult<Connection> {
    open_and_bootstrap("file", || Connection::open(path), migrations, config)
}

/// Opens a private in-memory SQLite database and applies all migrations.
pub fn open_db_in_memory(migrations: &[Migration], config: &SqliteConfig) -> DbResult<Connection> {
    open_and_bootstrap("memory", Connection::open_in_memory, migrations, config)
}

/// Opens a database by SQLite URI (for example a named shared-cache memory
/// database) and applies all pending migrations.
pub fn open_db_uri(
    uri: &str,
    migrations: &[Migration],
    config: &SqliteConfig,
) -> DbResult<Connection> {
    open_and_bootstrap(
        "uri",
        || Connection::open_with_flags(uri, uri_flags()),
        migrations,
        config,
    )
}

/// Applies connection-level pragmas without touching the schema.
pub fn configure_connection(conn: &Connection, config: &SqliteConfig) -> DbResult<()> {
    let foreign_keys = if config.foreign_keys { "ON" } else { "OFF" };
    conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
    conn.busy_timeout(config.busy_timeout)?;
    Ok(())
}

pub(crate) fn uri_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

fn open_and_bootstrap<F>(
    mode: &str,
    open: F,
    migrations: &[Migration],
    config: &SqliteConfig,
) -> DbResult<Connection>
where
    F: FnOnce() -> rusqlite::Result<Connection>,
{
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={}", mode);

    let mut conn = match open() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&mut conn, migrations, config) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={}",
                mode,
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(
    conn: &mut Connection,
    migrations: &[Migration],
    config: &SqliteConfig,
) -> DbResult<()> {
    configure_connection(conn, config)?;
    apply_migrations(conn, migrations)?;
    Ok(())
}
