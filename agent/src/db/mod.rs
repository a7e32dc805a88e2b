//! # Local Database
//!
//! Pooled access to the embedded SQLite store (`spec.md` §4.6): schema
//! migration at startup, then typed query helpers used by the
//! data-collection pipeline. Every call acquires a pooled connection,
//! uses it, and releases it; transactions are never held across an
//! `.await` — callers wrap blocking work in `spawn_blocking`.

pub mod queries;
pub mod schema;

use crate::error::{AgentError, AgentResult};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use tracing::{info, warn};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Opens (creating if needed) the local database at `path` and brings its
/// schema up to [`schema::CURRENT_SCHEMA_VERSION`].
///
/// If the stored version is above the version this build knows about,
/// the process refuses to start — a fatal condition per `spec.md` §7.
pub fn open(path: &Path) -> AgentResult<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
    });
    let pool = Pool::new(manager)
        .map_err(|e| AgentError::InternalError(format!("failed to create DB pool: {e}")))?;
    migrate(&pool)?;
    Ok(pool)
}

fn migrate(pool: &DbPool) -> AgentResult<()> {
    let mut conn = pool
        .get()
        .map_err(|e| AgentError::InternalError(format!("failed to acquire DB connection: {e}")))?;

    let version: i64 = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'SchemaVersion'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if version > schema::CURRENT_SCHEMA_VERSION {
        return Err(AgentError::InternalError(format!(
            "database schema version {version} is newer than supported {}",
            schema::CURRENT_SCHEMA_VERSION
        )));
    }

    if version == schema::CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    for (idx, step) in schema::MIGRATIONS.iter().enumerate() {
        let step_version = (idx + 1) as i64;
        if step_version <= version {
            continue;
        }
        info!(step_version, "applying schema migration");
        let tx = conn
            .transaction()
            .map_err(|e| AgentError::InternalError(format!("migration transaction: {e}")))?;
        tx.execute_batch(step)?;
        tx.execute(
            "INSERT INTO metadata (key, value) VALUES ('SchemaVersion', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [step_version.to_string()],
        )?;
        tx.commit()?;
    }

    if version == 0 {
        warn!("initialized fresh local database");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_database_reaches_current_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agentd.db");
        let pool = open(&path).unwrap();
        let conn = pool.get().unwrap();
        let version: i64 = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'SchemaVersion'",
                [],
                |row| row.get::<_, String>(0),
            )
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(version, schema::CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reopening_an_up_to_date_database_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agentd.db");
        open(&path).unwrap();
        open(&path).unwrap(); // must not error re-applying migrations
    }
}
