//! SQLite-backed counter store
//!
//! Stores one row per plugin in `installs` and one row per applied bulk import in
//! `imports`. Increments are a single `UPSERT ... RETURNING` statement so they are atomic
//! with respect to other writers; bulk imports run inside a transaction keyed by the
//! import name.

use super::{CounterStore, ImportOutcome, InstallEntry};
use crate::error::CounterError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SqliteCounterStore {
    db: Arc<Mutex<Connection>>,
}

/// Create the counter tables if they do not exist yet.
pub fn initialize_schema(conn: &Connection) -> Result<(), CounterError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS installs (
            plugin TEXT PRIMARY KEY,
            installs INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS imports (
            name TEXT PRIMARY KEY,
            installs TEXT NOT NULL,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

impl SqliteCounterStore {
    pub fn open(path: &Path) -> Result<Self, CounterError> {
        let conn = Connection::open(path)
            .map_err(|e| CounterError::Unavailable(format!("{}: {}", path.display(), e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, CounterError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CounterError> {
        initialize_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

fn to_count(plugin: &str, raw: i64) -> Result<u64, CounterError> {
    u64::try_from(raw).map_err(|_| CounterError::CorruptValue {
        key: plugin.to_string(),
        value: raw.to_string(),
    })
}

/// Counts are stored as SQLite integers, so anything above `i64::MAX` is rejected.
fn to_sql(plugin: &str, installs: u64) -> Result<i64, CounterError> {
    i64::try_from(installs).map_err(|_| CounterError::Overflow(plugin.to_string()))
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn get(&self, plugin: &str) -> Result<u64, CounterError> {
        let db = self.db.lock().await;
        let raw: Option<i64> = db
            .query_row(
                "SELECT installs FROM installs WHERE plugin = ?1",
                [plugin],
                |row| row.get(0),
            )
            .optional()?;
        raw.map_or(Ok(0), |raw| to_count(plugin, raw))
    }

    async fn set(&self, plugin: &str, installs: u64) -> Result<(), CounterError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO installs (plugin, installs) VALUES (?1, ?2)
             ON CONFLICT(plugin) DO UPDATE SET installs = excluded.installs",
            params![plugin, to_sql(plugin, installs)?],
        )?;
        Ok(())
    }

    async fn increment(&self, plugin: &str) -> Result<u64, CounterError> {
        let db = self.db.lock().await;
        let raw: Option<i64> = db
            .query_row(
                "INSERT INTO installs (plugin, installs) VALUES (?1, 1)
                 ON CONFLICT(plugin) DO UPDATE SET installs = installs + 1
                 WHERE installs < 9223372036854775807
                 RETURNING installs",
                [plugin],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => to_count(plugin, raw),
            None => Err(CounterError::Overflow(plugin.to_string())),
        }
    }

    async fn list_installs(&self) -> Result<Vec<InstallEntry>, CounterError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT plugin, installs FROM installs ORDER BY plugin")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(plugin, raw)| {
                let installs = to_count(&plugin, raw)?;
                Ok(InstallEntry { plugin, installs })
            })
            .collect()
    }

    async fn bulk_import(
        &self,
        import_name: &str,
        entries: Vec<InstallEntry>,
    ) -> Result<ImportOutcome, CounterError> {
        let payload = serde_json::to_string(&entries)
            .map_err(|e| CounterError::Database(format!("Failed to encode import: {}", e)))?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM imports WHERE name = ?1",
                [import_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            tracing::warn!(import = import_name, "Rejected duplicate install import");
            return Ok(ImportOutcome::Duplicate {
                name: import_name.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO imports (name, installs, imported_at) VALUES (?1, ?2, ?3)",
            params![import_name, payload, Utc::now().to_rfc3339()],
        )?;
        let outcome = ImportOutcome::applied(import_name, &entries)?;
        for entry in &entries {
            let current: Option<i64> = tx
                .query_row(
                    "SELECT installs FROM installs WHERE plugin = ?1",
                    [&entry.plugin],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current.map_or(Ok(0), |raw| to_count(&entry.plugin, raw))?;
            let next = current
                .checked_add(entry.installs)
                .ok_or_else(|| CounterError::Overflow(entry.plugin.clone()))?;
            tx.execute(
                "INSERT INTO installs (plugin, installs) VALUES (?1, ?2)
                 ON CONFLICT(plugin) DO UPDATE SET installs = excluded.installs",
                params![entry.plugin, to_sql(&entry.plugin, next)?],
            )?;
        }
        tx.commit()?;

        tracing::info!(
            import = import_name,
            entries = entries.len(),
            "Applied install import"
        );
        Ok(outcome)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
