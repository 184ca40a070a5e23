//! SQLite-backed local mirror of the CRM collections.
//!
//! The database lives at `~/.p3metrics/records.db` unless configured
//! otherwise. Every record is stored verbatim as a JSON document keyed by
//! `(collection, id)`; filters are evaluated with SQLite's JSON functions.
//! Rows come back in insertion order, which stands in for the remote
//! store's natural ordering.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;

use super::{format_timestamp, validate_field, Collection, Filter, RecordStore, StoreError};

pub struct SqliteStore {
    /// rusqlite::Connection is not Sync; queries are short and never span an await.
    conn: Mutex<Connection>,
}

/// Outcome of loading an export into the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `~/.p3metrics/records.db`.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Self::default_path()?)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(StoreError::Migration)?;

        log::debug!("Opened record store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolve the default database path: `~/.p3metrics/records.db`.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".p3metrics").join("records.db"))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&guard)
    }

    /// Insert or replace records. Rows without a string ID are skipped.
    /// Re-importing a record keeps its original position in the ordering.
    pub fn upsert(&self, collection: Collection, rows: &[Value]) -> Result<ImportSummary, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut summary = ImportSummary {
                imported: 0,
                skipped: 0,
            };
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO records (collection, id, body) VALUES (?1, ?2, ?3)
                     ON CONFLICT(collection, id) DO UPDATE
                     SET body = excluded.body, synced_at = datetime('now')",
                )?;
                for row in rows {
                    let id = row
                        .get(collection.id_field())
                        .and_then(Value::as_str)
                        .filter(|id| !id.is_empty());
                    let Some(id) = id else {
                        summary.skipped += 1;
                        continue;
                    };
                    let body = serde_json::to_string(row)?;
                    stmt.execute(params![collection.table(), id, body])?;
                    summary.imported += 1;
                }
            }
            tx.commit()?;
            Ok(summary)
        })
    }

    /// Load a JSON array export file into `collection` and record the run.
    pub fn import_file(&self, collection: Collection, path: &Path) -> Result<ImportSummary, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let rows: Vec<Value> = serde_json::from_str(&content)?;
        let summary = self.upsert(collection, &rows)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO import_runs (collection, source, row_count, skipped_count)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    collection.table(),
                    path.display().to_string(),
                    summary.imported as i64,
                    summary.skipped as i64
                ],
            )?;
            Ok(())
        })?;
        log::info!(
            "Imported {} {} records from {} ({} skipped)",
            summary.imported,
            collection.table(),
            path.display(),
            summary.skipped
        );
        Ok(summary)
    }

    /// Number of stored records in a collection.
    pub fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                params![collection.table()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    fn query_bodies(
        &self,
        collection: Collection,
        condition: &str,
        mut args: Vec<SqlValue>,
    ) -> Result<Vec<Value>, StoreError> {
        let sql = format!(
            "SELECT body FROM records WHERE collection = ? AND ({condition}) ORDER BY rowid"
        );
        args.insert(0, SqlValue::Text(collection.table().to_string()));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for body in rows {
                out.push(serde_json::from_str(&body?)?);
            }
            Ok(out)
        })
    }
}

fn json_field(field: &str) -> String {
    format!("json_extract(body, '$.{field}')")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn text_args(values: &[String]) -> impl Iterator<Item = SqlValue> + '_ {
    values.iter().map(|v| SqlValue::Text(v.clone()))
}

/// Compile a filter into a SQL condition plus positional arguments.
/// Field names must already be validated.
fn compile(filter: &Filter, args: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::Eq { field, value } => {
            args.push(SqlValue::Text(value.clone()));
            format!("{} = ?", json_field(field))
        }
        Filter::In { field, values } => {
            if values.is_empty() {
                return "0".to_string();
            }
            args.extend(text_args(values));
            format!("{} IN ({})", json_field(field), placeholders(values.len()))
        }
        Filter::Since { field, at } => {
            args.push(SqlValue::Text(format_timestamp(at)));
            format!("julianday({}) >= julianday(?)", json_field(field))
        }
        Filter::Before { field, at } => {
            args.push(SqlValue::Text(format_timestamp(at)));
            format!("julianday({}) < julianday(?)", json_field(field))
        }
        Filter::Contains { field, needle } => {
            args.push(SqlValue::Text(format!("%{}%", needle.to_lowercase())));
            format!("lower({}) LIKE ?", json_field(field))
        }
        Filter::And(parts) => join(parts, " AND ", "1", args),
        Filter::Or(parts) => join(parts, " OR ", "0", args),
    }
}

fn join(parts: &[Filter], sep: &str, empty: &str, args: &mut Vec<SqlValue>) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let compiled: Vec<String> = parts
        .iter()
        .map(|p| format!("({})", compile(p, args)))
        .collect();
    compiled.join(sep)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn fetch_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let condition = format!("id IN ({})", placeholders(ids.len()));
        self.query_bodies(collection, &condition, text_args(ids).collect())
    }

    async fn fetch_by_filter(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        filter.validate()?;
        let mut args = Vec::new();
        let condition = compile(filter, &mut args);
        self.query_bodies(collection, &condition, args)
    }

    async fn fetch_by_overlap(
        &self,
        collection: Collection,
        array_field: &str,
        ids: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        validate_field(array_field)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let condition = format!(
            "EXISTS (SELECT 1 FROM json_each(body, '$.{array_field}') je WHERE je.value IN ({}))",
            placeholders(ids.len())
        );
        self.query_bodies(collection, &condition, text_args(ids).collect())
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;

    /// Open a migrated store in a fresh temp directory.
    pub fn test_store() -> SqliteStore {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("records.db");
        std::mem::forget(dir);
        SqliteStore::open_at(path).expect("Failed to open test store")
    }

    /// Open a store pre-seeded with the given rows per collection.
    pub fn seeded_store(seed: &[(Collection, Value)]) -> SqliteStore {
        let store = test_store();
        for (collection, row) in seed {
            store
                .upsert(*collection, std::slice::from_ref(row))
                .expect("seed row");
        }
        store
    }
}
