//! SQLite storage backend.
//!
//! Every logical table lives in one `records` table keyed by
//! `(table_name, id)`, with the record stored as JSON text. Query filters and
//! ordering go through `json_extract`.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::{StorageBackend, StorageQuery, TransactionManager, merge, with_id};
use crate::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (table_name, id)
);
";

/// SQLite-backed record store.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    in_tx: AtomicBool,
}

impl SqliteBackend {
    /// Open (creating if needed) a database file.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(Error::Database)?;
        info!(path = %path.as_ref().display(), "Opened SQLite store");
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            in_tx: AtomicBool::new(false),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        f(&conn)
    }

    fn read_row(conn: &Connection, table: &str, id: &str) -> Result<Option<Value>> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE table_name = ?1 AND id = ?2",
                params![table, id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Field names are interpolated into a JSON path, so keep them plain.
fn json_path(field: &str) -> Result<String> {
    let plain = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        Ok(format!("$.{}", field))
    } else {
        Err(Error::validation(format!("Invalid query field: {}", field)))
    }
}

/// How `json_extract` reports a JSON value, for equality comparison.
fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, table: &str, data: Value) -> Result<Value> {
        let (id, record) = with_id(data)?;
        let record = Value::Object(record);
        let text = serde_json::to_string(&record)?;

        self.with_conn(|conn| {
            let now = now_millis();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO records (table_name, id, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![table, id, text, now],
            )?;
            if inserted == 0 {
                return Err(Error::conflict(table, id));
            }
            Ok(())
        })?;
        Ok(record)
    }

    async fn read(&self, table: &str, id: &str) -> Result<Option<Value>> {
        self.with_conn(|conn| Self::read_row(conn, table, id))
    }

    async fn update(&self, table: &str, id: &str, data: Value) -> Result<Value> {
        self.with_conn(|conn| {
            let current =
                Self::read_row(conn, table, id)?.ok_or_else(|| Error::not_found(table, id))?;
            let Value::Object(mut fields) = current else {
                return Err(Error::storage(format!("Corrupt record {}:{}", table, id)));
            };
            merge(&mut fields, data)?;

            let record = Value::Object(fields);
            conn.execute(
                "UPDATE records SET data = ?3, updated_at = ?4 WHERE table_name = ?1 AND id = ?2",
                params![table, id, serde_json::to_string(&record)?, now_millis()],
            )?;
            Ok(record)
        })
    }

    async fn delete(&self, table: &str, id: &str) -> Result<Option<Value>> {
        self.with_conn(|conn| {
            let existing = Self::read_row(conn, table, id)?;
            if existing.is_some() {
                conn.execute(
                    "DELETE FROM records WHERE table_name = ?1 AND id = ?2",
                    params![table, id],
                )?;
            }
            Ok(existing)
        })
    }

    async fn query(&self, table: &str, query: &StorageQuery) -> Result<Vec<Value>> {
        let mut sql = String::from("SELECT data FROM records WHERE table_name = ?");
        let mut args: Vec<SqlValue> = vec![SqlValue::Text(table.to_string())];

        for (field, expected) in &query.filters {
            args.push(SqlValue::Text(json_path(field)?));
            if expected.is_null() {
                sql.push_str(" AND json_extract(data, ?) IS NULL");
            } else {
                sql.push_str(" AND json_extract(data, ?) = ?");
                args.push(to_sql(expected));
            }
        }

        let direction = if query.descending { "DESC" } else { "ASC" };
        match &query.order_by {
            Some(field) => {
                sql.push_str(&format!(" ORDER BY json_extract(data, ?) {0}, id {0}", direction));
                args.push(SqlValue::Text(json_path(field)?));
            }
            None => sql.push_str(&format!(" ORDER BY id {}", direction)),
        }

        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(
            query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX)),
        ));
        args.push(SqlValue::Integer(
            i64::try_from(query.offset).unwrap_or(i64::MAX),
        ));

        debug!(table, sql = %sql, "SQLite query");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })?;

            let mut records: Vec<Value> = Vec::new();
            for row in rows {
                records.push(serde_json::from_str(&row?)?);
            }
            Ok(records)
        })
    }
}

#[async_trait]
impl TransactionManager for SqliteBackend {
    async fn begin(&self) -> Result<()> {
        if self.in_tx.swap(true, Ordering::SeqCst) {
            return Err(Error::execution("A transaction is already active"));
        }
        let started = self.with_conn(|conn| Ok(conn.execute_batch("BEGIN")?));
        if started.is_err() {
            self.in_tx.store(false, Ordering::SeqCst);
        }
        started
    }

    async fn commit(&self) -> Result<()> {
        if !self.in_tx.swap(false, Ordering::SeqCst) {
            return Err(Error::execution("No active transaction to commit"));
        }
        self.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))
    }

    async fn rollback(&self) -> Result<()> {
        if !self.in_tx.swap(false, Ordering::SeqCst) {
            return Err(Error::execution("No active transaction to roll back"));
        }
        self.with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?))
    }

    async fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }
}
