//! SQLite persistence layer.
//!
//! Uses WAL mode for concurrent read performance and prepared statements for
//! batch write throughput. The pipeline's own state lives in three tables
//! under a configurable name prefix (SQLite has no schemas, so `{schema}.t`
//! becomes `{schema}_t`):
//!
//! - `{schema}_status(height, hash)`: last committed block, single row
//! - `{schema}_hot_block(height, hash)`: one row per unfinalized block
//! - `{schema}_hot_change_log(block_height, idx, change)`: change records
//!
//! Handler tables follow one convention: a TEXT PRIMARY KEY column named
//! `id`. Row values are JSON values mapped onto SQLite NULL/INTEGER/REAL/TEXT
//! (booleans become integers, nested arrays/objects become JSON text).

use crate::tracker::{ChangeRecord, ChangeTracker, RowValues};
use eyre::{bail, ensure, eyre, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// One row of a handler table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub id: String,
    pub values: RowValues,
}

impl Row {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: RowValues::new(),
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(column.into(), value);
        self
    }
}

/// Quotes an SQL identifier, doubling embedded quotes. Identifiers come from
/// stored change records as well as handler code, so they must never be
/// concatenated raw. An identifier that cannot be escaped is corruption.
pub fn quote_ident(name: &str) -> Result<String> {
    ensure!(
        !name.is_empty() && !name.contains('\0'),
        "unescapable identifier {name:?}"
    );
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub(crate) fn to_sql_value(value: &serde_json::Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    Ok(match value {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Sql::Real(f)
            } else {
                // u64 beyond i64 range: keep full precision as text.
                Sql::Text(n.to_string())
            }
        }
        serde_json::Value::String(s) => Sql::Text(s.clone()),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            Sql::Text(serde_json::to_string(value)?)
        }
    })
}

fn from_sql_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            let mut hex = String::with_capacity(2 + b.len() * 2);
            hex.push_str("0x");
            for byte in b {
                hex.push_str(&format!("{byte:02x}"));
            }
            serde_json::Value::String(hex)
        }
    }
}

fn height_to_sql(height: u64) -> Result<i64> {
    i64::try_from(height).wrap_err("block height out of range")
}

/// Handle on the SQLite database. The connection is held exclusively by the
/// batch transaction while a handler runs.
pub struct Database {
    conn: RefCell<Connection>,
    schema: String,
}

fn valid_schema(schema: &str) -> bool {
    let mut chars = schema.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Database {
    /// Creates or opens the database with WAL mode and the status tables in
    /// place.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str, schema: &str) -> Result<Self> {
        ensure!(
            valid_schema(schema),
            "invalid status schema name {schema:?}"
        );
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to open SQLite database at {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .wrap_err("failed to configure SQLite pragmas")?;
        let db = Self {
            conn: RefCell::new(conn),
            schema: schema.to_string(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}_{}\"", self.schema, name)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .borrow_mut()
            .execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS {status} (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    height INTEGER NOT NULL,
                    hash TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS {hot_block} (
                    height INTEGER PRIMARY KEY,
                    hash TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS {change_log} (
                    block_height INTEGER NOT NULL,
                    idx INTEGER NOT NULL,
                    change TEXT NOT NULL,
                    PRIMARY KEY (block_height, idx)
                );
                ",
                status = self.table("status"),
                hot_block = self.table("hot_block"),
                change_log = self.table("hot_change_log"),
            ))
            .wrap_err("failed to run status migrations")?;
        Ok(())
    }

    /// Runs arbitrary DDL, for handler-owned table migrations.
    ///
    /// # Errors
    /// Returns error if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .borrow_mut()
            .execute_batch(sql)
            .wrap_err("failed to execute migration batch")?;
        Ok(())
    }

    /// Runs `operation` inside one SQLite transaction, committing on `Ok`
    /// and rolling back on `Err`.
    pub fn with_transaction<T>(
        &self,
        operation: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn
            .transaction()
            .wrap_err("failed to open store transaction")?;
        let value = operation(&tx)?;
        tx.commit().wrap_err("failed to commit store transaction")?;
        Ok(value)
    }

    /// `(height, hash)` of the last committed block, if any.
    pub fn last_committed(&self) -> Result<Option<(u64, String)>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(&format!(
            "SELECT height, hash FROM {} WHERE id = 0",
            self.table("status")
        ))?;
        let result = stmt.query_row([], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
        });
        match result {
            Ok(position) => Ok(Some(position)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).wrap_err("failed to read committed position"),
        }
    }

    /// Unfinalized committed blocks, highest first.
    pub fn hot_blocks_desc(&self) -> Result<Vec<(u64, String)>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(&format!(
            "SELECT height, hash FROM {} ORDER BY height DESC",
            self.table("hot_block")
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Purges hot-block rows and change records at or below `height`, once
    /// those blocks are finalized. The side log never holds records for
    /// finalized heights.
    pub fn finalize_up_to(&self, height: u64) -> Result<usize> {
        let bound = height_to_sql(height)?;
        let conn = self.conn.borrow();
        let purged = conn.execute(
            &format!(
                "DELETE FROM {} WHERE block_height <= ?1",
                self.table("hot_change_log")
            ),
            [bound],
        )?;
        conn.execute(
            &format!("DELETE FROM {} WHERE height <= ?1", self.table("hot_block")),
            [bound],
        )?;
        Ok(purged)
    }

    /// Number of unfinalized blocks currently tracked.
    pub fn hot_depth(&self) -> Result<u64> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table("hot_block")),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of pending change records across all hot blocks.
    pub fn change_log_len(&self) -> Result<u64> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table("hot_change_log")),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Row count of an arbitrary table, for status reporting.
    pub fn table_count(&self, table: &str) -> Result<u64> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)?),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn status_table(schema: &str, name: &str) -> String {
    format!("\"{schema}_{name}\"")
}

/// Records the committed position inside the batch transaction, so handler
/// writes and progress advance atomically.
pub fn commit_position(
    tx: &rusqlite::Transaction<'_>,
    schema: &str,
    height: u64,
    hash: &str,
) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO {} (id, height, hash) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET height = excluded.height, hash = excluded.hash",
            status_table(schema, "status")
        ),
        rusqlite::params![height_to_sql(height)?, hash],
    )
    .wrap_err("failed to commit position")?;
    Ok(())
}

/// Registers an unfinalized block inside its batch transaction.
pub fn insert_hot_block(
    tx: &rusqlite::Transaction<'_>,
    schema: &str,
    height: u64,
    hash: &str,
) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (height, hash) VALUES (?1, ?2)",
            status_table(schema, "hot_block")
        ),
        rusqlite::params![height_to_sql(height)?, hash],
    )
    .wrap_err("failed to record hot block")?;
    Ok(())
}

/// Reads rows by id, including every column, as pre-images for tracking and
/// rollback.
pub(crate) fn select_rows(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    ids: &[String],
) -> Result<BTreeMap<String, RowValues>> {
    let mut found = BTreeMap::new();
    if ids.is_empty() {
        return Ok(found);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT * FROM {} WHERE \"id\" IN ({placeholders})",
        quote_ident(table)?
    );
    let mut stmt = tx.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
    while let Some(row) = rows.next()? {
        let mut id: Option<String> = None;
        let mut values = RowValues::new();
        for (position, column) in columns.iter().enumerate() {
            let value = from_sql_value(row.get_ref(position)?);
            if column == "id" {
                match value {
                    serde_json::Value::String(s) => id = Some(s),
                    other => bail!("table {table:?} has a non-text id: {other}"),
                }
            } else {
                values.insert(column.clone(), value);
            }
        }
        let id = id.ok_or_else(|| eyre!("table {table:?} has no id column"))?;
        found.insert(id, values);
    }
    Ok(found)
}

fn uniform_columns(table: &str, rows: &[Row]) -> Result<Vec<String>> {
    let columns: Vec<String> = rows[0].values.keys().cloned().collect();
    for row in rows {
        ensure!(
            row.values.len() == columns.len()
                && row.values.keys().zip(&columns).all(|(a, b)| a == b),
            "rows written to {table:?} must share one column set"
        );
    }
    Ok(columns)
}

/// Handler-facing row operations bound to one batch transaction.
///
/// When constructed with a [`ChangeTracker`] (unfinalized batches), every
/// mutation is recorded in the change log before it is applied, each
/// operation appending its records in a single bulk insert.
pub struct BatchStore<'t> {
    tx: &'t rusqlite::Transaction<'t>,
    schema: String,
    tracker: Option<ChangeTracker>,
}

impl<'t> BatchStore<'t> {
    pub fn new(
        tx: &'t rusqlite::Transaction<'t>,
        schema: impl Into<String>,
        tracker: Option<ChangeTracker>,
    ) -> Self {
        Self {
            tx,
            schema: schema.into(),
            tracker,
        }
    }

    /// True while mutations are being recorded for rollback.
    pub fn tracking(&self) -> bool {
        self.tracker.is_some()
    }

    fn record_changes(&mut self, records: Vec<ChangeRecord>) -> Result<()> {
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(());
        };
        if records.is_empty() {
            return Ok(());
        }
        let height = height_to_sql(tracker.block_height())?;
        let rows = vec!["(?, ?, ?)"; records.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} (block_height, idx, change) VALUES {rows}",
            status_table(&self.schema, "hot_change_log")
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(records.len() * 3);
        for record in &records {
            params.push(rusqlite::types::Value::Integer(height));
            params.push(rusqlite::types::Value::Integer(
                tracker.next_index() as i64,
            ));
            params.push(rusqlite::types::Value::Text(serde_json::to_string(record)?));
        }
        self.tx
            .execute(&sql, rusqlite::params_from_iter(params))
            .wrap_err("failed to append change records")?;
        Ok(())
    }

    fn write_rows(&self, table: &str, columns: &[String], rows: &[Row], upsert: bool) -> Result<()> {
        let mut column_sql = vec!["\"id\"".to_string()];
        for column in columns {
            column_sql.push(quote_ident(column)?);
        }
        let placeholders: Vec<String> =
            (1..=column_sql.len()).map(|n| format!("?{n}")).collect();
        let conflict = if upsert {
            if columns.is_empty() {
                " ON CONFLICT(\"id\") DO NOTHING".to_string()
            } else {
                let assignments: Vec<String> = columns
                    .iter()
                    .map(|c| quote_ident(c).map(|q| format!("{q} = excluded.{q}")))
                    .collect::<Result<_>>()?;
                format!(" ON CONFLICT(\"id\") DO UPDATE SET {}", assignments.join(", "))
            }
        } else {
            String::new()
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}){conflict}",
            quote_ident(table)?,
            column_sql.join(", "),
            placeholders.join(", "),
        );
        let mut stmt = self.tx.prepare(&sql)?;
        for row in rows {
            let mut params: Vec<rusqlite::types::Value> =
                vec![rusqlite::types::Value::Text(row.id.clone())];
            for column in columns {
                params.push(to_sql_value(&row.values[column])?);
            }
            stmt.execute(rusqlite::params_from_iter(params))
                .wrap_err_with(|| format!("failed to write row {} into {table:?}", row.id))?;
        }
        Ok(())
    }

    /// Inserts new rows. Fails on id conflicts.
    ///
    /// # Errors
    /// Returns error if a row already exists or the write fails.
    pub fn insert(&mut self, table: &str, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = uniform_columns(table, rows)?;
        self.record_changes(
            rows.iter()
                .map(|row| ChangeRecord::Insert {
                    table: table.to_string(),
                    id: row.id.clone(),
                })
                .collect(),
        )?;
        self.write_rows(table, &columns, rows, false)
    }

    /// Inserts or overwrites rows. Pre-images of overwritten rows are
    /// captured before the write.
    pub fn upsert(&mut self, table: &str, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let columns = uniform_columns(table, rows)?;
        if self.tracking() {
            let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
            let existing = select_rows(self.tx, table, &ids)?;
            let records = rows
                .iter()
                .map(|row| match existing.get(&row.id) {
                    Some(prior) => ChangeRecord::Update {
                        table: table.to_string(),
                        id: row.id.clone(),
                        prior: prior.clone(),
                    },
                    None => ChangeRecord::Insert {
                        table: table.to_string(),
                        id: row.id.clone(),
                    },
                })
                .collect();
            self.record_changes(records)?;
        }
        self.write_rows(table, &columns, rows, true)
    }

    /// Deletes rows by id; ids with no row are ignored. Full pre-images are
    /// captured before the delete.
    pub fn delete(&mut self, table: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        if self.tracking() {
            let existing = select_rows(self.tx, table, ids)?;
            let records = ids
                .iter()
                .filter_map(|id| {
                    existing.get(id).map(|prior| ChangeRecord::Delete {
                        table: table.to_string(),
                        id: id.clone(),
                        prior: prior.clone(),
                    })
                })
                .collect();
            self.record_changes(records)?;
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let deleted = self
            .tx
            .execute(
                &format!(
                    "DELETE FROM {} WHERE \"id\" IN ({placeholders})",
                    quote_ident(table)?
                ),
                rusqlite::params_from_iter(ids),
            )
            .wrap_err_with(|| format!("failed to delete from {table:?}"))?;
        Ok(deleted)
    }

    /// Reads rows by id. Missing ids are simply absent from the result.
    pub fn select(&self, table: &str, ids: &[String]) -> Result<Vec<Row>> {
        let found = select_rows(self.tx, table, ids)?;
        Ok(found
            .into_iter()
            .map(|(id, values)| Row { id, values })
            .collect())
    }
}
