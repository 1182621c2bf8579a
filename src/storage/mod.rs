//! Abstract storage port over the relational backends.
//!
//! The queue speaks to its database exclusively through [`StorageBackend`], a
//! dyn-safe contract for SQL execution, transactions, and DDL. Dialect drift
//! (placeholders, quoting, auto-increment, row locking) lives in [`Dialect`];
//! one backend module per driver adapts a `sqlx` pool to the contract.

mod dialect;
mod mysql;
mod postgres;
mod sqlite;

pub use dialect::Dialect;
pub use mysql::MySqlStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

use crate::errors::StorageError;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// A value bound into, or read out of, a SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Any integer type.
    Int(i64),
    /// Any floating-point type.
    Float(f64),
    /// Any text type.
    Text(String),
    /// A timestamp, always UTC.
    Timestamp(DateTime<Utc>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// One result row as an ordered column-name → value map.
#[derive(Debug, Clone, Default)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    /// An empty row, filled by the backends via [`SqlRow::push`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column. Backends call this in select-list order.
    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        self.columns.push((name.into(), value));
    }

    /// Raw value lookup by column name.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn required(&self, name: &str) -> Result<&SqlValue, StorageError> {
        self.get(name)
            .ok_or_else(|| StorageError::new(format!("missing column {name:?}")))
    }

    /// Non-null integer accessor.
    pub fn int(&self, name: &str) -> Result<i64, StorageError> {
        match self.required(name)? {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Float(v) => Ok(*v as i64),
            other => Err(StorageError::new(format!(
                "column {name:?} is not an integer: {other:?}"
            ))),
        }
    }

    /// Nullable integer accessor.
    pub fn opt_int(&self, name: &str) -> Result<Option<i64>, StorageError> {
        match self.required(name)? {
            SqlValue::Null => Ok(None),
            _ => self.int(name).map(Some),
        }
    }

    /// Non-null float accessor. Integers widen.
    pub fn float(&self, name: &str) -> Result<f64, StorageError> {
        match self.required(name)? {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v as f64),
            other => Err(StorageError::new(format!(
                "column {name:?} is not a float: {other:?}"
            ))),
        }
    }

    /// Nullable float accessor.
    pub fn opt_float(&self, name: &str) -> Result<Option<f64>, StorageError> {
        match self.required(name)? {
            SqlValue::Null => Ok(None),
            _ => self.float(name).map(Some),
        }
    }

    /// Non-null text accessor.
    pub fn text(&self, name: &str) -> Result<String, StorageError> {
        match self.required(name)? {
            SqlValue::Text(v) => Ok(v.clone()),
            other => Err(StorageError::new(format!(
                "column {name:?} is not text: {other:?}"
            ))),
        }
    }

    /// Nullable text accessor.
    pub fn opt_text(&self, name: &str) -> Result<Option<String>, StorageError> {
        match self.required(name)? {
            SqlValue::Null => Ok(None),
            _ => self.text(name).map(Some),
        }
    }

    /// Non-null timestamp accessor. Text values are parsed (SQLite stores
    /// timestamps as text).
    pub fn timestamp(&self, name: &str) -> Result<DateTime<Utc>, StorageError> {
        match self.required(name)? {
            SqlValue::Timestamp(v) => Ok(*v),
            SqlValue::Text(v) => parse_timestamp_text(v).ok_or_else(|| {
                StorageError::new(format!("column {name:?} holds unparseable timestamp {v:?}"))
            }),
            other => Err(StorageError::new(format!(
                "column {name:?} is not a timestamp: {other:?}"
            ))),
        }
    }

    /// Nullable timestamp accessor.
    pub fn opt_timestamp(&self, name: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        match self.required(name)? {
            SqlValue::Null => Ok(None),
            _ => self.timestamp(name).map(Some),
        }
    }
}

/// The fixed text format SQLite timestamps are written in.
///
/// Millisecond precision, UTC, no offset suffix; lexical order equals
/// chronological order, and `julianday()` parses it directly.
pub(crate) const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub(crate) fn format_timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.format(SQLITE_TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    for format in [SQLITE_TIMESTAMP_FORMAT, "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Canonical column type vocabulary, translated per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit integer.
    BigInt,
    /// 32-bit integer.
    Int,
    /// Bounded text, `size` characters.
    VarChar,
    /// Unbounded text.
    Text,
    /// Large text (`LONGTEXT` on MySQL).
    LongText,
    /// UTC timestamp.
    Timestamp,
}

/// Default value of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    /// The dialect's now-function.
    CurrentTimestamp,
    /// A literal text default.
    Text(String),
    /// A literal integer default.
    Int(i64),
}

/// Language-neutral column descriptor consumed by `create_table`.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Canonical type.
    pub col_type: ColumnType,
    /// Character length for `VarChar`.
    pub size: Option<u32>,
    /// Unsigned where the dialect supports it.
    pub unsigned: bool,
    /// Auto-incrementing primary key.
    pub auto_increment: bool,
    /// NULL allowed.
    pub nullable: bool,
    /// Default value.
    pub default: Option<ColumnDefault>,
}

impl ColumnDef {
    fn new(name: &str, col_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            col_type,
            size: None,
            unsigned: false,
            auto_increment: false,
            nullable: true,
            default: None,
        }
    }

    /// A `BIGINT` column.
    pub fn big_int(name: &str) -> Self {
        Self::new(name, ColumnType::BigInt)
    }

    /// An `INT` column.
    pub fn int(name: &str) -> Self {
        Self::new(name, ColumnType::Int)
    }

    /// A `VARCHAR(size)` column.
    pub fn varchar(name: &str, size: u32) -> Self {
        let mut def = Self::new(name, ColumnType::VarChar);
        def.size = Some(size);
        def
    }

    /// A `LONGTEXT` column.
    pub fn long_text(name: &str) -> Self {
        Self::new(name, ColumnType::LongText)
    }

    /// A `TIMESTAMP` column.
    pub fn timestamp(name: &str) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    /// Mark unsigned.
    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    /// Mark as the auto-incrementing primary key.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    /// Disallow NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Default to the dialect's now-function.
    pub fn default_current_timestamp(mut self) -> Self {
        self.default = Some(ColumnDefault::CurrentTimestamp);
        self
    }

    /// Default to a literal text value.
    pub fn default_text(mut self, text: &str) -> Self {
        self.default = Some(ColumnDefault::Text(text.to_string()));
        self
    }

    /// Default to a literal integer value.
    pub fn default_int(mut self, value: i64) -> Self {
        self.default = Some(ColumnDefault::Int(value));
        self
    }
}

/// Abstract contract every storage driver satisfies.
///
/// Backends implement the primitive operations (`execute`, `query`,
/// transaction control); CRUD and DDL helpers are derived from those plus the
/// [`Dialect`]. All statements use canonical `?` placeholders; backends
/// translate where their driver requires (`$n` on Postgres).
pub trait StorageBackend: Send + Sync {
    /// The dialect this backend speaks.
    fn dialect(&self) -> Dialect;

    /// Open a transaction. Subsequent operations run inside it until
    /// `commit` or `rollback`.
    fn begin(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Commit the open transaction.
    fn commit(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Roll back the open transaction.
    fn rollback(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Run a statement, returning the number of affected rows.
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: Vec<SqlValue>,
    ) -> BoxFuture<'a, Result<u64, StorageError>>;

    /// Run a query, returning neutral rows.
    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: Vec<SqlValue>,
    ) -> BoxFuture<'a, Result<Vec<SqlRow>, StorageError>>;

    /// Close the underlying pool.
    fn disconnect(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Escape hatch to the concrete backend (and its `sqlx` pool).
    fn as_any(&self) -> &dyn Any;

    /// Quote an identifier for this backend's dialect.
    fn quote_identifier(&self, name: &str) -> String {
        self.dialect().quote_identifier(name)
    }

    /// The id generated by the most recent insert on the open transaction's
    /// connection. Call inside the transaction that performed the insert.
    fn last_insert_id(&self) -> BoxFuture<'_, Result<i64, StorageError>> {
        let sql = self.dialect().last_insert_id_sql();
        async move {
            let rows = self.query(sql, Vec::new()).await?;
            let row = rows
                .first()
                .ok_or_else(|| StorageError::new("last_insert_id returned no rows"))?;
            match row.columns.first() {
                Some((_, SqlValue::Int(id))) => Ok(*id),
                other => Err(StorageError::new(format!(
                    "last_insert_id returned non-integer: {other:?}"
                ))),
            }
        }
        .boxed()
    }

    /// Insert a row built from `(column, value)` pairs.
    fn insert<'a>(
        &'a self,
        table: &str,
        values: Vec<(String, SqlValue)>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        let columns: Vec<String> = values
            .iter()
            .map(|(name, _)| self.quote_identifier(name))
            .collect();
        let placeholders: Vec<&str> = values.iter().map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_identifier(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<SqlValue> = values.into_iter().map(|(_, v)| v).collect();
        async move { Ok(self.execute(&sql, params).await? > 0) }.boxed()
    }

    /// Update the row with the given `id` from `(column, value)` pairs.
    fn update<'a>(
        &'a self,
        table: &str,
        id: i64,
        values: Vec<(String, SqlValue)>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        let assignments: Vec<String> = values
            .iter()
            .map(|(name, _)| format!("{} = ?", self.quote_identifier(name)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.quote_identifier(table),
            assignments.join(", "),
            self.quote_identifier("id"),
        );
        let mut params: Vec<SqlValue> = values.into_iter().map(|(_, v)| v).collect();
        params.push(SqlValue::Int(id));
        async move { Ok(self.execute(&sql, params).await? > 0) }.boxed()
    }

    /// Delete rows where `column = id`.
    fn delete<'a>(
        &'a self,
        table: &str,
        id: i64,
        column: &str,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.quote_identifier(table),
            self.quote_identifier(column),
        );
        async move { Ok(self.execute(&sql, vec![SqlValue::Int(id)]).await? > 0) }.boxed()
    }

    /// Whether a table exists in the current schema.
    fn table_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        let sql = self.dialect().table_exists_sql();
        async move {
            let rows = self.query(sql, vec![SqlValue::from(name)]).await?;
            Ok(!rows.is_empty())
        }
        .boxed()
    }

    /// Create a table from column descriptors plus raw constraint clauses
    /// (foreign keys). Uses `IF NOT EXISTS` so concurrent creators race safely.
    fn create_table<'a>(
        &'a self,
        table: &str,
        columns: &[ColumnDef],
        constraints: &[String],
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        let dialect = self.dialect();
        let mut parts: Vec<String> = columns.iter().map(|def| dialect.column_sql(def)).collect();
        parts.extend(constraints.iter().cloned());
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote_identifier(table),
            parts.join(", ")
        );
        async move {
            self.execute(&sql, Vec::new()).await?;
            Ok(())
        }
        .boxed()
    }

    /// Drop a table if it exists.
    fn drop_table<'a>(&'a self, table: &str) -> BoxFuture<'a, Result<(), StorageError>> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.quote_identifier(table));
        async move {
            self.execute(&sql, Vec::new()).await?;
            Ok(())
        }
        .boxed()
    }

    /// Remove all rows from a table.
    fn truncate_table<'a>(&'a self, table: &str) -> BoxFuture<'a, Result<(), StorageError>> {
        let sql = self.dialect().truncate_sql(table);
        async move {
            self.execute(&sql, Vec::new()).await?;
            Ok(())
        }
        .boxed()
    }
}

/// Which driver a [`DriverConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// PostgreSQL via `sqlx`.
    Postgres,
    /// MySQL via `sqlx`.
    MySql,
    /// SQLite via `sqlx`.
    Sqlite,
}

/// Connection parameters, sufficient for a worker process to re-establish
/// the same kind of storage connection the producer used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Driver connection URL.
    pub url: String,
}

/// Serialized driver selection passed to the worker via `--driver-config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver kind.
    pub driver: DriverKind,
    /// Connection parameters.
    pub connection: ConnectionConfig,
}

impl DriverConfig {
    /// A PostgreSQL driver config.
    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            driver: DriverKind::Postgres,
            connection: ConnectionConfig { url: url.into() },
        }
    }

    /// A MySQL driver config.
    pub fn mysql(url: impl Into<String>) -> Self {
        Self {
            driver: DriverKind::MySql,
            connection: ConnectionConfig { url: url.into() },
        }
    }

    /// A SQLite driver config.
    pub fn sqlite(url: impl Into<String>) -> Self {
        Self {
            driver: DriverKind::Sqlite,
            connection: ConnectionConfig { url: url.into() },
        }
    }
}

/// Connect the backend selected by `config`.
pub async fn connect(config: &DriverConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let url = &config.connection.url;
    Ok(match config.driver {
        DriverKind::Postgres => Arc::new(PostgresStorage::connect(url).await?),
        DriverKind::MySql => Arc::new(MySqlStorage::connect(url).await?),
        DriverKind::Sqlite => Arc::new(SqliteStorage::connect(url).await?),
    })
}
