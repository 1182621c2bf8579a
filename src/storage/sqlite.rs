//! SQLite storage backend.
//!
//! Timestamps are stored as text in a fixed, lexically ordered format (see
//! [`super::SQLITE_TIMESTAMP_FORMAT`]). SQLite has no row locks; writers
//! serialize at the database level (WAL journal, five second busy timeout),
//! which satisfies the leasing exclusion contract.

use super::{format_timestamp_text, Dialect, SqlRow, SqlValue, StorageBackend};
use crate::errors::StorageError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction, TypeInfo};
use std::any::Any;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

/// `StorageBackend` over a `sqlx` SQLite pool.
pub struct SqliteStorage {
    pool: SqlitePool,
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl SqliteStorage {
    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StorageError::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            tx: Mutex::new(None),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        params: Vec<SqlValue>,
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for value in params {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Int(v) => query.bind(v),
                SqlValue::Float(v) => query.bind(v),
                SqlValue::Text(v) => query.bind(v),
                // Bound as text in the fixed format so comparisons against
                // stored values stay lexically correct.
                SqlValue::Timestamp(v) => query.bind(format_timestamp_text(&v)),
            };
        }
        query
    }

    fn convert_row(row: &SqliteRow) -> Result<SqlRow, StorageError> {
        let mut out = SqlRow::new();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_string();
            let value = match column.type_info().name() {
                "NULL" => SqlValue::Null,
                "INTEGER" | "BOOLEAN" => row
                    .try_get::<Option<i64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Int),
                "REAL" | "NUMERIC" => row
                    .try_get::<Option<f64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Float),
                _ => row
                    .try_get::<Option<String>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Text),
            };
            out.push(name, value);
        }
        Ok(out)
    }
}

impl StorageBackend for SqliteStorage {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn begin(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let mut guard = self.tx.lock().await;
            if guard.is_some() {
                return Err(StorageError::new("transaction already open"));
            }
            *guard = Some(self.pool.begin().await?);
            Ok(())
        }
        .boxed()
    }

    fn commit(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let mut guard = self.tx.lock().await;
            match guard.take() {
                Some(tx) => Ok(tx.commit().await?),
                None => Err(StorageError::new("no open transaction to commit")),
            }
        }
        .boxed()
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let mut guard = self.tx.lock().await;
            match guard.take() {
                Some(tx) => Ok(tx.rollback().await?),
                None => Err(StorageError::new("no open transaction to roll back")),
            }
        }
        .boxed()
    }

    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: Vec<SqlValue>,
    ) -> BoxFuture<'a, Result<u64, StorageError>> {
        async move {
            let query = Self::bind_params(sqlx::query(sql), params);
            let mut guard = self.tx.lock().await;
            let result = match guard.as_mut() {
                Some(tx) => query.execute(&mut **tx).await?,
                None => query.execute(&self.pool).await?,
            };
            Ok(result.rows_affected())
        }
        .boxed()
    }

    fn query<'a>(
        &'a self,
        sql: &'a str,
        params: Vec<SqlValue>,
    ) -> BoxFuture<'a, Result<Vec<SqlRow>, StorageError>> {
        async move {
            let query = Self::bind_params(sqlx::query(sql), params);
            let mut guard = self.tx.lock().await;
            let rows = match guard.as_mut() {
                Some(tx) => query.fetch_all(&mut **tx).await?,
                None => query.fetch_all(&self.pool).await?,
            };
            rows.iter().map(Self::convert_row).collect()
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            self.pool.close().await;
            Ok(())
        }
        .boxed()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
