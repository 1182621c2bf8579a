//! PostgreSQL storage backend.

use super::{Dialect, SqlRow, SqlValue, StorageBackend};
use crate::errors::StorageError;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, Row, Transaction, TypeInfo};
use std::any::Any;
use tokio::sync::Mutex;

/// `StorageBackend` over a `sqlx` PostgreSQL pool.
pub struct PostgresStorage {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PostgresStorage {
    /// Connect to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(Self {
            pool,
            tx: Mutex::new(None),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        params: Vec<SqlValue>,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        for value in params {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Int(v) => query.bind(v),
                SqlValue::Float(v) => query.bind(v),
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Timestamp(v) => query.bind(v),
            };
        }
        query
    }

    fn convert_row(row: &PgRow) -> Result<SqlRow, StorageError> {
        let mut out = SqlRow::new();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_string();
            let value = match column.type_info().name() {
                "INT2" => row
                    .try_get::<Option<i16>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
                "INT4" => row
                    .try_get::<Option<i32>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
                "INT8" => row
                    .try_get::<Option<i64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Int),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v))),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Float),
                "BOOL" => row
                    .try_get::<Option<bool>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<DateTime<Utc>>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Timestamp),
                "TIMESTAMP" => row
                    .try_get::<Option<chrono::NaiveDateTime>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Timestamp(v.and_utc())),
                _ => row
                    .try_get::<Option<String>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Text),
            };
            out.push(name, value);
        }
        Ok(out)
    }
}

impl StorageBackend for PostgresStorage {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
            let sql = self.dialect().rewrite_placeholders(sql);
            let query = Self::bind_params(sqlx::query(&sql), params);
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
            let sql = self.dialect().rewrite_placeholders(sql);
            let query = Self::bind_params(sqlx::query(&sql), params);
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
