//! MySQL storage backend.

use super::{Dialect, SqlRow, SqlValue, StorageBackend};
use crate::errors::StorageError;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{Column, MySql, MySqlPool, Row, Transaction, TypeInfo};
use std::any::Any;
use tokio::sync::Mutex;

/// `StorageBackend` over a `sqlx` MySQL pool.
pub struct MySqlStorage {
    pool: MySqlPool,
    tx: Mutex<Option<Transaction<'static, MySql>>>,
}

impl MySqlStorage {
    /// Connect to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            tx: Mutex::new(None),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
        params: Vec<SqlValue>,
    ) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
        for value in params {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Int(v) => query.bind(v),
                SqlValue::Float(v) => query.bind(v),
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Timestamp(v) => query.bind(v.naive_utc()),
            };
        }
        query
    }

    fn convert_row(row: &MySqlRow) -> Result<SqlRow, StorageError> {
        let mut out = SqlRow::new();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_string();
            let type_name = column.type_info().name();
            let value = if type_name.contains("INT") && type_name.contains("UNSIGNED") {
                row.try_get::<Option<u64>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Int(v as i64))
            } else if type_name.contains("INT") || type_name == "BOOLEAN" {
                row.try_get::<Option<i64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Int)
            } else if type_name == "FLOAT" || type_name == "DOUBLE" {
                row.try_get::<Option<f64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Float)
            } else if type_name == "DATETIME" || type_name == "TIMESTAMP" {
                row.try_get::<Option<chrono::NaiveDateTime>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Timestamp(v.and_utc()))
            } else {
                row.try_get::<Option<String>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Text)
            };
            out.push(name, value);
        }
        Ok(out)
    }
}

impl StorageBackend for MySqlStorage {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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
