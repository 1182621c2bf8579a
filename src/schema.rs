//! Table definitions and on-first-use provisioning.

use crate::errors::StorageError;
use crate::storage::{ColumnDef, StorageBackend};
use tracing::{debug, warn};

/// Name of the jobs table.
pub const JOBS_TABLE: &str = "jobs";
/// Name of the terminal-failure audit table.
pub const FAILED_JOBS_TABLE: &str = "failed_jobs";

fn jobs_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::big_int("id").unsigned().auto_increment(),
        ColumnDef::varchar("uuid", 36).not_null(),
        ColumnDef::varchar("name", 255).not_null(),
        ColumnDef::varchar("callable_type", 20).not_null(),
        ColumnDef::long_text("callable").not_null(),
        ColumnDef::varchar("namespace", 255),
        ColumnDef::long_text("object_instance"),
        ColumnDef::varchar("path_files", 1024),
        ColumnDef::long_text("params").not_null(),
        ColumnDef::varchar("status", 20).not_null().default_text("pending"),
        ColumnDef::varchar("priority", 10).not_null().default_text("normal"),
        ColumnDef::varchar("pid", 32),
        ColumnDef::int("timeout").not_null().default_int(14_400),
        ColumnDef::int("retry_count").not_null().default_int(0),
        ColumnDef::int("max_retries").not_null().default_int(3),
        ColumnDef::int("retry_delay").not_null().default_int(5),
        ColumnDef::timestamp("started_at"),
        ColumnDef::timestamp("completed_at"),
        ColumnDef::timestamp("created_at")
            .not_null()
            .default_current_timestamp(),
        ColumnDef::timestamp("updated_at"),
    ]
}

fn failed_jobs_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::big_int("id").unsigned().auto_increment(),
        ColumnDef::varchar("uuid", 36).not_null(),
        ColumnDef::big_int("job_id").unsigned().not_null(),
        ColumnDef::long_text("exception").not_null(),
        ColumnDef::long_text("payload").not_null(),
        ColumnDef::timestamp("failed_at")
            .not_null()
            .default_current_timestamp(),
    ]
}

/// Ensure both queue tables and their indices exist. Idempotent; concurrent
/// provisioners race safely on the driver's `IF NOT EXISTS` semantics.
pub async fn ensure_tables(storage: &dyn StorageBackend) -> Result<(), StorageError> {
    if !storage.table_exists(JOBS_TABLE).await? {
        debug!("Creating {JOBS_TABLE} table…");
        storage
            .create_table(JOBS_TABLE, &jobs_columns(), &[])
            .await?;
        create_index(storage, "idx_jobs_uuid", JOBS_TABLE, &["uuid"]).await;
        create_index(
            storage,
            "idx_jobs_status_priority",
            JOBS_TABLE,
            &["status", "priority"],
        )
        .await;
        create_index(storage, "idx_jobs_pid", JOBS_TABLE, &["pid"]).await;
    }

    if !storage.table_exists(FAILED_JOBS_TABLE).await? {
        debug!("Creating {FAILED_JOBS_TABLE} table…");
        let fk = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
            storage.quote_identifier("job_id"),
            storage.quote_identifier(JOBS_TABLE),
            storage.quote_identifier("id"),
        );
        storage
            .create_table(FAILED_JOBS_TABLE, &failed_jobs_columns(), &[fk])
            .await?;
        create_index(storage, "idx_failed_jobs_uuid", FAILED_JOBS_TABLE, &["uuid"]).await;
    }

    Ok(())
}

// Not every dialect supports IF NOT EXISTS on CREATE INDEX, so a concurrent
// provisioner can lose this race; the duplicate-index error is harmless.
async fn create_index(storage: &dyn StorageBackend, name: &str, table: &str, columns: &[&str]) {
    let columns: Vec<String> = columns
        .iter()
        .map(|c| storage.quote_identifier(c))
        .collect();
    let sql = format!(
        "CREATE INDEX {} ON {} ({})",
        storage.quote_identifier(name),
        storage.quote_identifier(table),
        columns.join(", ")
    );
    if let Err(error) = storage.execute(&sql, Vec::new()).await {
        warn!(%error, index = name, "Index creation skipped");
    }
}
