//! SQL dialect differences, centralized so the execution loop stays dialect-free.

use super::{ColumnDef, ColumnDefault, ColumnType};

/// The SQL dialect spoken by a storage backend.
///
/// Identifier quoting, placeholder style, auto-increment syntax, timestamp
/// defaults, priority ranking, and row locking all route through here. A
/// backend for another vendor (SQL Server's `GETDATE()` and bracket quoting,
/// Oracle's `:paramN` placeholders) plugs in as a new variant without
/// touching the leasing or execution code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL: `$n` placeholders, double-quoted identifiers.
    Postgres,
    /// MySQL / MariaDB: `?` placeholders, backtick identifiers, `FIELD()`.
    MySql,
    /// SQLite: `?` placeholders, double-quoted identifiers, database-level locking.
    Sqlite,
}

impl Dialect {
    /// Rewrite canonical `?` placeholders into the dialect's native style.
    ///
    /// Quoted string literals are left untouched.
    pub fn rewrite_placeholders(&self, sql: &str) -> String {
        match self {
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0;
                let mut in_string = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_string = !in_string;
                            out.push(ch);
                        }
                        '?' if !in_string => {
                            n += 1;
                            out.push('$');
                            out.push_str(&n.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                out
            }
            Dialect::MySql | Dialect::Sqlite => sql.to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Dialect::MySql => format!("`{name}`"),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{name}\""),
        }
    }

    /// The dialect's now-function used for `CURRENT_TIMESTAMP` column defaults.
    pub fn current_timestamp(&self) -> &'static str {
        // All three supported dialects accept the standard spelling; SQL
        // Server would map to GETDATE() here.
        "CURRENT_TIMESTAMP"
    }

    /// Positional priority expression: urgent=0, high=1, normal=2, low=3.
    ///
    /// MySQL has `FIELD()`; the others emulate it with a `CASE` expression.
    pub fn priority_rank(&self, column: &str) -> String {
        match self {
            Dialect::MySql => format!("FIELD({column}, 'urgent', 'high', 'normal', 'low')"),
            Dialect::Postgres | Dialect::Sqlite => format!(
                "CASE {column} WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 \
                 WHEN 'normal' THEN 2 WHEN 'low' THEN 3 ELSE 4 END"
            ),
        }
    }

    /// Row-lock clause appended to the leasing select.
    ///
    /// SQLite has no row locks; its immediate transactions serialize writers
    /// at the database level, which satisfies the same exclusion contract.
    pub fn row_lock_clause(&self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::MySql => " FOR UPDATE",
            Dialect::Sqlite => "",
        }
    }

    /// Query returning the id generated by the last insert on this connection.
    pub fn last_insert_id_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => "SELECT lastval()",
            Dialect::MySql => "SELECT LAST_INSERT_ID()",
            Dialect::Sqlite => "SELECT last_insert_rowid()",
        }
    }

    /// Query with one `?` parameter (the table name) returning a row iff the table exists.
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_name = ? AND table_schema = current_schema()"
            }
            Dialect::MySql => {
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_name = ? AND table_schema = DATABASE()"
            }
            Dialect::Sqlite => "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
        }
    }

    /// Expression yielding the seconds elapsed between two timestamp columns, as a float.
    pub fn seconds_between(&self, start: &str, end: &str) -> String {
        match self {
            Dialect::Postgres => format!("EXTRACT(EPOCH FROM ({end} - {start}))::float8"),
            Dialect::MySql => format!("CAST(TIMESTAMPDIFF(SECOND, {start}, {end}) AS DOUBLE)"),
            Dialect::Sqlite => format!("(julianday({end}) - julianday({start})) * 86400.0"),
        }
    }

    /// `TRUNCATE`-equivalent statement for this dialect.
    pub fn truncate_sql(&self, table: &str) -> String {
        let table = self.quote_identifier(table);
        match self {
            Dialect::Postgres | Dialect::MySql => format!("TRUNCATE TABLE {table}"),
            Dialect::Sqlite => format!("DELETE FROM {table}"),
        }
    }

    /// Render one column definition for a `CREATE TABLE`.
    pub fn column_sql(&self, def: &ColumnDef) -> String {
        let name = self.quote_identifier(&def.name);

        if def.auto_increment {
            // Auto-increment columns double as the primary key in every
            // schema this crate provisions.
            return match self {
                Dialect::Postgres => format!("{name} BIGSERIAL PRIMARY KEY"),
                Dialect::MySql => {
                    format!("{name} BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY")
                }
                Dialect::Sqlite => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
            };
        }

        let mut sql = format!("{name} {}", self.type_sql(def));
        if !def.nullable {
            sql.push_str(" NOT NULL");
        }
        match &def.default {
            Some(ColumnDefault::CurrentTimestamp) => {
                sql.push_str(" DEFAULT ");
                sql.push_str(self.current_timestamp());
            }
            Some(ColumnDefault::Text(text)) => {
                sql.push_str(&format!(" DEFAULT '{text}'"));
            }
            Some(ColumnDefault::Int(n)) => {
                sql.push_str(&format!(" DEFAULT {n}"));
            }
            None => {}
        }
        sql
    }

    fn type_sql(&self, def: &ColumnDef) -> String {
        match (def.col_type, self) {
            (ColumnType::BigInt, Dialect::MySql) if def.unsigned => "BIGINT UNSIGNED".into(),
            (ColumnType::BigInt, Dialect::Sqlite) => "INTEGER".into(),
            (ColumnType::BigInt, _) => "BIGINT".into(),
            (ColumnType::Int, Dialect::MySql) if def.unsigned => "INT UNSIGNED".into(),
            (ColumnType::Int, Dialect::Sqlite) => "INTEGER".into(),
            (ColumnType::Int, _) => "INT".into(),
            (ColumnType::VarChar, _) => format!("VARCHAR({})", def.size.unwrap_or(255)),
            (ColumnType::Text, _) => "TEXT".into(),
            (ColumnType::LongText, Dialect::MySql) => "LONGTEXT".into(),
            (ColumnType::LongText, _) => "TEXT".into(),
            (ColumnType::Timestamp, Dialect::Postgres) => "TIMESTAMPTZ".into(),
            (ColumnType::Timestamp, Dialect::MySql) => "DATETIME".into(),
            // SQLite stores timestamps as text; values are written in a
            // fixed, lexically ordered format by the backend.
            (ColumnType::Timestamp, Dialect::Sqlite) => "TEXT".into(),
        }
    }
}
