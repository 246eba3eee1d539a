use std::str::FromStr;

use sqlx::{Column, ColumnIndex, Database, Row, TypeInfo, ValueRef};

use crate::error::TabulaError;
use crate::value::{Record, Value};

/// SQL family a compiled statement is rendered for.
///
/// The compiler always emits `?` markers. [`Dialect::rewrite_placeholders`]
/// turns them into numbered parameters where the backend needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    #[default]
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    /// Placeholder for the `n`-th parameter, counting from 1.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite | Dialect::MySql => "?".to_owned(),
        }
    }

    pub fn numbered_placeholders(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// True if INSERT can hand back the generated key with `RETURNING`.
    pub fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Rewrites every `?` outside single-quoted literals into this dialect's
    /// placeholder. Marker order, and so argument order, is preserved.
    pub fn rewrite_placeholders(self, sql: &str) -> String {
        if !self.numbered_placeholders() {
            return sql.to_owned();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut index = 0;
        let mut in_literal = false;
        for ch in sql.chars() {
            match ch {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(ch);
                }
                '?' if !in_literal => {
                    index += 1;
                    out.push_str(&self.placeholder(index));
                }
                _ => out.push(ch),
            }
        }
        out
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
        }
    }
}

impl FromStr for Dialect {
    type Err = TabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "postgres" | "postgresql" | "pg" | "pgsql" => Ok(Dialect::Postgres),
            other => Err(TabulaError::Validation(format!("unsupported dialect `{other}`"))),
        }
    }
}

/// Query type produced by `sqlx::query` for a backend.
pub type SqlxQuery<'q, DB> = sqlx::query::Query<'q, DB, <DB as Database>::Arguments<'q>>;

// Chapter 18: Multi-Database Support
/// Everything Tabula needs from an sqlx backend.
///
/// Implementations bind [`Value`]s with the backend's native types and decode
/// rows back into [`Record`]s, which keeps the rest of the crate free of
/// driver-specific code.
pub trait SqlDialect: Database + Sized + Send + Sync
where
    Self::Connection: Send,
{
    /// Runtime dialect used by the compiler's placeholder rewrite.
    fn dialect() -> Dialect;
    /// Returns the number of rows affected by a query result.
    fn rows_affected(res: &Self::QueryResult) -> u64;
    /// Returns the ID of the last inserted row, or 0 when the backend cannot tell.
    fn last_insert_id(res: &Self::QueryResult) -> i64;
    /// Returns true if the database supports the `RETURNING` clause.
    fn supports_returning() -> bool {
        Self::dialect().supports_returning()
    }
    /// Binds one value onto a query.
    fn bind_value<'q>(query: SqlxQuery<'q, Self>, value: Value) -> SqlxQuery<'q, Self>;
    /// Decodes a full row. With `normalize_bytes`, binary columns come back as text.
    fn decode_row(row: &Self::Row, normalize_bytes: bool) -> Result<Record, sqlx::Error>;
}

fn decode_columns<R, F>(row: &R, normalize_bytes: bool, mut decode: F) -> Result<Record, sqlx::Error>
where
    R: Row,
    usize: ColumnIndex<R>,
    F: FnMut(&R, usize, &str) -> Result<Value, sqlx::Error>,
{
    let mut record = Record::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            decode(row, index, &type_name)?
        };
        let value = if normalize_bytes {
            value.normalize_bytes()
        } else {
            value
        };
        record.insert(column.name().to_owned(), value);
    }
    Ok(record)
}

#[cfg(feature = "sqlite")]
impl SqlDialect for sqlx::Sqlite {
    fn dialect() -> Dialect {
        Dialect::Sqlite
    }
    fn rows_affected(res: &sqlx::sqlite::SqliteQueryResult) -> u64 {
        res.rows_affected()
    }
    fn last_insert_id(res: &sqlx::sqlite::SqliteQueryResult) -> i64 {
        res.last_insert_rowid()
    }
    fn bind_value<'q>(query: SqlxQuery<'q, Self>, value: Value) -> SqlxQuery<'q, Self> {
        match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::Text(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
            // SQLite has no uuid type; store the canonical text form.
            Value::Uuid(v) => query.bind(v.to_string()),
            Value::DateTime(v) => query.bind(v),
        }
    }
    fn decode_row(row: &sqlx::sqlite::SqliteRow, normalize_bytes: bool) -> Result<Record, sqlx::Error> {
        decode_columns(row, normalize_bytes, |row, index, type_name| {
            Ok(match type_name {
                "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" => {
                    Value::Int(row.try_get_unchecked::<i64, _>(index)?)
                }
                "BOOLEAN" | "BOOL" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    Value::Float(row.try_get_unchecked::<f64, _>(index)?)
                }
                "BLOB" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
            })
        })
    }
}

#[cfg(feature = "postgres")]
impl SqlDialect for sqlx::Postgres {
    fn dialect() -> Dialect {
        Dialect::Postgres
    }
    fn rows_affected(res: &sqlx::postgres::PgQueryResult) -> u64 {
        res.rows_affected()
    }
    fn last_insert_id(_res: &sqlx::postgres::PgQueryResult) -> i64 {
        0
    }
    fn bind_value<'q>(query: SqlxQuery<'q, Self>, value: Value) -> SqlxQuery<'q, Self> {
        match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::Text(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
            Value::Uuid(v) => query.bind(v),
            Value::DateTime(v) => query.bind(v),
        }
    }
    fn decode_row(row: &sqlx::postgres::PgRow, normalize_bytes: bool) -> Result<Record, sqlx::Error> {
        decode_columns(row, normalize_bytes, |row, index, type_name| {
            Ok(match type_name {
                "BOOL" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
                "INT2" => Value::from(row.try_get_unchecked::<i16, _>(index)?),
                "INT4" => Value::from(row.try_get_unchecked::<i32, _>(index)?),
                "INT8" => Value::Int(row.try_get_unchecked::<i64, _>(index)?),
                "FLOAT4" => Value::from(row.try_get_unchecked::<f32, _>(index)?),
                "FLOAT8" => Value::Float(row.try_get_unchecked::<f64, _>(index)?),
                "UUID" => Value::Uuid(row.try_get_unchecked::<uuid::Uuid, _>(index)?),
                "TIMESTAMPTZ" => Value::DateTime(
                    row.try_get_unchecked::<chrono::DateTime<chrono::Utc>, _>(index)?,
                ),
                "TIMESTAMP" => Value::from(row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)?),
                "DATE" => Value::Text(row.try_get_unchecked::<chrono::NaiveDate, _>(index)?.to_string()),
                "BYTEA" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                "JSON" | "JSONB" => {
                    Value::Text(row.try_get_unchecked::<serde_json::Value, _>(index)?.to_string())
                }
                _ => Value::Text(row.try_get::<String, _>(index)?),
            })
        })
    }
}

#[cfg(feature = "mysql")]
impl SqlDialect for sqlx::MySql {
    fn dialect() -> Dialect {
        Dialect::MySql
    }
    fn rows_affected(res: &sqlx::mysql::MySqlQueryResult) -> u64 {
        res.rows_affected()
    }
    fn last_insert_id(res: &sqlx::mysql::MySqlQueryResult) -> i64 {
        i64::try_from(res.last_insert_id()).unwrap_or(0)
    }
    fn bind_value<'q>(query: SqlxQuery<'q, Self>, value: Value) -> SqlxQuery<'q, Self> {
        match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::Float(v) => query.bind(v),
            Value::Text(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
            Value::Uuid(v) => query.bind(v.to_string()),
            Value::DateTime(v) => query.bind(v),
        }
    }
    fn decode_row(row: &sqlx::mysql::MySqlRow, normalize_bytes: bool) -> Result<Record, sqlx::Error> {
        decode_columns(row, normalize_bytes, |row, index, type_name| {
            Ok(match type_name {
                "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                    Value::Int(row.try_get_unchecked::<i64, _>(index)?)
                }
                name if name.ends_with("UNSIGNED") => {
                    let raw = row.try_get_unchecked::<u64, _>(index)?;
                    i64::try_from(raw).map_or(Value::Float(raw as f64), Value::Int)
                }
                "FLOAT" => Value::from(row.try_get_unchecked::<f32, _>(index)?),
                "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(index)?),
                "TIMESTAMP" => Value::DateTime(
                    row.try_get_unchecked::<chrono::DateTime<chrono::Utc>, _>(index)?,
                ),
                "DATETIME" => Value::from(row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)?),
                "DATE" => Value::Text(row.try_get_unchecked::<chrono::NaiveDate, _>(index)?.to_string()),
                "TIME" => Value::Text(row.try_get_unchecked::<chrono::NaiveTime, _>(index)?.to_string()),
                "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
                    Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?)
                }
                // DECIMAL, JSON, ENUM and the character types travel as text.
                _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
            })
        })
    }
}
