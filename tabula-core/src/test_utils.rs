//! Helpers for testing code built on Tabula.

use std::collections::VecDeque;

use futures_util::future::LocalBoxFuture;
use sqlx::{Database, IntoArguments};

use crate::connection::Connection;
use crate::dialect::{Dialect, SqlDialect};
use crate::error::TabulaResult;
use crate::executor::Executor;
use crate::value::{Record, Value};

/// A statement seen by [`RecordingConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

/// In-memory [`Connection`] that records every statement and replays scripted results.
///
/// Selects with nothing scripted return no rows, writes report one affected
/// row, and inserts hand out increasing integer keys.
#[derive(Debug, Default)]
pub struct RecordingConnection {
    dialect: Dialect,
    statements: Vec<Statement>,
    selects: VecDeque<TabulaResult<Vec<Record>>>,
    execs: VecDeque<TabulaResult<u64>>,
    commit_error: Option<crate::TabulaError>,
    last_id: i64,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }

    /// Queues the rows returned by the next unscripted select.
    pub fn push_rows(&mut self, rows: Vec<Record>) -> &mut Self {
        self.selects.push_back(Ok(rows));
        self
    }

    pub fn push_select_error(&mut self, err: crate::TabulaError) -> &mut Self {
        self.selects.push_back(Err(err));
        self
    }

    /// Queues the affected-row count of the next write.
    pub fn push_affected(&mut self, rows: u64) -> &mut Self {
        self.execs.push_back(Ok(rows));
        self
    }

    pub fn push_exec_error(&mut self, err: crate::TabulaError) -> &mut Self {
        self.execs.push_back(Err(err));
        self
    }

    /// Makes the next COMMIT fail with `err`.
    pub fn fail_next_commit(&mut self, err: crate::TabulaError) -> &mut Self {
        self.commit_error = Some(err);
        self
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn sql_log(&self) -> Vec<&str> {
        self.statements.iter().map(|s| s.sql.as_str()).collect()
    }

    /// Number of statements whose SQL starts with `keyword` (`"UPDATE"`, `"BEGIN"`, ...).
    pub fn count_of(&self, keyword: &str) -> usize {
        self.statements
            .iter()
            .filter(|s| s.sql.starts_with(keyword))
            .count()
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }

    fn record(&mut self, sql: &str, args: &[Value]) {
        self.statements.push(Statement {
            sql: sql.to_owned(),
            args: args.to_vec(),
        });
    }
}

impl Connection for RecordingConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn select(&mut self, sql: &str, args: &[Value]) -> TabulaResult<Vec<Record>> {
        self.record(sql, args);
        self.selects.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> TabulaResult<u64> {
        self.record(sql, args);
        self.execs.pop_front().unwrap_or(Ok(1))
    }

    async fn insert(&mut self, sql: &str, args: &[Value], _key_column: &str) -> TabulaResult<Option<Value>> {
        self.exec(sql, args).await?;
        self.last_id += 1;
        Ok(Some(Value::Int(self.last_id)))
    }

    async fn begin(&mut self) -> TabulaResult<()> {
        self.record("BEGIN", &[]);
        Ok(())
    }

    async fn commit(&mut self) -> TabulaResult<()> {
        self.record("COMMIT", &[]);
        self.commit_error.take().map_or(Ok(()), Err)
    }

    async fn rollback(&mut self) -> TabulaResult<()> {
        self.record("ROLLBACK", &[]);
        Ok(())
    }
}

/// Run an async test block inside a transaction that is always rolled back.
pub async fn with_test_transaction<DB, F, T>(pool: &sqlx::Pool<DB>, f: F) -> TabulaResult<T>
where
    DB: SqlDialect,
    for<'c> &'c mut <DB as Database>::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
    F: for<'c> FnOnce(Executor<'c, DB>) -> LocalBoxFuture<'c, TabulaResult<T>>,
{
    let mut tx = pool.begin().await?;
    let result = f(Executor::conn(&mut *tx)).await;
    let rollback_result = tx.rollback().await;

    match (result, rollback_result) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err.into()),
    }
}

/// Lightweight test helper for constructing a dedicated pool.
pub struct MockDatabase<DB: Database> {
    pool: sqlx::Pool<DB>,
}

impl<DB: Database> MockDatabase<DB> {
    pub fn pool(&self) -> &sqlx::Pool<DB> {
        &self.pool
    }

    pub fn into_pool(self) -> sqlx::Pool<DB> {
        self.pool
    }

    pub fn executor(&self) -> Executor<'_, DB> {
        Executor::pool(&self.pool)
    }
}

#[cfg(feature = "sqlite")]
impl MockDatabase<sqlx::Sqlite> {
    /// Single-connection in-memory SQLite, so every statement sees the same database.
    pub async fn new_sqlite() -> TabulaResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Runs a multi-statement script, typically the `CREATE TABLE`s of a test.
    pub async fn run_script(&self, script: &str) -> TabulaResult<()> {
        sqlx::raw_sql(script).execute(&self.pool).await?;
        Ok(())
    }
}
