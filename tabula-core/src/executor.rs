use std::time::{Duration, Instant};

use sqlx::{Database, IntoArguments};

use crate::config::ExecutorConfig;
use crate::connection::Connection;
use crate::dialect::{Dialect, SqlDialect};
use crate::error::{TabulaError, TabulaResult};
use crate::value::{Record, Value};

// Chapter 7: Stronger Executor Abstraction
/// The sqlx implementation of [`Connection`], wrapping either a pool or one connection.
///
/// Pool-backed executors hand each statement to whichever connection is free,
/// so they cannot scope a transaction. Use [`Executor::conn`] on a dedicated
/// connection (or [`Tabula::transaction`](crate::Tabula::transaction)) for that.
pub struct Executor<'a, DB: Database> {
    target: Target<'a, DB>,
    config: ExecutorConfig,
}

enum Target<'a, DB: Database> {
    /// A shared connection pool.
    Pool(&'a sqlx::Pool<DB>),
    /// A single, mutable database connection.
    Conn(&'a mut DB::Connection),
}

impl<'a, DB: Database> std::fmt::Debug for Executor<'a, DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target {
            Target::Pool(_) => f.write_str("Executor::Pool"),
            Target::Conn(_) => f.write_str("Executor::Conn"),
        }
    }
}

impl<'a, DB: Database> Executor<'a, DB> {
    pub fn pool(pool: &'a sqlx::Pool<DB>) -> Self {
        Self {
            target: Target::Pool(pool),
            config: ExecutorConfig::default(),
        }
    }

    pub fn conn(conn: &'a mut DB::Connection) -> Self {
        Self {
            target: Target::Conn(conn),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn is_pool(&self) -> bool {
        matches!(self.target, Target::Pool(_))
    }

    fn warn_if_slow(&self, sql: &str, elapsed: Duration) {
        let threshold = self.config.slow_query_threshold_ms;
        if threshold > 0 && elapsed >= Duration::from_millis(threshold) {
            tracing::warn!(
                sql,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold,
                "slow tabula statement"
            );
        }
    }

    fn log_args(&self, args: &[Value]) {
        if self.config.log_arguments {
            let rendered: Vec<String> = args.iter().map(Value::to_log_string).collect();
            tracing::debug!(args = %rendered.join(", "), "tabula arguments");
        }
    }
}

impl<'a, DB: Database> From<&'a sqlx::Pool<DB>> for Executor<'a, DB> {
    fn from(pool: &'a sqlx::Pool<DB>) -> Self {
        Self::pool(pool)
    }
}

impl<'a, DB: Database> From<&'a mut DB::Connection> for Executor<'a, DB> {
    fn from(conn: &'a mut DB::Connection) -> Self {
        Self::conn(conn)
    }
}

/// A trait for types that can be converted into an [`Executor`].
pub trait IntoExecutor<'a>: 'a {
    /// The database dialect associated with this executor.
    type DB: SqlDialect;
    /// Converts the type into an [`Executor`].
    fn into_executor(self) -> Executor<'a, Self::DB>;
}

impl<'a, DB: SqlDialect> IntoExecutor<'a> for &'a sqlx::Pool<DB> {
    type DB = DB;
    fn into_executor(self) -> Executor<'a, DB> {
        Executor::pool(self)
    }
}

#[cfg(feature = "sqlite")]
impl<'a> IntoExecutor<'a> for &'a mut sqlx::SqliteConnection {
    type DB = sqlx::Sqlite;
    fn into_executor(self) -> Executor<'a, Self::DB> {
        Executor::conn(self)
    }
}

#[cfg(feature = "postgres")]
impl<'a> IntoExecutor<'a> for &'a mut sqlx::postgres::PgConnection {
    type DB = sqlx::Postgres;
    fn into_executor(self) -> Executor<'a, Self::DB> {
        Executor::conn(self)
    }
}

#[cfg(feature = "mysql")]
impl<'a> IntoExecutor<'a> for &'a mut sqlx::mysql::MySqlConnection {
    type DB = sqlx::MySql;
    fn into_executor(self) -> Executor<'a, Self::DB> {
        Executor::conn(self)
    }
}

impl<'a, DB: SqlDialect> IntoExecutor<'a> for Executor<'a, DB> {
    type DB = DB;
    fn into_executor(self) -> Executor<'a, DB> {
        self
    }
}

impl<'a, DB> Executor<'a, DB>
where
    DB: SqlDialect,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
{
    async fn execute_raw(&mut self, sql: &str, args: &[Value]) -> TabulaResult<DB::QueryResult> {
        self.log_args(args);
        let query = args.iter().cloned().fold(sqlx::query::<DB>(sql), DB::bind_value);
        let start = Instant::now();
        let result = match &mut self.target {
            Target::Pool(pool) => query.execute(*pool).await,
            Target::Conn(conn) => query.execute(&mut **conn).await,
        }
        .map_err(TabulaError::from)?;
        self.warn_if_slow(sql, start.elapsed());
        Ok(result)
    }

    async fn control(&mut self, statement: &'static str) -> TabulaResult<()> {
        match &mut self.target {
            Target::Pool(_) => Err(TabulaError::Unsupported(format!(
                "{statement} needs a dedicated connection, not a pool"
            ))),
            Target::Conn(conn) => {
                tracing::debug!(statement, "tabula transaction");
                sqlx::raw_sql(statement)
                    .execute(&mut **conn)
                    .await
                    .map_err(|err| TabulaError::from(err).within("transaction", "-"))?;
                Ok(())
            }
        }
    }
}

impl<'a, DB> Connection for Executor<'a, DB>
where
    DB: SqlDialect,
    for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
{
    fn dialect(&self) -> Dialect {
        DB::dialect()
    }

    async fn select(&mut self, sql: &str, args: &[Value]) -> TabulaResult<Vec<Record>> {
        self.log_args(args);
        let query = args.iter().cloned().fold(sqlx::query::<DB>(sql), DB::bind_value);
        let start = Instant::now();
        let rows = match &mut self.target {
            Target::Pool(pool) => query.fetch_all(*pool).await,
            Target::Conn(conn) => query.fetch_all(&mut **conn).await,
        }
        .map_err(TabulaError::from)?;
        self.warn_if_slow(sql, start.elapsed());

        let normalize = self.config.normalize_bytes;
        rows.iter()
            .map(|row| DB::decode_row(row, normalize).map_err(TabulaError::from))
            .collect()
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> TabulaResult<u64> {
        let result = self.execute_raw(sql, args).await?;
        Ok(DB::rows_affected(&result))
    }

    async fn insert(&mut self, sql: &str, args: &[Value], key_column: &str) -> TabulaResult<Option<Value>> {
        if DB::supports_returning() {
            let sql = format!("{sql} RETURNING {key_column}");
            let rows = self.select(&sql, args).await?;
            return Ok(rows.into_iter().next().and_then(|mut row| row.remove(key_column)));
        }
        let result = self.execute_raw(sql, args).await?;
        let id = DB::last_insert_id(&result);
        Ok((id > 0).then_some(Value::Int(id)))
    }

    async fn begin(&mut self) -> TabulaResult<()> {
        self.control("BEGIN").await
    }

    async fn commit(&mut self) -> TabulaResult<()> {
        self.control("COMMIT").await
    }

    async fn rollback(&mut self) -> TabulaResult<()> {
        self.control("ROLLBACK").await
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use sqlx::Sqlite;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> sqlx::Pool<Sqlite> {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pool_executor_selects_and_execs() {
        let pool = memory_pool().await;
        let mut db = Executor::pool(&pool);
        db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();

        let id = db
            .insert("INSERT INTO t (name) VALUES (?)", &[Value::from("a")], "id")
            .await
            .unwrap();
        assert_eq!(id, Some(Value::Int(1)));

        let rows = db.select("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::from("a"));
    }

    #[tokio::test]
    async fn pool_executor_refuses_transactions() {
        let pool = sqlx::Pool::<Sqlite>::connect_lazy("sqlite::memory:").unwrap();
        let mut db = Executor::pool(&pool);
        let err = db.begin().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn connection_executor_scopes_transactions() {
        let pool = memory_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut db = (&mut *conn).into_executor();
        db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[]).await.unwrap();

        db.begin().await.unwrap();
        db.exec("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        db.rollback().await.unwrap();

        let rows = db.select("SELECT * FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn unique_violation_maps_to_constraint() {
        let pool = memory_pool().await;
        let mut db = (&pool).into_executor();
        db.exec("CREATE TABLE t (email TEXT UNIQUE)", &[]).await.unwrap();
        db.exec("INSERT INTO t (email) VALUES (?)", &[Value::from("a@b.c")])
            .await
            .unwrap();
        let err = db
            .exec("INSERT INTO t (email) VALUES (?)", &[Value::from("a@b.c")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
    }
}
