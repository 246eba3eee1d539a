use std::time::Instant;

use crate::compiler::Compiled;
use crate::dialect::Dialect;
use crate::error::TabulaResult;
use crate::metrics;
use crate::value::{Record, Value};

/// A live database session that can run compiled statements.
///
/// SQL handed to these methods is already rewritten for [`Connection::dialect`].
/// The sqlx-backed [`Executor`](crate::executor::Executor) is the production
/// implementation; [`RecordingConnection`](crate::test_utils::RecordingConnection)
/// scripts results for tests.
#[allow(async_fn_in_trait)]
pub trait Connection {
    /// Dialect used to rewrite placeholders before a statement is sent.
    fn dialect(&self) -> Dialect;

    /// Runs a query and returns its rows in order.
    async fn select(&mut self, sql: &str, args: &[Value]) -> TabulaResult<Vec<Record>>;

    /// Runs a statement and returns the number of affected rows.
    async fn exec(&mut self, sql: &str, args: &[Value]) -> TabulaResult<u64>;

    /// Runs an INSERT and returns the key generated by the backend, if any.
    async fn insert(&mut self, sql: &str, args: &[Value], key_column: &str) -> TabulaResult<Option<Value>> {
        let _ = key_column;
        self.exec(sql, args).await?;
        Ok(None)
    }

    async fn begin(&mut self) -> TabulaResult<()>;
    async fn commit(&mut self) -> TabulaResult<()>;
    async fn rollback(&mut self) -> TabulaResult<()>;
}

impl<C: Connection> Connection for &mut C {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    async fn select(&mut self, sql: &str, args: &[Value]) -> TabulaResult<Vec<Record>> {
        (**self).select(sql, args).await
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> TabulaResult<u64> {
        (**self).exec(sql, args).await
    }

    async fn insert(&mut self, sql: &str, args: &[Value], key_column: &str) -> TabulaResult<Option<Value>> {
        (**self).insert(sql, args, key_column).await
    }

    async fn begin(&mut self) -> TabulaResult<()> {
        (**self).begin().await
    }

    async fn commit(&mut self) -> TabulaResult<()> {
        (**self).commit().await
    }

    async fn rollback(&mut self) -> TabulaResult<()> {
        (**self).rollback().await
    }
}

// Shared plumbing for every statement the crate sends: dialect rewrite,
// debug log, metrics, and operation/table context on failure.

fn prepare<C: Connection>(conn: &C, operation: &'static str, table: &str, compiled: Compiled) -> Compiled {
    let compiled = compiled.rewrite_for(conn.dialect());
    tracing::debug!(
        operation,
        table,
        sql = %compiled.sql,
        args = compiled.args.len(),
        "tabula statement"
    );
    compiled
}

pub(crate) async fn run_select<C: Connection>(
    conn: &mut C,
    operation: &'static str,
    table: &str,
    compiled: Compiled,
) -> TabulaResult<Vec<Record>> {
    let compiled = prepare(conn, operation, table, compiled);
    let start = Instant::now();
    let rows = conn
        .select(&compiled.sql, &compiled.args)
        .await
        .map_err(|err| err.within(operation, table))?;
    metrics::record_query(operation, table, start.elapsed());
    Ok(rows)
}

pub(crate) async fn run_exec<C: Connection>(
    conn: &mut C,
    operation: &'static str,
    table: &str,
    compiled: Compiled,
) -> TabulaResult<u64> {
    let compiled = prepare(conn, operation, table, compiled);
    let start = Instant::now();
    let affected = conn
        .exec(&compiled.sql, &compiled.args)
        .await
        .map_err(|err| err.within(operation, table))?;
    metrics::record_query(operation, table, start.elapsed());
    Ok(affected)
}

pub(crate) async fn run_insert<C: Connection>(
    conn: &mut C,
    table: &str,
    compiled: Compiled,
    key_column: &str,
) -> TabulaResult<Option<Value>> {
    let compiled = prepare(conn, "insert", table, compiled);
    let start = Instant::now();
    let generated = conn
        .insert(&compiled.sql, &compiled.args, key_column)
        .await
        .map_err(|err| err.within("insert", table))?;
    metrics::record_query("insert", table, start.elapsed());
    Ok(generated)
}
