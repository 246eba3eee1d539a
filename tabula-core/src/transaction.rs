//! Transaction scoping.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use sqlx::{Database, IntoArguments};

use crate::config::ExecutorConfig;
use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{TabulaError, TabulaResult};
use crate::executor::Executor;
use crate::metrics;
use crate::query::Query;

/// Runs `f` inside BEGIN/COMMIT on `conn`.
///
/// An `Err` from `f` rolls back and is returned as is. A panic inside `f`
/// rolls back and then resumes unwinding. A failed COMMIT is followed by a
/// rollback and its error is returned. A failed rollback is logged; the
/// original error wins.
///
/// Dropping the returned future part way leaves `conn` inside the open
/// transaction. Use [`Tabula::transaction`] where the future may be
/// cancelled.
///
/// ```no_run
/// # use tabula_core::{Connection, ModelSchema, TabulaResult, transaction};
/// # async fn demo<C: Connection>(db: &mut C) -> TabulaResult<()> {
/// let accounts = ModelSchema::builder("accounts").build();
/// transaction(db, |tx| {
///     Box::pin(async move {
///         accounts.create(tx, [("owner", "ada")]).await?;
///         accounts.create(tx, [("owner", "grace")]).await?;
///         Ok(())
///     })
/// })
/// .await
/// # }
/// ```
pub async fn transaction<C, F, T>(conn: &mut C, f: F) -> TabulaResult<T>
where
    C: Connection,
    F: for<'c> FnOnce(&'c mut C) -> LocalBoxFuture<'c, TabulaResult<T>>,
{
    conn.begin().await?;
    tracing::debug!("transaction started");

    let outcome = AssertUnwindSafe(f(&mut *conn)).catch_unwind().await;
    match outcome {
        Ok(Ok(value)) => match conn.commit().await {
            Ok(()) => {
                tracing::debug!("transaction committed");
                Ok(value)
            }
            Err(err) => {
                rollback_quietly(conn).await;
                tracing::debug!(error = %err, "commit failed, rolled back");
                Err(err)
            }
        },
        Ok(Err(err)) => {
            rollback_quietly(conn).await;
            tracing::debug!(error = %err, "transaction rolled back");
            Err(err)
        }
        Err(panic) => {
            rollback_quietly(conn).await;
            tracing::warn!("transaction rolled back after a panic");
            std::panic::resume_unwind(panic)
        }
    }
}

async fn rollback_quietly<C: Connection>(conn: &mut C) {
    if let Err(err) = conn.rollback().await {
        tracing::warn!(error = %err, "rollback failed");
    }
}

/// Entry points that take a pool.
#[derive(Debug, Clone, Copy)]
pub struct Tabula;

impl Tabula {
    /// Begins a transaction on a pooled connection and runs `f` in it.
    ///
    /// Commits when `f` returns `Ok`, rolls back on `Err` or panic. If the
    /// returned future is dropped before it finishes, the transaction is
    /// rolled back when its connection goes back to the pool.
    pub async fn transaction<DB, F, T>(pool: &sqlx::Pool<DB>, f: F) -> TabulaResult<T>
    where
        DB: SqlDialect,
        for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        F: for<'c, 'e> FnOnce(&'c mut Executor<'e, DB>) -> LocalBoxFuture<'c, TabulaResult<T>>,
    {
        Self::transaction_with(pool, ExecutorConfig::default(), f).await
    }

    pub async fn transaction_with<DB, F, T>(pool: &sqlx::Pool<DB>, config: ExecutorConfig, f: F) -> TabulaResult<T>
    where
        DB: SqlDialect,
        for<'c> &'c mut DB::Connection: sqlx::Executor<'c, Database = DB>,
        for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB>,
        F: for<'c, 'e> FnOnce(&'c mut Executor<'e, DB>) -> LocalBoxFuture<'c, TabulaResult<T>>,
    {
        let mut tx = pool
            .begin()
            .await
            .map_err(|err| TabulaError::from(err).within("begin", "-"))?;
        metrics::record_pool_stats(pool);
        tracing::debug!("transaction started");

        let outcome = {
            let mut executor = Executor::conn(&mut *tx).with_config(config);
            AssertUnwindSafe(f(&mut executor)).catch_unwind().await
        };
        match outcome {
            Ok(Ok(value)) => {
                // A failed commit drops `tx` still open, which rolls it back.
                tx.commit()
                    .await
                    .map_err(|err| TabulaError::from(err).within("commit", "-"))?;
                tracing::debug!("transaction committed");
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                tracing::debug!(error = %err, "transaction rolled back");
                Err(err)
            }
            Err(panic) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                tracing::warn!("transaction rolled back after a panic");
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Table-level query on any connection.
    pub fn table<C: Connection>(conn: &mut C, table: impl Into<String>) -> Query<'_, C> {
        Query::table(conn, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::RecordingConnection;
    use crate::value::Value;

    #[tokio::test]
    async fn success_commits() {
        let mut db = RecordingConnection::new();
        let value = transaction(&mut db, |tx| {
            Box::pin(async move {
                tx.exec("UPDATE t SET a = 1", &[]).await?;
                Ok(7)
            })
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(db.sql_log(), ["BEGIN", "UPDATE t SET a = 1", "COMMIT"]);
    }

    #[tokio::test]
    async fn error_rolls_back_and_propagates() {
        let mut db = RecordingConnection::new();
        let err = transaction(&mut db, |_tx| {
            Box::pin(async move { Err::<(), _>(TabulaError::Validation("nope".to_owned())) })
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "validation failed: nope");
        assert_eq!(db.sql_log(), ["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_and_reports_the_commit_error() {
        let mut db = RecordingConnection::new();
        db.fail_next_commit(TabulaError::constraint("FOREIGN KEY constraint failed"));
        let err = transaction(&mut db, |tx| {
            Box::pin(async move {
                tx.exec("INSERT INTO pets (owner_id) VALUES (?)", &[Value::Int(99)]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert_eq!(
            db.sql_log(),
            ["BEGIN", "INSERT INTO pets (owner_id) VALUES (?)", "COMMIT", "ROLLBACK"]
        );
    }

    #[tokio::test]
    async fn panic_rolls_back_then_resumes() {
        let mut db = RecordingConnection::new();
        let result = AssertUnwindSafe(transaction(&mut db, |_tx| {
            Box::pin(async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
        }))
        .catch_unwind()
        .await;
        assert!(result.is_err());
        assert_eq!(db.sql_log(), ["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn table_shortcut_builds_a_query() {
        let mut db = RecordingConnection::new();
        let rows = Tabula::table(&mut db, "users").get().await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(db.sql_log(), ["SELECT * FROM users"]);
    }
}
