use serde::Serialize;

use crate::clause::{ClauseBuilder, Clauses};
use crate::compiler::{AGGREGATE_ALIAS, Aggregate, Compiled, compile_aggregate, compile_for};
use crate::connection::{Connection, run_select};
use crate::error::{TabulaError, TabulaResult};
use crate::value::{Record, Value};

/// One page of results plus the numbers needed to render pagination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub per_page: u64,
    pub current_page: u64,
    /// At least 1, even when there are no rows.
    pub last_page: u64,
    /// 1-based position of the first row on this page; `None` for an empty page.
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: u64, current_page: u64, per_page: u64) -> Self {
        let offset = current_page.saturating_sub(1).saturating_mul(per_page);
        let last_page = total.div_ceil(per_page.max(1)).max(1);
        let len = data.len() as u64;
        let (from, to) = if len == 0 {
            (None, None)
        } else {
            (Some(offset.saturating_add(1)), Some(offset.saturating_add(len)))
        };
        Self {
            data,
            total,
            per_page,
            current_page,
            last_page,
            from,
            to,
        }
    }

    pub fn has_more_pages(&self) -> bool {
        self.current_page < self.last_page
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            per_page: self.per_page,
            current_page: self.current_page,
            last_page: self.last_page,
            from: self.from,
            to: self.to,
        }
    }
}

/// Validates a 1-based page request and returns its row offset.
pub(crate) fn check_page(page: u64, per_page: u64) -> TabulaResult<u64> {
    if page == 0 {
        return Err(TabulaError::Validation("page numbers start at 1".to_owned()));
    }
    if per_page == 0 {
        return Err(TabulaError::Validation("per_page must be positive".to_owned()));
    }
    (page - 1)
        .checked_mul(per_page)
        .filter(|offset| i64::try_from(*offset).is_ok() && i64::try_from(per_page).is_ok())
        .ok_or_else(|| TabulaError::Validation(format!("page {page} of {per_page} rows is out of range")))
}

/// Table-level query returning raw [`Record`]s.
///
/// ```no_run
/// # use tabula_core::{ClauseBuilder, Connection, Query, TabulaResult};
/// # async fn demo<C: Connection>(db: &mut C) -> TabulaResult<()> {
/// let adults = Query::table(db, "users")
///     .where_eq("status", "active")
///     .where_cmp("age", ">", 18)
///     .get()
///     .await?;
/// # Ok(()) }
/// ```
pub struct Query<'c, C: Connection> {
    conn: &'c mut C,
    clauses: Clauses,
    key: String,
    sensitive: Vec<String>,
}

impl<'c, C: Connection> ClauseBuilder for Query<'c, C> {
    fn clauses_mut(&mut self) -> &mut Clauses {
        &mut self.clauses
    }
}

impl<'c, C: Connection> std::fmt::Debug for Query<'c, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("clauses", &self.clauses)
            .field("key", &self.key)
            .finish()
    }
}

impl<'c, C: Connection> Query<'c, C> {
    pub fn table(conn: &'c mut C, table: impl Into<String>) -> Self {
        Self::from_clauses(conn, Clauses::new(table))
    }

    pub fn from_clauses(conn: &'c mut C, clauses: Clauses) -> Self {
        Self {
            conn,
            clauses,
            key: "id".to_owned(),
            sensitive: Vec::new(),
        }
    }

    /// Column used by [`Query::find`]. Defaults to `id`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Columns whose bound values are masked in debug logs.
    pub fn with_sensitive(mut self, columns: Vec<String>) -> Self {
        self.sensitive = columns;
        self
    }

    pub fn clauses(&self) -> &Clauses {
        &self.clauses
    }

    pub fn into_clauses(self) -> Clauses {
        self.clauses
    }

    /// The statement `get` would send, markers already rewritten for the connection.
    pub fn to_sql(&self) -> TabulaResult<Compiled> {
        Ok(compile_for(&self.clauses, self.conn.dialect())?.rewrite_for(self.conn.dialect()))
    }

    fn log_filters(&self, operation: &'static str) {
        // Debug builds only.
        #[cfg(debug_assertions)]
        tracing::debug!(
            operation,
            table = %self.clauses.table,
            filters = %crate::compiler::describe_predicates(&self.clauses.predicates, &self.sensitive),
            "tabula query"
        );
        #[cfg(not(debug_assertions))]
        let _ = operation;
    }

    #[tracing::instrument(skip(self), fields(table = %self.clauses.table))]
    pub async fn get(self) -> TabulaResult<Vec<Record>> {
        let compiled = compile_for(&self.clauses, self.conn.dialect())?;
        self.log_filters("select");
        run_select(self.conn, "select", &self.clauses.table, compiled).await
    }

    /// First matching row, or `None`.
    pub async fn first(self) -> TabulaResult<Option<Record>> {
        let rows = self.limit(1).get().await?;
        Ok(rows.into_iter().next())
    }

    /// First matching row; no match is a [`TabulaError::NotFound`].
    pub async fn first_or_fail(self) -> TabulaResult<Record> {
        let table = self.clauses.table.clone();
        self.first()
            .await?
            .ok_or_else(|| TabulaError::NotFound(format!("`{table}` record")))
    }

    pub async fn find(self, key: impl Into<Value>) -> TabulaResult<Option<Record>> {
        let column = self.key.clone();
        self.where_eq(&column, key).first().await
    }

    pub async fn find_or_fail(self, key: impl Into<Value>) -> TabulaResult<Record> {
        let key = key.into();
        let table = self.clauses.table.clone();
        let column = self.key.clone();
        self.where_eq(&column, key.clone())
            .first()
            .await?
            .ok_or_else(|| TabulaError::NotFound(format!("`{table}` record with {column} = {key}")))
    }

    async fn aggregate(&mut self, aggregate: Aggregate, column: &str) -> TabulaResult<Value> {
        let compiled = compile_aggregate(&self.clauses, aggregate, column, self.conn.dialect())?;
        self.log_filters("aggregate");
        let rows = run_select(&mut *self.conn, "aggregate", &self.clauses.table, compiled).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|mut row| row.remove(AGGREGATE_ALIAS))
            .unwrap_or(Value::Null))
    }

    async fn count_rows(&mut self, column: &str) -> TabulaResult<u64> {
        let value = self.aggregate(Aggregate::Count, column).await?;
        match value {
            Value::Null => Ok(0),
            other => other
                .as_i64()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| TabulaError::Validation(format!("count returned `{other}`"))),
        }
    }

    /// `COUNT(*)`. Order, limit and offset are ignored; grouped queries count groups.
    #[tracing::instrument(skip(self), fields(table = %self.clauses.table))]
    pub async fn count(mut self) -> TabulaResult<u64> {
        self.count_rows("*").await
    }

    /// `COUNT(column)`, which skips NULLs. `COUNT(DISTINCT column)` after [`ClauseBuilder::distinct`].
    pub async fn count_column(mut self, column: &str) -> TabulaResult<u64> {
        self.count_rows(column).await
    }

    pub async fn exists(mut self) -> TabulaResult<bool> {
        Ok(self.count_rows("*").await? > 0)
    }

    pub async fn does_not_exist(mut self) -> TabulaResult<bool> {
        Ok(self.count_rows("*").await? == 0)
    }

    /// Sum of `column`; zero when no rows match.
    pub async fn sum(mut self, column: &str) -> TabulaResult<f64> {
        let value = self.aggregate(Aggregate::Sum, column).await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    /// Average of `column`; `None` when no rows match.
    pub async fn avg(mut self, column: &str) -> TabulaResult<Option<f64>> {
        let value = self.aggregate(Aggregate::Avg, column).await?;
        Ok(value.as_f64())
    }

    pub async fn min(mut self, column: &str) -> TabulaResult<Value> {
        self.aggregate(Aggregate::Min, column).await
    }

    pub async fn max(mut self, column: &str) -> TabulaResult<Value> {
        self.aggregate(Aggregate::Max, column).await
    }

    /// Counts every match, then fetches rows `(page - 1) * per_page ..` of it.
    #[tracing::instrument(skip(self), fields(table = %self.clauses.table))]
    pub async fn paginate(mut self, page: u64, per_page: u64) -> TabulaResult<Page<Record>> {
        let offset = check_page(page, per_page)?;
        let total = self.count_rows("*").await?;
        let data = self
            .offset(offset)
            .limit(per_page)
            .get()
            .await?;
        Ok(Page::new(data, total, page, per_page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause::Direction;
    use crate::dialect::Dialect;
    use crate::test_utils::RecordingConnection;

    fn row(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn page_numbers_for_middle_page() {
        let page = Page::new(vec![(); 10], 25, 2, 10);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.from, Some(11));
        assert_eq!(page.to, Some(20));
        assert!(page.has_more_pages());
    }

    #[test]
    fn empty_page_has_no_bounds() {
        let page: Page<()> = Page::new(Vec::new(), 0, 1, 15);
        assert_eq!(page.last_page, 1);
        assert_eq!(page.from, None);
        assert_eq!(page.to, None);
    }

    #[tokio::test]
    async fn get_sends_rewritten_sql() {
        let mut db = RecordingConnection::with_dialect(Dialect::Postgres);
        db.push_rows(vec![row(&[("id", Value::Int(1))])]);

        let rows = Query::table(&mut db, "users")
            .where_eq("status", "active")
            .where_cmp("age", ">", 18)
            .get()
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        let statement = &db.statements()[0];
        assert_eq!(statement.sql, "SELECT * FROM users WHERE status = $1 AND age > $2");
        assert_eq!(statement.args, vec![Value::from("active"), Value::Int(18)]);
    }

    #[tokio::test]
    async fn first_or_fail_reports_not_found() {
        let mut db = RecordingConnection::new();
        let err = Query::table(&mut db, "users")
            .where_eq("id", 99)
            .first_or_fail()
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(db.statements()[0].sql, "SELECT * FROM users WHERE id = ? LIMIT 1");
    }

    #[tokio::test]
    async fn find_uses_configured_key() {
        let mut db = RecordingConnection::new();
        let _ = Query::table(&mut db, "users").with_key("uuid").find("abc").await.unwrap();
        assert_eq!(db.statements()[0].sql, "SELECT * FROM users WHERE uuid = ? LIMIT 1");
    }

    #[tokio::test]
    async fn count_ignores_order_and_paging() {
        let mut db = RecordingConnection::new();
        db.push_rows(vec![row(&[("aggregate", Value::Int(7))])]);

        let query = Query::table(&mut db, "users")
            .where_eq("active", true)
            .order_by("name", Direction::Asc)
            .limit(5);
        assert_eq!(query.count().await.unwrap(), 7);
        assert_eq!(
            db.statements()[0].sql,
            "SELECT COUNT(*) AS aggregate FROM users WHERE active = ?"
        );
    }

    #[tokio::test]
    async fn aggregates_handle_empty_tables() {
        let mut db = RecordingConnection::new();
        db.push_rows(vec![row(&[("aggregate", Value::Null)])]);
        db.push_rows(vec![row(&[("aggregate", Value::Null)])]);

        assert_eq!(Query::table(&mut db, "orders").sum("total").await.unwrap(), 0.0);
        assert_eq!(Query::table(&mut db, "orders").avg("total").await.unwrap(), None);
    }

    #[tokio::test]
    async fn paginate_counts_then_fetches_the_window() {
        let mut db = RecordingConnection::new();
        db.push_rows(vec![row(&[("aggregate", Value::Int(25))])]);
        db.push_rows((0..10).map(|i| row(&[("id", Value::Int(10 + i))])).collect());

        let page = Query::table(&mut db, "users")
            .order_by("id", Direction::Asc)
            .paginate(2, 10)
            .await
            .unwrap();

        assert_eq!(page.data.len(), 10);
        assert_eq!(page.total, 25);
        assert_eq!(page.last_page, 3);
        assert_eq!(page.from, Some(11));
        assert_eq!(page.to, Some(20));
        assert_eq!(
            db.statements()[1].sql,
            "SELECT * FROM users ORDER BY id ASC LIMIT 10 OFFSET 10"
        );
    }

    #[tokio::test]
    async fn paginate_rejects_page_zero_before_io() {
        let mut db = RecordingConnection::new();
        let err = Query::table(&mut db, "users").paginate(0, 10).await.unwrap_err();
        assert!(matches!(err, TabulaError::Validation(_)));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn paginate_rejects_offsets_past_i64_before_io() {
        let mut db = RecordingConnection::new();
        let err = Query::table(&mut db, "users")
            .paginate(u64::MAX / 2, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, TabulaError::Validation(_)));

        let err = Query::table(&mut db, "users")
            .paginate(2, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, TabulaError::Validation(_)));
        assert!(db.statements().is_empty());
    }

    #[test]
    fn page_positions_saturate_instead_of_overflowing() {
        let page = Page::new(vec![1], 1, u64::MAX, u64::MAX);
        assert_eq!(page.from, Some(u64::MAX));
        assert_eq!(page.to, Some(u64::MAX));
    }

    #[tokio::test]
    async fn adapter_failures_carry_operation_and_table() {
        let mut db = RecordingConnection::new();
        db.push_select_error(TabulaError::connection("connection reset"));
        let err = Query::table(&mut db, "users").get().await.unwrap_err();
        assert_eq!(err.to_string(), "select on `users` failed: connection reset");
    }
}
