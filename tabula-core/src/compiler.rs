//! Renders a [`Clauses`] model into SQL text plus an ordered argument list.
//!
//! Rendering is deterministic. Every `?` marker in the output has exactly
//! one argument, in the same order. Markers are generic; call
//! [`Compiled::rewrite_for`] to get the backend's parameter syntax.

use std::fmt::Write;
use std::str::FromStr;

use crate::clause::{Clauses, DatePart, Having, Join, JoinKind, Predicate, PredicateKind};
use crate::dialect::Dialect;
use crate::error::{TabulaError, TabulaResult};
use crate::value::{Record, Value};

/// Column alias every aggregate query selects into.
pub const AGGREGATE_ALIAS: &str = "aggregate";

/// Compiled statement: SQL text and the arguments for its markers.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Compiled {
    /// Rewrites markers for `dialect`. Arguments are left as they are.
    pub fn rewrite_for(self, dialect: Dialect) -> Self {
        Self {
            sql: dialect.rewrite_placeholders(&self.sql),
            args: self.args,
        }
    }
}

/// Comparison operators accepted in predicates, joins and HAVING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    NotLike,
}

impl Operator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
        }
    }
}

impl FromStr for Operator {
    type Err = TabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
        match normalized.as_str() {
            "=" | "==" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::NotEq),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Lte),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Gte),
            "like" => Ok(Operator::Like),
            "not like" => Ok(Operator::NotLike),
            _ => Err(TabulaError::Validation(format!("unsupported operator `{s}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    pub fn function(self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }

    fn expression(self, column: &str, distinct: bool, dialect: Dialect) -> String {
        let target = if distinct && column != "*" {
            format!("DISTINCT {column}")
        } else {
            column.to_owned()
        };
        let call = format!("{}({target})", self.function());
        match (self, dialect) {
            // Postgres returns NUMERIC for these, which has no lossless f64 decode.
            (Aggregate::Sum | Aggregate::Avg, Dialect::Postgres) => {
                format!("CAST({call} AS DOUBLE PRECISION) AS {AGGREGATE_ALIAS}")
            }
            _ => format!("{call} AS {AGGREGATE_ALIAS}"),
        }
    }
}

/// Rejects names that could smuggle extra SQL into the statement.
pub(crate) fn check_identifier(kind: &str, ident: &str) -> TabulaResult<()> {
    let trimmed = ident.trim();
    if trimmed.is_empty() {
        return Err(TabulaError::Validation(format!("empty {kind} name")));
    }
    if trimmed.contains(';') || trimmed.contains("--") || trimmed.contains("/*") {
        return Err(TabulaError::Validation(format!(
            "invalid {kind} name `{ident}`"
        )));
    }
    Ok(())
}

/// Compiles a SELECT for the default dialect. See [`compile_for`].
pub fn compile(clauses: &Clauses) -> TabulaResult<Compiled> {
    compile_for(clauses, Dialect::default())
}

/// Compiles a SELECT.
///
/// Clause order is fixed: SELECT, FROM, JOIN, WHERE, GROUP BY, HAVING,
/// ORDER BY, LIMIT, OFFSET. The first predicate's conjunction is dropped.
/// `dialect` only picks the date functions of `where_date` and friends;
/// markers stay `?` either way.
pub fn compile_for(clauses: &Clauses, dialect: Dialect) -> TabulaResult<Compiled> {
    check_identifier("table", &clauses.table)?;

    let mut sql = String::with_capacity(128);
    let mut args = Vec::new();

    sql.push_str("SELECT ");
    if clauses.distinct {
        sql.push_str("DISTINCT ");
    }
    if clauses.columns.is_empty() {
        sql.push('*');
    } else {
        for (i, column) in clauses.columns.iter().enumerate() {
            check_identifier("column", column)?;
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(column);
        }
    }
    let _ = write!(sql, " FROM {}", clauses.table);

    for join in &clauses.joins {
        render_join(&mut sql, join)?;
    }

    if !clauses.predicates.is_empty() {
        sql.push_str(" WHERE ");
        render_predicates(&mut sql, &mut args, &clauses.predicates, dialect)?;
    }

    if !clauses.groups.is_empty() {
        for column in &clauses.groups {
            check_identifier("group", column)?;
        }
        let _ = write!(sql, " GROUP BY {}", clauses.groups.join(", "));
    }

    if !clauses.havings.is_empty() {
        sql.push_str(" HAVING ");
        for (i, having) in clauses.havings.iter().enumerate() {
            render_having(&mut sql, &mut args, having, i == 0)?;
        }
    }

    if !clauses.orders.is_empty() {
        sql.push_str(" ORDER BY ");
        for (i, order) in clauses.orders.iter().enumerate() {
            check_identifier("order", &order.column)?;
            if i > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "{} {}", order.column, order.direction.as_sql());
        }
    }

    for (name, bound) in [("limit", clauses.limit), ("offset", clauses.offset)] {
        if bound.is_some_and(|n| i64::try_from(n).is_err()) {
            return Err(TabulaError::Validation(format!("{name} is larger than {}", i64::MAX)));
        }
    }
    if let Some(limit) = clauses.limit {
        let _ = write!(sql, " LIMIT {limit}");
    }
    if let Some(offset) = clauses.offset {
        if clauses.limit.is_none() {
            // SQLite and MySQL reject OFFSET without LIMIT.
            let _ = write!(sql, " LIMIT {}", i64::MAX);
        }
        let _ = write!(sql, " OFFSET {offset}");
    }

    Ok(Compiled { sql, args })
}

/// Compiles an aggregate over `column` (`*` for plain counts).
///
/// Counting a grouped query counts the groups through a derived table.
pub fn compile_aggregate(
    clauses: &Clauses,
    aggregate: Aggregate,
    column: &str,
    dialect: Dialect,
) -> TabulaResult<Compiled> {
    check_identifier("column", column)?;
    if aggregate == Aggregate::Count && !clauses.groups.is_empty() {
        let mut inner = clauses.clone();
        inner.orders.clear();
        inner.limit = None;
        inner.offset = None;
        let inner = compile_for(&inner, dialect)?;
        return Ok(Compiled {
            sql: format!(
                "SELECT COUNT(*) AS {AGGREGATE_ALIAS} FROM ({}) AS {AGGREGATE_ALIAS}_table",
                inner.sql
            ),
            args: inner.args,
        });
    }
    let expression = aggregate.expression(column, clauses.distinct, dialect);
    compile_for(&clauses.for_aggregate(expression), dialect)
}

/// `INSERT INTO table (a, b) VALUES (?, ?)`, columns in record order.
pub fn compile_insert(table: &str, values: &Record) -> TabulaResult<Compiled> {
    check_identifier("table", table)?;
    if values.is_empty() {
        return Ok(Compiled {
            sql: format!("INSERT INTO {table} DEFAULT VALUES"),
            args: Vec::new(),
        });
    }
    let mut columns = Vec::with_capacity(values.len());
    let mut args = Vec::with_capacity(values.len());
    for (column, value) in values {
        check_identifier("column", column)?;
        columns.push(column.as_str());
        args.push(value.clone());
    }
    let markers = vec!["?"; columns.len()].join(", ");
    Ok(Compiled {
        sql: format!("INSERT INTO {table} ({}) VALUES ({markers})", columns.join(", ")),
        args,
    })
}

/// `UPDATE table SET a = ?, b = ? WHERE key = ?`.
pub fn compile_update(
    table: &str,
    values: &Record,
    key_column: &str,
    key: &Value,
) -> TabulaResult<Compiled> {
    check_identifier("table", table)?;
    check_identifier("column", key_column)?;
    if values.is_empty() {
        return Err(TabulaError::Validation(format!(
            "update of `{table}` has no columns to set"
        )));
    }
    let mut sql = format!("UPDATE {table} SET ");
    let mut args = Vec::with_capacity(values.len() + 1);
    for (i, (column, value)) in values.iter().enumerate() {
        check_identifier("column", column)?;
        if i > 0 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "{column} = ?");
        args.push(value.clone());
    }
    let _ = write!(sql, " WHERE {key_column} = ?");
    args.push(key.clone());
    Ok(Compiled { sql, args })
}

/// `DELETE FROM table WHERE key = ?`.
pub fn compile_delete(table: &str, key_column: &str, key: &Value) -> TabulaResult<Compiled> {
    check_identifier("table", table)?;
    check_identifier("column", key_column)?;
    Ok(Compiled {
        sql: format!("DELETE FROM {table} WHERE {key_column} = ?"),
        args: vec![key.clone()],
    })
}

fn render_join(sql: &mut String, join: &Join) -> TabulaResult<()> {
    check_identifier("table", &join.table)?;
    let _ = write!(sql, " {} JOIN {}", join.kind.as_sql(), join.table);
    if join.kind != JoinKind::Cross {
        check_identifier("column", &join.left)?;
        check_identifier("column", &join.right)?;
        let operator = join.operator.parse::<Operator>()?;
        let _ = write!(sql, " ON {} {} {}", join.left, operator.as_sql(), join.right);
    }
    Ok(())
}

fn render_predicates(
    sql: &mut String,
    args: &mut Vec<Value>,
    predicates: &[Predicate],
    dialect: Dialect,
) -> TabulaResult<()> {
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            let _ = write!(sql, " {} ", predicate.boolean.as_sql());
        }
        render_predicate(sql, args, predicate, dialect)?;
    }
    Ok(())
}

fn render_predicate(sql: &mut String, args: &mut Vec<Value>, predicate: &Predicate, dialect: Dialect) -> TabulaResult<()> {
    let column = predicate.column.as_str();
    match &predicate.kind {
        PredicateKind::Nested(inner) => {
            if inner.is_empty() {
                sql.push_str("1 = 1");
                return Ok(());
            }
            sql.push('(');
            render_predicates(sql, args, inner, dialect)?;
            sql.push(')');
            return Ok(());
        }
        _ => check_identifier("column", column)?,
    }

    match &predicate.kind {
        PredicateKind::Basic { operator, value } => {
            let operator = operator.parse::<Operator>()?;
            // `col = NULL` never matches anything; use the IS form instead.
            match (operator, value) {
                (Operator::Eq, Value::Null) => {
                    let _ = write!(sql, "{column} IS NULL");
                }
                (Operator::NotEq, Value::Null) => {
                    let _ = write!(sql, "{column} IS NOT NULL");
                }
                _ => {
                    let _ = write!(sql, "{column} {} ?", operator.as_sql());
                    args.push(value.clone());
                }
            }
        }
        PredicateKind::In(values) | PredicateKind::NotIn(values) => {
            let negated = matches!(predicate.kind, PredicateKind::NotIn(_));
            if values.is_empty() {
                // Nothing is in the empty set; everything is outside it.
                sql.push_str(if negated { "1 = 1" } else { "1 = 0" });
            } else {
                let markers = vec!["?"; values.len()].join(", ");
                let keyword = if negated { "NOT IN" } else { "IN" };
                let _ = write!(sql, "{column} {keyword} ({markers})");
                args.extend(values.iter().cloned());
            }
        }
        PredicateKind::Null => {
            let _ = write!(sql, "{column} IS NULL");
        }
        PredicateKind::NotNull => {
            let _ = write!(sql, "{column} IS NOT NULL");
        }
        PredicateKind::Between(min, max) => {
            let _ = write!(sql, "{column} BETWEEN ? AND ?");
            args.push(min.clone());
            args.push(max.clone());
        }
        PredicateKind::DatePart { part, operator, value } => {
            let operator = operator.parse::<Operator>()?;
            let _ = write!(sql, "{} {} ?", date_part_expression(*part, column, dialect), operator.as_sql());
            args.push(value.clone());
        }
        PredicateKind::Nested(_) => {}
    }
    Ok(())
}

fn date_part_expression(part: DatePart, column: &str, dialect: Dialect) -> String {
    match (dialect, part) {
        (Dialect::Sqlite, DatePart::Date) => format!("date({column})"),
        (Dialect::Sqlite, DatePart::Time) => format!("time({column})"),
        (Dialect::Sqlite, DatePart::Year) => format!("CAST(strftime('%Y', {column}) AS INTEGER)"),
        (Dialect::Sqlite, DatePart::Month) => format!("CAST(strftime('%m', {column}) AS INTEGER)"),
        (Dialect::Sqlite, DatePart::Day) => format!("CAST(strftime('%d', {column}) AS INTEGER)"),
        (Dialect::Postgres, DatePart::Date) => format!("to_char({column}, 'YYYY-MM-DD')"),
        (Dialect::Postgres, DatePart::Time) => format!("to_char({column}, 'HH24:MI:SS')"),
        (Dialect::Postgres, DatePart::Year) => format!("CAST(EXTRACT(YEAR FROM {column}) AS INTEGER)"),
        (Dialect::Postgres, DatePart::Month) => format!("CAST(EXTRACT(MONTH FROM {column}) AS INTEGER)"),
        (Dialect::Postgres, DatePart::Day) => format!("CAST(EXTRACT(DAY FROM {column}) AS INTEGER)"),
        (Dialect::MySql, DatePart::Date) => format!("DATE({column})"),
        (Dialect::MySql, DatePart::Time) => format!("TIME({column})"),
        (Dialect::MySql, DatePart::Year) => format!("YEAR({column})"),
        (Dialect::MySql, DatePart::Month) => format!("MONTH({column})"),
        (Dialect::MySql, DatePart::Day) => format!("DAY({column})"),
    }
}

fn render_having(sql: &mut String, args: &mut Vec<Value>, having: &Having, first: bool) -> TabulaResult<()> {
    check_identifier("column", &having.column)?;
    let operator = having.operator.parse::<Operator>()?;
    if !first {
        let _ = write!(sql, " {} ", having.boolean.as_sql());
    }
    let _ = write!(sql, "{} {} ?", having.column, operator.as_sql());
    args.push(having.value.clone());
    Ok(())
}

/// Human-readable WHERE summary for debug logs. Values of `sensitive`
/// columns are replaced by `***`.
#[cfg(debug_assertions)]
pub(crate) fn describe_predicates(predicates: &[Predicate], sensitive: &[String]) -> String {
    let mut out = String::new();
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            let _ = write!(out, " {} ", predicate.boolean.as_sql());
        }
        let hidden = sensitive.iter().any(|s| s == &predicate.column);
        let show = |value: &Value| {
            if hidden {
                "***".to_owned()
            } else {
                value.to_log_string()
            }
        };
        let column = &predicate.column;
        match &predicate.kind {
            PredicateKind::Basic { operator, value } => {
                let _ = write!(out, "{column} {operator} {}", show(value));
            }
            PredicateKind::In(values) | PredicateKind::NotIn(values) => {
                let keyword = if matches!(predicate.kind, PredicateKind::In(_)) { "IN" } else { "NOT IN" };
                let rendered: Vec<String> = values.iter().map(show).collect();
                let _ = write!(out, "{column} {keyword} ({})", rendered.join(", "));
            }
            PredicateKind::Null => {
                let _ = write!(out, "{column} IS NULL");
            }
            PredicateKind::NotNull => {
                let _ = write!(out, "{column} IS NOT NULL");
            }
            PredicateKind::Between(min, max) => {
                let _ = write!(out, "{column} BETWEEN {} AND {}", show(min), show(max));
            }
            PredicateKind::DatePart { part, operator, value } => {
                let _ = write!(out, "{part:?}({column}) {operator} {}", show(value));
            }
            PredicateKind::Nested(inner) => {
                let _ = write!(out, "({})", describe_predicates(inner, sensitive));
            }
        }
    }
    out
}
