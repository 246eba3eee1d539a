//! The clause model: an accumulated, mutable description of one query.
//!
//! Builders never render SQL. They only push predicates, joins and ordering
//! onto [`Clauses`]; the compiler turns the finished model into text.

use std::str::FromStr;

use crate::error::TabulaError;
use crate::value::Value;

/// Conjunction joining a predicate to the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Boolean {
    #[default]
    And,
    Or,
}

impl Boolean {
    pub fn as_sql(self) -> &'static str {
        match self {
            Boolean::And => "AND",
            Boolean::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateKind {
    /// `column OP ?`. The operator is validated at compile time.
    Basic { operator: String, value: Value },
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Null,
    NotNull,
    Between(Value, Value),
    /// `part(column) OP ?`, rendered with the backend's date functions.
    DatePart {
        part: DatePart,
        operator: String,
        value: Value,
    },
    /// Parenthesised group. The column of the enclosing predicate is unused.
    Nested(Vec<Predicate>),
}

/// Piece of a date/time column compared by the `where_date` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Date,
    Time,
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub boolean: Boolean,
    pub column: String,
    pub kind: PredicateKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Cross,
}

impl JoinKind {
    pub fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
            JoinKind::Cross => "CROSS",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub left: String,
    pub operator: String,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Having {
    pub boolean: Boolean,
    pub column: String,
    pub operator: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl FromStr for Direction {
    type Err = TabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(TabulaError::Validation(format!(
                "unknown sort direction `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// Everything a SELECT needs. An empty column list projects `*`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Clauses {
    pub table: String,
    pub columns: Vec<String>,
    pub distinct: bool,
    pub predicates: Vec<Predicate>,
    pub joins: Vec<Join>,
    pub groups: Vec<String>,
    pub havings: Vec<Having>,
    pub orders: Vec<Order>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Clauses {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Clone used by aggregates: the projection is replaced, ordering and
    /// paging are dropped, filters, joins and grouping survive.
    pub fn for_aggregate(&self, expression: impl Into<String>) -> Self {
        Self {
            table: self.table.clone(),
            columns: vec![expression.into()],
            distinct: false,
            predicates: self.predicates.clone(),
            joins: self.joins.clone(),
            groups: self.groups.clone(),
            havings: self.havings.clone(),
            orders: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// True when any top-level predicate is OR-joined.
    pub fn has_or_predicates(&self) -> bool {
        self.predicates
            .iter()
            .skip(1)
            .any(|p| p.boolean == Boolean::Or)
    }

    /// Wraps the current predicates in one group when they contain an OR, so
    /// that predicates appended afterwards constrain the whole chain.
    pub fn isolate_predicates(mut self) -> Self {
        if self.has_or_predicates() {
            let inner = std::mem::take(&mut self.predicates);
            self.predicates.push(Predicate {
                boolean: Boolean::And,
                column: String::new(),
                kind: PredicateKind::Nested(inner),
            });
        }
        self
    }

    fn push(&mut self, boolean: Boolean, column: &str, kind: PredicateKind) {
        self.predicates.push(Predicate {
            boolean,
            column: column.to_owned(),
            kind,
        });
    }
}

/// Chainable clause mutators shared by every query type.
///
/// Implementors only expose their [`Clauses`]; each method consumes and
/// returns the builder so calls chain.
pub trait ClauseBuilder: Sized {
    fn clauses_mut(&mut self) -> &mut Clauses;

    /// Replaces the projection.
    fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clauses_mut().columns = columns.into_iter().map(Into::into).collect();
        self
    }

    fn add_select(mut self, column: impl Into<String>) -> Self {
        self.clauses_mut().columns.push(column.into());
        self
    }

    fn distinct(mut self) -> Self {
        self.clauses_mut().distinct = true;
        self
    }

    // Basic predicates

    /// `column = value`.
    fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.where_cmp(column, "=", value)
    }

    /// `column OP value`, with any comparison operator the compiler accepts.
    fn where_cmp(mut self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        let kind = PredicateKind::Basic {
            operator: operator.to_owned(),
            value: value.into(),
        };
        self.clauses_mut().push(Boolean::And, column, kind);
        self
    }

    fn or_where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.or_where_cmp(column, "=", value)
    }

    fn or_where_cmp(mut self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        let kind = PredicateKind::Basic {
            operator: operator.to_owned(),
            value: value.into(),
        };
        self.clauses_mut().push(Boolean::Or, column, kind);
        self
    }

    fn where_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.clauses_mut()
            .push(Boolean::And, column, PredicateKind::In(values));
        self
    }

    fn or_where_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.clauses_mut()
            .push(Boolean::Or, column, PredicateKind::In(values));
        self
    }

    fn where_not_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.clauses_mut()
            .push(Boolean::And, column, PredicateKind::NotIn(values));
        self
    }

    fn where_null(mut self, column: &str) -> Self {
        self.clauses_mut()
            .push(Boolean::And, column, PredicateKind::Null);
        self
    }

    fn or_where_null(mut self, column: &str) -> Self {
        self.clauses_mut()
            .push(Boolean::Or, column, PredicateKind::Null);
        self
    }

    fn where_not_null(mut self, column: &str) -> Self {
        self.clauses_mut()
            .push(Boolean::And, column, PredicateKind::NotNull);
        self
    }

    fn where_between(mut self, column: &str, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        let kind = PredicateKind::Between(min.into(), max.into());
        self.clauses_mut().push(Boolean::And, column, kind);
        self
    }

    /// AND-joined parenthesised group built from a fresh clause set.
    fn where_group(self, build: impl FnOnce(Clauses) -> Clauses) -> Self {
        self.push_group(Boolean::And, build)
    }

    fn or_where_group(self, build: impl FnOnce(Clauses) -> Clauses) -> Self {
        self.push_group(Boolean::Or, build)
    }

    #[doc(hidden)]
    fn push_group(mut self, boolean: Boolean, build: impl FnOnce(Clauses) -> Clauses) -> Self {
        let table = self.clauses_mut().table.clone();
        let group = build(Clauses::new(table)).predicates;
        if !group.is_empty() {
            self.clauses_mut()
                .push(boolean, "", PredicateKind::Nested(group));
        }
        self
    }

    // Date parts. Dates and times compare as `YYYY-MM-DD` / `HH:MM:SS` text,
    // years, months and days as integers.

    fn where_date_part(mut self, part: DatePart, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        let kind = PredicateKind::DatePart {
            part,
            operator: operator.to_owned(),
            value: value.into(),
        };
        self.clauses_mut().push(Boolean::And, column, kind);
        self
    }

    fn where_date(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.where_date_part(DatePart::Date, column, operator, value)
    }

    fn where_time(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.where_date_part(DatePart::Time, column, operator, value)
    }

    fn where_year(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.where_date_part(DatePart::Year, column, operator, value)
    }

    fn where_month(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.where_date_part(DatePart::Month, column, operator, value)
    }

    fn where_day(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.where_date_part(DatePart::Day, column, operator, value)
    }

    // Joins

    fn join(self, table: &str, left: &str, operator: &str, right: &str) -> Self {
        self.push_join(JoinKind::Inner, table, left, operator, right)
    }

    fn left_join(self, table: &str, left: &str, operator: &str, right: &str) -> Self {
        self.push_join(JoinKind::Left, table, left, operator, right)
    }

    fn right_join(self, table: &str, left: &str, operator: &str, right: &str) -> Self {
        self.push_join(JoinKind::Right, table, left, operator, right)
    }

    fn cross_join(self, table: &str) -> Self {
        self.push_join(JoinKind::Cross, table, "", "", "")
    }

    #[doc(hidden)]
    fn push_join(mut self, kind: JoinKind, table: &str, left: &str, operator: &str, right: &str) -> Self {
        self.clauses_mut().joins.push(Join {
            kind,
            table: table.to_owned(),
            left: left.to_owned(),
            operator: operator.to_owned(),
            right: right.to_owned(),
        });
        self
    }

    // Grouping

    fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clauses_mut()
            .groups
            .extend(columns.into_iter().map(Into::into));
        self
    }

    fn having(mut self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.clauses_mut().havings.push(Having {
            boolean: Boolean::And,
            column: column.to_owned(),
            operator: operator.to_owned(),
            value: value.into(),
        });
        self
    }

    fn or_having(mut self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        self.clauses_mut().havings.push(Having {
            boolean: Boolean::Or,
            column: column.to_owned(),
            operator: operator.to_owned(),
            value: value.into(),
        });
        self
    }

    // Ordering and paging

    fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.clauses_mut().orders.push(Order {
            column: column.to_owned(),
            direction,
        });
        self
    }

    fn order_by_desc(self, column: &str) -> Self {
        self.order_by(column, Direction::Desc)
    }

    /// Newest first by `created_at`.
    fn latest(self) -> Self {
        self.latest_by("created_at")
    }

    fn latest_by(self, column: &str) -> Self {
        self.order_by(column, Direction::Desc)
    }

    /// Oldest first by `created_at`.
    fn oldest(self) -> Self {
        self.oldest_by("created_at")
    }

    fn oldest_by(self, column: &str) -> Self {
        self.order_by(column, Direction::Asc)
    }

    fn limit(mut self, limit: u64) -> Self {
        self.clauses_mut().limit = Some(limit);
        self
    }

    fn offset(mut self, offset: u64) -> Self {
        self.clauses_mut().offset = Some(offset);
        self
    }

    /// Alias of [`ClauseBuilder::limit`].
    fn take(self, count: u64) -> Self {
        self.limit(count)
    }

    /// Alias of [`ClauseBuilder::offset`].
    fn skip(self, count: u64) -> Self {
        self.offset(count)
    }

    // Conditional composition

    fn when(self, condition: bool, apply: impl FnOnce(Self) -> Self) -> Self {
        if condition { apply(self) } else { self }
    }

    fn unless(self, condition: bool, apply: impl FnOnce(Self) -> Self) -> Self {
        self.when(!condition, apply)
    }
}

impl ClauseBuilder for Clauses {
    fn clauses_mut(&mut self) -> &mut Clauses {
        self
    }
}
