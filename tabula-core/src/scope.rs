//! Reusable clause transforms.
//!
//! A [`Scope`] takes a [`Clauses`] and returns it with more constraints. Models
//! register named scopes (applied on request) and global scopes (applied to
//! every query of the model, in registration order).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clause::{ClauseBuilder, Clauses, Direction};
use crate::error::{TabulaError, TabulaResult};
use crate::value::{Record, Value};

pub type Scope = Arc<dyn Fn(Clauses) -> Clauses + Send + Sync>;

/// Wraps a closure as a [`Scope`].
pub fn scope<F>(f: F) -> Scope
where
    F: Fn(Clauses) -> Clauses + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How soft-deleted rows are treated by a model query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrashedMode {
    /// Hide soft-deleted rows.
    #[default]
    Exclude,
    /// Show every row.
    Include,
    /// Show only soft-deleted rows.
    Only,
}

#[derive(Clone, Default)]
pub struct ScopeRegistry {
    named: BTreeMap<String, Scope>,
    global: Vec<(String, Scope)>,
}

impl std::fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .field(
                "global",
                &self.global.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a named scope.
    pub fn register(&mut self, name: impl Into<String>, scope: Scope) {
        self.named.insert(name.into(), scope);
    }

    /// Appends a global scope. Re-registering a name replaces it in place.
    pub fn register_global(&mut self, name: impl Into<String>, scope: Scope) {
        let name = name.into();
        match self.global.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = scope,
            None => self.global.push((name, scope)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Scope> {
        self.named.get(name)
    }

    /// Applies a named scope; an unknown name is [`TabulaError::NotFound`].
    pub fn apply(&self, name: &str, clauses: Clauses) -> TabulaResult<Clauses> {
        let scope = self
            .named
            .get(name)
            .ok_or_else(|| TabulaError::NotFound(format!("scope `{name}`")))?;
        Ok(scope(clauses))
    }

    /// Applies every global scope not listed in `skip`, in registration order.
    pub fn apply_global(&self, clauses: Clauses, skip: &[String]) -> Clauses {
        self.global
            .iter()
            .filter(|(name, _)| !skip.contains(name))
            .fold(clauses, |clauses, (_, scope)| scope(clauses))
    }

    pub fn has_global(&self, skip: &[String]) -> bool {
        self.global.iter().any(|(name, _)| !skip.contains(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    /// Named scopes, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.named.keys().map(String::as_str).collect()
    }

    pub fn global_names(&self) -> Vec<&str> {
        self.global.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let named = self.named.remove(name).is_some();
        let before = self.global.len();
        self.global.retain(|(existing, _)| existing != name);
        named || self.global.len() != before
    }

    pub fn clear(&mut self) {
        self.named.clear();
        self.global.clear();
    }
}

// Scope library

/// Case-insensitive substring match over `columns`, OR-ed inside one group.
/// An empty term leaves the query untouched.
pub fn search(term: &str, columns: &[&str]) -> Scope {
    let pattern = format!("%{}%", term.to_lowercase());
    let columns: Vec<String> = columns.iter().map(|c| format!("LOWER({c})")).collect();
    let empty = term.trim().is_empty();
    scope(move |clauses| {
        if empty || columns.is_empty() {
            return clauses;
        }
        let pattern = pattern.clone();
        let columns = columns.clone();
        clauses.where_group(move |group| {
            columns.iter().fold(group, |group, column| {
                group.or_where_cmp(column, "like", pattern.as_str())
            })
        })
    })
}

/// Rows whose `column` is within the last `days` days.
///
/// A window reaching past the range `chrono` can represent adds no filter.
pub fn within_days(days: i64, column: &str) -> Scope {
    let column = column.to_owned();
    scope(move |clauses| {
        match Duration::try_days(days).and_then(|window| Utc::now().checked_sub_signed(window)) {
            Some(since) => clauses.where_cmp(&column, ">=", since),
            None => clauses,
        }
    })
}

pub fn between_dates(start: DateTime<Utc>, end: DateTime<Utc>, column: &str) -> Scope {
    let column = column.to_owned();
    scope(move |clauses| clauses.where_between(&column, start, end))
}

/// One equality per entry; NULL and empty-text values are skipped.
pub fn filter_map(filters: Record) -> Scope {
    scope(move |clauses| {
        filters.iter().fold(clauses, |clauses, (column, value)| match value {
            Value::Null => clauses,
            Value::Text(text) if text.is_empty() => clauses,
            value => clauses.where_eq(column, value.clone()),
        })
    })
}

pub fn order(column: &str, direction: Direction) -> Scope {
    let column = column.to_owned();
    scope(move |clauses| clauses.order_by(&column, direction))
}

/// Limit/offset window for a 1-based page. Page 0 is treated as page 1.
///
/// Both ends are capped at `i64::MAX`, the largest window a database accepts.
pub fn paginate(page: u64, per_page: u64) -> Scope {
    const MAX_ROWS: u64 = i64::MAX as u64;
    scope(move |clauses| {
        clauses
            .offset(page.saturating_sub(1).saturating_mul(per_page).min(MAX_ROWS))
            .limit(per_page.min(MAX_ROWS))
    })
}

/// Applies `scopes` left to right.
pub fn chain(scopes: Vec<Scope>) -> Scope {
    scope(move |clauses| scopes.iter().fold(clauses, |clauses, s| s(clauses)))
}

pub fn when(condition: bool, inner: Scope) -> Scope {
    scope(move |clauses| if condition { inner(clauses) } else { clauses })
}

pub fn unless(condition: bool, inner: Scope) -> Scope {
    when(!condition, inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn active() -> Scope {
        scope(|c| c.where_eq("active", true))
    }

    #[test]
    fn within_days_out_of_range_adds_no_filter() {
        for days in [i64::MAX, i64::MIN] {
            let clauses = within_days(days, "created_at")(Clauses::new("posts"));
            assert_eq!(compile(&clauses).unwrap().sql, "SELECT * FROM posts");
        }
        let recent = within_days(7, "created_at")(Clauses::new("posts"));
        assert_eq!(compile(&recent).unwrap().sql, "SELECT * FROM posts WHERE created_at >= ?");
    }

    #[test]
    fn huge_pages_are_capped() {
        let clauses = paginate(u64::MAX, 10)(Clauses::new("posts"));
        assert_eq!(clauses.offset, Some(i64::MAX as u64));
        assert_eq!(clauses.limit, Some(10));
        assert!(compile(&clauses).is_ok());

        let clauses = paginate(3, 25)(Clauses::new("posts"));
        assert_eq!((clauses.offset, clauses.limit), (Some(50), Some(25)));
    }

    #[test]
    fn unknown_named_scope_is_not_found() {
        let registry = ScopeRegistry::new();
        let err = registry.apply("missing", Clauses::new("users")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn globals_apply_in_registration_order() {
        let mut registry = ScopeRegistry::new();
        registry.register_global("tenant", scope(|c| c.where_eq("tenant_id", 1)));
        registry.register_global("active", active());

        let clauses = registry.apply_global(Clauses::new("users"), &[]);
        let compiled = compile(&clauses).unwrap();
        assert_eq!(compiled.sql, "SELECT * FROM users WHERE tenant_id = ? AND active = ?");

        let skipped = registry.apply_global(Clauses::new("users"), &["tenant".to_owned()]);
        assert_eq!(compile(&skipped).unwrap().sql, "SELECT * FROM users WHERE active = ?");
    }

    #[test]
    fn registry_bookkeeping() {
        let mut registry = ScopeRegistry::new();
        registry.register("b", active());
        registry.register("a", active());
        assert_eq!(registry.names(), ["a", "b"]);
        assert!(registry.exists("a"));
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        registry.clear();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn search_groups_its_or_chain() {
        let clauses = search("Ada", &["name", "email"])(Clauses::new("users").where_eq("active", true));
        let compiled = compile(&clauses).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT * FROM users WHERE active = ? AND (LOWER(name) LIKE ? OR LOWER(email) LIKE ?)"
        );
        assert_eq!(compiled.args[1], Value::from("%ada%"));
    }

    #[test]
    fn empty_search_is_a_no_op() {
        let clauses = search("  ", &["name"])(Clauses::new("users"));
        assert!(clauses.predicates.is_empty());
    }

    #[test]
    fn filter_map_skips_blank_values() {
        let mut filters = Record::new();
        filters.insert("status".to_owned(), Value::from("open"));
        filters.insert("owner".to_owned(), Value::Null);
        filters.insert("tag".to_owned(), Value::from(""));
        let clauses = filter_map(filters)(Clauses::new("tickets"));
        assert_eq!(compile(&clauses).unwrap().sql, "SELECT * FROM tickets WHERE status = ?");
    }

    #[test]
    fn chain_and_conditionals_compose() {
        let combined = chain(vec![
            when(true, active()),
            unless(true, scope(|c| c.where_eq("never", 1))),
            paginate(3, 20),
            order("id", Direction::Desc),
        ]);
        let compiled = compile(&combined(Clauses::new("users"))).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT * FROM users WHERE active = ? ORDER BY id DESC LIMIT 20 OFFSET 40"
        );
    }
}
