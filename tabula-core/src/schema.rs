//! Code-first model configuration.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::clause::Clauses;
use crate::error::TabulaError;
use crate::relation::Relation;
use crate::scope::{Scope, ScopeRegistry, scope};
use crate::value::Value;

/// Read-time conversion of a stored attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cast {
    String,
    Int,
    Float,
    Bool,
    DateTime,
}

impl Cast {
    /// Converts `raw` for reading. NULL stays NULL; values that cannot be
    /// converted also read as NULL. `raw` itself is never modified.
    pub fn apply(self, raw: &Value) -> Value {
        if raw.is_null() {
            return Value::Null;
        }
        match self {
            Cast::String => Value::Text(raw.to_string()),
            Cast::Int => raw
                .as_i64()
                .or_else(|| raw.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map_or(Value::Null, Value::Int),
            Cast::Float => raw.as_f64().map_or(Value::Null, Value::Float),
            Cast::Bool => raw.as_bool().map_or(Value::Null, Value::Bool),
            Cast::DateTime => raw.as_datetime().map_or(Value::Null, Value::DateTime),
        }
    }
}

impl FromStr for Cast {
    type Err = TabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Ok(Cast::String),
            "int" | "integer" => Ok(Cast::Int),
            "float" | "double" | "real" => Ok(Cast::Float),
            "bool" | "boolean" => Ok(Cast::Bool),
            "datetime" | "date" | "timestamp" => Ok(Cast::DateTime),
            other => Err(TabulaError::Validation(format!("unknown cast `{other}`"))),
        }
    }
}

/// Who produces primary key values for new rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyKind {
    /// The database assigns the key; it is read back after INSERT.
    #[default]
    Incrementing,
    /// A v4 UUID is generated in process when the key is absent.
    Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: String,
    pub updated_at: String,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            created_at: "created_at".to_owned(),
            updated_at: "updated_at".to_owned(),
        }
    }
}

/// Table mapping, attribute rules, scopes and relations of one model.
///
/// Built once through [`ModelSchema::builder`] and shared behind an `Arc`:
///
/// ```
/// use tabula_core::{Cast, ModelSchema};
///
/// let users = ModelSchema::builder("users")
///     .fillable(["name", "email"])
///     .hidden(["password"])
///     .cast("age", Cast::Int)
///     .soft_deletes()
///     .build();
/// assert!(users.is_fillable("name"));
/// assert!(!users.is_fillable("admin"));
/// ```
#[derive(Debug, Clone)]
pub struct ModelSchema {
    table: String,
    key: String,
    key_kind: KeyKind,
    fillable: Vec<String>,
    guarded: Vec<String>,
    hidden: Vec<String>,
    visible: Vec<String>,
    casts: BTreeMap<String, Cast>,
    timestamps: Option<Timestamps>,
    soft_delete: Option<String>,
    morph_class: Option<String>,
    scopes: ScopeRegistry,
    relations: BTreeMap<String, Relation>,
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl ModelSchema {
    /// Key `id` (incrementing), `created_at`/`updated_at` timestamps, no soft
    /// deletes, every attribute mass-assignable.
    pub fn builder(table: impl Into<String>) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            schema: Self {
                table: table.into(),
                key: "id".to_owned(),
                key_kind: KeyKind::Incrementing,
                fillable: Vec::new(),
                guarded: Vec::new(),
                hidden: Vec::new(),
                visible: Vec::new(),
                casts: BTreeMap::new(),
                timestamps: Some(Timestamps::default()),
                soft_delete: None,
                morph_class: None,
                scopes: ScopeRegistry::new(),
                relations: BTreeMap::new(),
            },
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn timestamps(&self) -> Option<&Timestamps> {
        self.timestamps.as_ref()
    }

    pub fn soft_delete_column(&self) -> Option<&str> {
        self.soft_delete.as_deref()
    }

    /// Type tag stored in polymorphic `*_type` columns.
    pub fn morph_class(&self) -> &str {
        self.morph_class.as_deref().unwrap_or(&self.table)
    }

    pub fn hidden(&self) -> &[String] {
        &self.hidden
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    pub fn relation_names(&self) -> Vec<&str> {
        self.relations.keys().map(String::as_str).collect()
    }

    pub fn cast_for(&self, column: &str) -> Option<Cast> {
        self.casts.get(column).copied()
    }

    /// Fillable, when set, is the only authority; otherwise anything not guarded.
    pub fn is_fillable(&self, column: &str) -> bool {
        if !self.fillable.is_empty() {
            return self.fillable.iter().any(|c| c == column);
        }
        !self.guarded.iter().any(|c| c == column || c == "*")
    }

    /// Visible, when set, is the only authority; otherwise the hidden list.
    pub fn is_hidden(&self, column: &str) -> bool {
        if !self.visible.is_empty() {
            return !self.visible.iter().any(|c| c == column);
        }
        self.hidden.iter().any(|c| c == column)
    }

    /// Read-side value of `column`, cast when a cast is declared.
    pub fn read_value(&self, column: &str, raw: &Value) -> Value {
        match self.cast_for(column) {
            Some(cast) => cast.apply(raw),
            None => raw.clone(),
        }
    }
}

/// Chainable configuration for a [`ModelSchema`].
#[derive(Debug, Clone)]
pub struct ModelSchemaBuilder {
    schema: ModelSchema,
}

impl ModelSchemaBuilder {
    pub fn build(self) -> Arc<ModelSchema> {
        Arc::new(self.schema)
    }

    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.schema.key = key.into();
        self
    }

    pub fn key_kind(mut self, kind: KeyKind) -> Self {
        self.schema.key_kind = kind;
        self
    }

    /// Shorthand for `key_kind(KeyKind::Uuid)`.
    pub fn uuid_keys(self) -> Self {
        self.key_kind(KeyKind::Uuid)
    }

    /// When non-empty, only these attributes can be mass assigned.
    pub fn fillable<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.fillable = strings(columns);
        self
    }

    /// Consulted only while `fillable` is empty. `"*"` guards everything.
    pub fn guarded<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.guarded = strings(columns);
        self
    }

    pub fn hidden<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.hidden = strings(columns);
        self
    }

    /// When non-empty, serialization shows only these attributes.
    pub fn visible<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema.visible = strings(columns);
        self
    }

    pub fn cast(mut self, column: impl Into<String>, cast: Cast) -> Self {
        self.schema.casts.insert(column.into(), cast);
        self
    }

    pub fn timestamps(mut self, created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        self.schema.timestamps = Some(Timestamps {
            created_at: created_at.into(),
            updated_at: updated_at.into(),
        });
        self
    }

    pub fn without_timestamps(mut self) -> Self {
        self.schema.timestamps = None;
        self
    }

    /// Soft deletes through `deleted_at`.
    pub fn soft_deletes(self) -> Self {
        self.soft_delete_column("deleted_at")
    }

    pub fn soft_delete_column(mut self, column: impl Into<String>) -> Self {
        self.schema.soft_delete = Some(column.into());
        self
    }

    /// Defaults to the table name.
    pub fn morph_class(mut self, class: impl Into<String>) -> Self {
        self.schema.morph_class = Some(class.into());
        self
    }

    pub fn scope<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Clauses) -> Clauses + Send + Sync + 'static,
    {
        self.schema.scopes.register(name, scope(f));
        self
    }

    /// Registers a prebuilt scope, e.g. one from the [`crate::scope`] library.
    pub fn named_scope(mut self, name: impl Into<String>, scope: Scope) -> Self {
        self.schema.scopes.register(name, scope);
        self
    }

    pub fn global_scope<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Clauses) -> Clauses + Send + Sync + 'static,
    {
        self.schema.scopes.register_global(name, scope(f));
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.schema.relations.insert(name.into(), relation);
        self
    }
}
