use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::clause::{ClauseBuilder, Clauses};
use crate::compiler::{Compiled, compile_delete, compile_for, compile_insert, compile_update};
use crate::connection::{Connection, run_exec, run_insert};
use crate::entity::Entity;
use crate::error::{TabulaError, TabulaResult};
use crate::query::{Page, Query, check_page};
use crate::schema::{KeyKind, ModelSchema};
use crate::scope::{Scope, TrashedMode};
use crate::value::{Record, Value};

/// Where a [`Model`] stands relative to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Never saved.
    Transient,
    /// In sync with the row.
    Persisted,
    /// Saved, with unsaved changes.
    Mutated,
    /// The soft-delete column is set.
    SoftDeleted,
    /// Hard deleted. The instance can no longer be saved.
    Removed,
}

/// Relation results stored on a model by [`Model::load`] or eager loading.
#[derive(Debug, Clone)]
pub enum Loaded {
    One(Option<Model>),
    Many(Vec<Model>),
}

impl Loaded {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Loaded::One(Some(model)) => model.to_json(),
            Loaded::One(None) => serde_json::Value::Null,
            Loaded::Many(models) => serde_json::Value::Array(models.iter().map(Model::to_json).collect()),
        }
    }
}

/// Attribute state of one row.
///
/// `attributes` holds raw values as stored; `original` is the snapshot taken
/// at the last load or persist. The difference between the two is the dirty
/// set that [`Model::save`] writes.
#[derive(Debug, Clone)]
pub struct Model {
    schema: Arc<ModelSchema>,
    attributes: Record,
    original: Record,
    exists: bool,
    recently_created: bool,
    removed: bool,
    relations: BTreeMap<String, Loaded>,
}

impl Model {
    /// A transient model with no attributes.
    pub fn new(schema: Arc<ModelSchema>) -> Self {
        Self {
            schema,
            attributes: Record::new(),
            original: Record::new(),
            exists: false,
            recently_created: false,
            removed: false,
            relations: BTreeMap::new(),
        }
    }

    /// A persisted model whose original snapshot is `record`.
    pub fn hydrate(schema: Arc<ModelSchema>, record: Record) -> Self {
        Self {
            original: record.clone(),
            attributes: record,
            exists: true,
            ..Self::new(schema)
        }
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    // Attributes

    /// Mass assignment. Keys the schema does not allow are dropped.
    pub fn fill<I, K, V>(&mut self, attributes: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in attributes {
            let key = key.into();
            if self.schema.is_fillable(&key) {
                self.attributes.insert(key, value.into());
            } else {
                tracing::debug!(table = %self.schema.table(), attribute = %key, "discarding guarded attribute");
            }
        }
        self
    }

    /// Mass assignment that ignores fillable and guarded.
    pub fn force_fill<I, K, V>(&mut self, attributes: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (key, value) in attributes {
            self.attributes.insert(key.into(), value.into());
        }
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The attribute as read through its cast. Missing attributes read as NULL.
    pub fn get_attribute(&self, key: &str) -> Value {
        self.attributes
            .get(key)
            .map_or(Value::Null, |raw| self.schema.read_value(key, raw))
    }

    /// Typed read through the cast.
    pub fn get<T>(&self, key: &str) -> TabulaResult<T>
    where
        T: TryFrom<Value, Error = TabulaError>,
    {
        T::try_from(self.get_attribute(key))
    }

    pub fn get_raw_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &Record {
        &self.attributes
    }

    pub fn get_original(&self, key: &str) -> Option<&Value> {
        self.original.get(key)
    }

    pub fn original(&self) -> &Record {
        &self.original
    }

    /// Attributes whose raw value differs from the original snapshot.
    pub fn get_dirty(&self) -> Record {
        self.attributes
            .iter()
            .filter(|(key, value)| self.original.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// With no columns, whether anything is dirty.
    pub fn is_dirty(&self, columns: &[&str]) -> bool {
        let dirty = self.get_dirty();
        if columns.is_empty() {
            return !dirty.is_empty();
        }
        columns.iter().any(|column| dirty.contains_key(*column))
    }

    pub fn is_clean(&self, columns: &[&str]) -> bool {
        !self.is_dirty(columns)
    }

    /// The primary key value, if set.
    pub fn key(&self) -> Option<&Value> {
        self.attributes
            .get(self.schema.key())
            .filter(|value| !value.is_null())
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn was_recently_created(&self) -> bool {
        self.recently_created
    }

    pub fn is_trashed(&self) -> bool {
        self.schema
            .soft_delete_column()
            .and_then(|column| self.attributes.get(column))
            .is_some_and(|value| !value.is_null())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.removed {
            Lifecycle::Removed
        } else if !self.exists {
            Lifecycle::Transient
        } else if self.is_trashed() {
            Lifecycle::SoftDeleted
        } else if self.is_dirty(&[]) {
            Lifecycle::Mutated
        } else {
            Lifecycle::Persisted
        }
    }

    pub fn relation(&self, name: &str) -> Option<&Loaded> {
        self.relations.get(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, loaded: Loaded) -> &mut Self {
        self.relations.insert(name.into(), loaded);
        self
    }

    /// Visible attributes, cast, plus loaded relations.
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (key, raw) in &self.attributes {
            if !self.schema.is_hidden(key) {
                map.insert(key.clone(), self.schema.read_value(key, raw).to_json());
            }
        }
        for (name, loaded) in &self.relations {
            if !self.schema.is_hidden(name) {
                map.insert(name.clone(), loaded.to_json());
            }
        }
        map
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.to_map())
    }

    fn sync_original(&mut self) {
        self.original = self.attributes.clone();
    }

    fn require_key(&self, operation: &str) -> TabulaResult<Value> {
        if !self.exists {
            return Err(TabulaError::Validation(format!(
                "cannot {operation} a `{}` model that was never saved",
                self.schema.table()
            )));
        }
        self.key().cloned().ok_or_else(|| {
            TabulaError::Validation(format!(
                "cannot {operation} a `{}` model without `{}`",
                self.schema.table(),
                self.schema.key()
            ))
        })
    }

    // Persistence

    /// INSERT when transient, UPDATE of the dirty columns otherwise.
    /// A persisted model with nothing dirty is not written.
    #[tracing::instrument(skip(self, conn), fields(table = %self.schema.table()))]
    pub async fn save<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        if self.removed {
            return Err(TabulaError::Unsupported(format!(
                "cannot save a `{}` model after it was deleted",
                self.schema.table()
            )));
        }
        if self.exists {
            self.perform_update(conn).await
        } else {
            self.perform_insert(conn).await
        }
    }

    async fn perform_insert<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        let now = Value::DateTime(Utc::now());
        if let Some(timestamps) = self.schema.timestamps() {
            for column in [&timestamps.created_at, &timestamps.updated_at] {
                if self.attributes.get(column).is_none_or(Value::is_null) {
                    self.attributes.insert(column.clone(), now.clone());
                }
            }
        }
        let key_column = self.schema.key().to_owned();
        if self.schema.key_kind() == KeyKind::Uuid && self.key().is_none() {
            let key = Value::Text(uuid::Uuid::new_v4().to_string());
            self.attributes.insert(key_column.clone(), key);
        }

        let compiled = compile_insert(self.schema.table(), &self.attributes)?;
        let generated = run_insert(conn, self.schema.table(), compiled, &key_column).await?;
        if self.key().is_none()
            && let Some(key) = generated
        {
            self.attributes.insert(key_column, key);
        }

        self.exists = true;
        self.recently_created = true;
        self.sync_original();
        tracing::debug!(key = ?self.key(), "model inserted");
        Ok(())
    }

    async fn perform_update<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        let mut dirty = self.get_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        let key_column = self.schema.key();
        if dirty.contains_key(key_column) {
            return Err(TabulaError::Validation(format!(
                "primary key `{key_column}` of `{}` cannot be changed",
                self.schema.table()
            )));
        }
        let key = self.require_key("update")?;
        if let Some(timestamps) = self.schema.timestamps()
            && !dirty.contains_key(&timestamps.updated_at)
        {
            let now = Value::DateTime(Utc::now());
            self.attributes.insert(timestamps.updated_at.clone(), now.clone());
            dirty.insert(timestamps.updated_at.clone(), now);
        }

        let compiled = compile_update(self.schema.table(), &dirty, key_column, &key)?;
        run_exec(conn, "update", self.schema.table(), compiled).await?;
        self.sync_original();
        tracing::debug!(columns = dirty.len(), "model updated");
        Ok(())
    }

    /// `fill` then `save`.
    pub async fn update<C, I, K, V>(&mut self, conn: &mut C, attributes: I) -> TabulaResult<()>
    where
        C: Connection,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.fill(attributes);
        self.save(conn).await
    }

    /// Writes only `columns`, leaving other dirty attributes unsaved.
    async fn write_columns<C: Connection>(&mut self, conn: &mut C, operation: &'static str, columns: Record) -> TabulaResult<()> {
        let key = self.require_key(operation)?;
        let compiled = compile_update(self.schema.table(), &columns, self.schema.key(), &key)?;
        run_exec(conn, operation, self.schema.table(), compiled).await?;
        for (column, value) in columns {
            self.original.insert(column.clone(), value.clone());
            self.attributes.insert(column, value);
        }
        Ok(())
    }

    fn soft_delete_columns(&self, column: &str, value: Value) -> Record {
        let mut columns = Record::new();
        if let Some(timestamps) = self.schema.timestamps() {
            columns.insert(timestamps.updated_at.clone(), Value::DateTime(Utc::now()));
        }
        columns.insert(column.to_owned(), value);
        columns
    }

    /// Soft delete when the schema has a soft-delete column, hard delete otherwise.
    #[tracing::instrument(skip(self, conn), fields(table = %self.schema.table()))]
    pub async fn delete<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        let Some(column) = self.schema.soft_delete_column().map(str::to_owned) else {
            return self.force_delete(conn).await;
        };
        let columns = self.soft_delete_columns(&column, Value::DateTime(Utc::now()));
        self.write_columns(conn, "delete", columns).await
    }

    /// Always removes the row.
    #[tracing::instrument(skip(self, conn), fields(table = %self.schema.table()))]
    pub async fn force_delete<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        let key = self.require_key("delete")?;
        let compiled = compile_delete(self.schema.table(), self.schema.key(), &key)?;
        run_exec(conn, "delete", self.schema.table(), compiled).await?;
        self.exists = false;
        self.removed = true;
        Ok(())
    }

    /// Clears the soft-delete column.
    pub async fn restore<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        let Some(column) = self.schema.soft_delete_column().map(str::to_owned) else {
            return Err(TabulaError::Unsupported(format!(
                "`{}` does not use soft deletes",
                self.schema.table()
            )));
        };
        let columns = self.soft_delete_columns(&column, Value::Null);
        self.write_columns(conn, "restore", columns).await
    }

    /// Reloads every attribute from the row, trashed or not. Unsaved changes
    /// are discarded.
    pub async fn refresh<C: Connection>(&mut self, conn: &mut C) -> TabulaResult<()> {
        let key = self.require_key("refresh")?;
        let record = Query::table(conn, self.schema.table())
            .with_key(self.schema.key())
            .find_or_fail(key)
            .await?;
        self.attributes = record;
        self.sync_original();
        Ok(())
    }

    /// Runs the named relation for this model and keeps the result.
    pub async fn load<C: Connection>(&mut self, conn: &mut C, name: &str) -> TabulaResult<&Loaded> {
        let schema = Arc::clone(&self.schema);
        let relation = schema
            .relation(name)
            .ok_or_else(|| TabulaError::NotFound(format!("relation `{name}` on `{}`", schema.table())))?;
        let loaded = relation.load(conn, self).await?;
        self.relations.insert(name.to_owned(), loaded);
        Ok(&self.relations[name])
    }
}

impl ModelSchema {
    /// Model query over this schema's table.
    pub fn query<'c, C: Connection>(self: &Arc<Self>, conn: &'c mut C) -> ModelQuery<'c, C> {
        ModelQuery::from_clauses(conn, Arc::clone(self), Clauses::new(self.table()))
    }

    /// A transient model filled with `attributes`.
    pub fn make<I, K, V>(self: &Arc<Self>, attributes: I) -> Model
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut model = Model::new(Arc::clone(self));
        model.fill(attributes);
        model
    }

    /// `make` then `save`.
    pub async fn create<C, I, K, V>(self: &Arc<Self>, conn: &mut C, attributes: I) -> TabulaResult<Model>
    where
        C: Connection,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut model = self.make(attributes);
        model.save(conn).await?;
        Ok(model)
    }

    pub fn hydrate(self: &Arc<Self>, record: Record) -> Model {
        Model::hydrate(Arc::clone(self), record)
    }
}

/// Query returning [`Model`]s, with the schema's global scopes and soft
/// delete filter applied when it runs.
pub struct ModelQuery<'c, C: Connection> {
    conn: &'c mut C,
    schema: Arc<ModelSchema>,
    clauses: Clauses,
    trashed: TrashedMode,
    without_globals: Vec<String>,
    includes: Vec<String>,
}

impl<'c, C: Connection> ClauseBuilder for ModelQuery<'c, C> {
    fn clauses_mut(&mut self) -> &mut Clauses {
        &mut self.clauses
    }
}

impl<'c, C: Connection> std::fmt::Debug for ModelQuery<'c, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelQuery")
            .field("table", &self.schema.table())
            .field("clauses", &self.clauses)
            .field("trashed", &self.trashed)
            .field("without_globals", &self.without_globals)
            .field("includes", &self.includes)
            .finish()
    }
}

impl<'c, C: Connection> ModelQuery<'c, C> {
    pub fn from_clauses(conn: &'c mut C, schema: Arc<ModelSchema>, clauses: Clauses) -> Self {
        Self {
            conn,
            schema,
            clauses,
            trashed: TrashedMode::default(),
            without_globals: Vec::new(),
            includes: Vec::with_capacity(2),
        }
    }

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    pub fn with_trashed(self) -> Self {
        self.trashed(TrashedMode::Include)
    }

    pub fn only_trashed(self) -> Self {
        self.trashed(TrashedMode::Only)
    }

    pub fn trashed(mut self, mode: TrashedMode) -> Self {
        self.trashed = mode;
        self
    }

    pub fn without_global_scope(mut self, name: impl Into<String>) -> Self {
        self.without_globals.push(name.into());
        self
    }

    pub fn without_global_scopes(mut self) -> Self {
        self.without_globals = self
            .schema
            .scopes()
            .global_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        self
    }

    /// Applies a named scope of the schema.
    pub fn scope(mut self, name: &str) -> TabulaResult<Self> {
        let clauses = std::mem::take(&mut self.clauses);
        self.clauses = self.schema.scopes().apply(name, clauses)?;
        Ok(self)
    }

    pub fn apply(mut self, scope: &Scope) -> Self {
        self.clauses = scope(std::mem::take(&mut self.clauses));
        self
    }

    /// Eager loads the named relation on every result.
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.includes.push(relation.into());
        self
    }

    /// The clauses that will run: user predicates, isolated into a group
    /// when they contain an OR, then global scopes, then the trashed filter.
    pub fn effective_clauses(&self) -> Clauses {
        let scopes = self.schema.scopes();
        let soft_delete = self
            .schema
            .soft_delete_column()
            .filter(|_| self.trashed != TrashedMode::Include);
        if !scopes.has_global(&self.without_globals) && soft_delete.is_none() {
            return self.clauses.clone();
        }

        let clauses = scopes
            .apply_global(self.clauses.clone().isolate_predicates(), &self.without_globals)
            .isolate_predicates();
        match soft_delete {
            Some(column) => {
                let column = if clauses.joins.is_empty() {
                    column.to_owned()
                } else {
                    format!("{}.{column}", self.schema.table())
                };
                if self.trashed == TrashedMode::Only {
                    clauses.where_not_null(&column)
                } else {
                    clauses.where_null(&column)
                }
            }
            None => clauses,
        }
    }

    pub fn to_sql(&self) -> TabulaResult<Compiled> {
        let dialect = self.conn.dialect();
        Ok(compile_for(&self.effective_clauses(), dialect)?.rewrite_for(dialect))
    }

    fn record_query(&mut self) -> Query<'_, C> {
        let clauses = self.effective_clauses();
        Query::from_clauses(&mut *self.conn, clauses)
            .with_key(self.schema.key())
            .with_sensitive(self.schema.hidden().to_vec())
    }

    pub async fn get(mut self) -> TabulaResult<Vec<Model>> {
        let records = self.record_query().get().await?;
        let mut models: Vec<Model> = records.into_iter().map(|r| self.schema.hydrate(r)).collect();
        for name in std::mem::take(&mut self.includes) {
            let relation = self.schema.relation(&name).ok_or_else(|| {
                TabulaError::NotFound(format!("relation `{name}` on `{}`", self.schema.table()))
            })?;
            // Loading a relation runs another model query, so this call recurses.
            Box::pin(relation.eager_load(&mut *self.conn, &name, &mut models)).await?;
        }
        Ok(models)
    }

    /// Results converted into entities.
    pub async fn get_as<T: Entity>(self) -> TabulaResult<Vec<T>> {
        self.get().await?.iter().map(T::from_model).collect()
    }

    pub async fn first(self) -> TabulaResult<Option<Model>> {
        Ok(self.limit(1).get().await?.into_iter().next())
    }

    pub async fn first_or_fail(self) -> TabulaResult<Model> {
        let table = self.schema.table().to_owned();
        self.first()
            .await?
            .ok_or_else(|| TabulaError::NotFound(format!("`{table}` record")))
    }

    pub async fn find(self, key: impl Into<Value>) -> TabulaResult<Option<Model>> {
        let column = self.schema.key().to_owned();
        self.where_eq(&column, key).first().await
    }

    pub async fn find_or_fail(self, key: impl Into<Value>) -> TabulaResult<Model> {
        let key = key.into();
        let table = self.schema.table().to_owned();
        let column = self.schema.key().to_owned();
        self.where_eq(&column, key.clone())
            .first()
            .await?
            .ok_or_else(|| TabulaError::NotFound(format!("`{table}` record with {column} = {key}")))
    }

    pub async fn count(mut self) -> TabulaResult<u64> {
        self.record_query().count().await
    }

    pub async fn count_column(mut self, column: &str) -> TabulaResult<u64> {
        self.record_query().count_column(column).await
    }

    pub async fn exists(mut self) -> TabulaResult<bool> {
        self.record_query().exists().await
    }

    pub async fn does_not_exist(mut self) -> TabulaResult<bool> {
        self.record_query().does_not_exist().await
    }

    pub async fn sum(mut self, column: &str) -> TabulaResult<f64> {
        self.record_query().sum(column).await
    }

    pub async fn avg(mut self, column: &str) -> TabulaResult<Option<f64>> {
        self.record_query().avg(column).await
    }

    pub async fn min(mut self, column: &str) -> TabulaResult<Value> {
        self.record_query().min(column).await
    }

    pub async fn max(mut self, column: &str) -> TabulaResult<Value> {
        self.record_query().max(column).await
    }

    #[tracing::instrument(skip(self), fields(table = %self.schema.table()))]
    pub async fn paginate(mut self, page: u64, per_page: u64) -> TabulaResult<Page<Model>> {
        let offset = check_page(page, per_page)?;
        let total = self.record_query().count().await?;
        let data = self
            .offset(offset)
            .limit(per_page)
            .get()
            .await?;
        Ok(Page::new(data, total, page, per_page))
    }
}
