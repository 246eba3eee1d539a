//! Relationship descriptors and their resolution into clause sets.
//!
//! A [`Relation`] only describes keys. Resolving it against a loaded owner
//! binds the owner's actual key values into a query on the related table.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clause::{ClauseBuilder, Clauses, Direction};
use crate::connection::Connection;
use crate::error::{TabulaError, TabulaResult};
use crate::model::{Loaded, Model, ModelQuery};
use crate::schema::ModelSchema;
use crate::scope::{Scope, scope};
use crate::value::Value;

/// The related side of a relation.
///
/// Use [`Related::Lazy`] when two schemas point at each other: a schema can
/// only embed another one that already exists.
#[derive(Clone)]
pub enum Related {
    Schema(Arc<ModelSchema>),
    Lazy(fn() -> Arc<ModelSchema>),
}

impl Related {
    /// Resolves through the entity's cached schema on first use.
    pub fn of<T: crate::entity::Entity>() -> Self {
        Related::Lazy(T::model_schema)
    }

    pub fn schema(&self) -> Arc<ModelSchema> {
        match self {
            Related::Schema(schema) => Arc::clone(schema),
            Related::Lazy(build) => build(),
        }
    }
}

impl std::fmt::Debug for Related {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Related::Schema(schema) => write!(f, "Related({})", schema.table()),
            Related::Lazy(_) => f.write_str("Related(<lazy>)"),
        }
    }
}

impl From<Arc<ModelSchema>> for Related {
    fn from(schema: Arc<ModelSchema>) -> Self {
        Related::Schema(schema)
    }
}

impl From<&Arc<ModelSchema>> for Related {
    fn from(schema: &Arc<ModelSchema>) -> Self {
        Related::Schema(Arc::clone(schema))
    }
}

impl From<fn() -> Arc<ModelSchema>> for Related {
    fn from(build: fn() -> Arc<ModelSchema>) -> Self {
        Related::Lazy(build)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
    BelongsToMany,
    HasOneThrough,
    HasManyThrough,
    MorphOne,
    MorphMany,
    MorphTo,
}

impl RelationKind {
    /// Kinds that load at most one related model.
    pub fn is_single(self) -> bool {
        matches!(
            self,
            RelationKind::HasOne
                | RelationKind::BelongsTo
                | RelationKind::HasOneThrough
                | RelationKind::MorphOne
                | RelationKind::MorphTo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
            RelationKind::BelongsTo => "belongs_to",
            RelationKind::BelongsToMany => "belongs_to_many",
            RelationKind::HasOneThrough => "has_one_through",
            RelationKind::HasManyThrough => "has_many_through",
            RelationKind::MorphOne => "morph_one",
            RelationKind::MorphMany => "morph_many",
            RelationKind::MorphTo => "morph_to",
        }
    }
}

/// `{table}_id`, the default foreign key pointing at `table`.
pub fn default_foreign_key(table: &str) -> String {
    format!("{table}_id")
}

/// Both table names sorted and joined with `_`.
pub fn pivot_table_name(a: &str, b: &str) -> String {
    if a > b {
        format!("{b}_{a}")
    } else {
        format!("{a}_{b}")
    }
}

/// Keys and constraints of one relationship.
///
/// ```
/// use tabula_core::{ModelSchema, Relation};
///
/// let users = ModelSchema::builder("users").build();
/// let posts = ModelSchema::builder("posts")
///     .relation("author", Relation::belongs_to(&users, "user_id"))
///     .build();
/// assert!(posts.relation("author").is_some());
/// ```
#[derive(Clone)]
pub struct Relation {
    kind: RelationKind,
    related: Option<Related>,
    foreign_key: Option<String>,
    local_key: Option<String>,
    owner_key: Option<String>,
    pivot_table: Option<String>,
    foreign_pivot_key: Option<String>,
    related_pivot_key: Option<String>,
    through_table: Option<String>,
    first_key: String,
    second_key: String,
    through_key: String,
    morph_type: String,
    morph_id: String,
    morph_map: BTreeMap<String, Related>,
    constraints: Vec<Scope>,
}

impl std::fmt::Debug for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("kind", &self.kind)
            .field("related", &self.related)
            .field("foreign_key", &self.foreign_key)
            .field("pivot_table", &self.pivot_table)
            .field("through_table", &self.through_table)
            .field("morph_type", &self.morph_type)
            .field("constraints", &self.constraints.len())
            .finish()
    }
}

impl Relation {
    fn bare(kind: RelationKind, related: Option<Related>) -> Self {
        Self {
            kind,
            related,
            foreign_key: None,
            local_key: None,
            owner_key: None,
            pivot_table: None,
            foreign_pivot_key: None,
            related_pivot_key: None,
            through_table: None,
            first_key: String::new(),
            second_key: String::new(),
            through_key: "id".to_owned(),
            morph_type: String::new(),
            morph_id: String::new(),
            morph_map: BTreeMap::new(),
            constraints: Vec::new(),
        }
    }

    /// Related rows point at the owner through `{owner_table}_id` unless
    /// [`Relation::foreign_key`] says otherwise.
    pub fn has_one(related: impl Into<Related>) -> Self {
        Self::bare(RelationKind::HasOne, Some(related.into()))
    }

    pub fn has_many(related: impl Into<Related>) -> Self {
        Self::bare(RelationKind::HasMany, Some(related.into()))
    }

    /// The owner holds `foreign_key`, matched against the related primary key.
    pub fn belongs_to(related: impl Into<Related>, foreign_key: impl Into<String>) -> Self {
        let mut relation = Self::bare(RelationKind::BelongsTo, Some(related.into()));
        relation.foreign_key = Some(foreign_key.into());
        relation
    }

    /// Pivot table and keys default to the sorted table names and `{table}_id`.
    pub fn belongs_to_many(related: impl Into<Related>) -> Self {
        Self::bare(RelationKind::BelongsToMany, Some(related.into()))
    }

    /// `first_key` lives on the through table and points at the owner;
    /// `second_key` lives on the related table and points at the through table.
    pub fn has_one_through(
        related: impl Into<Related>,
        through: impl Into<String>,
        first_key: impl Into<String>,
        second_key: impl Into<String>,
    ) -> Self {
        Self::through(RelationKind::HasOneThrough, related.into(), through.into(), first_key.into(), second_key.into())
    }

    pub fn has_many_through(
        related: impl Into<Related>,
        through: impl Into<String>,
        first_key: impl Into<String>,
        second_key: impl Into<String>,
    ) -> Self {
        Self::through(RelationKind::HasManyThrough, related.into(), through.into(), first_key.into(), second_key.into())
    }

    fn through(kind: RelationKind, related: Related, through: String, first_key: String, second_key: String) -> Self {
        let mut relation = Self::bare(kind, Some(related));
        relation.through_table = Some(through);
        relation.first_key = first_key;
        relation.second_key = second_key;
        relation
    }

    /// Related rows carry `{name}_type` and `{name}_id` columns.
    pub fn morph_one(related: impl Into<Related>, name: &str) -> Self {
        Self::bare(RelationKind::MorphOne, Some(related.into())).morph_columns(name)
    }

    pub fn morph_many(related: impl Into<Related>, name: &str) -> Self {
        Self::bare(RelationKind::MorphMany, Some(related.into())).morph_columns(name)
    }

    /// The owner carries `{name}_type` and `{name}_id`. Each type tag must be
    /// registered with [`Relation::map_type`].
    pub fn morph_to(name: &str) -> Self {
        Self::bare(RelationKind::MorphTo, None).morph_columns(name)
    }

    fn morph_columns(mut self, name: &str) -> Self {
        self.morph_type = format!("{name}_type");
        self.morph_id = format!("{name}_id");
        self
    }

    pub fn map_type(mut self, tag: impl Into<String>, related: impl Into<Related>) -> Self {
        self.morph_map.insert(tag.into(), related.into());
        self
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    /// Owner column matched by has-* and pivot relations. Defaults to the owner key.
    pub fn local_key(mut self, column: impl Into<String>) -> Self {
        self.local_key = Some(column.into());
        self
    }

    /// Related column matched by a belongs-to. Defaults to the related key.
    pub fn owner_key(mut self, column: impl Into<String>) -> Self {
        self.owner_key = Some(column.into());
        self
    }

    pub fn pivot(
        mut self,
        table: impl Into<String>,
        foreign_pivot_key: impl Into<String>,
        related_pivot_key: impl Into<String>,
    ) -> Self {
        self.pivot_table = Some(table.into());
        self.foreign_pivot_key = Some(foreign_pivot_key.into());
        self.related_pivot_key = Some(related_pivot_key.into());
        self
    }

    /// Through-table column joined against `second_key`. Defaults to `id`.
    pub fn through_key(mut self, column: impl Into<String>) -> Self {
        self.through_key = column.into();
        self
    }

    // Constraints, applied after the structural filters in this order.

    pub fn constrain<F>(mut self, f: F) -> Self
    where
        F: Fn(Clauses) -> Clauses + Send + Sync + 'static,
    {
        self.constraints.push(scope(f));
        self
    }

    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        let column = column.to_owned();
        let value = value.into();
        self.constrain(move |c| c.where_eq(&column, value.clone()))
    }

    pub fn where_cmp(self, column: &str, operator: &str, value: impl Into<Value>) -> Self {
        let column = column.to_owned();
        let operator = operator.to_owned();
        let value = value.into();
        self.constrain(move |c| c.where_cmp(&column, &operator, value.clone()))
    }

    pub fn where_in<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let column = column.to_owned();
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.constrain(move |c| c.where_in(&column, values.clone()))
    }

    pub fn where_null(self, column: &str) -> Self {
        let column = column.to_owned();
        self.constrain(move |c| c.where_null(&column))
    }

    pub fn order_by(self, column: &str, direction: Direction) -> Self {
        let column = column.to_owned();
        self.constrain(move |c| c.order_by(&column, direction))
    }

    pub fn limit(self, limit: u64) -> Self {
        self.constrain(move |c| c.limit(limit))
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// The related schema; `None` for morph-to, whose target depends on the owner.
    pub fn related(&self) -> Option<Arc<ModelSchema>> {
        self.related.as_ref().map(Related::schema)
    }

    fn related_schema(&self) -> TabulaResult<Arc<ModelSchema>> {
        self.related().ok_or_else(|| {
            TabulaError::Unsupported(format!("{} relation has no fixed related model", self.kind.as_str()))
        })
    }

    fn owner_foreign_key(&self, owner: &ModelSchema) -> String {
        self.foreign_key
            .clone()
            .unwrap_or_else(|| default_foreign_key(owner.table()))
    }

    fn local_column<'a>(&'a self, owner: &'a ModelSchema) -> &'a str {
        self.local_key.as_deref().unwrap_or_else(|| owner.key())
    }

    fn owner_value(&self, owner: &Model, column: &str) -> TabulaResult<Value> {
        match owner.get_raw_attribute(column) {
            Some(value) if !value.is_null() => Ok(value.clone()),
            _ => Err(TabulaError::Validation(format!(
                "{} relation on `{}` needs a value for `{column}`",
                self.kind.as_str(),
                owner.schema().table()
            ))),
        }
    }

    /// Related schema plus the clauses selecting `owner`'s related rows.
    pub fn resolve(&self, owner: &Model) -> TabulaResult<(Arc<ModelSchema>, Clauses)> {
        let owner_schema = owner.schema();
        let (related, clauses) = match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => {
                let related = self.related_schema()?;
                let key = self.owner_value(owner, self.local_column(owner_schema))?;
                let clauses = Clauses::new(related.table()).where_eq(&self.owner_foreign_key(owner_schema), key);
                (related, clauses)
            }
            RelationKind::BelongsTo => {
                let related = self.related_schema()?;
                let foreign_key = self.owner_foreign_key(&related);
                let key = self.owner_value(owner, &foreign_key)?;
                let column = self.owner_key.clone().unwrap_or_else(|| related.key().to_owned());
                let clauses = Clauses::new(related.table()).where_eq(&column, key);
                (related, clauses)
            }
            RelationKind::BelongsToMany => {
                let related = self.related_schema()?;
                let key = self.owner_value(owner, self.local_column(owner_schema))?;
                let table = related.table();
                let pivot = self
                    .pivot_table
                    .clone()
                    .unwrap_or_else(|| pivot_table_name(owner_schema.table(), table));
                let first = self
                    .foreign_pivot_key
                    .clone()
                    .unwrap_or_else(|| default_foreign_key(owner_schema.table()));
                let second = self
                    .related_pivot_key
                    .clone()
                    .unwrap_or_else(|| default_foreign_key(table));
                let clauses = Clauses::new(table)
                    .select([format!("{table}.*")])
                    .join(&pivot, &format!("{table}.{}", related.key()), "=", &format!("{pivot}.{second}"))
                    .where_eq(&format!("{pivot}.{first}"), key);
                (related, clauses)
            }
            RelationKind::HasOneThrough | RelationKind::HasManyThrough => {
                let related = self.related_schema()?;
                let key = self.owner_value(owner, self.local_column(owner_schema))?;
                let table = related.table();
                let through = self.through_table.as_deref().unwrap_or_default();
                let clauses = Clauses::new(table)
                    .select([format!("{table}.*")])
                    .join(
                        through,
                        &format!("{table}.{}", self.second_key),
                        "=",
                        &format!("{through}.{}", self.through_key),
                    )
                    .where_eq(&format!("{through}.{}", self.first_key), key);
                (related, clauses)
            }
            RelationKind::MorphOne | RelationKind::MorphMany => {
                let related = self.related_schema()?;
                let key = self.owner_value(owner, self.local_column(owner_schema))?;
                let clauses = Clauses::new(related.table())
                    .where_eq(&self.morph_type, owner_schema.morph_class())
                    .where_eq(&self.morph_id, key);
                (related, clauses)
            }
            RelationKind::MorphTo => {
                let tag = self.owner_value(owner, &self.morph_type)?;
                let key = self.owner_value(owner, &self.morph_id)?;
                let tag = tag.to_string();
                let related = self
                    .morph_map
                    .get(&tag)
                    .map(Related::schema)
                    .ok_or_else(|| TabulaError::Unsupported(format!("no model registered for morph type `{tag}`")))?;
                let clauses = Clauses::new(related.table()).where_eq(related.key(), key);
                (related, clauses)
            }
        };
        let clauses = self.constraints.iter().fold(clauses, |clauses, s| s(clauses));
        Ok((related, clauses))
    }

    /// Model query over `owner`'s related rows. Related global scopes and
    /// soft deletes apply as for any other model query.
    pub fn query<'c, C: Connection>(&self, conn: &'c mut C, owner: &Model) -> TabulaResult<ModelQuery<'c, C>> {
        let (related, clauses) = self.resolve(owner)?;
        Ok(ModelQuery::from_clauses(conn, related, clauses))
    }

    pub async fn get<C: Connection>(&self, conn: &mut C, owner: &Model) -> TabulaResult<Vec<Model>> {
        self.query(conn, owner)?.get().await
    }

    pub async fn first<C: Connection>(&self, conn: &mut C, owner: &Model) -> TabulaResult<Option<Model>> {
        self.query(conn, owner)?.first().await
    }

    pub async fn count<C: Connection>(&self, conn: &mut C, owner: &Model) -> TabulaResult<u64> {
        self.query(conn, owner)?.count().await
    }

    pub async fn exists<C: Connection>(&self, conn: &mut C, owner: &Model) -> TabulaResult<bool> {
        self.query(conn, owner)?.exists().await
    }

    /// Runs the relation for one owner, shaped by its kind.
    pub async fn load<C: Connection>(&self, conn: &mut C, owner: &Model) -> TabulaResult<Loaded> {
        if self.kind.is_single() {
            Ok(Loaded::One(self.first(conn, owner).await?))
        } else {
            Ok(Loaded::Many(self.get(conn, owner).await?))
        }
    }

    /// Loads the relation for every owner and stores it under `name`.
    ///
    /// Has-one, has-many and belongs-to issue one `WHERE IN` query for the
    /// whole batch and match rows back in memory. Other kinds load per owner,
    /// as does any relation whose constraints set a limit or offset, since a
    /// window over the batch would starve some owners.
    #[tracing::instrument(skip(self, conn, owners), fields(kind = self.kind.as_str(), owners = owners.len()))]
    pub async fn eager_load<C: Connection>(&self, conn: &mut C, name: &str, owners: &mut [Model]) -> TabulaResult<()> {
        let Some(first) = owners.first() else {
            return Ok(());
        };
        let owner_schema = Arc::clone(first.schema());

        let windowed = self.constraints.iter().fold(Clauses::new(""), |clauses, s| s(clauses));
        if windowed.limit.is_some() || windowed.offset.is_some() {
            return self.load_each(conn, name, owners).await;
        }

        let (related, owner_column, related_column) = match self.kind {
            RelationKind::HasOne | RelationKind::HasMany => {
                let related = self.related_schema()?;
                let owner_column = self.local_column(&owner_schema).to_owned();
                let related_column = self.owner_foreign_key(&owner_schema);
                (related, owner_column, related_column)
            }
            RelationKind::BelongsTo => {
                let related = self.related_schema()?;
                let owner_column = self.owner_foreign_key(&related);
                let related_column = self.owner_key.clone().unwrap_or_else(|| related.key().to_owned());
                (related, owner_column, related_column)
            }
            _ => return self.load_each(conn, name, owners).await,
        };

        let mut keys: Vec<Value> = Vec::new();
        for owner in owners.iter() {
            if let Some(value) = owner.get_raw_attribute(&owner_column).filter(|v| !v.is_null())
                && !keys.contains(value)
            {
                keys.push(value.clone());
            }
        }

        let rows = if keys.is_empty() {
            Vec::new()
        } else {
            let clauses = Clauses::new(related.table()).where_in(&related_column, keys);
            let clauses = self.constraints.iter().fold(clauses, |clauses, s| s(clauses));
            ModelQuery::from_clauses(&mut *conn, Arc::clone(&related), clauses)
                .get()
                .await?
        };
        tracing::debug!(relation = name, related = rows.len(), "eager loaded");

        for owner in owners.iter_mut() {
            let key = owner.get_raw_attribute(&owner_column).cloned();
            let mut matches = rows
                .iter()
                .filter(|row| key.is_some() && row.get_raw_attribute(&related_column) == key.as_ref())
                .cloned();
            let loaded = if self.kind.is_single() {
                Loaded::One(matches.next())
            } else {
                Loaded::Many(matches.collect())
            };
            owner.set_relation(name, loaded);
        }
        Ok(())
    }

    async fn load_each<C: Connection>(&self, conn: &mut C, name: &str, owners: &mut [Model]) -> TabulaResult<()> {
        for owner in owners.iter_mut() {
            let loaded = self.load(conn, owner).await?;
            owner.set_relation(name, loaded);
        }
        Ok(())
    }
}
