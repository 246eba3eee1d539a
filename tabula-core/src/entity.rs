//! Typed rows.
//!
//! An [`Entity`] maps a plain struct onto a [`ModelSchema`] through a table of
//! field accessors. Both the schema and the field table are built on first
//! use and cached per type for the life of the process.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::error::{TabulaError, TabulaResult};
use crate::model::Model;
use crate::schema::ModelSchema;
use crate::value::{Record, Value};

/// Accessors for one column of `T`.
pub struct Field<T> {
    pub column: &'static str,
    pub get: fn(&T) -> Value,
    pub set: fn(&mut T, Value) -> TabulaResult<()>,
}

impl<T> Field<T> {
    pub fn new(column: &'static str, get: fn(&T) -> Value, set: fn(&mut T, Value) -> TabulaResult<()>) -> Self {
        Self { column, get, set }
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

impl<T> std::fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field").field("column", &self.column).finish()
    }
}

/// The field table of an entity type, in declaration order.
#[derive(Debug)]
pub struct FieldMap<T> {
    fields: Vec<Field<T>>,
    by_column: HashMap<&'static str, usize>,
}

impl<T> FieldMap<T> {
    pub fn new(fields: Vec<Field<T>>) -> Self {
        let by_column = fields
            .iter()
            .enumerate()
            .map(|(i, field)| (field.column, i))
            .collect();
        Self { fields, by_column }
    }

    pub fn get(&self, column: &str) -> Option<&Field<T>> {
        self.by_column.get(column).map(|&i| &self.fields[i])
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|field| field.column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field<T>> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sets every field whose column is present in `record`. Columns without
    /// a field are ignored; fields without a column keep their value.
    pub fn apply(&self, target: &mut T, record: &Record) -> TabulaResult<()> {
        for field in &self.fields {
            if let Some(value) = record.get(field.column) {
                (field.set)(target, value.clone()).map_err(|err| match err {
                    TabulaError::Validation(message) => {
                        TabulaError::Validation(format!("field `{}`: {message}", field.column))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    pub fn to_record(&self, source: &T) -> Record {
        self.fields
            .iter()
            .map(|field| (field.column.to_owned(), (field.get)(source)))
            .collect()
    }
}

type Registry = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

static SCHEMAS: OnceLock<Registry> = OnceLock::new();
static FIELDS: OnceLock<Registry> = OnceLock::new();

// Returns the cached value for `K`, building it outside the lock on a miss:
// building a schema may look up another entity's schema. Concurrent first
// calls may both build; the first insert wins.
fn cached<K, V>(registry: &'static OnceLock<Registry>, build: impl FnOnce() -> V) -> Arc<V>
where
    K: 'static,
    V: Send + Sync + 'static,
{
    let registry = registry.get_or_init(|| RwLock::new(HashMap::new()));
    let key = TypeId::of::<K>();
    let hit = registry
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned();
    if let Some(value) = hit.and_then(|v| v.downcast::<V>().ok()) {
        return value;
    }

    let built = Arc::new(build());
    let mut guard = registry.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = guard.get(&key).cloned().and_then(|v| v.downcast::<V>().ok()) {
        return existing;
    }
    guard.insert(key, built.clone());
    built
}

/// A struct that reads and writes rows of one table.
///
/// ```
/// use tabula_core::{Entity, Field, ModelSchema, TabulaResult, Value};
///
/// #[derive(Default)]
/// struct User {
///     id: i64,
///     name: String,
/// }
///
/// impl Entity for User {
///     fn schema() -> tabula_core::ModelSchemaBuilder {
///         ModelSchema::builder("users").fillable(["name"])
///     }
///
///     fn fields() -> Vec<Field<Self>> {
///         vec![
///             Field::new("id", |u: &User| u.id.into(), |u: &mut User, v: Value| -> TabulaResult<()> {
///                 u.id = v.try_into()?;
///                 Ok(())
///             }),
///             Field::new("name", |u: &User| u.name.as_str().into(), |u: &mut User, v: Value| -> TabulaResult<()> {
///                 u.name = v.try_into()?;
///                 Ok(())
///             }),
///         ]
///     }
/// }
///
/// let mut record = tabula_core::Record::new();
/// record.insert("id".into(), Value::Int(1));
/// record.insert("name".into(), Value::from("Ada"));
/// let user = User::from_record(&record).unwrap();
/// assert_eq!(user.name, "Ada");
/// ```
pub trait Entity: Default + Send + Sync + 'static {
    /// Schema configuration; built once per type.
    fn schema() -> crate::schema::ModelSchemaBuilder;

    /// Field accessors; built once per type.
    fn fields() -> Vec<Field<Self>>;

    fn model_schema() -> Arc<ModelSchema> {
        cached::<Self, Arc<ModelSchema>>(&SCHEMAS, || Self::schema().build())
            .as_ref()
            .clone()
    }

    fn field_map() -> Arc<FieldMap<Self>> {
        cached::<Self, FieldMap<Self>>(&FIELDS, || FieldMap::new(Self::fields()))
    }

    fn from_record(record: &Record) -> TabulaResult<Self> {
        let mut entity = Self::default();
        Self::field_map().apply(&mut entity, record)?;
        Ok(entity)
    }

    fn from_model(model: &Model) -> TabulaResult<Self> {
        Self::from_record(model.attributes())
    }

    fn to_record(&self) -> Record {
        Self::field_map().to_record(self)
    }

    /// A transient model holding every field. Mass-assignment rules do not
    /// apply; NULL fields are left out so keys and timestamps can be generated.
    fn to_model(&self) -> Model {
        let mut model = Model::new(Self::model_schema());
        model.force_fill(self.to_record().into_iter().filter(|(_, value)| !value.is_null()));
        model
    }

    /// A persisted model holding every field, for updating an existing row.
    fn to_persisted_model(&self) -> Model {
        Model::hydrate(Self::model_schema(), self.to_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug, Default, PartialEq)]
    struct Post {
        id: Option<i64>,
        title: String,
        views: i64,
    }

    impl Entity for Post {
        fn schema() -> crate::schema::ModelSchemaBuilder {
            ModelSchema::builder("posts").without_timestamps()
        }

        fn fields() -> Vec<Field<Self>> {
            vec![
                Field::new("id", |p: &Post| p.id.into(), |p: &mut Post, v: Value| -> TabulaResult<()> {
                    p.id = v.try_into()?;
                    Ok(())
                }),
                Field::new("title", |p: &Post| p.title.as_str().into(), |p: &mut Post, v: Value| -> TabulaResult<()> {
                    p.title = v.try_into()?;
                    Ok(())
                }),
                Field::new("views", |p: &Post| p.views.into(), |p: &mut Post, v: Value| -> TabulaResult<()> {
                    p.views = v.try_into()?;
                    Ok(())
                }),
            ]
        }
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn field_map_is_built_once() {
        let first = Post::field_map();
        let second = Post::field_map();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.columns().collect::<Vec<_>>(), ["id", "title", "views"]);
    }

    #[test]
    fn schema_is_shared() {
        assert!(Arc::ptr_eq(&Post::model_schema(), &Post::model_schema()));
        assert_eq!(Post::model_schema().table(), "posts");
    }

    #[test]
    fn hydrates_from_records_and_ignores_unknown_columns() {
        let post = Post::from_record(&record(&[
            ("id", Value::Int(1)),
            ("title", Value::from("Hello")),
            ("views", Value::Int(3)),
            ("extra", Value::Bool(true)),
        ]))
        .unwrap();
        assert_eq!(
            post,
            Post {
                id: Some(1),
                title: "Hello".to_owned(),
                views: 3
            }
        );
    }

    #[test]
    fn type_mismatch_names_the_field() {
        let err = Post::from_record(&record(&[("views", Value::from("many"))])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("views"));
    }

    #[test]
    fn to_model_skips_null_fields() {
        let post = Post {
            id: None,
            title: "Draft".to_owned(),
            views: 0,
        };
        let model = post.to_model();
        assert!(!model.exists());
        assert_eq!(model.get_raw_attribute("id"), None);
        assert_eq!(model.get_attribute("title"), Value::from("Draft"));

        let persisted = Post::from_model(&model).unwrap();
        assert_eq!(persisted, post);
    }
}
