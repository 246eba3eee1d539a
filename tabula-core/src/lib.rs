//! Core of Tabula: clause model and compiler, execution adapter, model state
//! machine, relationship resolver and scope composer.

pub use sqlx;

pub mod prelude {
    pub use crate::{
        ClauseBuilder, Connection, Direction, Entity, Executor, IntoExecutor, Model, ModelSchema, Relation,
        Tabula, TabulaError, TabulaResult, Value, transaction,
    };
}

pub mod clause;
pub mod compiler;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod query;
pub mod relation;
pub mod schema;
pub mod scope;
pub mod test_utils;
pub mod transaction;
pub mod value;

pub use clause::{Boolean, ClauseBuilder, Clauses, DatePart, Direction, JoinKind, PredicateKind};
pub use compiler::{Aggregate, Compiled, Operator, compile, compile_for};
pub use config::ExecutorConfig;
pub use connection::Connection;
pub use dialect::{Dialect, SqlDialect};
pub use entity::{Entity, Field, FieldMap};
pub use error::{ErrorKind, TabulaError, TabulaResult};
pub use executor::{Executor, IntoExecutor};
pub use model::{Lifecycle, Loaded, Model, ModelQuery};
pub use query::{Page, Query};
pub use relation::{Related, Relation, RelationKind};
pub use schema::{Cast, KeyKind, ModelSchema, ModelSchemaBuilder, Timestamps};
pub use scope::{Scope, ScopeRegistry, TrashedMode, scope};
pub use transaction::{Tabula, transaction};
pub use value::{Record, Value};
