//! # Tabula
//!
//! > **Rows in, models out.**
//!
//! Tabula is an active-record ORM on top of sqlx. Queries are built as plain
//! clause data and compiled to parameterised SQL; models track their
//! attributes against the last loaded snapshot and write only what changed.
//!
//! ## Key Features
//!
//! - **Query builder**: `where_eq`, `where_in`, joins, grouping, aggregates and pagination.
//! - **Model state**: fillable/guarded mass assignment, casts, dirty tracking, timestamps, soft deletes.
//! - **Relations**: has-one/many, belongs-to, many-to-many, through and polymorphic, with batched eager loading.
//! - **Scopes**: named and global clause transforms, plus a small library of common ones.
//! - **Multi-Database**: SQLite, Postgres and MySQL through sqlx.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabula::prelude::*;
//!
//! # async fn example() -> TabulaResult<()> {
//! let pool = tabula::sqlx::SqlitePool::connect("sqlite::memory:").await?;
//! let mut db = Executor::pool(&pool);
//!
//! let users = ModelSchema::builder("users").fillable(["name"]).soft_deletes().build();
//! let mut ada = users.create(&mut db, [("name", "Ada")]).await?;
//! ada.set_attribute("name", "Ada Lovelace");
//! ada.save(&mut db).await?;
//!
//! let active = users.query(&mut db).where_eq("name", "Ada Lovelace").count().await?;
//! # let _ = active;
//! # Ok(())
//! # }
//! ```
//!
//! ## Installation
//!
//! ```toml
//! [dependencies]
//! tabula = "0.3"
//! ```

pub use tabula_core::*;

pub mod prelude {
    pub use tabula_core::prelude::*;

    pub use tabula_core::{Clauses, Loaded, ModelQuery, Page, Query, Record, TrashedMode};
}
