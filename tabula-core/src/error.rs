use thiserror::Error;

/// Boxed cause carried by execution failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a [`TabulaError`], for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Constraint,
    Connection,
    Unsupported,
}

/// Tabula error type.
///
/// Compiler problems surface as [`TabulaError::Validation`] before any I/O
/// happens. Execution failures keep the driver error as their `source` and
/// record which operation on which table failed.
#[derive(Debug, Error)]
pub enum TabulaError {
    /// The request was malformed: bad identifier, unknown operator, missing key.
    #[error("validation failed: {0}")]
    Validation(String),
    /// No record, scope or relation matched.
    #[error("{0} not found")]
    NotFound(String),
    /// The database rejected a write because of an integrity constraint.
    #[error("constraint violation during {operation} on `{table}`: {source}")]
    Constraint {
        operation: &'static str,
        table: String,
        #[source]
        source: BoxError,
    },
    /// The statement could not be executed.
    #[error("{operation} on `{table}` failed: {source}")]
    Connection {
        operation: &'static str,
        table: String,
        #[source]
        source: BoxError,
    },
    /// The operation is not available for this model, connection or state.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Result alias for Tabula operations.
pub type TabulaResult<T> = Result<T, TabulaError>;

const UNKNOWN_OPERATION: &str = "statement";
const UNKNOWN_TABLE: &str = "?";

impl TabulaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Constraint { .. } => ErrorKind::Constraint,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Connection failure without operation context yet.
    pub fn connection(source: impl Into<BoxError>) -> Self {
        Self::Connection {
            operation: UNKNOWN_OPERATION,
            table: UNKNOWN_TABLE.to_owned(),
            source: source.into(),
        }
    }

    /// Constraint failure without operation context yet.
    pub fn constraint(source: impl Into<BoxError>) -> Self {
        Self::Constraint {
            operation: UNKNOWN_OPERATION,
            table: UNKNOWN_TABLE.to_owned(),
            source: source.into(),
        }
    }

    /// Attaches the operation kind and table to execution failures.
    /// Other variants pass through untouched.
    pub fn within(self, operation: &'static str, table: &str) -> Self {
        match self {
            Self::Constraint { source, .. } => Self::Constraint {
                operation,
                table: table.to_owned(),
                source,
            },
            Self::Connection { source, .. } => Self::Connection {
                operation,
                table: table.to_owned(),
                source,
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<sqlx::Error> for TabulaError {
    fn from(err: sqlx::Error) -> Self {
        map_sqlx_error(err)
    }
}

/// Classifies sqlx errors: integrity violations become `Constraint`,
/// everything else is a `Connection` failure.
pub fn map_sqlx_error(err: sqlx::Error) -> TabulaError {
    use sqlx::error::ErrorKind as DbKind;

    if matches!(err, sqlx::Error::RowNotFound) {
        return TabulaError::NotFound("row".to_owned());
    }
    let db_kind = match &err {
        sqlx::Error::Database(db) => Some(db.kind()),
        _ => None,
    };
    match db_kind {
        Some(
            DbKind::UniqueViolation
            | DbKind::ForeignKeyViolation
            | DbKind::NotNullViolation
            | DbKind::CheckViolation,
        ) => TabulaError::constraint(err),
        _ => TabulaError::connection(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn within_fills_context_and_keeps_source() {
        let err = TabulaError::connection("socket closed").within("select", "users");
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.to_string(), "select on `users` failed: socket closed");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("socket closed"));
    }

    #[test]
    fn within_leaves_validation_alone() {
        let err = TabulaError::Validation("bad".to_owned()).within("select", "users");
        assert!(matches!(err, TabulaError::Validation(ref m) if m == "bad"));
    }

    #[test]
    fn pool_errors_map_to_connection() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn row_not_found_is_distinguishable() {
        assert!(map_sqlx_error(sqlx::Error::RowNotFound).is_not_found());
    }
}
