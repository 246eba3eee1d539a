use serde::{Deserialize, Serialize};

/// Knobs for the sqlx-backed [`Executor`](crate::executor::Executor).
///
/// Deserializable so it can live in an application's own config file:
///
/// ```
/// let config: tabula_core::ExecutorConfig =
///     serde_json::from_str(r#"{ "slow_query_threshold_ms": 50 }"#).unwrap();
/// assert!(config.normalize_bytes);
/// assert_eq!(config.slow_query_threshold_ms, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Decode binary columns as text.
    pub normalize_bytes: bool,
    /// Statements slower than this are logged at `warn`. Zero disables the check.
    pub slow_query_threshold_ms: u64,
    /// Include bound arguments in the debug log of each statement.
    pub log_arguments: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            normalize_bytes: true,
            slow_query_threshold_ms: 500,
            log_arguments: false,
        }
    }
}
