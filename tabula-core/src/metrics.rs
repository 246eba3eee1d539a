//! Statement metrics. Every function is a no-op unless the `metrics` feature is on.

use std::time::Duration;

/// Records one executed statement: `tabula.query.duration_ms` and `tabula.query.count`.
#[cfg(feature = "metrics")]
pub fn record_query(operation: &str, table: &str, elapsed: Duration) {
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let labels = [
        ("operation", operation.to_owned()),
        ("table", table.to_owned()),
    ];
    metrics::histogram!("tabula.query.duration_ms", &labels).record(elapsed_ms);
    metrics::counter!("tabula.query.count", &labels).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn record_query(_operation: &str, _table: &str, _elapsed: Duration) {}

/// Records pool occupancy as gauges, labelled with the dialect name.
#[cfg(feature = "metrics")]
pub fn record_pool_stats<DB: crate::dialect::SqlDialect>(pool: &sqlx::Pool<DB>)
where
    DB::Connection: Send,
{
    let db = DB::dialect().as_str();
    metrics::gauge!("tabula.pool.size", "db" => db).set(f64::from(pool.size()));
    metrics::gauge!("tabula.pool.idle", "db" => db).set(pool.num_idle() as f64);
}

#[cfg(not(feature = "metrics"))]
pub fn record_pool_stats<DB: crate::dialect::SqlDialect>(_pool: &sqlx::Pool<DB>)
where
    DB::Connection: Send,
{
}
