//! Runtime configuration from environment variables

use std::env;

/// Configuration for the view runtime binary
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Published view name (also the store name)
    pub view_name: String,

    /// Field the runtime pipeline groups and counts by
    pub group_field: String,

    /// Timestamp field for trailing-window mode
    pub window_field: String,

    /// Trailing window width; no window when unset
    pub window_millis: Option<i64>,

    /// Recompute throttle interval in milliseconds
    pub min_recompute_ms: u64,

    /// Master enable flag
    pub enabled: bool,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `AGGVIEW_DB_PATH` (default: aggview.db)
    /// - `AGGVIEW_VIEW_NAME` (default: records)
    /// - `AGGVIEW_GROUP_FIELD` (default: category)
    /// - `AGGVIEW_WINDOW_FIELD` (default: ts)
    /// - `AGGVIEW_WINDOW_MILLIS` (default: unset)
    /// - `AGGVIEW_MIN_RECOMPUTE_MS` (default: 500)
    /// - `AGGVIEW_ENABLED` (default: true)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("AGGVIEW_DB_PATH").unwrap_or_else(|_| "aggview.db".to_string()),

            view_name: env::var("AGGVIEW_VIEW_NAME").unwrap_or_else(|_| "records".to_string()),

            group_field: env::var("AGGVIEW_GROUP_FIELD").unwrap_or_else(|_| "category".to_string()),

            window_field: env::var("AGGVIEW_WINDOW_FIELD").unwrap_or_else(|_| "ts".to_string()),

            window_millis: env::var("AGGVIEW_WINDOW_MILLIS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|width: &i64| *width > 0),

            min_recompute_ms: env::var("AGGVIEW_MIN_RECOMPUTE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(super::options::DEFAULT_MIN_RECOMPUTE_MS),

            enabled: env::var("AGGVIEW_ENABLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
        }
    }
}
