//! Checkpoint configuration
//!
//! Configuration is loaded from a JSON settings file and validated field by
//! field: a value that is absent, of the wrong type, or out of range falls
//! back to its documented default. Loading never fails — a missing or
//! malformed settings file simply yields the defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default exclusion patterns applied when the settings file has none
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &["*.log", "node_modules/", ".env", "__pycache__/"];

const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_MAX_FILE_SIZE_MB: f64 = 100.0;

/// Validated checkpoint configuration
///
/// All numeric fields are guaranteed to be within their valid range:
/// `retention_days` in 1..=365, `max_file_size_mb` in 0.1..=1000.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Whether checkpointing is enabled at all
    pub enabled: bool,
    /// How long checkpoint records are retained, in days
    pub retention_days: u32,
    /// Glob-style patterns excluded from checkpointing
    pub exclude_patterns: Vec<String>,
    /// Files larger than this are excluded from snapshots
    pub max_file_size_mb: f64,
    /// Whether a session stop event also triggers a checkpoint
    pub checkpoint_on_stop: bool,
    /// Whether old records are cleaned up after each checkpoint
    pub auto_cleanup: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: DEFAULT_RETENTION_DAYS,
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
            checkpoint_on_stop: false,
            auto_cleanup: true,
        }
    }
}

impl CheckpointConfig {
    /// Load configuration from the given settings file
    ///
    /// Returns the defaults when the file is missing or unparseable; a
    /// parseable document is validated field by field.
    pub fn load(settings_path: &Path) -> Self {
        let raw = match fs::read_to_string(settings_path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                warn!("Settings file {:?} is not valid JSON: {}", settings_path, e);
                Self::default()
            }
        }
    }

    /// Load configuration from the default settings location
    pub fn load_default() -> Self {
        Self::load(&settings_path())
    }

    /// Build a validated configuration from a parsed JSON document
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();

        let enabled = bool_field(value, "enabled").unwrap_or(defaults.enabled);
        let checkpoint_on_stop =
            bool_field(value, "checkpoint_on_stop").unwrap_or(defaults.checkpoint_on_stop);
        let auto_cleanup = bool_field(value, "auto_cleanup").unwrap_or(defaults.auto_cleanup);

        let retention_days = int_field(value, "retention_days")
            .map(|days| days.clamp(1, 365) as u32)
            .unwrap_or(defaults.retention_days);

        let max_file_size_mb = float_field(value, "max_file_size_mb")
            .map(|mb| mb.clamp(0.1, 1000.0))
            .unwrap_or(defaults.max_file_size_mb);

        let exclude_patterns = match value.get("exclude_patterns") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            Some(other) => {
                debug!("exclude_patterns has wrong type ({}), using defaults", type_name(other));
                defaults.exclude_patterns.clone()
            }
            None => defaults.exclude_patterns.clone(),
        };

        Self {
            enabled,
            retention_days,
            exclude_patterns,
            max_file_size_mb,
            checkpoint_on_stop,
            auto_cleanup,
        }
    }

    /// Size limit in bytes derived from `max_file_size_mb`
    pub fn max_file_size_bytes(&self) -> u64 {
        (self.max_file_size_mb * 1024.0 * 1024.0) as u64
    }
}

fn bool_field(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(Value::as_bool)
}

fn int_field(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn float_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Root directory for safepoint state (settings, metadata, snapshots)
///
/// Defaults to `~/.safepoint`; the `SAFEPOINT_HOME` environment variable
/// overrides it, which tests and sandboxed installs rely on.
pub fn data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("SAFEPOINT_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".safepoint")
}

/// Path of the JSON settings file
pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Base directory holding metadata and per-project snapshot storage
pub fn checkpoint_base() -> PathBuf {
    data_dir().join("checkpoints")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = CheckpointConfig::default();
        assert!(config.enabled);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.max_file_size_mb, 100.0);
        assert!(!config.checkpoint_on_stop);
        assert!(config.auto_cleanup);
        assert!(config.exclude_patterns.contains(&"*.log".to_string()));
    }

    #[test]
    fn test_retention_days_clamped() {
        let config = CheckpointConfig::from_value(&json!({ "retention_days": 0 }));
        assert_eq!(config.retention_days, 1);

        let config = CheckpointConfig::from_value(&json!({ "retention_days": 9999 }));
        assert_eq!(config.retention_days, 365);

        let config = CheckpointConfig::from_value(&json!({ "retention_days": 30 }));
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn test_retention_days_wrong_type_falls_back() {
        let config = CheckpointConfig::from_value(&json!({ "retention_days": [1, 2] }));
        assert_eq!(config.retention_days, 7);

        // Numeric strings are accepted
        let config = CheckpointConfig::from_value(&json!({ "retention_days": "14" }));
        assert_eq!(config.retention_days, 14);
    }

    #[test]
    fn test_max_file_size_clamped() {
        let config = CheckpointConfig::from_value(&json!({ "max_file_size_mb": 0.0001 }));
        assert_eq!(config.max_file_size_mb, 0.1);

        let config = CheckpointConfig::from_value(&json!({ "max_file_size_mb": 5000 }));
        assert_eq!(config.max_file_size_mb, 1000.0);
    }

    #[test]
    fn test_exclude_patterns_drops_non_strings_and_empties() {
        let config = CheckpointConfig::from_value(&json!({
            "exclude_patterns": ["*.log", null, "", 42, "dist/"]
        }));
        assert_eq!(config.exclude_patterns, vec!["*.log", "dist/"]);
    }

    #[test]
    fn test_exclude_patterns_wrong_type_falls_back() {
        let config = CheckpointConfig::from_value(&json!({ "exclude_patterns": "*.log" }));
        assert_eq!(
            config.exclude_patterns,
            CheckpointConfig::default().exclude_patterns
        );
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = CheckpointConfig::load(&path);
        assert_eq!(config.retention_days, 7);

        let config = CheckpointConfig::load(&dir.path().join("missing.json"));
        assert!(config.enabled);
    }

    #[test]
    fn test_max_file_size_bytes() {
        let config = CheckpointConfig::from_value(&json!({ "max_file_size_mb": 1 }));
        assert_eq!(config.max_file_size_bytes(), 1024 * 1024);
    }
}
