//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::CacheSettings;

/// Resolve the default settings file (`~/.ctxcache/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ctxcache").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CacheSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CacheSettings> {
    let defaults = serde_json::to_value(CacheSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CacheSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CTXCACHE_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_overrides(settings: &mut CacheSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("CTXCACHE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed::<u16>("CTXCACHE_PORT", 0, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed::<usize>("CTXCACHE_MAX_SEND_QUEUE", 1, 1_000_000) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = env.parsed::<usize>("CTXCACHE_MAX_VERSIONS", 1, 10_000) {
        settings.store.max_versions = v;
    }
    if let Some(v) = env.parsed::<usize>("CTXCACHE_MAX_CONTEXT_SIZE", 2, 1 << 30) {
        settings.store.max_context_size = v;
    }
    if let Some(v) = env.parsed::<usize>("CTXCACHE_TOKEN_BUDGET", 0, 10_000_000) {
        settings.store.token_budget = v;
    }
    if let Some(v) = env.parsed::<usize>("CTXCACHE_MAX_CONTEXTS", 1, 1_000_000) {
        settings.store.max_contexts = v;
    }
    if let Some(v) = env.parsed::<u64>("CTXCACHE_TTL_SECS", 1, 365 * 24 * 60 * 60) {
        settings.store.ttl_secs = v;
    }
    if let Some(v) = env.parsed::<u64>("CTXCACHE_SWEEP_INTERVAL_SECS", 1, 24 * 60 * 60) {
        settings.store.sweep_interval_secs = v;
    }
    if let Some(v) = env.string("CTXCACHE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.boolean("CTXCACHE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and require it to fall within `[min, max]`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn parsed<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: std::str::FromStr + PartialOrd,
    {
        let val = self.string(name)?;
        let result = parse_in_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
