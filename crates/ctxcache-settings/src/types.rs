use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheSettings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

/// HTTP / WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Bounded outbound queue per push channel.
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9092,
            max_send_queue: 256,
        }
    }
}

/// Context store, trimming and eviction settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreSettings {
    /// Versions retained per context.
    pub max_versions: usize,
    /// Maximum serialized payload size in bytes.
    pub max_context_size: usize,
    /// Token budget applied to full writes.
    pub token_budget: usize,
    /// LRU cap on the number of live contexts.
    pub max_contexts: usize,
    /// Idle time after which a context is reclaimed.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Capacity of the store's change-event channel.
    pub event_capacity: usize,
    /// Priority overrides merged over the built-in key table.
    pub priorities: BTreeMap<String, i32>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_versions: 10,
            max_context_size: 10 * 1024 * 1024,
            token_budget: 32_000,
            max_contexts: 100,
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            event_capacity: 1024,
            priorities: BTreeMap::new(),
        }
    }
}

/// Logging and metrics export settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Default level. Overridden by `RUST_LOG`.
    pub level: String,
    /// Per-module overrides, e.g. `{"ctxcache_server": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Install the Prometheus recorder.
    pub prometheus: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            module_levels: BTreeMap::new(),
            json: false,
            prometheus: true,
        }
    }
}
