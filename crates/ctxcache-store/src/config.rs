use std::time::Duration;

use ctxcache_core::PriorityTable;
use ctxcache_settings::StoreSettings;

/// Runtime configuration for [`crate::ContextStore`] and [`crate::Sweeper`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub max_versions: usize,
    pub max_context_size: usize,
    pub token_budget: usize,
    pub max_contexts: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub event_capacity: usize,
    pub priorities: PriorityTable,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from(&StoreSettings::default())
    }
}

impl From<&StoreSettings> for StoreConfig {
    fn from(s: &StoreSettings) -> Self {
        Self {
            max_versions: s.max_versions.max(1),
            max_context_size: s.max_context_size,
            token_budget: s.token_budget,
            max_contexts: s.max_contexts.max(1),
            ttl: Duration::from_secs(s.ttl_secs),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs.max(1)),
            event_capacity: s.event_capacity.max(1),
            priorities: PriorityTable::default()
                .with_overrides(s.priorities.iter().map(|(k, v)| (k.clone(), *v))),
        }
    }
}
