//! # ctxcache-settings
//!
//! Layered configuration for the context cache service.
//!
//! Settings are resolved in three layers (in priority order):
//! 1. **Compiled defaults**: [`CacheSettings::default()`]
//! 2. **Settings file**: `~/.ctxcache/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `CTXCACHE_*` overrides (highest priority)
//!
//! There is no global instance: the binary loads settings once at startup and
//! hands the relevant sections to each component.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{CacheSettings, LoggingSettings, ServerSettings, StoreSettings};
