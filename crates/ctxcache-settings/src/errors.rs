//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Failure while resolving [`CacheSettings`](crate::CacheSettings).
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The merged document no longer matches the settings schema
    /// (e.g. a string where a port number was expected).
    #[error("settings do not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
