use crate::ids::ContextId;
use crate::types::VersionId;

/// Failures surfaced by the context cache.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("context not found: {0}")]
    NotFound(ContextId),

    #[error("version {version} not found for context {context_id}")]
    VersionNotFound {
        context_id: ContextId,
        version: VersionId,
    },

    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Stable numeric code used at the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::VersionNotFound { .. } => 404,
            Self::PayloadTooLarge { .. } => 413,
            Self::BadRequest(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Internal(format!("serialization: {e}"))
    }
}
