//! WebSocket wire messages. Every frame is a JSON object tagged by `type`.

use chrono::{DateTime, Utc};
use ctxcache_core::{AgentId, CacheError, ContextDiff, ContextId, ContextVersion, Payload, VersionId};
use ctxcache_store::WriteOutcome;
use serde::{Deserialize, Serialize};

/// Server → client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    ContextSnapshot {
        context_id: ContextId,
        version: VersionId,
        hash: String,
        timestamp: DateTime<Utc>,
        context: Payload,
    },
    #[serde(rename_all = "camelCase")]
    ContextUpdate {
        context_id: ContextId,
        version: VersionId,
        hash: String,
        timestamp: DateTime<Utc>,
        diff: ContextDiff,
        context: Payload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<AgentId>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        full_resync: bool,
    },
    #[serde(rename_all = "camelCase")]
    ContextDeleted {
        context_id: ContextId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ContextUpdateAck {
        context_id: ContextId,
        version: VersionId,
        hash: String,
        tokens_saved: usize,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        status_code: u16,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn snapshot(context_id: &ContextId, version: &ContextVersion) -> Self {
        Self::ContextSnapshot {
            context_id: context_id.clone(),
            version: version.version,
            hash: version.content_hash.clone(),
            timestamp: version.timestamp,
            context: version.payload.clone(),
        }
    }

    /// Update for `version`, using its stored diff (or the whole payload for a first write).
    pub fn update(context_id: &ContextId, version: &ContextVersion, agent_id: Option<AgentId>) -> Self {
        let diff = version
            .diff_from_previous
            .clone()
            .unwrap_or_else(|| ContextDiff::full(&version.payload));
        Self::update_with_diff(context_id, version, diff, agent_id, false)
    }

    pub fn update_with_diff(
        context_id: &ContextId,
        version: &ContextVersion,
        diff: ContextDiff,
        agent_id: Option<AgentId>,
        full_resync: bool,
    ) -> Self {
        Self::ContextUpdate {
            context_id: context_id.clone(),
            version: version.version,
            hash: version.content_hash.clone(),
            timestamp: version.timestamp,
            diff,
            context: version.payload.clone(),
            agent_id,
            full_resync,
        }
    }

    pub fn deleted(context_id: &ContextId, reason: &str) -> Self {
        Self::ContextDeleted {
            context_id: context_id.clone(),
            reason: reason.to_owned(),
            timestamp: Utc::now(),
        }
    }

    pub fn ack(outcome: &WriteOutcome) -> Self {
        Self::ContextUpdateAck {
            context_id: outcome.context_id.clone(),
            version: outcome.version,
            hash: outcome.content_hash.clone(),
            tokens_saved: outcome.tokens_saved,
            timestamp: outcome.timestamp,
        }
    }

    pub fn pong() -> Self {
        Self::Pong { timestamp: Utc::now() }
    }

    pub fn error(message: impl Into<String>, status_code: u16) -> Self {
        Self::Error {
            error: message.into(),
            status_code,
            timestamp: Utc::now(),
        }
    }
}

impl From<&CacheError> for ServerMessage {
    fn from(e: &CacheError) -> Self {
        Self::error(e.to_string(), e.status_code())
    }
}

/// Client → server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeToChanges {
        #[serde(default)]
        last_version: Option<VersionId>,
    },
    ContextUpdate {
        diff: ContextDiff,
    },
    Ping,
}
