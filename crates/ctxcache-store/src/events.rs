use std::sync::Arc;

use ctxcache_core::{AgentId, ConnectionId, ContextId, ContextVersion};

/// Incarnation of a context id. A context re-created after removal gets a
/// fresh generation, so events from the old chain never reach its subscribers.
pub type Generation = u64;

/// Change notifications published by the store, consumed by the broadcast hub.
#[derive(Clone, Debug)]
pub enum ContextEvent {
    Updated {
        context_id: ContextId,
        generation: Generation,
        version: Arc<ContextVersion>,
        agent_id: AgentId,
        /// Push channel that submitted the write; it is not echoed back.
        origin: Option<ConnectionId>,
    },
    Deleted {
        context_id: ContextId,
        generation: Generation,
        reason: DeleteReason,
    },
}

impl ContextEvent {
    pub fn context_id(&self) -> &ContextId {
        match self {
            Self::Updated { context_id, .. } | Self::Deleted { context_id, .. } => context_id,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            Self::Updated { generation, .. } | Self::Deleted { generation, .. } => *generation,
        }
    }
}

/// Why a context was removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteReason {
    Explicit,
    Expired,
    Evicted,
    /// Removal noticed after the fact, when the delete event itself was missed.
    Vanished,
}

impl DeleteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Expired => "ttl",
            Self::Evicted => "capacity",
            Self::Vanished => "unknown",
        }
    }
}
