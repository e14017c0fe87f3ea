pub mod diff;
pub mod errors;
pub mod ids;
pub mod tokens;
pub mod types;

pub use diff::{aggregate, apply_diff, compute_diff, ContextDiff};
pub use errors::CacheError;
pub use ids::{AgentId, ConnectionId, ContextId};
pub use tokens::{estimate_tokens, tokens_saved, trim_to_budget, PriorityTable, TrimResult};
pub use types::{content_hash, serialized_size, ContextVersion, Payload, VersionId};
