//! Metric name constants shared across crates.

/// Accepted writes (counter, labels: kind = full | diff).
pub const CTX_WRITES_TOTAL: &str = "ctx_writes_total";
/// Rejected writes (counter, labels: error).
pub const CTX_WRITE_ERRORS_TOTAL: &str = "ctx_write_errors_total";
/// Estimated tokens saved by trimming and diffing (counter).
pub const CTX_TOKENS_SAVED_TOTAL: &str = "ctx_tokens_saved_total";
/// Keys replaced by reference stubs during trimming (counter).
pub const CTX_KEYS_STUBBED_TOTAL: &str = "ctx_keys_stubbed_total";
/// Live contexts (gauge).
pub const CTX_CONTEXTS_ACTIVE: &str = "ctx_contexts_active";
/// Contexts removed by the sweeper (counter, labels: reason = ttl | capacity | empty).
pub const CTX_EVICTIONS_TOTAL: &str = "ctx_evictions_total";
/// Reads served from the store (counter, labels: result = hit | miss).
pub const CTX_READS_TOTAL: &str = "ctx_reads_total";
/// Push messages that could not be delivered (counter).
pub const CTX_BROADCAST_DROPS_TOTAL: &str = "ctx_broadcast_drops_total";
/// Store events the broadcast bridge fell behind on (counter).
pub const CTX_EVENTS_LAGGED_TOTAL: &str = "ctx_events_lagged_total";
/// HTTP requests (counter, labels: method).
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
