//! HTTP routes over the context store.

use std::io::Write;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use ctxcache_core::{estimate_tokens, tokens_saved, AgentId, CacheError, ContextDiff, ContextId, Payload, VersionId};
use ctxcache_store::{ContextSummary, WriteOutcome};
use ctxcache_telemetry::metrics::HTTP_REQUESTS_TOTAL;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::json;
use tracing::warn;

use crate::errors::ApiError;
use crate::server::AppState;
use crate::stats::ServerStats;

/// Query parameters for `GET /context/{id}`. `version` wins over `since`.
#[derive(Debug, Default, Deserialize)]
pub struct ContextQuery {
    pub version: Option<VersionId>,
    pub since: Option<VersionId>,
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutContextRequest {
    pub context: Payload,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    #[serde(flatten)]
    pub diff: ContextDiff,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody<'a> {
    context_id: &'a ContextId,
    version: VersionId,
    hash: &'a str,
    timestamp: DateTime<Utc>,
    context: &'a RawValue,
    tokens: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SinceBody<'a> {
    context_id: &'a ContextId,
    since_version: VersionId,
    current_version: VersionId,
    hash: &'a str,
    timestamp: DateTime<Utc>,
    diff: &'a ContextDiff,
    full_resync: bool,
    tokens_saved: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_saved: u64,
    pub active_connections: usize,
    pub tokens_saved: u64,
    pub contexts: Vec<ContextSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub contexts: usize,
    pub connections: usize,
    pub uptime_secs: u64,
}

/// GET /context/{id}
pub async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ContextQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let id = ContextId::from_raw(id);

    let body = lookup(&state, &id, &query);
    state.stats.record_lookup(body.is_ok());
    let body = body?;

    if query.compress {
        return Ok(gzip_response(&state.stats, body));
    }
    Ok(json_response(body))
}

fn lookup(state: &AppState, id: &ContextId, query: &ContextQuery) -> Result<Vec<u8>, CacheError> {
    if let Some(v) = query.version {
        let version = state.store.get_version(id, v)?;
        let context = serde_json::value::to_raw_value(&version.payload)?;
        return Ok(serde_json::to_vec(&SnapshotBody {
            context_id: id,
            version: version.version,
            hash: &version.content_hash,
            timestamp: version.timestamp,
            tokens: estimate_tokens(&*context),
            context: &context,
        })?);
    }

    if let Some(since) = query.since {
        let result = state.store.get_since(id, since)?;
        return Ok(serde_json::to_vec(&SinceBody {
            context_id: id,
            since_version: since,
            current_version: result.current.version,
            hash: &result.current.content_hash,
            timestamp: result.current.timestamp,
            diff: &result.diff,
            full_resync: result.full_resync,
            tokens_saved: tokens_saved(&result.diff, &result.current.payload),
        })?);
    }

    let snapshot = state.store.snapshot(id)?;
    let context: &RawValue = serde_json::from_str(&snapshot.serialized)?;
    Ok(serde_json::to_vec(&SnapshotBody {
        context_id: id,
        version: snapshot.version.version,
        hash: &snapshot.version.content_hash,
        timestamp: snapshot.version.timestamp,
        context,
        tokens: estimate_tokens(context),
    })?)
}

fn json_response(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn gzip_response(stats: &ServerStats, body: Vec<u8>) -> Response {
    match gzip(&body) {
        Ok(compressed) => {
            stats.record_bytes_saved(body.len().saturating_sub(compressed.len()) as u64);
            (
                [
                    (header::CONTENT_TYPE, "application/json"),
                    (header::CONTENT_ENCODING, "gzip"),
                ],
                compressed,
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "gzip failed, sending uncompressed body");
            json_response(body)
        }
    }
}

/// PUT /context/{id}
pub async fn put_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PutContextRequest>, JsonRejection>,
) -> Result<Json<WriteOutcome>, ApiError> {
    let Json(body) = body?;
    let outcome = state.store.put_full(
        &ContextId::from_raw(id),
        body.context,
        body.agent_id.unwrap_or_else(AgentId::anonymous),
        None,
    )?;
    Ok(Json(outcome))
}

/// POST /context/{id}/diff
pub async fn post_diff(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<DiffRequest>, JsonRejection>,
) -> Result<Json<WriteOutcome>, ApiError> {
    let Json(body) = body?;
    let outcome = state.store.put_diff(
        &ContextId::from_raw(id),
        &body.diff,
        body.agent_id.unwrap_or_else(AgentId::anonymous),
        None,
    )?;
    Ok(Json(outcome))
}

/// DELETE /context/{id}
pub async fn delete_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = ContextId::from_raw(id);
    state.store.delete(&id)?;
    Ok(Json(json!({ "contextId": id, "deleted": true })))
}

/// GET /metrics
pub async fn metrics_json(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        total_requests: state.stats.total_requests(),
        cache_hits: state.stats.cache_hits(),
        cache_misses: state.stats.cache_misses(),
        bytes_saved: state.stats.bytes_saved(),
        active_connections: state.hub.connection_count(),
        tokens_saved: state.store.total_tokens_saved(),
        contexts: state.store.summaries(),
    })
}

/// GET /metrics/prometheus
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or_else(|| ApiError::not_found("prometheus exporter not installed"))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        contexts: state.store.len(),
        connections: state.hub.connection_count(),
        uptime_secs: state.stats.uptime_secs(),
    })
}

/// Counts every request for `/metrics`.
pub async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.stats.record_request();
    counter!(HTTP_REQUESTS_TOTAL, "method" => request.method().as_str().to_owned()).increment(1);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use axum::body::Body;
    use axum::http::{Method, Request as HttpRequest};
    use ctxcache_store::{ContextStore, StoreConfig};
    use std::io::Read;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state_with(config: StoreConfig) -> AppState {
        AppState::new(Arc::new(ContextStore::new(config)), 16, None)
    }

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, Vec<u8>, Option<String>) {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        let resp = build_router(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let encoding = resp
            .headers()
            .get(header::CONTENT_ENCODING)
            .map(|v| v.to_str().unwrap().to_owned());
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, bytes.to_vec(), encoding)
    }

    async fn call_json(state: &AppState, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let (status, bytes, _) = call(state, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn put_then_get_snapshot() {
        let state = state_with(StoreConfig::default());
        let (status, put) = call_json(
            &state,
            Method::PUT,
            "/context/p1",
            Some(json!({"context": {"a": 1, "b": 2}, "agentId": "agent-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(put["version"], 1);
        assert_eq!(put["contextId"], "p1");

        let (status, got) = call_json(&state, Method::GET, "/context/p1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["context"], json!({"a": 1, "b": 2}));
        assert_eq!(got["version"], 1);
        assert_eq!(got["hash"], put["contentHash"]);
        assert!(got["tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn get_unknown_is_404_envelope() {
        let state = state_with(StoreConfig::default());
        let (status, body) = call_json(&state, Method::GET, "/context/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["statusCode"], 404);
        assert_eq!(state.stats.cache_misses(), 1);
    }

    #[tokio::test]
    async fn get_since_returns_diff() {
        let state = state_with(StoreConfig::default());
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1, "b": 2}}))).await;
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1, "b": 3, "c": 4}}))).await;

        let (status, body) = call_json(&state, Method::GET, "/context/p1?since=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sinceVersion"], 1);
        assert_eq!(body["currentVersion"], 2);
        assert_eq!(body["fullResync"], false);
        assert_eq!(body["diff"]["added"], json!({"c": 4}));
        assert_eq!(body["diff"]["modified"], json!({"b": 3}));
        assert_eq!(body["diff"]["removed"], json!([]));
        assert_eq!(body["diff"]["unchanged"], json!(["a"]));
    }

    #[tokio::test]
    async fn get_exact_version() {
        let state = state_with(StoreConfig::default());
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1}}))).await;
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 2}}))).await;
        let (_, body) = call_json(&state, Method::GET, "/context/p1?version=1", None).await;
        assert_eq!(body["context"], json!({"a": 1}));
        let (status, _) = call_json(&state, Method::GET, "/context/p1?version=9", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn compressed_get_is_gzip() {
        let state = state_with(StoreConfig::default());
        let doc = "lorem ipsum ".repeat(200);
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"doc": doc}}))).await;

        let (status, bytes, encoding) = call(&state, Method::GET, "/context/p1?compress=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(encoding.as_deref(), Some("gzip"));

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(bytes.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(body["context"]["doc"], json!(doc));
        assert!(state.stats.bytes_saved() > 0);
    }

    #[tokio::test]
    async fn post_diff_applies() {
        let state = state_with(StoreConfig::default());
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1, "b": 2}}))).await;
        let (status, body) = call_json(
            &state,
            Method::POST,
            "/context/p1/diff",
            Some(json!({"modified": {"a": 5}, "removed": ["b"], "agentId": "differ"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);

        let (_, got) = call_json(&state, Method::GET, "/context/p1", None).await;
        assert_eq!(got["context"], json!({"a": 5}));
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let state = state_with(StoreConfig::default());
        let (status, body) = call_json(&state, Method::PUT, "/context/p1", Some(json!({"context": [1, 2]}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["statusCode"], 400);
    }

    #[tokio::test]
    async fn oversized_payload_is_413() {
        let state = state_with(StoreConfig {
            max_context_size: 64,
            ..StoreConfig::default()
        });
        let (status, body) = call_json(
            &state,
            Method::PUT,
            "/context/p1",
            Some(json!({"context": {"big": "x".repeat(128)}})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["statusCode"], 413);
    }

    #[tokio::test]
    async fn delete_then_404() {
        let state = state_with(StoreConfig::default());
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1}}))).await;
        let (status, body) = call_json(&state, Method::DELETE, "/context/p1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);
        let (status, _) = call_json(&state, Method::DELETE, "/context/p1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_reports_counters() {
        let state = state_with(StoreConfig::default());
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1}}))).await;
        call(&state, Method::GET, "/context/p1", None).await;

        let (status, body) = call_json(&state, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRequests"], 3);
        assert_eq!(body["cacheHits"], 1);
        assert_eq!(body["activeConnections"], 0);
        assert_eq!(body["contexts"][0]["id"], "p1");
        assert_eq!(body["contexts"][0]["version"], 1);
    }

    #[tokio::test]
    async fn prometheus_without_recorder_is_404() {
        let state = state_with(StoreConfig::default());
        let (status, _) = call_json(&state, Method::GET, "/metrics/prometheus", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let state = state_with(StoreConfig::default());
        call(&state, Method::PUT, "/context/p1", Some(json!({"context": {"a": 1}}))).await;
        let (status, body) = call_json(&state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["contexts"], 1);
        assert_eq!(body["connections"], 0);
        assert!(body["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let state = state_with(StoreConfig::default());
        let (status, _, _) = call(&state, Method::GET, "/nonexistent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
