//! `/ws` push channel: one writer task draining the hub queue and one reader
//! task parsing client frames.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use ctxcache_core::{AgentId, ConnectionId, ContextId};
use ctxcache_telemetry::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::errors::ApiError;
use crate::hub::{Outbound, SubscriptionHub};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub project_id: Option<String>,
    pub agent_id: Option<String>,
}

/// GET /ws?projectId=..&agentId=..
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    params: Result<Query<ConnectParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let context_id = params
        .project_id
        .filter(|p| !p.is_empty())
        .map(ContextId::from_raw)
        .ok_or_else(|| ApiError::bad_request("projectId is required"))?;
    let agent_id = params
        .agent_id
        .filter(|a| !a.is_empty())
        .map_or_else(AgentId::anonymous, AgentId::from_raw);

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state.hub, context_id, agent_id)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SubscriptionHub>, context_id: ContextId, agent_id: AgentId) {
    let (connection_id, rx) = hub.subscribe(&context_id, agent_id);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).set(hub.connection_count() as f64);

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, connection_id.clone()));

    let reader_hub = Arc::clone(&hub);
    let reader_id = connection_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(reply) = handle_client_frame(&reader_hub, &reader_id, text.as_str()) {
                        reader_hub.send_to(&reader_id, &reply);
                    }
                }
                WsMessage::Close(_) => break,
                // axum answers pings itself
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.unsubscribe(&connection_id);
    gauge!(WS_CONNECTIONS_ACTIVE).set(hub.connection_count() as f64);
    info!(connection_id = %connection_id, context_id = %context_id, "WebSocket client disconnected");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if ws_tx.send(WsMessage::Text((&*text).into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!(connection_id = %connection_id, "sent ping");
            }
        }
    }
}

/// Handle one inbound text frame; returns the direct reply, if any.
pub fn handle_client_frame(hub: &SubscriptionHub, connection_id: &ConnectionId, text: &str) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "malformed client frame");
            return Some(ServerMessage::error(format!("invalid message: {e}"), 400));
        }
    };

    match message {
        ClientMessage::Ping => Some(ServerMessage::pong()),
        ClientMessage::SubscribeToChanges { last_version } => {
            if let Some(last_version) = last_version {
                hub.set_last_version(connection_id, last_version);
            }
            None
        }
        ClientMessage::ContextUpdate { diff } => Some(match hub.submit_diff(connection_id, &diff) {
            Ok(outcome) => ServerMessage::ack(&outcome),
            Err(e) => ServerMessage::from(&e),
        }),
    }
}
