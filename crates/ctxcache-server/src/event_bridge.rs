use std::sync::Arc;

use ctxcache_store::ContextEvent;
use ctxcache_telemetry::metrics::CTX_EVENTS_LAGGED_TOTAL;
use metrics::counter;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::hub::SubscriptionHub;

/// Forwards store events to the subscription hub until cancelled.
pub fn spawn(
    hub: Arc<SubscriptionHub>,
    mut events: broadcast::Receiver<ContextEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => dispatch(&hub, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bridge lagged, dropped events");
                        counter!(CTX_EVENTS_LAGGED_TOTAL).increment(skipped);
                        hub.reconcile();
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("store event channel closed");
                        break;
                    }
                },
                () = cancel.cancelled() => break,
            }
        }
    })
}

pub fn dispatch(hub: &SubscriptionHub, event: &ContextEvent) {
    match event {
        ContextEvent::Updated {
            context_id,
            generation,
            version,
            agent_id,
            origin,
        } => {
            hub.on_write(context_id, *generation, version, agent_id, origin.as_ref());
        }
        ContextEvent::Deleted {
            context_id,
            generation,
            reason,
        } => {
            hub.on_delete(context_id, *generation, *reason);
        }
    }
}
