//! Live push channels per context and best-effort fan-out of changes.

use std::collections::HashSet;
use std::sync::Arc;

use ctxcache_core::{AgentId, CacheError, ConnectionId, ContextDiff, ContextId, ContextVersion, VersionId};
use ctxcache_store::{ContextStore, DeleteReason, Generation, WriteOutcome};
use ctxcache_telemetry::metrics::CTX_BROADCAST_DROPS_TOTAL;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::protocol::ServerMessage;

/// Frame queued for a connection's writer task.
#[derive(Clone, Debug)]
pub enum Outbound {
    Text(Arc<str>),
    /// Send a close frame and stop.
    Close,
}

/// Which incarnation of the context a connection watches, and how far it has seen.
struct Delivery {
    generation: Generation,
    /// Highest version pushed to (or written by) this connection.
    last_version: VersionId,
}

struct Subscription {
    context_id: ContextId,
    agent_id: AgentId,
    tx: mpsc::Sender<Outbound>,
    delivery: Mutex<Delivery>,
}

impl Subscription {
    fn push(&self, connection_id: &ConnectionId, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection_id,
                    context_id = %self.context_id,
                    "send queue full, dropping message"
                );
                counter!(CTX_BROADCAST_DROPS_TOTAL, "cause" => "full").increment(1);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %connection_id, "send on closed channel");
                counter!(CTX_BROADCAST_DROPS_TOTAL, "cause" => "closed").increment(1);
                false
            }
        }
    }

    /// Push `frame` only if it belongs to the watched generation and
    /// `version` is newer than anything already delivered.
    fn offer(&self, connection_id: &ConnectionId, generation: Generation, version: VersionId, frame: Arc<str>) -> bool {
        let mut delivery = self.delivery.lock();
        self.offer_locked(&mut delivery, connection_id, generation, version, frame)
    }

    fn offer_locked(
        &self,
        delivery: &mut Delivery,
        connection_id: &ConnectionId,
        generation: Generation,
        version: VersionId,
        frame: Arc<str>,
    ) -> bool {
        if delivery.generation != generation || delivery.last_version >= version {
            return false;
        }
        delivery.last_version = version;
        self.push(connection_id, Outbound::Text(frame))
    }

    fn mark_delivered(&self, generation: Generation, version: VersionId) {
        let mut delivery = self.delivery.lock();
        if delivery.generation == generation {
            delivery.last_version = delivery.last_version.max(version);
        }
    }

    fn generation(&self) -> Generation {
        self.delivery.lock().generation
    }
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json.into()),
        Err(e) => {
            warn!(error = %e, "failed to serialize push message");
            None
        }
    }
}

/// Registry of push channels, indexed by connection and by context.
pub struct SubscriptionHub {
    store: Arc<ContextStore>,
    subscriptions: DashMap<ConnectionId, Arc<Subscription>>,
    by_context: DashMap<ContextId, HashSet<ConnectionId>>,
    max_send_queue: usize,
}

impl SubscriptionHub {
    pub fn new(store: Arc<ContextStore>, max_send_queue: usize) -> Self {
        Self {
            store,
            subscriptions: DashMap::new(),
            by_context: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Open a push channel on `context_id`. Queues one `context_snapshot` when
    /// the context already has a version.
    pub fn subscribe(&self, context_id: &ContextId, agent_id: AgentId) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let subscription = Arc::new(Subscription {
            context_id: context_id.clone(),
            agent_id,
            tx,
            delivery: Mutex::new(Delivery {
                generation: 0,
                last_version: 0,
            }),
        });

        // Held until the generation is known; concurrent fan-out blocks on it.
        let mut delivery = subscription.delivery.lock();
        self.subscriptions
            .insert(connection_id.clone(), Arc::clone(&subscription));
        self.by_context
            .entry(context_id.clone())
            .or_default()
            .insert(connection_id.clone());

        let attached = self.store.attach_subscriber(context_id, connection_id.clone());
        let mut snapshot_version = None;
        if let Some(attached) = attached {
            delivery.generation = attached.generation;
            if let Some(current) = &attached.current {
                if let Some(frame) = encode(&ServerMessage::snapshot(context_id, current)) {
                    subscription.offer_locked(&mut delivery, &connection_id, attached.generation, current.version, frame);
                }
                snapshot_version = Some(current.version);
            }
        }
        let generation = delivery.generation;
        drop(delivery);

        info!(
            connection_id = %connection_id,
            context_id = %context_id,
            agent_id = %subscription.agent_id,
            generation,
            snapshot_version,
            "subscriber attached"
        );
        (connection_id, rx)
    }

    /// Fan a new version out to every subscriber of that incarnation of the
    /// context except `origin`. Returns the number of channels the update was
    /// queued on.
    pub fn on_write(
        &self,
        context_id: &ContextId,
        generation: Generation,
        version: &ContextVersion,
        agent_id: &AgentId,
        origin: Option<&ConnectionId>,
    ) -> usize {
        if let Some(sub) = origin.and_then(|id| self.subscription(id)) {
            sub.mark_delivered(generation, version.version);
        }

        let targets = self.subscribers_of(context_id);
        if targets.is_empty() {
            return 0;
        }
        let Some(frame) = encode(&ServerMessage::update(context_id, version, Some(agent_id.clone()))) else {
            return 0;
        };

        let delivered = targets
            .iter()
            .filter(|(id, _)| Some(id) != origin)
            .filter(|(id, sub)| sub.offer(id, generation, version.version, Arc::clone(&frame)))
            .count();
        debug!(
            context_id = %context_id,
            version = version.version,
            recipients = delivered,
            "broadcast context update"
        );
        delivered
    }

    /// Tell the subscribers of that incarnation the context is gone, then
    /// close their channels. Subscribers of a newer incarnation are untouched.
    pub fn on_delete(&self, context_id: &ContextId, generation: Generation, reason: DeleteReason) -> usize {
        self.close_where(context_id, reason, |sub| sub.generation() == generation)
    }

    /// Recover from missed store events: close channels whose context is gone
    /// or was re-created, and catch the rest up to the current version.
    pub fn reconcile(&self) -> (usize, usize) {
        let context_ids: Vec<ContextId> = self.by_context.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        let mut caught_up = 0;
        for context_id in context_ids {
            let live = self.store.generation(&context_id);
            closed += self.close_where(&context_id, DeleteReason::Vanished, |sub| {
                Some(sub.generation()) != live
            });
            for (connection_id, sub) in self.subscribers_of(&context_id) {
                let since = sub.delivery.lock().last_version;
                if self.catch_up(&connection_id, &sub, since) {
                    caught_up += 1;
                }
            }
        }
        if closed > 0 || caught_up > 0 {
            info!(closed, caught_up, "reconciled subscribers with store");
        }
        (closed, caught_up)
    }

    /// Remove a connection and detach it from its context.
    pub fn unsubscribe(&self, connection_id: &ConnectionId) {
        let Some((_, sub)) = self.subscriptions.remove(connection_id) else {
            return;
        };
        if let Some(mut ids) = self.by_context.get_mut(&sub.context_id) {
            ids.remove(connection_id);
        }
        self.by_context.remove_if(&sub.context_id, |_, ids| ids.is_empty());
        self.store.detach_subscriber(&sub.context_id, connection_id);
        info!(connection_id = %connection_id, context_id = %sub.context_id, "subscriber detached");
    }

    /// Record the client's `last_version`; queues a catch-up update when the
    /// context has moved past it.
    pub fn set_last_version(&self, connection_id: &ConnectionId, last_version: VersionId) -> bool {
        let Some(sub) = self.subscription(connection_id) else {
            return false;
        };
        sub.delivery.lock().last_version = last_version;
        self.catch_up(connection_id, &sub, last_version)
    }

    /// Apply a diff submitted over the push channel, attributed to that connection.
    pub fn submit_diff(&self, connection_id: &ConnectionId, diff: &ContextDiff) -> Result<WriteOutcome, CacheError> {
        let sub = self
            .subscription(connection_id)
            .ok_or_else(|| CacheError::BadRequest(format!("unknown connection {connection_id}")))?;
        self.store.put_diff(
            &sub.context_id,
            diff,
            sub.agent_id.clone(),
            Some(connection_id.clone()),
        )
    }

    /// Queue a direct reply on one connection.
    pub fn send_to(&self, connection_id: &ConnectionId, message: &ServerMessage) -> bool {
        let Some(sub) = self.subscription(connection_id) else {
            return false;
        };
        encode(message).is_some_and(|frame| sub.push(connection_id, Outbound::Text(frame)))
    }

    /// Close every channel. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let connection_ids: Vec<ConnectionId> =
            self.subscriptions.iter().map(|e| e.key().clone()).collect();
        let count = connection_ids.len();
        for connection_id in connection_ids {
            if let Some(sub) = self.subscription(&connection_id) {
                sub.push(&connection_id, Outbound::Close);
            }
            self.unsubscribe(&connection_id);
        }
        count
    }

    pub fn connection_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscriber_count(&self, context_id: &ContextId) -> usize {
        self.by_context.get(context_id).map_or(0, |ids| ids.len())
    }

    /// Remove and close the subscriptions on `context_id` matching `pred`.
    fn close_where(&self, context_id: &ContextId, reason: DeleteReason, pred: impl Fn(&Subscription) -> bool) -> usize {
        let frame = encode(&ServerMessage::deleted(context_id, reason.as_str()));
        let mut closed = 0;
        for (connection_id, sub) in self.subscribers_of(context_id) {
            if !pred(&*sub) || self.subscriptions.remove(&connection_id).is_none() {
                continue;
            }
            if let Some(mut ids) = self.by_context.get_mut(context_id) {
                ids.remove(&connection_id);
            }
            if let Some(frame) = &frame {
                sub.push(&connection_id, Outbound::Text(Arc::clone(frame)));
            }
            sub.push(&connection_id, Outbound::Close);
            closed += 1;
        }
        self.by_context.remove_if(context_id, |_, ids| ids.is_empty());
        if closed > 0 {
            info!(context_id = %context_id, reason = reason.as_str(), closed, "subscribers closed");
        }
        closed
    }

    /// Queue the changes after `since` when the subscription's context has moved past it.
    fn catch_up(&self, connection_id: &ConnectionId, sub: &Subscription, since: VersionId) -> bool {
        let Some(generation) = self.store.generation(&sub.context_id) else {
            return false;
        };
        match self.store.get_since(&sub.context_id, since) {
            Ok(result) if result.current.version > since => {
                let message = ServerMessage::update_with_diff(
                    &sub.context_id,
                    &result.current,
                    result.diff,
                    None,
                    result.full_resync,
                );
                encode(&message).is_some_and(|frame| {
                    sub.offer(connection_id, generation, result.current.version, frame)
                })
            }
            Ok(_) | Err(CacheError::NotFound(_)) => false,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "catch-up failed");
                false
            }
        }
    }

    fn subscription(&self, connection_id: &ConnectionId) -> Option<Arc<Subscription>> {
        self.subscriptions.get(connection_id).map(|s| Arc::clone(s.value()))
    }

    fn subscribers_of(&self, context_id: &ContextId) -> Vec<(ConnectionId, Arc<Subscription>)> {
        let ids: Vec<ConnectionId> = match self.by_context.get(context_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| self.subscription(&id).map(|sub| (id, sub)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxcache_core::Payload;
    use ctxcache_store::StoreConfig;
    use serde_json::{json, Value};

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    fn setup(queue: usize) -> (Arc<ContextStore>, SubscriptionHub) {
        let store = Arc::new(ContextStore::new(StoreConfig::default()));
        let hub = SubscriptionHub::new(Arc::clone(&store), queue);
        (store, hub)
    }

    fn agent() -> AgentId {
        AgentId::from_raw("writer")
    }

    fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv().expect("expected a queued frame") {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("expected text, got close"),
        }
    }

    fn write(store: &ContextStore, hub: &SubscriptionHub, id: &ContextId, v: Value, origin: Option<&ConnectionId>) -> usize {
        let out = store
            .put_full(id, payload(v), agent(), origin.cloned())
            .unwrap();
        let version = store.get_version(id, out.version).unwrap();
        let generation = store.generation(id).unwrap();
        hub.on_write(id, generation, &version, &agent(), origin)
    }

    #[test]
    fn subscribe_before_write_sends_nothing() {
        let (_store, hub) = setup(8);
        let (_conn, mut rx) = hub.subscribe(&ContextId::from_raw("p2"), agent());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn first_write_reaches_early_subscriber() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p2");
        let (_conn, mut rx) = hub.subscribe(&id, AgentId::from_raw("reader"));

        assert_eq!(write(&store, &hub, &id, json!({"x": 1}), None), 1);
        let msg = next_json(&mut rx);
        assert_eq!(msg["type"], "context_update");
        assert_eq!(msg["version"], 1);
        assert_eq!(msg["diff"]["added"], json!({"x": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_after_write_sends_one_snapshot() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        store.put_full(&id, payload(json!({"a": 1})), agent(), None).unwrap();
        store.put_full(&id, payload(json!({"a": 2})), agent(), None).unwrap();

        let (_conn, mut rx) = hub.subscribe(&id, agent());
        let msg = next_json(&mut rx);
        assert_eq!(msg["type"], "context_snapshot");
        assert_eq!(msg["version"], 2);
        assert_eq!(msg["context"], json!({"a": 2}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn origin_is_not_echoed() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        let (writer, mut writer_rx) = hub.subscribe(&id, agent());
        let (_reader, mut reader_rx) = hub.subscribe(&id, agent());

        assert_eq!(write(&store, &hub, &id, json!({"a": 1}), Some(&writer)), 1);
        assert!(writer_rx.try_recv().is_err());
        assert_eq!(next_json(&mut reader_rx)["version"], 1);
    }

    #[test]
    fn same_version_delivered_once() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        let (_conn, mut rx) = hub.subscribe(&id, agent());
        store.put_full(&id, payload(json!({"a": 1})), agent(), None).unwrap();
        let version = store.get_current(&id).unwrap();
        let generation = store.generation(&id).unwrap();

        assert_eq!(hub.on_write(&id, generation, &version, &agent(), None), 1);
        assert_eq!(hub.on_write(&id, generation, &version, &agent(), None), 0);
        next_json(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_failing_others() {
        let (store, hub) = setup(1);
        let id = ContextId::from_raw("p1");
        let (_slow, mut slow_rx) = hub.subscribe(&id, agent());
        let (_fast, mut fast_rx) = hub.subscribe(&id, agent());

        write(&store, &hub, &id, json!({"n": 1}), None);
        fast_rx.try_recv().unwrap();
        let delivered = write(&store, &hub, &id, json!({"n": 2}), None);
        assert_eq!(delivered, 1);
        assert_eq!(next_json(&mut fast_rx)["version"], 2);
        assert_eq!(next_json(&mut slow_rx)["version"], 1);
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn delete_notifies_then_closes() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        store.put_full(&id, payload(json!({"a": 1})), agent(), None).unwrap();
        let (_conn, mut rx) = hub.subscribe(&id, agent());
        next_json(&mut rx);

        let generation = store.generation(&id).unwrap();
        assert_eq!(hub.on_delete(&id, generation, DeleteReason::Explicit), 1);
        let msg = next_json(&mut rx);
        assert_eq!(msg["type"], "context_deleted");
        assert_eq!(msg["reason"], "explicit");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(&id), 0);
    }

    #[test]
    fn unsubscribe_detaches_from_store() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("ghost");
        let (conn, _rx) = hub.subscribe(&id, agent());
        assert!(store.contains(&id));

        hub.unsubscribe(&conn);
        assert_eq!(hub.connection_count(), 0);
        assert!(!store.contains(&id));
    }

    #[test]
    fn stale_client_gets_catch_up() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        store.put_full(&id, payload(json!({"a": 1, "b": 2})), agent(), None).unwrap();
        let (conn, mut rx) = hub.subscribe(&id, agent());
        next_json(&mut rx);
        store.put_full(&id, payload(json!({"a": 1, "b": 3, "c": 4})), agent(), None).unwrap();

        assert!(hub.set_last_version(&conn, 1));
        let msg = next_json(&mut rx);
        assert_eq!(msg["type"], "context_update");
        assert_eq!(msg["version"], 2);
        assert_eq!(msg["diff"]["added"], json!({"c": 4}));
        assert_eq!(msg["diff"]["modified"], json!({"b": 3}));
    }

    #[test]
    fn up_to_date_client_gets_nothing() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        store.put_full(&id, payload(json!({"a": 1})), agent(), None).unwrap();
        let (conn, mut rx) = hub.subscribe(&id, agent());
        next_json(&mut rx);
        assert!(!hub.set_last_version(&conn, 1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn submit_diff_writes_as_connection() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        let (conn, _rx) = hub.subscribe(&id, AgentId::from_raw("ws-agent"));

        let mut diff = ContextDiff::default();
        diff.added.insert("k".into(), json!("v"));
        let outcome = hub.submit_diff(&conn, &diff).unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(store.get_current(&id).unwrap().payload["k"], "v");
    }

    #[test]
    fn close_all_empties_hub() {
        let (_store, hub) = setup(8);
        let (_a, mut rx_a) = hub.subscribe(&ContextId::from_raw("p1"), agent());
        let (_b, _rx_b) = hub.subscribe(&ContextId::from_raw("p2"), agent());
        assert_eq!(hub.close_all(), 2);
        assert_eq!(hub.connection_count(), 0);
        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn queued_events_of_deleted_context_skip_new_subscriber() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        let mut events = store.subscribe_events();
        store.put_full(&id, payload(json!({"a": 1})), agent(), None).unwrap();
        store.delete(&id).unwrap();

        // Reconnect before the queued update and delete are fanned out.
        let (conn, mut rx) = hub.subscribe(&id, agent());
        while let Ok(event) = events.try_recv() {
            crate::event_bridge::dispatch(&hub, &event);
        }

        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connection_count(), 1);

        hub.unsubscribe(&conn);
        assert!(store.summaries().is_empty());
    }

    #[test]
    fn delete_leaves_newer_incarnation_open() {
        let (store, hub) = setup(8);
        let id = ContextId::from_raw("p1");
        let (_old, mut old_rx) = hub.subscribe(&id, agent());
        let old_generation = store.generation(&id).unwrap();
        store.delete(&id).unwrap();
        let (_new, mut new_rx) = hub.subscribe(&id, agent());

        assert_eq!(hub.on_delete(&id, old_generation, DeleteReason::Explicit), 1);
        assert_eq!(next_json(&mut old_rx)["type"], "context_deleted");
        assert!(matches!(old_rx.try_recv(), Ok(Outbound::Close)));
        assert!(new_rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count(&id), 1);
    }

    #[test]
    fn reconcile_closes_vanished_and_catches_up_live() {
        let (store, hub) = setup(8);
        let gone = ContextId::from_raw("gone");
        let live = ContextId::from_raw("live");
        let (_a, mut gone_rx) = hub.subscribe(&gone, agent());
        let (_b, mut live_rx) = hub.subscribe(&live, agent());

        // Store changes whose events never reach the hub.
        store.put_full(&live, payload(json!({"x": 1})), agent(), None).unwrap();
        store.delete(&gone).unwrap();

        assert_eq!(hub.reconcile(), (1, 1));
        let msg = next_json(&mut gone_rx);
        assert_eq!(msg["type"], "context_deleted");
        assert_eq!(msg["reason"], "unknown");
        assert!(matches!(gone_rx.try_recv(), Ok(Outbound::Close)));

        let msg = next_json(&mut live_rx);
        assert_eq!(msg["type"], "context_update");
        assert_eq!(msg["version"], 1);
        assert_eq!(msg["diff"]["added"], json!({"x": 1}));
        assert_eq!(hub.connection_count(), 1);
    }
}
