//! In-memory registry of shared contexts and their bounded version chains.

use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ctxcache_core::{
    aggregate, apply_diff, compute_diff, serialized_size, tokens_saved, trim_to_budget, AgentId,
    CacheError, ConnectionId, ContextDiff, ContextId, ContextVersion, Payload, VersionId,
};
use ctxcache_telemetry::metrics::{
    CTX_CONTEXTS_ACTIVE, CTX_EVICTIONS_TOTAL, CTX_KEYS_STUBBED_TOTAL, CTX_READS_TOTAL,
    CTX_TOKENS_SAVED_TOTAL, CTX_WRITES_TOTAL, CTX_WRITE_ERRORS_TOTAL,
};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::events::{ContextEvent, DeleteReason, Generation};

/// State for one context id. Only ever touched under its own mutex.
struct SharedContext {
    generation: Generation,
    versions: VecDeque<Arc<ContextVersion>>,
    next_version: VersionId,
    subscribers: HashSet<ConnectionId>,
    last_accessed: DateTime<Utc>,
    access_count: u64,
    cached_snapshot: Option<Arc<str>>,
    /// Set once the context has left the registry; holders of a stale handle must retry.
    removed: bool,
}

impl SharedContext {
    fn new(generation: Generation) -> Self {
        Self {
            generation,
            versions: VecDeque::new(),
            next_version: 1,
            subscribers: HashSet::new(),
            last_accessed: Utc::now(),
            access_count: 0,
            cached_snapshot: None,
            removed: false,
        }
    }

    fn current(&self) -> Option<&Arc<ContextVersion>> {
        self.versions.back()
    }

    fn version(&self, version: VersionId) -> Option<&Arc<ContextVersion>> {
        self.versions.iter().find(|v| v.version == version)
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }

    fn append(&mut self, version: Arc<ContextVersion>, max_versions: usize) {
        self.next_version = version.version + 1;
        self.versions.push_back(version);
        while self.versions.len() > max_versions {
            self.versions.pop_front();
        }
    }

    fn is_reclaimable(&self) -> bool {
        self.versions.is_empty() && self.subscribers.is_empty()
    }

    fn since(&self, since: VersionId) -> Option<SinceResult> {
        let current = Arc::clone(self.versions.back()?);
        let oldest = self.versions.front()?.version;

        if since.saturating_add(1) < oldest {
            return Some(SinceResult {
                diff: ContextDiff::full(&current.payload),
                current,
                full_resync: true,
            });
        }

        let diffs: Vec<Cow<'_, ContextDiff>> = self
            .versions
            .iter()
            .filter(|v| v.version > since)
            .map(|v| match &v.diff_from_previous {
                Some(diff) => Cow::Borrowed(diff),
                None => Cow::Owned(ContextDiff::full(&v.payload)),
            })
            .collect();
        let diff = aggregate(diffs.iter().map(|d| &**d), &current.payload);

        Some(SinceResult {
            current,
            diff,
            full_resync: false,
        })
    }
}

/// Current version plus its cached JSON serialization.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: Arc<ContextVersion>,
    pub serialized: Arc<str>,
}

/// What a new push channel sees when it attaches.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub generation: Generation,
    /// Version to send as the initial snapshot, if the context has one.
    pub current: Option<Arc<ContextVersion>>,
}

/// Aggregated changes after a given version.
#[derive(Clone, Debug)]
pub struct SinceResult {
    pub current: Arc<ContextVersion>,
    pub diff: ContextDiff,
    /// True when the requested version fell outside the retained window and
    /// `diff.added` carries the entire current payload.
    pub full_resync: bool,
}

/// Result of an accepted write.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub context_id: ContextId,
    pub version: VersionId,
    pub content_hash: String,
    pub timestamp: DateTime<Utc>,
    pub tokens_saved: usize,
    /// Keys replaced by reference stubs to fit the token budget.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stubbed_keys: Vec<String>,
}

/// Per-context counters exposed on `/metrics`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub id: ContextId,
    pub version: Option<VersionId>,
    pub versions: usize,
    pub subscribers: usize,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
}

/// Contexts removed by one sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<ContextId>,
    pub evicted: Vec<ContextId>,
    pub collected: Vec<ContextId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty() && self.collected.is_empty()
    }
}

#[derive(Clone, Copy)]
enum WriteKind {
    Full,
    Diff,
}

impl WriteKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Diff => "diff",
        }
    }
}

/// Registry of shared contexts.
///
/// Each context sits behind its own mutex, held across
/// "load previous, compute diff, append" so concurrent writers to one id
/// produce a gap-free, strictly increasing version chain.
pub struct ContextStore {
    contexts: DashMap<ContextId, Arc<Mutex<SharedContext>>>,
    config: StoreConfig,
    events: broadcast::Sender<ContextEvent>,
    tokens_saved: AtomicU64,
    next_generation: AtomicU64,
}

impl ContextStore {
    pub fn new(config: StoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            contexts: DashMap::new(),
            config,
            events,
            tokens_saved: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Receive every update and delete published from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, id: &ContextId) -> bool {
        self.contexts.contains_key(id)
    }

    /// Generation of the live context under `id`, if any. Does not count as an access.
    pub fn generation(&self, id: &ContextId) -> Option<Generation> {
        self.with_context(id, false, |ctx| ctx.generation)
    }

    /// Cumulative estimated tokens saved across all writes.
    pub fn total_tokens_saved(&self) -> u64 {
        self.tokens_saved.load(Ordering::Relaxed)
    }

    // ── Reads ──

    pub fn get_current(&self, id: &ContextId) -> Result<Arc<ContextVersion>, CacheError> {
        let found = self
            .with_context(id, false, |ctx| {
                ctx.touch();
                ctx.current().cloned()
            })
            .flatten();
        record_read(found.is_some());
        found.ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    /// Current version with its serialized payload, served from the derived cache.
    pub fn snapshot(&self, id: &ContextId) -> Result<Snapshot, CacheError> {
        let found = self
            .with_context(id, false, |ctx| {
                ctx.touch();
                let version = Arc::clone(ctx.current()?);
                let serialized = match ctx.cached_snapshot.clone() {
                    Some(cached) => cached,
                    None => {
                        let fresh: Arc<str> = serde_json::to_string(&version.payload).ok()?.into();
                        ctx.cached_snapshot = Some(Arc::clone(&fresh));
                        fresh
                    }
                };
                Some(Snapshot { version, serialized })
            })
            .flatten();
        record_read(found.is_some());
        found.ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    pub fn get_version(&self, id: &ContextId, version: VersionId) -> Result<Arc<ContextVersion>, CacheError> {
        let found = self.with_context(id, false, |ctx| {
            ctx.touch();
            ctx.version(version).cloned()
        });
        record_read(matches!(found, Some(Some(_))));
        match found {
            None => Err(CacheError::NotFound(id.clone())),
            Some(None) => Err(CacheError::VersionNotFound {
                context_id: id.clone(),
                version,
            }),
            Some(Some(v)) => Ok(v),
        }
    }

    /// Aggregated diff of every change after `since`.
    ///
    /// Falls back to the whole current payload as `added` when `since` is older
    /// than the retained window.
    pub fn get_since(&self, id: &ContextId, since: VersionId) -> Result<SinceResult, CacheError> {
        let found = self
            .with_context(id, false, |ctx| {
                ctx.touch();
                ctx.since(since)
            })
            .flatten();
        record_read(found.is_some());
        found.ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    // ── Writes ──

    /// Store a full payload, trimmed to the configured token budget.
    pub fn put_full(
        &self,
        id: &ContextId,
        payload: Payload,
        agent_id: AgentId,
        origin: Option<ConnectionId>,
    ) -> Result<WriteOutcome, CacheError> {
        if let Err(e) = self.check_size(&payload) {
            record_write_error(&e);
            return Err(e);
        }

        let trimmed = trim_to_budget(&payload, self.config.token_budget, &self.config.priorities);
        let trim_savings = tokens_saved(&trimmed.payload, &payload);
        if !trimmed.stubbed.is_empty() {
            debug!(
                context_id = %id,
                stubbed = ?trimmed.stubbed,
                budget = self.config.token_budget,
                "payload trimmed to token budget"
            );
            counter!(CTX_KEYS_STUBBED_TOTAL).increment(trimmed.stubbed.len() as u64);
        }

        let stubbed = trimmed.stubbed;
        let trimmed_payload = trimmed.payload;
        let mut outcome = self.commit(id, WriteKind::Full, agent_id, origin, trim_savings, |_| {
            Ok(trimmed_payload)
        })?;
        outcome.stubbed_keys = stubbed;
        Ok(outcome)
    }

    /// Apply `diff` to the latest payload (or `{}`) and store the result.
    pub fn put_diff(
        &self,
        id: &ContextId,
        diff: &ContextDiff,
        agent_id: AgentId,
        origin: Option<ConnectionId>,
    ) -> Result<WriteOutcome, CacheError> {
        self.commit(id, WriteKind::Diff, agent_id, origin, 0, |previous| {
            let next = match previous {
                Some(base) => apply_diff(base, diff),
                None => apply_diff(&Payload::new(), diff),
            };
            self.check_size(&next)?;
            Ok(next)
        })
    }

    /// Remove a context; subscribers are told and their channels closed by the hub.
    pub fn delete(&self, id: &ContextId) -> Result<(), CacheError> {
        if self.remove_context_if(id, Some(DeleteReason::Explicit), |_| true) {
            Ok(())
        } else {
            Err(CacheError::NotFound(id.clone()))
        }
    }

    // ── Subscribers ──

    /// Register a push channel on `id`, creating the context if needed.
    pub fn attach_subscriber(&self, id: &ContextId, connection: ConnectionId) -> Option<Attachment> {
        self.with_context(id, true, |ctx| {
            ctx.subscribers.insert(connection);
            ctx.touch();
            Attachment {
                generation: ctx.generation,
                current: ctx.current().cloned(),
            }
        })
    }

    /// Drop a push channel. A never-written context left without subscribers
    /// is discarded.
    pub fn detach_subscriber(&self, id: &ContextId, connection: &ConnectionId) {
        let reclaimable = self
            .with_context(id, false, |ctx| {
                ctx.subscribers.remove(connection);
                ctx.is_reclaimable()
            })
            .unwrap_or(false);

        if reclaimable && self.remove_context_if(id, None, SharedContext::is_reclaimable) {
            debug!(context_id = %id, "discarded empty context");
        }
    }

    // ── Introspection ──

    pub fn summaries(&self) -> Vec<ContextSummary> {
        let mut summaries: Vec<ContextSummary> = self
            .entries()
            .into_iter()
            .map(|(id, entry)| {
                let ctx = entry.lock();
                ContextSummary {
                    id,
                    version: ctx.current().map(|v| v.version),
                    versions: ctx.versions.len(),
                    subscribers: ctx.subscribers.len(),
                    access_count: ctx.access_count,
                    last_accessed: ctx.last_accessed,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    // ── Eviction ──

    /// One eviction pass: TTL expiry, silent removal of empty contexts, then
    /// LRU eviction down to `max_contexts`.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut report = SweepReport::default();
        let mut survivors = Vec::new();

        for (id, entry) in self.entries() {
            let (last_accessed, reclaimable) = {
                let ctx = entry.lock();
                (ctx.last_accessed, ctx.is_reclaimable())
            };

            if now - last_accessed > ttl {
                if self.remove_context_if(&id, Some(DeleteReason::Expired), |ctx| {
                    now - ctx.last_accessed > ttl
                }) {
                    report.expired.push(id);
                    continue;
                }
            } else if reclaimable && self.remove_context_if(&id, None, SharedContext::is_reclaimable) {
                report.collected.push(id);
                continue;
            }
            survivors.push((id, last_accessed));
        }

        if survivors.len() > self.config.max_contexts {
            let overflow = survivors.len() - self.config.max_contexts;
            report.evicted = self.evict_lru(survivors, overflow);
        }

        counter!(CTX_EVICTIONS_TOTAL, "reason" => "ttl").increment(report.expired.len() as u64);
        counter!(CTX_EVICTIONS_TOTAL, "reason" => "capacity").increment(report.evicted.len() as u64);
        counter!(CTX_EVICTIONS_TOTAL, "reason" => "empty").increment(report.collected.len() as u64);
        report
    }

    // ── Internals ──

    /// Evict up to `overflow` contexts, oldest `last_accessed` first.
    /// A candidate touched since it was observed is skipped.
    fn evict_lru(&self, mut candidates: Vec<(ContextId, DateTime<Utc>)>, mut overflow: usize) -> Vec<ContextId> {
        candidates.sort_by(|a, b| a.1.cmp(&b.1));
        let mut evicted = Vec::new();
        for (id, seen) in candidates {
            if overflow == 0 {
                break;
            }
            if self.remove_context_if(&id, Some(DeleteReason::Evicted), |ctx| {
                ctx.last_accessed <= seen
            }) {
                evicted.push(id);
                overflow -= 1;
            }
        }
        evicted
    }

    fn entries(&self) -> Vec<(ContextId, Arc<Mutex<SharedContext>>)> {
        self.contexts
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Run `f` under the context's lock, optionally creating the context.
    /// Returns `None` when the context does not exist and `create` is false.
    fn with_context<R>(
        &self,
        id: &ContextId,
        create: bool,
        f: impl FnOnce(&mut SharedContext) -> R,
    ) -> Option<R> {
        let entry = if create {
            let entry = Arc::clone(
                self.contexts
                    .entry(id.clone())
                    .or_insert_with(|| {
                        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        Arc::new(Mutex::new(SharedContext::new(generation)))
                    })
                    .value(),
            );
            gauge!(CTX_CONTEXTS_ACTIVE).set(self.contexts.len() as f64);
            entry
        } else {
            Arc::clone(self.contexts.get(id)?.value())
        };

        let mut ctx = entry.lock();
        if ctx.removed {
            // Lost a race with removal; look the id up again.
            drop(ctx);
            return self.with_context(id, create, f);
        }
        Some(f(&mut ctx))
    }

    fn commit(
        &self,
        id: &ContextId,
        kind: WriteKind,
        agent_id: AgentId,
        origin: Option<ConnectionId>,
        extra_savings: usize,
        build: impl FnOnce(Option<&Payload>) -> Result<Payload, CacheError>,
    ) -> Result<WriteOutcome, CacheError> {
        let max_versions = self.config.max_versions;
        let committed = self.with_context(id, true, |ctx| -> Result<_, CacheError> {
            let payload = build(ctx.current().map(|v| &v.payload))?;
            let diff = ctx.current().map(|prev| compute_diff(&prev.payload, &payload));
            let diff_savings = diff.as_ref().map_or(0, |d| tokens_saved(d, &payload));
            let serialized: Arc<str> = serde_json::to_string(&payload)?.into();

            let version = Arc::new(ContextVersion::new(ctx.next_version, payload, diff));
            ctx.append(Arc::clone(&version), max_versions);
            ctx.cached_snapshot = Some(serialized);
            ctx.touch();

            // Published under the context lock so subscribers see versions in order.
            let _ = self.events.send(ContextEvent::Updated {
                context_id: id.clone(),
                generation: ctx.generation,
                version: Arc::clone(&version),
                agent_id,
                origin,
            });
            Ok((version, diff_savings + extra_savings))
        });

        let (version, saved) = match committed {
            Some(Ok(done)) => done,
            Some(Err(e)) => {
                // A rejected first write must not leave an empty context behind.
                self.remove_context_if(id, None, SharedContext::is_reclaimable);
                record_write_error(&e);
                return Err(e);
            }
            None => return Err(CacheError::Internal(format!("context {id} unavailable"))),
        };

        self.tokens_saved.fetch_add(saved as u64, Ordering::Relaxed);
        counter!(CTX_WRITES_TOTAL, "kind" => kind.as_str()).increment(1);
        counter!(CTX_TOKENS_SAVED_TOTAL).increment(saved as u64);
        debug!(
            context_id = %id,
            version = version.version,
            kind = kind.as_str(),
            size = version.serialized_size,
            tokens_saved = saved,
            "context version stored"
        );

        Ok(WriteOutcome {
            context_id: id.clone(),
            version: version.version,
            content_hash: version.content_hash.clone(),
            timestamp: version.timestamp,
            tokens_saved: saved,
            stubbed_keys: Vec::new(),
        })
    }

    fn check_size(&self, payload: &Payload) -> Result<usize, CacheError> {
        let size = serialized_size(payload);
        if size > self.config.max_context_size {
            return Err(CacheError::PayloadTooLarge {
                size,
                limit: self.config.max_context_size,
            });
        }
        Ok(size)
    }

    /// Remove `id` if `pred` holds under its lock. `reason` of `None` removes
    /// silently; evictions only notify when subscribers are still attached.
    fn remove_context_if(
        &self,
        id: &ContextId,
        reason: Option<DeleteReason>,
        pred: impl FnOnce(&SharedContext) -> bool,
    ) -> bool {
        let removed = self
            .contexts
            .remove_if(id, |_, entry| {
                let mut ctx = entry.lock();
                if !pred(&*ctx) {
                    return false;
                }
                ctx.removed = true;
                let notify = match reason {
                    None => false,
                    Some(DeleteReason::Evicted) => !ctx.subscribers.is_empty(),
                    Some(_) => true,
                };
                if let (true, Some(reason)) = (notify, reason) {
                    // Sent under the shard lock so no replacement context can publish first.
                    let _ = self.events.send(ContextEvent::Deleted {
                        context_id: id.clone(),
                        generation: ctx.generation,
                        reason,
                    });
                }
                true
            })
            .is_some();

        if removed {
            gauge!(CTX_CONTEXTS_ACTIVE).set(self.contexts.len() as f64);
            match reason {
                Some(reason) => info!(context_id = %id, reason = reason.as_str(), "context removed"),
                None => debug!(context_id = %id, "context reclaimed"),
            }
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn set_last_accessed(&self, id: &ContextId, when: DateTime<Utc>) {
        if let Some(entry) = self.contexts.get(id) {
            entry.value().lock().last_accessed = when;
        }
    }
}

fn record_read(hit: bool) {
    counter!(CTX_READS_TOTAL, "result" => if hit { "hit" } else { "miss" }).increment(1);
}

fn record_write_error(e: &CacheError) {
    warn!(error = %e, "context write rejected");
    counter!(CTX_WRITE_ERRORS_TOTAL, "error" => e.error_kind()).increment(1);
}
