use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::action::{ActionError, ActionId, ActionKind, PendingAction};
use crate::cache::{OfflineCache, PersistedCache, RecordCollection};
use crate::crypto::{CryptoError, RecordCipher};
use crate::notify::{Notice, Notifier};
use crate::remote::{RemoteDataService, RemoteError};
use crate::scheduler::{Clock, RetryScheduler};
use crate::storage::CacheStorage;
use crate::{
    retry_delay_ms, Record, SyncStatus, TableName, UnixTimeMs, CACHE_STORAGE_KEY,
    INITIAL_RETRY_DELAY_MS, MAX_ACTION_BYTES, MAX_CACHE_BYTES, MAX_MEDICATION_RECORDS,
    MAX_PATIENT_RECORDS, MAX_PENDING_ACTIONS, MAX_RETRY_ATTEMPTS, MAX_VITALS_RECORDS,
};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("action too large: {size} > {max} bytes")]
    ActionTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub storage_key: String,
    pub max_pending_actions: usize,
    pub max_patient_records: usize,
    pub max_vitals_records: usize,
    pub max_medication_records: usize,
    pub max_cache_bytes: usize,
    pub max_action_bytes: usize,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_key: CACHE_STORAGE_KEY.to_string(),
            max_pending_actions: MAX_PENDING_ACTIONS,
            max_patient_records: MAX_PATIENT_RECORDS,
            max_vitals_records: MAX_VITALS_RECORDS,
            max_medication_records: MAX_MEDICATION_RECORDS,
            max_cache_bytes: MAX_CACHE_BYTES,
            max_action_bytes: MAX_ACTION_BYTES,
            max_retries: MAX_RETRY_ATTEMPTS,
            initial_retry_delay_ms: INITIAL_RETRY_DELAY_MS,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.storage_key.is_empty() {
            return Err(SyncError::Config("storage_key cannot be empty".into()));
        }
        if self.max_pending_actions == 0 {
            return Err(SyncError::Config("max_pending_actions must be > 0".into()));
        }
        if self.max_patient_records == 0
            || self.max_vitals_records == 0
            || self.max_medication_records == 0
        {
            return Err(SyncError::Config("record caps must be > 0".into()));
        }
        if self.max_cache_bytes == 0 {
            return Err(SyncError::Config("max_cache_bytes must be > 0".into()));
        }
        if self.max_action_bytes == 0 || self.max_action_bytes > self.max_cache_bytes {
            return Err(SyncError::Config(
                "max_action_bytes must be > 0 and <= max_cache_bytes".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(SyncError::Config("max_retries must be > 0".into()));
        }
        if self.initial_retry_delay_ms == 0 {
            return Err(SyncError::Config(
                "initial_retry_delay_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn cap_for(&self, collection: RecordCollection) -> usize {
        match collection {
            RecordCollection::PatientData => self.max_patient_records,
            RecordCollection::Vitals => self.max_vitals_records,
            RecordCollection::Medications => self.max_medication_records,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    actions_queued: AtomicU64,
    actions_rejected: AtomicU64,
    actions_synced: AtomicU64,
    actions_dropped: AtomicU64,
    sync_passes: AtomicU64,
    sync_errors: AtomicU64,
    cache_trims: AtomicU64,
    quota_fallbacks: AtomicU64,
    hydration_resets: AtomicU64,
}

impl SyncMetrics {
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            actions_queued: self.actions_queued.load(Ordering::Relaxed),
            actions_rejected: self.actions_rejected.load(Ordering::Relaxed),
            actions_synced: self.actions_synced.load(Ordering::Relaxed),
            actions_dropped: self.actions_dropped.load(Ordering::Relaxed),
            sync_passes: self.sync_passes.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
            cache_trims: self.cache_trims.load(Ordering::Relaxed),
            quota_fallbacks: self.quota_fallbacks.load(Ordering::Relaxed),
            hydration_resets: self.hydration_resets.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub actions_queued: u64,
    pub actions_rejected: u64,
    pub actions_synced: u64,
    pub actions_dropped: u64,
    pub sync_passes: u64,
    pub sync_errors: u64,
    pub cache_trims: u64,
    pub quota_fallbacks: u64,
    pub hydration_resets: u64,
}

/// Outcome of one sync pass over a queue snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Debug)]
struct EngineState {
    cache: OfflineCache,
    online: bool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The offline sync engine: buffers mutations while disconnected, keeps an
/// encrypted snapshot in storage, and replays the queue with bounded
/// exponential backoff once connectivity returns.
///
/// One engine instance owns its storage key exclusively. Triggers may race;
/// an in-flight guard collapses overlapping passes into one, and the queue
/// is merged back from a snapshot so actions enqueued mid-pass survive.
pub struct SyncEngine<R: RemoteDataService, S: CacheStorage> {
    remote: Arc<R>,
    storage: Arc<S>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    cipher: RecordCipher,
    config: SyncConfig,
    state: RwLock<EngineState>,
    scheduler: Mutex<RetryScheduler>,
    in_flight: AtomicBool,
    metrics: SyncMetrics,
}

impl<R: RemoteDataService, S: CacheStorage> SyncEngine<R, S> {
    /// Build the engine and hydrate the cache from storage. A snapshot that
    /// is oversized, unparseable or fails authentication is discarded and
    /// the engine starts from an empty cache. Starts offline; the host
    /// drives connectivity through `set_online`.
    pub fn new(
        remote: Arc<R>,
        storage: Arc<S>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        key_bytes: &[u8],
        key_id: u32,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let cipher = RecordCipher::with_os_rng(key_bytes, key_id)?;
        let metrics = SyncMetrics::default();
        let cache = Self::hydrate(&storage, &cipher, &config, &metrics);

        Ok(Self {
            remote,
            storage,
            notifier,
            clock,
            cipher,
            config,
            state: RwLock::new(EngineState {
                cache,
                online: false,
            }),
            scheduler: Mutex::new(RetryScheduler::new()),
            in_flight: AtomicBool::new(false),
            metrics,
        })
    }

    fn hydrate(
        storage: &S,
        cipher: &RecordCipher,
        config: &SyncConfig,
        metrics: &SyncMetrics,
    ) -> OfflineCache {
        let raw = match storage.get(&config.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return OfflineCache::new(),
            Err(err) => {
                warn!(error = %err, "failed to read cache snapshot, starting empty");
                return OfflineCache::new();
            }
        };

        if raw.len() > config.max_cache_bytes {
            warn!(
                bytes = raw.len(),
                max = config.max_cache_bytes,
                "stored snapshot over size ceiling, discarding"
            );
            return Self::reset_snapshot(storage, config, metrics);
        }

        let persisted: PersistedCache = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, "stored snapshot unparseable, discarding");
                return Self::reset_snapshot(storage, config, metrics);
            }
        };

        let mut cache = OfflineCache::new();
        for collection in RecordCollection::ALL {
            let restored = match cipher.restore_collection(
                persisted.records(collection),
                persisted.metadata(collection),
                collection.as_str(),
            ) {
                Ok(restored) => restored,
                Err(err) => {
                    warn!(
                        collection = collection.as_str(),
                        error = %err,
                        "stored snapshot failed decryption, discarding"
                    );
                    return Self::reset_snapshot(storage, config, metrics);
                }
            };
            for record in restored {
                cache.push_record(collection, record, config.cap_for(collection));
            }
        }
        cache.pending_actions = persisted.pending_actions.into();
        cache.sync_status = persisted.sync_status;
        cache.truncate_to_caps(|c| config.cap_for(c), config.max_pending_actions);

        info!(
            pending = cache.pending_len(),
            status = %cache.sync_status,
            "hydrated offline cache"
        );
        cache
    }

    fn reset_snapshot(storage: &S, config: &SyncConfig, metrics: &SyncMetrics) -> OfflineCache {
        metrics.hydration_resets.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = storage.remove(&config.storage_key) {
            warn!(error = %err, "failed to remove discarded snapshot");
        }
        OfflineCache::new()
    }

    fn build_persisted(&self, cache: &OfflineCache) -> Result<PersistedCache, CryptoError> {
        let mut persisted = PersistedCache {
            pending_actions: cache.pending_actions.iter().cloned().collect(),
            sync_status: cache.sync_status,
            ..PersistedCache::default()
        };
        for collection in RecordCollection::ALL {
            let records: Vec<Record> = cache.records(collection).iter().cloned().collect();
            let (sealed, metadata) = self.cipher.prepare_for_transmission(
                &records,
                collection.sensitive_fields(),
                collection.as_str(),
            )?;
            persisted.set_collection(collection, sealed, metadata);
        }
        Ok(persisted)
    }

    /// Persist the cache, trimming and falling back as needed. Failures are
    /// logged and swallowed; the in-memory queue is never lost to a
    /// persistence error.
    fn persist(&self, cache: &mut OfflineCache) {
        let serialized = match self.serialize_bounded(cache) {
            Some(serialized) => serialized,
            None => return,
        };

        match self.storage.set(&self.config.storage_key, &serialized) {
            Ok(()) => {}
            Err(err) if err.is_quota_exceeded() => {
                self.metrics.quota_fallbacks.fetch_add(1, Ordering::Relaxed);
                cache.quota_fallback();
                self.notifier.notify(Notice::storage_limit_reached());
                if let Some(serialized) = self.serialize_bounded(cache) {
                    if let Err(err) = self.storage.set(&self.config.storage_key, &serialized) {
                        warn!(error = %err, "persist failed even after quota fallback");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to persist cache snapshot");
            }
        }
    }

    /// Serialize the cache, soft-trimming once if the result is over the
    /// byte ceiling.
    fn serialize_bounded(&self, cache: &mut OfflineCache) -> Option<String> {
        let mut serialized = self.encode(cache)?;
        if serialized.len() > self.config.max_cache_bytes {
            self.metrics.cache_trims.fetch_add(1, Ordering::Relaxed);
            cache.trim_for_size();
            serialized = self.encode(cache)?;
        }
        Some(serialized)
    }

    fn encode(&self, cache: &OfflineCache) -> Option<String> {
        let persisted = match self.build_persisted(cache) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(error = %err, "failed to seal cache snapshot");
                return None;
            }
        };
        match serde_json::to_string(&persisted) {
            Ok(serialized) => Some(serialized),
            Err(err) => {
                warn!(error = %err, "failed to serialize cache snapshot");
                None
            }
        }
    }

    /// Drive connectivity. Going online notifies the user and kicks off an
    /// immediate sync pass; going offline only notifies.
    pub async fn set_online(&self, online: bool) {
        {
            let mut state = self.state.write().await;
            if state.online == online {
                return;
            }
            state.online = online;
        }
        if online {
            info!("connectivity restored");
            self.notifier.notify(Notice::back_online());
            self.sync_pending_actions().await;
        } else {
            info!("connectivity lost");
            self.notifier.notify(Notice::connection_lost());
        }
    }

    #[must_use]
    pub async fn is_online(&self) -> bool {
        self.state.read().await.online
    }

    /// Enqueue a mutation for replay. Oversized payloads are rejected
    /// synchronously; everything else is persisted, then replayed now if
    /// online or left for the next pass if not.
    #[instrument(skip(self, data), fields(kind = %kind, table))]
    pub async fn queue_action(
        &self,
        kind: ActionKind,
        table: &str,
        data: Record,
    ) -> Result<ActionId, SyncError> {
        let table = TableName::new(table)?;
        let now = UnixTimeMs(self.clock.now_ms());
        let mut action = PendingAction::new(kind, table, data, now);
        action.max_retries = self.config.max_retries;

        let size = action.estimated_size();
        if size > self.config.max_action_bytes {
            self.metrics.actions_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(size, max = self.config.max_action_bytes, "rejected oversized action");
            self.notifier
                .notify(Notice::action_too_large(size, self.config.max_action_bytes));
            return Err(SyncError::ActionTooLarge {
                size,
                max: self.config.max_action_bytes,
            });
        }

        let id = action.id.clone();
        let online = {
            let mut state = self.state.write().await;
            let evicted = state
                .cache
                .push_action(action.clone(), self.config.max_pending_actions);
            self.metrics
                .actions_dropped
                .fetch_add(evicted as u64, Ordering::Relaxed);
            state.cache.sync_status = SyncStatus::Pending;
            let EngineState { cache, online } = &mut *state;
            self.persist(cache);
            *online
        };
        self.metrics.actions_queued.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, size, "queued action");

        if online {
            self.sync_pending_actions().await;
        } else {
            self.notifier
                .notify(Notice::action_queued(action.kind, action.table.as_str()));
        }
        Ok(id)
    }

    /// Replay the queue against the remote service. Works on a snapshot and
    /// merges results back, so actions enqueued mid-pass are untouched.
    /// Returns an empty report when offline, when the queue is empty, or
    /// when another pass is already in flight.
    #[instrument(skip(self))]
    pub async fn sync_pending_actions(&self) -> SyncReport {
        let snapshot: Vec<PendingAction> = {
            let state = self.state.read().await;
            if !state.online || state.cache.pending_actions.is_empty() {
                return SyncReport::default();
            }
            state.cache.pending_actions.iter().cloned().collect()
        };

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("sync pass already in flight, skipping");
            return SyncReport::default();
        }
        let _guard = InFlightGuard(&self.in_flight);

        {
            let mut state = self.state.write().await;
            state.cache.sync_status = SyncStatus::Pending;
            let EngineState { cache, .. } = &mut *state;
            self.persist(cache);
        }

        let mut report = SyncReport {
            attempted: snapshot.len(),
            ..SyncReport::default()
        };
        let mut removed: HashSet<ActionId> = HashSet::new();
        let mut retried: HashMap<ActionId, PendingAction> = HashMap::new();

        for mut action in snapshot {
            match self.dispatch(&action).await {
                Ok(()) => {
                    debug!(id = %action.id, "action replayed");
                    report.succeeded += 1;
                    removed.insert(action.id);
                }
                Err(err) => {
                    let prior_attempts = action.retry_count;
                    let exhausted = action.record_failure();
                    if exhausted {
                        warn!(
                            id = %action.id,
                            retries = action.retry_count,
                            error = %err,
                            "action exhausted retries, dropping"
                        );
                        report.dropped += 1;
                        self.notifier.notify(Notice::sync_failed(
                            action.kind,
                            action.table.as_str(),
                            action.retry_count,
                        ));
                        removed.insert(action.id);
                    } else {
                        let delay =
                            retry_delay_ms(self.config.initial_retry_delay_ms, prior_attempts);
                        let due_at = self.clock.now_ms().saturating_add(delay);
                        debug!(
                            id = %action.id,
                            attempt = action.retry_count,
                            delay_ms = delay,
                            error = %err,
                            "action failed, retry scheduled"
                        );
                        self.scheduler.lock().await.schedule(due_at);
                        report.retried += 1;
                        retried.insert(action.id.clone(), action);
                    }
                }
            }
        }

        {
            let mut state = self.state.write().await;
            let merged: std::collections::VecDeque<PendingAction> = state
                .cache
                .pending_actions
                .drain(..)
                .filter(|a| !removed.contains(&a.id))
                .map(|a| retried.get(&a.id).cloned().unwrap_or(a))
                .collect();
            state.cache.pending_actions = merged;
            state.cache.sync_status = if report.retried > 0 || report.dropped > 0 {
                SyncStatus::Error
            } else if state.cache.pending_actions.is_empty() {
                SyncStatus::Synced
            } else {
                SyncStatus::Pending
            };
            let EngineState { cache, .. } = &mut *state;
            self.persist(cache);
        }

        self.metrics.sync_passes.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .actions_synced
            .fetch_add(report.succeeded as u64, Ordering::Relaxed);
        self.metrics
            .actions_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        if report.retried > 0 || report.dropped > 0 {
            self.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
        }
        if report.succeeded > 0 {
            self.notifier.notify(Notice::sync_complete(report.succeeded));
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            retried = report.retried,
            dropped = report.dropped,
            "sync pass finished"
        );
        report
    }

    async fn dispatch(&self, action: &PendingAction) -> Result<(), RemoteError> {
        match action.kind {
            ActionKind::Create => {
                self.remote
                    .insert(action.table.as_str(), &action.data)
                    .await
            }
            ActionKind::Update => {
                let id = action
                    .record_id()
                    .map_err(|err| RemoteError::client(err.to_string()))?;
                self.remote
                    .update(action.table.as_str(), id, &action.data)
                    .await
            }
            ActionKind::Delete => {
                let id = action
                    .record_id()
                    .map_err(|err| RemoteError::client(err.to_string()))?;
                self.remote.delete(action.table.as_str(), id).await
            }
        }
    }

    /// Fire any retries whose backoff has elapsed. The host calls this from
    /// its timer loop, typically after sleeping until `next_retry_due`.
    pub async fn run_due_retries(&self) -> SyncReport {
        let due = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.take_due(self.clock.now_ms())
        };
        if due.is_empty() {
            return SyncReport::default();
        }
        self.sync_pending_actions().await
    }

    /// Earliest scheduled retry, as a unix timestamp in milliseconds.
    pub async fn next_retry_due(&self) -> Option<u64> {
        self.scheduler.lock().await.next_due()
    }

    /// Manual sync trigger, same semantics as an automatic pass.
    pub async fn sync_data(&self) -> SyncReport {
        self.sync_pending_actions().await
    }

    /// Drop every queued action and cancel every scheduled retry, keeping
    /// cached records. The persisted snapshot is rewritten without the
    /// queue.
    pub async fn clear_pending_actions(&self) {
        self.scheduler.lock().await.clear();
        let mut state = self.state.write().await;
        let cleared = state.cache.pending_len();
        state.cache.pending_actions.clear();
        state.cache.sync_status = SyncStatus::Synced;
        let EngineState { cache, .. } = &mut *state;
        self.persist(cache);
        info!(cleared, "cleared pending actions");
    }

    /// Cache a record locally for offline reads, evicting the oldest past
    /// the collection cap.
    pub async fn cache_record(&self, collection: RecordCollection, record: Record) {
        let mut state = self.state.write().await;
        state
            .cache
            .push_record(collection, record, self.config.cap_for(collection));
        let EngineState { cache, .. } = &mut *state;
        self.persist(cache);
    }

    /// Bulk variant of `cache_record`; persists once.
    pub async fn cache_records(&self, collection: RecordCollection, records: Vec<Record>) {
        let mut state = self.state.write().await;
        for record in records {
            state
                .cache
                .push_record(collection, record, self.config.cap_for(collection));
        }
        let EngineState { cache, .. } = &mut *state;
        self.persist(cache);
    }

    #[must_use]
    pub async fn cached_records(&self, collection: RecordCollection) -> Vec<Record> {
        let state = self.state.read().await;
        state.cache.records(collection).iter().cloned().collect()
    }

    #[must_use]
    pub async fn pending_len(&self) -> usize {
        self.state.read().await.cache.pending_len()
    }

    #[must_use]
    pub async fn status(&self) -> SyncStatus {
        self.state.read().await.cache.sync_status
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
