//! Durable error queue
//!
//! Reports are persisted on every mutation and synced in batches. A 429
//! backs the whole queue off; 5xx and network failures keep items for the
//! next cycle; other 4xx drop the batch.

use crate::report::{ErrorReport, QueuedError};
use crate::sink::TelemetrySink;
use crate::storage::QueueStorage;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use wardstream_error::WardstreamError;
use wardstream_resilience::BackoffConfig;
use wardstream_traits::EnvironmentProbe;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Error queue configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorQueueConfig {
    /// Oldest entries are evicted beyond this
    pub max_queue_size: usize,
    /// Items per sync request
    pub batch_size: usize,
    /// Periodic sync cadence
    pub sync_interval: Duration,
    /// How often connectivity is polled for offline to online transitions
    pub online_check_interval: Duration,
    /// Rate-limit backoff; `max_delay` caps the wait
    pub backoff: BackoffConfig,
    /// Entries older than this are evicted when storage is full
    pub retention: Duration,
    /// Send each pushed item immediately when online
    pub immediate_sync: bool,
}

impl Default for ErrorQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            batch_size: 10,
            sync_interval: Duration::from_secs(30),
            online_check_interval: Duration::from_secs(5),
            backoff: BackoffConfig::default()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30))
                .with_jitter(false),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            immediate_sync: true,
        }
    }
}

impl ErrorQueueConfig {
    /// Set the capacity
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the sync interval
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the connectivity poll interval
    pub fn with_online_check_interval(mut self, interval: Duration) -> Self {
        self.online_check_interval = interval;
        self
    }

    /// Set the rate-limit backoff
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the retention window
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Toggle immediate single-item sync
    pub fn with_immediate_sync(mut self, enabled: bool) -> Self {
        self.immediate_sync = enabled;
        self
    }
}

/// Why a sync did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another sync is running
    InFlight,
    /// Device is offline
    Offline,
    /// Nothing queued
    Empty,
    /// Waiting out a rate limit
    BackingOff,
    /// Queue was destroyed
    Destroyed,
}

/// Counts from one sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Requests sent
    pub batches: usize,
    /// Items accepted
    pub synced: usize,
    /// Items rejected and dropped
    pub dropped: usize,
    /// Items kept for a later pass
    pub retained: usize,
    /// Pass stopped on a 429
    pub rate_limited: bool,
}

/// Result of [`ErrorQueue::sync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was sent
    Skipped(SkipReason),
    /// At least one batch was sent
    Ran(SyncReport),
}

/// Queue counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Items waiting to sync
    pub pending: usize,
    /// Items accepted since start
    pub synced_total: u64,
    /// Items evicted or rejected since start
    pub dropped_total: u64,
    /// Consecutive rate-limit responses
    pub retry_count: u32,
    /// Time until the next sync is allowed, while backing off
    pub next_sync_in: Option<Duration>,
    /// Session id stamped on new items
    pub session_id: String,
}

struct QueueState {
    items: VecDeque<QueuedError>,
    metadata: HashMap<String, Map<String, Value>>,
    retry_count: u32,
    next_sync_at: Option<Instant>,
    was_online: bool,
    synced_total: u64,
    dropped_total: u64,
    /// Ids with an immediate send in flight
    sending: HashSet<String>,
}

impl QueueState {
    fn remove(&mut self, ids: &HashSet<&str>) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !ids.contains(item.id.as_str()));
        for id in ids {
            self.metadata.remove(*id);
        }
        before - self.items.len()
    }

    fn backing_off(&self) -> bool {
        self.next_sync_at.is_some_and(|at| Instant::now() < at)
    }
}

struct QueueInner {
    config: ErrorQueueConfig,
    sink: Arc<dyn TelemetrySink>,
    storage: Arc<dyn QueueStorage>,
    probe: Arc<dyn EnvironmentProbe>,
    session_id: String,
    state: Mutex<QueueState>,
    syncing: AtomicBool,
    destroyed: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Persistent, size-bounded, batch-syncing error queue
pub struct ErrorQueue {
    inner: Arc<QueueInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
    singles: Mutex<JoinSet<()>>,
}

impl ErrorQueue {
    /// Restores the persisted queue and session id from `storage`.
    ///
    /// Storage failures are logged; the queue then starts empty.
    pub fn new(
        config: ErrorQueueConfig,
        sink: Arc<dyn TelemetrySink>,
        storage: Arc<dyn QueueStorage>,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Self {
        let mut items: VecDeque<QueuedError> = match storage.load() {
            Ok(items) => items.into_iter().filter(|i| !i.synced).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted error queue");
                VecDeque::new()
            }
        };
        while items.len() > config.max_queue_size {
            items.pop_front();
        }

        let session_id = match storage.session_id() {
            Ok(Some(id)) => id,
            other => {
                if let Err(e) = other {
                    tracing::warn!(error = %e, "Failed to read session id");
                }
                let id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = storage.save_session_id(&id) {
                    tracing::warn!(error = %e, "Failed to persist session id");
                }
                id
            }
        };

        tracing::debug!(pending = items.len(), session = %session_id, "Error queue restored");

        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    items,
                    metadata: HashMap::new(),
                    retry_count: 0,
                    next_sync_at: None,
                    was_online: probe.is_online(),
                    synced_total: 0,
                    dropped_total: 0,
                    sending: HashSet::new(),
                }),
                config,
                sink,
                storage,
                probe,
                session_id,
                syncing: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
            singles: Mutex::new(JoinSet::new()),
        }
    }

    /// Starts the periodic sync and connectivity timers. Idempotent.
    pub fn start(&self) {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut timer = lock(&self.timer);
        if timer.is_some() {
            return;
        }
        *timer = Some(tokio::spawn(run_timers(Arc::clone(&self.inner))));
    }

    /// Queues `report` and returns its id.
    ///
    /// When online and inside a runtime, the item is also sent on its own;
    /// failure leaves it for the batch cycle.
    pub fn push(&self, report: ErrorReport) -> String {
        let inner = &self.inner;
        let item = QueuedError::new(&report, inner.probe.snapshot(), &inner.session_id);
        let id = item.id.clone();

        {
            let mut state = lock(&inner.state);
            state.items.push_back(item.clone());
            while state.items.len() > inner.config.max_queue_size {
                if let Some(evicted) = state.items.pop_front() {
                    state.metadata.remove(&evicted.id);
                    state.dropped_total += 1;
                    tracing::debug!(id = %evicted.id, "Error queue full, evicting oldest");
                }
            }
            inner.persist(&mut state);
        }

        tracing::debug!(id = %id, category = %item.category, "Error queued");

        if inner.config.immediate_sync
            && !inner.destroyed.load(Ordering::Acquire)
            && inner.probe.is_online()
        {
            if let Ok(handle) = Handle::try_current() {
                let task_inner = Arc::clone(inner);
                let mut singles = lock(&self.singles);
                while singles.try_join_next().is_some() {}
                singles.spawn_on(async move { task_inner.sync_single(item).await }, &handle);
            }
        }

        id
    }

    /// Sends queued items in batches
    pub async fn sync(&self) -> SyncOutcome {
        self.inner.sync().await
    }

    /// Syncs repeatedly until the queue is empty or a pass makes no
    /// progress. Honors rate-limit backoff.
    pub async fn flush(&self) -> SyncOutcome {
        let mut outcome = self.inner.sync().await;
        while let SyncOutcome::Ran(report) = outcome {
            if report.synced == 0 || self.is_empty() {
                break;
            }
            outcome = self.inner.sync().await;
        }
        outcome
    }

    /// Re-reads connectivity; an offline to online transition syncs
    /// immediately.
    pub async fn check_connectivity(&self) -> Option<SyncOutcome> {
        if self.inner.came_online() {
            Some(self.inner.sync().await)
        } else {
            None
        }
    }

    /// Attaches auxiliary data to a queued item. Returns false when `id`
    /// is not queued.
    pub fn attach_metadata(&self, id: &str, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let mut state = lock(&self.inner.state);
        if !state.items.iter().any(|item| item.id == id) {
            return false;
        }
        state
            .metadata
            .entry(id.to_string())
            .or_default()
            .insert(key.into(), value.into());
        true
    }

    /// Auxiliary data for `id`
    pub fn metadata(&self, id: &str) -> Option<Map<String, Value>> {
        lock(&self.inner.state).metadata.get(id).cloned()
    }

    /// Queued items, oldest first
    pub fn items(&self) -> Vec<QueuedError> {
        lock(&self.inner.state).items.iter().cloned().collect()
    }

    /// Queued item count
    pub fn len(&self) -> usize {
        lock(&self.inner.state).items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session id stamped on new items
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Counters and backoff state
    pub fn stats(&self) -> QueueStats {
        let state = lock(&self.inner.state);
        QueueStats {
            pending: state.items.len(),
            synced_total: state.synced_total,
            dropped_total: state.dropped_total,
            retry_count: state.retry_count,
            next_sync_in: state
                .next_sync_at
                .map(|at| at.saturating_duration_since(Instant::now()))
                .filter(|d| !d.is_zero()),
            session_id: self.inner.session_id.clone(),
        }
    }

    /// Drops every queued item and persists the empty queue
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        let cleared = state.items.len();
        state.items.clear();
        state.metadata.clear();
        self.inner.persist(&mut state);
        tracing::info!(cleared, "Error queue cleared");
    }

    /// Stops the timers and pending sends, then persists a final snapshot.
    /// Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.abort_tasks();
        let mut state = lock(&self.inner.state);
        self.inner.persist(&mut state);
        tracing::debug!(pending = state.items.len(), "Error queue destroyed");
    }

    fn abort_tasks(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        lock(&self.singles).abort_all();
    }
}

impl Drop for ErrorQueue {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl std::fmt::Debug for ErrorQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorQueue")
            .field("config", &self.inner.config)
            .field("session_id", &self.inner.session_id)
            .finish_non_exhaustive()
    }
}

impl QueueInner {
    /// Writes the snapshot; on quota failure evicts entries past retention
    /// and retries once.
    fn persist(&self, state: &mut QueueState) {
        let err = match self.storage.save(state.items.make_contiguous()) {
            Ok(()) => return,
            Err(e) => e,
        };

        if !matches!(err, WardstreamError::PersistenceQuota(_)) {
            tracing::warn!(error = %err, "Failed to persist error queue");
            return;
        }

        let cutoff = Utc::now().timestamp_millis() - self.config.retention.as_millis() as i64;
        let expired: Vec<String> = state
            .items
            .iter()
            .filter(|item| item.timestamp_ms < cutoff)
            .map(|item| item.id.clone())
            .collect();
        let expired_ids: HashSet<&str> = expired.iter().map(String::as_str).collect();
        let evicted = state.remove(&expired_ids);
        state.dropped_total += evicted as u64;
        tracing::warn!(evicted, "Storage quota exceeded, evicted expired entries");

        if let Err(e) = self.storage.save(state.items.make_contiguous()) {
            tracing::warn!(error = %e, "Failed to persist error queue after eviction");
        }
    }

    fn came_online(&self) -> bool {
        let online = self.probe.is_online();
        let mut state = lock(&self.state);
        let transition = online && !state.was_online;
        state.was_online = online;
        transition
    }

    fn back_off(&self, retry_after_secs: Option<u64>) {
        let mut state = lock(&self.state);
        state.retry_count += 1;
        let backoff = &self.config.backoff;
        let mut delay = backoff.base_delay(state.retry_count - 1, backoff.multiplier);
        if let Some(secs) = retry_after_secs {
            delay = delay.max(Duration::from_secs(secs));
        }
        state.next_sync_at = Some(Instant::now() + delay);
        tracing::warn!(
            retry_count = state.retry_count,
            delay = ?delay,
            "Telemetry rate limited, backing off"
        );
    }

    fn mark_synced(&self, ids: &HashSet<&str>) -> usize {
        let mut state = lock(&self.state);
        let removed = state.remove(ids);
        state.synced_total += removed as u64;
        state.retry_count = 0;
        state.next_sync_at = None;
        self.persist(&mut state);
        removed
    }

    fn drop_items(&self, ids: &HashSet<&str>) -> usize {
        let mut state = lock(&self.state);
        let removed = state.remove(ids);
        state.dropped_total += removed as u64;
        self.persist(&mut state);
        removed
    }

    async fn sync(&self) -> SyncOutcome {
        if self.destroyed.load(Ordering::Acquire) {
            return SyncOutcome::Skipped(SkipReason::Destroyed);
        }
        if self.syncing.swap(true, Ordering::AcqRel) {
            return SyncOutcome::Skipped(SkipReason::InFlight);
        }
        let _in_flight = InFlight(&self.syncing);

        if !self.probe.is_online() {
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        let pending: Vec<QueuedError> = {
            let state = lock(&self.state);
            if state.backing_off() {
                return SyncOutcome::Skipped(SkipReason::BackingOff);
            }
            state
                .items
                .iter()
                .filter(|i| !i.synced && !state.sending.contains(&i.id))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return SyncOutcome::Skipped(SkipReason::Empty);
        }

        let mut report = SyncReport::default();
        let mut sent = 0;
        for batch in pending.chunks(self.config.batch_size.max(1)) {
            report.batches += 1;
            sent += batch.len();
            let ids: HashSet<&str> = batch.iter().map(|item| item.id.as_str()).collect();

            match self.sink.send_batch(batch).await {
                Ok(()) => {
                    report.synced += self.mark_synced(&ids);
                }
                Err(WardstreamError::RateLimited { retry_after_secs }) => {
                    self.back_off(retry_after_secs);
                    report.rate_limited = true;
                    report.retained += pending.len() - sent + batch.len();
                    break;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(count = batch.len(), error = %e, "Telemetry sync failed, keeping batch");
                    report.retained += batch.len();
                }
                Err(e) => {
                    tracing::warn!(count = batch.len(), error = %e, "Telemetry rejected batch, dropping");
                    report.dropped += self.drop_items(&ids);
                }
            }
        }

        tracing::debug!(
            batches = report.batches,
            synced = report.synced,
            dropped = report.dropped,
            retained = report.retained,
            "Error queue sync finished"
        );
        SyncOutcome::Ran(report)
    }

    async fn sync_single(&self, item: QueuedError) {
        {
            // Checked under the state lock so a batch snapshot either sees
            // the id as in flight or has already claimed the item.
            let mut state = lock(&self.state);
            if state.backing_off()
                || self.syncing.load(Ordering::Acquire)
                || !self.probe.is_online()
                || !state.items.iter().any(|i| i.id == item.id)
            {
                return;
            }
            state.sending.insert(item.id.clone());
        }

        let result = self.sink.send_single(&item).await;
        lock(&self.state).sending.remove(&item.id);

        match result {
            Ok(()) => {
                let ids = HashSet::from([item.id.as_str()]);
                self.mark_synced(&ids);
            }
            Err(WardstreamError::RateLimited { retry_after_secs }) => {
                self.back_off(retry_after_secs);
            }
            Err(e) => {
                tracing::debug!(id = %item.id, error = %e, "Immediate sync failed, left queued");
            }
        }
    }
}

async fn run_timers(inner: Arc<QueueInner>) {
    let config = &inner.config;
    let mut sync_tick =
        tokio::time::interval_at(Instant::now() + config.sync_interval, config.sync_interval);
    sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut online_tick = tokio::time::interval_at(
        Instant::now() + config.online_check_interval,
        config.online_check_interval,
    );
    online_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sync_tick.tick() => {
                inner.came_online();
                inner.sync().await;
            }
            _ = online_tick.tick() => {
                if inner.came_online() {
                    tracing::info!("Back online, syncing error queue");
                    inner.sync().await;
                }
            }
        }
    }
}
