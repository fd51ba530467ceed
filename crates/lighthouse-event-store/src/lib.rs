#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-event-store** – Authenticated append-only log service.
//!
//! Wraps a storage driver with authorisation, payload validation, HMAC
//! signing, exclusive sequence assignment, range queries with per-record
//! verification, replay, snapshots, and health reporting. The append path is
//! the one critical section in the platform: exactly one appender at a time
//! assigns the next sequence, writes, and syncs. Readers never take the
//! append lock and observe only already-durable sequences.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use lighthouse_auth::{AgentDirectory, AuthError, AuthzError, AuthzResolution, RateLimiter};
use lighthouse_event_core::{
    decode_verified, replay_events, validate_event, Event, EventBackend, EventError, EventQuery,
    EventSigner, EventType, MonotonicIdGenerator, QueryResult, ReplayHandlers, ReplayOutcome,
    SealedFrame, Snapshot,
};
use lighthouse_types::{
    AgentId, Permission, MAX_BATCH_EVENTS, MAX_BATCH_SIZE_BYTES,
};

/// Buffer size for the live event broadcast channel.
const BROADCAST_BUFFER: usize = 1024;

/// Page size used for internal scans.
const SCAN_BATCH: usize = 1024;

/// Samples retained per latency ring.
const LATENCY_SAMPLES: usize = 512;

/// Sliding window for the events/second gauge.
const THROUGHPUT_WINDOW_NS: u64 = 60 * 1_000_000_000;

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the store service.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Caller identity could not be established.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Caller identity is known but the operation is not permitted.
    #[error(transparent)]
    Authorization(#[from] AuthzError),
    /// The event failed structural validation.
    #[error("event validation failed: {0}")]
    Validation(String),
    /// The event exceeds the single-record size cap.
    #[error("event size {size} exceeds limit {limit}")]
    PayloadTooLarge {
        /// Observed serialized size.
        size: usize,
        /// Configured cap.
        limit: usize,
    },
    /// The storage device is out of space.
    #[error("storage full")]
    StorageFull,
    /// The store refused the write because it is in degraded mode.
    #[error("store is in read-only degraded mode")]
    Degraded,
    /// The storage driver failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<EventError> for StoreError {
    fn from(e: EventError) -> Self {
        match e {
            EventError::PayloadTooLarge { size, limit } => Self::PayloadTooLarge { size, limit },
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<AuthzResolution> for StoreError {
    fn from(r: AuthzResolution) -> Self {
        match r {
            AuthzResolution::Unauthenticated(e) => Self::Auth(e),
            AuthzResolution::Denied(e) => Self::Authorization(e),
        }
    }
}

fn storage_error(e: anyhow::Error) -> StoreError {
    let text = e.to_string();
    if text.to_lowercase().contains("no space left") {
        StoreError::StorageFull
    } else {
        StoreError::Storage(text)
    }
}

//─────────────────────────────
//  Metrics
//─────────────────────────────

#[derive(Debug, Default)]
struct LatencyRing {
    samples: std::sync::Mutex<VecDeque<f64>>,
}

impl LatencyRing {
    fn record(&self, millis: f64) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() >= LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(millis);
    }

    fn percentiles(&self) -> (f64, f64) {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let at = |q: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx]
        };
        (at(0.50), at(0.99))
    }
}

/// Point-in-time health report for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStoreHealth {
    /// `"healthy"` or `"degraded"`.
    pub status: String,
    /// Highest durable sequence.
    pub current_sequence: u64,
    /// Appends per second over the last minute.
    pub events_per_second: f64,
    /// Median append latency in milliseconds.
    pub append_p50_ms: f64,
    /// Tail append latency in milliseconds.
    pub append_p99_ms: f64,
    /// Median query latency in milliseconds.
    pub query_p50_ms: f64,
    /// Tail query latency in milliseconds.
    pub query_p99_ms: f64,
    /// Bytes of stable storage in use.
    pub disk_usage_bytes: u64,
    /// Number of storage segments.
    pub segment_count: usize,
    /// Records that failed signature verification on read.
    pub integrity_incidents: u64,
}

//─────────────────────────────
//  Store service
//─────────────────────────────

/// The authenticated event store.
pub struct EventStore {
    backend: Arc<dyn EventBackend>,
    signer: EventSigner,
    ids: MonotonicIdGenerator,
    directory: Arc<AgentDirectory>,
    rate_limiter: Arc<RateLimiter>,
    snapshots_dir: PathBuf,
    append_lock: Mutex<()>,
    tail: AtomicU64,
    degraded: AtomicBool,
    integrity_incidents: AtomicU64,
    append_times_ns: std::sync::Mutex<VecDeque<u64>>,
    append_latency: LatencyRing,
    query_latency: LatencyRing,
    live: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("tail", &self.tail.load(Ordering::Acquire))
            .field("degraded", &self.degraded.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Open the store over `backend`, recovering the tail cursor.
    pub async fn open(
        backend: Arc<dyn EventBackend>,
        signer: EventSigner,
        node_id: impl Into<String>,
        directory: Arc<AgentDirectory>,
        rate_limiter: Arc<RateLimiter>,
        snapshots_dir: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let tail = backend.tail_sequence().await.map_err(storage_error)?;
        let snapshots_dir = snapshots_dir.into();
        std::fs::create_dir_all(&snapshots_dir)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        info!(tail, "event store opened");
        Ok(Self {
            backend,
            signer,
            ids: MonotonicIdGenerator::new(node_id),
            directory,
            rate_limiter,
            snapshots_dir,
            append_lock: Mutex::new(()),
            tail: AtomicU64::new(tail),
            degraded: AtomicBool::new(false),
            integrity_incidents: AtomicU64::new(0),
            append_times_ns: std::sync::Mutex::new(VecDeque::new()),
            append_latency: LatencyRing::default(),
            query_latency: LatencyRing::default(),
            live: broadcast::channel(BROADCAST_BUFFER).0,
        })
    }

    /// Build an unsigned event stamped with a fresh monotonic id.
    pub fn new_event(
        &self,
        event_type: EventType,
        aggregate_id: impl Into<String>,
        data: serde_json::Value,
        source_agent: AgentId,
    ) -> Event {
        Event::new(
            self.ids.generate(),
            event_type,
            aggregate_id,
            data,
            source_agent,
        )
    }

    /// Subscribe to the live stream of committed events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }

    /// Highest durable sequence.
    pub fn tail_sequence(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Whether the store has entered read-only degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Append one event on behalf of `agent`, returning its sequence.
    ///
    /// Either the event is durable and visible to subsequent queries with
    /// the returned sequence, or it is not appended at all.
    pub async fn append(&self, event: Event, agent: &AgentId) -> Result<u64, StoreError> {
        let sequences = self.append_batch(vec![event], agent).await?;
        Ok(sequences.start)
    }

    /// Append a batch atomically, returning the contiguous sequence range.
    pub async fn append_batch(
        &self,
        mut events: Vec<Event>,
        agent: &AgentId,
    ) -> Result<std::ops::Range<u64>, StoreError> {
        let started = Instant::now();
        let identity = self.directory.authorize(agent, Permission::WriteEvents)?;
        if events.is_empty() {
            return Err(StoreError::Validation("empty batch".to_string()));
        }
        let cap = identity.max_batch_size.min(MAX_BATCH_EVENTS);
        if events.len() > cap {
            return Err(AuthzError::BatchTooLarge {
                size: events.len(),
                cap,
            }
            .into());
        }
        self.rate_limiter
            .check(&identity, events.len() as u32)
            .map_err(StoreError::Authorization)?;

        if self.degraded.load(Ordering::Acquire) {
            return Err(StoreError::Degraded);
        }

        let mut total_bytes = 0usize;
        for event in &events {
            validate_event(event)?;
            total_bytes += event.size_bytes()?;
        }
        if total_bytes > MAX_BATCH_SIZE_BYTES {
            return Err(StoreError::PayloadTooLarge {
                size: total_bytes,
                limit: MAX_BATCH_SIZE_BYTES,
            });
        }

        // Critical section: sequence assignment through durable write.
        let _guard = self.append_lock.lock().await;
        let first = self.tail.load(Ordering::Acquire) + 1;

        let mut frames = Vec::with_capacity(events.len());
        for (offset, event) in events.iter_mut().enumerate() {
            event.sequence = Some(first + offset as u64);
            self.signer.sign(event)?;
            frames.push(SealedFrame::seal(event)?);
        }

        let result = if frames.len() == 1 {
            self.backend.append(first, &frames[0]).await
        } else {
            self.backend.append_batch(first, &frames).await
        };
        if let Err(e) = result {
            self.degraded.store(true, Ordering::Release);
            error!(error = %e, "append failed; store entering read-only degraded mode");
            return Err(storage_error(e));
        }

        let last = first + events.len() as u64 - 1;
        self.tail.store(last, Ordering::Release);
        drop(_guard);

        let now_ns = events.last().map(|e| e.timestamp_ns).unwrap_or(0);
        {
            let mut times = self
                .append_times_ns
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for _ in 0..events.len() {
                times.push_back(now_ns);
            }
            while let Some(front) = times.front() {
                if now_ns.saturating_sub(*front) > THROUGHPUT_WINDOW_NS {
                    times.pop_front();
                } else {
                    break;
                }
            }
        }
        self.append_latency
            .record(started.elapsed().as_secs_f64() * 1000.0);

        for event in events {
            let _ = self.live.send(event);
        }
        Ok(first..last + 1)
    }

    /// Run a paged, sorted, filtered query on behalf of `agent`.
    ///
    /// Every returned record has a verified signature; records failing
    /// verification are omitted and counted as integrity incidents.
    pub async fn query(
        &self,
        query: &EventQuery,
        agent: &AgentId,
    ) -> Result<QueryResult, StoreError> {
        let started = Instant::now();
        let identity = self.directory.authorize(agent, Permission::ReadEvents)?;
        self.rate_limiter
            .check(&identity, 1)
            .map_err(StoreError::Authorization)?;

        let mut matches = Vec::new();
        let mut next = query.filter.after_sequence.map(|s| s + 1).unwrap_or(1);
        let tail = self.tail.load(Ordering::Acquire);

        while next <= tail {
            let frames = self
                .backend
                .scan(next, SCAN_BATCH)
                .await
                .map_err(storage_error)?;
            if frames.is_empty() {
                break;
            }
            let got = frames.len() as u64;
            for frame in frames {
                match decode_verified(&self.signer, &frame) {
                    Ok(event) => {
                        // Ignore sequences past the recorded tail so readers
                        // never observe a write still in flight.
                        if event.sequence.unwrap_or(0) > tail {
                            continue;
                        }
                        if query.filter.matches(&event) {
                            matches.push(event);
                        }
                    }
                    Err(EventError::Integrity { event_id, sequence }) => {
                        self.integrity_incidents.fetch_add(1, Ordering::Relaxed);
                        error!(
                            event_id,
                            ?sequence,
                            "integrity failure: stored event failed HMAC verification"
                        );
                    }
                    Err(e) => {
                        self.integrity_incidents.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "undecodable record skipped");
                    }
                }
            }
            next += got;
            if let Some(before) = query.filter.before_sequence {
                if next >= before {
                    break;
                }
            }
        }

        query.sort(&mut matches);
        let total_count = matches.len();
        let limit = query.effective_limit();
        let page: Vec<Event> = matches
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect();
        let has_more = query.offset + page.len() < total_count;

        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.query_latency.record(execution_time_ms);
        Ok(QueryResult {
            events: page,
            total_count,
            has_more,
            execution_time_ms,
        })
    }

    /// Fold the log (from `from_sequence`, exclusive) into `state`.
    pub async fn replay<S>(
        &self,
        from_sequence: u64,
        handlers: &ReplayHandlers<S>,
        state: &mut S,
    ) -> Result<ReplayOutcome, StoreError> {
        let outcome = replay_events(
            self.backend.as_ref(),
            &self.signer,
            from_sequence,
            handlers,
            state,
        )
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        if outcome.integrity_failures > 0 {
            self.integrity_incidents
                .fetch_add(outcome.integrity_failures, Ordering::Relaxed);
            warn!(
                failures = outcome.integrity_failures,
                "replay skipped records failing verification"
            );
        }
        Ok(outcome)
    }

    /// Capture `state` at `sequence` into a signed snapshot file.
    pub async fn create_snapshot<S: Serialize>(
        &self,
        state: &S,
        sequence: u64,
        metadata: std::collections::BTreeMap<String, String>,
    ) -> Result<String, StoreError> {
        let snapshot_id = uuid::Uuid::new_v4().simple().to_string();
        let snapshot = Snapshot::capture(&self.signer, &snapshot_id, sequence, state, metadata)?;
        let bytes =
            rmp_serde::to_vec_named(&snapshot).map_err(|e| StoreError::Storage(e.to_string()))?;
        let path = self.snapshots_dir.join(format!("{snapshot_id}.snap"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        info!(snapshot_id, sequence, "snapshot created");
        Ok(snapshot_id)
    }

    /// Load a snapshot, verifying its signature.
    ///
    /// Returns the reduced state and the sequence it covers; callers resume
    /// replay from that sequence. Snapshots only accelerate replay and are
    /// never authoritative over the log.
    pub async fn load_snapshot<S: DeserializeOwned>(
        &self,
        snapshot_id: &str,
    ) -> Result<(S, u64), StoreError> {
        let path = self.snapshots_dir.join(format!("{snapshot_id}.snap"));
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let snapshot: Snapshot =
            rmp_serde::from_slice(&bytes).map_err(|e| StoreError::Storage(e.to_string()))?;
        let state = snapshot.restore(&self.signer)?;
        Ok((state, snapshot.sequence))
    }

    /// Force buffered writes to stable storage (used by interval fsync).
    pub async fn sync(&self) -> Result<(), StoreError> {
        self.backend.sync().await.map_err(storage_error)
    }

    /// Records skipped due to signature verification failures.
    pub fn integrity_incidents(&self) -> u64 {
        self.integrity_incidents.load(Ordering::Relaxed)
    }

    /// Build a point-in-time health report.
    pub async fn health(&self) -> EventStoreHealth {
        let (append_p50_ms, append_p99_ms) = self.append_latency.percentiles();
        let (query_p50_ms, query_p99_ms) = self.query_latency.percentiles();
        let events_per_second = {
            let times = self
                .append_times_ns
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            times.len() as f64 / (THROUGHPUT_WINDOW_NS as f64 / 1e9)
        };
        EventStoreHealth {
            status: if self.is_degraded() {
                "degraded".to_string()
            } else {
                "healthy".to_string()
            },
            current_sequence: self.tail_sequence(),
            events_per_second,
            append_p50_ms,
            append_p99_ms,
            query_p50_ms,
            query_p99_ms,
            disk_usage_bytes: self.backend.disk_usage().await.unwrap_or(0),
            segment_count: self.backend.segment_count().await.unwrap_or(0),
            integrity_incidents: self.integrity_incidents(),
        }
    }
}
