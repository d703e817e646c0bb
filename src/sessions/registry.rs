//! Session registry and state machine
//!
//! Tracks every active playback session: identity, channel, client
//! fingerprint, byte/bitrate counters, and activity timestamps. Admission
//! decisions are linearizable (taken under the registry write lock) and all
//! per-session mutation goes through the session's own lock, so readers
//! always observe transitions in the order they were performed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::AdmissionError;
use crate::sessions::fingerprint::{ClientFingerprint, is_android_tv};

/// Session lifecycle: `admitting → streaming ⇄ monitoring → stopping →
/// terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Admitting,
    Streaming,
    Monitoring,
    Stopping,
    Terminated,
}

impl SessionState {
    /// States that count against concurrency limits.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Admitting | SessionState::Streaming | SessionState::Monitoring
        )
    }
}

/// Why a session ended. Carried into the session-ended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownReason {
    Disconnect,
    Timeout,
    ProcessExit,
    CrashConfirmed,
    AdminTerminated,
    MaxAge,
}

impl TeardownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::Disconnect => "disconnect",
            TeardownReason::Timeout => "timeout",
            TeardownReason::ProcessExit => "process_exit",
            TeardownReason::CrashConfirmed => "crash_confirmed",
            TeardownReason::AdminTerminated => "admin_terminated",
            TeardownReason::MaxAge => "max_age",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BandwidthSample {
    at: Instant,
    bytes: u64,
}

struct SessionRecord {
    id: String,
    channel_id: String,
    fingerprint: ClientFingerprint,
    client_ip: String,
    user_agent: Option<String>,
    android_tv: bool,
    started_at: Instant,
    started_wall: chrono::DateTime<chrono::Utc>,
    state: SessionState,
    teardown_reason: Option<TeardownReason>,
    last_byte_at: Option<Instant>,
    last_poll_at: Option<Instant>,
    bytes_transferred: u64,
    samples: VecDeque<BandwidthSample>,
    current_bitrate_kbps: f64,
    peak_bitrate_kbps: f64,
    error_count: u32,
    probe_failures: u32,
    /// Hook into the owning encoder, invoked exactly once on teardown.
    stop_encoder: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl SessionRecord {
    fn avg_bitrate_kbps(&self) -> f64 {
        let secs = self.started_at.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.bytes_transferred as f64 * 8.0) / (secs * 1000.0)
        } else {
            0.0
        }
    }

    fn prune_samples(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn windowed_bitrate_kbps(&self, window: Duration, now: Instant) -> f64 {
        let bytes: u64 = self.samples.iter().map(|s| s.bytes).sum();
        let span = self
            .samples
            .front()
            .map(|s| now.duration_since(s.at).as_secs_f64())
            .unwrap_or(0.0)
            .min(window.as_secs_f64());
        if span > 0.0 {
            (bytes as f64 * 8.0) / (span * 1000.0)
        } else {
            0.0
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            fingerprint: self.fingerprint.clone(),
            client_ip: self.client_ip.clone(),
            user_agent: self.user_agent.clone(),
            android_tv: self.android_tv,
            started_at: self.started_wall,
            state: self.state,
            teardown_reason: self.teardown_reason,
            duration: self.started_at.elapsed(),
            bytes_transferred: self.bytes_transferred,
            current_bitrate_kbps: self.current_bitrate_kbps,
            avg_bitrate_kbps: self.avg_bitrate_kbps(),
            peak_bitrate_kbps: self.peak_bitrate_kbps,
            error_count: self.error_count,
        }
    }

    fn activity_view(&self, now: Instant) -> ActivityView {
        ActivityView {
            age: now.duration_since(self.started_at),
            poll_age: self.last_poll_at.map(|at| now.duration_since(at)),
            byte_age: self.last_byte_at.map(|at| now.duration_since(at)),
            probe_failures: self.probe_failures,
            android_tv: self.android_tv,
        }
    }
}

/// Point-in-time copy of a session's public state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub channel_id: String,
    #[serde(serialize_with = "serialize_fingerprint")]
    pub fingerprint: ClientFingerprint,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub android_tv: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub state: SessionState,
    pub teardown_reason: Option<TeardownReason>,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub duration: Duration,
    pub bytes_transferred: u64,
    pub current_bitrate_kbps: f64,
    pub avg_bitrate_kbps: f64,
    pub peak_bitrate_kbps: f64,
    pub error_count: u32,
}

fn serialize_fingerprint<S: serde::Serializer>(
    fp: &ClientFingerprint,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(fp.as_str())
}

fn serialize_duration_secs<S: serde::Serializer>(
    d: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_secs())
}

/// The activity facts the crash detector reasons over.
#[derive(Debug, Clone, Copy)]
pub struct ActivityView {
    pub age: Duration,
    pub poll_age: Option<Duration>,
    pub byte_age: Option<Duration>,
    pub probe_failures: u32,
    pub android_tv: bool,
}

/// Global concurrency metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyMetrics {
    pub total: u32,
    pub limit: u32,
    pub utilization_percent: f64,
    pub per_channel: HashMap<String, u32>,
    pub unique_clients: u32,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionRecord>>>>,
    config: StreamingConfig,
    /// Byte-gap after which a polled-but-stalled session moves to
    /// `monitoring`.
    stall_window: Duration,
}

impl SessionRegistry {
    pub fn new(config: StreamingConfig, stall_window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            stall_window,
        }
    }

    /// Admit a new session. Linearizable: the limit checks and the insert
    /// happen under one write lock, so two racing requests cannot both
    /// squeeze past a limit.
    pub async fn admit(
        &self,
        session_id: Option<String>,
        channel_id: &str,
        fingerprint: ClientFingerprint,
        client_ip: &str,
        user_agent: Option<String>,
    ) -> Result<String, AdmissionError> {
        let mut sessions = self.sessions.write().await;

        // A caller-supplied id that is still registered must not overwrite
        // the record: its exit watcher would finalize the replacement.
        if let Some(id) = &session_id
            && let Some(existing) = sessions.get(id)
        {
            let existing = existing.lock().await;
            return Err(AdmissionError::DuplicateClient {
                channel_id: existing.channel_id.clone(),
                session_id: existing.id.clone(),
            });
        }

        let mut total = 0u32;
        let mut on_channel = 0u32;
        for record in sessions.values() {
            let record = record.lock().await;
            if !record.state.is_active() {
                continue;
            }
            total += 1;
            if record.channel_id == channel_id {
                on_channel += 1;
                if record.fingerprint == fingerprint {
                    return Err(AdmissionError::DuplicateClient {
                        channel_id: channel_id.to_string(),
                        session_id: record.id.clone(),
                    });
                }
            }
        }

        if total >= self.config.max_concurrent_streams {
            return Err(AdmissionError::GlobalLimit {
                current: total,
                max: self.config.max_concurrent_streams,
            });
        }
        if on_channel >= self.config.max_streams_per_channel {
            return Err(AdmissionError::ChannelLimit {
                channel_id: channel_id.to_string(),
                current: on_channel,
                max: self.config.max_streams_per_channel,
            });
        }

        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let android_tv = user_agent.as_deref().is_some_and(is_android_tv);
        let record = SessionRecord {
            id: id.clone(),
            channel_id: channel_id.to_string(),
            fingerprint,
            client_ip: client_ip.to_string(),
            user_agent,
            android_tv,
            started_at: Instant::now(),
            started_wall: chrono::Utc::now(),
            state: SessionState::Admitting,
            teardown_reason: None,
            last_byte_at: None,
            last_poll_at: None,
            bytes_transferred: 0,
            samples: VecDeque::new(),
            current_bitrate_kbps: 0.0,
            peak_bitrate_kbps: 0.0,
            error_count: 0,
            probe_failures: 0,
            stop_encoder: None,
        };
        sessions.insert(id.clone(), Arc::new(Mutex::new(record)));
        debug!(session_id = %id, channel_id, "session admitted");
        Ok(id)
    }

    /// Attach the encoder stop hook after spawning. Called once per session.
    pub async fn attach_encoder(&self, session_id: &str, stop: Arc<dyn Fn() + Send + Sync>) {
        if let Some(record) = self.record(session_id).await {
            record.lock().await.stop_encoder = Some(stop);
        }
    }

    /// Account one stdout chunk: byte counter, bandwidth window, bitrates,
    /// and the `admitting/monitoring → streaming` transitions.
    pub async fn record_chunk(&self, session_id: &str, bytes: u64) {
        let Some(record) = self.record(session_id).await else {
            return;
        };
        let mut record = record.lock().await;
        let now = Instant::now();

        record.bytes_transferred += bytes;
        record.last_byte_at = Some(now);
        record.samples.push_back(BandwidthSample { at: now, bytes });
        record.prune_samples(self.config.bandwidth_window, now);
        record.current_bitrate_kbps =
            record.windowed_bitrate_kbps(self.config.bandwidth_window, now);
        if record.current_bitrate_kbps > record.peak_bitrate_kbps {
            record.peak_bitrate_kbps = record.current_bitrate_kbps;
        }

        match record.state {
            SessionState::Admitting | SessionState::Monitoring => {
                record.state = SessionState::Streaming;
            }
            _ => {}
        }
    }

    /// Account one status poll. Resets the consecutive probe-failure count
    /// and downgrades a stalled `streaming` session to `monitoring`.
    pub async fn record_poll(&self, session_id: &str) {
        let Some(record) = self.record(session_id).await else {
            return;
        };
        let mut record = record.lock().await;
        let now = Instant::now();
        record.last_poll_at = Some(now);
        record.probe_failures = 0;

        if record.state == SessionState::Streaming {
            let stalled = record
                .last_byte_at
                .is_none_or(|at| now.duration_since(at) >= self.stall_window);
            if stalled {
                record.state = SessionState::Monitoring;
            }
        }
    }

    pub async fn record_error(&self, session_id: &str) {
        if let Some(record) = self.record(session_id).await {
            record.lock().await.error_count += 1;
        }
    }

    pub async fn record_probe_failure(&self, session_id: &str) {
        if let Some(record) = self.record(session_id).await {
            record.lock().await.probe_failures += 1;
        }
    }

    /// Adopt the encoder's stderr error tally so the session snapshot and
    /// the final event report it.
    pub async fn set_error_count(&self, session_id: &str, count: u32) {
        if let Some(record) = self.record(session_id).await {
            let mut record = record.lock().await;
            record.error_count = record.error_count.max(count);
        }
    }

    /// Begin teardown. Returns `true` for exactly one caller per session;
    /// that caller owns stopping the encoder and emitting the final event.
    pub async fn begin_teardown(&self, session_id: &str, reason: TeardownReason) -> bool {
        let Some(record) = self.record(session_id).await else {
            return false;
        };
        let stop = {
            let mut record = record.lock().await;
            if matches!(
                record.state,
                SessionState::Stopping | SessionState::Terminated
            ) {
                return false;
            }
            record.state = SessionState::Stopping;
            record.teardown_reason = Some(reason);
            record.stop_encoder.take()
        };
        if let Some(stop) = stop {
            stop();
        }
        debug!(session_id, reason = reason.as_str(), "session stopping");
        true
    }

    /// Complete teardown after the encoder exit was observed: remove the
    /// record, flush counters, and emit the session-ended event.
    pub async fn finalize(&self, session_id: &str) -> Option<SessionSnapshot> {
        let record = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)?
        };
        let mut record = record.lock().await;
        record.state = SessionState::Terminated;
        let snapshot = record.snapshot();

        info!(
            session_id = %snapshot.id,
            channel_id = %snapshot.channel_id,
            reason = snapshot
                .teardown_reason
                .map(|r| r.as_str())
                .unwrap_or("unknown"),
            duration_secs = snapshot.duration.as_secs(),
            bytes = snapshot.bytes_transferred,
            avg_kbps = format!("{:.1}", snapshot.avg_bitrate_kbps),
            peak_kbps = format!("{:.1}", snapshot.peak_bitrate_kbps),
            errors = snapshot.error_count,
            "session ended"
        );
        Some(snapshot)
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let record = self.record(session_id).await?;
        let record = record.lock().await;
        Some(record.snapshot())
    }

    pub async fn activity_view(&self, session_id: &str) -> Option<ActivityView> {
        let record = self.record(session_id).await?;
        let record = record.lock().await;
        Some(record.activity_view(Instant::now()))
    }

    /// Consistent point-in-time enumeration. The map lock is held across the
    /// per-session reads so no insert/delete tears the snapshot.
    pub async fn active_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for record in sessions.values() {
            let record = record.lock().await;
            if record.state.is_active() {
                out.push(record.snapshot());
            }
        }
        out
    }

    /// Active sessions grouped by channel, sorted by channel id.
    pub async fn sessions_by_channel(&self) -> Vec<(String, Vec<SessionSnapshot>)> {
        let mut grouped: HashMap<String, Vec<SessionSnapshot>> = HashMap::new();
        for snapshot in self.active_sessions().await {
            grouped
                .entry(snapshot.channel_id.clone())
                .or_default()
                .push(snapshot);
        }
        let mut out: Vec<_> = grouped.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn find_by_client(&self, fingerprint: &ClientFingerprint) -> Vec<SessionSnapshot> {
        self.active_sessions()
            .await
            .into_iter()
            .filter(|s| &s.fingerprint == fingerprint)
            .collect()
    }

    pub async fn metrics(&self) -> ConcurrencyMetrics {
        let active = self.active_sessions().await;
        let total = active.len() as u32;
        let limit = self.config.max_concurrent_streams;
        let mut per_channel: HashMap<String, u32> = HashMap::new();
        let mut clients: HashSet<String> = HashSet::new();
        for snapshot in &active {
            *per_channel.entry(snapshot.channel_id.clone()).or_insert(0) += 1;
            clients.insert(snapshot.fingerprint.as_str().to_string());
        }
        ConcurrencyMetrics {
            total,
            limit,
            utilization_percent: if limit > 0 {
                (total as f64 / limit as f64) * 100.0
            } else {
                0.0
            },
            per_channel,
            unique_clients: clients.len() as u32,
        }
    }

    /// Periodic sweeper enforcing the hard session age bound. Sessions past
    /// the bound are torn down with reason `max_age` and finalized.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval);
            loop {
                interval.tick().await;
                let expired: Vec<String> = {
                    let sessions = registry.sessions.read().await;
                    let mut out = Vec::new();
                    for (id, record) in sessions.iter() {
                        let record = record.lock().await;
                        if record.state.is_active()
                            && record.started_at.elapsed() > registry.config.session_max_age
                        {
                            out.push(id.clone());
                        }
                    }
                    out
                };
                for id in expired {
                    warn!(session_id = %id, "session exceeded max age, terminating");
                    if registry.begin_teardown(&id, TeardownReason::MaxAge).await {
                        registry.finalize(&id).await;
                    }
                }
            }
        })
    }

    async fn record(&self, session_id: &str) -> Option<Arc<Mutex<SessionRecord>>> {
        self.sessions.read().await.get(session_id).cloned()
    }
}
