//! Heartbeat protocol engine
//!
//! Periodically reports liveness, per-service health and metrics to the
//! hub, and interprets the hub's response:
//! - Timer loop with an epoch guard so a stopped loop can never resurrect
//! - Bounded retry queue for payloads that failed to send (oldest-first
//!   replay, oldest dropped on overflow)
//! - Failure accounting consumed by the Runtime's offline watchdog
//! - Hub-issued actions re-published as advisory events, never executed
//!   directly by the engine

use crate::error::{Result, SpokeError};
use crate::events::{EventBus, SpokeEvent};
use crate::health::{HealthCache, ServiceHealthMap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Heartbeat endpoint, relative to the hub base URL.
const HEARTBEAT_ENDPOINT: &str = "api/spokes/heartbeat";

/// Immutable per-session parameters, fixed at initialize time.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub hub_url: String,
    pub spoke_id: String,
    pub instance_code: String,
    pub spoke_token: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub certificate_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub ca_bundle_path: Option<PathBuf>,
}

/// Aggregated counters shipped with each payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    pub uptime_seconds: u64,
    pub requests_last_hour: u64,
    pub auth_decisions_last_hour: u64,
    pub auth_denies_last_hour: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

/// Partial metrics merge, fed by collaborators between heartbeats.
#[derive(Debug, Clone, Default)]
pub struct MetricsUpdate {
    pub requests_last_hour: Option<u64>,
    pub auth_decisions_last_hour: Option<u64>,
    pub auth_denies_last_hour: Option<u64>,
    pub error_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub pending_audit_logs: Option<u64>,
}

/// Local backlog counts reported to the hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending_audit_logs: u64,
    pub pending_heartbeats: u64,
}

/// Outbound heartbeat body (spoke -> hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub heartbeat_id: String,
    pub spoke_id: String,
    pub instance_code: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
    pub services: ServiceHealthMap,
    pub metrics: HeartbeatMetrics,
    pub queues: QueueCounts,
}

/// Policy staleness signal from the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Current,
    Behind,
}

/// Hub directive types. Unrecognized types are tolerated for forward
/// compatibility and ignored at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubActionType {
    ForceSync,
    Suspend,
    Revoke,
    UpdateConfig,
    ClearCache,
    Restart,
    #[serde(other)]
    Unknown,
}

/// A directive returned in a heartbeat response. Ephemeral: consumed once,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubAction {
    #[serde(rename = "type")]
    pub action_type: HubActionType,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Inbound heartbeat response (hub -> spoke).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_policy_version: Option<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<HubAction>>,
}

/// A payload that failed to send, held for oldest-first replay.
#[derive(Debug)]
struct QueuedHeartbeat {
    payload: HeartbeatPayload,
    attempts: u32,
}

#[derive(Default)]
struct EngineState {
    config: Option<HeartbeatConfig>,
    client: Option<reqwest::Client>,
    running: bool,
    queue: VecDeque<QueuedHeartbeat>,
    consecutive_failures: u32,
    last_successful_heartbeat: Option<DateTime<Utc>>,
    last_response: Option<HeartbeatResponse>,
    policy_version: Option<String>,
    metrics: HeartbeatMetrics,
    pending_audit_logs: u64,
}

struct EngineInner {
    events: EventBus,
    health: Arc<HealthCache>,
    state: Mutex<EngineState>,
    /// Bumped on every stop(); a loop or in-flight attempt whose epoch no
    /// longer matches must discard its result.
    epoch: AtomicU64,
    cancel: Notify,
    started_at: Instant,
}

/// One send attempt's borrowed-out pieces, captured under the lock so no
/// await happens while it is held.
struct PreparedAttempt {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    spoke_id: String,
    instance_code: String,
}

/// The heartbeat protocol engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct HeartbeatEngine {
    inner: Arc<EngineInner>,
}

impl HeartbeatEngine {
    pub fn new(events: EventBus, health: Arc<HealthCache>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                events,
                health,
                state: Mutex::new(EngineState::default()),
                epoch: AtomicU64::new(0),
                cancel: Notify::new(),
                started_at: Instant::now(),
            }),
        }
    }

    /// Store session parameters and build the HTTP client, including the
    /// mTLS identity when certificate material is configured. Does not
    /// start the timer.
    pub async fn initialize(&self, config: HeartbeatConfig) -> Result<()> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .use_rustls_tls();

        if let (Some(cert), Some(key)) = (&config.certificate_path, &config.private_key_path) {
            let mut pem = tokio::fs::read(cert).await?;
            pem.extend(tokio::fs::read(key).await?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
            debug!("configured mTLS client identity from {}", cert.display());
        }
        if let Some(ca) = &config.ca_bundle_path {
            let pem = tokio::fs::read(ca).await?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        let client = builder.build()?;

        let mut state = self.inner.state.lock();
        state.client = Some(client);
        state.config = Some(config);
        Ok(())
    }

    /// Start the timer loop: one immediate attempt, then every interval.
    /// Idempotent while running; fails if initialize() has not been called.
    pub fn start(&self) -> Result<()> {
        let (epoch, interval_ms) = {
            let mut state = self.inner.state.lock();
            if state.running {
                return Ok(());
            }
            let config = state
                .config
                .as_ref()
                .ok_or(SpokeError::NotInitialized { operation: "start the heartbeat loop" })?;
            let interval_ms = config.interval_ms;
            state.running = true;
            (self.inner.epoch.load(Ordering::SeqCst), interval_ms)
        };

        info!("starting heartbeat loop (interval: {}ms)", interval_ms);
        self.inner.events.emit(SpokeEvent::Started);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_loop(inner, epoch, interval_ms));
        Ok(())
    }

    /// Cancel the pending timer. An in-flight attempt is not aborted; its
    /// late result is discarded via the epoch guard. Safe when not running.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel.notify_waiters();
        info!("heartbeat loop stopped");
        self.inner.events.emit(SpokeEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// One manual heartbeat attempt. Unlike the periodic loop, transport
    /// failures propagate to the caller (after being recorded).
    pub async fn send_heartbeat(&self) -> Result<HeartbeatResponse> {
        if self.inner.state.lock().config.is_none() {
            return Err(SpokeError::NotInitialized { operation: "send a heartbeat" });
        }

        self.inner.events.emit(SpokeEvent::Sending);
        let payload = assemble_payload(&self.inner);
        let prepared = prepare_attempt(&self.inner)?;

        match post_payload(&prepared, &payload).await {
            Ok(response) => {
                record_success(&self.inner, &response);
                replay_queue(&self.inner).await;
                process_response(&self.inner, &response);
                Ok(response)
            }
            Err(e) => {
                record_failure(&self.inner, payload);
                Err(e)
            }
        }
    }

    /// Last-probed health for the five collaborator services.
    pub fn get_service_health(&self) -> ServiceHealthMap {
        self.inner.health.snapshot()
    }

    /// Re-probe all collaborators and return the refreshed snapshot.
    pub async fn force_health_refresh(&self) -> ServiceHealthMap {
        self.inner.health.refresh_all().await
    }

    /// Merge collaborator counters into the next payload's metrics.
    pub fn update_metrics(&self, update: MetricsUpdate) {
        let mut state = self.inner.state.lock();
        if let Some(v) = update.requests_last_hour {
            state.metrics.requests_last_hour = v;
        }
        if let Some(v) = update.auth_decisions_last_hour {
            state.metrics.auth_decisions_last_hour = v;
        }
        if let Some(v) = update.auth_denies_last_hour {
            state.metrics.auth_denies_last_hour = v;
        }
        if let Some(v) = update.error_rate {
            state.metrics.error_rate = v;
        }
        if let Some(v) = update.avg_latency_ms {
            state.metrics.avg_latency_ms = v;
        }
        if let Some(v) = update.pending_audit_logs {
            state.pending_audit_logs = v;
        }
    }

    pub fn set_policy_version(&self, version: impl Into<String>) {
        self.inner.state.lock().policy_version = Some(version.into());
    }

    pub fn get_queue_size(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn get_consecutive_failures(&self) -> u32 {
        self.inner.state.lock().consecutive_failures
    }

    pub fn get_last_successful_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_successful_heartbeat
    }

    pub fn get_last_response(&self) -> Option<HeartbeatResponse> {
        self.inner.state.lock().last_response.clone()
    }
}

/// Periodic loop. All failures are recovered locally; nothing here may
/// crash the long-running process.
async fn run_loop(inner: Arc<EngineInner>, my_epoch: u64, interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.cancel.notified() => break,
        }
        if inner.epoch.load(Ordering::SeqCst) != my_epoch {
            break;
        }

        inner.events.emit(SpokeEvent::Sending);
        let payload = assemble_payload(&inner);
        let prepared = match prepare_attempt(&inner) {
            Ok(p) => p,
            Err(_) => break,
        };
        let result = post_payload(&prepared, &payload).await;

        if inner.epoch.load(Ordering::SeqCst) != my_epoch {
            debug!("discarding heartbeat result from a stopped loop");
            break;
        }

        match result {
            Ok(response) => {
                record_success(&inner, &response);
                replay_queue(&inner).await;
                process_response(&inner, &response);
            }
            Err(e) => {
                let failures = {
                    let state = inner.state.lock();
                    state.consecutive_failures + 1
                };
                warn!("heartbeat attempt failed ({} consecutive): {}", failures, e);
                record_failure(&inner, payload);
            }
        }
    }
}

/// Build the outbound payload from the health cache and metrics
/// accumulator.
fn assemble_payload(inner: &Arc<EngineInner>) -> HeartbeatPayload {
    let services = inner.health.snapshot();
    let state = inner.state.lock();

    let mut metrics = state.metrics.clone();
    metrics.uptime_seconds = inner.started_at.elapsed().as_secs();

    let (spoke_id, instance_code) = state
        .config
        .as_ref()
        .map(|c| (c.spoke_id.clone(), c.instance_code.clone()))
        .unwrap_or_default();

    HeartbeatPayload {
        heartbeat_id: Uuid::new_v4().to_string(),
        spoke_id,
        instance_code,
        timestamp: Utc::now(),
        policy_version: state.policy_version.clone(),
        services,
        metrics,
        queues: QueueCounts {
            pending_audit_logs: state.pending_audit_logs,
            pending_heartbeats: state.queue.len() as u64,
        },
    }
}

fn prepare_attempt(inner: &Arc<EngineInner>) -> Result<PreparedAttempt> {
    let state = inner.state.lock();
    let (config, client) = match (state.config.as_ref(), state.client.as_ref()) {
        (Some(config), Some(client)) => (config, client),
        _ => return Err(SpokeError::NotInitialized { operation: "send a heartbeat" }),
    };

    Ok(PreparedAttempt {
        client: client.clone(),
        endpoint: format!("{}/{}", config.hub_url.trim_end_matches('/'), HEARTBEAT_ENDPOINT),
        token: config.spoke_token.clone(),
        spoke_id: config.spoke_id.clone(),
        instance_code: config.instance_code.clone(),
    })
}

/// POST one payload to the hub. Timeouts and non-2xx statuses surface as
/// transport errors.
async fn post_payload(
    prepared: &PreparedAttempt,
    payload: &HeartbeatPayload,
) -> Result<HeartbeatResponse> {
    let response = prepared
        .client
        .post(&prepared.endpoint)
        .bearer_auth(&prepared.token)
        .header("X-Spoke-ID", &prepared.spoke_id)
        .header("X-Instance-Code", &prepared.instance_code)
        .json(payload)
        .send()
        .await?
        .error_for_status()?
        .json::<HeartbeatResponse>()
        .await?;
    Ok(response)
}

fn record_success(inner: &Arc<EngineInner>, response: &HeartbeatResponse) {
    let mut state = inner.state.lock();
    state.consecutive_failures = 0;
    state.last_successful_heartbeat = Some(Utc::now());
    state.last_response = Some(response.clone());
}

/// Count the failure and queue the payload for later replay. The queue is
/// bounded: when full, the oldest entry is dropped to admit the newest.
fn record_failure(inner: &Arc<EngineInner>, payload: HeartbeatPayload) {
    let mut state = inner.state.lock();
    state.consecutive_failures += 1;

    let max_queue_size = state
        .config
        .as_ref()
        .map(|c| c.max_queue_size)
        .unwrap_or(DEFAULT_MAX_QUEUE_SIZE);

    if state.queue.len() >= max_queue_size.max(1) {
        if let Some(dropped) = state.queue.pop_front() {
            warn!(
                "heartbeat queue full, dropping oldest payload {}",
                dropped.payload.heartbeat_id
            );
        }
    }
    state.queue.push_back(QueuedHeartbeat { payload, attempts: 0 });
}

/// Replay queued payloads oldest-first while connectivity holds. Each
/// entry gets up to max_retries attempts before it is discarded.
async fn replay_queue(inner: &Arc<EngineInner>) {
    loop {
        let (entry, prepared, max_retries) = {
            let mut state = inner.state.lock();
            let Some(entry) = state.queue.pop_front() else {
                return;
            };
            let max_retries = state
                .config
                .as_ref()
                .map(|c| c.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES);
            drop(state);
            let prepared = match prepare_attempt(inner) {
                Ok(p) => p,
                Err(_) => return,
            };
            (entry, prepared, max_retries)
        };

        let QueuedHeartbeat { payload, attempts } = entry;
        match post_payload(&prepared, &payload).await {
            Ok(_) => {
                debug!("replayed queued heartbeat {}", payload.heartbeat_id);
            }
            Err(e) => {
                let attempts = attempts + 1;
                let mut state = inner.state.lock();
                if attempts >= max_retries {
                    warn!(
                        "discarding heartbeat {} after {} replay attempts: {}",
                        payload.heartbeat_id, attempts, e
                    );
                } else {
                    state.queue.push_front(QueuedHeartbeat { payload, attempts });
                }
                // Connectivity window closed; stop replaying this round.
                return;
            }
        }
    }
}

/// Interpret a hub response: surface policy staleness and re-publish hub
/// actions as advisory events, urgent ones first. The engine itself never
/// performs a privileged operation.
fn process_response(inner: &Arc<EngineInner>, response: &HeartbeatResponse) {
    if response.sync_status == SyncStatus::Behind {
        info!(
            "policy is behind hub version {:?}",
            response.current_policy_version
        );
        inner.events.emit(SpokeEvent::PolicySyncNeeded {
            hub_version: response.current_policy_version.clone(),
        });
    }

    let mut actions = response.actions.clone().unwrap_or_default();
    // Stable sort: urgent first, array order within equal urgency.
    actions.sort_by_key(|a| !a.urgent);

    for action in actions {
        if action.action_type == HubActionType::Unknown {
            warn!("ignoring unrecognized hub action: {:?}", action.message);
            continue;
        }
        info!(
            "hub action received: {:?} (urgent: {})",
            action.action_type, action.urgent
        );
        inner.events.emit(SpokeEvent::HubAction { action });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::testing::cache_with_all;

    fn test_config(hub_url: &str, interval_ms: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            hub_url: hub_url.to_string(),
            spoke_id: "spoke-nzl-01".to_string(),
            instance_code: "NZL".to_string(),
            spoke_token: "tok".to_string(),
            interval_ms,
            timeout_ms: 500,
            max_queue_size: 3,
            max_retries: 2,
            certificate_path: None,
            private_key_path: None,
            ca_bundle_path: None,
        }
    }

    async fn initialized_engine(hub_url: &str, interval_ms: u64) -> HeartbeatEngine {
        let engine = HeartbeatEngine::new(EventBus::new(), cache_with_all(true));
        engine
            .initialize(test_config(hub_url, interval_ms))
            .await
            .unwrap();
        engine
    }

    /// Minimal one-shot HTTP hub answering every request with `body`.
    async fn spawn_stub_hub(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let mut read = 0;
                    // Read until the end of headers, then trust
                    // Content-Length to finish the body.
                    loop {
                        let n = match socket.read(&mut buf[read..]).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        read += n;
                        let head = String::from_utf8_lossy(&buf[..read]);
                        if let Some(header_end) = head.find("\r\n\r\n") {
                            let content_length = head
                                .lines()
                                .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(str::to_string))
                                .and_then(|v| v.trim().parse::<usize>().ok())
                                .unwrap_or(0);
                            if read >= header_end + 4 + content_length {
                                break;
                            }
                        }
                        if read == buf.len() {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_send_heartbeat_before_initialize_fails() {
        let engine = HeartbeatEngine::new(EventBus::new(), cache_with_all(true));
        let err = engine.send_heartbeat().await.unwrap_err();
        assert!(matches!(err, SpokeError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_start_before_initialize_fails() {
        let engine = HeartbeatEngine::new(EventBus::new(), cache_with_all(true));
        assert!(matches!(
            engine.start().unwrap_err(),
            SpokeError::NotInitialized { .. }
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_successful_heartbeat_resets_failure_counter() {
        let hub = spawn_stub_hub(r#"{"success":true,"syncStatus":"current"}"#).await;
        let engine = initialized_engine(&hub, 60_000).await;

        // Seed a failure first.
        {
            let payload = assemble_payload(&engine.inner);
            record_failure(&engine.inner, payload);
        }
        assert_eq!(engine.get_consecutive_failures(), 1);

        let response = engine.send_heartbeat().await.unwrap();
        assert!(response.success);
        assert_eq!(engine.get_consecutive_failures(), 0);
        assert!(engine.get_last_successful_heartbeat().is_some());
        assert!(engine.get_last_response().is_some());
    }

    #[tokio::test]
    async fn test_failed_heartbeat_counts_and_queues() {
        // Nothing listens on this port.
        let engine = initialized_engine("http://127.0.0.1:9", 60_000).await;

        assert!(engine.send_heartbeat().await.is_err());
        assert!(engine.send_heartbeat().await.is_err());

        assert_eq!(engine.get_consecutive_failures(), 2);
        assert_eq!(engine.get_queue_size(), 2);
        assert!(engine.get_last_successful_heartbeat().is_none());
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let engine = initialized_engine("http://127.0.0.1:9", 60_000).await;

        let mut first_id = None;
        for _ in 0..4 {
            let payload = assemble_payload(&engine.inner);
            first_id.get_or_insert_with(|| payload.heartbeat_id.clone());
            record_failure(&engine.inner, payload);
        }

        // max_queue_size is 3: the first payload was evicted.
        assert_eq!(engine.get_queue_size(), 3);
        let state = engine.inner.state.lock();
        assert!(state
            .queue
            .iter()
            .all(|q| Some(&q.payload.heartbeat_id) != first_id.as_ref()));
    }

    #[tokio::test]
    async fn test_queue_replays_oldest_first_after_success() {
        let hub = spawn_stub_hub(r#"{"success":true,"syncStatus":"current"}"#).await;
        let engine = initialized_engine(&hub, 60_000).await;

        for _ in 0..2 {
            let payload = assemble_payload(&engine.inner);
            record_failure(&engine.inner, payload);
        }
        assert_eq!(engine.get_queue_size(), 2);

        engine.send_heartbeat().await.unwrap();
        assert_eq!(engine.get_queue_size(), 0);
    }

    #[tokio::test]
    async fn test_replay_discards_entry_after_max_retries() {
        // Hub stays unreachable the whole time; max_retries is 2.
        let engine = initialized_engine("http://127.0.0.1:9", 60_000).await;

        let payload = assemble_payload(&engine.inner);
        record_failure(&engine.inner, payload);
        assert_eq!(engine.get_queue_size(), 1);

        // First replay fails and re-queues the entry with one attempt
        // recorded.
        replay_queue(&engine.inner).await;
        assert_eq!(engine.get_queue_size(), 1);
        {
            let state = engine.inner.state.lock();
            assert_eq!(state.queue.front().map(|q| q.attempts), Some(1));
        }

        // Second failure reaches the retry cap: discarded, not re-queued.
        replay_queue(&engine.inner).await;
        assert_eq!(engine.get_queue_size(), 0);
    }

    #[tokio::test]
    async fn test_behind_sync_status_and_urgent_action_are_observable() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let engine = HeartbeatEngine::new(bus, cache_with_all(true));
        engine
            .initialize(test_config("http://127.0.0.1:9", 60_000))
            .await
            .unwrap();

        let response: HeartbeatResponse = serde_json::from_str(
            r#"{
                "success": true,
                "syncStatus": "behind",
                "currentPolicyVersion": "v42",
                "actions": [
                    {"type": "clear_cache", "urgent": false},
                    {"type": "force_sync", "urgent": true}
                ]
            }"#,
        )
        .unwrap();

        process_response(&engine.inner, &response);

        match rx.try_recv().unwrap() {
            SpokeEvent::PolicySyncNeeded { hub_version } => {
                assert_eq!(hub_version.as_deref(), Some("v42"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // Urgent force_sync is dispatched ahead of the non-urgent action.
        match rx.try_recv().unwrap() {
            SpokeEvent::HubAction { action } => {
                assert_eq!(action.action_type, HubActionType::ForceSync);
                assert!(action.urgent);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            SpokeEvent::HubAction { action } => {
                assert_eq!(action.action_type, HubActionType::ClearCache);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_type_is_ignored() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let engine = HeartbeatEngine::new(bus, cache_with_all(true));
        engine
            .initialize(test_config("http://127.0.0.1:9", 60_000))
            .await
            .unwrap();

        let response: HeartbeatResponse = serde_json::from_str(
            r#"{
                "success": true,
                "syncStatus": "current",
                "actions": [
                    {"type": "quarantine_spoke", "urgent": true},
                    {"type": "restart"}
                ]
            }"#,
        )
        .unwrap();

        process_response(&engine.inner, &response);

        // Only the recognized action comes through.
        match rx.try_recv().unwrap() {
            SpokeEvent::HubAction { action } => {
                assert_eq!(action.action_type, HubActionType::Restart);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_single_timer() {
        let hub = spawn_stub_hub(r#"{"success":true,"syncStatus":"current"}"#).await;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let engine = HeartbeatEngine::new(bus, cache_with_all(true));
        engine
            .initialize(test_config(&hub, 10_000))
            .await
            .unwrap();

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());

        // One Started, then exactly one Sending for the immediate tick of
        // a single timer.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut started = 0;
        let mut sending = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SpokeEvent::Started => started += 1,
                SpokeEvent::Sending => sending += 1,
                _ => {}
            }
        }
        assert_eq!(started, 1);
        assert_eq!(sending, 1);

        engine.stop();
    }

    #[tokio::test]
    async fn test_stop_suppresses_sending_for_a_full_interval() {
        let hub = spawn_stub_hub(r#"{"success":true,"syncStatus":"current"}"#).await;
        let bus = EventBus::new();
        let engine = HeartbeatEngine::new(bus.clone(), cache_with_all(true));
        engine.initialize(test_config(&hub, 50)).await.unwrap();

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        engine.stop();
        assert!(!engine.is_running());

        // Drain everything emitted up to the stop, then watch for a full
        // interval: no further Sending may fire.
        let mut rx = bus.subscribe();
        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, SpokeEvent::Sending),
                "Sending fired after stop()"
            );
        }
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_safe() {
        let engine = HeartbeatEngine::new(EventBus::new(), cache_with_all(true));
        engine.stop();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_payload_carries_services_and_queue_counts() {
        let engine = initialized_engine("http://127.0.0.1:9", 60_000).await;
        engine.inner.health.refresh_all().await;
        engine.set_policy_version("v7");
        engine.update_metrics(MetricsUpdate {
            requests_last_hour: Some(120),
            pending_audit_logs: Some(4),
            ..Default::default()
        });

        let payload = assemble_payload(&engine.inner);

        assert_eq!(payload.spoke_id, "spoke-nzl-01");
        assert_eq!(payload.instance_code, "NZL");
        assert_eq!(payload.policy_version.as_deref(), Some("v7"));
        assert_eq!(payload.services.len(), 5);
        assert!(payload.services.values().all(|s| s.healthy));
        assert_eq!(payload.metrics.requests_last_hour, 120);
        assert_eq!(payload.queues.pending_audit_logs, 4);
        assert_eq!(payload.queues.pending_heartbeats, 0);
    }
}
