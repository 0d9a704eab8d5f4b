//! Spoke lifecycle runtime
//!
//! Owns the per-spoke configuration record, the lifecycle state machine,
//! token validity and the policy/connection status flags. Remote
//! directives never act on the spoke directly; everything is filtered
//! through the guarded transition table here. Also owns the offline
//! watchdog: the Heartbeat Engine only accounts failures, declaring the
//! spoke OFFLINE is runtime policy.

use crate::config::{load_config, resolve_config_path, save_config, EnvOverrides, SpokeConfig};
use crate::error::{Result, SpokeError};
use crate::events::{EventBus, SpokeEvent};
use crate::health::{HealthCache, HealthProbe, ServiceHealthMap};
use crate::heartbeat::{
    HeartbeatConfig, HeartbeatEngine, HubAction, HubActionType, DEFAULT_MAX_QUEUE_SIZE,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle states. Initial state is `Uninitialized`; there is no
/// terminal state, `Offline` is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpokeStatus {
    #[default]
    Uninitialized,
    Initialized,
    Pending,
    Approved,
    Offline,
}

impl fmt::Display for SpokeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpokeStatus::Uninitialized => "uninitialized",
            SpokeStatus::Initialized => "initialized",
            SpokeStatus::Pending => "pending",
            SpokeStatus::Approved => "approved",
            SpokeStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// The guarded transition table. `Offline -> Approved` is the recovery
/// edge: a spoke that reaches the hub again re-enters Approved without a
/// fresh approval round-trip, since it still holds its token.
fn is_allowed_transition(from: SpokeStatus, to: SpokeStatus) -> bool {
    use SpokeStatus::*;
    matches!(
        (from, to),
        (Uninitialized, Initialized)
            | (Initialized, Pending)
            | (Pending, Approved)
            | (Approved, Offline)
            | (Offline, Approved)
    )
}

/// In-memory runtime state, not persisted verbatim.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub status: SpokeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_policy_sync: Option<DateTime<Utc>>,
    pub hub_connected: bool,
    pub opal_connected: bool,
    pub policy_version: Option<String>,
    pub consecutive_heartbeat_failures: u32,
    /// Set only while status is Offline.
    pub offline_since: Option<DateTime<Utc>>,
}

/// Roll-up of the five collaborator probes and federation state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub overall: OverallHealth,
    pub services: ServiceHealthMap,
    pub federation: FederationHealth,
    pub metrics: FederationMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationHealth {
    pub status: SpokeStatus,
    pub hub_connected: bool,
    pub opal_connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_policy_sync: Option<DateTime<Utc>>,
    pub offline_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationMetrics {
    pub policy_version: Option<String>,
    pub consecutive_heartbeat_failures: u32,
    pub pending_heartbeats: usize,
}

#[derive(Default)]
struct RuntimeCore {
    config: Option<SpokeConfig>,
    config_path: Option<PathBuf>,
    state: RuntimeState,
    /// When the spoke last entered Approved; baseline for the offline
    /// grace period before any heartbeat has succeeded.
    approved_since: Option<DateTime<Utc>>,
    watchdog: Option<JoinHandle<()>>,
    action_filter: Option<JoinHandle<()>>,
}

struct RuntimeInner {
    env: EnvOverrides,
    events: EventBus,
    health: Arc<HealthCache>,
    engine: HeartbeatEngine,
    core: RwLock<RuntimeCore>,
}

/// The spoke control-plane runtime. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct SpokeRuntime {
    inner: Arc<RuntimeInner>,
}

impl SpokeRuntime {
    pub fn new(env: EnvOverrides, probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        let events = EventBus::new();
        let health = Arc::new(HealthCache::new(probes));
        let engine = HeartbeatEngine::new(events.clone(), Arc::clone(&health));
        Self {
            inner: Arc::new(RuntimeInner {
                env,
                events,
                health,
                engine,
                core: RwLock::new(RuntimeCore::default()),
            }),
        }
    }

    /// Notification bus shared by the runtime and its heartbeat engine.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn engine(&self) -> &HeartbeatEngine {
        &self.inner.engine
    }

    /// Load, validate and adopt the configuration record, then move
    /// Uninitialized -> Initialized. A persisted lifecycle state beyond
    /// Initialized (pending/approved/offline) is restored afterwards so a
    /// restarted spoke does not need re-approval. Any failure leaves the
    /// runtime Uninitialized.
    pub async fn initialize(&self, path: Option<&Path>) -> Result<()> {
        let resolved = resolve_config_path(path, &self.inner.env)?;
        let config = load_config(&resolved, &self.inner.env).await?;
        let persisted_status = config.status;

        {
            let mut core = self.inner.core.write().await;
            core.config = Some(config);
            core.config_path = Some(resolved);
        }
        self.transition_state(SpokeStatus::Initialized).await?;

        match persisted_status {
            SpokeStatus::Pending | SpokeStatus::Approved | SpokeStatus::Offline => {
                info!("restoring persisted lifecycle state '{}'", persisted_status);
                let mut core = self.inner.core.write().await;
                core.state.status = persisted_status;
                if persisted_status == SpokeStatus::Offline {
                    core.state.offline_since = Some(Utc::now());
                }
                if let Some(config) = core.config.as_mut() {
                    config.status = persisted_status;
                }
                persist_locked(&mut core).await;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn get_config(&self) -> Option<SpokeConfig> {
        self.inner.core.read().await.config.clone()
    }

    pub async fn get_state(&self) -> RuntimeState {
        self.inner.core.read().await.state.clone()
    }

    /// Guarded lifecycle transition. Fails with `InvalidTransition` when
    /// the table has no edge for the current state; on success mutates
    /// status, mirrors it into the config record, persists, and publishes
    /// `StateChange`.
    pub async fn transition_state(&self, target: SpokeStatus) -> Result<()> {
        let from = {
            let mut core = self.inner.core.write().await;
            let from = core.state.status;
            if !is_allowed_transition(from, target) {
                return Err(SpokeError::InvalidTransition {
                    from: from.to_string(),
                    to: target.to_string(),
                });
            }
            apply_status(&mut core, target);
            persist_locked(&mut core).await;
            from
        };

        info!("spoke state transition: {} -> {}", from, target);
        self.inner.events.emit(SpokeEvent::StateChange {
            from: from.to_string(),
            to: target.to_string(),
        });

        self.apply_engine_policy(from, target).await;
        Ok(())
    }

    /// Operator escape hatch: set any state, bypassing the transition
    /// table. Audited with a warning and does not publish the guarded
    /// `StateChange` notification.
    pub async fn force_status(&self, target: SpokeStatus) {
        let from = {
            let mut core = self.inner.core.write().await;
            let from = core.state.status;
            warn!(
                "forcing spoke status {} -> {} (transition table bypassed)",
                from, target
            );
            apply_status(&mut core, target);
            persist_locked(&mut core).await;
            from
        };
        self.apply_engine_policy(from, target).await;
    }

    /// True iff a token is present and not yet expired.
    pub async fn is_token_valid(&self) -> bool {
        let core = self.inner.core.read().await;
        core.config
            .as_ref()
            .map(|c| token_valid_at(c, Utc::now()))
            .unwrap_or(false)
    }

    /// Store the hub-issued bearer credential. Persists the record before
    /// returning.
    pub async fn set_token(&self, token: impl Into<String>, expires_at: DateTime<Utc>) -> Result<()> {
        let mut core = self.inner.core.write().await;
        let config = core
            .config
            .as_mut()
            .ok_or(SpokeError::NotInitialized { operation: "set the spoke token" })?;
        config.spoke_token = Some(token.into());
        config.token_expires_at = Some(expires_at);
        config.touch();

        let path = core
            .config_path
            .clone()
            .ok_or(SpokeError::NoConfig)?;
        let snapshot = core.config.clone().ok_or(SpokeError::NoConfig)?;
        save_config(&path, &snapshot).await?;
        Ok(())
    }

    /// Renewal is delegated to the external token issuer; this only
    /// signals the intent.
    pub fn refresh_token(&self) {
        debug!("token refresh requested");
        self.inner.events.emit(SpokeEvent::TokenRefreshing);
    }

    pub async fn update_policy_version(&self, version: impl Into<String>) {
        let version = version.into();
        {
            let mut core = self.inner.core.write().await;
            core.state.policy_version = Some(version.clone());
            core.state.last_policy_sync = Some(Utc::now());
        }
        self.inner.engine.set_policy_version(version.clone());
        self.inner.events.emit(SpokeEvent::PolicySync { version });
    }

    pub async fn update_opal_connection(&self, connected: bool) {
        {
            let mut core = self.inner.core.write().await;
            core.state.opal_connected = connected;
        }
        self.inner
            .events
            .emit(SpokeEvent::OpalConnectionChange { connected });
    }

    /// Probe all collaborators and merge the results with federation
    /// state. Overall is healthy only when every service is.
    pub async fn get_health_status(&self) -> HealthStatus {
        let services = self.inner.health.refresh_all().await;
        let all_healthy = !services.is_empty() && services.values().all(|s| s.healthy);

        let core = self.inner.core.read().await;
        HealthStatus {
            overall: if all_healthy {
                OverallHealth::Healthy
            } else {
                OverallHealth::Degraded
            },
            services,
            federation: FederationHealth {
                status: core.state.status,
                hub_connected: core.state.hub_connected,
                opal_connected: core.state.opal_connected,
                last_heartbeat: core.state.last_heartbeat,
                last_policy_sync: core.state.last_policy_sync,
                offline_since: core.state.offline_since,
            },
            metrics: FederationMetrics {
                policy_version: core.state.policy_version.clone(),
                consecutive_heartbeat_failures: core.state.consecutive_heartbeat_failures,
                pending_heartbeats: self.inner.engine.get_queue_size(),
            },
        }
    }

    /// Begin supervision: spawns the offline watchdog and, when the spoke
    /// is Approved, starts the heartbeat loop.
    pub async fn start(&self) -> Result<()> {
        let status = {
            let core = self.inner.core.read().await;
            if core.config.is_none() {
                return Err(SpokeError::NotInitialized { operation: "start the spoke runtime" });
            }
            core.state.status
        };

        self.spawn_watchdog().await;
        match status {
            SpokeStatus::Approved => self.start_heartbeat().await?,
            // A spoke restored while Offline still needs a live engine
            // session so the watchdog's recovery probes can reach the hub.
            SpokeStatus::Offline => self.prepare_heartbeat().await?,
            _ => {}
        }
        Ok(())
    }

    /// Stop the heartbeat loop, the watchdog and the action filter.
    pub async fn stop(&self) {
        self.inner.engine.stop();
        let mut core = self.inner.core.write().await;
        if let Some(watchdog) = core.watchdog.take() {
            watchdog.abort();
        }
        if let Some(filter) = core.action_filter.take() {
            filter.abort();
        }
    }

    /// Stop everything, persist the record, publish `Shutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        info!("spoke runtime shutting down");
        self.stop().await;
        if self.inner.core.read().await.config.is_some() {
            self.save_configuration().await?;
        }
        self.inner.events.emit(SpokeEvent::Shutdown);
        Ok(())
    }

    /// Persist the configuration record to its resolved path.
    pub async fn save_configuration(&self) -> Result<()> {
        let mut core = self.inner.core.write().await;
        let path = core.config_path.clone().ok_or(SpokeError::NoConfig)?;
        let config = core.config.as_mut().ok_or(SpokeError::NoConfig)?;
        config.touch();
        let snapshot = config.clone();
        save_config(&path, &snapshot).await
    }

    // -- internals --------------------------------------------------------

    /// (Re)build the engine session from the current record. Each
    /// Approved entry is a fresh heartbeat session, so a token rotated
    /// while not Approved is picked up here.
    async fn prepare_heartbeat(&self) -> Result<()> {
        let config = {
            let core = self.inner.core.read().await;
            core.config
                .clone()
                .ok_or(SpokeError::NotInitialized { operation: "start the heartbeat engine" })?
        };

        self.inner
            .engine
            .initialize(HeartbeatConfig {
                hub_url: config.hub_url.clone(),
                spoke_id: config.spoke_id.clone(),
                instance_code: config.instance_code.clone(),
                spoke_token: config.spoke_token.clone().unwrap_or_default(),
                interval_ms: config.heartbeat_interval_ms,
                timeout_ms: DEFAULT_TIMEOUT_MS,
                max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
                max_retries: DEFAULT_MAX_RETRIES,
                certificate_path: config.certificate_path.clone(),
                private_key_path: config.private_key_path.clone(),
                ca_bundle_path: None,
            })
            .await
    }

    /// Rebuild the engine session and start the timer loop.
    async fn start_heartbeat(&self) -> Result<()> {
        self.prepare_heartbeat().await?;
        self.inner.engine.start()
    }

    /// Start/stop the heartbeat loop on entering/leaving Approved; used
    /// by both the guarded and the forced path. Never respawns the
    /// supervision tasks: the watchdog and action filter awaiting a
    /// transition must not re-enter their own spawn sites.
    async fn apply_engine_policy(&self, from: SpokeStatus, to: SpokeStatus) {
        if to == SpokeStatus::Approved {
            if let Err(e) = self.start_heartbeat().await {
                warn!("failed to start heartbeat engine: {}", e);
            }
        } else if from == SpokeStatus::Approved {
            self.inner.engine.stop();
        }
    }

    async fn spawn_watchdog(&self) {
        let mut core = self.inner.core.write().await;
        let stale = core
            .watchdog
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true);
        if stale {
            core.watchdog = Some(tokio::spawn(run_watchdog(self.clone())));
        }
        let stale = core
            .action_filter
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true);
        if stale {
            core.action_filter = Some(tokio::spawn(run_action_filter(self.clone())));
        }
    }

    /// Local, filtered execution of a hub directive. Never blindly
    /// obedient: each type is checked against the current lifecycle state
    /// and only a restricted surface is touched.
    async fn handle_hub_action(&self, action: HubAction) {
        match action.action_type {
            HubActionType::ForceSync => {
                info!("hub requested immediate policy resync");
                self.inner
                    .events
                    .emit(SpokeEvent::PolicySyncNeeded { hub_version: None });
            }
            HubActionType::Suspend => {
                if let Err(e) = self.transition_state(SpokeStatus::Offline).await {
                    warn!("suspend directive ignored: {}", e);
                }
            }
            HubActionType::Revoke => {
                warn!("hub revoked our token, ceasing to authorize new work");
                let mut core = self.inner.core.write().await;
                if let Some(config) = core.config.as_mut() {
                    config.spoke_token = None;
                    config.token_expires_at = None;
                    config.touch();
                }
                persist_locked(&mut core).await;
            }
            HubActionType::UpdateConfig => {
                self.apply_config_update(action.payload.as_ref()).await;
            }
            HubActionType::ClearCache | HubActionType::Restart => {
                // Advisory: collaborators subscribed to the bus act on
                // these, the runtime only records them.
                info!("hub action {:?} forwarded to collaborators", action.action_type);
            }
            HubActionType::Unknown => {}
        }
    }

    /// Apply the restricted subset of remotely updatable fields. Secrets
    /// and identity fields are never rewritten from a hub payload.
    async fn apply_config_update(&self, payload: Option<&serde_json::Value>) {
        let Some(payload) = payload else {
            warn!("update_config directive without payload, ignoring");
            return;
        };
        let (changed, rearm) = {
            let mut core = self.inner.core.write().await;
            let Some(config) = core.config.as_mut() else {
                return;
            };
            let mut changed = false;
            let mut interval_changed = false;
            if let Some(interval) = payload.get("heartbeatIntervalMs").and_then(|v| v.as_u64()) {
                info!("hub updated heartbeatIntervalMs to {}", interval);
                config.heartbeat_interval_ms = interval;
                changed = true;
                interval_changed = true;
            }
            if let Some(grace) = payload.get("offlineGracePeriodMs").and_then(|v| v.as_u64()) {
                info!("hub updated offlineGracePeriodMs to {}", grace);
                config.offline_grace_period_ms = grace;
                changed = true;
            }
            if changed {
                config.touch();
                persist_locked(&mut core).await;
            }
            (changed, interval_changed && core.state.status == SpokeStatus::Approved)
        };

        if !changed {
            warn!("update_config directive carried no applicable field");
            return;
        }
        // Re-arm the loop so a new interval takes effect immediately
        // instead of on the next Approved entry.
        if rearm && self.inner.engine.is_running() {
            self.inner.engine.stop();
            if let Err(e) = self.start_heartbeat().await {
                warn!("failed to restart heartbeat after config update: {}", e);
            }
        }
    }
}

/// Forward hub actions surfaced by the engine into the runtime's filtered
/// handler.
async fn run_action_filter(runtime: SpokeRuntime) {
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = runtime.inner.events.subscribe();
    loop {
        match rx.recv().await {
            Ok(SpokeEvent::HubAction { action }) => runtime.handle_hub_action(action).await,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("action filter lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn apply_status(core: &mut RuntimeCore, target: SpokeStatus) {
    core.state.status = target;
    match target {
        SpokeStatus::Offline => core.state.offline_since = Some(Utc::now()),
        SpokeStatus::Approved => {
            core.state.offline_since = None;
            core.approved_since = Some(Utc::now());
        }
        _ => {}
    }
    if let Some(config) = core.config.as_mut() {
        config.status = target;
        if target == SpokeStatus::Approved && config.approved_at.is_none() {
            config.approved_at = Some(Utc::now());
        }
        config.touch();
    }
}

/// Save the mirrored record; a failed save never rolls a transition back.
async fn persist_locked(core: &mut RuntimeCore) {
    if let (Some(path), Some(config)) = (core.config_path.clone(), core.config.clone()) {
        if let Err(e) = save_config(&path, &config).await {
            warn!("failed to persist configuration after transition: {}", e);
        }
    }
}

/// Token validity at a given instant: present and strictly before expiry.
pub fn token_valid_at(config: &SpokeConfig, at: DateTime<Utc>) -> bool {
    match (&config.spoke_token, config.token_expires_at) {
        (Some(token), Some(expires_at)) => !token.is_empty() && at < expires_at,
        _ => false,
    }
}

/// Offline policy supervisor.
///
/// While Approved: mirrors the engine's failure accounting into
/// RuntimeState and, once failures persist past the grace period, forces
/// the guarded Approved -> Offline transition. While Offline: probes the
/// hub with manual heartbeats at the normal cadence and recovers through
/// Offline -> Approved on the first success.
async fn run_watchdog(runtime: SpokeRuntime) {
    loop {
        let Some((status, grace_ms, interval_ms, approved_since)) = ({
            let core = runtime.inner.core.read().await;
            core.config.as_ref().map(|config| {
                (
                    core.state.status,
                    config.offline_grace_period_ms,
                    config.heartbeat_interval_ms,
                    core.approved_since,
                )
            })
        }) else {
            return;
        };
        let check_ms = (grace_ms / 4).clamp(50, 5_000);

        match status {
            SpokeStatus::Approved => {
                let failures = runtime.inner.engine.get_consecutive_failures();
                let last_ok = runtime.inner.engine.get_last_successful_heartbeat();
                {
                    let mut core = runtime.inner.core.write().await;
                    core.state.consecutive_heartbeat_failures = failures;
                    core.state.last_heartbeat = last_ok;
                    core.state.hub_connected = failures == 0 && last_ok.is_some();
                }

                if failures > 0 {
                    let since = last_ok.or(approved_since).unwrap_or_else(Utc::now);
                    let silent_ms = Utc::now().signed_duration_since(since).num_milliseconds();
                    if silent_ms >= grace_ms as i64 {
                        warn!(
                            "offline grace period exceeded ({} failures, silent for {}ms)",
                            failures, silent_ms
                        );
                        if let Err(e) = runtime.transition_state(SpokeStatus::Offline).await {
                            warn!("offline transition rejected: {}", e);
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(check_ms)).await;
            }
            SpokeStatus::Offline => {
                match runtime.inner.engine.send_heartbeat().await {
                    Ok(_) => {
                        info!("hub reachable again, recovering from offline");
                        if let Err(e) = runtime.transition_state(SpokeStatus::Approved).await {
                            warn!("offline recovery rejected: {}", e);
                        }
                    }
                    Err(e) => debug!("hub still unreachable: {}", e),
                }
                tokio::time::sleep(Duration::from_millis(interval_ms.max(check_ms))).await;
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(check_ms)).await;
            }
        }
    }
}
