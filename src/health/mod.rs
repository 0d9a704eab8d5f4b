//! Health probes for the external collaborators
//!
//! The spoke consults five services through a narrow boolean-health
//! interface: the OPA decision engine, the OPAL policy-distribution
//! client, the Keycloak identity provider, the MongoDB document store and
//! the KAS key-access service. Probe results are cached and shipped with
//! every heartbeat payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Service names as they appear in the heartbeat payload.
pub const SERVICE_NAMES: &[&str] = &["opa", "opalClient", "keycloak", "mongodb", "kas"];

/// Last-probed health of one collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
}

/// Service name -> last probe result, in stable order.
pub type ServiceHealthMap = BTreeMap<String, ServiceHealth>;

/// Zero-argument health check exposed by each collaborator.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Payload key for this service (one of [`SERVICE_NAMES`]).
    fn name(&self) -> &str;

    /// Probe the service; `false` on any failure, never an error.
    async fn probe(&self) -> bool;
}

/// HTTP GET probe against a collaborator's health endpoint.
pub struct HttpHealthProbe {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { name: name.into(), url: url.into(), client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("health probe '{}' failed: {}", self.name, e);
                false
            }
        }
    }
}

/// Cached per-service health snapshots shared between the Runtime and the
/// Heartbeat Engine.
pub struct HealthCache {
    probes: Vec<Arc<dyn HealthProbe>>,
    snapshot: RwLock<ServiceHealthMap>,
}

impl HealthCache {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        // Every service starts unhealthy until first probed.
        let now = Utc::now();
        let mut snapshot = ServiceHealthMap::new();
        for probe in &probes {
            snapshot.insert(
                probe.name().to_string(),
                ServiceHealth { healthy: false, last_check: now },
            );
        }
        Self { probes, snapshot: RwLock::new(snapshot) }
    }

    /// Last-probed health for every tracked service.
    pub fn snapshot(&self) -> ServiceHealthMap {
        self.snapshot.read().clone()
    }

    /// Re-probe every service and return the refreshed snapshot.
    pub async fn refresh_all(&self) -> ServiceHealthMap {
        for probe in &self.probes {
            let healthy = probe.probe().await;
            if !healthy {
                warn!("service '{}' is unhealthy", probe.name());
            }
            self.snapshot.write().insert(
                probe.name().to_string(),
                ServiceHealth { healthy, last_check: Utc::now() },
            );
        }
        self.snapshot()
    }

    /// True only if every tracked service is healthy.
    pub fn all_healthy(&self) -> bool {
        let snapshot = self.snapshot.read();
        !snapshot.is_empty() && snapshot.values().all(|s| s.healthy)
    }
}
