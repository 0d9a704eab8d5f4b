//! DIVE spoke agent binary
//!
//! Wires the spoke runtime to its collaborators and runs until
//! interrupted:
//! - Resolves configuration (explicit path argument or DIVE_* selectors)
//! - Builds HTTP health probes for OPA, OPAL client, Keycloak, MongoDB
//!   and KAS
//! - Starts supervision (heartbeat loop + offline watchdog) and shuts
//!   down cleanly on ctrl-c

use anyhow::{Context, Result};
use dive_spoke_agent::config::{self, EnvOverrides, SpokeConfig};
use dive_spoke_agent::health::{HealthProbe, HttpHealthProbe};
use dive_spoke_agent::runtime::SpokeRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health probes for the five collaborator services, with local-deployment
/// defaults overridable through the record's URL fields.
fn collaborator_probes(config: &SpokeConfig) -> Vec<Arc<dyn HealthProbe>> {
    let keycloak_url = config
        .idp_url
        .as_deref()
        .map(|u| format!("{}/health/ready", u.trim_end_matches('/')))
        .unwrap_or_else(|| "http://localhost:8080/health/ready".to_string());

    vec![
        Arc::new(HttpHealthProbe::new(
            "opa",
            "http://localhost:8181/health",
            PROBE_TIMEOUT,
        )),
        Arc::new(HttpHealthProbe::new(
            "opalClient",
            "http://localhost:7000/healthcheck",
            PROBE_TIMEOUT,
        )),
        Arc::new(HttpHealthProbe::new("keycloak", keycloak_url, PROBE_TIMEOUT)),
        Arc::new(HttpHealthProbe::new(
            "mongodb",
            "http://localhost:27017",
            PROBE_TIMEOUT,
        )),
        Arc::new(HttpHealthProbe::new(
            "kas",
            "http://localhost:8000/healthz",
            PROBE_TIMEOUT,
        )),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    info!("DIVE spoke agent starting...");

    let env = EnvOverrides::from_env();
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = config::resolve_config_path(explicit_path.as_deref(), &env)
        .context("Failed to resolve configuration path")?;

    // Pre-load the record once to derive collaborator endpoints.
    let boot_config = config::load_config(&config_path, &env)
        .await
        .context("Failed to load spoke configuration")?;

    let runtime = SpokeRuntime::new(env, collaborator_probes(&boot_config));
    runtime
        .initialize(Some(&config_path))
        .await
        .context("Failed to initialize spoke runtime")?;

    // Prime the health cache so the first heartbeat carries real probes.
    runtime.engine().force_health_refresh().await;

    runtime
        .start()
        .await
        .context("Failed to start spoke supervision")?;

    info!(
        "spoke '{}' running (instance: {})",
        boot_config.spoke_id, boot_config.instance_code
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    runtime
        .shutdown()
        .await
        .context("Spoke shutdown failed")?;

    Ok(())
}
