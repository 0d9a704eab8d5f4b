//! Spoke configuration management
//!
//! Handles:
//! - Loading the persisted per-spoke JSON record
//! - Required-field validation and defaults
//! - Environment overrides (resolved once at startup, never ad hoc)
//! - Durable save with restrictive file permissions

use crate::error::{Result, SpokeError};
use crate::runtime::SpokeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_TOKEN_REFRESH_BUFFER_MS: u64 = 300_000;
pub const DEFAULT_OFFLINE_GRACE_PERIOD_MS: u64 = 120_000;

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_token_refresh_buffer_ms() -> u64 {
    DEFAULT_TOKEN_REFRESH_BUFFER_MS
}

fn default_offline_grace_period_ms() -> u64 {
    DEFAULT_OFFLINE_GRACE_PERIOD_MS
}

/// Persisted record describing one spoke instance.
///
/// Owned exclusively by the Spoke Runtime; mutated only through its
/// transition/token APIs and rewritten on save/shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeConfig {
    #[serde(default)]
    pub spoke_id: String,
    /// Short country/org code, normalized upper-case on load.
    #[serde(default)]
    pub instance_code: String,
    #[serde(default)]
    pub hub_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_opal_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idp_url: Option<String>,
    /// mTLS client certificate material, both set or neither.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub requested_scopes: BTreeSet<String>,
    #[serde(default)]
    pub status: SpokeStatus,
    /// Bearer credential, present only once the hub has approved us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spoke_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_token_refresh_buffer_ms")]
    pub token_refresh_buffer_ms: u64,
    #[serde(default = "default_offline_grace_period_ms")]
    pub offline_grace_period_ms: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

impl SpokeConfig {
    /// Update the modification timestamp; called before every save.
    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

/// Environment overrides, captured once at startup.
///
/// The allow-list is fixed: hub URLs, the two timing knobs, and the
/// selectors used to auto-locate the configuration record.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub hub_url: Option<String>,
    pub hub_opal_url: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub offline_grace_period_ms: Option<u64>,
    /// Instance-code selector used to derive the config path.
    pub instance_code: Option<String>,
    /// Root directory holding per-instance configuration directories.
    pub config_root: Option<PathBuf>,
}

impl EnvOverrides {
    /// Capture the recognized DIVE_* variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            hub_url: std::env::var("DIVE_HUB_URL").ok(),
            hub_opal_url: std::env::var("DIVE_HUB_OPAL_URL").ok(),
            heartbeat_interval_ms: parse_ms_var("DIVE_HEARTBEAT_INTERVAL_MS"),
            offline_grace_period_ms: parse_ms_var("DIVE_OFFLINE_GRACE_PERIOD_MS"),
            instance_code: std::env::var("DIVE_INSTANCE").ok(),
            config_root: std::env::var("DIVE_CONFIG_ROOT").ok().map(PathBuf::from),
        }
    }

    /// Overlay the captured overrides onto a loaded record.
    pub fn apply(&self, config: &mut SpokeConfig) {
        if let Some(url) = &self.hub_url {
            config.hub_url = url.clone();
        }
        if let Some(url) = &self.hub_opal_url {
            config.hub_opal_url = Some(url.clone());
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = interval;
        }
        if let Some(grace) = self.offline_grace_period_ms {
            config.offline_grace_period_ms = grace;
        }
    }
}

fn parse_ms_var(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Resolve the configuration source: an explicit path wins, otherwise the
/// path is derived from the instance-code selector under the config root.
pub fn resolve_config_path(explicit: Option<&Path>, env: &EnvOverrides) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let code = env
        .instance_code
        .as_deref()
        .ok_or(SpokeError::ConfigValidation { field: "instanceCode" })?;

    let root = env
        .config_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("/etc/dive"));

    Ok(root
        .join("instances")
        .join(code.to_lowercase())
        .join("spoke.json"))
}

/// Read, parse, validate and normalize the record at `path`.
pub async fn load_config(path: &Path, env: &EnvOverrides) -> Result<SpokeConfig> {
    if !path.exists() {
        return Err(SpokeError::ConfigNotFound { path: path.to_path_buf() });
    }

    let content = tokio::fs::read_to_string(path).await?;
    let mut config: SpokeConfig = serde_json::from_str(&content)?;

    validate(&config)?;
    env.apply(&mut config);
    config.instance_code = config.instance_code.to_uppercase();

    debug!(
        spoke_id = %config.spoke_id,
        instance = %config.instance_code,
        "loaded spoke configuration from {}",
        path.display()
    );
    Ok(config)
}

fn validate(config: &SpokeConfig) -> Result<()> {
    if config.spoke_id.is_empty() {
        return Err(SpokeError::ConfigValidation { field: "spokeId" });
    }
    if config.instance_code.is_empty() {
        return Err(SpokeError::ConfigValidation { field: "instanceCode" });
    }
    if config.hub_url.is_empty() {
        return Err(SpokeError::ConfigValidation { field: "hubUrl" });
    }
    Ok(())
}

/// Persist the record. The file carries a bearer credential, so it is
/// written with owner-only permissions.
pub async fn save_config(path: &Path, config: &SpokeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    debug!("saved spoke configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal_record() -> serde_json::Value {
        serde_json::json!({
            "spokeId": "spoke-nzl-01",
            "instanceCode": "nzl",
            "hubUrl": "https://hub.dive.example",
        })
    }

    async fn write_record(dir: &TempDir, value: &serde_json::Value) -> PathBuf {
        let path = dir.path().join("spoke.json");
        tokio::fs::write(&path, serde_json::to_string_pretty(value).unwrap())
            .await
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_fills_defaults_and_normalizes_instance_code() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, &minimal_record()).await;

        let config = load_config(&path, &EnvOverrides::default()).await.unwrap();

        assert_eq!(config.instance_code, "NZL");
        assert_eq!(config.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert_eq!(config.token_refresh_buffer_ms, DEFAULT_TOKEN_REFRESH_BUFFER_MS);
        assert_eq!(config.offline_grace_period_ms, DEFAULT_OFFLINE_GRACE_PERIOD_MS);
        assert_eq!(config.status, SpokeStatus::Uninitialized);
        assert!(config.spoke_token.is_none());
    }

    #[tokio::test]
    async fn test_missing_hub_url_names_the_field() {
        let dir = TempDir::new().unwrap();
        let mut record = minimal_record();
        record.as_object_mut().unwrap().remove("hubUrl");
        let path = write_record(&dir, &record).await;

        let err = load_config(&path, &EnvOverrides::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("hubUrl"), "got: {err}");
    }

    #[tokio::test]
    async fn test_missing_file_is_config_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");

        let err = load_config(&path, &EnvOverrides::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SpokeError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_malformed_record_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spoke.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = load_config(&path, &EnvOverrides::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SpokeError::ConfigParse(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_interval_override_wins_over_record() {
        let dir = TempDir::new().unwrap();
        let mut record = minimal_record();
        record["heartbeatIntervalMs"] = serde_json::json!(5_000);
        let path = write_record(&dir, &record).await;

        let env = EnvOverrides {
            heartbeat_interval_ms: Some(60_000),
            ..Default::default()
        };
        let config = load_config(&path, &env).await.unwrap();

        assert_eq!(config.heartbeat_interval_ms, 60_000);
    }

    #[tokio::test]
    async fn test_env_capture_reads_interval_variable() {
        std::env::set_var("DIVE_HEARTBEAT_INTERVAL_MS", "60000");
        let env = EnvOverrides::from_env();
        std::env::remove_var("DIVE_HEARTBEAT_INTERVAL_MS");

        assert_eq!(env.heartbeat_interval_ms, Some(60_000));
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips_identity_fields() {
        let dir = TempDir::new().unwrap();
        let path = write_record(&dir, &minimal_record()).await;

        let mut config = load_config(&path, &EnvOverrides::default()).await.unwrap();
        config.status = SpokeStatus::Approved;
        save_config(&path, &config).await.unwrap();

        let reloaded = load_config(&path, &EnvOverrides::default()).await.unwrap();
        assert_eq!(reloaded.spoke_id, config.spoke_id);
        assert_eq!(reloaded.instance_code, config.instance_code);
        assert_eq!(reloaded.status, SpokeStatus::Approved);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spoke.json");
        let config: SpokeConfig = serde_json::from_value(minimal_record()).unwrap();

        save_config(&path, &config).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_explicit_path_wins_over_selectors() {
        let env = EnvOverrides {
            instance_code: Some("fra".into()),
            config_root: Some(PathBuf::from("/tmp/dive")),
            ..Default::default()
        };

        let path = resolve_config_path(Some(Path::new("/opt/spoke.json")), &env).unwrap();
        assert_eq!(path, PathBuf::from("/opt/spoke.json"));
    }

    #[test]
    fn test_derived_path_uses_lowercased_instance_code() {
        let env = EnvOverrides {
            instance_code: Some("NZL".into()),
            config_root: Some(PathBuf::from("/var/lib/dive")),
            ..Default::default()
        };

        let path = resolve_config_path(None, &env).unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/dive/instances/nzl/spoke.json"));
    }

    #[test]
    fn test_derived_path_requires_instance_code() {
        let err = resolve_config_path(None, &EnvOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("instanceCode"));
    }
}
