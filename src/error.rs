//! Error taxonomy for the spoke agent
//!
//! Fatal configuration errors and guard failures are typed so callers can
//! match on them; heartbeat transport failures inside the periodic loop are
//! recovered locally and never surface through these variants.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the Spoke Runtime and Heartbeat Engine.
#[derive(Debug, Error)]
pub enum SpokeError {
    /// The configuration record does not exist at the resolved path.
    #[error("spoke configuration not found at {path}")]
    ConfigNotFound { path: PathBuf },

    /// The configuration record is missing a required field.
    #[error("invalid spoke configuration: missing required field '{field}'")]
    ConfigValidation { field: &'static str },

    /// The configuration record exists but is not valid JSON.
    #[error("failed to parse spoke configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Operation requires a prior successful initialize().
    #[error("spoke not initialized: cannot {operation}")]
    NotInitialized { operation: &'static str },

    /// The lifecycle transition table has no edge for this pair.
    #[error("invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// saveConfiguration() called before any configuration was loaded.
    #[error("no configuration loaded")]
    NoConfig,

    /// Heartbeat transport failure, surfaced only by manual send calls.
    #[error("hub request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpokeError>;
