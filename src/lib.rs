//! DIVE spoke control-plane agent
//!
//! A spoke is a subordinate deployment of the DIVE coalition identity
//! platform: it enforces access-control decisions locally while a central
//! hub supervises it. This crate provides:
//! - The spoke lifecycle state machine and configuration/token manager
//! - The heartbeat protocol engine (liveness, health and metrics
//!   reporting, hub-issued action handling, offline detection)
//! - Health probes for the external collaborator services

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod heartbeat;
pub mod runtime;

pub use config::{EnvOverrides, SpokeConfig};
pub use error::SpokeError;
pub use events::{EventBus, SpokeEvent};
pub use health::{HealthProbe, HttpHealthProbe, ServiceHealth, ServiceHealthMap};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatEngine, HeartbeatPayload, HeartbeatResponse, HubAction,
    HubActionType, SyncStatus,
};
pub use runtime::{HealthStatus, RuntimeState, SpokeRuntime, SpokeStatus};
