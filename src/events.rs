//! In-process notification bus for spoke components
//!
//! The Runtime and the Heartbeat Engine publish tagged events to any
//! number of subscribers over a bounded broadcast channel. The bus is
//! scoped to the component instance that owns it; there is no global
//! dispatch.

use crate::heartbeat::HubAction;
use tokio::sync::broadcast;

/// Capacity of each component's event channel. Slow subscribers that fall
/// further behind than this lose the oldest events (broadcast lag), which
/// is acceptable for advisory notifications.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications published by the Spoke Runtime and Heartbeat Engine.
#[derive(Debug, Clone)]
pub enum SpokeEvent {
    /// A guarded lifecycle transition completed.
    StateChange { from: String, to: String },
    /// The heartbeat engine started its timer loop.
    Started,
    /// The heartbeat engine stopped.
    Stopped,
    /// A heartbeat attempt is about to be sent.
    Sending,
    /// Token renewal was requested from the external issuer.
    TokenRefreshing,
    /// The local policy version changed.
    PolicySync { version: String },
    /// The hub reported our policy as behind its current version.
    PolicySyncNeeded { hub_version: Option<String> },
    /// OPAL connectivity flipped.
    OpalConnectionChange { connected: bool },
    /// The hub issued an action for local, filtered execution.
    HubAction { action: HubAction },
    /// The runtime is shutting down.
    Shutdown,
}

/// Per-component publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SpokeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SpokeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SpokeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
