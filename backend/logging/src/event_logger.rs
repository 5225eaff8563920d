//! Lifecycle Event Logger
//!
//! Every host-visible mutation and state transition is emitted as one
//! structured event on the `lifecycle_events` target, which the JSON file
//! layer persists next to the regular log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateEntered { state: String },
    InterfaceDisconnected { interface: String },
    InterfaceReconnected { interface: String },
    DeviceAllowed { identity: String, guard_id: String },
    DeviceBlocked { identity: String },
    DeviceAttached { sandbox: String, device_uuid: String },
    CleanupCompleted { reblocked: usize, failed: usize },
    RestoreCompleted { interfaces: usize, devices: usize, complete: bool },
}

#[derive(Debug, Serialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
}

pub struct EventLogger;

impl EventLogger {
    pub fn log_event(event: LifecycleEvent) {
        let entry = EventLogEntry { timestamp: Utc::now(), event };
        let rendered = serde_json::to_string(&entry).unwrap_or_else(|_| format!("{entry:?}"));
        info!(target: "lifecycle_events", event = %rendered, "Lifecycle event");
    }
}
