//! Bridge to the background update-delivery worker.
//!
//! In a browser this is the service worker registration; native shells
//! provide their own implementation (see `ReleaseFeedBridge`). The
//! `UpdateMonitor` only talks to the worker through this trait.

pub mod release;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use release::ReleaseFeedBridge;

/// Identifies one worker instance within a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting to activate
    Installed,
    Activating,
    Activated,
    /// Replaced or unregistered
    Redundant,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Activated => write!(f, "activated"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// Point-in-time view of the worker registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub installing: Option<WorkerId>,
    pub waiting: Option<WorkerId>,
    pub active: Option<WorkerId>,
    /// Whether the page is currently controlled by a worker
    pub has_controller: bool,
}

impl RegistrationSnapshot {
    /// A new version is installed and waiting behind a live controller
    pub fn has_pending_update(&self) -> bool {
        self.has_controller && self.waiting.is_some()
    }
}

/// Messages posted to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    Normal,
    /// Reload without any HTTP or worker cache
    BypassCache,
}

/// Registration events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    UpdateFound { worker: WorkerId },
    StateChange { worker: WorkerId, state: WorkerState },
    /// A different worker took control of the page
    ControllerChange,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Update workers are not supported here: {0}")]
    Unsupported(String),

    #[error("No worker is waiting to activate")]
    NoWaitingWorker,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Message delivery failed: {0}")]
    Message(String),
}

#[async_trait]
pub trait ServiceWorkerBridge: Send + Sync {
    /// Current registration, or `None` when nothing is registered
    async fn registration(&self) -> Result<Option<RegistrationSnapshot>, BridgeError>;

    /// Ask the registration to check the network for a new worker version
    async fn update(&self) -> Result<(), BridgeError>;

    async fn post_message(&self, worker: WorkerId, message: WorkerMessage) -> Result<(), BridgeError>;

    /// Drop app-shell caches held by the worker. Trip bundles are not affected.
    async fn clear_app_caches(&self) -> Result<(), BridgeError>;

    async fn reload(&self, mode: ReloadMode) -> Result<(), BridgeError>;

    fn subscribe(&self) -> broadcast::Receiver<WorkerEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_waiting_wire_format() {
        let json = serde_json::to_string(&WorkerMessage::SkipWaiting).unwrap();
        assert_eq!(json, r#"{"type":"SKIP_WAITING"}"#);
    }

    #[test]
    fn test_pending_update_requires_controller() {
        let first_install = RegistrationSnapshot {
            waiting: Some(WorkerId(1)),
            ..Default::default()
        };
        assert!(!first_install.has_pending_update());

        let upgrade = RegistrationSnapshot {
            waiting: Some(WorkerId(2)),
            active: Some(WorkerId(1)),
            has_controller: true,
            ..Default::default()
        };
        assert!(upgrade.has_pending_update());
    }
}
