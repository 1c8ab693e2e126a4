use std::time::Duration;

use thiserror::Error;

use crate::worker::BridgeError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Update check failed: {0}")]
    UpdateCheckFailed(String),

    #[error("New version did not take control within {}s", .0.as_secs())]
    ActivationFailed(Duration),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
