use tsbridge_srt::SrtError;

use crate::bus::{BusError, SubscriberId};

/// Failure to start or keep running a session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("SRT endpoint: {0}")]
    Srt(#[from] SrtError),

    #[error("media bus: {0}")]
    Bus(#[from] BusError),

    #[error("connection monitor failed: {0}")]
    MonitorFailed(String),

    #[error("subscriber {subscriber} on '{stream}' failed: {reason}")]
    SubscriberFailed {
        subscriber: SubscriberId,
        stream: String,
        reason: String,
    },
}
