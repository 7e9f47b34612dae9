use std::fmt;

use tokio::sync::mpsc;

/// Short human-readable state reported to whoever drives the capture engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Locked,
    Unlocked,
    InvalidPassword,
    Switching,
    Live,
    Saved(String),
    SnapshotsSaved,
    Applied(String),
    MovedHome,
    HomeFailed(String),
    DeviceError(String),
    StepError(String),
    SelectFolder,
    SelectCameras,
    DelayTooShort(f64),
    AutoStarted,
    Stopping,
    AutoStopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Locked => f.write_str("Locked"),
            Status::Unlocked => f.write_str("Unlocked, starting…"),
            Status::InvalidPassword => f.write_str("Invalid password"),
            Status::Switching => f.write_str("Switching…"),
            Status::Live => f.write_str("Live"),
            Status::Saved(name) => write!(f, "Saved {}", name),
            Status::SnapshotsSaved => f.write_str("Snapshots saved"),
            Status::Applied(host) => write!(f, "Applied {}", host),
            Status::MovedHome => f.write_str("Moved to Home"),
            Status::HomeFailed(msg) => write!(f, "ONVIF home failed: {}", msg),
            Status::DeviceError(msg) => write!(f, "ONVIF error: {}", msg),
            Status::StepError(msg) => write!(f, "ONVIF step error: {}", msg),
            Status::SelectFolder => f.write_str("Select an existing folder"),
            Status::SelectCameras => f.write_str("Select cameras"),
            Status::DelayTooShort(need) => write!(f, "Delay too short (need >= {:.1}s)", need),
            Status::AutoStarted => f.write_str("Auto capture running"),
            Status::Stopping => f.write_str("Stopping…"),
            Status::AutoStopped => f.write_str("Auto capture stopped"),
        }
    }
}

/// Fan-in point for status updates coming from worker threads.
///
/// Reporting never blocks: when the receiver lags the update is dropped and
/// only logged.
#[derive(Debug, Clone, Default)]
pub struct StatusSink {
    tx: Option<mpsc::Sender<Status>>,
}

impl StatusSink {
    pub fn new(tx: mpsc::Sender<Status>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a sink together with the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Status>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Log-only sink.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, status: Status) {
        tracing::info!(status = %status, "status");
        if let Some(tx) = &self.tx {
            if tx.try_send(status).is_err() {
                tracing::debug!("status receiver full or closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_messages() {
        assert_eq!(Status::Saved("a.jpg".into()).to_string(), "Saved a.jpg");
        assert_eq!(
            Status::DeviceError("timeout".into()).to_string(),
            "ONVIF error: timeout"
        );
        assert_eq!(
            Status::DelayTooShort(3.26).to_string(),
            "Delay too short (need >= 3.3s)"
        );
    }

    #[test]
    fn test_sink_delivers_without_blocking() {
        let (sink, mut rx) = StatusSink::channel(1);
        sink.report(Status::Live);
        // Second report is dropped instead of blocking.
        sink.report(Status::Switching);
        assert_eq!(rx.try_recv().ok(), Some(Status::Live));
        assert!(rx.try_recv().is_err());
    }
}
