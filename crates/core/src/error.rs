use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A failed device-control call, with the reason reported by the device or
/// transport.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct DeviceError {
    pub reason: String,
}

impl DeviceError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("ONVIF error: {0}")]
    Device(#[from] DeviceError),

    #[error("Step {step} failed: {reason}")]
    SequenceStep { step: String, reason: String },

    #[error("Camera {camera} capture failed: {reason}")]
    Capture { camera: usize, reason: String },

    #[error("{0}")]
    Config(String),

    #[error("Delay too short (need >= {required_sec:.1}s, got {period_sec}s)")]
    Timing { period_sec: u64, required_sec: f64 },

    #[error("Auto capture already running")]
    AlreadyRunning,

    #[error("Image error: {0}")]
    Image(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The bare failure reason, without the category prefix of `Display`.
    pub fn reason(&self) -> String {
        match self {
            Error::Device(e) => e.reason.clone(),
            Error::SequenceStep { reason, .. } | Error::Capture { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}
