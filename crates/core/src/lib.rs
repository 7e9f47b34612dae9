//! Shared data model for the PTZ camera capture crates.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;

mod error;
mod status;

pub use error::{DeviceError, Error, Result};
pub use status::{Status, StatusSink};

/// Timestamp layout used in every output file name.
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// One JPEG-encoded frame pulled from a live stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub timestamp: SystemTime,
    pub sequence: usize,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    /// Parses the `WIDTHxHEIGHT` labels shown to users, e.g. `1920x1080`.
    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| Error::Config(format!("invalid resolution '{}'", s)))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid resolution width '{}'", w)))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid resolution height '{}'", h)))?;
        if width == 0 || height == 0 {
            return Err(Error::Config(format!("resolution '{}' has a zero dimension", s.trim())));
        }
        Ok(Self { width, height })
    }
}

/// Which of the device's streams a capture is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    Main,
    #[default]
    Sub,
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(StreamType::Main),
            "sub" => Ok(StreamType::Sub),
            other => Err(Error::Config(format!("unknown stream type '{}'", other))),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Main => f.write_str("main"),
            StreamType::Sub => f.write_str("sub"),
        }
    }
}

/// Username plus a password slot that can be filled exactly once.
///
/// Clones share the password slot, so unlocking one target unlocks every
/// target built from the same credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    password: Arc<OnceLock<String>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        let credentials = Self::new(username);
        credentials.set_password(password);
        credentials
    }

    /// Stores the password. Returns `false` if one was already set.
    pub fn set_password(&self, password: impl Into<String>) -> bool {
        self.password.set(password.into()).is_ok()
    }

    /// Empty until a password has been set.
    pub fn password(&self) -> &str {
        self.password.get().map(String::as_str).unwrap_or("")
    }

    pub fn is_unlocked(&self) -> bool {
        self.password.get().is_some()
    }
}

/// Addresses and credentials of one camera.
#[derive(Debug, Clone)]
pub struct CameraTarget {
    /// Host used for the live RTSP stream.
    pub stream_host: String,
    pub rtsp_port: u16,
    /// Host used for the device control protocol.
    pub control_host: String,
    pub control_port: u16,
    pub credentials: Credentials,
    pub stream_type: StreamType,
}

impl CameraTarget {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        let host = host.into();
        Self {
            stream_host: host.clone(),
            rtsp_port: 554,
            control_host: host,
            control_port: 80,
            credentials,
            stream_type: StreamType::default(),
        }
    }

    pub fn with_control(mut self, host: impl Into<String>, port: u16) -> Self {
        self.control_host = host.into();
        self.control_port = port;
        self
    }

    pub fn with_rtsp_port(mut self, port: u16) -> Self {
        self.rtsp_port = port;
        self
    }

    pub fn with_stream_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }
}

/// Local wall-clock time formatted for output file names.
pub fn capture_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Keeps alphanumerics, `-`, `_` and spaces, trims, then turns spaces into
/// underscores. May return an empty string.
pub fn sanitize_name(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, '-' | '_' | ' '))
        .collect();
    kept.trim().replace(' ', "_")
}

/// Why a bounded join returned no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// The deadline passed; the thread is left to finish on its own.
    TimedOut,
    Panicked,
}

/// Waits for a thread until `deadline`, polling its completion.
pub fn join_until<T>(handle: JoinHandle<T>, deadline: Instant) -> std::result::Result<T, JoinFailure> {
    const POLL: Duration = Duration::from_millis(5);

    loop {
        if handle.is_finished() {
            return handle.join().map_err(|_| JoinFailure::Panicked);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(JoinFailure::TimedOut);
        }
        std::thread::sleep(POLL.min(deadline - now));
    }
}

pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> std::result::Result<T, JoinFailure> {
    join_until(handle, Instant::now() + timeout)
}
