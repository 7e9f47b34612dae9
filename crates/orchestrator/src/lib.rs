//! Capture orchestration: PTZ sequences, synchronized multi-camera
//! snapshots and drift-corrected auto-capture.
//!
//! Everything here reaches cameras only through
//! [`ptzcam_device::DeviceClient`], so the whole crate runs against the
//! in-memory fake in tests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptzcam_core::{CameraTarget, Credentials, StatusSink, StreamType};
//! use ptzcam_device::OnvifClient;
//! use ptzcam_orchestrator::{AutoCapture, AutoCaptureSession, CaptureJob, SnapshotJob, SnapshotOrchestrator};
//!
//! let client = Arc::new(OnvifClient::new()?);
//! let creds = Credentials::with_password("admin", "secret");
//! let cameras = vec![
//!     CameraTarget::new("192.168.1.64", creds.clone()),
//!     CameraTarget::new("192.168.1.65", creds),
//! ];
//! let job = CaptureJob::new(cameras, "DATA").with_stream_type(StreamType::Main);
//! let orchestrator = SnapshotOrchestrator::new(client, StatusSink::disabled());
//!
//! let mut auto = AutoCapture::new(StatusSink::disabled());
//! auto.start(AutoCaptureSession::new(10, Box::new(SnapshotJob::new(orchestrator, job))).with_max_count(Some(6)))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod barrier;
mod control;
mod dispatch;
mod ptz;
mod scheduler;
mod sequence;
mod snapshot;

pub use barrier::{BarrierWait, TimedBarrier};
pub use control::{apply_encoder, encoder_choices, goto_home, EncoderChoices};
pub use dispatch::{CaptureDispatcher, ManualOutcome};
pub use ptz::{PtzSequenceController, SequenceReport, SequenceState, IDLE_POLL_INTERVAL, IDLE_TIMEOUT};
pub use scheduler::{AutoCapture, AutoCaptureSession, RepeatJob, SequenceJob, SnapshotJob, SHUTDOWN_TIMEOUT, SLEEP_SLICE};
pub use sequence::{load_sequence, MoveKind, PtzSpec, PtzStep, SequenceDefinition, DEFAULT_CONTINUOUS_HOLD};
pub use snapshot::{
    capture_device_snapshot, BatchReport, CaptureJob, SnapshotOrchestrator, BARRIER_TIMEOUT,
    BATCH_JOIN_TIMEOUT,
};
