//! Live frame ingestion for network cameras.
//!
//! Each camera gets one worker thread that pulls JPEG frames from the
//! camera's RTSP sub stream and publishes them into a two-slot, drop-oldest
//! [`FrameBuffer`]. [`LiveView`] owns the workers and buffers of a camera
//! set and handles restarts when the stream selection changes.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptzcam_capture::{FfmpegOpener, LiveView};
//! use ptzcam_core::{CameraTarget, Credentials, StatusSink};
//!
//! let creds = Credentials::with_password("admin", "secret");
//! let targets = vec![CameraTarget::new("192.168.1.64", creds)];
//! let mut view = LiveView::new(targets, Arc::new(FfmpegOpener::default()), StatusSink::disabled());
//! view.start();
//! view.poll();
//! if let Some(frame) = view.latest_frame(0) {
//!     println!("{}x{} frame #{}", frame.width, frame.height, frame.sequence);
//! }
//! view.stop();
//! ```

mod buffer;
mod live;
mod source;
mod worker;

pub use buffer::{FrameBuffer, Publisher, FRAME_BUFFER_CAPACITY};
pub use live::LiveView;
pub use source::{FfmpegOpener, FrameSource, SourceOpener, StreamError};
pub use worker::{start as start_ingestion, IngestionHandle, READ_BACKOFF, STOP_JOIN_TIMEOUT};

use ptzcam_core::CameraTarget;

/// Channel path of the low-resolution stream. Live display always uses it,
/// whatever stream the user selected, to keep decoding cheap.
pub const SUB_STREAM_PATH: &str = "/Streaming/Channels/102";

/// RTSP address of a camera's live sub stream, credentials included.
pub fn live_stream_url(target: &CameraTarget) -> String {
    format!(
        "rtsp://{}:{}@{}:{}{}",
        urlencoding::encode(&target.credentials.username),
        urlencoding::encode(target.credentials.password()),
        target.stream_host,
        target.rtsp_port,
        SUB_STREAM_PATH
    )
}
