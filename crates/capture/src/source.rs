//! Live stream sources.
//!
//! A [`FrameSource`] owns one open stream-capture resource and releases it
//! when dropped. The production source decodes RTSP through an `ffmpeg`
//! child process that re-encodes to MJPEG on its stdout.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use ptzcam_core::Frame;
use thiserror::Error;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const READ_CHUNK: usize = 64 * 1024;
// A frame larger than this means we lost sync with the byte stream.
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open stream: {0}")]
    Open(String),

    #[error("no frame available: {0}")]
    NoFrame(String),

    #[error("stream closed: {0}")]
    Closed(String),
}

impl From<StreamError> for ptzcam_core::Error {
    fn from(e: StreamError) -> Self {
        ptzcam_core::Error::StreamUnavailable(e.to_string())
    }
}

/// One open live stream.
pub trait FrameSource: Send {
    /// Blocks until the next frame is read.
    ///
    /// [`StreamError::Closed`] means the resource is dead and must be
    /// reopened; any other error is transient.
    fn read_frame(&mut self) -> Result<Frame, StreamError>;
}

/// Opens [`FrameSource`]s for stream URLs.
pub trait SourceOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, StreamError>;
}

/// Opens RTSP streams through the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    pub ffmpeg: PathBuf,
    /// Socket I/O timeout passed to ffmpeg, so a stalled camera ends the
    /// process instead of blocking the reader forever.
    pub io_timeout: Duration,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            io_timeout: Duration::from_secs(5),
        }
    }
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        let mut child = Command::new(&self.ffmpeg)
            .args(["-loglevel", "error", "-rtsp_transport", "tcp"])
            .arg("-timeout")
            .arg(self.io_timeout.as_micros().to_string())
            .arg("-i")
            .arg(url)
            .args(["-an", "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StreamError::Open(format!("failed to spawn ffmpeg: {}", e)))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StreamError::Open("ffmpeg stdout not captured".to_string()));
            }
        };

        Ok(Box::new(FfmpegSource {
            child,
            stdout,
            pending: Vec::with_capacity(READ_CHUNK * 2),
        }))
    }
}

struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    pending: Vec<u8>,
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame, StreamError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(jpeg) = split_jpeg(&mut self.pending) {
                return frame_from_jpeg(jpeg);
            }
            if self.pending.len() > MAX_PENDING_BYTES {
                self.pending.clear();
            }
            let n = self
                .stdout
                .read(&mut chunk)
                .map_err(|e| StreamError::Closed(e.to_string()))?;
            if n == 0 {
                return Err(StreamError::Closed("ffmpeg exited".to_string()));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Pops the first complete JPEG image off the front of `pending`, discarding
/// any garbage before its start marker.
fn split_jpeg(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find_marker(pending, JPEG_SOI, 0)?;
    let end = find_marker(pending, JPEG_EOI, start + 2)? + 2;
    let jpeg = pending[start..end].to_vec();
    pending.drain(..end);
    Some(jpeg)
}

fn find_marker(data: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

fn frame_from_jpeg(jpeg: Vec<u8>) -> Result<Frame, StreamError> {
    let (width, height) = image::ImageReader::new(Cursor::new(&jpeg))
        .with_guessed_format()
        .map_err(|e| StreamError::NoFrame(e.to_string()))?
        .into_dimensions()
        .map_err(|e| StreamError::NoFrame(format!("undecodable frame: {}", e)))?;

    Ok(Frame {
        width,
        height,
        timestamp: SystemTime::now(),
        sequence: 0,
        data: Bytes::from(jpeg),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_jpeg_skips_leading_garbage() {
        let mut pending = vec![0x00, 0x11, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0xFF, 0xD8, 0x03];
        let jpeg = split_jpeg(&mut pending).unwrap();
        assert_eq!(jpeg, vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        // The start of the next image stays buffered.
        assert_eq!(pending, vec![0xFF, 0xD8, 0x03]);
        assert!(split_jpeg(&mut pending).is_none());
    }

    #[test]
    fn test_frame_from_encoded_jpeg() {
        let img = image::RgbImage::from_pixel(32, 16, image::Rgb([10, 20, 30]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let mut pending = vec![0x42];
        pending.extend_from_slice(&jpeg);
        let extracted = split_jpeg(&mut pending).unwrap();
        let frame = frame_from_jpeg(extracted).unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
    }

    #[test]
    fn test_missing_ffmpeg_is_open_error() {
        let opener = FfmpegOpener {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
            ..Default::default()
        };
        assert!(matches!(
            opener.open("rtsp://127.0.0.1/none"),
            Err(StreamError::Open(_))
        ));
    }
}
