use std::path::{Path, PathBuf};
use std::sync::Arc;

use ptzcam_core::{CameraTarget, Error, Frame, Result, Status, StatusSink, StreamType};
use tracing::{info, warn};

use crate::buffer::FrameBuffer;
use crate::source::SourceOpener;
use crate::worker::{self, IngestionHandle, STOP_JOIN_TIMEOUT};
use crate::live_stream_url;

struct LiveCamera {
    target: CameraTarget,
    buffer: Arc<FrameBuffer>,
    handle: Option<IngestionHandle>,
    latest: Option<Frame>,
}

/// Owns one ingestion worker and frame buffer per camera.
///
/// At most one worker per camera exists at any time: a restart stops and
/// joins the previous worker and drains its buffer before the next one
/// starts.
pub struct LiveView {
    cameras: Vec<LiveCamera>,
    opener: Arc<dyn SourceOpener>,
    status: StatusSink,
}

impl LiveView {
    pub fn new(targets: Vec<CameraTarget>, opener: Arc<dyn SourceOpener>, status: StatusSink) -> Self {
        let cameras = targets
            .into_iter()
            .map(|target| LiveCamera {
                target,
                buffer: Arc::new(FrameBuffer::new()),
                handle: None,
                latest: None,
            })
            .collect();
        Self {
            cameras,
            opener,
            status,
        }
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Starts a worker for every camera that does not have one.
    pub fn start(&mut self) {
        for (idx, camera) in self.cameras.iter_mut().enumerate() {
            if camera.handle.as_ref().is_some_and(IngestionHandle::is_running) {
                continue;
            }
            let url = live_stream_url(&camera.target);
            let publisher = camera.buffer.publisher();
            camera.handle = Some(worker::start(
                format!("{}", idx + 1),
                url,
                publisher,
                Arc::clone(&self.opener),
            ));
        }
        self.status.report(Status::Live);
    }

    /// Signals every worker first, then joins each with a bounded wait.
    pub fn stop(&mut self) {
        for camera in &self.cameras {
            if let Some(handle) = &camera.handle {
                handle.signal_stop();
            }
        }
        for (idx, camera) in self.cameras.iter_mut().enumerate() {
            if let Some(mut handle) = camera.handle.take() {
                if !handle.stop(STOP_JOIN_TIMEOUT) {
                    warn!(camera = idx + 1, "worker still releasing its stream");
                }
            }
        }
    }

    /// Stops all workers, drains every buffer and starts fresh workers.
    pub fn restart(&mut self) {
        self.status.report(Status::Switching);
        self.stop();
        for camera in &mut self.cameras {
            let dropped = camera.buffer.drain();
            if dropped > 0 {
                info!(camera = %camera.target.stream_host, dropped, "drained stale frames");
            }
            camera.latest = None;
        }
        self.start();
    }

    /// Records the new stream selection and restarts ingestion. The live
    /// feed itself always uses the sub channel.
    pub fn switch_stream(&mut self, stream_type: StreamType) {
        for camera in &mut self.cameras {
            camera.target.stream_type = stream_type;
        }
        self.restart();
    }

    /// Takes at most one frame per camera from its buffer and remembers it as
    /// the camera's latest. Returns how many cameras delivered a new frame.
    pub fn poll(&mut self) -> usize {
        let mut fresh = 0;
        for camera in &mut self.cameras {
            if let Some(frame) = camera.buffer.try_take() {
                camera.latest = Some(frame);
                fresh += 1;
            }
        }
        fresh
    }

    pub fn latest_frame(&self, idx: usize) -> Option<&Frame> {
        self.cameras.get(idx)?.latest.as_ref()
    }

    /// `true` once every camera has shown at least one frame since the last
    /// (re)start.
    pub fn all_ready(&self) -> bool {
        !self.cameras.is_empty() && self.cameras.iter().all(|camera| camera.latest.is_some())
    }

    /// Writes the latest frame of camera `idx` to `{dir}/{timestamp}.jpg`.
    pub fn save_latest(&self, idx: usize, dir: &Path, timestamp: &str) -> Result<PathBuf> {
        if !dir.is_dir() {
            self.status.report(Status::SelectFolder);
            return Err(Error::Config(Status::SelectFolder.to_string()));
        }
        let frame = self.latest_frame(idx).ok_or_else(|| Error::Capture {
            camera: idx + 1,
            reason: "no frame received yet".to_string(),
        })?;
        let path = dir.join(format!("{}.jpg", timestamp));
        std::fs::write(&path, &frame.data)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.status.report(Status::Saved(name));
        Ok(path)
    }
}

impl Drop for LiveView {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::CountingOpener;
    use ptzcam_core::Credentials;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn targets(n: usize) -> Vec<CameraTarget> {
        (0..n)
            .map(|i| CameraTarget::new(format!("10.0.0.{}", i + 1), Credentials::with_password("admin", "pw")))
            .collect()
    }

    fn poll_until_ready(view: &mut LiveView) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            view.poll();
            if view.all_ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_restart_drains_previous_frames() {
        let opener = Arc::new(CountingOpener::new(false));
        let releases = Arc::clone(&opener.releases);
        let mut view = LiveView::new(targets(2), opener.clone(), StatusSink::disabled());

        view.start();
        assert!(poll_until_ready(&mut view));
        std::thread::sleep(Duration::from_millis(30));

        view.switch_stream(StreamType::Main);
        assert!(!view.all_ready());
        // Both first-generation sources were released before the restart.
        assert!(releases.load(Ordering::SeqCst) >= 2);

        assert!(poll_until_ready(&mut view));
        for idx in 0..2 {
            let data = &view.latest_frame(idx).unwrap().data;
            let open_index: usize = std::str::from_utf8(data).unwrap().parse().unwrap();
            // Opens 1 and 2 belong to the first generation.
            assert!(open_index > 2, "stale frame from open {}", open_index);
        }

        view.stop();
        assert_eq!(releases.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_save_latest_writes_frame() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(CountingOpener::new(false));
        let mut view = LiveView::new(targets(1), opener, StatusSink::disabled());

        assert!(view.save_latest(0, dir.path(), "2024_01_01_00_00_00").is_err());

        view.start();
        assert!(poll_until_ready(&mut view));
        let path = view.save_latest(0, dir.path(), "2024_01_01_00_00_00").unwrap();
        assert_eq!(path, dir.path().join("2024_01_01_00_00_00.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"1");
    }

    #[test]
    fn test_save_latest_requires_existing_folder() {
        let opener = Arc::new(CountingOpener::new(false));
        let view = LiveView::new(targets(1), opener, StatusSink::disabled());
        let err = view
            .save_latest(0, Path::new("/nonexistent/ptzcam"), "ts")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
