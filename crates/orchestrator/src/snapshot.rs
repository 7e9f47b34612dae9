//! Device snapshots, one camera at a time or as a synchronized batch.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::ImageFormat;
use tracing::{debug, info, warn};

use ptzcam_core::{
    join_until, CameraTarget, Error, JoinFailure, Resolution, Result, Status, StatusSink, StreamType,
};
use ptzcam_device::{select_profile, DeviceClient, DeviceError};

use crate::barrier::{BarrierWait, TimedBarrier};

/// Longest a capture task waits for its siblings before shooting anyway.
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on waiting for a whole batch.
pub const BATCH_JOIN_TIMEOUT: Duration = Duration::from_secs(6);

/// Takes one device snapshot into `path`.
///
/// The largest profile is raised to its best advertised resolution and frame
/// rate and always used for the shot. A `Sub` request is then scaled down to
/// `target_res`, or to the smallest profile's resolution, and re-encoded; a
/// `Main` request is written byte for byte.
pub fn capture_device_snapshot(
    client: &dyn DeviceClient,
    target: &CameraTarget,
    stream_type: StreamType,
    target_res: Option<Resolution>,
    path: &Path,
) -> Result<()> {
    let (session, profiles) = client.connect(target)?;
    let main = select_profile(&profiles, StreamType::Main)
        .ok_or_else(|| DeviceError::new("ONVIF profile not found"))?;

    let options = session.encoder_options(main)?;
    if let Some(resolution) = options.best_resolution().or_else(|| main.resolution()) {
        session.set_encoder_config(main, resolution, options.max_frame_rate())?;
        debug!(camera = %target.control_host, resolution = %resolution, "main profile raised");
    }

    let uri = session.snapshot_uri(main)?;
    let bytes = session.fetch_bytes(&uri, &target.credentials)?;

    match stream_type {
        StreamType::Main => fs::write(path, &bytes)?,
        StreamType::Sub => {
            let size = target_res
                .or_else(|| select_profile(&profiles, StreamType::Sub).and_then(|p| p.resolution()))
                .ok_or_else(|| Error::Image("sub profile has no resolution".to_string()))?;
            if size.width == 0 || size.height == 0 {
                return Err(Error::Image(format!("cannot scale snapshot to {}", size)));
            }
            let decoded = image::load_from_memory(&bytes)
                .map_err(|e| Error::Image(format!("Snapshot decode failed: {}", e)))?;
            decoded
                .resize_exact(size.width, size.height, FilterType::Triangle)
                .to_rgb8()
                .save_with_format(path, ImageFormat::Jpeg)
                .map_err(|e| Error::Image(format!("Snapshot encode failed: {}", e)))?;
        }
    }

    info!(camera = %target.control_host, path = %path.display(), "snapshot written");
    Ok(())
}

/// Which cameras to shoot, and where.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    /// Every known camera; indices refer into this list.
    pub cameras: Vec<CameraTarget>,
    /// Zero-based indices of the cameras to shoot.
    pub selected: BTreeSet<usize>,
    pub destination: PathBuf,
    pub stream_type: StreamType,
    /// Per-camera output size for `Sub` captures.
    pub resolutions: HashMap<usize, Resolution>,
}

impl CaptureJob {
    /// A job selecting every camera.
    pub fn new(cameras: Vec<CameraTarget>, destination: impl Into<PathBuf>) -> Self {
        let selected = (0..cameras.len()).collect();
        Self {
            cameras,
            selected,
            destination: destination.into(),
            stream_type: StreamType::default(),
            resolutions: HashMap::new(),
        }
    }

    pub fn select(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.selected = indices.into_iter().collect();
        self
    }

    pub fn with_stream_type(mut self, stream_type: StreamType) -> Self {
        self.stream_type = stream_type;
        self
    }

    pub fn with_resolution(mut self, camera: usize, resolution: Resolution) -> Self {
        self.resolutions.insert(camera, resolution);
        self
    }
}

/// Per-camera results of one batch. Camera numbers are zero-based.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub saved: Vec<(usize, PathBuf)>,
    pub failed: Vec<(usize, String)>,
    /// Cameras still working when the join deadline passed.
    pub unfinished: Vec<usize>,
    pub synchronized: bool,
}

type TaskResult = (Result<PathBuf>, BarrierWait);

/// Fans a [`CaptureJob`] out to one thread per selected camera.
#[derive(Clone)]
pub struct SnapshotOrchestrator {
    client: Arc<dyn DeviceClient>,
    status: StatusSink,
    barrier_timeout: Duration,
    join_timeout: Duration,
}

impl SnapshotOrchestrator {
    pub fn new(client: Arc<dyn DeviceClient>, status: StatusSink) -> Self {
        Self {
            client,
            status,
            barrier_timeout: BARRIER_TIMEOUT,
            join_timeout: BATCH_JOIN_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, barrier: Duration, join: Duration) -> Self {
        self.barrier_timeout = barrier;
        self.join_timeout = join;
        self
    }

    /// Rejects an empty selection or a missing destination, without
    /// contacting any device.
    pub fn check(&self, job: &CaptureJob) -> Result<()> {
        if job.selected.is_empty() {
            self.status.report(Status::SelectCameras);
            return Err(Error::Config("no cameras selected".to_string()));
        }
        if !job.destination.is_dir() {
            self.status.report(Status::SelectFolder);
            return Err(Error::Config(format!(
                "destination {} is not a directory",
                job.destination.display()
            )));
        }
        Ok(())
    }

    /// Shoots every selected camera into `{destination}/Camera {n}/{timestamp}.jpg`.
    ///
    /// Only an empty selection or a missing destination fail the call, and
    /// both are checked before any device is contacted. Individual camera
    /// failures land in the report.
    pub fn run(&self, job: &CaptureJob, timestamp: &str) -> Result<BatchReport> {
        self.check(job)?;

        let mut tasks = Vec::new();
        for &index in &job.selected {
            let Some(target) = job.cameras.get(index) else {
                warn!(camera = index + 1, "selected camera does not exist, skipping");
                continue;
            };
            let dir = job.destination.join(format!("Camera {}", index + 1));
            fs::create_dir_all(&dir)?;
            let resolution = match job.stream_type {
                StreamType::Sub => job.resolutions.get(&index).copied(),
                StreamType::Main => None,
            };
            tasks.push((index, target.clone(), dir.join(format!("{}.jpg", timestamp)), resolution));
        }

        let barrier = Arc::new(TimedBarrier::new(tasks.len()));
        let mut report = BatchReport {
            synchronized: true,
            ..Default::default()
        };
        let mut handles = Vec::with_capacity(tasks.len());

        for (index, target, path, resolution) in tasks {
            let client = Arc::clone(&self.client);
            let barrier = Arc::clone(&barrier);
            let barrier_timeout = self.barrier_timeout;
            let stream_type = job.stream_type;

            let spawned = thread::Builder::new()
                .name(format!("snapshot-cam{}", index + 1))
                .spawn(move || -> TaskResult {
                    let rendezvous = barrier.wait(barrier_timeout);
                    if rendezvous == BarrierWait::TimedOut {
                        debug!(camera = index + 1, "barrier timed out, shooting anyway");
                    }
                    let result = capture_device_snapshot(
                        client.as_ref(),
                        &target,
                        stream_type,
                        resolution,
                        &path,
                    )
                    .map(|()| path);
                    (result, rendezvous)
                });

            match spawned {
                Ok(handle) => handles.push((index, handle)),
                Err(e) => report.failed.push((index, format!("failed to spawn capture task: {}", e))),
            }
        }

        let deadline = Instant::now() + self.join_timeout;
        for (index, handle) in handles {
            match join_until(handle, deadline) {
                Ok((result, rendezvous)) => {
                    report.synchronized &= rendezvous == BarrierWait::AllArrived;
                    match result {
                        Ok(path) => report.saved.push((index, path)),
                        Err(e) => {
                            let err = Error::Capture {
                                camera: index + 1,
                                reason: e.to_string(),
                            };
                            warn!(error = %err, "snapshot failed");
                            report.failed.push((index, err.to_string()));
                        }
                    }
                }
                Err(JoinFailure::Panicked) => {
                    let err = Error::Capture {
                        camera: index + 1,
                        reason: "capture thread panicked".to_string(),
                    };
                    warn!(error = %err, "snapshot failed");
                    report.failed.push((index, err.to_string()));
                }
                Err(JoinFailure::TimedOut) => {
                    warn!(camera = index + 1, "snapshot still running at join deadline");
                    report.unfinished.push(index);
                }
            }
        }

        info!(
            saved = report.saved.len(),
            failed = report.failed.len(),
            unfinished = report.unfinished.len(),
            "snapshot batch complete"
        );
        self.status.report(Status::SnapshotsSaved);
        Ok(report)
    }
}
