//! Drift-corrected repetition of capture jobs.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use ptzcam_core::{capture_timestamp, CameraTarget, Error, Result, Status, StatusSink, StreamType};

use crate::ptz::PtzSequenceController;
use crate::sequence::SequenceDefinition;
use crate::snapshot::{CaptureJob, SnapshotOrchestrator};

/// Longest uninterrupted sleep between stop-flag checks.
pub const SLEEP_SLICE: Duration = Duration::from_millis(100);
/// How long dropping a running [`AutoCapture`] waits for the repetition in
/// flight.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Work repeated by [`AutoCapture`].
pub trait RepeatJob: Send {
    /// Checks run once before the loop starts. Nothing may touch a device
    /// here.
    fn prepare(&mut self, _period: Duration) -> Result<()> {
        Ok(())
    }

    /// One repetition. Failures are the job's to report.
    fn run(&mut self, timestamp: &str);
}

/// Repeats a multi-camera snapshot batch.
pub struct SnapshotJob {
    orchestrator: SnapshotOrchestrator,
    job: CaptureJob,
}

impl SnapshotJob {
    pub fn new(orchestrator: SnapshotOrchestrator, job: CaptureJob) -> Self {
        Self { orchestrator, job }
    }
}

impl RepeatJob for SnapshotJob {
    fn prepare(&mut self, _period: Duration) -> Result<()> {
        self.orchestrator.check(&self.job)
    }

    fn run(&mut self, timestamp: &str) {
        if let Err(e) = self.orchestrator.run(&self.job, timestamp) {
            warn!(error = %e, "auto snapshot skipped");
        }
    }
}

/// Repeats a PTZ sequence into `{save_dir}/{sequence name}`.
pub struct SequenceJob {
    controller: PtzSequenceController,
    target: CameraTarget,
    sequence: SequenceDefinition,
    stream_type: StreamType,
    save_dir: PathBuf,
    status: StatusSink,
}

impl SequenceJob {
    pub fn new(
        controller: PtzSequenceController,
        target: CameraTarget,
        sequence: SequenceDefinition,
        stream_type: StreamType,
        save_dir: impl Into<PathBuf>,
        status: StatusSink,
    ) -> Self {
        Self {
            controller,
            target,
            sequence,
            stream_type,
            save_dir: save_dir.into(),
            status,
        }
    }

    fn run_dir(&self) -> PathBuf {
        self.save_dir.join(&self.sequence.name)
    }
}

impl RepeatJob for SequenceJob {
    fn prepare(&mut self, period: Duration) -> Result<()> {
        let required = self.sequence.estimate_duration();
        if period.as_secs_f64() < required {
            self.status.report(Status::DelayTooShort(required));
            return Err(Error::Timing {
                period_sec: period.as_secs(),
                required_sec: required,
            });
        }
        if !self.save_dir.is_dir() {
            self.status.report(Status::SelectFolder);
            return Err(Error::Config(format!(
                "save directory {} does not exist",
                self.save_dir.display()
            )));
        }
        fs::create_dir_all(self.run_dir())?;
        Ok(())
    }

    fn run(&mut self, timestamp: &str) {
        let dir = self.run_dir();
        if let Err(e) = self
            .controller
            .run(&self.target, &self.sequence, self.stream_type, &dir, timestamp)
        {
            warn!(sequence = %self.sequence.name, error = %e, "auto sequence failed");
        }
    }
}

/// Parameters of one auto-capture run.
pub struct AutoCaptureSession {
    /// Whole seconds, at least 1.
    pub period_secs: u64,
    /// Stop after this many repetitions; `None` runs until stopped.
    pub max_count: Option<u64>,
    pub job: Box<dyn RepeatJob>,
}

impl AutoCaptureSession {
    pub fn new(period_secs: u64, job: Box<dyn RepeatJob>) -> Self {
        Self {
            period_secs,
            max_count: None,
            job,
        }
    }

    pub fn with_max_count(mut self, max_count: Option<u64>) -> Self {
        self.max_count = max_count;
        self
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<u64>,
}

/// Owner of the single background auto-capture loop.
///
/// Stopping is cooperative: the repetition in flight completes, no further
/// one starts.
pub struct AutoCapture {
    status: StatusSink,
    running: Option<Running>,
}

impl AutoCapture {
    pub fn new(status: StatusSink) -> Self {
        Self {
            status,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished() && !r.stop.load(Ordering::Acquire))
    }

    /// Validates the session and starts its loop on a background thread.
    ///
    /// Rejected with [`Error::AlreadyRunning`] while a loop is alive, and
    /// with a configuration or timing error before any device is touched.
    pub fn start(&mut self, session: AutoCaptureSession) -> Result<()> {
        if let Some(running) = &self.running {
            if !running.handle.is_finished() {
                return Err(Error::AlreadyRunning);
            }
        }
        self.reap();

        let AutoCaptureSession {
            period_secs,
            max_count,
            mut job,
        } = session;
        if period_secs < 1 {
            return Err(Error::Config("Delay must be >= 1".to_string()));
        }
        if max_count == Some(0) {
            return Err(Error::Config("Max capture must be >= 1".to_string()));
        }
        let period = Duration::from_secs(period_secs);
        job.prepare(period)?;

        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let status = self.status.clone();
        let handle = thread::Builder::new()
            .name("auto-capture".to_string())
            .spawn(move || {
                let count = run_loop(job.as_mut(), period, max_count, &loop_stop);
                status.report(Status::AutoStopped);
                count
            })?;

        info!(period_secs, ?max_count, "auto capture started");
        self.status.report(Status::AutoStarted);
        self.running = Some(Running { stop, handle });
        Ok(())
    }

    /// Asks the loop to stop after the repetition in flight.
    pub fn stop(&self) {
        if let Some(running) = &self.running {
            if !running.stop.swap(true, Ordering::AcqRel) {
                self.status.report(Status::Stopping);
            }
        }
    }

    /// Stops a running loop, otherwise starts `session`. Returns whether a
    /// loop was started.
    pub fn toggle(&mut self, session: AutoCaptureSession) -> Result<bool> {
        if self.is_running() {
            self.stop();
            return Ok(false);
        }
        self.start(session)?;
        Ok(true)
    }

    /// Waits up to `timeout` for the loop to end and returns how many
    /// repetitions ran. `None` if it is still running or none was started.
    pub fn join(&mut self, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        while !self.running.as_ref()?.handle.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10).min(deadline - now));
        }
        let running = self.running.take()?;
        running.handle.join().ok()
    }

    fn reap(&mut self) {
        if let Some(running) = self.running.take() {
            if running.handle.join().is_err() {
                warn!("auto capture thread panicked");
            }
        }
    }
}

impl Drop for AutoCapture {
    fn drop(&mut self) {
        let Some(running) = &self.running else {
            return;
        };
        running.stop.store(true, Ordering::Release);
        if self.join(SHUTDOWN_TIMEOUT).is_none() && self.running.is_some() {
            warn!("auto capture still busy after {:?}, detaching", SHUTDOWN_TIMEOUT);
        }
    }
}

/// The repetition loop. The next trigger is always the previous scheduled
/// trigger plus `period`; a repetition that overruns makes the next one fire
/// immediately, nothing is skipped.
fn run_loop(
    job: &mut dyn RepeatJob,
    period: Duration,
    max_count: Option<u64>,
    stop: &AtomicBool,
) -> u64 {
    let mut count = 0;
    let mut next = Instant::now();

    while !stop.load(Ordering::Acquire) {
        next += period;
        job.run(&capture_timestamp());
        count += 1;
        if max_count.is_some_and(|max| count >= max) {
            break;
        }
        sleep_until(next, stop);
    }

    stop.store(true, Ordering::Release);
    debug!(count, "auto capture loop finished");
    count
}

fn sleep_until(deadline: Instant, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use ptzcam_core::Credentials;
    use ptzcam_device::fake::FakeDevice;

    /// Records trigger instants and optionally simulates work.
    struct Recorder {
        triggers: Arc<Mutex<Vec<Instant>>>,
        work: Duration,
    }

    impl Recorder {
        fn new(work: Duration) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let triggers = Arc::new(Mutex::new(Vec::new()));
            let recorder = Self {
                triggers: Arc::clone(&triggers),
                work,
            };
            (recorder, triggers)
        }
    }

    impl RepeatJob for Recorder {
        fn run(&mut self, _timestamp: &str) {
            self.triggers.lock().push(Instant::now());
            thread::sleep(self.work);
        }
    }

    #[test]
    fn test_triggers_do_not_drift() {
        let period = Duration::from_millis(200);
        let (mut recorder, triggers) = Recorder::new(period / 2);
        let stop = AtomicBool::new(false);

        assert_eq!(run_loop(&mut recorder, period, Some(6), &stop), 6);

        let triggers = triggers.lock();
        let t0 = triggers[0];
        for (i, t) in triggers.iter().enumerate() {
            let expected = t0 + period * i as u32;
            let skew = if *t > expected { *t - expected } else { expected - *t };
            assert!(skew < Duration::from_millis(150), "trigger {} off by {:?}", i, skew);
        }
    }

    #[test]
    fn test_max_count_stops_loop() {
        let (mut recorder, triggers) = Recorder::new(Duration::ZERO);
        let stop = AtomicBool::new(false);

        assert_eq!(run_loop(&mut recorder, Duration::from_millis(20), Some(3), &stop), 3);
        assert_eq!(triggers.lock().len(), 3);
        assert!(stop.load(Ordering::Acquire));
    }

    #[test]
    fn test_overrun_fires_immediately() {
        let period = Duration::from_millis(50);
        let (mut recorder, triggers) = Recorder::new(Duration::from_millis(130));
        let stop = AtomicBool::new(false);

        run_loop(&mut recorder, period, Some(3), &stop);

        let triggers = triggers.lock();
        assert_eq!(triggers.len(), 3);
        for pair in triggers.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(130));
            assert!(gap < Duration::from_millis(250));
        }
    }

    #[test]
    fn test_start_stop_and_reject_second_session() {
        let (status, mut rx) = StatusSink::channel(16);
        let mut auto = AutoCapture::new(status);
        let (recorder, triggers) = Recorder::new(Duration::ZERO);

        auto.start(AutoCaptureSession::new(1, Box::new(recorder))).unwrap();
        assert!(auto.is_running());

        let (second, _) = Recorder::new(Duration::ZERO);
        assert!(matches!(
            auto.start(AutoCaptureSession::new(1, Box::new(second))),
            Err(Error::AlreadyRunning)
        ));

        auto.stop();
        assert!(!auto.is_running());
        assert_eq!(auto.join(Duration::from_secs(1)), Some(1));
        assert_eq!(triggers.lock().len(), 1);

        let mut statuses = Vec::new();
        while let Ok(status) = rx.try_recv() {
            statuses.push(status);
        }
        assert_eq!(statuses, vec![Status::AutoStarted, Status::Stopping, Status::AutoStopped]);
    }

    #[test]
    fn test_bounded_session_ends_by_itself() {
        let mut auto = AutoCapture::new(StatusSink::disabled());
        let (recorder, _) = Recorder::new(Duration::ZERO);

        auto.start(AutoCaptureSession::new(1, Box::new(recorder)).with_max_count(Some(1)))
            .unwrap();
        assert_eq!(auto.join(Duration::from_secs(1)), Some(1));
        assert!(!auto.is_running());

        // A finished session does not block the next one.
        let (recorder, _) = Recorder::new(Duration::ZERO);
        let started = auto
            .toggle(AutoCaptureSession::new(1, Box::new(recorder)).with_max_count(Some(1)))
            .unwrap();
        assert!(started);
        assert_eq!(auto.join(Duration::from_secs(1)), Some(1));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut auto = AutoCapture::new(StatusSink::disabled());
        let (recorder, _) = Recorder::new(Duration::ZERO);
        assert!(matches!(
            auto.start(AutoCaptureSession::new(0, Box::new(recorder))),
            Err(Error::Config(_))
        ));
        let (recorder, _) = Recorder::new(Duration::ZERO);
        assert!(matches!(
            auto.start(AutoCaptureSession::new(1, Box::new(recorder)).with_max_count(Some(0))),
            Err(Error::Config(_))
        ));
        assert!(!auto.is_running());
    }

    #[test]
    fn test_drop_waits_for_repetition_in_flight() {
        struct Slow(Arc<AtomicBool>);

        impl RepeatJob for Slow {
            fn run(&mut self, _timestamp: &str) {
                thread::sleep(Duration::from_millis(200));
                self.0.store(true, Ordering::Release);
            }
        }

        let finished = Arc::new(AtomicBool::new(false));
        let mut auto = AutoCapture::new(StatusSink::disabled());
        auto.start(AutoCaptureSession::new(1, Box::new(Slow(Arc::clone(&finished)))))
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        drop(auto);
        assert!(finished.load(Ordering::Acquire));
    }

    fn snapshot_job(device: &FakeDevice, job: CaptureJob, status: StatusSink) -> SnapshotJob {
        let client: Arc<dyn ptzcam_device::DeviceClient> = Arc::new(device.clone());
        SnapshotJob::new(SnapshotOrchestrator::new(client, status), job)
    }

    #[test]
    fn test_snapshot_session_requires_existing_destination() {
        let device = FakeDevice::new();
        let (status, mut rx) = StatusSink::channel(4);
        let cameras = vec![CameraTarget::new("10.0.0.1", Credentials::with_password("admin", "pw"))];
        let job = snapshot_job(
            &device,
            CaptureJob::new(cameras, "/nonexistent/ptzcam/out"),
            status.clone(),
        );
        let mut auto = AutoCapture::new(status);

        let err = auto.start(AutoCaptureSession::new(1, Box::new(job))).unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(rx.try_recv().ok(), Some(Status::SelectFolder));
        assert!(rx.try_recv().is_err());
        assert!(!auto.is_running());
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_snapshot_session_requires_selection() {
        let device = FakeDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let (status, mut rx) = StatusSink::channel(4);
        let cameras = vec![CameraTarget::new("10.0.0.1", Credentials::with_password("admin", "pw"))];
        let job = snapshot_job(
            &device,
            CaptureJob::new(cameras, dir.path()).select(Vec::new()),
            status.clone(),
        );
        let mut auto = AutoCapture::new(status);

        assert!(matches!(
            auto.start(AutoCaptureSession::new(1, Box::new(job))),
            Err(Error::Config(_))
        ));
        assert_eq!(rx.try_recv().ok(), Some(Status::SelectCameras));
        assert!(!auto.is_running());
        assert!(device.calls().is_empty());
    }

    fn sequence_job(device: &FakeDevice, toml: &str, save_dir: PathBuf, status: StatusSink) -> SequenceJob {
        let client: Arc<dyn ptzcam_device::DeviceClient> = Arc::new(device.clone());
        SequenceJob::new(
            PtzSequenceController::new(client, status.clone()),
            CameraTarget::new("10.0.0.1", Credentials::with_password("admin", "pw")),
            SequenceDefinition::parse(toml).unwrap(),
            StreamType::Main,
            save_dir,
            status,
        )
    }

    #[test]
    fn test_short_period_rejected_before_device_calls() {
        let device = FakeDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let (status, mut rx) = StatusSink::channel(4);
        let job = sequence_job(
            &device,
            "name = \"slow\"\n[[steps]]\ndelay_sec = 2\nptz = { type = \"relative\", pan = 0.1 }\n",
            dir.path().to_path_buf(),
            status.clone(),
        );
        let mut auto = AutoCapture::new(status);

        let err = auto.start(AutoCaptureSession::new(3, Box::new(job))).unwrap_err();

        assert!(matches!(err, Error::Timing { period_sec: 3, .. }));
        assert_eq!(
            rx.try_recv().unwrap().to_string(),
            "Delay too short (need >= 3.2s)"
        );
        assert!(device.calls().is_empty());
        assert!(!dir.path().join("slow").exists());
        assert!(!auto.is_running());
    }

    #[test]
    fn test_sequence_job_requires_existing_save_dir() {
        let device = FakeDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let mut job = sequence_job(
            &device,
            "name = \"quick\"\n[[steps]]\n",
            dir.path().join("missing"),
            StatusSink::disabled(),
        );
        assert!(matches!(job.prepare(Duration::from_secs(1)), Err(Error::Config(_))));

        let mut job = sequence_job(&device, "name = \"quick\"\n[[steps]]\n", dir.path().to_path_buf(), StatusSink::disabled());
        job.prepare(Duration::from_secs(1)).unwrap();
        assert!(dir.path().join("quick").is_dir());
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_sequence_job_runs_into_named_dir() {
        let device = FakeDevice::new();
        let dir = tempfile::tempdir().unwrap();
        let mut job = sequence_job(
            &device,
            "name = \"Front Gate\"\n[[steps]]\nname = \"wide\"\n",
            dir.path().to_path_buf(),
            StatusSink::disabled(),
        );
        job.prepare(Duration::from_secs(1)).unwrap();
        job.run("2024_05_06_07_08_09");
        assert!(dir.path().join("Front_Gate/2024_05_06_07_08_09_wide.jpg").is_file());
    }
}
