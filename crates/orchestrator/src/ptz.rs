//! PTZ sequence execution against a single camera.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use ptzcam_core::{CameraTarget, Error, Result, Status, StatusSink, StreamType};
use ptzcam_device::{
    select_profile, DeviceClient, DeviceError, DeviceResult, DeviceSession, Profile, PtzMove,
};

use crate::sequence::{PtzStep, SequenceDefinition};
use crate::snapshot::capture_device_snapshot;

/// Interval between motion status polls.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest wait for a move to settle.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// Where a step currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    Moving,
    WaitingIdle,
    Delaying,
    Capturing,
    Done,
}

/// Outcome of one sequence run.
#[derive(Debug, Default)]
pub struct SequenceReport {
    pub captured: Vec<PathBuf>,
    /// `(step name, reason)` for every step that produced no image.
    pub failed_steps: Vec<(String, String)>,
}

/// Runs a [`SequenceDefinition`] step by step: focus, move, settle, delay,
/// shoot. A failed step is reported and skipped; the run goes on.
pub struct PtzSequenceController {
    client: Arc<dyn DeviceClient>,
    status: StatusSink,
    poll_interval: Duration,
    idle_timeout: Duration,
}

/// Per-run context shared by all steps.
struct Run<'a> {
    session: &'a dyn DeviceSession,
    profile: &'a Profile,
    target: &'a CameraTarget,
    stream_type: StreamType,
    dir: &'a Path,
    timestamp: &'a str,
}

impl PtzSequenceController {
    pub fn new(client: Arc<dyn DeviceClient>, status: StatusSink) -> Self {
        Self {
            client,
            status,
            poll_interval: IDLE_POLL_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_wait(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.idle_timeout = timeout;
        self
    }

    /// Executes every step in order, writing `{dir}/{timestamp}_{step}.jpg`.
    ///
    /// Fails only when the camera cannot be reached or has no profile.
    pub fn run(
        &self,
        target: &CameraTarget,
        sequence: &SequenceDefinition,
        stream_type: StreamType,
        dir: &Path,
        timestamp: &str,
    ) -> Result<SequenceReport> {
        let (session, profiles) = match self.client.connect(target) {
            Ok(connected) => connected,
            Err(e) => {
                self.status.report(Status::DeviceError(e.reason.clone()));
                return Err(e.into());
            }
        };
        let Some(profile) = select_profile(&profiles, stream_type) else {
            self.status.report(Status::DeviceError("ONVIF profile not found".to_string()));
            return Err(DeviceError::new("ONVIF profile not found").into());
        };

        let run = Run {
            session: session.as_ref(),
            profile,
            target,
            stream_type,
            dir,
            timestamp,
        };

        info!(
            camera = %target.control_host,
            sequence = %sequence.name,
            steps = sequence.steps.len(),
            "sequence started"
        );

        let mut report = SequenceReport::default();
        for (index, step) in sequence.steps.iter().enumerate() {
            let name = step.file_name(index);
            match self.run_step(&run, step, &name) {
                Ok(path) => report.captured.push(path),
                Err(err) => {
                    warn!(step = %name, error = %err, "step failed");
                    let status = match &err {
                        Error::SequenceStep { .. } => Status::StepError(err.reason()),
                        other => Status::DeviceError(other.reason()),
                    };
                    self.status.report(status);
                    report.failed_steps.push((name, err.to_string()));
                }
            }
        }

        info!(
            sequence = %sequence.name,
            captured = report.captured.len(),
            failed = report.failed_steps.len(),
            "sequence finished"
        );
        self.status.report(Status::SnapshotsSaved);
        Ok(report)
    }

    fn run_step(&self, run: &Run<'_>, step: &PtzStep, name: &str) -> Result<PathBuf> {
        let step_error = |e: DeviceError| Error::SequenceStep {
            step: name.to_string(),
            reason: e.reason,
        };
        let path = run.dir.join(format!("{}_{}.jpg", run.timestamp, name));

        let mut state = SequenceState::Idle;
        loop {
            trace!(step = %name, ?state, "step state");
            state = match state {
                SequenceState::Idle => {
                    self.apply_focus(run, step).map_err(step_error)?;
                    SequenceState::Moving
                }
                SequenceState::Moving => {
                    if self.move_camera(run, step).map_err(step_error)? {
                        SequenceState::WaitingIdle
                    } else {
                        SequenceState::Delaying
                    }
                }
                SequenceState::WaitingIdle => {
                    if !self.wait_idle(run.session, run.profile) {
                        debug!(step = %name, "camera did not report idle, continuing");
                    }
                    SequenceState::Delaying
                }
                SequenceState::Delaying => {
                    let delay = step.delay();
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    SequenceState::Capturing
                }
                SequenceState::Capturing => {
                    capture_device_snapshot(
                        self.client.as_ref(),
                        run.target,
                        run.stream_type,
                        None,
                        &path,
                    )?;
                    SequenceState::Done
                }
                SequenceState::Done => return Ok(path),
            };
        }
    }

    /// Writes the step's focus directives, or puts the camera back into
    /// auto-focus when it has none. Cameras without focus control are left
    /// alone.
    fn apply_focus(&self, run: &Run<'_>, step: &PtzStep) -> DeviceResult<()> {
        let Some(source) = run.profile.video_source_token.as_deref() else {
            debug!("profile has no video source, focus untouched");
            return Ok(());
        };
        let mut settings = run.session.imaging_settings(source)?;
        let Some(focus) = settings.focus.as_mut() else {
            return Ok(());
        };

        if step.has_focus_directives() {
            if let Some(mode) = step.focus_mode.as_deref().filter(|m| !m.is_empty()) {
                focus.auto_focus_mode = mode.to_uppercase();
            }
            if let Some(speed) = step.focus_default_speed {
                focus.default_speed = Some(speed);
            }
            if let Some(near) = step.focus_near_limit {
                focus.near_limit = Some(near);
            }
            if let Some(far) = step.focus_far_limit {
                focus.far_limit = Some(far);
            }
        } else {
            focus.auto_focus_mode = "AUTO".to_string();
        }
        run.session.set_imaging_settings(source, &settings)
    }

    /// Issues the step's move. Returns whether the camera was moved.
    fn move_camera(&self, run: &Run<'_>, step: &PtzStep) -> DeviceResult<bool> {
        let Some(ptz) = &step.ptz else {
            return Ok(false);
        };
        let Some(motion) = ptz.to_move() else {
            return Ok(false);
        };

        run.session.ptz_move(run.profile, &motion)?;
        if let PtzMove::Continuous { .. } = motion {
            thread::sleep(ptz.hold());
            run.session.ptz_stop(run.profile)?;
        }
        Ok(true)
    }

    /// Polls until pan/tilt and zoom are both idle. Returns `false` on
    /// timeout or when the status cannot be read.
    fn wait_idle(&self, session: &dyn DeviceSession, profile: &Profile) -> bool {
        let deadline = Instant::now() + self.idle_timeout;
        loop {
            match session.ptz_status(profile) {
                Ok(status) if status.is_idle() => return true,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "status poll failed");
                    return false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
