//! In-memory device double for tests.
//!
//! Every call is logged as `"<host> <operation>"`. Failures, slow snapshots
//! and busy status polls are scripted up front with the builder methods.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use ptzcam_core::{CameraTarget, Credentials, DeviceError, Resolution};

use crate::types::*;
use crate::{DeviceClient, DeviceResult, DeviceSession};

/// A profile with an H.264 encoder at `width`x`height`.
pub fn profile(token: &str, width: u32, height: u32) -> Profile {
    Profile {
        token: token.to_string(),
        name: token.to_string(),
        video_source_token: Some("VideoSource_1".to_string()),
        encoder: Some(EncoderConfig {
            token: format!("enc_{}", token),
            name: format!("enc_{}", token),
            use_count: 1,
            encoding: "H264".to_string(),
            resolution: Resolution::new(width, height),
            quality: 3.0,
            rate_control: Some(RateControl {
                frame_rate_limit: 25,
                encoding_interval: 1,
                bitrate_limit: 4096,
            }),
            h264: None,
            multicast: Multicast::default(),
            session_timeout: "PT60S".to_string(),
        }),
    }
}

struct FakeState {
    profiles: Vec<Profile>,
    options: EncoderOptions,
    snapshot: Bytes,
    imaging: ImagingSettings,
    unreachable: HashSet<String>,
    failing_snapshots: HashSet<String>,
    panicking_snapshots: HashSet<String>,
    failing_moves: HashSet<usize>,
    failing_status: bool,
    busy_polls: usize,
    snapshot_delays: HashMap<String, Duration>,
    moves: usize,
    calls: Vec<String>,
    fetches: Vec<(String, Instant)>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            profiles: vec![profile("main", 1920, 1080), profile("sub", 640, 360)],
            options: EncoderOptions {
                encoding: "H264".to_string(),
                resolutions: vec![
                    Resolution::new(2560, 1440),
                    Resolution::new(1920, 1080),
                    Resolution::new(1280, 720),
                ],
                frame_rate_range: Some((1, 30)),
            },
            snapshot: Bytes::from_static(b"\xFF\xD8fake-jpeg\xFF\xD9"),
            imaging: ImagingSettings {
                focus: Some(FocusSettings {
                    auto_focus_mode: "AUTO".to_string(),
                    ..Default::default()
                }),
            },
            unreachable: HashSet::new(),
            failing_snapshots: HashSet::new(),
            panicking_snapshots: HashSet::new(),
            failing_moves: HashSet::new(),
            failing_status: false,
            busy_polls: 0,
            snapshot_delays: HashMap::new(),
            moves: 0,
            calls: Vec::new(),
            fetches: Vec::new(),
        }
    }
}

/// Scriptable [`DeviceClient`]. Clones share state, so a test keeps one
/// clone to inspect the call log after handing another to the code under test.
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(self, profiles: Vec<Profile>) -> Self {
        self.state.lock().profiles = profiles;
        self
    }

    pub fn with_options(self, options: EncoderOptions) -> Self {
        self.state.lock().options = options;
        self
    }

    pub fn with_snapshot(self, bytes: impl Into<Bytes>) -> Self {
        self.state.lock().snapshot = bytes.into();
        self
    }

    pub fn with_imaging(self, settings: ImagingSettings) -> Self {
        self.state.lock().imaging = settings;
        self
    }

    /// `connect` to `host` fails.
    pub fn unreachable(self, host: &str) -> Self {
        self.state.lock().unreachable.insert(host.to_string());
        self
    }

    /// Snapshot downloads from `host` fail.
    pub fn failing_snapshots(self, host: &str) -> Self {
        self.state.lock().failing_snapshots.insert(host.to_string());
        self
    }

    /// Snapshot fetches from `host` panic the calling thread.
    pub fn panicking_snapshots(self, host: &str) -> Self {
        self.state.lock().panicking_snapshots.insert(host.to_string());
        self
    }

    /// The n-th PTZ move (0-based, counted across all sessions) fails.
    pub fn failing_moves(self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.state.lock().failing_moves.extend(indices);
        self
    }

    pub fn failing_status(self) -> Self {
        self.state.lock().failing_status = true;
        self
    }

    /// The next `polls` status polls report motion.
    pub fn busy_polls(self, polls: usize) -> Self {
        self.state.lock().busy_polls = polls;
        self
    }

    pub fn snapshot_delay(self, host: &str, delay: Duration) -> Self {
        self.state.lock().snapshot_delays.insert(host.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of logged calls for `operation`, across hosts.
    pub fn count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.split_once(' ').map(|(_, op)| op) == Some(operation))
            .count()
    }

    /// Hosts in the order their snapshot downloads started, with the instant.
    pub fn fetches(&self) -> Vec<(String, Instant)> {
        self.state.lock().fetches.clone()
    }

    /// Imaging settings as last written.
    pub fn imaging(&self) -> ImagingSettings {
        self.state.lock().imaging.clone()
    }
}

impl DeviceClient for FakeDevice {
    fn connect(&self, target: &CameraTarget) -> DeviceResult<(Box<dyn DeviceSession>, Vec<Profile>)> {
        let host = target.control_host.clone();
        let mut state = self.state.lock();
        state.calls.push(format!("{} connect", host));
        if state.unreachable.contains(&host) {
            return Err(DeviceError::new(format!("{} unreachable", host)));
        }
        let profiles = state.profiles.clone();
        drop(state);

        let session = FakeSession {
            host,
            state: Arc::clone(&self.state),
        };
        Ok((Box::new(session), profiles))
    }
}

struct FakeSession {
    host: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn log(&self, operation: &str) {
        self.state.lock().calls.push(format!("{} {}", self.host, operation));
    }
}

impl DeviceSession for FakeSession {
    fn encoder_options(&self, _profile: &Profile) -> DeviceResult<EncoderOptions> {
        self.log("encoder_options");
        Ok(self.state.lock().options.clone())
    }

    fn set_encoder_config(
        &self,
        profile: &Profile,
        resolution: Resolution,
        frame_rate: Option<u32>,
    ) -> DeviceResult<()> {
        self.log("set_encoder");
        let mut state = self.state.lock();
        let Some(stored) = state.profiles.iter_mut().find(|p| p.token == profile.token) else {
            return Err(DeviceError::new(format!("no profile {}", profile.token)));
        };
        if let Some(encoder) = stored.encoder.as_mut() {
            encoder.resolution = resolution;
            if let (Some(rc), Some(fps)) = (encoder.rate_control.as_mut(), frame_rate) {
                rc.frame_rate_limit = fps;
            }
        }
        Ok(())
    }

    fn snapshot_uri(&self, profile: &Profile) -> DeviceResult<String> {
        self.log("snapshot_uri");
        Ok(format!("http://{}/snapshot/{}", self.host, profile.token))
    }

    fn fetch_bytes(&self, _url: &str, _credentials: &Credentials) -> DeviceResult<Bytes> {
        self.log("fetch");
        let (delay, failing, panicking, bytes) = {
            let mut state = self.state.lock();
            state.fetches.push((self.host.clone(), Instant::now()));
            (
                state.snapshot_delays.get(&self.host).copied(),
                state.failing_snapshots.contains(&self.host),
                state.panicking_snapshots.contains(&self.host),
                state.snapshot.clone(),
            )
        };
        if panicking {
            panic!("{} fetch crashed", self.host);
        }
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if failing {
            return Err(DeviceError::new(format!("{} snapshot failed", self.host)));
        }
        Ok(bytes)
    }

    fn ptz_move(&self, _profile: &Profile, motion: &PtzMove) -> DeviceResult<()> {
        let kind = match motion {
            PtzMove::Continuous { .. } => "move:continuous",
            PtzMove::Absolute { .. } => "move:absolute",
            PtzMove::Relative { .. } => "move:relative",
        };
        self.log(kind);
        let mut state = self.state.lock();
        let index = state.moves;
        state.moves += 1;
        if state.failing_moves.contains(&index) {
            return Err(DeviceError::new(format!("move {} rejected", index)));
        }
        Ok(())
    }

    fn ptz_stop(&self, _profile: &Profile) -> DeviceResult<()> {
        self.log("stop");
        Ok(())
    }

    fn ptz_status(&self, _profile: &Profile) -> DeviceResult<MoveStatus> {
        self.log("status");
        let mut state = self.state.lock();
        if state.failing_status {
            return Err(DeviceError::new("status unavailable"));
        }
        if state.busy_polls > 0 {
            state.busy_polls -= 1;
            return Ok(MoveStatus {
                pan_tilt_idle: false,
                zoom_idle: true,
            });
        }
        Ok(MoveStatus {
            pan_tilt_idle: true,
            zoom_idle: true,
        })
    }

    fn goto_home(&self, _profile: &Profile) -> DeviceResult<()> {
        self.log("home");
        Ok(())
    }

    fn imaging_settings(&self, _source_token: &str) -> DeviceResult<ImagingSettings> {
        self.log("imaging_get");
        Ok(self.state.lock().imaging.clone())
    }

    fn set_imaging_settings(&self, _source_token: &str, settings: &ImagingSettings) -> DeviceResult<()> {
        self.log("imaging_set");
        self.state.lock().imaging = settings.clone();
        Ok(())
    }
}
