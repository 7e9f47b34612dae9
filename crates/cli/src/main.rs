//! `ptzcam`: headless front end for the capture engine.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use ptzcam_capture::{FfmpegOpener, LiveView};
use ptzcam_core::{join_with_timeout, CameraTarget, Credentials, Resolution, Status, StatusSink, StreamType};
use ptzcam_device::{verify_credentials, DeviceClient, OnvifClient};
use ptzcam_orchestrator::{
    apply_encoder, encoder_choices, goto_home, load_sequence, AutoCapture, AutoCaptureSession,
    CaptureDispatcher, CaptureJob, ManualOutcome, PtzSequenceController, RepeatJob, SequenceJob,
    SnapshotJob, SnapshotOrchestrator, SHUTDOWN_TIMEOUT,
};

use crate::config::AppConfig;

const STATUS_CAPACITY: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "ptzcam")]
#[command(about = "Capture stills from networked PTZ cameras", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Camera password
    #[arg(long, global = true, env = "PTZCAM_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify credentials against every ONVIF host
    Check,

    /// Stream all cameras and report frame arrival
    Live {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Alternate between main and sub stream selection every SECS seconds
        #[arg(long, value_name = "SECS")]
        switch_every: Option<u64>,
    },

    /// List encoder options per camera
    Options,

    /// Change resolution and frame rate of one camera
    Apply {
        /// Camera number (1-based)
        #[arg(long)]
        camera: usize,

        /// Resolution as WIDTHxHEIGHT
        #[arg(long)]
        resolution: Resolution,

        /// Frame rate limit
        #[arg(long)]
        fps: u32,
    },

    /// Move the first ONVIF camera to its home position
    Home,

    /// Take one capture now
    Snapshot {
        #[command(flatten)]
        capture: CaptureArgs,
    },

    /// Capture repeatedly until the count is reached or Ctrl-C
    Auto {
        /// Seconds between capture starts
        #[arg(long)]
        period: u64,

        /// Stop after this many captures
        #[arg(long)]
        max: Option<u64>,

        #[command(flatten)]
        capture: CaptureArgs,
    },
}

#[derive(clap::Args)]
struct CaptureArgs {
    /// PTZ sequence file (.toml)
    #[arg(long)]
    sequence: Option<PathBuf>,

    /// Cameras to capture, 1-based (e.g. 1,3)
    #[arg(long, value_delimiter = ',')]
    cameras: Vec<usize>,

    /// Output directory (default: app.save_dir)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Stream whose profile is captured (main or sub)
    #[arg(long)]
    stream: Option<StreamType>,

    /// Output size of one camera's sub-stream capture, as N=WIDTHxHEIGHT
    /// (repeatable)
    #[arg(long = "resolution", value_name = "N=WxH", value_parser = parse_camera_resolution)]
    resolutions: Vec<(usize, Resolution)>,
}

/// Parses `N=WIDTHxHEIGHT` with a 1-based camera number.
fn parse_camera_resolution(s: &str) -> std::result::Result<(usize, Resolution), String> {
    let (camera, size) = s
        .split_once('=')
        .ok_or_else(|| format!("expected N=WIDTHxHEIGHT, got '{}'", s))?;
    let camera: usize = camera
        .trim()
        .parse()
        .map_err(|_| format!("invalid camera number '{}'", camera))?;
    if camera == 0 {
        return Err("camera numbers start at 1".to_string());
    }
    let resolution: Resolution = size.parse().map_err(|e: ptzcam_core::Error| e.to_string())?;
    Ok((camera, resolution))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    let client: Arc<dyn DeviceClient> = Arc::new(OnvifClient::new()?);

    let (status, rx) = StatusSink::channel(STATUS_CAPACITY);
    let printer = spawn_status_printer(rx)?;

    let app = App {
        config,
        client,
        password: cli.password,
        status,
    };
    let result = app.run(cli.command);

    drop(app);
    if join_with_timeout(printer, Duration::from_secs(1)).is_err() {
        debug!("status printer still draining");
    }
    result
}

/// Prints every status update on stdout until all senders are gone.
fn spawn_status_printer(mut rx: mpsc::Receiver<Status>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("status".to_string())
        .spawn(move || {
            while let Some(status) = rx.blocking_recv() {
                println!("{}", status);
            }
        })?;
    Ok(handle)
}

/// Sets the returned flag on Ctrl-C.
fn stop_on_ctrlc() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(stop)
}

/// Converts 1-based camera numbers to indices.
fn camera_indices(numbers: &[usize]) -> Result<Vec<usize>> {
    numbers
        .iter()
        .map(|&n| match n {
            0 => bail!("camera numbers start at 1"),
            n => Ok(n - 1),
        })
        .collect()
}

struct App {
    config: AppConfig,
    client: Arc<dyn DeviceClient>,
    password: Option<String>,
    status: StatusSink,
}

impl App {
    fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Check => self.check(),
            Commands::Live {
                seconds,
                switch_every,
            } => self.live(
                seconds.map(Duration::from_secs),
                switch_every.map(Duration::from_secs),
            ),
            Commands::Options => self.options(),
            Commands::Apply {
                camera,
                resolution,
                fps,
            } => self.apply(camera, resolution, fps),
            Commands::Home => {
                let credentials = self.unlock()?;
                let target = self.first_onvif_target(&credentials)?;
                goto_home(self.client.as_ref(), &target, &self.status)?;
                Ok(())
            }
            Commands::Snapshot { capture } => self.snapshot(capture),
            Commands::Auto {
                period,
                max,
                capture,
            } => self.auto(period, max, capture),
        }
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .filter(|p| !p.is_empty())
            .context("password required (--password or PTZCAM_PASSWORD)")
    }

    /// Verifies the password against the first ONVIF host and returns
    /// credentials shared by every target built afterwards.
    ///
    /// Without ONVIF hosts the app unlocks directly.
    fn unlock(&self) -> Result<Credentials> {
        let credentials = Credentials::new(&self.config.camera.username);
        if !self.config.uses_onvif() {
            if let Some(password) = self.password.as_deref() {
                credentials.set_password(password);
            }
            self.status.report(Status::Unlocked);
            return Ok(credentials);
        }

        self.status.report(Status::Locked);
        let password = self.password()?;
        let candidate = Credentials::with_password(&self.config.camera.username, password);
        let target = self.first_onvif_target(&candidate)?;
        if let Err(e) = verify_credentials(self.client.as_ref(), &target) {
            self.status.report(Status::InvalidPassword);
            bail!("credentials rejected by {}: {}", target.control_host, e);
        }
        credentials.set_password(password);
        self.status.report(Status::Unlocked);
        Ok(credentials)
    }

    fn first_onvif_target(&self, credentials: &Credentials) -> Result<CameraTarget> {
        self.config
            .onvif_targets(credentials)?
            .into_iter()
            .next()
            .context("no ONVIF host configured")
    }

    fn check(&self) -> Result<()> {
        let credentials = Credentials::with_password(&self.config.camera.username, self.password()?);
        let targets = self.config.onvif_targets(&credentials)?;
        if targets.is_empty() {
            bail!("no ONVIF host configured");
        }

        let mut failures = 0;
        for target in &targets {
            match verify_credentials(self.client.as_ref(), target) {
                Ok(profiles) => println!("ONVIF OK {} ({} profiles)", target.control_host, profiles),
                Err(e) => {
                    failures += 1;
                    println!(
                        "ONVIF failed: {} (onvif {}:{})",
                        e, target.control_host, target.control_port
                    );
                }
            }
        }
        if failures > 0 {
            bail!("{} of {} hosts failed", failures, targets.len());
        }
        Ok(())
    }

    fn start_live(&self, credentials: &Credentials) -> Result<LiveView> {
        let targets = self.config.live_targets(credentials)?;
        if targets.is_empty() {
            bail!("no camera configured (camera.ips)");
        }
        let mut live = LiveView::new(targets, Arc::new(FfmpegOpener::default()), self.status.clone());
        live.start();
        Ok(live)
    }

    fn live(&self, duration: Option<Duration>, switch_every: Option<Duration>) -> Result<()> {
        let credentials = self.unlock()?;
        if self.config.uses_onvif() {
            let target = self.first_onvif_target(&credentials)?;
            // Home on start is best effort.
            if let Err(e) = goto_home(self.client.as_ref(), &target, &self.status) {
                warn!(error = %e, "go home on start failed");
            }
        }

        let stop = stop_on_ctrlc()?;
        let mut live = self.start_live(&credentials)?;
        let deadline = duration.map(|d| Instant::now() + d);
        let mut frames = vec![0usize; live.len()];
        let mut revealed = false;
        let mut stream_type = self.config.stream_type()?;
        let mut next_switch = switch_every.map(|every| (Instant::now() + every, every));

        while !stop.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
            if live.poll() > 0 {
                for (idx, count) in frames.iter_mut().enumerate() {
                    if let Some(frame) = live.latest_frame(idx) {
                        if frame.sequence != *count {
                            *count = frame.sequence;
                            debug!(camera = idx + 1, sequence = frame.sequence, bytes = frame.data.len(), "frame");
                        }
                    }
                }
            }
            if let Some((at, every)) = next_switch {
                if Instant::now() >= at {
                    stream_type = match stream_type {
                        StreamType::Main => StreamType::Sub,
                        StreamType::Sub => StreamType::Main,
                    };
                    info!(stream = %stream_type, "switching stream selection");
                    live.switch_stream(stream_type);
                    frames.iter_mut().for_each(|count| *count = 0);
                    revealed = false;
                    next_switch = Some((at + every, every));
                }
            }
            if !revealed && live.all_ready() {
                revealed = true;
                info!(cameras = live.len(), "all cameras delivering frames");
            }
            thread::sleep(POLL_INTERVAL);
        }

        live.stop();
        for (idx, count) in frames.iter().enumerate() {
            info!(camera = idx + 1, last_sequence = count, "stream closed");
        }
        Ok(())
    }

    fn options(&self) -> Result<()> {
        let credentials = self.unlock()?;
        let stream_type = self.config.stream_type()?;
        for (idx, target) in self.config.onvif_targets(&credentials)?.iter().enumerate() {
            match encoder_choices(self.client.as_ref(), target, stream_type, &self.config.manual.fps) {
                Ok(choices) => {
                    let resolutions: Vec<String> = choices.resolutions.iter().map(Resolution::to_string).collect();
                    let current = choices
                        .current_resolution
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!("Camera {} ({})", idx + 1, target.control_host);
                    println!("  encoding:    {}", choices.encoding);
                    println!("  resolutions: {}", resolutions.join(", "));
                    println!("  frame rates: {:?}", choices.frame_rates);
                    println!(
                        "  current:     {} @ {}",
                        current,
                        choices.current_frame_rate.map_or("-".to_string(), |f| f.to_string())
                    );
                }
                Err(e) => {
                    warn!(camera = %target.control_host, error = %e, "encoder options unavailable");
                    self.status.report(Status::DeviceError(e.reason()));
                }
            }
        }
        Ok(())
    }

    fn apply(&self, camera: usize, resolution: Resolution, fps: u32) -> Result<()> {
        let credentials = self.unlock()?;
        let index = camera_indices(&[camera])?[0];
        let targets = self.config.onvif_targets(&credentials)?;
        let target = targets
            .get(index)
            .with_context(|| format!("camera {} is not configured", camera))?;
        apply_encoder(
            self.client.as_ref(),
            target,
            self.config.stream_type()?,
            resolution,
            fps,
            &self.status,
        )?;
        Ok(())
    }

    fn capture_job(&self, credentials: &Credentials, args: &CaptureArgs) -> Result<CaptureJob> {
        let destination = args.dir.clone().unwrap_or_else(|| self.config.app.save_dir.clone());
        let stream_type = match args.stream {
            Some(stream_type) => stream_type,
            None => self.config.stream_type()?,
        };
        let mut job = CaptureJob::new(self.config.onvif_targets(credentials)?, destination)
            .with_stream_type(stream_type);
        if !args.cameras.is_empty() {
            job = job.select(camera_indices(&args.cameras)?);
        }
        for &(camera, resolution) in &args.resolutions {
            job = job.with_resolution(camera - 1, resolution);
        }
        Ok(job)
    }

    fn snapshot(&self, args: CaptureArgs) -> Result<()> {
        let credentials = self.unlock()?;
        let sequence = args.sequence.as_deref().map(load_sequence).transpose()?;
        let job = self.capture_job(&credentials, &args)?;
        let dispatcher = CaptureDispatcher::new(Arc::clone(&self.client), self.status.clone());

        let outcome = if self.config.uses_onvif() {
            dispatcher.snapshot(&job, sequence.as_ref(), None)?
        } else {
            let mut live = self.start_live(&credentials)?;
            wait_for_first_frame(&mut live)?;
            let outcome = dispatcher.snapshot(&job, sequence.as_ref(), Some(&live));
            live.stop();
            outcome?
        };

        match outcome {
            ManualOutcome::Sequence(report) => {
                print_paths(&report.captured);
                for (step, reason) in &report.failed_steps {
                    println!("step {} failed: {}", step, reason);
                }
            }
            ManualOutcome::Batch(report) => {
                for (idx, path) in &report.saved {
                    println!("Camera {}: {}", idx + 1, path.display());
                }
                for (_, reason) in &report.failed {
                    println!("{}", reason);
                }
                for idx in &report.unfinished {
                    println!("Camera {} did not finish", idx + 1);
                }
                if !report.synchronized {
                    warn!("cameras did not reach the capture barrier together");
                }
            }
            ManualOutcome::Frame(path) => print_paths(&[path]),
        }
        Ok(())
    }

    fn auto(&self, period: u64, max: Option<u64>, args: CaptureArgs) -> Result<()> {
        if !self.config.uses_onvif() {
            bail!("auto capture needs at least one ONVIF host");
        }
        let credentials = self.unlock()?;
        let job = self.capture_job(&credentials, &args)?;

        let repeat: Box<dyn RepeatJob> = match args.sequence.as_deref() {
            Some(path) => {
                let sequence = load_sequence(path)?;
                let target = job.cameras.first().cloned().context("no ONVIF host configured")?;
                info!(sequence = %sequence.name, estimate_secs = sequence.estimate_duration(), "auto sequence");
                Box::new(SequenceJob::new(
                    PtzSequenceController::new(Arc::clone(&self.client), self.status.clone()),
                    target,
                    sequence,
                    job.stream_type,
                    job.destination.clone(),
                    self.status.clone(),
                ))
            }
            None => {
                let orchestrator = SnapshotOrchestrator::new(Arc::clone(&self.client), self.status.clone());
                Box::new(SnapshotJob::new(orchestrator, job))
            }
        };

        let stop = stop_on_ctrlc()?;
        let mut auto = AutoCapture::new(self.status.clone());
        auto.start(AutoCaptureSession::new(period, repeat).with_max_count(max))?;

        while auto.is_running() {
            if stop.load(Ordering::SeqCst) {
                auto.stop();
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        match auto.join(SHUTDOWN_TIMEOUT) {
            Some(count) => info!(count, "auto capture finished"),
            None => warn!("auto capture did not finish in time"),
        }
        Ok(())
    }
}

/// Polls until camera 1 has a frame, so there is something to save.
fn wait_for_first_frame(live: &mut LiveView) -> Result<()> {
    let deadline = Instant::now() + FIRST_FRAME_TIMEOUT;
    while live.latest_frame(0).is_none() {
        if Instant::now() >= deadline {
            bail!("no frame from camera 1 within {:?}", FIRST_FRAME_TIMEOUT);
        }
        live.poll();
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

fn print_paths(paths: &[PathBuf]) {
    for path in paths {
        println!("{}", path.display());
    }
}
