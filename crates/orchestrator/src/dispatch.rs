//! The manual "capture now" action: picks a PTZ sequence, a synchronized
//! batch, or the latest live frame depending on what is configured.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use ptzcam_capture::LiveView;
use ptzcam_core::{capture_timestamp, Error, Result, Status, StatusSink};
use ptzcam_device::DeviceClient;

use crate::ptz::{PtzSequenceController, SequenceReport};
use crate::sequence::SequenceDefinition;
use crate::snapshot::{BatchReport, CaptureJob, SnapshotOrchestrator};

/// What a manual capture turned into.
#[derive(Debug)]
pub enum ManualOutcome {
    Sequence(SequenceReport),
    Batch(BatchReport),
    Frame(PathBuf),
}

/// Single entry point for the "take a picture now" action.
pub struct CaptureDispatcher {
    orchestrator: SnapshotOrchestrator,
    controller: PtzSequenceController,
    status: StatusSink,
}

impl CaptureDispatcher {
    pub fn new(client: Arc<dyn DeviceClient>, status: StatusSink) -> Self {
        Self {
            orchestrator: SnapshotOrchestrator::new(Arc::clone(&client), status.clone()),
            controller: PtzSequenceController::new(client, status.clone()),
            status,
        }
    }

    /// Picks the capture path from what is configured.
    ///
    /// `job.cameras` are the device-control targets; when there are none the
    /// latest live frame of the first camera is saved instead. A sequence is
    /// only used together with device control, and runs against the first
    /// target into `{destination}/{sequence name}`.
    pub fn snapshot(
        &self,
        job: &CaptureJob,
        sequence: Option<&SequenceDefinition>,
        live: Option<&LiveView>,
    ) -> Result<ManualOutcome> {
        if !job.destination.is_dir() {
            self.status.report(Status::SelectFolder);
            return Err(Error::Config(Status::SelectFolder.to_string()));
        }
        let timestamp = capture_timestamp();

        match (job.cameras.first(), sequence) {
            (Some(target), Some(sequence)) => {
                let dir = job.destination.join(&sequence.name);
                fs::create_dir_all(&dir)?;
                info!(sequence = %sequence.name, "manual sequence capture");
                self.controller
                    .run(target, sequence, job.stream_type, &dir, &timestamp)
                    .map(ManualOutcome::Sequence)
            }
            (Some(_), None) => self.orchestrator.run(job, &timestamp).map(ManualOutcome::Batch),
            (None, _) => {
                let live = live.ok_or_else(|| Error::Capture {
                    camera: 1,
                    reason: "live view not running".to_string(),
                })?;
                live.save_latest(0, &job.destination, &timestamp)
                    .map(ManualOutcome::Frame)
            }
        }
    }
}
