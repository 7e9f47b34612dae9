//! PTZ sequence definition files.
//!
//! ```toml
//! name = "Gate sweep"
//!
//! [[steps]]
//! name = "left"
//! delay_sec = 1.5
//! ptz = { type = "relative", pan = -0.2, speed_pan = 0.5 }
//!
//! [[steps]]
//! focus_mode = "manual"
//! focus_near_limit = 0.4
//! ptz = { type = "continuous", zoom = 0.3, duration_sec = 1.0 }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use ptzcam_core::{sanitize_name, Error, Result};
use ptzcam_device::{PtzMove, PtzVector};

/// Hold time of a continuous move without an explicit duration.
pub const DEFAULT_CONTINUOUS_HOLD: Duration = Duration::from_millis(500);

/// Estimated cost of a positioning move, in seconds.
const POSITION_MOVE_ESTIMATE: f64 = 1.0;
/// Per-step overhead added to every step that moves, in seconds.
const STEP_OVERHEAD_ESTIMATE: f64 = 0.2;

/// How a step moves the camera. Unrecognized types fall back to `Relative`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Relative,
    Absolute,
    Continuous,
}

impl From<&str> for MoveKind {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "absolute" => MoveKind::Absolute,
            "continuous" => MoveKind::Continuous,
            _ => MoveKind::Relative,
        }
    }
}

/// The `ptz` table of a step.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PtzSpec {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub pan: Option<f32>,
    pub tilt: Option<f32>,
    pub zoom: Option<f32>,
    pub speed_pan: Option<f32>,
    pub speed_tilt: Option<f32>,
    pub speed_zoom: Option<f32>,
    pub duration_sec: Option<f64>,
}

impl PtzSpec {
    pub fn move_kind(&self) -> MoveKind {
        self.kind.as_deref().map(MoveKind::from).unwrap_or(MoveKind::Relative)
    }

    fn vector(&self) -> PtzVector {
        PtzVector::from_axes(self.pan, self.tilt, self.zoom)
    }

    fn speed(&self) -> Option<PtzVector> {
        let speed = PtzVector::from_axes(self.speed_pan, self.speed_tilt, self.speed_zoom);
        (!speed.is_empty()).then_some(speed)
    }

    /// The device call for these axes, or `None` when no axis is given.
    pub fn to_move(&self) -> Option<PtzMove> {
        let vector = self.vector();
        if vector.is_empty() {
            return None;
        }
        Some(match self.move_kind() {
            MoveKind::Continuous => PtzMove::Continuous { velocity: vector },
            MoveKind::Absolute => PtzMove::Absolute {
                position: vector,
                speed: self.speed(),
            },
            MoveKind::Relative => PtzMove::Relative {
                translation: vector,
                speed: self.speed(),
            },
        })
    }

    /// How long a continuous move runs before it is stopped.
    pub fn hold(&self) -> Duration {
        self.duration_sec
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(DEFAULT_CONTINUOUS_HOLD)
    }
}

/// One scripted motion and capture.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PtzStep {
    pub name: Option<String>,
    pub delay_sec: Option<f64>,
    pub ptz: Option<PtzSpec>,
    pub focus_mode: Option<String>,
    pub focus_default_speed: Option<f32>,
    pub focus_near_limit: Option<f32>,
    pub focus_far_limit: Option<f32>,
}

impl PtzStep {
    /// File-safe name; `step_{n}` (1-based) when unnamed or unusable.
    pub fn file_name(&self, index: usize) -> String {
        let fallback = || format!("step_{}", index + 1);
        let raw = self.name.clone().unwrap_or_else(fallback);
        let safe = sanitize_name(&raw);
        if safe.is_empty() {
            fallback()
        } else {
            safe
        }
    }

    /// Post-move delay; negative or unparseable values mean none.
    pub fn delay(&self) -> Duration {
        self.delay_sec
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn has_focus_directives(&self) -> bool {
        self.focus_mode.is_some()
            || self.focus_default_speed.is_some()
            || self.focus_near_limit.is_some()
            || self.focus_far_limit.is_some()
    }

    /// Estimated wall time of this step, in seconds.
    pub fn estimated_secs(&self) -> f64 {
        let mut total = self.delay_sec.filter(|d| d.is_finite()).unwrap_or(0.0);
        if let Some(ptz) = &self.ptz {
            total += match ptz.move_kind() {
                MoveKind::Continuous => ptz.duration_sec.unwrap_or(0.5),
                _ => POSITION_MOVE_ESTIMATE,
            };
            total += STEP_OVERHEAD_ESTIMATE;
        }
        total
    }
}

/// A named, non-empty list of steps loaded from a `.toml` file.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDefinition {
    /// Sanitized; used as the output directory name.
    pub name: String,
    pub steps: Vec<PtzStep>,
}

#[derive(Deserialize)]
struct SequenceFile {
    name: Option<String>,
    steps: Option<Vec<PtzStep>>,
}

impl SequenceDefinition {
    /// Lower bound on one run, in seconds. Never negative.
    pub fn estimate_duration(&self) -> f64 {
        self.steps.iter().map(PtzStep::estimated_secs).sum::<f64>().max(0.0)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: SequenceFile = toml::from_str(text)
            .map_err(|e| Error::Config(format!("sequence file parse failed: {}", e.message())))?;

        let raw_name = file
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| Error::Config("sequence file missing name".to_string()))?;
        let name = sanitize_name(&raw_name);
        if name.is_empty() {
            return Err(Error::Config("sequence file invalid name".to_string()));
        }

        let steps = file
            .steps
            .filter(|steps| !steps.is_empty())
            .ok_or_else(|| Error::Config("sequence file missing steps".to_string()))?;

        for (index, step) in steps.iter().enumerate() {
            let durations = [
                ("delay_sec", step.delay_sec),
                ("duration_sec", step.ptz.as_ref().and_then(|ptz| ptz.duration_sec)),
            ];
            for (field, value) in durations {
                if let Some(secs) = value.filter(|secs| !secs.is_finite() || *secs < 0.0) {
                    return Err(Error::Config(format!(
                        "sequence step {} has invalid {} ({})",
                        index + 1,
                        field,
                        secs
                    )));
                }
            }
        }

        Ok(Self { name, steps })
    }
}

/// Reads and validates a sequence file. Every failure is a [`Error::Config`]
/// with its own message.
pub fn load_sequence(path: &Path) -> Result<SequenceDefinition> {
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if !is_toml {
        return Err(Error::Config("sequence file must be a .toml file".to_string()));
    }
    if !path.is_file() {
        return Err(Error::Config("sequence file not found".to_string()));
    }
    let text = fs::read_to_string(path)?;
    let sequence = SequenceDefinition::parse(&text)?;
    tracing::debug!(
        sequence = %sequence.name,
        steps = sequence.steps.len(),
        estimate = sequence.estimate_duration(),
        "sequence loaded"
    );
    Ok(sequence)
}
