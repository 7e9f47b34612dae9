use ptzcam_core::Resolution;

/// A media profile advertised by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub token: String,
    pub name: String,
    /// Token of the physical video source, used for imaging calls.
    pub video_source_token: Option<String>,
    pub encoder: Option<EncoderConfig>,
}

impl Profile {
    pub fn resolution(&self) -> Option<Resolution> {
        self.encoder.as_ref().map(|encoder| encoder.resolution)
    }

    /// Encoded pixel area, 0 when the profile has no encoder.
    pub fn area(&self) -> u64 {
        self.resolution().map(|r| r.area()).unwrap_or(0)
    }
}

/// Current video encoder configuration of a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub token: String,
    pub name: String,
    pub use_count: u32,
    pub encoding: String,
    pub resolution: Resolution,
    pub quality: f32,
    pub rate_control: Option<RateControl>,
    pub h264: Option<H264Config>,
    pub multicast: Multicast,
    pub session_timeout: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateControl {
    pub frame_rate_limit: u32,
    pub encoding_interval: u32,
    pub bitrate_limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct H264Config {
    pub gov_length: u32,
    pub profile: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Multicast {
    pub address_type: String,
    pub address: String,
    pub port: u16,
    pub ttl: u32,
    pub auto_start: bool,
}

impl Default for Multicast {
    fn default() -> Self {
        Self {
            address_type: "IPv4".to_string(),
            address: "0.0.0.0".to_string(),
            port: 0,
            ttl: 1,
            auto_start: false,
        }
    }
}

/// Encoder choices a profile accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderOptions {
    pub encoding: String,
    pub resolutions: Vec<Resolution>,
    /// Inclusive `(min, max)` frame-rate limits.
    pub frame_rate_range: Option<(u32, u32)>,
}

impl EncoderOptions {
    /// Largest advertised resolution by area.
    pub fn best_resolution(&self) -> Option<Resolution> {
        self.resolutions.iter().copied().max_by_key(Resolution::area)
    }

    pub fn max_frame_rate(&self) -> Option<u32> {
        self.frame_rate_range.map(|(_, max)| max)
    }

    /// Every integer frame rate in the advertised range.
    pub fn frame_rates(&self) -> Vec<u32> {
        match self.frame_rate_range {
            Some((min, max)) if min <= max => (min..=max).collect(),
            _ => Vec::new(),
        }
    }
}

/// Pan/tilt and zoom components, normalized axes as the device defines them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PtzVector {
    pub pan_tilt: Option<(f32, f32)>,
    pub zoom: Option<f32>,
}

impl PtzVector {
    /// Builds a vector from optional axes. Pan/tilt is present when either
    /// axis is given, the missing one defaulting to 0.
    pub fn from_axes(pan: Option<f32>, tilt: Option<f32>, zoom: Option<f32>) -> Self {
        let pan_tilt = match (pan, tilt) {
            (None, None) => None,
            (pan, tilt) => Some((pan.unwrap_or(0.0), tilt.unwrap_or(0.0))),
        };
        Self { pan_tilt, zoom }
    }

    pub fn is_empty(&self) -> bool {
        self.pan_tilt.is_none() && self.zoom.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PtzMove {
    /// Velocity motion; runs until stopped.
    Continuous { velocity: PtzVector },
    Absolute {
        position: PtzVector,
        speed: Option<PtzVector>,
    },
    Relative {
        translation: PtzVector,
        speed: Option<PtzVector>,
    },
}

/// Motion state reported by a status poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveStatus {
    pub pan_tilt_idle: bool,
    pub zoom_idle: bool,
}

impl MoveStatus {
    pub fn is_idle(&self) -> bool {
        self.pan_tilt_idle && self.zoom_idle
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FocusSettings {
    /// `AUTO` or `MANUAL`.
    pub auto_focus_mode: String,
    pub default_speed: Option<f32>,
    pub near_limit: Option<f32>,
    pub far_limit: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagingSettings {
    pub focus: Option<FocusSettings>,
}
