//! Device capability client: the boundary between the capture engine and
//! the camera control protocol.
//!
//! [`DeviceClient::connect`] opens a [`DeviceSession`] that is used by one
//! task only; sessions are never pooled or shared. Every call is blocking
//! and may fail with a [`DeviceError`]; callers decide whether that failure
//! ends the step, the camera, or the whole operation.

mod digest;
mod onvif;
mod types;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use onvif::{OnvifClient, REQUEST_TIMEOUT};
pub use ptzcam_core::DeviceError;
pub use types::*;

use bytes::Bytes;
use ptzcam_core::{CameraTarget, Credentials, Resolution, StreamType};

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

pub trait DeviceClient: Send + Sync {
    /// Opens a session and lists the device's media profiles.
    fn connect(&self, target: &CameraTarget) -> DeviceResult<(Box<dyn DeviceSession>, Vec<Profile>)>;
}

pub trait DeviceSession: Send {
    fn encoder_options(&self, profile: &Profile) -> DeviceResult<EncoderOptions>;

    /// Writes the profile's encoder configuration with a new resolution and,
    /// when the profile has rate control, a new frame-rate limit.
    fn set_encoder_config(
        &self,
        profile: &Profile,
        resolution: Resolution,
        frame_rate: Option<u32>,
    ) -> DeviceResult<()>;

    fn snapshot_uri(&self, profile: &Profile) -> DeviceResult<String>;

    fn fetch_bytes(&self, url: &str, credentials: &Credentials) -> DeviceResult<Bytes>;

    fn ptz_move(&self, profile: &Profile, motion: &PtzMove) -> DeviceResult<()>;

    /// Stops both pan/tilt and zoom.
    fn ptz_stop(&self, profile: &Profile) -> DeviceResult<()>;

    fn ptz_status(&self, profile: &Profile) -> DeviceResult<MoveStatus>;

    fn goto_home(&self, profile: &Profile) -> DeviceResult<()>;

    fn imaging_settings(&self, source_token: &str) -> DeviceResult<ImagingSettings>;

    fn set_imaging_settings(&self, source_token: &str, settings: &ImagingSettings) -> DeviceResult<()>;
}

/// Picks the profile for a stream type.
///
/// Profiles are ranked by encoded area: `Main` takes the largest, `Sub` the
/// smallest. A single profile is returned unchanged.
pub fn select_profile(profiles: &[Profile], stream_type: StreamType) -> Option<&Profile> {
    if profiles.len() == 1 {
        return profiles.first();
    }
    match stream_type {
        // Ties resolve like a stable ascending sort: last for max, first for min.
        StreamType::Main => profiles.iter().max_by_key(|p| p.area()),
        StreamType::Sub => profiles.iter().min_by_key(|p| p.area()),
    }
}

/// Connects and lists profiles; success means the credentials work.
pub fn verify_credentials(client: &dyn DeviceClient, target: &CameraTarget) -> DeviceResult<usize> {
    let (_session, profiles) = client.connect(target)?;
    tracing::debug!(camera = %target.control_host, profiles = profiles.len(), "credentials accepted");
    Ok(profiles.len())
}
