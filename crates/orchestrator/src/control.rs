//! One-shot device operations: encoder listing and tuning, go home.

use tracing::info;

use ptzcam_core::{CameraTarget, DeviceError, Resolution, Result, Status, StatusSink, StreamType};
use ptzcam_device::{select_profile, DeviceClient};

/// What a camera's selected profile can be switched to, and what it runs now.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderChoices {
    pub encoding: String,
    pub resolutions: Vec<Resolution>,
    pub frame_rates: Vec<u32>,
    pub current_resolution: Option<Resolution>,
    pub current_frame_rate: Option<u32>,
}

/// Lists encoder options of the profile picked for `stream_type`.
///
/// `manual_fps`, when not empty, replaces the advertised frame-rate range.
pub fn encoder_choices(
    client: &dyn DeviceClient,
    target: &CameraTarget,
    stream_type: StreamType,
    manual_fps: &[u32],
) -> Result<EncoderChoices> {
    let (session, profiles) = client.connect(target)?;
    let profile = select_profile(&profiles, stream_type)
        .ok_or_else(|| DeviceError::new("ONVIF profile not found"))?;
    let options = session.encoder_options(profile)?;

    let frame_rates = if manual_fps.is_empty() {
        options.frame_rates()
    } else {
        manual_fps.to_vec()
    };
    let current = profile.encoder.as_ref();

    Ok(EncoderChoices {
        encoding: options.encoding,
        resolutions: options.resolutions,
        frame_rates,
        current_resolution: current.map(|e| e.resolution),
        current_frame_rate: current
            .and_then(|e| e.rate_control.as_ref())
            .map(|rc| rc.frame_rate_limit),
    })
}

/// Writes resolution and frame-rate limit to the profile picked for
/// `stream_type`, persisted on the device.
pub fn apply_encoder(
    client: &dyn DeviceClient,
    target: &CameraTarget,
    stream_type: StreamType,
    resolution: Resolution,
    fps: u32,
    status: &StatusSink,
) -> Result<()> {
    let result = (|| -> Result<()> {
        let (session, profiles) = client.connect(target)?;
        let profile = select_profile(&profiles, stream_type)
            .ok_or_else(|| DeviceError::new("ONVIF profile not found"))?;
        session.set_encoder_config(profile, resolution, Some(fps))?;
        Ok(())
    })();

    match &result {
        Ok(()) => {
            info!(camera = %target.control_host, %resolution, fps, "encoder applied");
            status.report(Status::Applied(target.control_host.clone()));
        }
        Err(e) => status.report(Status::DeviceError(e.reason())),
    }
    result
}

/// Sends the camera to its home position using its first profile.
pub fn goto_home(client: &dyn DeviceClient, target: &CameraTarget, status: &StatusSink) -> Result<()> {
    let result = (|| -> Result<()> {
        let (session, profiles) = client.connect(target)?;
        let profile = profiles
            .first()
            .ok_or_else(|| DeviceError::new("ONVIF profile not found"))?;
        session.goto_home(profile)?;
        Ok(())
    })();

    match &result {
        Ok(()) => status.report(Status::MovedHome),
        Err(e) => status.report(Status::HomeFailed(e.reason())),
    }
    result
}
