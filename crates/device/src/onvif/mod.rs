//! ONVIF implementation of the device capability client.
//!
//! Speaks SOAP 1.2 to the device, media (ver10), PTZ (ver20) and imaging
//! (ver20) services. Service addresses come from `GetCapabilities`, falling
//! back to the conventional `/onvif/<service>` paths.

mod soap;
mod xml;

use std::fmt::Write as _;
use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::Client;
use tracing::{debug, info};

use ptzcam_core::{CameraTarget, Credentials, DeviceError, Resolution};

use crate::types::{EncoderConfig, ImagingSettings, MoveStatus, Profile, PtzMove, PtzVector};
use crate::{DeviceClient, DeviceResult, DeviceSession, EncoderOptions};
use soap::SoapTransport;
use xml::escape;

/// Network timeout of every device call. A hung device is bounded only by
/// this.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Production [`DeviceClient`] talking ONVIF over HTTP.
#[derive(Clone)]
pub struct OnvifClient {
    http: Client,
}

impl OnvifClient {
    pub fn new() -> DeviceResult<Self> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> DeviceResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            // Cameras ship self-signed certificates.
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DeviceError::new(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

impl DeviceClient for OnvifClient {
    fn connect(&self, target: &CameraTarget) -> DeviceResult<(Box<dyn DeviceSession>, Vec<Profile>)> {
        let base = format!("http://{}:{}", target.control_host, target.control_port);
        let device_url = format!("{}/onvif/device_service", base);
        let transport = SoapTransport::new(self.http.clone(), target.credentials.clone());

        let addrs = match transport
            .call(
                &device_url,
                "GetCapabilities",
                "<tds:GetCapabilities><tds:Category>All</tds:Category></tds:GetCapabilities>",
            )
            .and_then(|resp| xml::parse_capabilities(&resp))
        {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(camera = %target.control_host, error = %e, "GetCapabilities failed, using default service paths");
                xml::ServiceAddrs::default()
            }
        };

        let session = OnvifSession {
            media_url: addrs.media.unwrap_or_else(|| format!("{}/onvif/media_service", base)),
            ptz_url: addrs.ptz.unwrap_or_else(|| format!("{}/onvif/ptz_service", base)),
            imaging_url: addrs.imaging.unwrap_or_else(|| format!("{}/onvif/imaging_service", base)),
            transport,
        };

        let response = session
            .transport
            .call(&session.media_url, "GetProfiles", "<trt:GetProfiles/>")?;
        let profiles = xml::parse_profiles(&response)?;
        info!(camera = %target.control_host, profiles = profiles.len(), "ONVIF session opened");

        Ok((Box::new(session), profiles))
    }
}

struct OnvifSession {
    transport: SoapTransport,
    media_url: String,
    ptz_url: String,
    imaging_url: String,
}

impl DeviceSession for OnvifSession {
    fn encoder_options(&self, profile: &Profile) -> DeviceResult<EncoderOptions> {
        let body = format!(
            "<trt:GetVideoEncoderConfigurationOptions><trt:ProfileToken>{}</trt:ProfileToken></trt:GetVideoEncoderConfigurationOptions>",
            escape(&profile.token)
        );
        let response =
            self.transport
                .call(&self.media_url, "GetVideoEncoderConfigurationOptions", &body)?;
        xml::parse_encoder_options(&response)
    }

    fn set_encoder_config(
        &self,
        profile: &Profile,
        resolution: Resolution,
        frame_rate: Option<u32>,
    ) -> DeviceResult<()> {
        let mut config = profile.encoder.clone().ok_or_else(|| {
            DeviceError::new(format!("profile {} has no video encoder", profile.token))
        })?;
        config.resolution = resolution;
        if let (Some(rate_control), Some(fps)) = (config.rate_control.as_mut(), frame_rate) {
            rate_control.frame_rate_limit = fps;
        }

        let body = format!(
            "<trt:SetVideoEncoderConfiguration>{}<trt:ForcePersistence>true</trt:ForcePersistence></trt:SetVideoEncoderConfiguration>",
            encoder_config_xml(&config)
        );
        self.transport
            .call(&self.media_url, "SetVideoEncoderConfiguration", &body)?;
        info!(profile = %profile.token, resolution = %resolution, ?frame_rate, "encoder configured");
        Ok(())
    }

    fn snapshot_uri(&self, profile: &Profile) -> DeviceResult<String> {
        let body = format!(
            "<trt:GetSnapshotUri><trt:ProfileToken>{}</trt:ProfileToken></trt:GetSnapshotUri>",
            escape(&profile.token)
        );
        let response = self.transport.call(&self.media_url, "GetSnapshotUri", &body)?;
        xml::parse_snapshot_uri(&response)
    }

    fn fetch_bytes(&self, url: &str, credentials: &Credentials) -> DeviceResult<Bytes> {
        self.transport.get_bytes(url, credentials)
    }

    fn ptz_move(&self, profile: &Profile, motion: &PtzMove) -> DeviceResult<()> {
        let token = escape(&profile.token);
        let (action, body) = match motion {
            PtzMove::Continuous { velocity } => (
                "ContinuousMove",
                format!(
                    "<tptz:ContinuousMove><tptz:ProfileToken>{}</tptz:ProfileToken>{}</tptz:ContinuousMove>",
                    token,
                    vector_xml("Velocity", velocity)
                ),
            ),
            PtzMove::Absolute { position, speed } => (
                "AbsoluteMove",
                format!(
                    "<tptz:AbsoluteMove><tptz:ProfileToken>{}</tptz:ProfileToken>{}{}</tptz:AbsoluteMove>",
                    token,
                    vector_xml("Position", position),
                    speed.as_ref().map(|s| vector_xml("Speed", s)).unwrap_or_default()
                ),
            ),
            PtzMove::Relative { translation, speed } => (
                "RelativeMove",
                format!(
                    "<tptz:RelativeMove><tptz:ProfileToken>{}</tptz:ProfileToken>{}{}</tptz:RelativeMove>",
                    token,
                    vector_xml("Translation", translation),
                    speed.as_ref().map(|s| vector_xml("Speed", s)).unwrap_or_default()
                ),
            ),
        };
        self.transport.call(&self.ptz_url, action, &body)?;
        Ok(())
    }

    fn ptz_stop(&self, profile: &Profile) -> DeviceResult<()> {
        let body = format!(
            "<tptz:Stop><tptz:ProfileToken>{}</tptz:ProfileToken><tptz:PanTilt>true</tptz:PanTilt><tptz:Zoom>true</tptz:Zoom></tptz:Stop>",
            escape(&profile.token)
        );
        self.transport.call(&self.ptz_url, "Stop", &body)?;
        Ok(())
    }

    fn ptz_status(&self, profile: &Profile) -> DeviceResult<MoveStatus> {
        let body = format!(
            "<tptz:GetStatus><tptz:ProfileToken>{}</tptz:ProfileToken></tptz:GetStatus>",
            escape(&profile.token)
        );
        let response = self.transport.call(&self.ptz_url, "GetStatus", &body)?;
        xml::parse_move_status(&response)
    }

    fn goto_home(&self, profile: &Profile) -> DeviceResult<()> {
        let body = format!(
            "<tptz:GotoHomePosition><tptz:ProfileToken>{}</tptz:ProfileToken></tptz:GotoHomePosition>",
            escape(&profile.token)
        );
        self.transport.call(&self.ptz_url, "GotoHomePosition", &body)?;
        Ok(())
    }

    fn imaging_settings(&self, source_token: &str) -> DeviceResult<ImagingSettings> {
        let body = format!(
            "<timg:GetImagingSettings><timg:VideoSourceToken>{}</timg:VideoSourceToken></timg:GetImagingSettings>",
            escape(source_token)
        );
        let response = self
            .transport
            .call(&self.imaging_url, "GetImagingSettings", &body)?;
        xml::parse_imaging_settings(&response)
    }

    fn set_imaging_settings(&self, source_token: &str, settings: &ImagingSettings) -> DeviceResult<()> {
        let body = format!(
            "<timg:SetImagingSettings><timg:VideoSourceToken>{}</timg:VideoSourceToken><timg:ImagingSettings>{}</timg:ImagingSettings><timg:ForcePersistence>false</timg:ForcePersistence></timg:SetImagingSettings>",
            escape(source_token),
            imaging_settings_xml(settings)
        );
        self.transport
            .call(&self.imaging_url, "SetImagingSettings", &body)?;
        Ok(())
    }
}

fn vector_xml(element: &str, vector: &PtzVector) -> String {
    let mut out = format!("<tptz:{}>", element);
    if let Some((x, y)) = vector.pan_tilt {
        let _ = write!(out, r#"<tt:PanTilt x="{}" y="{}"/>"#, x, y);
    }
    if let Some(z) = vector.zoom {
        let _ = write!(out, r#"<tt:Zoom x="{}"/>"#, z);
    }
    let _ = write!(out, "</tptz:{}>", element);
    out
}

fn encoder_config_xml(config: &EncoderConfig) -> String {
    let mut out = format!(r#"<trt:Configuration token="{}">"#, escape(&config.token));
    let _ = write!(
        out,
        "<tt:Name>{}</tt:Name><tt:UseCount>{}</tt:UseCount><tt:Encoding>{}</tt:Encoding>",
        escape(&config.name),
        config.use_count,
        escape(&config.encoding)
    );
    let _ = write!(
        out,
        "<tt:Resolution><tt:Width>{}</tt:Width><tt:Height>{}</tt:Height></tt:Resolution><tt:Quality>{}</tt:Quality>",
        config.resolution.width, config.resolution.height, config.quality
    );
    if let Some(rc) = &config.rate_control {
        let _ = write!(
            out,
            "<tt:RateControl><tt:FrameRateLimit>{}</tt:FrameRateLimit><tt:EncodingInterval>{}</tt:EncodingInterval><tt:BitrateLimit>{}</tt:BitrateLimit></tt:RateControl>",
            rc.frame_rate_limit, rc.encoding_interval, rc.bitrate_limit
        );
    }
    if let Some(h264) = &config.h264 {
        let _ = write!(
            out,
            "<tt:H264><tt:GovLength>{}</tt:GovLength><tt:H264Profile>{}</tt:H264Profile></tt:H264>",
            h264.gov_length,
            escape(&h264.profile)
        );
    }
    let m = &config.multicast;
    let address_element = if m.address_type.eq_ignore_ascii_case("IPv6") {
        "IPv6Address"
    } else {
        "IPv4Address"
    };
    let _ = write!(
        out,
        "<tt:Multicast><tt:Address><tt:Type>{}</tt:Type><tt:{addr}>{}</tt:{addr}></tt:Address><tt:Port>{}</tt:Port><tt:TTL>{}</tt:TTL><tt:AutoStart>{}</tt:AutoStart></tt:Multicast>",
        escape(&m.address_type),
        escape(&m.address),
        m.port,
        m.ttl,
        m.auto_start,
        addr = address_element
    );
    let _ = write!(
        out,
        "<tt:SessionTimeout>{}</tt:SessionTimeout></trt:Configuration>",
        escape(&config.session_timeout)
    );
    out
}

fn imaging_settings_xml(settings: &ImagingSettings) -> String {
    let Some(focus) = &settings.focus else {
        return String::new();
    };
    let mut out = format!(
        "<tt:Focus><tt:AutoFocusMode>{}</tt:AutoFocusMode>",
        escape(&focus.auto_focus_mode)
    );
    if let Some(speed) = focus.default_speed {
        let _ = write!(out, "<tt:DefaultSpeed>{}</tt:DefaultSpeed>", speed);
    }
    if let Some(near) = focus.near_limit {
        let _ = write!(out, "<tt:NearLimit>{}</tt:NearLimit>", near);
    }
    if let Some(far) = focus.far_limit {
        let _ = write!(out, "<tt:FarLimit>{}</tt:FarLimit>", far);
    }
    out.push_str("</tt:Focus>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FocusSettings, Multicast, RateControl};

    #[test]
    fn test_vector_xml() {
        let v = PtzVector::from_axes(Some(0.5), None, Some(-0.25));
        assert_eq!(
            vector_xml("Translation", &v),
            r#"<tptz:Translation><tt:PanTilt x="0.5" y="0"/><tt:Zoom x="-0.25"/></tptz:Translation>"#
        );
        let zoom_only = PtzVector::from_axes(None, None, Some(1.0));
        assert_eq!(
            vector_xml("Speed", &zoom_only),
            r#"<tptz:Speed><tt:Zoom x="1"/></tptz:Speed>"#
        );
    }

    #[test]
    fn test_encoder_config_xml_round_trips_through_parser() {
        let config = EncoderConfig {
            token: "enc_1".into(),
            name: "VideoEncoder_1".into(),
            use_count: 1,
            encoding: "H264".into(),
            resolution: Resolution::new(2560, 1440),
            quality: 4.0,
            rate_control: Some(RateControl {
                frame_rate_limit: 20,
                encoding_interval: 1,
                bitrate_limit: 6144,
            }),
            h264: None,
            multicast: Multicast::default(),
            session_timeout: "PT60S".into(),
        };
        let body = format!(
            r#"<trt:GetProfilesResponse xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema"><trt:Profiles token="p"><tt:VideoEncoderConfiguration token="enc_1">{}</tt:VideoEncoderConfiguration></trt:Profiles></trt:GetProfilesResponse>"#,
            encoder_config_xml(&config)
                .trim_start_matches(r#"<trt:Configuration token="enc_1">"#)
                .trim_end_matches("</trt:Configuration>")
        );
        let profiles = xml::parse_profiles(&body).unwrap();
        let parsed = profiles[0].encoder.clone().unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_imaging_settings_xml() {
        let settings = ImagingSettings {
            focus: Some(FocusSettings {
                auto_focus_mode: "MANUAL".into(),
                default_speed: Some(0.5),
                near_limit: None,
                far_limit: Some(10.0),
            }),
        };
        assert_eq!(
            imaging_settings_xml(&settings),
            "<tt:Focus><tt:AutoFocusMode>MANUAL</tt:AutoFocusMode><tt:DefaultSpeed>0.5</tt:DefaultSpeed><tt:FarLimit>10</tt:FarLimit></tt:Focus>"
        );
        assert!(imaging_settings_xml(&ImagingSettings::default()).is_empty());
    }

    #[test]
    fn test_client_builds() {
        assert!(OnvifClient::new().is_ok());
    }
}
