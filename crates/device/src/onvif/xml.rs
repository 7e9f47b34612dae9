//! Response parsing for the ONVIF operations we use. Elements are matched by
//! local name, so vendor namespace prefixes do not matter.

use roxmltree::{Document, Node};

use ptzcam_core::{DeviceError, Resolution};

use crate::types::{
    EncoderConfig, EncoderOptions, FocusSettings, H264Config, ImagingSettings, MoveStatus,
    Multicast, Profile, RateControl,
};
use crate::DeviceResult;

/// Service endpoints announced by `GetCapabilities`.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ServiceAddrs {
    pub media: Option<String>,
    pub ptz: Option<String>,
    pub imaging: Option<String>,
}

fn parse(xml: &str) -> DeviceResult<Document<'_>> {
    Document::parse(xml).map_err(|e| DeviceError::new(format!("malformed response: {}", e)))
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn children<'a, 'i: 'a>(node: Node<'a, 'i>, name: &'a str) -> impl Iterator<Item = Node<'a, 'i>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn descendant<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|n| n.text()).map(str::trim)
}

fn number<T: std::str::FromStr>(node: Node<'_, '_>, name: &str) -> Option<T> {
    text(node, name)?.parse().ok()
}

/// Parses a float the way devices print them (`3.000000`) and truncates.
fn integer(node: Node<'_, '_>, name: &str) -> Option<u32> {
    text(node, name)?.parse::<f64>().ok().map(|v| v.max(0.0) as u32)
}

fn resolution(node: Node<'_, '_>) -> Option<Resolution> {
    Some(Resolution::new(integer(node, "Width")?, integer(node, "Height")?))
}

fn body<'a, 'i>(doc: &'a Document<'i>, response: &str) -> DeviceResult<Node<'a, 'i>> {
    descendant(doc.root_element(), response)
        .ok_or_else(|| DeviceError::new(format!("{} missing from response", response)))
}

/// Reason text of a SOAP fault, if the document is one.
pub(crate) fn fault_reason(xml: &str) -> Option<String> {
    let doc = Document::parse(xml).ok()?;
    let fault = descendant(doc.root_element(), "Fault")?;
    let reason = descendant(fault, "Text")
        .or_else(|| descendant(fault, "faultstring"))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| {
            descendant(fault, "Value")
                .and_then(|n| n.text())
                .map(|t| t.trim().to_string())
        });
    Some(reason.unwrap_or_else(|| "unknown fault".to_string()))
}

pub(crate) fn parse_capabilities(xml: &str) -> DeviceResult<ServiceAddrs> {
    let doc = parse(xml)?;
    let caps = body(&doc, "Capabilities")?;
    let xaddr = |name: &str| {
        child(caps, name)
            .and_then(|service| text(service, "XAddr"))
            .map(str::to_string)
    };
    Ok(ServiceAddrs {
        media: xaddr("Media"),
        ptz: xaddr("PTZ"),
        imaging: xaddr("Imaging"),
    })
}

pub(crate) fn parse_profiles(xml: &str) -> DeviceResult<Vec<Profile>> {
    let doc = parse(xml)?;
    let response = body(&doc, "GetProfilesResponse")?;

    let profiles = children(response, "Profiles")
        .map(|node| Profile {
            token: node.attribute("token").unwrap_or_default().to_string(),
            name: text(node, "Name").unwrap_or_default().to_string(),
            video_source_token: child(node, "VideoSourceConfiguration")
                .and_then(|vsc| text(vsc, "SourceToken"))
                .map(str::to_string),
            encoder: child(node, "VideoEncoderConfiguration").and_then(encoder_config),
        })
        .collect();
    Ok(profiles)
}

fn encoder_config(node: Node<'_, '_>) -> Option<EncoderConfig> {
    let rate_control = child(node, "RateControl").map(|rc| RateControl {
        frame_rate_limit: integer(rc, "FrameRateLimit").unwrap_or(0),
        encoding_interval: integer(rc, "EncodingInterval").unwrap_or(1),
        bitrate_limit: integer(rc, "BitrateLimit").unwrap_or(0),
    });
    let h264 = child(node, "H264").map(|h| H264Config {
        gov_length: integer(h, "GovLength").unwrap_or(0),
        profile: text(h, "H264Profile").unwrap_or("Main").to_string(),
    });
    let multicast = child(node, "Multicast")
        .map(|m| {
            let address = child(m, "Address");
            let address_type = address
                .and_then(|a| text(a, "Type"))
                .unwrap_or("IPv4")
                .to_string();
            let ip = address
                .and_then(|a| text(a, "IPv4Address").or_else(|| text(a, "IPv6Address")))
                .unwrap_or("0.0.0.0")
                .to_string();
            Multicast {
                address_type,
                address: ip,
                port: number(m, "Port").unwrap_or(0),
                ttl: number(m, "TTL").unwrap_or(1),
                auto_start: text(m, "AutoStart") == Some("true"),
            }
        })
        .unwrap_or_default();

    Some(EncoderConfig {
        token: node.attribute("token").unwrap_or_default().to_string(),
        name: text(node, "Name").unwrap_or_default().to_string(),
        use_count: integer(node, "UseCount").unwrap_or(1),
        encoding: text(node, "Encoding").unwrap_or("H264").to_string(),
        resolution: child(node, "Resolution").and_then(resolution)?,
        quality: number(node, "Quality").unwrap_or(0.0),
        rate_control,
        h264,
        multicast,
        session_timeout: text(node, "SessionTimeout").unwrap_or("PT60S").to_string(),
    })
}

pub(crate) fn parse_encoder_options(xml: &str) -> DeviceResult<EncoderOptions> {
    let doc = parse(xml)?;
    let options = body(&doc, "Options")?;

    let (encoding, node) = ["H264", "H265", "JPEG", "MPEG4"]
        .iter()
        .find_map(|name| child(options, name).map(|n| (*name, n)))
        .ok_or_else(|| DeviceError::new("no encoder options advertised"))?;

    let resolutions = children(node, "ResolutionsAvailable")
        .filter_map(resolution)
        .collect();
    let frame_rate_range = child(node, "FrameRateRange")
        .and_then(|range| Some((integer(range, "Min")?, integer(range, "Max")?)));

    Ok(EncoderOptions {
        encoding: encoding.to_string(),
        resolutions,
        frame_rate_range,
    })
}

pub(crate) fn parse_snapshot_uri(xml: &str) -> DeviceResult<String> {
    let doc = parse(xml)?;
    let media_uri = body(&doc, "MediaUri")?;
    text(media_uri, "Uri")
        .filter(|uri| !uri.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DeviceError::new("SnapshotUri missing"))
}

/// Absent axes count as not idle.
pub(crate) fn parse_move_status(xml: &str) -> DeviceResult<MoveStatus> {
    let doc = parse(xml)?;
    let response = body(&doc, "GetStatusResponse")?;
    let Some(moving) = descendant(response, "MoveStatus") else {
        return Ok(MoveStatus::default());
    };
    let idle = |axis: &str| text(moving, axis).is_some_and(|v| v.eq_ignore_ascii_case("IDLE"));
    Ok(MoveStatus {
        pan_tilt_idle: idle("PanTilt"),
        zoom_idle: idle("Zoom"),
    })
}

pub(crate) fn parse_imaging_settings(xml: &str) -> DeviceResult<ImagingSettings> {
    let doc = parse(xml)?;
    let settings = body(&doc, "ImagingSettings")?;
    let focus = child(settings, "Focus").map(|focus| FocusSettings {
        auto_focus_mode: text(focus, "AutoFocusMode").unwrap_or("AUTO").to_string(),
        default_speed: number(focus, "DefaultSpeed"),
        near_limit: number(focus, "NearLimit"),
        far_limit: number(focus, "FarLimit"),
    });
    Ok(ImagingSettings { focus })
}

pub(crate) fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema" xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl" xmlns:timg="http://www.onvif.org/ver20/imaging/wsdl" xmlns:tds="http://www.onvif.org/ver10/device/wsdl"><env:Body>{}</env:Body></env:Envelope>"#,
            body
        )
    }

    const PROFILES: &str = r#"<trt:GetProfilesResponse>
        <trt:Profiles token="Profile_1" fixed="true">
          <tt:Name>mainStream</tt:Name>
          <tt:VideoSourceConfiguration token="VideoSourceToken">
            <tt:Name>VideoSourceConfig</tt:Name>
            <tt:SourceToken>VideoSource_1</tt:SourceToken>
          </tt:VideoSourceConfiguration>
          <tt:VideoEncoderConfiguration token="VideoEncoderToken_1">
            <tt:Name>VideoEncoder_1</tt:Name>
            <tt:UseCount>1</tt:UseCount>
            <tt:Encoding>H264</tt:Encoding>
            <tt:Resolution><tt:Width>1920</tt:Width><tt:Height>1080</tt:Height></tt:Resolution>
            <tt:Quality>3.000000</tt:Quality>
            <tt:RateControl>
              <tt:FrameRateLimit>25</tt:FrameRateLimit>
              <tt:EncodingInterval>1</tt:EncodingInterval>
              <tt:BitrateLimit>4096</tt:BitrateLimit>
            </tt:RateControl>
            <tt:H264><tt:GovLength>50</tt:GovLength><tt:H264Profile>Main</tt:H264Profile></tt:H264>
            <tt:Multicast>
              <tt:Address><tt:Type>IPv4</tt:Type><tt:IPv4Address>0.0.0.0</tt:IPv4Address></tt:Address>
              <tt:Port>8860</tt:Port><tt:TTL>128</tt:TTL><tt:AutoStart>false</tt:AutoStart>
            </tt:Multicast>
            <tt:SessionTimeout>PT5S</tt:SessionTimeout>
          </tt:VideoEncoderConfiguration>
        </trt:Profiles>
        <trt:Profiles token="Profile_2" fixed="true">
          <tt:Name>subStream</tt:Name>
          <tt:VideoEncoderConfiguration token="VideoEncoderToken_2">
            <tt:Encoding>H264</tt:Encoding>
            <tt:Resolution><tt:Width>640</tt:Width><tt:Height>360</tt:Height></tt:Resolution>
          </tt:VideoEncoderConfiguration>
        </trt:Profiles>
      </trt:GetProfilesResponse>"#;

    #[test]
    fn test_parse_profiles() {
        let profiles = parse_profiles(&envelope(PROFILES)).unwrap();
        assert_eq!(profiles.len(), 2);

        let main = &profiles[0];
        assert_eq!(main.token, "Profile_1");
        assert_eq!(main.video_source_token.as_deref(), Some("VideoSource_1"));
        let encoder = main.encoder.as_ref().unwrap();
        assert_eq!(encoder.resolution, Resolution::new(1920, 1080));
        assert_eq!(encoder.rate_control.as_ref().unwrap().frame_rate_limit, 25);
        assert_eq!(encoder.multicast.port, 8860);
        assert_eq!(encoder.session_timeout, "PT5S");

        let sub = &profiles[1];
        assert_eq!(sub.area(), 640 * 360);
        assert!(sub.encoder.as_ref().unwrap().rate_control.is_none());
        assert!(sub.video_source_token.is_none());
    }

    #[test]
    fn test_parse_encoder_options() {
        let xml = envelope(
            r#"<trt:GetVideoEncoderConfigurationOptionsResponse><trt:Options>
                <tt:QualityRange><tt:Min>1</tt:Min><tt:Max>6</tt:Max></tt:QualityRange>
                <tt:JPEG><tt:ResolutionsAvailable><tt:Width>640</tt:Width><tt:Height>480</tt:Height></tt:ResolutionsAvailable></tt:JPEG>
                <tt:H264>
                  <tt:ResolutionsAvailable><tt:Width>2560</tt:Width><tt:Height>1440</tt:Height></tt:ResolutionsAvailable>
                  <tt:ResolutionsAvailable><tt:Width>1920</tt:Width><tt:Height>1080</tt:Height></tt:ResolutionsAvailable>
                  <tt:FrameRateRange><tt:Min>1</tt:Min><tt:Max>30</tt:Max></tt:FrameRateRange>
                </tt:H264>
            </trt:Options></trt:GetVideoEncoderConfigurationOptionsResponse>"#,
        );
        let options = parse_encoder_options(&xml).unwrap();
        assert_eq!(options.encoding, "H264");
        assert_eq!(options.resolutions.len(), 2);
        assert_eq!(options.best_resolution(), Some(Resolution::new(2560, 1440)));
        assert_eq!(options.frame_rate_range, Some((1, 30)));
    }

    #[test]
    fn test_parse_move_status() {
        let idle = envelope(
            r#"<tptz:GetStatusResponse><tptz:PTZStatus><tt:MoveStatus><tt:PanTilt>IDLE</tt:PanTilt><tt:Zoom>IDLE</tt:Zoom></tt:MoveStatus></tptz:PTZStatus></tptz:GetStatusResponse>"#,
        );
        assert!(parse_move_status(&idle).unwrap().is_idle());

        let moving = envelope(
            r#"<tptz:GetStatusResponse><tptz:PTZStatus><tt:MoveStatus><tt:PanTilt>MOVING</tt:PanTilt><tt:Zoom>IDLE</tt:Zoom></tt:MoveStatus></tptz:PTZStatus></tptz:GetStatusResponse>"#,
        );
        let status = parse_move_status(&moving).unwrap();
        assert!(!status.pan_tilt_idle);
        assert!(status.zoom_idle);

        let missing = envelope(r#"<tptz:GetStatusResponse><tptz:PTZStatus/></tptz:GetStatusResponse>"#);
        assert!(!parse_move_status(&missing).unwrap().is_idle());
    }

    #[test]
    fn test_parse_imaging_and_snapshot_uri() {
        let imaging = envelope(
            r#"<timg:GetImagingSettingsResponse><timg:ImagingSettings><tt:Brightness>50</tt:Brightness><tt:Focus><tt:AutoFocusMode>MANUAL</tt:AutoFocusMode><tt:DefaultSpeed>1.0</tt:DefaultSpeed><tt:NearLimit>0.5</tt:NearLimit></tt:Focus></timg:ImagingSettings></timg:GetImagingSettingsResponse>"#,
        );
        let focus = parse_imaging_settings(&imaging).unwrap().focus.unwrap();
        assert_eq!(focus.auto_focus_mode, "MANUAL");
        assert_eq!(focus.near_limit, Some(0.5));
        assert_eq!(focus.far_limit, None);

        let uri = envelope(
            r#"<trt:GetSnapshotUriResponse><trt:MediaUri><tt:Uri>http://10.0.0.5/onvif-http/snapshot?Profile_1</tt:Uri><tt:Timeout>PT0S</tt:Timeout></trt:MediaUri></trt:GetSnapshotUriResponse>"#,
        );
        assert_eq!(
            parse_snapshot_uri(&uri).unwrap(),
            "http://10.0.0.5/onvif-http/snapshot?Profile_1"
        );
    }

    #[test]
    fn test_parse_capabilities() {
        let xml = envelope(
            r#"<tds:GetCapabilitiesResponse><tds:Capabilities>
                <tt:Device><tt:XAddr>http://10.0.0.5/onvif/device_service</tt:XAddr></tt:Device>
                <tt:Imaging><tt:XAddr>http://10.0.0.5/onvif/Imaging</tt:XAddr></tt:Imaging>
                <tt:Media><tt:XAddr>http://10.0.0.5/onvif/Media</tt:XAddr></tt:Media>
                <tt:PTZ><tt:XAddr>http://10.0.0.5/onvif/PTZ</tt:XAddr></tt:PTZ>
            </tds:Capabilities></tds:GetCapabilitiesResponse>"#,
        );
        let addrs = parse_capabilities(&xml).unwrap();
        assert_eq!(addrs.media.as_deref(), Some("http://10.0.0.5/onvif/Media"));
        assert_eq!(addrs.ptz.as_deref(), Some("http://10.0.0.5/onvif/PTZ"));
        assert_eq!(addrs.imaging.as_deref(), Some("http://10.0.0.5/onvif/Imaging"));
    }

    #[test]
    fn test_fault_reason() {
        let fault = envelope(
            r#"<env:Fault><env:Code><env:Value>env:Sender</env:Value></env:Code><env:Reason><env:Text xml:lang="en">Sender not Authorized</env:Text></env:Reason></env:Fault>"#,
        );
        assert_eq!(fault_reason(&fault).as_deref(), Some("Sender not Authorized"));
        assert!(fault_reason(&envelope("<trt:GetProfilesResponse/>")).is_none());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
