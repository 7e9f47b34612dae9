use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use ptzcam_core::{CameraTarget, Credentials, StreamType};

/// Contents of `config.toml`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub camera: CameraSection,
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub manual: ManualSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraSection {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,
    #[serde(default = "default_onvif_port")]
    pub onvif_port: u16,
    /// Control hosts, index-aligned with `ips`. Empty means `ips` are used.
    #[serde(default)]
    pub onvif_ips: Vec<String>,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            ips: Vec::new(),
            username: default_username(),
            stream: default_stream(),
            rtsp_port: default_rtsp_port(),
            onvif_port: default_onvif_port(),
            onvif_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualSection {
    #[serde(default)]
    pub fps: Vec<u32>,
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_stream() -> String {
    "sub".to_string()
}

fn default_rtsp_port() -> u16 {
    554
}

fn default_onvif_port() -> u16 {
    80
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("DATA")
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn stream_type(&self) -> Result<StreamType> {
        Ok(self.camera.stream.parse()?)
    }

    /// Hosts that speak the device control protocol.
    pub fn onvif_hosts(&self) -> &[String] {
        if self.camera.onvif_ips.is_empty() {
            &self.camera.ips
        } else {
            &self.camera.onvif_ips
        }
    }

    pub fn uses_onvif(&self) -> bool {
        !self.onvif_hosts().is_empty()
    }

    /// One target per stream host. The control host is taken from the
    /// same index of `onvif_ips` when present.
    pub fn live_targets(&self, credentials: &Credentials) -> Result<Vec<CameraTarget>> {
        let stream_type = self.stream_type()?;
        let hosts = self.onvif_hosts();
        Ok(self
            .camera
            .ips
            .iter()
            .enumerate()
            .map(|(idx, ip)| {
                let control = hosts.get(idx).unwrap_or(ip);
                CameraTarget::new(ip.clone(), credentials.clone())
                    .with_rtsp_port(self.camera.rtsp_port)
                    .with_control(control.clone(), self.camera.onvif_port)
                    .with_stream_type(stream_type)
            })
            .collect())
    }

    /// One target per control host.
    pub fn onvif_targets(&self, credentials: &Credentials) -> Result<Vec<CameraTarget>> {
        let stream_type = self.stream_type()?;
        Ok(self
            .onvif_hosts()
            .iter()
            .map(|host| {
                CameraTarget::new(host.clone(), credentials.clone())
                    .with_rtsp_port(self.camera.rtsp_port)
                    .with_control(host.clone(), self.camera.onvif_port)
                    .with_stream_type(stream_type)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.camera.ips.is_empty());
        assert_eq!(config.camera.username, "admin");
        assert_eq!(config.camera.rtsp_port, 554);
        assert_eq!(config.camera.onvif_port, 80);
        assert_eq!(config.stream_type().unwrap(), StreamType::Sub);
        assert_eq!(config.app.save_dir, PathBuf::from("DATA"));
        assert!(config.manual.fps.is_empty());
        assert!(!config.uses_onvif());
    }

    #[test]
    fn test_onvif_hosts_fall_back_to_ips() {
        let config = AppConfig::parse(
            r#"
            [camera]
            ips = ["10.0.0.1", "10.0.0.2"]
            stream = "main"
            onvif_port = 8080
            "#,
        )
        .unwrap();
        let creds = Credentials::new("admin");

        let targets = config.onvif_targets(&creds).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].control_host, "10.0.0.2");
        assert_eq!(targets[1].control_port, 8080);
        assert_eq!(targets[0].stream_type, StreamType::Main);
    }

    #[test]
    fn test_separate_control_hosts() {
        let config = AppConfig::parse(
            r#"
            [camera]
            ips = ["192.168.1.10", "192.168.1.11"]
            onvif_ips = ["10.1.0.10"]
            rtsp_port = 8554

            [manual]
            fps = [5, 10, 15]

            [app]
            save_dir = "/tmp/shots"
            window_title = "ignored"
            "#,
        )
        .unwrap();
        let creds = Credentials::new("admin");

        let live = config.live_targets(&creds).unwrap();
        assert_eq!(live[0].stream_host, "192.168.1.10");
        assert_eq!(live[0].control_host, "10.1.0.10");
        assert_eq!(live[0].rtsp_port, 8554);
        // No control host at that index, so the stream host is reused.
        assert_eq!(live[1].control_host, "192.168.1.11");

        assert_eq!(config.onvif_targets(&creds).unwrap().len(), 1);
        assert_eq!(config.manual.fps, vec![5, 10, 15]);
        assert_eq!(config.app.save_dir, PathBuf::from("/tmp/shots"));
    }

    #[test]
    fn test_shared_credentials_unlock_all_targets() {
        let config = AppConfig::parse("[camera]\nips = [\"a\", \"b\"]\n").unwrap();
        let creds = Credentials::new("admin");
        let targets = config.live_targets(&creds).unwrap();

        assert!(creds.set_password("pw"));
        assert!(targets.iter().all(|t| t.credentials.password() == "pw"));
    }

    #[test]
    fn test_invalid_stream_rejected() {
        let config = AppConfig::parse("[camera]\nstream = \"third\"\n").unwrap();
        assert!(config.stream_type().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[camera]\nips = [\"10.0.0.9\"]\nusername = \"op\"").unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.camera.username, "op");

        let missing = AppConfig::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(missing.to_string().contains("failed to read config"));
    }
}
