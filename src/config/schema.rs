use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Session and transcoder defaults
    pub stream: StreamConfig,
    /// Cameras served by this relay
    pub cameras: Vec<CameraConfig>,
}

impl AppConfig {
    /// Reject configurations the registry cannot serve
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.name.trim().is_empty() {
                return Err(AppError::Config("camera name must not be empty".into()));
            }
            if !seen.insert(camera.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate camera name: {}",
                    camera.name
                )));
            }
            if camera.source.is_empty() {
                return Err(AppError::Config(format!(
                    "camera {} has no source",
                    camera.name
                )));
            }
        }
        if self.stream.heartbeat_interval_secs == 0 {
            return Err(AppError::Config(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Find a camera by name
    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.name == name)
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port (API and `/stream/:name` viewer endpoint)
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
    /// Enable HTTPS / WSS
    pub https_enabled: bool,
    /// Custom SSL certificate path
    pub ssl_cert_path: Option<String>,
    /// Custom SSL key path
    pub ssl_key_path: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
            https_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
        }
    }
}

/// Session defaults shared by all cameras
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Transcoder binary
    pub ffmpeg_path: String,
    /// Grace period between last viewer leaving and muxer teardown
    pub idle_timeout_secs: u64,
    /// Viewer liveness probe period
    pub heartbeat_interval_secs: u64,
    /// Maximum concurrently running cameras (0 = unlimited)
    pub max_sessions: usize,
    /// Outbound messages buffered per viewer before it is considered not ready
    pub viewer_queue_depth: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            idle_timeout_secs: 30,
            heartbeat_interval_secs: 10,
            max_sessions: 0,
            viewer_queue_depth: 64,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Per-camera configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Unique camera name
    pub name: String,
    /// Source descriptor as an argv fragment, e.g. `["-i", "rtsp://cam/stream"]`
    pub source: Vec<String>,
    /// Arguments placed before the source (e.g. `-rtsp_transport tcp`)
    pub pre_args: Vec<String>,
    /// Extra transcoder flags; empty string or null values produce a bare flag
    pub ffmpeg_options: Map<String, Value>,
    /// Fixed output width (detected from transcoder output when unset)
    pub width: Option<u16>,
    /// Fixed output height (detected from transcoder output when unset)
    pub height: Option<u16>,
    /// Dedicated viewer listener port
    pub ws_port: Option<u16>,
    /// Per-camera override of `stream.idle_timeout_secs`
    pub idle_timeout_secs: Option<u64>,
}

impl CameraConfig {
    /// Configured dimensions, only when both are present
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }

    /// Effective idle grace period
    pub fn idle_timeout(&self, defaults: &StreamConfig) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs))
    }

    /// Extra flags as ordered `(flag, value)` pairs
    pub fn extra_flags(&self) -> Vec<(String, String)> {
        self.ffmpeg_options
            .iter()
            .map(|(flag, value)| (flag.clone(), flag_value_to_string(value)))
            .collect()
    }
}

fn flag_value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.to_string(),
            source: vec!["-i".into(), "rtsp://127.0.0.1/stream".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.web.http_port, 8080);
        assert_eq!(config.stream.idle_timeout_secs, 30);
        assert_eq!(config.stream.heartbeat_interval_secs, 10);
        assert!(config.cameras.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = AppConfig {
            cameras: vec![camera("front-door"), camera("front-door")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_source() {
        let mut cam = camera("garage");
        cam.source.clear();
        let config = AppConfig {
            cameras: vec![cam],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extra_flags_stringify() {
        let cam: CameraConfig = serde_json::from_value(serde_json::json!({
            "name": "front-door",
            "source": ["-i", "rtsp://cam"],
            "ffmpeg_options": {
                "-b:v": "1000k",
                "-r": 25,
                "-an": "",
                "-re": null
            }
        }))
        .unwrap();

        // Emitted in the order the operator wrote them
        assert_eq!(
            cam.extra_flags(),
            vec![
                ("-b:v".to_string(), "1000k".to_string()),
                ("-r".to_string(), "25".to_string()),
                ("-an".to_string(), String::new()),
                ("-re".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_idle_timeout_override() {
        let defaults = StreamConfig::default();
        let mut cam = camera("porch");
        assert_eq!(cam.idle_timeout(&defaults), Duration::from_secs(30));
        cam.idle_timeout_secs = Some(5);
        assert_eq!(cam.idle_timeout(&defaults), Duration::from_secs(5));
    }

    #[test]
    fn test_dimensions_need_both() {
        let mut cam = camera("porch");
        cam.width = Some(640);
        assert_eq!(cam.dimensions(), None);
        cam.height = Some(480);
        assert_eq!(cam.dimensions(), Some((640, 480)));
    }
}
