//! Configuration management for the camera streaming server

use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Address advertised in `/api/stream_url`. Auto-detected when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_ip: None,
        }
    }
}

/// Which backend produces raw frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// USB camera through V4L2 (`/dev/video<index>`)
    V4l2,

    /// Synthetic moving test pattern
    TestPattern,
}

/// Camera-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    #[serde(default = "default_source")]
    pub source: SourceKind,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            quality: default_quality(),
            source: default_source(),
        }
    }
}

impl CameraConfig {
    /// Device node for the configured index
    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.device_index)
    }

    /// Target time between two captured frames
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// Capture loop tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaptureConfig {
    /// Upper bound for a single device read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Consecutive failed reads tolerated before the device is declared lost
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Per-client stream tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    /// How long a responder waits for a fresh frame before re-checking state
    #[serde(default = "default_frame_wait_ms")]
    pub frame_wait_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_wait_ms: default_frame_wait_ms(),
        }
    }
}

impl StreamConfig {
    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 5000 }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fps() -> u32 { 30 }
fn default_quality() -> u8 { 85 }
fn default_source() -> SourceKind { SourceKind::V4l2 }
fn default_read_timeout_ms() -> u64 { 2_000 }
fn default_max_consecutive_failures() -> u32 { 5 }
fn default_frame_wait_ms() -> u64 { 1_000 }

impl Config {
    /// Loads configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cam = &self.camera;

        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(
                "camera width and height must be > 0".to_string(),
            ));
        }

        if cam.fps == 0 || cam.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera fps must be between 1 and 120, got {}",
                cam.fps
            )));
        }

        if cam.quality == 0 || cam.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "JPEG quality must be between 1 and 100, got {}",
                cam.quality
            )));
        }

        if self.capture.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture read-timeout-ms must be > 0".to_string(),
            ));
        }

        if self.capture.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "capture max-consecutive-failures must be > 0".to_string(),
            ));
        }

        if self.stream.frame_wait_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream frame-wait-ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Address clients should use to reach this server
    pub fn public_ip(&self) -> String {
        self.server
            .public_ip
            .clone()
            .unwrap_or_else(|| get_local_ip().unwrap_or_else(|| "localhost".to_string()))
    }
}

/// Attempt to get the local IP address by connecting to an external address
fn get_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let local_addr = socket.local_addr().ok()?;
    Some(local_addr.ip().to_string())
}
