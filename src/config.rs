//! Configuration system for the halo compositor server
//!
//! Loads configuration from TOML file at `~/.config/halo/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::memfd::{
    FORMAT_B8G8R8A8_SRGB, FORMAT_B8G8R8A8_UNORM, FORMAT_R8G8B8A8_SRGB, FORMAT_R8G8B8A8_UNORM,
};
use crate::backend::DeviceKind;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pacing: PacingConfig,
    pub compositor: CompositorConfig,
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pacing: PacingConfig::default(),
            compositor: CompositorConfig::default(),
            devices: default_devices(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, or use defaults if the
    /// file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path; the file must exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("halo");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Control socket and session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Rendezvous socket; `$XDG_RUNTIME_DIR/halo_comp_ipc` when unset
    pub socket_path: Option<PathBuf>,
    /// Maximum number of concurrent client sessions
    pub max_clients: usize,
    /// Stop the server when any client disconnects
    pub exit_on_disconnect: bool,
    /// How long a blocked loop waits before re-checking for shutdown
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_clients: 8,
            exit_on_disconnect: false,
            poll_timeout_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(halo_ipc::socket_path)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Frame timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Display refresh rate
    pub refresh_rate_hz: f64,
    /// Render time budgeted for each client frame
    pub min_app_time_ms: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 90.0,
            min_app_time_ms: 2.0,
        }
    }
}

impl PacingConfig {
    pub fn min_app_time_ns(&self) -> u64 {
        (self.min_app_time_ms.max(0.0) * 1_000_000.0) as u64
    }
}

/// Presentation backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Vulkan format numbers offered to clients, in preference order
    pub formats: Vec<i64>,
    /// Images per swapchain
    pub image_count: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            formats: vec![
                FORMAT_R8G8B8A8_SRGB,
                FORMAT_B8G8R8A8_SRGB,
                FORMAT_R8G8B8A8_UNORM,
                FORMAT_B8G8R8A8_UNORM,
            ],
            image_count: 3,
        }
    }
}

/// One tracked device exposed to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    /// Number of input records in the shared region
    #[serde(default = "default_input_count")]
    pub inputs: u32,
    /// Fixed position in meters
    #[serde(default)]
    pub position: [f32; 3],
}

fn default_input_count() -> u32 {
    4
}

fn default_devices() -> Vec<DeviceConfig> {
    vec![
        DeviceConfig {
            name: "Halo HMD".to_string(),
            kind: DeviceKind::Hmd,
            inputs: 1,
            position: [0.0, 1.6, 0.0],
        },
        DeviceConfig {
            name: "Halo Left Controller".to_string(),
            kind: DeviceKind::Controller,
            inputs: default_input_count(),
            position: [-0.2, 1.3, -0.3],
        },
        DeviceConfig {
            name: "Halo Right Controller".to_string(),
            kind: DeviceKind::Controller,
            inputs: default_input_count(),
            position: [0.2, 1.3, -0.3],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.max_clients, 8);
        assert_eq!(config.server.poll_timeout(), Duration::from_millis(500));
        assert!(!config.server.exit_on_disconnect);
        assert_eq!(config.compositor.image_count, 3);
        assert!(config.compositor.formats.contains(&FORMAT_R8G8B8A8_SRGB));
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices[0].kind, DeviceKind::Hmd);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
[server]
max_clients = 2
exit_on_disconnect = true

[pacing]
refresh_rate_hz = 120.0
"#,
        );
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.server.max_clients, 2);
        assert!(config.server.exit_on_disconnect);
        assert_eq!(config.server.poll_timeout_ms, 500);
        assert_eq!(config.pacing.refresh_rate_hz, 120.0);
        assert_eq!(config.pacing.min_app_time_ns(), 2_000_000);
        assert_eq!(config.devices.len(), 3);
    }

    #[test]
    fn test_devices_section() {
        let file = write_config(
            r#"
[[devices]]
name = "tracker"
kind = "tracker"

[[devices]]
name = "hmd"
kind = "hmd"
inputs = 2
position = [0.0, 1.7, 0.0]
"#,
        );
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].kind, DeviceKind::Tracker);
        assert_eq!(config.devices[0].inputs, 4);
        assert_eq!(config.devices[1].inputs, 2);
        assert_eq!(config.devices[1].position, [0.0, 1.7, 0.0]);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let file = write_config("[server]\nmax_clients = \"many\"\n");
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.devices.len(), 3);
        assert_eq!(parsed.compositor.formats, CompositorConfig::default().formats);
    }

    #[test]
    fn test_socket_path_override() {
        let server = ServerConfig {
            socket_path: Some(PathBuf::from("/tmp/halo-test.sock")),
            ..ServerConfig::default()
        };
        assert_eq!(server.socket_path(), PathBuf::from("/tmp/halo-test.sock"));
    }
}
