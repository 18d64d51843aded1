//! Configuration loading and validation

use anyhow::Result;
use axon_agent::AgentConfig;
use axon_hotplug::HotplugConfig;
use axon_sim::{CameraConfig, FocuserConfig, WheelConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub hotplug: HotplugSection,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log every bus notification seen by the monitor
    #[serde(default = "default_true")]
    pub monitor: bool,
    /// Monitor channel capacity; slow subscribers skip what they miss
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            monitor: true,
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_event_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Extra time after the exposure length before a frame counts as failed
    #[serde(default = "default_grace")]
    pub completion_grace_ms: u64,
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_ms: u64,
    #[serde(default = "default_forward_poll")]
    pub forward_poll_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            max_devices: default_max_devices(),
            cache_capacity: default_cache_capacity(),
            completion_grace_ms: default_grace(),
            forward_timeout_ms: default_forward_timeout(),
            forward_poll_ms: default_forward_poll(),
        }
    }
}

fn default_agent_name() -> String {
    "Imager Agent".to_string()
}

fn default_max_devices() -> usize {
    32
}

fn default_cache_capacity() -> usize {
    512
}

fn default_grace() -> u64 {
    5000
}

fn default_forward_timeout() -> u64 {
    10_000
}

fn default_forward_poll() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotplugSection {
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Simulated camera units plugged in at startup
    #[serde(default = "default_cameras", rename = "camera")]
    pub cameras: Vec<CameraUnit>,
}

impl Default for HotplugSection {
    fn default() -> Self {
        Self {
            max_slots: default_max_slots(),
            scan_interval_ms: default_scan_interval(),
            cameras: default_cameras(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraUnit {
    pub serial: String,
    #[serde(default)]
    pub st4: bool,
}

fn default_max_slots() -> usize {
    8
}

fn default_scan_interval() -> u64 {
    2000
}

fn default_cameras() -> Vec<CameraUnit> {
    vec![CameraUnit {
        serial: "0001".to_string(),
        st4: true,
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub focuser: FocuserConfig,
    /// Attach the filter wheel simulator
    #[serde(default = "default_true")]
    pub wheel_enabled: bool,
    #[serde(default)]
    pub wheel: WheelConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            focuser: FocuserConfig::default(),
            wheel_enabled: true,
            wheel: WheelConfig::default(),
        }
    }
}

impl Config {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            name: self.agent.name.clone(),
            max_devices: self.agent.max_devices,
            cache_capacity: self.agent.cache_capacity,
            completion_grace_ms: self.agent.completion_grace_ms,
            forward_timeout_ms: self.agent.forward_timeout_ms,
            forward_poll_ms: self.agent.forward_poll_ms,
        }
    }

    pub fn to_hotplug_config(&self) -> HotplugConfig {
        HotplugConfig {
            max_slots: self.hotplug.max_slots,
            scan_interval_ms: self.hotplug.scan_interval_ms,
        }
    }

    pub fn to_camera_config(&self) -> CameraConfig {
        self.simulator.camera.clone()
    }

    pub fn to_focuser_config(&self) -> FocuserConfig {
        self.simulator.focuser.clone()
    }

    pub fn to_wheel_config(&self) -> Option<WheelConfig> {
        self.simulator.wheel_enabled.then(|| self.simulator.wheel.clone())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let mut config = Config::default();
    config.hotplug.cameras.push(CameraUnit {
        serial: "0002".to_string(),
        st4: false,
    });

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.agent.name, "Imager Agent");
        assert_eq!(config.hotplug.cameras, default_cameras());
        assert!(config.to_wheel_config().is_some());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("axon.toml");
        std::fs::write(
            &path,
            r#"
[agent]
completion_grace_ms = 250

[[hotplug.camera]]
serial = "A1"

[simulator]
wheel_enabled = false

[simulator.focuser]
max_position = 5000
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        let agent = config.to_agent_config();
        assert_eq!(agent.completion_grace_ms, 250);
        assert_eq!(agent.forward_timeout_ms, 10_000);
        assert_eq!(
            config.hotplug.cameras,
            vec![CameraUnit {
                serial: "A1".to_string(),
                st4: false
            }]
        );
        assert_eq!(config.to_hotplug_config().max_slots, 8);
        assert_eq!(config.to_focuser_config().max_position, 5000);
        assert_eq!(config.to_focuser_config().poll_ms, 500);
        assert_eq!(config.to_camera_config().width, 1280);
        assert!(config.to_wheel_config().is_none());
    }

    #[test]
    fn test_saved_default_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("axon.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.hotplug.cameras.len(), 2);
        assert_eq!(config.daemon.event_buffer, 256);
        assert_eq!(config.to_camera_config().stars, CameraConfig::default().stars);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("axon.toml");
        std::fs::write(&path, "[agent]\nmax_devices = \"many\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
