//! Runtime configuration for the supervisor.
//!
//! Everything is optional: a missing file yields defaults that arm exact
//! timers, report no battery exemption and launch nothing.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "GEOWAKE_CONFIG";
const CONFIG_FILE_NAME: &str = "daemon.toml";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default = "default_true")]
    pub exact_alarms_permitted: bool,
    #[serde(default)]
    pub battery_optimization_exempt: bool,
    #[serde(default)]
    pub manufacturer: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            exact_alarms_permitted: true,
            battery_optimization_exempt: false,
            manufacturer: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    /// argv of the host application; alarm arguments are appended.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Directories where the live process mirrors `tracking_session.json`.
    #[serde(default)]
    pub mirror_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

pub fn default_config_path(base_dir: &Path) -> PathBuf {
    base_dir.join(CONFIG_FILE_NAME)
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, String> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    let config = toml::from_str::<DaemonConfig>(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;

    if config.timers.poll_interval_ms == 0 {
        return Err(format!(
            "Invalid config {}: timers.poll_interval_ms must be positive",
            path.display()
        ));
    }

    Ok(config)
}
