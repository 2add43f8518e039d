//! Configuration file support
//!
//! Loads settings from a TOML file. Default location:
//! /etc/lldp-mirror/lldp-mirror.toml. A missing file means defaults.
//!
//! ```toml
//! [paths]
//! state_dir = "/run/lldp-mirror"
//!
//! [tc]
//! base_priority = 20000
//!
//! [timing]
//! interface_wait_ms = 30000
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lldp_mirror_common::{shell, MirrorError, MirrorResult};

use crate::commands::TcCommands;
use crate::retry::Backoff;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lldp-mirror/lldp-mirror.toml";

/// Filesystem locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory of per-guest state and lock files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory of per-guest mirror files (`<guest>.conf`)
    #[serde(default = "default_mirror_dir")]
    pub mirror_dir: PathBuf,

    /// Where VM configurations live
    #[serde(default = "default_qemu_config_dir")]
    pub qemu_config_dir: PathBuf,

    /// Where container configurations live
    #[serde(default = "default_lxc_config_dir")]
    pub lxc_config_dir: PathBuf,
}

/// Traffic-control tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcConfig {
    #[serde(default = "default_tc_cmd")]
    pub tc_cmd: String,

    #[serde(default = "default_ip_cmd")]
    pub ip_cmd: String,

    /// Filter priority of slot 0; slot N uses base + N
    #[serde(default = "default_base_priority")]
    pub base_priority: u16,
}

/// Wait and poll budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long to wait for a guest interface to appear
    #[serde(default = "default_interface_wait")]
    pub interface_wait_ms: u64,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// How long new rules may take to show up
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_ms: u64,

    #[serde(default = "default_confirm_interval")]
    pub confirm_interval_ms: u64,

    /// Listing attempts to find the handle of a new rule
    #[serde(default = "default_handle_attempts")]
    pub handle_attempts: u32,

    #[serde(default = "default_handle_delay")]
    pub handle_delay_ms: u64,

    /// How long removed rules may take to disappear
    #[serde(default = "default_remove_timeout")]
    pub remove_timeout_ms: u64,
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub tc: TcConfig,

    #[serde(default)]
    pub timing: TimingConfig,
}

// Default functions
fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/lldp-mirror")
}

fn default_mirror_dir() -> PathBuf {
    PathBuf::from("/etc/lldp-mirror/guests")
}

fn default_qemu_config_dir() -> PathBuf {
    PathBuf::from("/etc/pve/qemu-server")
}

fn default_lxc_config_dir() -> PathBuf {
    PathBuf::from("/etc/pve/lxc")
}

fn default_tc_cmd() -> String {
    shell::TC_CMD.to_string()
}

fn default_ip_cmd() -> String {
    shell::IP_CMD.to_string()
}

fn default_base_priority() -> u16 {
    20000
}

fn default_interface_wait() -> u64 {
    30_000
}

fn default_backoff_initial() -> u64 {
    250
}

fn default_backoff_factor() -> f64 {
    1.6
}

fn default_backoff_max() -> u64 {
    2_000
}

fn default_confirm_timeout() -> u64 {
    6_000
}

fn default_confirm_interval() -> u64 {
    250
}

fn default_handle_attempts() -> u32 {
    5
}

fn default_handle_delay() -> u64 {
    200
}

fn default_remove_timeout() -> u64 {
    6_000
}

// Default implementations
impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            mirror_dir: default_mirror_dir(),
            qemu_config_dir: default_qemu_config_dir(),
            lxc_config_dir: default_lxc_config_dir(),
        }
    }
}

impl Default for TcConfig {
    fn default() -> Self {
        Self {
            tc_cmd: default_tc_cmd(),
            ip_cmd: default_ip_cmd(),
            base_priority: default_base_priority(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            interface_wait_ms: default_interface_wait(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max(),
            confirm_timeout_ms: default_confirm_timeout(),
            confirm_interval_ms: default_confirm_interval(),
            handle_attempts: default_handle_attempts(),
            handle_delay_ms: default_handle_delay(),
            remove_timeout_ms: default_remove_timeout(),
        }
    }
}

impl TcConfig {
    pub fn commands(&self) -> TcCommands {
        TcCommands::new(&self.tc_cmd, &self.ip_cmd)
    }
}

impl TimingConfig {
    pub fn interface_wait(&self) -> Duration {
        Duration::from_millis(self.interface_wait_ms)
    }

    /// Backoff used while waiting for interfaces
    pub fn interface_backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_millis(self.backoff_initial_ms),
            self.backoff_factor,
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    /// Backoff used while confirming rule creation or removal
    pub fn confirm_backoff(&self) -> Backoff {
        Backoff::constant(Duration::from_millis(self.confirm_interval_ms))
    }

    pub fn handle_delay(&self) -> Duration {
        Duration::from_millis(self.handle_delay_ms)
    }

    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }
}

impl MirrorConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref();

        let config: Self = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                MirrorError::invalid_config(
                    "config_file",
                    format!("Failed to parse {}: {}", path.display(), e),
                )
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(MirrorError::invalid_config(
                    "config_file",
                    format!("Failed to read {}: {}", path.display(), e),
                ))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> MirrorResult<()> {
        let t = &self.timing;
        let positive = [
            ("timing.interface_wait_ms", t.interface_wait_ms),
            ("timing.backoff_initial_ms", t.backoff_initial_ms),
            ("timing.backoff_max_ms", t.backoff_max_ms),
            ("timing.confirm_timeout_ms", t.confirm_timeout_ms),
            ("timing.confirm_interval_ms", t.confirm_interval_ms),
            ("timing.remove_timeout_ms", t.remove_timeout_ms),
            ("timing.handle_attempts", u64::from(t.handle_attempts)),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(MirrorError::invalid_config(field, "must be greater than 0"));
            }
        }

        if t.backoff_factor.is_nan() || t.backoff_factor < 1.0 {
            return Err(MirrorError::invalid_config(
                "timing.backoff_factor",
                format!("must be at least 1.0, got {}", t.backoff_factor),
            ));
        }

        if self.tc.base_priority == 0 || self.tc.base_priority > u16::MAX - 64 {
            return Err(MirrorError::invalid_config(
                "tc.base_priority",
                format!("{} leaves no room for slot priorities", self.tc.base_priority),
            ));
        }

        Ok(())
    }
}
