//! Configuration file support for fabric-smd
//!
//! Loads and validates the daemon configuration from a TOML file.
//! Default location: /etc/fabric-sm/fabric-sm.conf
//!
//! The `[subnet]` section carries the manager options consumed by the core;
//! `[daemon]` holds what only the daemon shell needs. Command line flags
//! are applied on top through [`Overrides`].

use crate::error::{Result, SmdError};
use fabric_sm_core::SubnetOptions;
use fabric_sm_types::Guid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fabric-sm/fabric-sm.conf";

/// Daemon shell configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where GUID to LID bindings are persisted across restarts
    #[serde(default = "default_guid2lid_file")]
    pub guid2lid_file: PathBuf,

    /// How often the sweep controller is consulted, in milliseconds
    #[serde(default = "default_poll_period")]
    pub poll_period_ms: u64,

    /// JSON topology served by the simulated fabric transport
    #[serde(default)]
    pub topology: Option<PathBuf>,

    /// Upper bound on cycles run by `--once`
    #[serde(default = "default_max_once_cycles")]
    pub max_once_cycles: u32,
}

/// Complete fabric-smd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdConfig {
    #[serde(default)]
    pub subnet: SubnetOptions,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

fn default_guid2lid_file() -> PathBuf {
    PathBuf::from("/var/lib/fabric-sm/guid2lid")
}

fn default_poll_period() -> u64 {
    1000
}

fn default_max_once_cycles() -> u32 {
    8
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            guid2lid_file: default_guid2lid_file(),
            poll_period_ms: default_poll_period(),
            topology: None,
            max_once_cycles: default_max_once_cycles(),
        }
    }
}

/// Values given on the command line. `None` and `false` leave the file
/// value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub guid: Option<Guid>,
    pub priority: Option<u8>,
    pub sweep_interval_secs: Option<u64>,
    pub reassign_lids: bool,
    pub honor_guid2lid: bool,
    pub guid2lid_file: Option<PathBuf>,
    pub topology: Option<PathBuf>,
}

impl SmdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                SmdError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SmdError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(guid) = overrides.guid {
            self.subnet.guid = guid;
        }
        if let Some(priority) = overrides.priority {
            self.subnet.sm_priority = priority;
        }
        if let Some(interval) = overrides.sweep_interval_secs {
            self.subnet.sweep_interval_secs = interval;
        }
        self.subnet.reassign_lids |= overrides.reassign_lids;
        self.subnet.honor_guid2lid_file |= overrides.honor_guid2lid;
        if let Some(path) = &overrides.guid2lid_file {
            self.daemon.guid2lid_file = path.clone();
        }
        if let Some(path) = &overrides.topology {
            self.daemon.topology = Some(path.clone());
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.daemon.poll_period_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.subnet
            .validate()
            .map_err(|e| SmdError::Configuration(e.to_string()))?;

        if self.daemon.poll_period_ms == 0 {
            return Err(SmdError::Configuration(
                "poll_period_ms must be > 0".to_string(),
            ));
        }

        if self.daemon.max_once_cycles == 0 {
            return Err(SmdError::Configuration(
                "max_once_cycles must be > 0".to_string(),
            ));
        }

        if self.daemon.guid2lid_file.as_os_str().is_empty() {
            return Err(SmdError::Configuration(
                "guid2lid_file must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SmdConfig::default();
        assert_eq!(config.subnet.sweep_interval_secs, 10);
        assert_eq!(config.subnet.sm_priority, 1);
        assert_eq!(config.daemon.poll_period_ms, 1000);
        assert_eq!(config.daemon.topology, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = SmdConfig::load_or_default(dir.path().join("absent.conf")).unwrap();
        assert_eq!(config, SmdConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fabric-sm.conf");
        fs::write(
            &path,
            r#"
[subnet]
sm_priority = 7
lmc = 1
guid = "0x0002c90300000001"

[daemon]
topology = "/tmp/fabric.json"
"#,
        )
        .unwrap();

        let config = SmdConfig::load_or_default(&path).unwrap();
        assert_eq!(config.subnet.sm_priority, 7);
        assert_eq!(config.subnet.lmc, 1);
        assert_eq!(config.subnet.guid, Guid::new(0x0002_c903_0000_0001));
        assert_eq!(config.subnet.sweep_interval_secs, 10);
        assert_eq!(config.daemon.topology, Some(PathBuf::from("/tmp/fabric.json")));
        assert_eq!(config.daemon.poll_period_ms, 1000);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "[subnet\nsm_priority = ").unwrap();

        let err = SmdConfig::load_or_default(&path).unwrap_err();
        assert!(err.to_string().contains("broken.conf"));
    }

    #[test]
    fn test_overrides_win() {
        let mut config = SmdConfig::default();
        config.apply(&Overrides {
            guid: Some(Guid::new(0x21)),
            priority: Some(12),
            sweep_interval_secs: Some(0),
            reassign_lids: true,
            honor_guid2lid: true,
            guid2lid_file: Some(PathBuf::from("/tmp/g2l")),
            topology: None,
        });
        assert_eq!(config.subnet.guid, Guid::new(0x21));
        assert_eq!(config.subnet.sm_priority, 12);
        assert_eq!(config.subnet.sweep_interval_secs, 0);
        assert!(config.subnet.reassign_lids);
        assert!(config.subnet.honor_guid2lid_file);
        assert_eq!(config.daemon.guid2lid_file, PathBuf::from("/tmp/g2l"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SmdConfig::default();
        config.daemon.poll_period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SmdConfig::default();
        config.subnet.sm_priority = 16;
        assert!(config.validate().is_err());
    }
}
