//! Driver configuration
//!
//! Connection settings, pool/protocol selection and per-volume defaults.
//! Loaded from YAML; every field has a default so partial files work.

use crate::domain::Protocol;
use crate::error::{Error, Result};
use crate::retry::PollPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Grain sizes (KiB) the array accepts for thin volumes
pub const VALID_GRAIN_SIZES: [u32; 4] = [32, 64, 128, 256];

/// Prefix for per-volume option overrides
const OPTION_SCOPE: &str = "drivers:";

// =============================================================================
// Driver Configuration
// =============================================================================

/// Configuration for the array driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Management address of the array
    pub san_ip: String,
    /// SSH port
    pub san_ssh_port: u16,
    /// SSH login
    pub san_login: String,
    /// SSH password
    pub san_password: Option<String>,
    /// SSH private key path
    pub san_private_key: Option<String>,
    /// Pool new volumes are created in
    pub volpool_name: String,
    /// Thin provisioning real size as a percentage, -1 for thick
    pub vol_rsize: i32,
    /// Space allocation warning threshold as a percentage, 0 disables
    pub vol_warning: u32,
    /// Let thin volumes grow automatically
    pub vol_autoexpand: bool,
    /// Thin volume grain size in KiB
    pub vol_grainsize: u32,
    /// Create compressed volumes
    pub vol_compression: bool,
    /// Enable easy tier
    pub vol_easytier: bool,
    /// I/O group new volumes belong to
    pub vol_iogrp: u32,
    /// Maximum seconds to wait for PiT mappings and copy syncs
    pub flashcopy_timeout_secs: u64,
    /// Interval between state polls in milliseconds
    pub flashcopy_poll_interval_ms: u64,
    /// Attachment protocol (iSCSI or FC)
    pub connection_protocol: String,
    /// Require CHAP for iSCSI hosts
    pub iscsi_chap_enabled: bool,
    /// Return every target port to FC initiators
    pub multipath_enabled: bool,
    /// Allow a volume to be mapped to several hosts
    pub multihostmap_enabled: bool,
    /// Capacity reserved from scheduling, reported as-is
    pub reserved_percentage: u32,
    /// Backend name reported in stats, derived from the array when unset
    pub volume_backend_name: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            san_ip: String::new(),
            san_ssh_port: 22,
            san_login: "admin".to_string(),
            san_password: None,
            san_private_key: None,
            volpool_name: "volpool".to_string(),
            vol_rsize: 2,
            vol_warning: 0,
            vol_autoexpand: true,
            vol_grainsize: 256,
            vol_compression: false,
            vol_easytier: true,
            vol_iogrp: 0,
            flashcopy_timeout_secs: 120,
            flashcopy_poll_interval_ms: 5000,
            connection_protocol: "iSCSI".to_string(),
            iscsi_chap_enabled: true,
            multipath_enabled: false,
            multihostmap_enabled: true,
            reserved_percentage: 0,
            volume_backend_name: None,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Configured attachment protocol
    pub fn protocol(&self) -> Result<Protocol> {
        self.connection_protocol.parse()
    }

    /// Budget and schedule for PiT mapping and copy waits
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::fixed(
            Duration::from_millis(self.flashcopy_poll_interval_ms),
            Duration::from_secs(self.flashcopy_timeout_secs),
        )
    }

    /// Volume options before per-volume overrides
    pub fn volume_defaults(&self) -> Result<VolumeOptions> {
        Ok(VolumeOptions {
            rsize: self.vol_rsize,
            warning: self.vol_warning,
            autoexpand: self.vol_autoexpand,
            grainsize: self.vol_grainsize,
            compression: self.vol_compression,
            easytier: self.vol_easytier,
            iogrp: self.vol_iogrp,
            protocol: self.protocol()?,
            multipath: self.multipath_enabled,
        })
    }

    /// Check everything that can be checked without talking to the array
    pub fn validate(&self) -> Result<()> {
        if self.san_ip.trim().is_empty() {
            return Err(Error::InvalidInput("san_ip must be set".into()));
        }
        if self.san_password.is_none() && self.san_private_key.is_none() {
            return Err(Error::InvalidInput(
                "password or SSH private key is required for authentication".into(),
            ));
        }
        if !(1..=600).contains(&self.flashcopy_timeout_secs) {
            return Err(Error::InvalidInput(format!(
                "illegal flashcopy_timeout_secs {}: valid values are 1 to 600",
                self.flashcopy_timeout_secs
            )));
        }
        if self.flashcopy_poll_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "flashcopy_poll_interval_ms must be positive".into(),
            ));
        }
        if self.volpool_name.trim().is_empty() {
            return Err(Error::InvalidInput("volpool_name must be set".into()));
        }
        self.volume_defaults()?.validate()
    }
}

// =============================================================================
// Volume Options
// =============================================================================

/// Effective creation options for one volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    pub rsize: i32,
    pub warning: u32,
    pub autoexpand: bool,
    pub grainsize: u32,
    pub compression: bool,
    pub easytier: bool,
    pub iogrp: u32,
    pub protocol: Protocol,
    pub multipath: bool,
}

impl VolumeOptions {
    /// Thin provisioned unless rsize is -1
    pub fn is_thin(&self) -> bool {
        self.rsize != -1
    }

    /// Apply overrides such as `drivers:rsize=10`. Keys without the
    /// `drivers:` scope are accepted too; unknown keys are ignored.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, String>) -> Result<Self> {
        for (key, value) in overrides {
            let key = key.strip_prefix(OPTION_SCOPE).unwrap_or(key);
            let value = value.trim();
            match key {
                "rsize" => self.rsize = parse_option(key, value)?,
                "warning" => self.warning = parse_option(key, value)?,
                "autoexpand" => self.autoexpand = parse_flag(key, value)?,
                "grainsize" => self.grainsize = parse_option(key, value)?,
                "compression" => self.compression = parse_flag(key, value)?,
                "easytier" => self.easytier = parse_flag(key, value)?,
                "iogrp" => self.iogrp = parse_option(key, value)?,
                "protocol" => self.protocol = value.parse()?,
                "multipath" => self.multipath = parse_flag(key, value)?,
                _ => {}
            }
        }
        Ok(self)
    }

    /// Range and combination checks
    pub fn validate(&self) -> Result<()> {
        if !(-1..=100).contains(&self.rsize) {
            return Err(Error::InvalidInput(format!(
                "illegal rsize {}: valid values are -1 (thick) or 0 to 100",
                self.rsize
            )));
        }
        if self.warning > 100 {
            return Err(Error::InvalidInput(format!(
                "illegal warning {}: valid values are 0 to 100",
                self.warning
            )));
        }
        if !VALID_GRAIN_SIZES.contains(&self.grainsize) {
            return Err(Error::InvalidInput(format!(
                "illegal grainsize {}: valid values are {:?}",
                self.grainsize, VALID_GRAIN_SIZES
            )));
        }
        if self.compression && !self.is_thin() {
            return Err(Error::InvalidInput(
                "compression requires thin provisioning (rsize must not be -1)".into(),
            ));
        }
        Ok(())
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("illegal value '{}' for {}", value, key)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" | "<is> true" => Ok(true),
        "false" | "off" | "no" | "0" | "<is> false" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "illegal value '{}' for {}",
            value, key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn valid() -> DriverConfig {
        DriverConfig {
            san_ip: "10.0.0.1".into(),
            san_password: Some("secret".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid().validate().is_ok());
        let defaults = valid().volume_defaults().unwrap();
        assert_eq!(defaults.rsize, 2);
        assert_eq!(defaults.grainsize, 256);
        assert_eq!(defaults.protocol, Protocol::Iscsi);
    }

    #[test]
    fn test_missing_credentials() {
        let config = DriverConfig {
            san_password: None,
            ..valid()
        };
        assert_matches!(config.validate(), Err(Error::InvalidInput(_)));

        let config = DriverConfig {
            san_ip: String::new(),
            ..valid()
        };
        assert_matches!(config.validate(), Err(Error::InvalidInput(_)));
    }

    #[test]
    fn test_illegal_ranges() {
        for config in [
            DriverConfig { vol_rsize: 101, ..valid() },
            DriverConfig { vol_rsize: -2, ..valid() },
            DriverConfig { vol_warning: 101, ..valid() },
            DriverConfig { vol_grainsize: 42, ..valid() },
            DriverConfig { flashcopy_timeout_secs: 0, ..valid() },
            DriverConfig { flashcopy_timeout_secs: 601, ..valid() },
            DriverConfig { vol_compression: true, vol_rsize: -1, ..valid() },
            DriverConfig { connection_protocol: "nvme".into(), ..valid() },
        ] {
            assert_matches!(config.validate(), Err(Error::InvalidInput(_)));
        }
    }

    #[test]
    fn test_protocol_is_case_insensitive() {
        let config = DriverConfig {
            connection_protocol: "fc".into(),
            ..valid()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol().unwrap(), Protocol::FibreChannel);
    }

    #[test]
    fn test_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("drivers:rsize".to_string(), "-1".to_string());
        overrides.insert("easytier".to_string(), "off".to_string());
        overrides.insert("drivers:protocol".to_string(), "FC".to_string());
        overrides.insert("capabilities:unrelated".to_string(), "x".to_string());

        let options = valid()
            .volume_defaults()
            .unwrap()
            .with_overrides(&overrides)
            .unwrap();
        assert!(!options.is_thin());
        assert!(!options.easytier);
        assert_eq!(options.protocol, Protocol::FibreChannel);

        overrides.insert("drivers:warning".to_string(), "lots".to_string());
        let result = valid().volume_defaults().unwrap().with_overrides(&overrides);
        assert_matches!(result, Err(Error::InvalidInput(_)));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "san_ip: 192.168.1.10\nsan_private_key: /etc/driver/id_rsa\nvolpool_name: gold\nvol_rsize: -1\nconnection_protocol: FC\n"
        )
        .unwrap();

        let config = DriverConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.san_ip, "192.168.1.10");
        assert_eq!(config.volpool_name, "gold");
        assert_eq!(config.vol_rsize, -1);
        assert_eq!(config.flashcopy_timeout_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_yaml() {
        assert_matches!(
            DriverConfig::from_yaml_str("vol_rsize: [1, 2]"),
            Err(Error::YamlParse(_))
        );
    }
}
