//! Domain Ports - Core trait definitions for the volume driver
//!
//! These traits define the boundaries between the driver core and the
//! systems it talks to: the array command channel and the volume catalog.
//! Adapters implement these traits to provide concrete functionality.

use crate::cli::ArrayCommand;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Protocol Types
// =============================================================================

/// Host attachment protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "iSCSI", alias = "iscsi", alias = "ISCSI")]
    Iscsi,
    #[serde(rename = "FC", alias = "fc")]
    FibreChannel,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Iscsi => write!(f, "iSCSI"),
            Protocol::FibreChannel => write!(f, "FC"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "iscsi" => Ok(Protocol::Iscsi),
            "fc" => Ok(Protocol::FibreChannel),
            other => Err(Error::InvalidInput(format!(
                "illegal protocol {}, expected iSCSI or FC",
                other
            ))),
        }
    }
}

// =============================================================================
// Array Command Channel
// =============================================================================

/// Raw result of one array command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code reported by the remote command
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited cleanly with nothing on stderr
    pub fn is_clean(&self) -> bool {
        self.exit_code == 0 && self.stderr.trim().is_empty()
    }
}

/// Channel that executes commands on the array
///
/// Implementations must not keep session state between calls: every
/// command is fully self-describing.
#[async_trait]
pub trait ArrayGateway: Send + Sync {
    /// Execute one command and capture its output.
    ///
    /// Returns `Err` only when the command could not be delivered at all;
    /// array-side failures come back as a [`CommandOutput`] with stderr set.
    async fn execute(&self, command: &ArrayCommand) -> Result<CommandOutput>;
}

// =============================================================================
// Volume Catalog
// =============================================================================

/// Lifecycle status recorded in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Extending,
    Migrating,
    Deleting,
    Error,
}

/// Volume record owned by the external catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Catalog identifier
    pub id: String,
    /// Array-side name
    pub name: String,
    /// Size in GiB
    pub size_gb: u64,
    /// Pool the volume lives in
    pub pool: Option<String>,
    /// Lifecycle status
    pub status: VolumeStatus,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// Persistence collaborator for volume records
#[async_trait]
pub trait VolumeCatalog: Send + Sync {
    /// Fetch a record by id
    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>>;

    /// Insert or replace a record
    async fn set_volume(&self, record: VolumeRecord) -> Result<()>;
}

// =============================================================================
// Driver Requests
// =============================================================================

/// Volume to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Catalog identifier
    pub id: String,
    /// Array-side name
    pub name: String,
    /// Size in GiB
    pub size_gb: u64,
    /// Per-volume option overrides (volume type extra specs)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, size_gb: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size_gb,
            options: BTreeMap::new(),
        }
    }

    /// Add an option override
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Size in bytes; sizes that overflow are rejected
    pub fn size_bytes(&self) -> Result<u64> {
        self.size_gb.checked_mul(GIB).ok_or_else(|| {
            Error::InvalidInput(format!(
                "volume {} size {} GiB is out of range",
                self.name, self.size_gb
            ))
        })
    }
}

/// Snapshot to create or delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    /// Catalog identifier
    pub id: String,
    /// Array-side name of the snapshot target volume
    pub name: String,
    /// Array-side name of the source volume
    pub volume_name: String,
    /// Source size in GiB
    pub volume_size_gb: u64,
}

/// Initiator side of an attachment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    /// Host name reported by the initiator
    pub host: Option<String>,
    /// iSCSI initiator name
    pub initiator: Option<String>,
    /// Fibre Channel port names
    #[serde(default)]
    pub wwpns: Vec<String>,
    /// Initiator IP
    pub ip: Option<String>,
}

impl Connector {
    pub fn iscsi(host: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            initiator: Some(initiator.into()),
            ..Default::default()
        }
    }

    pub fn fibre_channel(host: impl Into<String>, wwpns: Vec<String>) -> Self {
        Self {
            host: Some(host.into()),
            wwpns,
            ..Default::default()
        }
    }
}

/// Capabilities of a migration destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHint {
    /// `<driver>:<system id>:<pool>`
    pub location_info: Option<String>,
    /// Extent size of the destination pool in MiB
    pub extent_size: Option<u64>,
}

// =============================================================================
// Driver Responses
// =============================================================================

/// iSCSI target details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub target_discovered: bool,
    pub target_iqn: String,
    pub target_portal: String,
    pub target_lun: u32,
    pub volume_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_password: Option<String>,
}

/// Fibre Channel target details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcTarget {
    pub target_discovered: bool,
    pub target_wwn: Vec<String>,
    pub target_lun: u32,
    pub volume_id: String,
}

/// What the initiator needs to attach a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver_volume_type", content = "data")]
pub enum ConnectionInfo {
    #[serde(rename = "iscsi")]
    Iscsi(IscsiTarget),
    #[serde(rename = "fibre_channel")]
    FibreChannel(FcTarget),
}

impl ConnectionInfo {
    pub fn lun(&self) -> u32 {
        match self {
            ConnectionInfo::Iscsi(t) => t.target_lun,
            ConnectionInfo::FibreChannel(t) => t.target_lun,
        }
    }
}

/// Catalog changes produced by a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub pool: String,
}

/// Result of `migrate_volume`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub moved: bool,
    pub model_update: Option<ModelUpdate>,
}

impl MigrationOutcome {
    pub fn not_moved() -> Self {
        Self {
            moved: false,
            model_update: None,
        }
    }
}

/// Capacity and capability report consumed by the placement layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub volume_backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    pub reserved_percentage: u32,
    #[serde(rename = "QoS_support")]
    pub qos_support: bool,
    pub easytier_support: bool,
    pub compression_support: bool,
    pub extent_size: u64,
    pub location_info: String,
    pub updated_at: DateTime<Utc>,
}

/// Bytes per GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Type Aliases
// =============================================================================

pub type ArrayGatewayRef = Arc<dyn ArrayGateway>;
pub type VolumeCatalogRef = Arc<dyn VolumeCatalog>;
