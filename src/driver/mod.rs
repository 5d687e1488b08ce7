//! Driver core
//!
//! [`ArrayDriver`] maps the volume lifecycle onto array commands. Each
//! submodule adds one group of operations to the same type:
//!
//! - `setup`: system, pool, node and license discovery
//! - `volume`: create, delete, extend, attributes
//! - `flashcopy`: snapshots and clones through PiT mappings
//! - `host`: host objects for connectors
//! - `connection`: attach and detach
//! - `migrate`: moving volumes between pools
//! - `stats`: capacity report
//!
//! The array is the single source of truth. Apart from the setup profile,
//! the license check, the host lookup cache and the last stats report,
//! nothing is kept between calls, and all four can be rebuilt by querying
//! the array again.

mod connection;
mod flashcopy;
mod host;
mod migrate;
mod setup;
mod stats;
mod volume;

pub use flashcopy::PitStatus;
pub use host::host_name_for;
pub use migrate::LOCATION_PREFIX;
pub use setup::{ArrayProfile, Licenses, StorageNode};

use crate::cli::ArrayClient;
use crate::config::{DriverConfig, VolumeOptions};
use crate::domain::{ArrayGatewayRef, VolumeCatalogRef, VolumeRecord, VolumeSpec, VolumeStatus, VolumeStats};
use crate::error::{Error, Result};
use crate::retry::PollPolicy;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

/// Block storage driver for one array pool
pub struct ArrayDriver {
    config: DriverConfig,
    client: ArrayClient,
    catalog: VolumeCatalogRef,
    /// Budget for every wait on the array
    poll: PollPolicy,
    /// Discovered by `do_setup`
    profile: RwLock<Option<Arc<ArrayProfile>>>,
    /// License check, run once per process
    licenses: OnceCell<Licenses>,
    /// Connector identity to host name
    hosts: DashMap<String, String>,
    /// Last capacity report
    stats: RwLock<Option<VolumeStats>>,
}

impl ArrayDriver {
    /// Create a driver; call [`ArrayDriver::do_setup`] before anything else
    pub fn new(config: DriverConfig, gateway: ArrayGatewayRef, catalog: VolumeCatalogRef) -> Self {
        let poll = config.poll_policy();
        Self {
            config,
            client: ArrayClient::new(gateway),
            catalog,
            poll,
            profile: RwLock::new(None),
            licenses: OnceCell::new(),
            hosts: DashMap::new(),
            stats: RwLock::new(None),
        }
    }

    /// Replace the polling schedule derived from the configuration
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Profile discovered by `do_setup`
    pub fn profile(&self) -> Result<Arc<ArrayProfile>> {
        self.profile
            .read()
            .clone()
            .ok_or_else(|| Error::Configuration("do_setup has not run".into()))
    }

    /// Effective options for one volume: configuration defaults, then the
    /// volume's own overrides, checked against what the array offers.
    pub(crate) async fn volume_options(&self, overrides: &BTreeMap<String, String>) -> Result<VolumeOptions> {
        let options = self.config.volume_defaults()?.with_overrides(overrides)?;
        options.validate()?;

        let profile = self.profile()?;
        if !profile.io_groups.contains(&options.iogrp) {
            return Err(Error::InvalidInput(format!(
                "I/O group {} is not available, valid groups are {:?}",
                options.iogrp, profile.io_groups
            )));
        }
        if options.compression && !self.licenses().await?.compression {
            return Err(Error::InvalidInput(
                "compression is enabled but the array has no compression license".into(),
            ));
        }
        Ok(options)
    }

    /// Write a volume record; catalog failures are logged, the array
    /// operation has already succeeded.
    pub(crate) async fn record_volume(&self, spec: &VolumeSpec, size_gb: u64, pool: &str, status: VolumeStatus) {
        let record = VolumeRecord {
            id: spec.id.clone(),
            name: spec.name.clone(),
            size_gb,
            pool: Some(pool.to_string()),
            status,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.catalog.set_volume(record).await {
            warn!("Failed to update catalog for volume {}: {}", spec.name, e);
        }
    }
}
