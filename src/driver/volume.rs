//! Volume lifecycle

use super::ArrayDriver;
use crate::cli::{ArrayCommand, CreateVolume, ProvisioningParams, Record};
use crate::domain::{VolumeSpec, VolumeStatus, GIB};
use crate::error::{Error, ObjectKind, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

impl ArrayDriver {
    /// Create a volume in the configured pool
    #[instrument(skip(self, volume), fields(volume = %volume.name))]
    pub async fn create_volume(&self, volume: &VolumeSpec) -> Result<()> {
        info!("Creating volume: {} ({} GiB)", volume.name, volume.size_gb);
        self.create_array_volume(&volume.name, volume.size_bytes()?, &volume.options)
            .await?;
        self.record_volume(
            volume,
            volume.size_gb,
            &self.config.volpool_name,
            VolumeStatus::Available,
        )
        .await;
        Ok(())
    }

    /// Issue `mkvdisk` with the effective options for this volume
    pub(crate) async fn create_array_volume(
        &self,
        name: &str,
        size_bytes: u64,
        overrides: &BTreeMap<String, String>,
    ) -> Result<()> {
        let options = self.volume_options(overrides).await?;
        let params = ProvisioningParams::new(self.config.volpool_name.clone(), &options)?;
        let request = CreateVolume::new(name, size_bytes, options.iogrp, params)?;
        let id = self
            .client
            .create(&ArrayCommand::CreateVolume(request))
            .await?;
        debug!("Volume {} created with array id {}", name, id);
        Ok(())
    }

    /// Delete a volume. Missing volumes are not an error.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        info!("Deleting volume: {}", name);
        self.remove_volume(name, false).await
    }

    /// Delete a volume together with its host and PiT mappings
    #[instrument(skip(self))]
    pub async fn force_delete_volume(&self, name: &str) -> Result<()> {
        info!("Force deleting volume: {}", name);
        self.remove_volume(name, true).await
    }

    /// Remove a volume. Without `force` its PiT mappings are drained first
    /// and the array refuses while hosts still map it; with `force` the
    /// array drops every mapping along with the volume.
    pub(crate) async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        if !self.volume_exists(name).await? {
            warn!("Volume {} does not exist, nothing to delete", name);
            return Ok(());
        }
        if !force {
            self.ensure_no_pit_mappings(name).await?;
        }
        let command = ArrayCommand::DeleteVolume {
            name: name.to_string(),
            force,
        };
        match self.client.run(&command).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!("Volume {} disappeared during delete", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Grow a volume to `new_size_gb`
    #[instrument(skip(self, volume), fields(volume = %volume.name))]
    pub async fn extend_volume(&self, volume: &VolumeSpec, new_size_gb: u64) -> Result<()> {
        info!("Extending volume {} to {} GiB", volume.name, new_size_gb);
        if new_size_gb.checked_mul(GIB).is_none() {
            return Err(Error::InvalidInput(format!(
                "new size {} GiB of volume {} is out of range",
                new_size_gb, volume.name
            )));
        }
        let attrs = self
            .get_volume_attributes(&volume.name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: ObjectKind::Volume,
                name: volume.name.clone(),
            })?;
        let capacity = attrs.require_u64("capacity", "lsvdisk")?;
        if capacity % GIB != 0 {
            return Err(Error::InvalidInput(format!(
                "volume {} capacity {} bytes is not a whole number of GiB",
                volume.name, capacity
            )));
        }
        let current_gb = capacity / GIB;
        if new_size_gb <= current_gb {
            return Err(Error::InvalidInput(format!(
                "new size {} GiB must exceed the current size {} GiB",
                new_size_gb, current_gb
            )));
        }

        // The array cannot resize a volume under a PiT mapping
        let mappings = self.pit_mapping_ids(&volume.name).await?;
        if !mappings.is_empty() {
            return Err(Error::backend(
                "expandvdisksize",
                format!(
                    "volume {} has PiT mapping(s) {}",
                    volume.name,
                    mappings.join(", ")
                ),
            ));
        }

        self.client
            .run(&ArrayCommand::ExpandVolume {
                name: volume.name.clone(),
                size_gb: new_size_gb - current_gb,
            })
            .await?;

        let pool = attrs
            .get("mdisk_grp_name")
            .unwrap_or(&self.config.volpool_name)
            .to_string();
        self.record_volume(volume, new_size_gb, &pool, VolumeStatus::Available)
            .await;
        Ok(())
    }

    /// Parsed `lsvdisk` view, `None` when the volume does not exist
    pub async fn get_volume_attributes(&self, name: &str) -> Result<Option<Record>> {
        let command = ArrayCommand::ShowVolume {
            name: name.to_string(),
        };
        match self.client.detail(&command).await {
            Ok(view) => Ok(view.first().filter(|r| !r.is_empty()).cloned()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        let listing = self
            .client
            .table(&ArrayCommand::ListVolumes {
                name: Some(name.to_string()),
            })
            .await?;
        Ok(listing.iter().any(|r| r.get("name") == Some(name)))
    }

    pub async fn ensure_export(&self, _volume: &str) -> Result<()> {
        Ok(())
    }

    pub async fn create_export(&self, _volume: &str) -> Result<()> {
        Ok(())
    }

    pub async fn remove_export(&self, _volume: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::testing::setup_driver;
    use crate::domain::{Connector, VolumeCatalog, VolumeSpec, GIB};
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_create_records_catalog() {
        let (driver, _sim, catalog) = setup_driver().await;
        let spec = VolumeSpec::new("id-1", "volume-1", 2);
        driver.create_volume(&spec).await.unwrap();

        let record = catalog.get_volume("id-1").await.unwrap().unwrap();
        assert_eq!(record.size_gb, 2);
        assert_eq!(record.pool.as_deref(), Some("volpool"));
    }

    #[tokio::test]
    async fn test_option_overrides_reach_the_array() {
        let (driver, sim, _) = setup_driver().await;
        let spec = VolumeSpec::new("id-1", "thick", 1).with_option("drivers:rsize", "-1");
        driver.create_volume(&spec).await.unwrap();
        let thin = sim.inspect(|m| m.volumes["thick"].copies[&0].is_thin());
        assert!(!thin);

        let bad = VolumeSpec::new("id-2", "bad", 1).with_option("drivers:grainsize", "48");
        assert_matches!(driver.create_volume(&bad).await, Err(Error::InvalidInput(_)));
        assert!(!driver.volume_exists("bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_rejects_shrink() {
        let (driver, _sim, _) = setup_driver().await;
        let spec = VolumeSpec::new("id-1", "volume-1", 2);
        driver.create_volume(&spec).await.unwrap();
        assert_matches!(driver.extend_volume(&spec, 2).await, Err(Error::InvalidInput(_)));

        driver.extend_volume(&spec, 5).await.unwrap();
        let attrs = driver.get_volume_attributes("volume-1").await.unwrap().unwrap();
        assert_eq!(attrs.get("capacity"), Some((5 * GIB).to_string().as_str()));
    }

    #[tokio::test]
    async fn test_oversized_volume_is_rejected_locally() {
        let (driver, sim, _) = setup_driver().await;
        let huge = VolumeSpec::new("id-1", "huge", u64::MAX / 2);
        assert_matches!(driver.create_volume(&huge).await, Err(Error::InvalidInput(_)));
        assert_eq!(sim.issued("mkvdisk"), 0);

        let spec = VolumeSpec::new("id-2", "volume-2", 1);
        driver.create_volume(&spec).await.unwrap();
        assert_matches!(
            driver.extend_volume(&spec, u64::MAX / 2).await,
            Err(Error::InvalidInput(_))
        );
        assert_eq!(sim.issued("expandvdisksize"), 0);
    }

    #[tokio::test]
    async fn test_force_delete_drops_mappings() {
        let (driver, sim, _) = setup_driver().await;
        let spec = VolumeSpec::new("id-1", "mapped", 1);
        driver.create_volume(&spec).await.unwrap();
        driver
            .initialize_connection(&spec, &Connector::iscsi("h", "iqn.test:h"))
            .await
            .unwrap();

        assert_matches!(driver.delete_volume("mapped").await, Err(Error::InUse { .. }));
        driver.force_delete_volume("mapped").await.unwrap();
        assert!(!driver.volume_exists("mapped").await.unwrap());
        assert!(sim.inspect(|m| m.host_mappings.is_empty()));

        // Still idempotent
        driver.force_delete_volume("mapped").await.unwrap();
    }

    #[tokio::test]
    async fn test_exports_are_noops() {
        let (driver, _sim, _) = setup_driver().await;
        driver.ensure_export("v").await.unwrap();
        driver.create_export("v").await.unwrap();
        driver.remove_export("v").await.unwrap();
    }
}
