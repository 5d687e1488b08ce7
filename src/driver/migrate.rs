//! Moving volumes between pools
//!
//! Only destinations on this array are handled; any other hint is answered
//! with "not moved" so the caller can fall back to a host-side copy. Pools
//! with the same extent size take `migratevdisk`. Different extent sizes
//! need a second volume copy in the destination pool: add it, wait for it
//! to sync, then drop the original. The copy is added before anything is
//! removed, so a failure at any point leaves the volume whole in one pool.

use super::ArrayDriver;
use crate::cli::{ArrayCommand, ProvisioningParams};
use crate::domain::{MigrationHint, MigrationOutcome, ModelUpdate, VolumeSpec, VolumeStatus};
use crate::error::{Error, ObjectKind, Result};
use crate::retry::Progress;
use tracing::{debug, error, info, instrument, warn};

/// Driver tag in `location_info`
pub const LOCATION_PREFIX: &str = "ArrayDriver";

/// Destination parsed from a hint
#[derive(Debug, PartialEq, Eq)]
struct Destination<'a> {
    system_id: &'a str,
    pool: &'a str,
}

fn parse_location(location: &str) -> Option<Destination<'_>> {
    let mut parts = location.split(':');
    let (driver, system_id, pool) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || driver != LOCATION_PREFIX || pool.is_empty() {
        return None;
    }
    Some(Destination { system_id, pool })
}

impl ArrayDriver {
    /// Move a volume to the pool named in `hint`
    #[instrument(skip(self, volume, hint), fields(volume = %volume.name))]
    pub async fn migrate_volume(
        &self,
        volume: &VolumeSpec,
        hint: &MigrationHint,
    ) -> Result<MigrationOutcome> {
        let Some(location) = hint.location_info.as_deref() else {
            debug!("Migration hint carries no location, not moving {}", volume.name);
            return Ok(MigrationOutcome::not_moved());
        };
        let profile = self.profile()?;
        let destination = match parse_location(location) {
            Some(d) if d.system_id == profile.system_id => d,
            _ => {
                info!("Destination {} is not on this array, not moving {}", location, volume.name);
                return Ok(MigrationOutcome::not_moved());
            }
        };
        let Some(dest_extent) = hint.extent_size else {
            info!("Destination {} reports no extent size, not moving {}", location, volume.name);
            return Ok(MigrationOutcome::not_moved());
        };

        let attrs = self
            .get_volume_attributes(&volume.name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: ObjectKind::Volume,
                name: volume.name.clone(),
            })?;
        let current_pool = attrs.require("mdisk_grp_name", "lsvdisk")?.to_string();
        if current_pool == destination.pool {
            info!("Volume {} is already in pool {}", volume.name, current_pool);
            return Ok(MigrationOutcome::not_moved());
        }
        let current_extent = self.pool_extent_size(&current_pool).await?;

        info!(
            "Migrating volume {} from {} to {}",
            volume.name, current_pool, destination.pool
        );
        if current_extent == dest_extent {
            self.client
                .run(&ArrayCommand::MigrateVolume {
                    volume: volume.name.clone(),
                    pool: destination.pool.to_string(),
                })
                .await?;
        } else {
            debug!(
                "Extent sizes differ ({} vs {} MiB), migrating through a volume copy",
                current_extent, dest_extent
            );
            self.migrate_with_copy(volume, destination.pool).await?;
        }

        self.record_volume(volume, volume.size_gb, destination.pool, VolumeStatus::Available)
            .await;
        Ok(MigrationOutcome {
            moved: true,
            model_update: Some(ModelUpdate {
                pool: destination.pool.to_string(),
            }),
        })
    }

    async fn pool_extent_size(&self, pool: &str) -> Result<u64> {
        let view = self
            .client
            .detail(&ArrayCommand::ShowPool {
                name: pool.to_string(),
            })
            .await?;
        view.first()
            .ok_or_else(|| Error::NotFound {
                kind: ObjectKind::Pool,
                name: pool.to_string(),
            })?
            .require_u64("extent_size", "lsmdiskgrp")
    }

    async fn migrate_with_copy(&self, volume: &VolumeSpec, pool: &str) -> Result<()> {
        let copies = self
            .client
            .table(&ArrayCommand::ListVolumeCopies {
                volume: volume.name.clone(),
                copy: None,
            })
            .await?;
        let original = match copies.records() {
            [only] => only.require("copy_id", "lsvdiskcopy")?.to_string(),
            other => {
                return Err(Error::backend(
                    "addvdiskcopy",
                    format!(
                        "volume {} has {} copies, migration needs exactly one",
                        volume.name,
                        other.len()
                    ),
                ))
            }
        };

        let options = self.volume_options(&volume.options).await?;
        let params = ProvisioningParams::new(pool, &options)?;
        let added = self
            .client
            .create(&ArrayCommand::AddVolumeCopy {
                volume: volume.name.clone(),
                params,
            })
            .await?;
        debug!("Copy {} of {} added in pool {}", added, volume.name, pool);

        if let Err(e) = self.wait_for_copy_sync(&volume.name, &added).await {
            error!("Copy {} of {} did not sync: {}", added, volume.name, e);
            let discard = ArrayCommand::DeleteVolumeCopy {
                volume: volume.name.clone(),
                copy: added.clone(),
            };
            if let Err(cleanup) = self.client.run(&discard).await {
                warn!("Failed to remove copy {} of {}: {}", added, volume.name, cleanup);
            }
            return Err(e);
        }

        self.client
            .run(&ArrayCommand::DeleteVolumeCopy {
                volume: volume.name.clone(),
                copy: original,
            })
            .await?;
        Ok(())
    }

    async fn wait_for_copy_sync(&self, volume: &str, copy: &str) -> Result<()> {
        let what = format!("copy {} of {} to sync", copy, volume);
        self.poll
            .poll_until(&what, move || async move {
                let view = self
                    .client
                    .detail(&ArrayCommand::ListVolumeCopies {
                        volume: volume.to_string(),
                        copy: Some(copy.to_string()),
                    })
                    .await?;
                let record = view
                    .first()
                    .ok_or_else(|| Error::backend("lsvdiskcopy", "empty copy view"))?;
                if record.require("sync", "lsvdiskcopy")? == "yes" {
                    Ok(Progress::Done(()))
                } else {
                    Ok(Progress::Pending)
                }
            })
            .await
    }
}
