//! Snapshots and clones
//!
//! Both create a target volume of the source's exact capacity, link the
//! two with a PiT mapping and drive the mapping through prepare and start.
//! A snapshot keeps its mapping once the copy settles in `idle_or_copied`;
//! a clone waits for 100% and then removes it. Any failure after the target
//! exists deletes the target and the mapping before the error is returned.

use super::ArrayDriver;
use crate::array::PitState;
use crate::cli::{ArrayCommand, PitFilter, Record};
use crate::domain::{SnapshotSpec, VolumeSpec, VolumeStatus, GIB};
use crate::error::{Error, ObjectKind, Result};
use crate::retry::Progress;
use std::collections::BTreeMap;
use tracing::{debug, error, info, instrument, warn};

/// Background copy rate used for snapshots and clones
const COPY_RATE: u32 = 50;

/// Copy rate a zero-rate mapping is raised to before it can be drained
const DRAIN_COPY_RATE: u32 = 50;

/// PiT mapping as listed by `lsfcmap`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitStatus {
    pub id: String,
    pub source: String,
    pub target: String,
    pub state: PitState,
    pub progress: u8,
    pub copy_rate: u32,
}

impl PitStatus {
    fn from_record(record: &Record) -> Result<Self> {
        const CMD: &str = "lsfcmap";
        let progress = record.require_u64("progress", CMD)?.min(100) as u8;
        Ok(Self {
            id: record.require("id", CMD)?.to_string(),
            source: record.require("source_vdisk_name", CMD)?.to_string(),
            target: record.require("target_vdisk_name", CMD)?.to_string(),
            state: record.require("status", CMD)?.parse()?,
            progress,
            copy_rate: super::setup::parse_u32(record.require("copy_rate", CMD)?, CMD)?,
        })
    }

    fn is_complete(&self) -> bool {
        self.state == PitState::IdleOrCopied && self.progress == 100
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyMode {
    Snapshot,
    Clone,
}

impl ArrayDriver {
    /// Create a snapshot of `snapshot.volume_name`
    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.name))]
    pub async fn create_snapshot(&self, snapshot: &SnapshotSpec) -> Result<()> {
        info!(
            "Creating snapshot {} of volume {}",
            snapshot.name, snapshot.volume_name
        );
        let capacity = self.source_capacity(&snapshot.volume_name, ObjectKind::Volume).await?;
        check_size(&snapshot.name, snapshot.volume_size_gb, capacity)?;
        self.run_flashcopy(
            &snapshot.volume_name,
            &snapshot.name,
            capacity,
            &BTreeMap::new(),
            CopyMode::Snapshot,
        )
        .await
    }

    /// Create `volume` as a full copy of the volume named `source`
    #[instrument(skip(self, volume), fields(volume = %volume.name))]
    pub async fn create_cloned_volume(&self, volume: &VolumeSpec, source: &str) -> Result<()> {
        info!("Cloning volume {} from {}", volume.name, source);
        let capacity = self.source_capacity(source, ObjectKind::Volume).await?;
        check_size(&volume.name, volume.size_gb, capacity)?;
        self.run_flashcopy(source, &volume.name, capacity, &volume.options, CopyMode::Clone)
            .await?;
        self.record_volume(volume, volume.size_gb, &self.config.volpool_name, VolumeStatus::Available)
            .await;
        Ok(())
    }

    /// Create `volume` as a full copy of a snapshot
    #[instrument(skip(self, volume, snapshot), fields(volume = %volume.name, snapshot = %snapshot.name))]
    pub async fn create_volume_from_snapshot(
        &self,
        volume: &VolumeSpec,
        snapshot: &SnapshotSpec,
    ) -> Result<()> {
        info!("Creating volume {} from snapshot {}", volume.name, snapshot.name);
        let capacity = self.source_capacity(&snapshot.name, ObjectKind::Snapshot).await?;
        check_size(&volume.name, volume.size_gb, capacity)?;
        self.run_flashcopy(&snapshot.name, &volume.name, capacity, &volume.options, CopyMode::Clone)
            .await?;
        self.record_volume(volume, volume.size_gb, &self.config.volpool_name, VolumeStatus::Available)
            .await;
        Ok(())
    }

    /// Delete a snapshot's target volume after draining its mapping
    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.name))]
    pub async fn delete_snapshot(&self, snapshot: &SnapshotSpec) -> Result<()> {
        info!("Deleting snapshot: {}", snapshot.name);
        self.remove_volume(&snapshot.name, false).await
    }

    async fn source_capacity(&self, name: &str, kind: ObjectKind) -> Result<u64> {
        let attrs = self
            .get_volume_attributes(name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind,
                name: name.to_string(),
            })?;
        attrs.require_u64("capacity", "lsvdisk")
    }

    async fn run_flashcopy(
        &self,
        source: &str,
        target: &str,
        capacity: u64,
        overrides: &BTreeMap<String, String>,
        mode: CopyMode,
    ) -> Result<()> {
        self.create_array_volume(target, capacity, overrides).await?;

        let mapping = self
            .client
            .create(&ArrayCommand::CreatePitMapping {
                source: source.to_string(),
                target: target.to_string(),
                copy_rate: COPY_RATE,
                autodelete: false,
            })
            .await;
        let mapping = match mapping {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create PiT mapping {} -> {}: {}", source, target, e);
                self.discard_copy(target, None).await;
                return Err(e);
            }
        };
        debug!("PiT mapping {} links {} -> {}", mapping, source, target);

        if let Err(e) = self.drive_mapping(&mapping, mode).await {
            error!("PiT mapping {} for {} failed: {}", mapping, target, e);
            self.discard_copy(target, Some(&mapping)).await;
            return Err(e);
        }
        info!("PiT copy {} -> {} complete", source, target);
        Ok(())
    }

    async fn drive_mapping(&self, id: &str, mode: CopyMode) -> Result<()> {
        self.client
            .run(&ArrayCommand::PreparePitMapping { id: id.to_string() })
            .await?;
        self.wait_for_pit(id, "prestartfcmap", "prepared", |s| s.state == PitState::Prepared)
            .await?;

        self.client
            .run(&ArrayCommand::StartPitMapping { id: id.to_string() })
            .await?;
        self.wait_for_pit(id, "startfcmap", "idle_or_copied at 100%", PitStatus::is_complete)
            .await?;

        if mode == CopyMode::Clone {
            self.client
                .run(&ArrayCommand::DeletePitMapping {
                    id: id.to_string(),
                    force: false,
                })
                .await?;
        }
        Ok(())
    }

    /// Current state of one mapping, `None` once it is gone
    pub async fn pit_status(&self, id: &str) -> Result<Option<PitStatus>> {
        let listing = self
            .client
            .table(&ArrayCommand::ListPitMappings {
                filter: Some(PitFilter::Id(id.to_string())),
            })
            .await?;
        listing
            .iter()
            .find(|r| r.get("id") == Some(id))
            .map(PitStatus::from_record)
            .transpose()
    }

    /// Poll until `done` holds after `operation` was issued. A mapping that
    /// stops on its own (flush failure) or disappears ends the wait with an
    /// error; running out of budget is a [`Error::SnapshotTimeout`].
    async fn wait_for_pit(
        &self,
        id: &str,
        operation: &str,
        wanted: &str,
        done: impl Fn(&PitStatus) -> bool,
    ) -> Result<PitStatus> {
        let done = &done;
        let what = format!("PiT mapping {} to reach {}", id, wanted);
        let outcome = self
            .poll
            .poll_until(&what, move || async move {
                match self.pit_status(id).await? {
                    Some(status) if done(&status) => Ok(Progress::Done(status)),
                    Some(status) if status.state == PitState::Stopped => Err(Error::backend(
                        operation,
                        format!("PiT mapping {} stopped while waiting for {}", id, wanted),
                    )),
                    Some(status) => {
                        debug!(
                            "PiT mapping {} is {} at {}%",
                            id, status.state, status.progress
                        );
                        Ok(Progress::Pending)
                    }
                    None => Err(Error::NotFound {
                        kind: ObjectKind::PitMapping,
                        name: id.to_string(),
                    }),
                }
            })
            .await;

        outcome.map_err(|e| match e {
            Error::Timeout { elapsed, .. } => Error::SnapshotTimeout {
                mapping: id.to_string(),
                wanted: wanted.to_string(),
                elapsed,
            },
            other => other,
        })
    }

    /// Best-effort removal of a half-built copy. Failures are logged so the
    /// original error reaches the caller.
    async fn discard_copy(&self, target: &str, mapping: Option<&str>) {
        if let Some(id) = mapping {
            let stop = ArrayCommand::StopPitMapping { id: id.to_string() };
            if let Err(e) = self.client.run(&stop).await {
                debug!("Stopping PiT mapping {} during cleanup: {}", id, e);
            }
            let delete = ArrayCommand::DeletePitMapping {
                id: id.to_string(),
                force: true,
            };
            if let Err(e) = self.client.run(&delete).await {
                warn!("Failed to remove PiT mapping {} during cleanup: {}", id, e);
            }
        }
        if let Err(e) = self.remove_volume(target, true).await {
            warn!("Failed to remove volume {} during cleanup: {}", target, e);
        }
    }

    /// Ids of every PiT mapping the volume takes part in
    pub(crate) async fn pit_mapping_ids(&self, volume: &str) -> Result<Vec<String>> {
        let listing = self
            .client
            .table(&ArrayCommand::ListVolumePitMappings {
                volume: volume.to_string(),
            })
            .await?;
        listing
            .iter()
            .map(|r| r.require("id", "lsvdiskfcmappings").map(str::to_string))
            .collect()
    }

    /// Drain every PiT mapping of `volume` so it can be deleted.
    ///
    /// - zero-rate mapping, volume is the source: raise the copy rate and
    ///   turn on autodelete, then wait for the copy to finish
    /// - zero-rate mapping, volume is the target: stop it when copying or
    ///   prepared, wait while stopping or preparing, otherwise force-remove
    /// - copying mapping: stop it when prepared, force-remove when idle,
    ///   otherwise wait
    ///
    /// Bounded by the flashcopy timeout.
    pub(crate) async fn ensure_no_pit_mappings(&self, volume: &str) -> Result<()> {
        let what = format!("PiT mappings of {} to drain", volume);
        self.poll
            .poll_until(&what, move || async move {
                let ids = self.pit_mapping_ids(volume).await?;
                let mut pending = false;
                for id in &ids {
                    let Some(status) = self.pit_status(id).await? else {
                        continue;
                    };
                    pending |= self.drain_step(volume, &status).await?;
                }
                if pending {
                    Ok(Progress::Pending)
                } else {
                    Ok(Progress::Done(()))
                }
            })
            .await
    }

    /// One drain action; returns whether the mapping needs more time
    async fn drain_step(&self, volume: &str, status: &PitStatus) -> Result<bool> {
        let id = status.id.clone();
        let stop = ArrayCommand::StopPitMapping { id: id.clone() };
        let force_delete = ArrayCommand::DeletePitMapping {
            id: id.clone(),
            force: true,
        };

        if status.copy_rate == 0 {
            if status.source == volume {
                debug!("Raising copy rate of PiT mapping {} to drain {}", id, volume);
                self.client
                    .run(&ArrayCommand::ChangePitMapping {
                        id,
                        copy_rate: Some(DRAIN_COPY_RATE),
                        autodelete: Some(true),
                    })
                    .await?;
                return Ok(true);
            }
            if status.target != volume {
                return Err(Error::backend(
                    "lsvdiskfcmappings",
                    format!(
                        "volume {} is not part of PiT mapping {} ({} -> {})",
                        volume, status.id, status.source, status.target
                    ),
                ));
            }
            return match status.state {
                PitState::Copying | PitState::Prepared => {
                    self.client.run(&stop).await?;
                    Ok(true)
                }
                PitState::Stopping | PitState::Preparing => Ok(true),
                _ => {
                    self.client.run(&force_delete).await?;
                    Ok(false)
                }
            };
        }

        match status.state {
            PitState::Prepared => {
                self.client.run(&stop).await?;
                self.client.run(&force_delete).await?;
                Ok(false)
            }
            PitState::IdleOrCopied | PitState::Stopped => {
                self.client.run(&force_delete).await?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

fn check_size(name: &str, size_gb: u64, source_capacity: u64) -> Result<()> {
    if size_gb.checked_mul(GIB) != Some(source_capacity) {
        return Err(Error::InvalidInput(format!(
            "{} is {} GiB but its source has {} bytes",
            name, size_gb, source_capacity
        )));
    }
    Ok(())
}
