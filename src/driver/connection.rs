//! Attach and detach
//!
//! `initialize_connection` registers (or reuses) the connector's host, maps
//! the volume at a free LUN and describes the target the initiator should
//! log in to. Anything failing after the map exists is rolled back through
//! `terminate_connection`, which also removes hosts left without mappings.

use super::setup::StorageNode;
use super::ArrayDriver;
use crate::cli::{ArrayCommand, FabricFilter, Record};
use crate::domain::{ConnectionInfo, Connector, FcTarget, IscsiTarget, Protocol, VolumeSpec};
use crate::error::{Error, ObjectKind, Result};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const ISCSI_PORT: u16 = 3260;

impl ArrayDriver {
    /// Check the connector offers a port for at least one protocol the
    /// array serves
    pub fn validate_connector(&self, connector: &Connector) -> Result<()> {
        let protocols = self.profile()?.protocols();
        let has_iscsi = connector.initiator.as_deref().map_or(false, |i| !i.is_empty());
        let has_fc = !connector.wwpns.is_empty();

        let usable = protocols.iter().any(|p| match p {
            Protocol::Iscsi => has_iscsi,
            Protocol::FibreChannel => has_fc,
        });
        if !usable {
            return Err(Error::InvalidInput(format!(
                "connector for {} offers no port for the enabled protocols {:?}",
                connector.host.as_deref().unwrap_or("<unnamed>"),
                protocols
            )));
        }
        Ok(())
    }

    /// Map `volume` to the connector's host and describe the target
    #[instrument(skip(self, volume, connector), fields(volume = %volume.name))]
    pub async fn initialize_connection(
        &self,
        volume: &VolumeSpec,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        info!("Initializing connection for volume {}", volume.name);
        self.validate_connector(connector)?;
        let options = self.volume_options(&volume.options).await?;
        let host = self.get_or_create_host(connector).await?;

        let chap = if options.protocol == Protocol::Iscsi {
            self.ensure_chap_secret(&host).await?
        } else {
            None
        };

        let lun = match self.map_volume_to_host(&volume.name, &host).await {
            Ok(lun) => lun,
            Err(e) => {
                error!("Failed to map volume {} to host {}: {}", volume.name, host, e);
                if let Err(cleanup) = self.delete_host_if_unused(&host).await {
                    warn!("Failed to remove unused host {}: {}", host, cleanup);
                }
                return Err(e);
            }
        };
        let described = self
            .describe_target(&volume.name, &host, lun, options.protocol, options.multipath, chap, connector)
            .await;
        match described {
            Ok(info) => {
                info!("Volume {} mapped to host {} at LUN {}", volume.name, host, lun);
                Ok(info)
            }
            Err(e) => {
                error!("Failed to describe target for volume {}: {}", volume.name, e);
                if let Err(rollback) = self.terminate_connection(&volume.name, connector).await {
                    warn!(
                        "Failed to roll back mapping of {} to {}: {}",
                        volume.name, host, rollback
                    );
                }
                Err(e)
            }
        }
    }

    /// Existing CHAP secret, or a fresh one when CHAP is required
    async fn ensure_chap_secret(&self, host: &str) -> Result<Option<String>> {
        if let Some(secret) = self.chap_secret_for_host(host).await? {
            return Ok(Some(secret));
        }
        if !self.config.iscsi_chap_enabled {
            return Ok(None);
        }
        let secret = Uuid::new_v4().simple().to_string();
        debug!("Setting CHAP secret for host {}", host);
        self.client
            .run(&ArrayCommand::SetChapSecret {
                host: host.to_string(),
                secret: secret.clone(),
            })
            .await?;
        Ok(Some(secret))
    }

    /// Map a volume to a host, reusing an existing mapping's LUN
    async fn map_volume_to_host(&self, volume: &str, host: &str) -> Result<u32> {
        let mappings = self.host_mappings(host).await?;
        if let Some((lun, _)) = mappings.iter().find(|(_, v)| v == volume) {
            debug!("Volume {} already mapped to {} at LUN {}", volume, host, lun);
            return Ok(*lun);
        }

        let lun = lowest_free_lun(mappings.iter().map(|(lun, _)| *lun));
        let command = |force| ArrayCommand::MapVolume {
            volume: volume.to_string(),
            host: host.to_string(),
            lun,
            force,
        };
        match self.client.create(&command(false)).await {
            Ok(_) => Ok(lun),
            Err(Error::InUse {
                kind: ObjectKind::Volume,
                reason,
                ..
            }) => {
                if !self.config.multihostmap_enabled {
                    error!("Volume {} is mapped to another host and multihostmap is disabled", volume);
                    return Err(Error::InUse {
                        kind: ObjectKind::Volume,
                        name: volume.to_string(),
                        reason,
                    });
                }
                info!("Volume {} is mapped to another host, mapping with -force", volume);
                self.client.create(&command(true)).await?;
                Ok(lun)
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn describe_target(
        &self,
        volume: &str,
        host: &str,
        lun: u32,
        protocol: Protocol,
        multipath: bool,
        chap: Option<String>,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let attrs = self
            .get_volume_attributes(volume)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: ObjectKind::Volume,
                name: volume.to_string(),
            })?;
        let volume_id = attrs.require("vdisk_UID", "lsvdisk")?.to_string();
        let node = self.target_node(&attrs, protocol)?;

        match protocol {
            Protocol::Iscsi => {
                let ip = node
                    .ipv4
                    .first()
                    .cloned()
                    .or_else(|| node.ipv6.first().map(|ip| format!("[{}]", ip)))
                    .ok_or_else(|| {
                        Error::backend(
                            "initialize_connection",
                            format!("node {} has no iSCSI address", node.name),
                        )
                    })?;
                let (auth_method, auth_username, auth_password) = match chap {
                    Some(secret) => (
                        Some("CHAP".to_string()),
                        connector.initiator.clone(),
                        Some(secret),
                    ),
                    None => (None, None, None),
                };
                Ok(ConnectionInfo::Iscsi(IscsiTarget {
                    target_discovered: false,
                    target_iqn: node.iscsi_name.clone(),
                    target_portal: format!("{}:{}", ip, ISCSI_PORT),
                    target_lun: lun,
                    volume_id,
                    auth_method,
                    auth_username,
                    auth_password,
                }))
            }
            Protocol::FibreChannel => {
                let logged_in = self.fabric_wwpns(host).await?;
                let target_wwn = if logged_in.is_empty() {
                    warn!("No fabric logins for host {}, using node ports", host);
                    if multipath {
                        self.io_group_wwpns(node.iogrp)?
                    } else {
                        node.wwpns.iter().take(1).cloned().collect()
                    }
                } else if multipath {
                    logged_in
                } else {
                    let preferred = logged_in.iter().find(|w| node.wwpns.contains(w));
                    vec![preferred.unwrap_or(&logged_in[0]).clone()]
                };
                if target_wwn.is_empty() {
                    return Err(Error::backend(
                        "initialize_connection",
                        format!("no target WWPN for host {}", host),
                    ));
                }
                Ok(ConnectionInfo::FibreChannel(FcTarget {
                    target_discovered: false,
                    target_wwn,
                    target_lun: lun,
                    volume_id,
                }))
            }
        }
    }

    /// Preferred node of the volume, or the first node of its I/O group
    /// that speaks the protocol
    fn target_node(&self, attrs: &Record, protocol: Protocol) -> Result<StorageNode> {
        let preferred = attrs.get("preferred_node_id").ok_or_else(|| {
            Error::backend("lsvdisk", "volume attributes lack preferred_node_id")
        })?;
        let iogrp = super::setup::parse_u32(attrs.require("IO_group_id", "lsvdisk")?, "lsvdisk")?;
        let profile = self.profile()?;

        if !preferred.is_empty() {
            if let Some(node) = profile.node(preferred).filter(|n| n.supports(protocol)) {
                return Ok(node.clone());
            }
            warn!("Preferred node {} cannot serve {}", preferred, protocol);
        }
        profile
            .nodes
            .iter()
            .find(|n| n.iogrp == iogrp && n.supports(protocol))
            .cloned()
            .ok_or_else(|| {
                Error::backend(
                    "initialize_connection",
                    format!("no node in I/O group {} serves {}", iogrp, protocol),
                )
            })
    }

    /// Node ports the host has logged in to
    async fn fabric_wwpns(&self, host: &str) -> Result<Vec<String>> {
        let logins = self
            .client
            .table(&ArrayCommand::ListFabric {
                filter: FabricFilter::Host(host.to_string()),
            })
            .await?;
        let mut wwpns = Vec::new();
        for login in &logins {
            let remote = login.require("remote_wwpn", "lsfabric")?;
            let local = login.require("local_wwpn", "lsfabric")?;
            debug!("{} logged in to {}", remote, local);
            if !wwpns.iter().any(|w: &String| w == local) {
                wwpns.push(local.to_string());
            }
        }
        Ok(wwpns)
    }

    fn io_group_wwpns(&self, iogrp: u32) -> Result<Vec<String>> {
        let profile = self.profile()?;
        Ok(profile
            .nodes
            .iter()
            .filter(|n| n.iogrp == iogrp)
            .flat_map(|n| n.wwpns.iter().cloned())
            .collect())
    }

    /// Unmap `volume` from the connector's host and delete the host once
    /// nothing is mapped to it. A connector without a host name detaches
    /// the volume from every host.
    #[instrument(skip(self, connector))]
    pub async fn terminate_connection(&self, volume: &str, connector: &Connector) -> Result<()> {
        info!("Terminating connection for volume {}", volume);
        if connector.host.is_none() {
            return self.unmap_from_all_hosts(volume).await;
        }

        let Some(host) = self.find_host(connector).await? else {
            if self.volume_hosts(volume).await?.is_empty() {
                info!("Volume {} has no mappings, nothing to terminate", volume);
                return Ok(());
            }
            return Err(Error::backend(
                "terminate_connection",
                format!("no host found for connector of volume {}", volume),
            ));
        };

        self.unmap(volume, &host).await?;
        self.delete_host_if_unused(&host).await
    }

    async fn unmap_from_all_hosts(&self, volume: &str) -> Result<()> {
        for host in self.volume_hosts(volume).await? {
            self.unmap(volume, &host).await?;
            self.delete_host_if_unused(&host).await?;
        }
        Ok(())
    }

    async fn unmap(&self, volume: &str, host: &str) -> Result<()> {
        let command = ArrayCommand::UnmapVolume {
            volume: volume.to_string(),
            host: host.to_string(),
        };
        match self.client.run(&command).await {
            Ok(_) => {
                debug!("Unmapped {} from {}", volume, host);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("Volume {} is not mapped to host {}", volume, host);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_host_if_unused(&self, host: &str) -> Result<()> {
        if self.host_mappings(host).await?.is_empty() {
            self.delete_host(host).await?;
        }
        Ok(())
    }

    /// Hosts the volume is mapped to; a missing volume has none
    async fn volume_hosts(&self, volume: &str) -> Result<Vec<String>> {
        let command = ArrayCommand::ListVolumeMappings {
            volume: volume.to_string(),
        };
        let listing = match self.client.table(&command).await {
            Ok(listing) => listing,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        listing
            .iter()
            .map(|r| r.require("host_name", "lsvdiskhostmap").map(str::to_string))
            .collect()
    }
}

fn lowest_free_lun(used: impl Iterator<Item = u32>) -> u32 {
    let mut used: Vec<u32> = used.collect();
    used.sort_unstable();
    used.dedup();
    let mut lun = 0;
    for taken in used {
        if taken != lun {
            break;
        }
        lun += 1;
    }
    lun
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Fault;
    use crate::driver::testing::setup_driver;
    use assert_matches::assert_matches;

    #[test]
    fn test_lowest_free_lun() {
        assert_eq!(lowest_free_lun([].into_iter()), 0);
        assert_eq!(lowest_free_lun([0, 1, 3].into_iter()), 2);
        assert_eq!(lowest_free_lun([1, 2].into_iter()), 0);
        assert_eq!(lowest_free_lun([2, 0, 1, 1].into_iter()), 3);
    }

    #[tokio::test]
    async fn test_validate_connector() {
        let (driver, _sim, _) = setup_driver().await;
        driver
            .validate_connector(&Connector::iscsi("h", "iqn.test:1"))
            .unwrap();
        driver
            .validate_connector(&Connector::fibre_channel("h", vec!["AA".into()]))
            .unwrap();
        let bare = Connector {
            host: Some("h".into()),
            ..Default::default()
        };
        assert_matches!(driver.validate_connector(&bare), Err(Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_iscsi_connection_with_chap() {
        let (driver, sim, _) = setup_driver().await;
        let volume = VolumeSpec::new("1", "vol", 1);
        driver.create_volume(&volume).await.unwrap();
        let connector = Connector::iscsi("compute-1", "iqn.test:compute-1");

        let info = driver.initialize_connection(&volume, &connector).await.unwrap();
        let ConnectionInfo::Iscsi(target) = info else {
            panic!("expected an iSCSI target");
        };
        assert_eq!(target.target_lun, 0);
        assert_eq!(target.target_portal, "1.234.56.78:3260");
        assert_eq!(target.target_iqn, "iqn.1982-01.com.ibm:1234.sim.node1");
        assert_eq!(target.auth_method.as_deref(), Some("CHAP"));
        assert_eq!(target.auth_username.as_deref(), Some("iqn.test:compute-1"));
        assert!(target.auth_password.is_some());
        assert_eq!(sim.issued("chhost"), 1);
    }

    #[tokio::test]
    async fn test_missing_preferred_node_rolls_back() {
        let (driver, sim, _) = setup_driver().await;
        let volume = VolumeSpec::new("1", "vol", 1);
        driver.create_volume(&volume).await.unwrap();
        let connector = Connector::iscsi("compute-1", "iqn.test:compute-1");

        sim.inject("lsvdisk", Fault::NoPrefNode);
        let err = driver.initialize_connection(&volume, &connector).await.unwrap_err();
        assert_matches!(err, Error::BackendApi { .. });
        assert!(sim.inspect(|m| m.host_mappings.is_empty() && m.hosts.is_empty()));
    }

    #[tokio::test]
    async fn test_blank_preferred_node_uses_io_group() {
        let (driver, sim, _) = setup_driver().await;
        let volume = VolumeSpec::new("1", "vol", 1);
        driver.create_volume(&volume).await.unwrap();

        sim.inject("lsvdisk", Fault::BlankPrefNode);
        let info = driver
            .initialize_connection(&volume, &Connector::iscsi("h", "iqn.test:h"))
            .await
            .unwrap();
        assert_matches!(info, ConnectionInfo::Iscsi(ref t) if t.target_iqn.ends_with("node1"));
    }

    #[tokio::test]
    async fn test_second_volume_gets_next_lun() {
        let (driver, _sim, _) = setup_driver().await;
        let connector = Connector::iscsi("h", "iqn.test:h");
        for (id, name) in [("1", "vol1"), ("2", "vol2")] {
            driver.create_volume(&VolumeSpec::new(id, name, 1)).await.unwrap();
        }
        let first = driver
            .initialize_connection(&VolumeSpec::new("1", "vol1", 1), &connector)
            .await
            .unwrap();
        let second = driver
            .initialize_connection(&VolumeSpec::new("2", "vol2", 1), &connector)
            .await
            .unwrap();
        assert_eq!((first.lun(), second.lun()), (0, 1));
    }
}
