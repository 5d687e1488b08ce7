//! Setup and capability checks

use super::ArrayDriver;
use crate::cli::{ArrayCommand, Record};
use crate::domain::Protocol;
use crate::error::{Error, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Controller node as discovered at setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: String,
    pub name: String,
    pub wwnn: String,
    pub status: String,
    pub iogrp: u32,
    pub iscsi_name: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    /// Active Fibre Channel ports
    pub wwpns: Vec<String>,
    pub protocols: Vec<Protocol>,
}

impl StorageNode {
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

/// What `do_setup` learned about the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayProfile {
    pub system_id: String,
    pub system_name: String,
    pub pool: String,
    /// Extent size of the configured pool in MiB
    pub extent_size: u64,
    /// I/O groups with at least one node
    pub io_groups: Vec<u32>,
    pub nodes: Vec<StorageNode>,
}

impl ArrayProfile {
    /// Protocols offered by at least one node
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut out = Vec::new();
        for protocol in [Protocol::Iscsi, Protocol::FibreChannel] {
            if self.nodes.iter().any(|n| n.supports(protocol)) {
                out.push(protocol);
            }
        }
        out
    }

    pub fn node(&self, id: &str) -> Option<&StorageNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Licensed features
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Licenses {
    pub compression: bool,
}

impl ArrayDriver {
    /// Discover the system, the configured pool, I/O groups and nodes
    #[instrument(skip(self))]
    pub async fn do_setup(&self) -> Result<()> {
        info!("Setting up driver for pool {}", self.config.volpool_name);

        let system = self.client.detail(&ArrayCommand::ShowSystem).await?;
        let system = system
            .first()
            .ok_or_else(|| Error::backend("lssystem", "empty system view"))?;
        let system_id = system.require("id", "lssystem")?.to_string();
        let system_name = system.require("name", "lssystem")?.to_string();

        let pool = &self.config.volpool_name;
        let pool_view = match self
            .client
            .detail(&ArrayCommand::ShowPool { name: pool.clone() })
            .await
        {
            Ok(view) => view,
            Err(e) if e.is_not_found() => {
                return Err(Error::InvalidInput(format!("pool {} does not exist", pool)))
            }
            Err(e) => return Err(e),
        };
        let extent_size = pool_view
            .first()
            .ok_or_else(|| Error::InvalidInput(format!("pool {} does not exist", pool)))?
            .require_u64("extent_size", "lsmdiskgrp")?;

        let groups = self.client.table(&ArrayCommand::ListIoGroups).await?;
        let mut io_groups = Vec::new();
        for group in &groups {
            if group.require_u64("node_count", "lsiogrp")? > 0 {
                io_groups.push(parse_u32(group.require("id", "lsiogrp")?, "lsiogrp")?);
            }
        }

        let nodes = self.discover_nodes().await?;
        let licenses = self.licenses().await?;
        debug!("Array licenses: {:?}", licenses);

        let profile = ArrayProfile {
            system_id,
            system_name,
            pool: pool.clone(),
            extent_size,
            io_groups,
            nodes,
        };
        info!(
            "Array {} ({}): {} node(s), protocols {:?}",
            profile.system_name,
            profile.system_id,
            profile.nodes.len(),
            profile.protocols()
        );
        *self.profile.write() = Some(Arc::new(profile));
        Ok(())
    }

    /// Check configuration against what `do_setup` found
    pub async fn check_for_setup_error(&self) -> Result<()> {
        self.config.validate()?;
        let profile = self.profile()?;
        let options = self.config.volume_defaults()?;

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
        if !profile.protocols().contains(&options.protocol) {
            return Err(Error::InvalidInput(format!(
                "protocol {} is not supported by any node",
                options.protocol
            )));
        }
        debug!("Setup check passed");
        Ok(())
    }

    /// License check, cached for the process lifetime
    pub async fn licenses(&self) -> Result<Licenses> {
        let licenses = self
            .licenses
            .get_or_try_init(|| async {
                let view = self.client.detail(&ArrayCommand::ShowLicense).await?;
                let compression = view.first().map_or(false, |license| {
                    ["license_compression_capacity", "license_compression_enclosures"]
                        .iter()
                        .any(|key| license.get(key).map_or(false, is_nonzero))
                });
                Ok::<_, Error>(Licenses { compression })
            })
            .await?;
        Ok(*licenses)
    }

    async fn discover_nodes(&self) -> Result<Vec<StorageNode>> {
        let listing = self.client.table(&ArrayCommand::ListNodes).await?;
        let mut nodes = Vec::new();
        for record in &listing {
            nodes.push(node_from_record(record)?);
        }

        let ports = self.client.table(&ArrayCommand::ListPortIps).await?;
        for port in &ports {
            let node_id = port.require("node_id", "lsportip")?;
            let Some(node) = nodes.iter_mut().find(|n| n.id == node_id) else {
                continue;
            };
            for (key, list) in [("IP_address", &mut node.ipv4), ("IP_address_6", &mut node.ipv6)] {
                match port.get(key) {
                    Some(ip) if !ip.is_empty() && !list.iter().any(|i| i == ip) => {
                        list.push(ip.to_string())
                    }
                    _ => {}
                }
            }
        }

        let details = try_join_all(nodes.iter().map(|node| {
            let command = ArrayCommand::ShowNode { id: node.id.clone() };
            async move { self.client.detail(&command).await }
        }))
        .await?;
        for (node, detail) in nodes.iter_mut().zip(details) {
            for pair in detail.select(&["port_id", "port_status"]) {
                if pair[1] == "active" {
                    node.wwpns.push(pair[0].to_string());
                }
            }

            if !node.iscsi_name.is_empty() && !(node.ipv4.is_empty() && node.ipv6.is_empty()) {
                node.protocols.push(Protocol::Iscsi);
            }
            if !node.wwpns.is_empty() {
                node.protocols.push(Protocol::FibreChannel);
            }
            if node.protocols.is_empty() {
                warn!("Node {} offers neither iSCSI nor FC", node.name);
            }
        }
        Ok(nodes)
    }
}

fn node_from_record(record: &Record) -> Result<StorageNode> {
    const CMD: &str = "lsnodecanister";
    Ok(StorageNode {
        id: record.require("id", CMD)?.to_string(),
        name: record.require("name", CMD)?.to_string(),
        wwnn: record.require("WWNN", CMD)?.to_string(),
        status: record.require("status", CMD)?.to_string(),
        iogrp: parse_u32(record.require("IO_group_id", CMD)?, CMD)?,
        iscsi_name: record.require("iscsi_name", CMD)?.to_string(),
        ipv4: Vec::new(),
        ipv6: Vec::new(),
        wwpns: Vec::new(),
        protocols: Vec::new(),
    })
}

pub(crate) fn parse_u32(raw: &str, command: &str) -> Result<u32> {
    raw.trim().parse().map_err(|_| Error::MalformedResponse {
        command: command.to_string(),
        reason: format!("expected a number, got '{}'", raw),
    })
}

fn is_nonzero(raw: &str) -> bool {
    raw.trim().parse::<f64>().map_or(false, |v| v != 0.0)
}
