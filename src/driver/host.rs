//! Host objects for connectors
//!
//! A connector is matched to an array host by its initiator ports, never by
//! name: the name is derived from the connector's host name plus a random
//! suffix, so two connectors from machines with similar names never collide.
//! Lookups go through a read-through cache keyed by the connector's port
//! identity; every hit is checked against the array before it is trusted.

use super::ArrayDriver;
use crate::cli::{ArrayCommand, FabricFilter, HostPort, Record};
use crate::domain::Connector;
use crate::error::{Error, Result};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Room left for the `-xxxxxxxx` suffix within the 63 character name limit
const HOST_PREFIX_LEN: usize = 54;

/// Array host name for a connector host name.
///
/// Characters the array rejects become `-`, a `_` is prepended when the
/// name does not start with a letter, and a random 8 digit hex suffix keeps
/// names unique.
pub fn host_name_for(host: &str) -> Result<String> {
    let prefix = host_name_prefix(host)?;
    let suffix = Uuid::new_v4().simple().to_string();
    Ok(format!("{}-{}", prefix, &suffix[..8]))
}

fn host_name_prefix(host: &str) -> Result<String> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::InvalidInput("connector has no host name".into()));
    }
    let mut name: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert(0, '_');
    }
    name.truncate(HOST_PREFIX_LEN);
    Ok(name)
}

/// Cache key: the initiator name, or the sorted WWPNs
fn connector_key(connector: &Connector) -> Option<String> {
    if let Some(initiator) = connector.initiator.as_deref().filter(|i| !i.is_empty()) {
        return Some(format!("iqn:{}", initiator));
    }
    if connector.wwpns.is_empty() {
        return None;
    }
    let mut wwpns: Vec<String> = connector.wwpns.iter().map(|w| w.to_uppercase()).collect();
    wwpns.sort();
    Some(format!("wwpn:{}", wwpns.join(",")))
}

/// Whether a `lshost <name>` view lists any of the connector's ports
fn host_matches(record: &Record, connector: &Connector) -> bool {
    let by_iqn = connector
        .initiator
        .as_deref()
        .map_or(false, |iqn| record.get_all("iscsi_name").contains(&iqn));
    let by_wwpn = record.get_all("WWPN").iter().any(|registered| {
        connector
            .wwpns
            .iter()
            .any(|w| w.eq_ignore_ascii_case(registered))
    });
    by_iqn || by_wwpn
}

/// Every port the connector brings
fn connector_ports(connector: &Connector) -> Vec<HostPort> {
    let mut ports = Vec::new();
    if let Some(initiator) = connector.initiator.as_deref().filter(|i| !i.is_empty()) {
        ports.push(HostPort::Iscsi(initiator.to_string()));
    }
    for wwpn in &connector.wwpns {
        ports.push(HostPort::Wwpn(wwpn.to_uppercase()));
    }
    ports
}

impl ArrayDriver {
    /// Array host registered for the connector's ports, if any
    pub async fn find_host(&self, connector: &Connector) -> Result<Option<String>> {
        let key = connector_key(connector);
        if let Some(key) = &key {
            let cached = self.hosts.get(key).map(|entry| entry.value().clone());
            if let Some(name) = cached {
                if self.host_owns(&name, connector).await? {
                    return Ok(Some(name));
                }
                debug!("Cached host {} no longer matches the connector", name);
                self.hosts.remove(key);
            }
        }

        let found = match self.find_host_by_wwpn(connector).await? {
            Some(name) => Some(name),
            None => self.scan_hosts(connector).await?,
        };
        if let (Some(key), Some(name)) = (key, &found) {
            self.hosts.insert(key, name.clone());
        }
        Ok(found)
    }

    async fn find_host_by_wwpn(&self, connector: &Connector) -> Result<Option<String>> {
        for wwpn in &connector.wwpns {
            let logins = self
                .client
                .table(&ArrayCommand::ListFabric {
                    filter: FabricFilter::Wwpn(wwpn.clone()),
                })
                .await?;
            if let Some(login) = logins.first() {
                let name = login.require("name", "lsfabric")?;
                if !name.is_empty() {
                    debug!("WWPN {} is logged in as host {}", wwpn, name);
                    return Ok(Some(name.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn scan_hosts(&self, connector: &Connector) -> Result<Option<String>> {
        let hosts = self.client.table(&ArrayCommand::ListHosts).await?;
        for host in &hosts {
            let name = host.require("name", "lshost")?;
            if self.host_owns(name, connector).await? {
                return Ok(Some(name.to_string()));
            }
        }
        Ok(None)
    }

    async fn host_owns(&self, name: &str, connector: &Connector) -> Result<bool> {
        let command = ArrayCommand::ShowHost {
            name: name.to_string(),
        };
        match self.client.detail(&command).await {
            Ok(view) => Ok(view.first().map_or(false, |r| host_matches(r, connector))),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register a new host carrying every port of the connector
    #[instrument(skip(self, connector), fields(host = ?connector.host))]
    pub async fn create_host(&self, connector: &Connector) -> Result<String> {
        let host = connector
            .host
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("connector has no host name".into()))?;
        let name = host_name_for(host)?;
        let mut ports = connector_ports(connector).into_iter();
        let first = ports.next().ok_or_else(|| {
            Error::InvalidInput(format!("connector for {} has no initiator or WWPN", host))
        })?;

        info!("Creating host {} for {}", name, host);
        self.client
            .create(&ArrayCommand::CreateHost {
                name: name.clone(),
                port: first,
            })
            .await?;
        for port in ports {
            let added = self
                .client
                .run(&ArrayCommand::AddHostPort {
                    host: name.clone(),
                    port,
                })
                .await;
            if let Err(e) = added {
                error!("Failed to add a port to host {}: {}", name, e);
                if let Err(cleanup) = self.delete_host(&name).await {
                    warn!("Failed to remove partial host {}: {}", name, cleanup);
                }
                return Err(e);
            }
        }

        if let Some(key) = connector_key(connector) {
            self.hosts.insert(key, name.clone());
        }
        Ok(name)
    }

    /// Existing host for the connector, or a new one
    pub async fn get_or_create_host(&self, connector: &Connector) -> Result<String> {
        match self.find_host(connector).await? {
            Some(name) => {
                debug!("Reusing host {}", name);
                Ok(name)
            }
            None => self.create_host(connector).await,
        }
    }

    /// Delete a host and forget it
    pub async fn delete_host(&self, name: &str) -> Result<()> {
        info!("Deleting host: {}", name);
        let result = self
            .client
            .run(&ArrayCommand::DeleteHost {
                name: name.to_string(),
            })
            .await;
        self.hosts.retain(|_, cached| cached.as_str() != name);
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!("Host {} was already gone", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `(LUN, volume)` pairs mapped to a host
    pub(crate) async fn host_mappings(&self, host: &str) -> Result<Vec<(u32, String)>> {
        let listing = self
            .client
            .table(&ArrayCommand::ListHostMappings {
                host: host.to_string(),
            })
            .await?;
        let mut out = Vec::with_capacity(listing.len());
        for record in &listing {
            let lun = super::setup::parse_u32(record.require("SCSI_id", "lshostvdiskmap")?, "lshostvdiskmap")?;
            out.push((lun, record.require("vdisk_name", "lshostvdiskmap")?.to_string()));
        }
        Ok(out)
    }

    /// CHAP secret configured for a host
    pub(crate) async fn chap_secret_for_host(&self, host: &str) -> Result<Option<String>> {
        let listing = self.client.table(&ArrayCommand::ListIscsiAuth).await?;
        for record in &listing {
            if record.require("name", "lsiscsiauth")? != host {
                continue;
            }
            let method = record.require("iscsi_auth_method", "lsiscsiauth")?;
            let secret = record.require("iscsi_chap_secret", "lsiscsiauth")?;
            if method == "chap" && !secret.is_empty() {
                return Ok(Some(secret.to_string()));
            }
            return Ok(None);
        }
        Err(Error::backend(
            "lsiscsiauth",
            format!("host {} is not listed", host),
        ))
    }
}
