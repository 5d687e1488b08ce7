//! Array object store
//!
//! Volumes with their copies, hosts, host mappings, pools and PiT mappings
//! as the array keeps them. Every mutation checks the array's invariants
//! first and reports violations as an [`ArrayFault`] carrying the code the
//! array would print, so callers above the transport see exactly what a
//! real array returns.

use super::state::{PitEvent, PitMapping};
use crate::cli::{validate_object_name, CreateVolume, HostPort, ProvisioningParams};
use crate::error::ArrayErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pool names a fresh model carries besides the primary pool
pub const SECONDARY_POOL: &str = "silver";
pub const NARROW_EXTENT_POOL: &str = "bronze";

/// Array-side failure: the code and the text printed after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayFault {
    pub code: ArrayErrorCode,
    pub detail: String,
}

impl ArrayFault {
    pub fn new(code: ArrayErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Text the array prints on stderr
    pub fn stderr(&self) -> String {
        format!("{} {}", self.code, self.detail)
    }
}

impl std::fmt::Display for ArrayFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stderr())
    }
}

pub type Outcome<T> = std::result::Result<T, ArrayFault>;

// =============================================================================
// Entities
// =============================================================================

/// Storage pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: u32,
    pub name: String,
    /// Raw capacity in bytes
    pub capacity: u64,
    /// Extent size in MiB
    pub extent_size: u64,
    /// Space consumed by objects the driver does not manage
    pub base_used: u64,
}

/// I/O group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoGroup {
    pub id: u32,
    pub name: String,
    pub node_count: u32,
}

/// Fibre Channel port on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePort {
    pub wwpn: String,
    pub active: bool,
}

/// Controller node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub wwnn: String,
    pub iogrp: u32,
    pub iscsi_name: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub ports: Vec<NodePort>,
}

/// One physical copy of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCopy {
    pub id: u32,
    pub pool: String,
    pub sync: bool,
    pub primary: bool,
    pub rsize: i32,
    pub easytier: bool,
    pub compressed: bool,
    pub grainsize: u32,
}

impl VolumeCopy {
    fn from_params(id: u32, params: &ProvisioningParams, primary: bool) -> Self {
        Self {
            id,
            pool: params.pool.clone(),
            sync: primary,
            primary,
            rsize: params.rsize,
            easytier: params.easytier,
            compressed: params.compression,
            grainsize: params.grainsize,
        }
    }

    pub fn is_thin(&self) -> bool {
        self.rsize != -1
    }

    /// Bytes the copy consumes in its pool
    pub fn real_capacity(&self, capacity: u64) -> u64 {
        if self.is_thin() {
            capacity / 100 * self.rsize as u64
        } else {
            capacity
        }
    }
}

/// Virtual disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u32,
    pub name: String,
    pub uid: String,
    /// Virtual capacity in bytes
    pub capacity: u64,
    pub iogrp: u32,
    pub preferred_node: Option<String>,
    pub autoexpand: bool,
    pub warning: u32,
    pub copies: BTreeMap<u32, VolumeCopy>,
}

impl Volume {
    pub fn primary_copy(&self) -> Option<&VolumeCopy> {
        self.copies
            .values()
            .find(|c| c.primary)
            .or_else(|| self.copies.values().next())
    }

    /// Pool of the primary copy; `many` while copies live in several pools
    pub fn pool(&self) -> &str {
        let mut pools = self.copies.values().map(|c| c.pool.as_str());
        match pools.next() {
            Some(first) if pools.all(|p| p == first) => first,
            Some(_) => "many",
            None => "",
        }
    }
}

/// Host object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: u32,
    pub name: String,
    pub iscsi_names: Vec<String>,
    pub wwpns: Vec<String>,
    pub chap_secret: Option<String>,
}

impl Host {
    fn owns(&self, port: &HostPort) -> bool {
        match port {
            HostPort::Iscsi(iqn) => self.iscsi_names.iter().any(|n| n == iqn),
            HostPort::Wwpn(wwpn) => self.wwpns.iter().any(|w| w.eq_ignore_ascii_case(wwpn)),
        }
    }

    fn add(&mut self, port: &HostPort) {
        match port {
            HostPort::Iscsi(iqn) => self.iscsi_names.push(iqn.clone()),
            HostPort::Wwpn(wwpn) => self.wwpns.push(wwpn.to_ascii_uppercase()),
        }
    }

    pub fn port_count(&self) -> usize {
        self.iscsi_names.len() + self.wwpns.len()
    }
}

/// Volume exposed to a host at a LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMapping {
    pub id: u32,
    pub host: String,
    pub volume: String,
    pub lun: u32,
}

// =============================================================================
// Store
// =============================================================================

/// Everything the array knows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayModel {
    pub system_id: String,
    pub system_name: String,
    pub compression_licensed: bool,
    pub pools: BTreeMap<String, Pool>,
    pub io_groups: Vec<IoGroup>,
    pub nodes: Vec<Node>,
    pub volumes: BTreeMap<String, Volume>,
    pub hosts: BTreeMap<String, Host>,
    pub host_mappings: BTreeMap<u32, HostMapping>,
    pub pit_mappings: BTreeMap<u32, PitMapping>,
}

/// Lowest id not yet taken
fn unused_id(taken: impl Iterator<Item = u32>) -> u32 {
    let mut ids: Vec<u32> = taken.collect();
    ids.sort_unstable();
    let mut next = 0;
    for id in ids {
        if id == next {
            next += 1;
        } else if id > next {
            break;
        }
    }
    next
}

fn missing(what: &str, name: &str) -> ArrayFault {
    ArrayFault::new(
        ArrayErrorCode::ObjectMissing,
        format!("The {} {} does not exist.", what, name),
    )
}

fn unknown(what: &str, name: &str) -> ArrayFault {
    ArrayFault::new(
        ArrayErrorCode::ObjectUnknown,
        format!(
            "The {} {} does not exist or the name supplied is incorrect.",
            what, name
        ),
    )
}

impl ArrayModel {
    /// Two-node array with three pools: `primary_pool`, [`SECONDARY_POOL`]
    /// with the same extent size and [`NARROW_EXTENT_POOL`] with a smaller one.
    pub fn new(primary_pool: &str) -> Self {
        let mut pools = BTreeMap::new();
        let specs = [
            (primary_pool, 256, 43_486_543_872),
            (SECONDARY_POOL, 256, 0),
            (NARROW_EXTENT_POOL, 128, 0),
        ];
        for (id, (name, extent_size, base_used)) in specs.into_iter().enumerate() {
            pools.entry(name.to_string()).or_insert(Pool {
                id: id as u32 + 1,
                name: name.to_string(),
                capacity: 3_573_412_790_272,
                extent_size,
                base_used,
            });
        }

        let io_groups = vec![
            IoGroup { id: 0, name: "io_grp0".into(), node_count: 2 },
            IoGroup { id: 1, name: "io_grp1".into(), node_count: 2 },
            IoGroup { id: 2, name: "io_grp2".into(), node_count: 0 },
            IoGroup { id: 3, name: "io_grp3".into(), node_count: 0 },
            IoGroup { id: 4, name: "recovery_io_grp".into(), node_count: 0 },
        ];

        let nodes = vec![
            Node {
                id: "1".into(),
                name: "node1".into(),
                wwnn: "500507680200C744".into(),
                iogrp: 0,
                iscsi_name: "iqn.1982-01.com.ibm:1234.sim.node1".into(),
                ipv4: Some("1.234.56.78".into()),
                ipv6: None,
                ports: vec![
                    NodePort { wwpn: "500507680210C744".into(), active: true },
                    NodePort { wwpn: "500507680220C744".into(), active: true },
                ],
            },
            Node {
                id: "2".into(),
                name: "node2".into(),
                wwnn: "500507680200C745".into(),
                iogrp: 0,
                iscsi_name: "iqn.1982-01.com.ibm:1234.sim.node2".into(),
                ipv4: Some("1.234.56.79".into()),
                ipv6: None,
                ports: vec![
                    NodePort { wwpn: "500507680220C745".into(), active: true },
                    NodePort { wwpn: "500507680230C745".into(), active: false },
                ],
            },
        ];

        Self {
            system_id: "0123456789ABCDEF".into(),
            system_name: "flash-array-sim".into(),
            compression_licensed: true,
            pools,
            io_groups,
            nodes,
            volumes: BTreeMap::new(),
            hosts: BTreeMap::new(),
            host_mappings: BTreeMap::new(),
            pit_mappings: BTreeMap::new(),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn volume(&self, name: &str) -> Outcome<&Volume> {
        self.volumes.get(name).ok_or_else(|| unknown("virtual disk", name))
    }

    pub fn host(&self, name: &str) -> Outcome<&Host> {
        self.hosts.get(name).ok_or_else(|| unknown("host", name))
    }

    pub fn pool(&self, name: &str) -> Outcome<&Pool> {
        self.pools.get(name).ok_or_else(|| unknown("storage pool", name))
    }

    /// PiT mapping by numeric id or name
    pub fn pit_id(&self, id: &str) -> Outcome<u32> {
        self.pit_mappings
            .values()
            .find(|m| m.id.to_string() == id || m.name == id)
            .map(|m| m.id)
            .ok_or_else(|| missing("FlashCopy mapping", id))
    }

    pub fn mappings_of_host(&self, host: &str) -> impl Iterator<Item = &HostMapping> {
        let host = host.to_string();
        self.host_mappings.values().filter(move |m| m.host == host)
    }

    pub fn mappings_of_volume(&self, volume: &str) -> impl Iterator<Item = &HostMapping> {
        let volume = volume.to_string();
        self.host_mappings.values().filter(move |m| m.volume == volume)
    }

    pub fn pits_of_volume(&self, volume: &str) -> impl Iterator<Item = &PitMapping> {
        let volume = volume.to_string();
        self.pit_mappings.values().filter(move |m| m.involves(&volume))
    }

    /// Bytes consumed in a pool, including space outside the driver's control
    pub fn pool_used(&self, pool: &Pool) -> u64 {
        let mut used = pool.base_used;
        for volume in self.volumes.values() {
            for copy in volume.copies.values().filter(|c| c.pool == pool.name) {
                used = used.saturating_add(copy.real_capacity(volume.capacity));
            }
        }
        used
    }

    pub fn pool_virtual(&self, pool: &Pool) -> u64 {
        self.volumes
            .values()
            .filter(|v| v.copies.values().any(|c| c.pool == pool.name))
            .map(|v| v.capacity)
            .sum()
    }

    pub fn pool_free(&self, pool: &Pool) -> u64 {
        pool.capacity.saturating_sub(self.pool_used(pool))
    }

    fn check_provisioning(&self, params: &ProvisioningParams) -> Outcome<()> {
        self.pool(&params.pool)?;
        if params.compression && !self.compression_licensed {
            return Err(ArrayFault::new(
                ArrayErrorCode::CompressionUnsupported,
                "Compression is not supported on this system.",
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    pub fn create_volume(&mut self, req: &CreateVolume) -> Outcome<u32> {
        if validate_object_name(&req.name).is_err() {
            return Err(ArrayFault::new(
                ArrayErrorCode::InvalidName,
                format!("The name {} contains invalid characters.", req.name),
            ));
        }
        if self.volumes.contains_key(&req.name) {
            return Err(ArrayFault::new(
                ArrayErrorCode::NameInUse,
                format!("The virtual disk {} already exists.", req.name),
            ));
        }
        self.check_provisioning(&req.params)?;
        let iogrp = self
            .io_groups
            .iter()
            .find(|g| g.id == req.iogrp && g.node_count > 0)
            .ok_or_else(|| unknown("I/O group", &req.iogrp.to_string()))?;
        let preferred_node = self
            .nodes
            .iter()
            .find(|n| n.iogrp == iogrp.id)
            .map(|n| n.id.clone());

        let id = unused_id(self.volumes.values().map(|v| v.id));
        let mut copies = BTreeMap::new();
        copies.insert(0, VolumeCopy::from_params(0, &req.params, true));
        self.volumes.insert(
            req.name.clone(),
            Volume {
                id,
                name: req.name.clone(),
                uid: format!("60050768{:024X}", id),
                capacity: req.size_bytes,
                iogrp: req.iogrp,
                preferred_node,
                autoexpand: req.params.autoexpand,
                warning: req.params.warning,
                copies,
            },
        );
        Ok(id)
    }

    /// Remove a volume. Without `force` it must be unmapped and free of
    /// PiT mappings; with `force` both are dropped along with it.
    pub fn delete_volume(&mut self, name: &str, force: bool) -> Outcome<()> {
        if !self.volumes.contains_key(name) {
            return Err(missing("virtual disk", name));
        }
        let mapped = self.mappings_of_volume(name).next().is_some();
        let in_pit = self.pits_of_volume(name).next().is_some();
        if (mapped || in_pit) && !force {
            return Err(ArrayFault::new(
                ArrayErrorCode::VolumeInUse,
                format!(
                    "The virtual disk {} is mapped to a host or is part of a FlashCopy mapping.",
                    name
                ),
            ));
        }
        self.host_mappings.retain(|_, m| m.volume != name);
        self.pit_mappings.retain(|_, m| !m.involves(name));
        self.volumes.remove(name);
        Ok(())
    }

    pub fn expand_volume(&mut self, name: &str, size_gb: u64) -> Outcome<()> {
        let volume = self
            .volumes
            .get_mut(name)
            .ok_or_else(|| missing("virtual disk", name))?;
        volume.capacity = volume
            .capacity
            .saturating_add(size_gb.saturating_mul(crate::domain::GIB));
        Ok(())
    }

    // =========================================================================
    // Volume copies
    // =========================================================================

    pub fn add_copy(&mut self, volume: &str, params: &ProvisioningParams) -> Outcome<(u32, u32)> {
        self.check_provisioning(params)?;
        let vol = self
            .volumes
            .get_mut(volume)
            .ok_or_else(|| missing("virtual disk", volume))?;
        let copy_id = unused_id(vol.copies.keys().copied());
        vol.copies
            .insert(copy_id, VolumeCopy::from_params(copy_id, params, false));
        Ok((vol.id, copy_id))
    }

    /// Read one copy; reading moves an unsynchronised copy along so the
    /// next read reports it in sync.
    pub fn observe_copy(&mut self, volume: &str, copy: &str) -> Outcome<VolumeCopy> {
        let vol = self
            .volumes
            .get_mut(volume)
            .ok_or_else(|| missing("virtual disk", volume))?;
        let entry = copy
            .parse::<u32>()
            .ok()
            .and_then(|id| vol.copies.get_mut(&id))
            .ok_or_else(|| {
                ArrayFault::new(
                    ArrayErrorCode::CopyMissing,
                    format!("The copy {} of virtual disk {} does not exist.", copy, volume),
                )
            })?;
        let seen = entry.clone();
        entry.sync = true;
        Ok(seen)
    }

    pub fn remove_copy(&mut self, volume: &str, copy: &str) -> Outcome<()> {
        let vol = self
            .volumes
            .get_mut(volume)
            .ok_or_else(|| missing("virtual disk", volume))?;
        let copy_missing = || {
            ArrayFault::new(
                ArrayErrorCode::CopyMissing,
                format!("The copy {} of virtual disk {} does not exist.", copy, volume),
            )
        };
        let id = copy.parse::<u32>().map_err(|_| copy_missing())?;
        if !vol.copies.contains_key(&id) {
            return Err(copy_missing());
        }
        if vol.copies.len() == 1 {
            return Err(ArrayFault::new(
                ArrayErrorCode::VolumeInUse,
                format!("Copy {} is the last copy of virtual disk {}.", id, volume),
            ));
        }
        if let Some(removed) = vol.copies.remove(&id) {
            if removed.primary {
                if let Some(next) = vol.copies.values_mut().next() {
                    next.primary = true;
                }
            }
        }
        Ok(())
    }

    /// Move a single-copy volume to another pool with the same extent size
    pub fn migrate_volume(&mut self, volume: &str, pool: &str) -> Outcome<()> {
        let target_extent = self.pool(pool)?.extent_size;
        let vol = self.volume(volume)?;
        if vol.copies.len() != 1 {
            return Err(ArrayFault::new(
                ArrayErrorCode::VolumeInUse,
                format!("The virtual disk {} has more than one copy.", volume),
            ));
        }
        let current = vol.pool().to_string();
        if current == pool {
            return Err(ArrayFault::new(
                ArrayErrorCode::SamePool,
                format!("The virtual disk {} is already in storage pool {}.", volume, pool),
            ));
        }
        if self.pool(&current)?.extent_size != target_extent {
            return Err(ArrayFault::new(
                ArrayErrorCode::ExtentMismatch,
                format!(
                    "The extent sizes of storage pools {} and {} differ.",
                    current, pool
                ),
            ));
        }
        if let Some(copy) = self
            .volumes
            .get_mut(volume)
            .and_then(|v| v.copies.values_mut().next())
        {
            copy.pool = pool.to_string();
        }
        Ok(())
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    fn port_owner(&self, port: &HostPort) -> Option<&Host> {
        self.hosts.values().find(|h| h.owns(port))
    }

    pub fn create_host(&mut self, name: &str, port: &HostPort) -> Outcome<u32> {
        if validate_object_name(name).is_err() {
            return Err(ArrayFault::new(
                ArrayErrorCode::InvalidName,
                format!("The name {} contains invalid characters.", name),
            ));
        }
        if self.hosts.contains_key(name) {
            return Err(ArrayFault::new(
                ArrayErrorCode::NameInUse,
                format!("The host {} already exists.", name),
            ));
        }
        if let Some(owner) = self.port_owner(port) {
            return Err(ArrayFault::new(
                ArrayErrorCode::PortAssigned,
                format!("Port {} is already assigned to host {}.", port.value(), owner.name),
            ));
        }
        let id = unused_id(self.hosts.values().map(|h| h.id));
        let mut host = Host {
            id,
            name: name.to_string(),
            ..Default::default()
        };
        host.add(port);
        self.hosts.insert(name.to_string(), host);
        Ok(id)
    }

    pub fn add_host_port(&mut self, host: &str, port: &HostPort) -> Outcome<()> {
        if !self.hosts.contains_key(host) {
            return Err(missing("host", host));
        }
        if let Some(owner) = self.port_owner(port) {
            if owner.name == host {
                return Ok(());
            }
            return Err(ArrayFault::new(
                ArrayErrorCode::PortAssigned,
                format!("Port {} is already assigned to host {}.", port.value(), owner.name),
            ));
        }
        if let Some(entry) = self.hosts.get_mut(host) {
            entry.add(port);
        }
        Ok(())
    }

    pub fn set_chap_secret(&mut self, host: &str, secret: &str) -> Outcome<()> {
        let entry = self.hosts.get_mut(host).ok_or_else(|| missing("host", host))?;
        entry.chap_secret = Some(secret.to_string());
        Ok(())
    }

    pub fn delete_host(&mut self, name: &str) -> Outcome<()> {
        if !self.hosts.contains_key(name) {
            return Err(missing("host", name));
        }
        if self.mappings_of_host(name).next().is_some() {
            return Err(ArrayFault::new(
                ArrayErrorCode::HostHasMappings,
                format!("The host {} has virtual disk mappings.", name),
            ));
        }
        self.hosts.remove(name);
        Ok(())
    }

    // =========================================================================
    // Host mappings
    // =========================================================================

    /// Map a volume to a host. A volume appears at most once per host and a
    /// LUN at most once per host; `force` only allows exposing a volume that
    /// is already mapped to another host.
    pub fn map_volume(&mut self, volume: &str, host: &str, lun: u32, force: bool) -> Outcome<u32> {
        if !self.volumes.contains_key(volume) {
            return Err(missing("virtual disk", volume));
        }
        if !self.hosts.contains_key(host) {
            return Err(unknown("host", host));
        }
        if self.mappings_of_volume(volume).any(|m| m.host == host) {
            return Err(ArrayFault::new(
                ArrayErrorCode::AlreadyMapped,
                format!("The virtual disk {} is already mapped to host {}.", volume, host),
            ));
        }
        if self.mappings_of_host(host).any(|m| m.lun == lun) {
            return Err(ArrayFault::new(
                ArrayErrorCode::LunTaken,
                format!("SCSI id {} is already in use on host {}.", lun, host),
            ));
        }
        if !force && self.mappings_of_volume(volume).next().is_some() {
            return Err(ArrayFault::new(
                ArrayErrorCode::AlreadyMapped,
                format!("The virtual disk {} is already mapped to another host.", volume),
            ));
        }
        let id = unused_id(self.host_mappings.keys().copied());
        self.host_mappings.insert(
            id,
            HostMapping {
                id,
                host: host.to_string(),
                volume: volume.to_string(),
                lun,
            },
        );
        Ok(id)
    }

    pub fn unmap_volume(&mut self, volume: &str, host: &str) -> Outcome<()> {
        if !self.volumes.contains_key(volume) {
            return Err(missing("virtual disk", volume));
        }
        let id = self
            .host_mappings
            .values()
            .find(|m| m.volume == volume && m.host == host)
            .map(|m| m.id)
            .ok_or_else(|| missing("virtual disk to host mapping", volume))?;
        self.host_mappings.remove(&id);
        Ok(())
    }

    // =========================================================================
    // PiT mappings
    // =========================================================================

    pub fn create_pit(
        &mut self,
        source: &str,
        target: &str,
        copy_rate: u32,
        autodelete: bool,
    ) -> Outcome<u32> {
        let source_size = self.volume(source)?.capacity;
        let target_size = self.volume(target)?.capacity;
        if source == target {
            return Err(ArrayFault::new(
                ArrayErrorCode::SameSourceTarget,
                "The source and target virtual disks are the same.",
            ));
        }
        if source_size != target_size {
            return Err(ArrayFault::new(
                ArrayErrorCode::SizeMismatch,
                "The source and target virtual disk capacities differ.",
            ));
        }
        let id = unused_id(self.pit_mappings.keys().copied());
        self.pit_mappings
            .insert(id, PitMapping::new(id, source, target, copy_rate, autodelete));
        Ok(id)
    }

    /// Apply an event; mappings reaching `end` disappear
    pub fn pit_event(&mut self, id: &str, event: PitEvent) -> Outcome<()> {
        let id = self.pit_id(id)?;
        let mapping = self
            .pit_mappings
            .get_mut(&id)
            .ok_or_else(|| missing("FlashCopy mapping", &id.to_string()))?;
        mapping.apply(event).map_err(|_| {
            ArrayFault::new(
                ArrayErrorCode::BadState,
                format!(
                    "The FlashCopy mapping {} cannot be {} in state {}.",
                    id, event, mapping.state
                ),
            )
        })?;
        if mapping.state.is_terminal() {
            self.pit_mappings.remove(&id);
        }
        Ok(())
    }

    pub fn change_pit(&mut self, id: &str, copy_rate: Option<u32>, autodelete: Option<bool>) -> Outcome<()> {
        let id = self.pit_id(id)?;
        if let Some(mapping) = self.pit_mappings.get_mut(&id) {
            if let Some(rate) = copy_rate {
                mapping.copy_rate = rate;
            }
            if let Some(flag) = autodelete {
                mapping.autodelete = flag;
            }
        }
        Ok(())
    }

    /// Let time pass for the given mappings, then drop expired ones.
    /// `settle` runs each mapping to a quiescent state in one go.
    pub fn tick(&mut self, ids: &[u32], settle: bool) {
        for id in ids {
            if let Some(mapping) = self.pit_mappings.get_mut(id) {
                // wait never fails
                let _ = mapping.apply(PitEvent::Wait);
                while settle && !mapping.state.is_quiescent() && mapping.copy_rate != 0 {
                    let _ = mapping.apply(PitEvent::Wait);
                }
            }
        }
        self.pit_mappings.retain(|_, m| !m.is_expired());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::state::PitState;
    use crate::config::VolumeOptions;
    use crate::domain::{Protocol, GIB};
    use assert_matches::assert_matches;

    fn params(pool: &str) -> ProvisioningParams {
        let options = VolumeOptions {
            rsize: 2,
            warning: 0,
            autoexpand: true,
            grainsize: 256,
            compression: false,
            easytier: true,
            iogrp: 0,
            protocol: Protocol::Iscsi,
            multipath: false,
        };
        ProvisioningParams::new(pool, &options).unwrap()
    }

    fn model_with(volumes: &[(&str, u64)]) -> ArrayModel {
        let mut model = ArrayModel::new("volpool");
        for (name, gb) in volumes {
            let req = CreateVolume::new(name, gb * GIB, 0, params("volpool")).unwrap();
            model.create_volume(&req).unwrap();
        }
        model
    }

    fn code<T: std::fmt::Debug>(outcome: Outcome<T>) -> ArrayErrorCode {
        outcome.unwrap_err().code
    }

    #[test]
    fn test_unused_id_fills_gaps() {
        assert_eq!(unused_id([].into_iter()), 0);
        assert_eq!(unused_id([0, 1, 3].into_iter()), 2);
        assert_eq!(unused_id([1, 2].into_iter()), 0);
    }

    #[test]
    fn test_volume_names_are_unique() {
        let mut model = model_with(&[("v1", 1)]);
        let req = CreateVolume::new("v1", GIB, 0, params("volpool")).unwrap();
        assert_eq!(code(model.create_volume(&req)), ArrayErrorCode::NameInUse);

        let req = CreateVolume::new("v2", GIB, 0, params("nopool")).unwrap();
        assert_eq!(code(model.create_volume(&req)), ArrayErrorCode::ObjectUnknown);

        let req = CreateVolume::new("v3", GIB, 2, params("volpool")).unwrap();
        assert_eq!(code(model.create_volume(&req)), ArrayErrorCode::ObjectUnknown);
    }

    #[test]
    fn test_delete_needs_force_when_in_use() {
        let mut model = model_with(&[("v1", 1), ("v2", 1)]);
        model.create_pit("v1", "v2", 50, false).unwrap();
        assert_eq!(code(model.delete_volume("v1", false)), ArrayErrorCode::VolumeInUse);
        model.delete_volume("v1", true).unwrap();
        assert!(model.pit_mappings.is_empty());
        assert_eq!(code(model.delete_volume("v1", true)), ArrayErrorCode::ObjectMissing);
    }

    #[test]
    fn test_pit_checks() {
        let mut model = model_with(&[("a", 1), ("b", 2), ("c", 1)]);
        assert_eq!(code(model.create_pit("a", "a", 50, false)), ArrayErrorCode::SameSourceTarget);
        assert_eq!(code(model.create_pit("a", "b", 50, false)), ArrayErrorCode::SizeMismatch);
        assert_eq!(code(model.create_pit("a", "zz", 50, false)), ArrayErrorCode::ObjectUnknown);

        let id = model.create_pit("a", "c", 50, false).unwrap();
        assert_eq!(
            code(model.pit_event(&id.to_string(), PitEvent::Start)),
            ArrayErrorCode::BadState
        );
        model.pit_event(&format!("fcmap{}", id), PitEvent::Prepare).unwrap();
        assert_eq!(model.pit_mappings[&id].state, PitState::Preparing);
    }

    #[test]
    fn test_tick_expires_autodelete_mappings() {
        let mut model = model_with(&[("a", 1), ("c", 1)]);
        let id = model.create_pit("a", "c", 50, true).unwrap();
        model.pit_event(&id.to_string(), PitEvent::Prepare).unwrap();
        model.tick(&[id], false);
        model.pit_event(&id.to_string(), PitEvent::Start).unwrap();
        model.tick(&[id], false);
        assert!(model.pit_mappings.contains_key(&id));
        model.tick(&[id], false);
        assert!(model.pit_mappings.is_empty());
    }

    #[test]
    fn test_host_mapping_rules() {
        let mut model = model_with(&[("v1", 1), ("v2", 1)]);
        model.create_host("h1", &HostPort::Iscsi("iqn.a".into())).unwrap();
        model.create_host("h2", &HostPort::Iscsi("iqn.b".into())).unwrap();
        assert_eq!(
            code(model.create_host("h3", &HostPort::Iscsi("iqn.a".into()))),
            ArrayErrorCode::PortAssigned
        );

        model.map_volume("v1", "h1", 0, false).unwrap();
        assert_eq!(code(model.map_volume("v2", "h1", 0, false)), ArrayErrorCode::LunTaken);
        assert_eq!(code(model.map_volume("v1", "h1", 1, true)), ArrayErrorCode::AlreadyMapped);
        assert_eq!(code(model.map_volume("v1", "h2", 0, false)), ArrayErrorCode::AlreadyMapped);
        model.map_volume("v1", "h2", 0, true).unwrap();

        assert_eq!(code(model.delete_host("h1")), ArrayErrorCode::HostHasMappings);
        model.unmap_volume("v1", "h1").unwrap();
        model.delete_host("h1").unwrap();
    }

    #[test]
    fn test_migration_moves_pool_atomically() {
        let mut model = model_with(&[("v1", 1)]);
        assert_eq!(code(model.migrate_volume("v1", "volpool")), ArrayErrorCode::SamePool);
        assert_eq!(
            code(model.migrate_volume("v1", NARROW_EXTENT_POOL)),
            ArrayErrorCode::ExtentMismatch
        );
        model.migrate_volume("v1", SECONDARY_POOL).unwrap();
        assert_eq!(model.volumes["v1"].pool(), SECONDARY_POOL);
    }

    #[test]
    fn test_copy_sync_and_removal() {
        let mut model = model_with(&[("v1", 1)]);
        let (_, copy) = model.add_copy("v1", &params(NARROW_EXTENT_POOL)).unwrap();
        assert_eq!(model.volumes["v1"].pool(), "many");
        assert!(!model.observe_copy("v1", &copy.to_string()).unwrap().sync);
        assert!(model.observe_copy("v1", &copy.to_string()).unwrap().sync);

        model.remove_copy("v1", "0").unwrap();
        assert_eq!(model.volumes["v1"].pool(), NARROW_EXTENT_POOL);
        assert!(model.volumes["v1"].primary_copy().unwrap().primary);
        assert_matches!(model.remove_copy("v1", "7"), Err(ArrayFault { code: ArrayErrorCode::CopyMissing, .. }));
    }

    #[test]
    fn test_pool_free_tracks_real_capacity() {
        let model = model_with(&[("v1", 100)]);
        let pool = model.pool("volpool").unwrap();
        let expected = pool.capacity - pool.base_used - 100 * GIB / 100 * 2;
        assert_eq!(model.pool_free(pool), expected);
    }
}
