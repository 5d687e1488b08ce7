//! In-process array
//!
//! [`ArraySimulator`] implements [`ArrayGateway`] over an [`ArrayModel`]
//! and prints what a real array prints: `!`-delimited tables and
//! `key!value` detail views on stdout, `CMMVCnnnnE` lines on stderr.
//! Reading PiT mappings through `lsfcmap` lets time pass for them.
//!
//! Faults are one-shot and keyed by verb, so a test can make exactly one
//! command misbehave and watch the driver recover.

use super::model::{ArrayFault, ArrayModel, Outcome, Volume};
use super::state::PitEvent;
use crate::cli::{ArrayCommand, FabricFilter, PitFilter, DELIM};
use crate::domain::{ArrayGateway, CommandOutput};
use crate::error::{ArrayErrorCode, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Misbehaviour injected into the next command with a given verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Table header loses its last field
    HeaderMismatch,
    /// First column is dropped from header and rows
    RemoveField,
    /// PiT mapping id lookup fails
    BadId,
    /// PiT mappings settle on the next read
    SpeedUp,
    /// `preferred_node_id` is missing from the volume view
    NoPrefNode,
    /// `preferred_node_id` is present but empty
    BlankPrefNode,
    /// License shows no compression enclosures
    NoCompression,
    /// Port IPs are unconfigured
    IpNoConfig,
    /// Listing comes back empty
    NoInfo,
    /// Command fails with the given stderr
    Stderr(String),
    /// Transport fails before the array sees the command
    Unreachable,
}

struct SimState {
    model: ArrayModel,
    faults: HashMap<String, VecDeque<Fault>>,
    log: Vec<ArrayCommand>,
}

/// Array stand-in for tests and dry runs
pub struct ArraySimulator {
    state: Mutex<SimState>,
}

impl ArraySimulator {
    /// Simulated array whose primary pool is `pool`
    pub fn new(pool: &str) -> Self {
        Self::from_model(ArrayModel::new(pool))
    }

    pub fn from_model(model: ArrayModel) -> Self {
        Self {
            state: Mutex::new(SimState {
                model,
                faults: HashMap::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Queue a fault for the next command with this verb
    pub fn inject(&self, verb: &str, fault: Fault) {
        debug!("simulator: injecting {:?} into next {}", fault, verb);
        self.state
            .lock()
            .faults
            .entry(verb.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<ArrayCommand> {
        self.state.lock().log.clone()
    }

    /// Number of commands received with this verb
    pub fn issued(&self, verb: &str) -> usize {
        self.state.lock().log.iter().filter(|c| c.verb() == verb).count()
    }

    /// Read the model
    pub fn inspect<R>(&self, f: impl FnOnce(&ArrayModel) -> R) -> R {
        f(&self.state.lock().model)
    }

    /// Change the model behind the driver's back
    pub fn modify<R>(&self, f: impl FnOnce(&mut ArrayModel) -> R) -> R {
        f(&mut self.state.lock().model)
    }

    /// Execute one command synchronously
    pub fn respond(&self, command: &ArrayCommand) -> CommandOutput {
        let mut state = self.state.lock();
        state.log.push(command.clone());
        let fault = state
            .faults
            .get_mut(command.verb())
            .and_then(VecDeque::pop_front);

        match &fault {
            Some(Fault::Stderr(text)) => return CommandOutput::failed(1, text.clone()),
            Some(Fault::Unreachable) => {
                return CommandOutput::failed(255, "ssh: connect to host array port 22: Connection refused")
            }
            _ => {}
        }

        match dispatch(&mut state.model, command, fault.as_ref()) {
            Ok(stdout) => {
                trace!("simulator: {} -> {:?}", command.verb(), stdout);
                CommandOutput::ok(stdout)
            }
            Err(fault) => {
                debug!("simulator: {} failed: {}", command.verb(), fault);
                CommandOutput::failed(1, fault.stderr())
            }
        }
    }
}

#[async_trait]
impl ArrayGateway for ArraySimulator {
    async fn execute(&self, command: &ArrayCommand) -> Result<CommandOutput> {
        Ok(self.respond(command))
    }
}

// =============================================================================
// Output formatting
// =============================================================================

macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($value.to_string()),*]
    };
}

struct Table {
    header: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn new(header: &[&'static str]) -> Self {
        Self {
            header: header.to_vec(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn render(mut self, fault: Option<&Fault>) -> String {
        if self.rows.is_empty() || fault == Some(&Fault::NoInfo) {
            return String::new();
        }
        match fault {
            Some(Fault::HeaderMismatch) => {
                self.header.pop();
            }
            Some(Fault::RemoveField) => {
                self.header.remove(0);
                for row in &mut self.rows {
                    row.remove(0);
                }
            }
            _ => {}
        }

        let delim = DELIM.to_string();
        let mut out = self.header.join(&delim);
        for row in &self.rows {
            out.push('\n');
            out.push_str(&row.join(&delim));
        }
        out.push('\n');
        out
    }
}

#[derive(Default)]
struct Detail {
    fields: Vec<(&'static str, String)>,
}

impl Detail {
    fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    fn render(self) -> String {
        self.fields
            .into_iter()
            .map(|(k, v)| format!("{}{}{}\n", k, DELIM, v))
            .collect()
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn bad_id(id: &str) -> ArrayFault {
    ArrayFault::new(
        ArrayErrorCode::ObjectMissing,
        format!("The FlashCopy mapping {} does not exist.", id),
    )
}

// =============================================================================
// Command dispatch
// =============================================================================

fn dispatch(model: &mut ArrayModel, command: &ArrayCommand, fault: Option<&Fault>) -> Outcome<String> {
    match command {
        ArrayCommand::ShowSystem => Ok(Detail::default()
            .with("id", &model.system_id)
            .with("name", &model.system_name)
            .with("location", "local")
            .with("code_level", "7.2.0.0 (build 87.0.1311291000)")
            .with("statistics_status", "on")
            .render()),
        ArrayCommand::ShowPool { name } => show_pool(model, name),
        ArrayCommand::ListIoGroups => {
            let mut table = Table::new(&["id", "name", "node_count", "vdisk_count", "host_count"]);
            for group in &model.io_groups {
                let vdisks = model.volumes.values().filter(|v| v.iogrp == group.id).count();
                table.push(row![group.id, group.name, group.node_count, vdisks, 0]);
            }
            Ok(table.render(fault))
        }
        ArrayCommand::ShowLicense => {
            let enclosures = if model.compression_licensed && fault != Some(&Fault::NoCompression) {
                1
            } else {
                0
            };
            Ok(Detail::default()
                .with("used_flash", "0.00")
                .with("used_remote", "0.00")
                .with("used_virtualization", "0.00")
                .with("license_flash", 0)
                .with("license_remote", 0)
                .with("license_virtualization", 0)
                .with("used_compression_capacity", "0.08")
                .with("license_compression_capacity", 0)
                .with("license_compression_enclosures", enclosures)
                .render())
        }
        ArrayCommand::ListNodes => {
            let mut table = Table::new(&[
                "id",
                "name",
                "UPS_serial_number",
                "WWNN",
                "status",
                "IO_group_id",
                "IO_group_name",
                "config_node",
                "hardware",
                "iscsi_name",
                "iscsi_alias",
                "panel_name",
            ]);
            for (index, node) in model.nodes.iter().enumerate() {
                let group = format!("io_grp{}", node.iogrp);
                table.push(row![
                    node.id,
                    node.name,
                    "",
                    node.wwnn,
                    "online",
                    node.iogrp,
                    group,
                    yes_no(index == 0),
                    "CG8",
                    node.iscsi_name,
                    "",
                    format!("12345{}", node.id),
                ]);
            }
            Ok(table.render(fault))
        }
        ArrayCommand::ShowNode { id } => {
            let node = model
                .nodes
                .iter()
                .find(|n| &n.id == id || &n.name == id)
                .ok_or_else(|| ArrayFault::new(
                    ArrayErrorCode::ObjectUnknown,
                    format!("The node {} does not exist.", id),
                ))?;
            let mut detail = Detail::default()
                .with("id", &node.id)
                .with("name", &node.name)
                .with("WWNN", &node.wwnn)
                .with("status", "online")
                .with("IO_group_id", node.iogrp)
                .with("iscsi_name", &node.iscsi_name);
            for port in &node.ports {
                detail = detail
                    .with("port_id", &port.wwpn)
                    .with("port_status", if port.active { "active" } else { "inactive" })
                    .with("port_speed", "8Gb");
            }
            Ok(detail.render())
        }
        ArrayCommand::ListPortIps => {
            let mut table = Table::new(&[
                "id",
                "node_id",
                "node_name",
                "IP_address",
                "mask",
                "gateway",
                "IP_address_6",
                "prefix_6",
                "gateway_6",
                "MAC",
                "duplex",
                "state",
                "speed",
                "failover",
            ]);
            let unconfigured = fault == Some(&Fault::IpNoConfig);
            for node in &model.nodes {
                let ipv4 = node.ipv4.as_deref().filter(|_| !unconfigured).unwrap_or("");
                let ipv6 = node.ipv6.as_deref().filter(|_| !unconfigured).unwrap_or("");
                let (mask, gateway) = if ipv4.is_empty() {
                    ("", "")
                } else {
                    ("255.255.255.0", "1.234.56.1")
                };
                let state = if ipv4.is_empty() && ipv6.is_empty() {
                    "unconfigured"
                } else {
                    "configured"
                };
                table.push(row![
                    1, node.id, node.name, ipv4, mask, gateway, ipv6, "", "",
                    "01:23:45:67:89:00", "Full", state, "1Gb/s", "no",
                ]);
                table.push(row![
                    1, node.id, node.name, "", "", "", "", "", "",
                    "01:23:45:67:89:00", "Full", "unconfigured", "1Gb/s", "yes",
                ]);
            }
            Ok(table.render(fault))
        }
        ArrayCommand::ListFabric { filter } => Ok(list_fabric(model, filter).render(fault)),

        ArrayCommand::CreateVolume(req) => {
            let id = model.create_volume(req)?;
            Ok(format!("Virtual Disk, id [{}], successfully created\n", id))
        }
        ArrayCommand::DeleteVolume { name, force } => {
            model.delete_volume(name, *force)?;
            Ok(String::new())
        }
        ArrayCommand::ExpandVolume { name, size_gb } => {
            model.expand_volume(name, *size_gb)?;
            Ok(String::new())
        }
        ArrayCommand::ShowVolume { name } => {
            let volume = model.volume(name)?;
            Ok(show_volume(model, volume, fault))
        }
        ArrayCommand::ListVolumes { name } => {
            let mut table = Table::new(&[
                "id",
                "name",
                "IO_group_id",
                "IO_group_name",
                "status",
                "mdisk_grp_id",
                "mdisk_grp_name",
                "capacity",
                "type",
                "FC_id",
                "FC_name",
                "vdisk_UID",
                "fc_map_count",
                "copy_count",
                "se_copy_count",
            ]);
            for volume in model.volumes.values() {
                if name.as_ref().map_or(false, |n| n != &volume.name) {
                    continue;
                }
                let pool = pool_id(model, volume.pool());
                let thin = volume.copies.values().filter(|c| c.is_thin()).count();
                table.push(row![
                    volume.id,
                    volume.name,
                    volume.iogrp,
                    format!("io_grp{}", volume.iogrp),
                    "online",
                    pool,
                    volume.pool(),
                    volume.capacity,
                    "striped",
                    "",
                    "",
                    volume.uid,
                    model.pits_of_volume(&volume.name).count(),
                    volume.copies.len(),
                    thin,
                ]);
            }
            Ok(table.render(fault))
        }

        ArrayCommand::CreateHost { name, port } => {
            let id = model.create_host(name, port)?;
            Ok(format!("Host, id [{}], successfully created\n", id))
        }
        ArrayCommand::AddHostPort { host, port } => {
            model.add_host_port(host, port)?;
            Ok(String::new())
        }
        ArrayCommand::SetChapSecret { host, secret } => {
            model.set_chap_secret(host, secret)?;
            Ok(String::new())
        }
        ArrayCommand::DeleteHost { name } => {
            model.delete_host(name)?;
            Ok(String::new())
        }
        ArrayCommand::ListHosts => {
            let mut table = Table::new(&["id", "name", "port_count", "iogrp_count", "status"]);
            for host in model.hosts.values() {
                table.push(row![host.id, host.name, host.port_count(), 4, "offline"]);
            }
            Ok(table.render(fault))
        }
        ArrayCommand::ShowHost { name } => {
            let host = model.host(name)?;
            let mut detail = Detail::default()
                .with("id", host.id)
                .with("name", &host.name)
                .with("port_count", host.port_count())
                .with("type", "generic")
                .with("mask", "1111")
                .with("iogrp_count", 4)
                .with("status", "offline");
            for iqn in &host.iscsi_names {
                detail = detail
                    .with("iscsi_name", iqn)
                    .with("node_logged_in_count", 0)
                    .with("state", "offline");
            }
            for wwpn in &host.wwpns {
                detail = detail
                    .with("WWPN", wwpn)
                    .with("node_logged_in_count", 0)
                    .with("state", "inactive");
            }
            Ok(detail.render())
        }
        ArrayCommand::ListIscsiAuth => {
            let mut table = Table::new(&[
                "type",
                "id",
                "name",
                "iscsi_auth_method",
                "iscsi_chap_secret",
            ]);
            for host in model.hosts.values() {
                let method = if host.chap_secret.is_some() { "chap" } else { "none" };
                table.push(row![
                    "host",
                    host.id,
                    host.name,
                    method,
                    host.chap_secret.as_deref().unwrap_or(""),
                ]);
            }
            Ok(table.render(fault))
        }

        ArrayCommand::MapVolume {
            volume,
            host,
            lun,
            force,
        } => {
            let id = model.map_volume(volume, host, *lun, *force)?;
            Ok(format!("Virtual Disk to Host map, id [{}], successfully created\n", id))
        }
        ArrayCommand::UnmapVolume { volume, host } => {
            model.unmap_volume(volume, host)?;
            Ok(String::new())
        }
        ArrayCommand::ListHostMappings { host } => {
            let entry = model.host(host)?;
            let mut table = Table::new(&[
                "id",
                "name",
                "SCSI_id",
                "vdisk_id",
                "vdisk_name",
                "vdisk_UID",
            ]);
            for mapping in model.mappings_of_host(host) {
                let (vdisk_id, uid) = model
                    .volumes
                    .get(&mapping.volume)
                    .map(|v| (v.id.to_string(), v.uid.clone()))
                    .unwrap_or_default();
                table.push(row![entry.id, entry.name, mapping.lun, vdisk_id, mapping.volume, uid]);
            }
            Ok(table.render(fault))
        }
        ArrayCommand::ListVolumeMappings { volume } => {
            let vol = model.volumes.get(volume).ok_or_else(|| {
                ArrayFault::new(
                    ArrayErrorCode::ObjectMissing,
                    format!("The virtual disk {} does not exist.", volume),
                )
            })?;
            let mut table = Table::new(&[
                "id",
                "name",
                "SCSI_id",
                "host_id",
                "host_name",
                "vdisk_UID",
                "IO_group_id",
                "IO_group_name",
            ]);
            for mapping in model.mappings_of_volume(volume) {
                let host_id = model
                    .hosts
                    .get(&mapping.host)
                    .map(|h| h.id.to_string())
                    .unwrap_or_default();
                table.push(row![
                    vol.id,
                    vol.name,
                    mapping.lun,
                    host_id,
                    mapping.host,
                    vol.uid,
                    vol.iogrp,
                    format!("io_grp{}", vol.iogrp),
                ]);
            }
            Ok(table.render(fault))
        }

        ArrayCommand::CreatePitMapping {
            source,
            target,
            copy_rate,
            autodelete,
        } => {
            let id = model.create_pit(source, target, *copy_rate, *autodelete)?;
            Ok(format!("FlashCopy Mapping, id [{}], successfully created\n", id))
        }
        ArrayCommand::PreparePitMapping { id } => pit_event(model, id, PitEvent::Prepare, fault),
        ArrayCommand::StartPitMapping { id } => pit_event(model, id, PitEvent::Start, fault),
        ArrayCommand::StopPitMapping { id } => pit_event(model, id, PitEvent::Stop, fault),
        ArrayCommand::DeletePitMapping { id, force } => {
            let event = if *force { PitEvent::DeleteForce } else { PitEvent::Delete };
            pit_event(model, id, event, fault)
        }
        ArrayCommand::ChangePitMapping {
            id,
            copy_rate,
            autodelete,
        } => {
            model.change_pit(id, *copy_rate, *autodelete)?;
            Ok(String::new())
        }
        ArrayCommand::ListPitMappings { filter } => Ok(list_pits(model, filter.as_ref(), fault)),
        ArrayCommand::ListVolumePitMappings { volume } => {
            if !model.volumes.contains_key(volume) {
                return Err(ArrayFault::new(
                    ArrayErrorCode::ObjectMissing,
                    format!("The virtual disk {} does not exist.", volume),
                ));
            }
            let mut table = Table::new(&["id", "name"]);
            for mapping in model.pits_of_volume(volume) {
                table.push(row![mapping.id, mapping.name]);
            }
            Ok(table.render(fault))
        }

        ArrayCommand::MigrateVolume { volume, pool } => {
            model.migrate_volume(volume, pool)?;
            Ok(String::new())
        }
        ArrayCommand::AddVolumeCopy { volume, params } => {
            let (vdisk, copy) = model.add_copy(volume, params)?;
            Ok(format!("Vdisk [{}] copy [{}] successfully created\n", vdisk, copy))
        }
        ArrayCommand::ListVolumeCopies { volume, copy } => match copy {
            Some(copy) => {
                let seen = model.observe_copy(volume, copy)?;
                let vol = model.volume(volume)?;
                let real = seen.real_capacity(vol.capacity);
                Ok(Detail::default()
                    .with("vdisk_id", vol.id)
                    .with("vdisk_name", &vol.name)
                    .with("copy_id", seen.id)
                    .with("status", "online")
                    .with("sync", yes_no(seen.sync))
                    .with("primary", yes_no(seen.primary))
                    .with("mdisk_grp_id", pool_id(model, &seen.pool))
                    .with("mdisk_grp_name", &seen.pool)
                    .with("type", "striped")
                    .with("real_capacity", real)
                    .with("autoexpand", on_off(vol.autoexpand && seen.is_thin()))
                    .with("se_copy", yes_no(seen.is_thin() && !seen.compressed))
                    .with("easy_tier", on_off(seen.easytier))
                    .with("compressed_copy", yes_no(seen.compressed))
                    .render())
            }
            None => {
                let vol = model.volumes.get(volume).ok_or_else(|| {
                    ArrayFault::new(
                        ArrayErrorCode::ObjectMissing,
                        format!("The virtual disk {} does not exist.", volume),
                    )
                })?;
                let mut table = Table::new(&[
                    "vdisk_id",
                    "vdisk_name",
                    "copy_id",
                    "status",
                    "sync",
                    "primary",
                    "mdisk_grp_id",
                    "mdisk_grp_name",
                    "capacity",
                    "type",
                    "se_copy",
                    "easy_tier",
                    "compressed_copy",
                ]);
                for copy in vol.copies.values() {
                    table.push(row![
                        vol.id,
                        vol.name,
                        copy.id,
                        "online",
                        yes_no(copy.sync),
                        yes_no(copy.primary),
                        pool_id(model, &copy.pool),
                        copy.pool,
                        vol.capacity,
                        "striped",
                        yes_no(copy.is_thin() && !copy.compressed),
                        on_off(copy.easytier),
                        yes_no(copy.compressed),
                    ]);
                }
                Ok(table.render(fault))
            }
        },
        ArrayCommand::DeleteVolumeCopy { volume, copy } => {
            model.remove_copy(volume, copy)?;
            Ok(String::new())
        }
    }
}

fn pool_id(model: &ArrayModel, name: &str) -> String {
    model
        .pools
        .get(name)
        .map(|p| p.id.to_string())
        .unwrap_or_else(|| "many".to_string())
}

fn show_pool(model: &ArrayModel, name: &str) -> Outcome<String> {
    let pool = model.pool(name)?;
    let used = model.pool_used(pool);
    let virtual_capacity = model.pool_virtual(pool);
    let vdisks = model
        .volumes
        .values()
        .filter(|v| v.copies.values().any(|c| c.pool == pool.name))
        .count();
    let overallocation = if pool.capacity == 0 {
        0
    } else {
        virtual_capacity.saturating_mul(100) / pool.capacity
    };
    Ok(Detail::default()
        .with("id", pool.id)
        .with("name", &pool.name)
        .with("status", "online")
        .with("mdisk_count", 1)
        .with("vdisk_count", vdisks)
        .with("capacity", pool.capacity)
        .with("extent_size", pool.extent_size)
        .with("free_capacity", model.pool_free(pool))
        .with("virtual_capacity", virtual_capacity)
        .with("used_capacity", used)
        .with("real_capacity", used)
        .with("overallocation", overallocation)
        .with("warning", 80)
        .with("easy_tier", "auto")
        .with("easy_tier_status", "inactive")
        .render())
}

fn show_volume(model: &ArrayModel, volume: &Volume, fault: Option<&Fault>) -> String {
    let pool = volume.pool();
    let pit_ids: Vec<u32> = model.pits_of_volume(&volume.name).map(|m| m.id).collect();
    let (fc_id, fc_name) = match pit_ids.as_slice() {
        [only] => (only.to_string(), format!("fcmap{}", only)),
        [] => (String::new(), String::new()),
        _ => ("many".to_string(), "many".to_string()),
    };

    let mut detail = Detail::default()
        .with("id", volume.id)
        .with("name", &volume.name)
        .with("IO_group_id", volume.iogrp)
        .with("IO_group_name", format!("io_grp{}", volume.iogrp))
        .with("status", "online")
        .with("mdisk_grp_id", pool_id(model, pool))
        .with("mdisk_grp_name", pool)
        .with("capacity", volume.capacity)
        .with("type", "striped")
        .with("formatted", "no")
        .with("FC_id", fc_id)
        .with("FC_name", fc_name)
        .with("vdisk_UID", &volume.uid)
        .with("throttling", 0);
    match fault {
        Some(Fault::NoPrefNode) => {}
        Some(Fault::BlankPrefNode) => detail = detail.with("preferred_node_id", ""),
        _ => {
            detail = detail.with(
                "preferred_node_id",
                volume.preferred_node.as_deref().unwrap_or(""),
            )
        }
    }
    detail = detail
        .with("fast_write_state", "empty")
        .with("cache", "readwrite")
        .with("fc_map_count", pit_ids.len())
        .with("sync_rate", 50)
        .with("copy_count", volume.copies.len())
        .with(
            "se_copy_count",
            volume.copies.values().filter(|c| c.is_thin()).count(),
        );

    for copy in volume.copies.values() {
        let real = copy.real_capacity(volume.capacity);
        detail = detail
            .with("copy_id", copy.id)
            .with("status", "online")
            .with("sync", yes_no(copy.sync))
            .with("primary", yes_no(copy.primary))
            .with("mdisk_grp_id", pool_id(model, &copy.pool))
            .with("mdisk_grp_name", &copy.pool)
            .with("type", "striped")
            .with("used_capacity", real)
            .with("real_capacity", real)
            .with("free_capacity", volume.capacity.saturating_sub(real))
            .with("autoexpand", on_off(volume.autoexpand && copy.is_thin()))
            .with("warning", volume.warning)
            .with("grainsize", if copy.is_thin() { copy.grainsize.to_string() } else { String::new() })
            .with("se_copy", yes_no(copy.is_thin() && !copy.compressed))
            .with("easy_tier", on_off(copy.easytier))
            .with("easy_tier_status", "inactive")
            .with("compressed_copy", yes_no(copy.compressed));
    }
    detail.render()
}

fn list_fabric(model: &ArrayModel, filter: &FabricFilter) -> Table {
    let mut table = Table::new(&[
        "remote_wwpn",
        "remote_nportid",
        "id",
        "node_name",
        "local_wwpn",
        "local_port",
        "local_nportid",
        "state",
        "name",
        "cluster_name",
        "type",
    ]);
    for host in model.hosts.values() {
        let wwpns: Vec<&String> = match filter {
            FabricFilter::Wwpn(wanted) => host
                .wwpns
                .iter()
                .filter(|w| w.eq_ignore_ascii_case(wanted))
                .collect(),
            FabricFilter::Host(name) if name == &host.name => host.wwpns.iter().collect(),
            FabricFilter::Host(_) => Vec::new(),
        };
        for wwpn in wwpns {
            for node in &model.nodes {
                let Some(port) = node.ports.iter().find(|p| p.active) else {
                    continue;
                };
                table.push(row![
                    wwpn, "010A00", node.id, node.name, port.wwpn, 1, "010B00", "active",
                    host.name, "", "host",
                ]);
            }
        }
    }
    table
}

fn pit_event(model: &mut ArrayModel, id: &str, event: PitEvent, fault: Option<&Fault>) -> Outcome<String> {
    if fault == Some(&Fault::BadId) {
        return Err(bad_id(id));
    }
    model.pit_event(id, event)?;
    Ok(String::new())
}

fn list_pits(model: &mut ArrayModel, filter: Option<&PitFilter>, fault: Option<&Fault>) -> String {
    let matches = |source: &str, target: &str, id: u32| match filter {
        None => true,
        Some(PitFilter::Id(wanted)) => &id.to_string() == wanted,
        Some(PitFilter::Source(wanted)) => source == wanted,
        Some(PitFilter::Target(wanted)) => target == wanted,
    };
    let selected: Vec<u32> = model
        .pit_mappings
        .values()
        .filter(|m| matches(&m.source, &m.target, m.id))
        .map(|m| m.id)
        .collect();
    model.tick(&selected, fault == Some(&Fault::SpeedUp));

    let mut table = Table::new(&[
        "id",
        "name",
        "source_vdisk_id",
        "source_vdisk_name",
        "target_vdisk_id",
        "target_vdisk_name",
        "group_id",
        "group_name",
        "status",
        "progress",
        "copy_rate",
        "clean_progress",
        "incremental",
        "partner_FC_id",
        "partner_FC_name",
        "restoring",
        "start_time",
        "rc_controlled",
    ]);
    let volume_id = |name: &str| {
        model
            .volumes
            .get(name)
            .map(|v| v.id.to_string())
            .unwrap_or_default()
    };
    for id in &selected {
        let Some(mapping) = model.pit_mappings.get(id) else {
            continue;
        };
        table.push(row![
            mapping.id,
            mapping.name,
            volume_id(&mapping.source),
            mapping.source,
            volume_id(&mapping.target),
            mapping.target,
            "",
            "",
            mapping.state,
            mapping.progress,
            mapping.copy_rate,
            100,
            "off",
            "",
            "",
            "no",
            "",
            "no",
        ]);
    }
    table.render(fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{CliResponse, Layout};

    fn table(sim: &ArraySimulator, command: ArrayCommand) -> CliResponse {
        let out = sim.respond(&command);
        assert!(out.is_clean(), "{}: {}", command, out.stderr);
        CliResponse::parse(command.verb(), &out.stdout, DELIM, Layout::Table).unwrap()
    }

    fn detail(sim: &ArraySimulator, command: ArrayCommand) -> CliResponse {
        let out = sim.respond(&command);
        assert!(out.is_clean(), "{}: {}", command, out.stderr);
        CliResponse::parse(command.verb(), &out.stdout, DELIM, Layout::Detail).unwrap()
    }

    #[test]
    fn test_pool_view_matches_capacity() {
        let sim = ArraySimulator::new("volpool");
        let pool = detail(&sim, ArrayCommand::ShowPool { name: "volpool".into() });
        let pool = pool.first().unwrap();
        assert_eq!(pool.get("capacity"), Some("3573412790272"));
        assert_eq!(pool.get("free_capacity"), Some("3529926246400"));
        assert_eq!(pool.get("extent_size"), Some("256"));
    }

    #[test]
    fn test_node_listing_and_faults() {
        let sim = ArraySimulator::new("volpool");
        let nodes = table(&sim, ArrayCommand::ListNodes);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].get("iscsi_name"), Some("iqn.1982-01.com.ibm:1234.sim.node1"));

        sim.inject("lsnodecanister", Fault::HeaderMismatch);
        let out = sim.respond(&ArrayCommand::ListNodes);
        assert!(CliResponse::parse("lsnodecanister", &out.stdout, DELIM, Layout::Table).is_err());

        sim.inject("lsnodecanister", Fault::RemoveField);
        let nodes = table(&sim, ArrayCommand::ListNodes);
        assert!(!nodes[0].contains("id"));

        // one-shot
        let nodes = table(&sim, ArrayCommand::ListNodes);
        assert!(nodes[0].contains("id"));
    }

    #[test]
    fn test_node_detail_lists_every_port() {
        let sim = ArraySimulator::new("volpool");
        let node = detail(&sim, ArrayCommand::ShowNode { id: "2".into() });
        let node = node.first().unwrap();
        assert_eq!(node.get_all("port_id"), vec!["500507680220C745", "500507680230C745"]);
        assert_eq!(node.get_all("port_status"), vec!["active", "inactive"]);
    }

    #[test]
    fn test_errors_go_to_stderr() {
        let sim = ArraySimulator::new("volpool");
        let out = sim.respond(&ArrayCommand::ShowVolume { name: "nope".into() });
        assert_eq!(out.exit_code, 1);
        assert!(out.stdout.is_empty());
        assert!(out.stderr.starts_with("CMMVC5754E"));

        sim.inject("lssystem", Fault::Stderr("CMMVC9999E boom".into()));
        assert!(!sim.respond(&ArrayCommand::ShowSystem).is_clean());
        assert!(sim.respond(&ArrayCommand::ShowSystem).is_clean());
        assert_eq!(sim.issued("lssystem"), 2);
    }

    #[test]
    fn test_license_and_port_faults() {
        let sim = ArraySimulator::new("volpool");
        sim.inject("lslicense", Fault::NoCompression);
        let license = detail(&sim, ArrayCommand::ShowLicense);
        assert_eq!(
            license.first().unwrap().get("license_compression_enclosures"),
            Some("0")
        );

        sim.inject("lsportip", Fault::IpNoConfig);
        let ports = table(&sim, ArrayCommand::ListPortIps);
        assert!(ports.iter().all(|r| r.get("IP_address") == Some("")));
    }
}
