//! Typed array commands
//!
//! One variant per array command the driver issues. Each variant renders
//! to the token vector the array CLI expects (`svcinfo` for queries,
//! `svctask` for changes) and names the object it targets so failures can
//! be classified without looking at the argv again.

use crate::config::VolumeOptions;
use crate::error::{Error, ObjectKind, Result};
use serde::{Deserialize, Serialize};

/// Field delimiter requested for every listing
pub const DELIM: char = '!';

/// Longest object name the array accepts
pub const MAX_NAME_LEN: usize = 63;

// =============================================================================
// Parameters
// =============================================================================

/// Check an array object name: a letter or underscore first, then word
/// characters, spaces, dots and dashes.
pub fn validate_object_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest =
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '.' | '-'));
    if !valid_first || !valid_rest || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "illegal object name '{}'",
            name
        )));
    }
    Ok(())
}

/// Provisioning parameters shared by volume and copy creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningParams {
    pub pool: String,
    pub rsize: i32,
    pub warning: u32,
    pub autoexpand: bool,
    pub grainsize: u32,
    pub compression: bool,
    pub easytier: bool,
}

impl ProvisioningParams {
    pub fn new(pool: impl Into<String>, options: &VolumeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            pool: pool.into(),
            rsize: options.rsize,
            warning: options.warning,
            autoexpand: options.autoexpand,
            grainsize: options.grainsize,
            compression: options.compression,
            easytier: options.easytier,
        })
    }

    pub fn is_thin(&self) -> bool {
        self.rsize != -1
    }

    fn push_args(&self, argv: &mut Vec<String>) {
        argv.push("-easytier".into());
        argv.push(on_off(self.easytier).into());
        if self.is_thin() {
            argv.push("-rsize".into());
            argv.push(format!("{}%", self.rsize));
            if self.autoexpand {
                argv.push("-autoexpand".into());
            }
            argv.push("-warning".into());
            argv.push(format!("{}%", self.warning));
            if self.compression {
                argv.push("-compressed".into());
            } else {
                argv.push("-grainsize".into());
                argv.push(self.grainsize.to_string());
            }
        }
    }
}

/// Volume creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolume {
    pub name: String,
    pub size_bytes: u64,
    pub iogrp: u32,
    pub params: ProvisioningParams,
}

impl CreateVolume {
    pub fn new(name: &str, size_bytes: u64, iogrp: u32, params: ProvisioningParams) -> Result<Self> {
        validate_object_name(name)?;
        if size_bytes == 0 {
            return Err(Error::InvalidInput(format!(
                "volume {} must have a positive size",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            size_bytes,
            iogrp,
            params,
        })
    }
}

/// Initiator port registered on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPort {
    Iscsi(String),
    Wwpn(String),
}

impl HostPort {
    fn flag(&self) -> &'static str {
        match self {
            HostPort::Iscsi(_) => "-iscsiname",
            HostPort::Wwpn(_) => "-hbawwpn",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            HostPort::Iscsi(v) | HostPort::Wwpn(v) => v,
        }
    }
}

/// Host port lookup through the fabric login table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FabricFilter {
    Wwpn(String),
    Host(String),
}

/// `lsfcmap -filtervalue` selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PitFilter {
    Id(String),
    Source(String),
    Target(String),
}

impl PitFilter {
    fn render(&self) -> String {
        match self {
            PitFilter::Id(v) => format!("id={}", v),
            PitFilter::Source(v) => format!("source_vdisk_name={}", v),
            PitFilter::Target(v) => format!("target_vdisk_name={}", v),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Every command the driver sends to the array
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayCommand {
    // --- inventory -----------------------------------------------------------
    /// `lssystem`
    ShowSystem,
    /// `lsmdiskgrp -bytes <pool>`
    ShowPool { name: String },
    /// `lsiogrp`
    ListIoGroups,
    /// `lslicense`
    ShowLicense,
    /// `lsnodecanister`
    ListNodes,
    /// `lsnode <id>`
    ShowNode { id: String },
    /// `lsportip`
    ListPortIps,
    /// `lsfabric -wwpn|-host`
    ListFabric { filter: FabricFilter },

    // --- volumes -------------------------------------------------------------
    /// `mkvdisk`
    CreateVolume(CreateVolume),
    /// `rmvdisk`
    DeleteVolume { name: String, force: bool },
    /// `expandvdisksize -unit gb`
    ExpandVolume { name: String, size_gb: u64 },
    /// `lsvdisk -bytes <name>`
    ShowVolume { name: String },
    /// `lsvdisk -bytes -filtervalue name=<name>`
    ListVolumes { name: Option<String> },

    // --- hosts ---------------------------------------------------------------
    /// `mkhost`
    CreateHost { name: String, port: HostPort },
    /// `addhostport`
    AddHostPort { host: String, port: HostPort },
    /// `chhost -chapsecret`
    SetChapSecret { host: String, secret: String },
    /// `rmhost`
    DeleteHost { name: String },
    /// `lshost`
    ListHosts,
    /// `lshost <name>`
    ShowHost { name: String },
    /// `lsiscsiauth`
    ListIscsiAuth,

    // --- host mappings -------------------------------------------------------
    /// `mkvdiskhostmap`
    MapVolume {
        volume: String,
        host: String,
        lun: u32,
        force: bool,
    },
    /// `rmvdiskhostmap`
    UnmapVolume { volume: String, host: String },
    /// `lshostvdiskmap <host>`
    ListHostMappings { host: String },
    /// `lsvdiskhostmap <volume>`
    ListVolumeMappings { volume: String },

    // --- PiT mappings --------------------------------------------------------
    /// `mkfcmap`
    CreatePitMapping {
        source: String,
        target: String,
        copy_rate: u32,
        autodelete: bool,
    },
    /// `prestartfcmap`
    PreparePitMapping { id: String },
    /// `startfcmap`
    StartPitMapping { id: String },
    /// `stopfcmap`
    StopPitMapping { id: String },
    /// `rmfcmap`
    DeletePitMapping { id: String, force: bool },
    /// `chfcmap`
    ChangePitMapping {
        id: String,
        copy_rate: Option<u32>,
        autodelete: Option<bool>,
    },
    /// `lsfcmap`
    ListPitMappings { filter: Option<PitFilter> },
    /// `lsvdiskfcmappings <volume>`
    ListVolumePitMappings { volume: String },

    // --- migration -----------------------------------------------------------
    /// `migratevdisk`
    MigrateVolume { volume: String, pool: String },
    /// `addvdiskcopy`
    AddVolumeCopy {
        volume: String,
        params: ProvisioningParams,
    },
    /// `lsvdiskcopy [-copy <id>] <volume>`
    ListVolumeCopies { volume: String, copy: Option<String> },
    /// `rmvdiskcopy`
    DeleteVolumeCopy { volume: String, copy: String },
}

impl ArrayCommand {
    /// Array verb
    pub fn verb(&self) -> &'static str {
        match self {
            ArrayCommand::ShowSystem => "lssystem",
            ArrayCommand::ShowPool { .. } => "lsmdiskgrp",
            ArrayCommand::ListIoGroups => "lsiogrp",
            ArrayCommand::ShowLicense => "lslicense",
            ArrayCommand::ListNodes => "lsnodecanister",
            ArrayCommand::ShowNode { .. } => "lsnode",
            ArrayCommand::ListPortIps => "lsportip",
            ArrayCommand::ListFabric { .. } => "lsfabric",
            ArrayCommand::CreateVolume(_) => "mkvdisk",
            ArrayCommand::DeleteVolume { .. } => "rmvdisk",
            ArrayCommand::ExpandVolume { .. } => "expandvdisksize",
            ArrayCommand::ShowVolume { .. } | ArrayCommand::ListVolumes { .. } => "lsvdisk",
            ArrayCommand::CreateHost { .. } => "mkhost",
            ArrayCommand::AddHostPort { .. } => "addhostport",
            ArrayCommand::SetChapSecret { .. } => "chhost",
            ArrayCommand::DeleteHost { .. } => "rmhost",
            ArrayCommand::ListHosts | ArrayCommand::ShowHost { .. } => "lshost",
            ArrayCommand::ListIscsiAuth => "lsiscsiauth",
            ArrayCommand::MapVolume { .. } => "mkvdiskhostmap",
            ArrayCommand::UnmapVolume { .. } => "rmvdiskhostmap",
            ArrayCommand::ListHostMappings { .. } => "lshostvdiskmap",
            ArrayCommand::ListVolumeMappings { .. } => "lsvdiskhostmap",
            ArrayCommand::CreatePitMapping { .. } => "mkfcmap",
            ArrayCommand::PreparePitMapping { .. } => "prestartfcmap",
            ArrayCommand::StartPitMapping { .. } => "startfcmap",
            ArrayCommand::StopPitMapping { .. } => "stopfcmap",
            ArrayCommand::DeletePitMapping { .. } => "rmfcmap",
            ArrayCommand::ChangePitMapping { .. } => "chfcmap",
            ArrayCommand::ListPitMappings { .. } => "lsfcmap",
            ArrayCommand::ListVolumePitMappings { .. } => "lsvdiskfcmappings",
            ArrayCommand::MigrateVolume { .. } => "migratevdisk",
            ArrayCommand::AddVolumeCopy { .. } => "addvdiskcopy",
            ArrayCommand::ListVolumeCopies { .. } => "lsvdiskcopy",
            ArrayCommand::DeleteVolumeCopy { .. } => "rmvdiskcopy",
        }
    }

    /// Whether the command only reads state
    pub fn is_query(&self) -> bool {
        self.verb().starts_with("ls")
    }

    /// Object the command acts on, for error context
    pub fn target(&self) -> (ObjectKind, &str) {
        match self {
            ArrayCommand::ShowPool { name } => (ObjectKind::Pool, name.as_str()),
            ArrayCommand::ShowNode { id } => (ObjectKind::Object, id.as_str()),
            ArrayCommand::CreateVolume(req) => (ObjectKind::Volume, req.name.as_str()),
            ArrayCommand::DeleteVolume { name, .. }
            | ArrayCommand::ExpandVolume { name, .. }
            | ArrayCommand::ShowVolume { name } => (ObjectKind::Volume, name.as_str()),
            ArrayCommand::ListVolumes { name } => {
                (ObjectKind::Volume, name.as_deref().unwrap_or(""))
            }
            ArrayCommand::CreateHost { name, .. }
            | ArrayCommand::DeleteHost { name }
            | ArrayCommand::ShowHost { name } => (ObjectKind::Host, name.as_str()),
            ArrayCommand::AddHostPort { host, .. }
            | ArrayCommand::SetChapSecret { host, .. }
            | ArrayCommand::ListHostMappings { host } => (ObjectKind::Host, host.as_str()),
            ArrayCommand::MapVolume { volume, .. }
            | ArrayCommand::UnmapVolume { volume, .. }
            | ArrayCommand::ListVolumeMappings { volume }
            | ArrayCommand::ListVolumePitMappings { volume }
            | ArrayCommand::MigrateVolume { volume, .. }
            | ArrayCommand::AddVolumeCopy { volume, .. } => (ObjectKind::Volume, volume.as_str()),
            ArrayCommand::ListVolumeCopies { volume, copy } => match copy {
                Some(_) => (ObjectKind::VolumeCopy, volume.as_str()),
                None => (ObjectKind::Volume, volume.as_str()),
            },
            ArrayCommand::DeleteVolumeCopy { volume, .. } => (ObjectKind::VolumeCopy, volume.as_str()),
            ArrayCommand::CreatePitMapping { target, .. } => (ObjectKind::PitMapping, target.as_str()),
            ArrayCommand::PreparePitMapping { id }
            | ArrayCommand::StartPitMapping { id }
            | ArrayCommand::StopPitMapping { id }
            | ArrayCommand::DeletePitMapping { id, .. }
            | ArrayCommand::ChangePitMapping { id, .. } => (ObjectKind::PitMapping, id.as_str()),
            ArrayCommand::ShowSystem
            | ArrayCommand::ListIoGroups
            | ArrayCommand::ShowLicense
            | ArrayCommand::ListNodes
            | ArrayCommand::ListPortIps
            | ArrayCommand::ListFabric { .. }
            | ArrayCommand::ListHosts
            | ArrayCommand::ListIscsiAuth
            | ArrayCommand::ListPitMappings { .. } => (ObjectKind::Object, ""),
        }
    }

    /// Token vector sent over the wire
    pub fn argv(&self) -> Vec<String> {
        let prefix = if self.is_query() { "svcinfo" } else { "svctask" };
        let mut argv: Vec<String> = vec![prefix.into(), self.verb().into()];
        let delim = DELIM.to_string();

        match self {
            ArrayCommand::ShowSystem
            | ArrayCommand::ListIoGroups
            | ArrayCommand::ShowLicense
            | ArrayCommand::ListNodes
            | ArrayCommand::ListPortIps
            | ArrayCommand::ListHosts
            | ArrayCommand::ListIscsiAuth => {
                argv.extend(["-delim".into(), delim]);
            }
            ArrayCommand::ShowPool { name } => {
                argv.extend(["-bytes".into(), "-delim".into(), delim, name.clone()]);
            }
            ArrayCommand::ShowNode { id } => {
                argv.extend(["-delim".into(), delim, id.clone()]);
            }
            ArrayCommand::ListFabric { filter } => {
                argv.extend(["-delim".into(), delim]);
                match filter {
                    FabricFilter::Wwpn(w) => argv.extend(["-wwpn".into(), w.clone()]),
                    FabricFilter::Host(h) => argv.extend(["-host".into(), h.clone()]),
                }
            }
            ArrayCommand::CreateVolume(req) => {
                argv.extend([
                    "-name".into(),
                    req.name.clone(),
                    "-mdiskgrp".into(),
                    req.params.pool.clone(),
                    "-iogrp".into(),
                    req.iogrp.to_string(),
                    "-size".into(),
                    req.size_bytes.to_string(),
                    "-unit".into(),
                    "b".into(),
                ]);
                req.params.push_args(&mut argv);
            }
            ArrayCommand::DeleteVolume { name, force } => {
                if *force {
                    argv.push("-force".into());
                }
                argv.push(name.clone());
            }
            ArrayCommand::ExpandVolume { name, size_gb } => {
                argv.extend([
                    "-size".into(),
                    size_gb.to_string(),
                    "-unit".into(),
                    "gb".into(),
                    name.clone(),
                ]);
            }
            ArrayCommand::ShowVolume { name } => {
                argv.extend(["-bytes".into(), "-delim".into(), delim, name.clone()]);
            }
            ArrayCommand::ListVolumes { name } => {
                argv.extend(["-bytes".into(), "-delim".into(), delim]);
                if let Some(name) = name {
                    argv.extend(["-filtervalue".into(), format!("name={}", name)]);
                }
            }
            ArrayCommand::CreateHost { name, port } => {
                argv.extend([
                    "-name".into(),
                    name.clone(),
                    port.flag().into(),
                    port.value().to_string(),
                    "-force".into(),
                ]);
            }
            ArrayCommand::AddHostPort { host, port } => {
                argv.extend([
                    port.flag().into(),
                    port.value().to_string(),
                    "-force".into(),
                    host.clone(),
                ]);
            }
            ArrayCommand::SetChapSecret { host, secret } => {
                argv.extend(["-chapsecret".into(), secret.clone(), host.clone()]);
            }
            ArrayCommand::DeleteHost { name } => argv.push(name.clone()),
            ArrayCommand::ShowHost { name } => {
                argv.extend(["-delim".into(), delim, name.clone()]);
            }
            ArrayCommand::MapVolume {
                volume,
                host,
                lun,
                force,
            } => {
                argv.extend(["-host".into(), host.clone(), "-scsi".into(), lun.to_string()]);
                if *force {
                    argv.push("-force".into());
                }
                argv.push(volume.clone());
            }
            ArrayCommand::UnmapVolume { volume, host } => {
                argv.extend(["-host".into(), host.clone(), volume.clone()]);
            }
            ArrayCommand::ListHostMappings { host } => {
                argv.extend(["-delim".into(), delim, host.clone()]);
            }
            ArrayCommand::ListVolumeMappings { volume }
            | ArrayCommand::ListVolumePitMappings { volume } => {
                argv.extend(["-delim".into(), delim, volume.clone()]);
            }
            ArrayCommand::CreatePitMapping {
                source,
                target,
                copy_rate,
                autodelete,
            } => {
                argv.extend(["-source".into(), source.clone(), "-target".into(), target.clone()]);
                if *autodelete {
                    argv.push("-autodelete".into());
                }
                argv.extend(["-copyrate".into(), copy_rate.to_string()]);
            }
            ArrayCommand::PreparePitMapping { id }
            | ArrayCommand::StartPitMapping { id }
            | ArrayCommand::StopPitMapping { id } => argv.push(id.clone()),
            ArrayCommand::DeletePitMapping { id, force } => {
                if *force {
                    argv.push("-force".into());
                }
                argv.push(id.clone());
            }
            ArrayCommand::ChangePitMapping {
                id,
                copy_rate,
                autodelete,
            } => {
                if let Some(rate) = copy_rate {
                    argv.extend(["-copyrate".into(), rate.to_string()]);
                }
                if let Some(flag) = autodelete {
                    argv.extend(["-autodelete".into(), on_off(*flag).into()]);
                }
                argv.push(id.clone());
            }
            ArrayCommand::ListPitMappings { filter } => {
                argv.extend(["-delim".into(), delim]);
                if let Some(filter) = filter {
                    argv.extend(["-filtervalue".into(), filter.render()]);
                }
            }
            ArrayCommand::MigrateVolume { volume, pool } => {
                argv.extend(["-mdiskgrp".into(), pool.clone(), "-vdisk".into(), volume.clone()]);
            }
            ArrayCommand::AddVolumeCopy { volume, params } => {
                argv.extend(["-mdiskgrp".into(), params.pool.clone()]);
                params.push_args(&mut argv);
                argv.push(volume.clone());
            }
            ArrayCommand::ListVolumeCopies { volume, copy } => {
                argv.extend(["-delim".into(), delim]);
                if let Some(copy) = copy {
                    argv.extend(["-copy".into(), copy.clone()]);
                }
                argv.push(volume.clone());
            }
            ArrayCommand::DeleteVolumeCopy { volume, copy } => {
                argv.extend(["-copy".into(), copy.clone(), volume.clone()]);
            }
        }
        argv
    }
}

impl std::fmt::Display for ArrayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never echo CHAP secrets into logs
        if let ArrayCommand::SetChapSecret { host, .. } = self {
            return write!(f, "svctask chhost -chapsecret ****** {}", host);
        }
        write!(f, "{}", self.argv().join(" "))
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Protocol;
    use assert_matches::assert_matches;

    fn options(rsize: i32, compression: bool) -> VolumeOptions {
        VolumeOptions {
            rsize,
            warning: 0,
            autoexpand: true,
            grainsize: 256,
            compression,
            easytier: true,
            iogrp: 0,
            protocol: Protocol::Iscsi,
            multipath: false,
        }
    }

    #[test]
    fn test_object_names() {
        assert!(validate_object_name("volume-1").is_ok());
        assert!(validate_object_name("_tmp vol.2").is_ok());
        assert_matches!(validate_object_name("1volume"), Err(Error::InvalidInput(_)));
        assert_matches!(validate_object_name("vol/1"), Err(Error::InvalidInput(_)));
        assert_matches!(validate_object_name(""), Err(Error::InvalidInput(_)));
        assert_matches!(
            validate_object_name(&"a".repeat(MAX_NAME_LEN + 1)),
            Err(Error::InvalidInput(_))
        );
    }

    #[test]
    fn test_thin_volume_argv() {
        let params = ProvisioningParams::new("volpool", &options(2, false)).unwrap();
        let cmd = ArrayCommand::CreateVolume(CreateVolume::new("v1", 1024, 0, params).unwrap());
        assert_eq!(
            cmd.argv(),
            vec![
                "svctask", "mkvdisk", "-name", "v1", "-mdiskgrp", "volpool", "-iogrp", "0",
                "-size", "1024", "-unit", "b", "-easytier", "on", "-rsize", "2%",
                "-autoexpand", "-warning", "0%", "-grainsize", "256",
            ]
        );
    }

    #[test]
    fn test_compressed_and_thick_argv() {
        let params = ProvisioningParams::new("p", &options(2, true)).unwrap();
        let argv = ArrayCommand::AddVolumeCopy {
            volume: "v1".into(),
            params,
        }
        .argv();
        assert!(argv.contains(&"-compressed".to_string()));
        assert!(!argv.contains(&"-grainsize".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("v1"));

        let params = ProvisioningParams::new("p", &options(-1, false)).unwrap();
        let argv = ArrayCommand::CreateVolume(CreateVolume::new("v2", 1, 0, params).unwrap()).argv();
        assert!(!argv.contains(&"-rsize".to_string()));
    }

    #[test]
    fn test_create_volume_rejects_bad_input() {
        let params = ProvisioningParams::new("p", &options(2, false)).unwrap();
        assert_matches!(
            CreateVolume::new("9bad", 1, 0, params.clone()),
            Err(Error::InvalidInput(_))
        );
        assert_matches!(CreateVolume::new("good", 0, 0, params), Err(Error::InvalidInput(_)));
        assert_matches!(
            ProvisioningParams::new("p", &options(-1, true)),
            Err(Error::InvalidInput(_))
        );
    }

    #[test]
    fn test_query_argv_and_targets() {
        let cmd = ArrayCommand::ListPitMappings {
            filter: Some(PitFilter::Target("snap-1".into())),
        };
        assert_eq!(
            cmd.argv(),
            vec!["svcinfo", "lsfcmap", "-delim", "!", "-filtervalue", "target_vdisk_name=snap-1"]
        );
        assert!(cmd.is_query());

        let cmd = ArrayCommand::MapVolume {
            volume: "v1".into(),
            host: "h1".into(),
            lun: 3,
            force: true,
        };
        assert_eq!(
            cmd.argv(),
            vec!["svctask", "mkvdiskhostmap", "-host", "h1", "-scsi", "3", "-force", "v1"]
        );
        assert_eq!(cmd.target(), (ObjectKind::Volume, "v1"));
    }

    #[test]
    fn test_display_hides_chap_secret() {
        let cmd = ArrayCommand::SetChapSecret {
            host: "h1".into(),
            secret: "topsecret".into(),
        };
        assert!(!cmd.to_string().contains("topsecret"));
    }
}
