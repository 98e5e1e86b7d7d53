// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of a VM's configuration that migration reads or rewrites.
//!
//! Configs travel between dispatchers as RON text and are persisted in the
//! bundle the same way. Fields this module does not know about are not
//! preserved; the full schema belongs to the hypervisor tooling.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum VmConfigError {
    #[error("malformed VM config: {0}")]
    Parse(String),

    #[error("failed to serialize VM config: {0}")]
    Serialize(#[from] ron::Error),

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct CpuConfig {
    pub count: u32,
    /// Feature bits the guest was started with.
    #[serde(default)]
    pub features: u64,
    #[serde(default)]
    pub vendor: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct NetworkAdapter {
    pub mac: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct HardDisk {
    /// Image path. Relative paths resolve against the bundle.
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum DeviceBacking {
    Emulated,
    /// Host device handed directly to the guest.
    Passthrough,
    /// Device served from a client machine over the network.
    Remote,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub backing: DeviceBacking,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct HaSettings {
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct VmConfig {
    pub uuid: Uuid,
    /// Uuid of the VM this one was cloned from.
    #[serde(default)]
    pub source_uuid: Option<Uuid>,
    pub name: String,
    /// Bundle directory.
    #[serde(default)]
    pub home: PathBuf,
    #[serde(default)]
    pub server_uuid: Option<Uuid>,
    #[serde(default)]
    pub last_server_uuid: Option<Uuid>,
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub windows_guest: bool,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub network_adapters: Vec<NetworkAdapter>,
    #[serde(default)]
    pub hard_disks: Vec<HardDisk>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub high_availability: HaSettings,
    /// Name of the saved-state pointer file inside the bundle, present while
    /// the VM is suspended.
    #[serde(default)]
    pub saved_state: Option<String>,
    /// Directory holding the suspended VM's memory file, when it lives
    /// outside the bundle.
    #[serde(default)]
    pub memory_file_dir: Option<PathBuf>,
}

impl VmConfig {
    pub fn new(uuid: Uuid, name: impl Into<String>, home: PathBuf) -> Self {
        VmConfig {
            uuid,
            source_uuid: None,
            name: name.into(),
            home,
            server_uuid: None,
            last_server_uuid: None,
            template: false,
            windows_guest: false,
            cpu: CpuConfig { count: 1, features: 0, vendor: String::new() },
            network_adapters: Vec::new(),
            hard_disks: Vec::new(),
            devices: Vec::new(),
            high_availability: HaSettings::default(),
            saved_state: None,
            memory_file_dir: None,
        }
    }

    pub fn parse(text: &str) -> Result<VmConfig, VmConfigError> {
        ron::de::from_str(text)
            .map_err(|e| VmConfigError::Parse(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, VmConfigError> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    pub fn load(path: &Path) -> Result<VmConfig, VmConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VmConfigError::Io(path.to_path_buf(), e))?;
        VmConfig::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), VmConfigError> {
        let text = self.to_text()?;
        std::fs::write(path, text)
            .map_err(|e| VmConfigError::Io(path.to_path_buf(), e))
    }

    /// Disks whose images live outside the bundle.
    pub fn external_disks(&self) -> impl Iterator<Item = &HardDisk> + '_ {
        self.hard_disks.iter().filter(move |d| {
            d.path.is_absolute() && !d.path.starts_with(&self.home)
        })
    }

    /// Directories holding external disk images, deduplicated and in config
    /// order.
    pub fn external_disk_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for disk in self.external_disks() {
            if let Some(parent) = disk.path.parent() {
                if !dirs.iter().any(|d| d == parent) {
                    dirs.push(parent.to_path_buf());
                }
            }
        }
        dirs
    }

    /// The first device that pins this VM to its current host, if any.
    pub fn unmigratable_device(&self) -> Option<&Device> {
        self.devices.iter().find(|d| {
            matches!(
                d.backing,
                DeviceBacking::Passthrough | DeviceBacking::Remote
            )
        })
    }

    /// Gives every network adapter a fresh locally-administered MAC.
    pub fn reset_network_identities<R: Rng>(&mut self, rng: &mut R) {
        for nic in self.network_adapters.iter_mut() {
            nic.mac = random_mac(rng);
        }
    }
}

fn random_mac<R: Rng>(rng: &mut R) -> String {
    let mut octets: [u8; 6] = rng.gen();
    // unicast, locally administered
    octets[0] = (octets[0] & 0xfc) | 0x02;
    octets
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VmConfig {
        let mut cfg = VmConfig::new(
            Uuid::new_v4(),
            "web01",
            PathBuf::from("/vms/web01.pvm"),
        );
        cfg.hard_disks = vec![
            HardDisk { path: PathBuf::from("harddisk.hdd") },
            HardDisk { path: PathBuf::from("/vms/web01.pvm/data.hdd") },
            HardDisk { path: PathBuf::from("/storage/a/ext1.hdd") },
            HardDisk { path: PathBuf::from("/storage/a/ext2.hdd") },
            HardDisk { path: PathBuf::from("/storage/b/ext3.hdd") },
        ];
        cfg.network_adapters =
            vec![NetworkAdapter { mac: "001C42000001".to_string() }];
        cfg
    }

    #[test]
    fn text_round_trip() {
        let cfg = sample();
        let text = cfg.to_text().unwrap();
        assert_eq!(VmConfig::parse(&text).unwrap(), cfg);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            VmConfig::parse("<xml/>"),
            Err(VmConfigError::Parse(_))
        ));
    }

    #[test]
    fn external_disk_dirs_are_unique_and_ordered() {
        let cfg = sample();
        assert_eq!(
            cfg.external_disk_dirs(),
            vec![PathBuf::from("/storage/a"), PathBuf::from("/storage/b")]
        );
    }

    #[test]
    fn passthrough_devices_pin_the_vm() {
        let mut cfg = sample();
        assert!(cfg.unmigratable_device().is_none());
        cfg.devices.push(Device {
            name: "usb0".to_string(),
            backing: DeviceBacking::Emulated,
        });
        assert!(cfg.unmigratable_device().is_none());
        cfg.devices.push(Device {
            name: "gpu0".to_string(),
            backing: DeviceBacking::Passthrough,
        });
        assert_eq!(cfg.unmigratable_device().unwrap().name, "gpu0");
    }

    #[test]
    fn reset_network_identities_changes_macs() {
        let mut cfg = sample();
        let before = cfg.network_adapters[0].mac.clone();
        cfg.reset_network_identities(&mut rand::thread_rng());
        let after = &cfg.network_adapters[0].mac;
        assert_ne!(&before, after);
        assert_eq!(after.len(), 17);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.pvs");
        let cfg = sample();
        cfg.save(&path).unwrap();
        assert_eq!(VmConfig::load(&path).unwrap(), cfg);
        assert!(matches!(
            VmConfig::load(&dir.path().join("nope")),
            Err(VmConfigError::Io(_, _))
        ));
    }
}
