// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a dispatcher config which may be parsed from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Configuration for the VM dispatcher.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub bundle: BundleLayout,
}

/// Host-wide dispatcher settings.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct DispatcherConfig {
    /// Identity of this dispatcher; written into the configs of VMs that
    /// migrate in.
    #[serde(default = "Uuid::new_v4")]
    pub server_uuid: Uuid,

    /// Default parent directory for bundles of VMs that migrate in without an
    /// explicit home path.
    #[serde(default = "default_vm_dir")]
    pub vm_dir: PathBuf,

    /// Names and addresses under which this host is reachable. A migration
    /// whose target matches any of these is rejected as same-host.
    #[serde(default)]
    pub host_names: Vec<String>,
}

fn default_vm_dir() -> PathBuf {
    PathBuf::from("/var/lib/vm-dispatcher/vms")
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            server_uuid: Uuid::new_v4(),
            vm_dir: default_vm_dir(),
            host_names: Vec::new(),
        }
    }
}

/// Timeouts and protocol limits for migrations.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Bound on every send/receive wait not covered by a more specific
    /// timeout.
    pub default_timeout_secs: u64,

    /// Bound on the target's wait for a Start command after it replied to a
    /// precondition check.
    pub start_wait_timeout_secs: u64,

    /// Bound on the source's wait for the final response when the target
    /// must also regenerate the guest's SID.
    pub change_sid_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Newest protocol version this dispatcher offers. Lowering it lets an
    /// upgraded host interoperate with peers in a mixed cluster.
    pub max_protocol_version: Option<u32>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            start_wait_timeout_secs: 600,
            change_sid_timeout_secs: 3600,
            connect_timeout_secs: 30,
            max_protocol_version: None,
        }
    }
}

impl MigrationConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn start_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.start_wait_timeout_secs)
    }

    pub fn change_sid_timeout(&self) -> Duration {
        Duration::from_secs(self.change_sid_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// File names inside a VM bundle that migration treats specially.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct BundleLayout {
    pub config_file: String,
    pub backup_suffix: String,
    pub log_file: String,
    pub stats_file: String,
    /// Suffix for files renamed to avoid colliding with the target's own
    /// copies (the statistics log, a rewritten saved-state pointer).
    pub migrate_suffix: String,
    /// Marker stamped into the bundle of a VM created by clone.
    pub release_marker: String,
    /// Extension of a VM bundle directory.
    pub bundle_suffix: String,
}

impl Default for BundleLayout {
    fn default() -> Self {
        Self {
            config_file: "config.pvs".to_string(),
            backup_suffix: ".backup".to_string(),
            log_file: "vm.log".to_string(),
            stats_file: "vm.stats".to_string(),
            migrate_suffix: ".migrate".to_string(),
            release_marker: ".release".to_string(),
            bundle_suffix: ".pvm".to_string(),
        }
    }
}

impl BundleLayout {
    pub fn config_backup(&self) -> String {
        format!("{}{}", self.config_file, self.backup_suffix)
    }

    pub fn stats_migrate_name(&self) -> String {
        format!("{}{}", self.stats_file, self.migrate_suffix)
    }

    /// Returns the folder name for a bundle holding the VM `name`.
    pub fn bundle_dir_name(&self, name: &str) -> String {
        format!("{}{}", name, self.bundle_suffix)
    }
}

/// Errors which may be returned when parsing the dispatcher configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config = Config::default();
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg: Config = toml::de::from_str("").unwrap();
        assert_eq!(cfg.migration, MigrationConfig::default());
        assert_eq!(cfg.bundle, BundleLayout::default());
        assert_eq!(
            cfg.migration.start_wait_timeout(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn parse_basic_config() {
        let raw = r#"
[dispatcher]
server_uuid = "5a2b1c7e-8d3f-4e6a-9b0c-1d2e3f4a5b6c"
vm_dir = "/srv/vms"
host_names = ["node1.example", "10.0.0.1"]

[migration]
default_timeout_secs = 60
max_protocol_version = 3

[bundle]
config_file = "vm.cfg"
"#;
        let cfg: Config = toml::de::from_str(raw).unwrap();
        assert_eq!(cfg.dispatcher.vm_dir, PathBuf::from("/srv/vms"));
        assert_eq!(cfg.dispatcher.host_names.len(), 2);
        assert_eq!(cfg.migration.default_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.migration.change_sid_timeout_secs, 3600);
        assert_eq!(cfg.migration.max_protocol_version, Some(3));
        assert_eq!(cfg.bundle.config_file, "vm.cfg");
        assert_eq!(cfg.bundle.config_backup(), "vm.cfg.backup");
        assert_eq!(cfg.bundle.stats_migrate_name(), "vm.stats.migrate");
    }

    #[test]
    fn parse_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatcher.toml");
        std::fs::write(&path, "[migration]\nconnect_timeout_secs = 5\n")
            .unwrap();
        let cfg = parse(&path).unwrap();
        assert_eq!(cfg.migration.connect_timeout(), Duration::from_secs(5));

        assert!(matches!(
            parse(dir.path().join("missing.toml")),
            Err(ParseError::Io(_))
        ));
    }
}
