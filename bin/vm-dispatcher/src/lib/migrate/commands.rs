// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed dispatcher-to-dispatcher commands.
//!
//! Fields introduced after the oldest supported protocol version are
//! `Option`s. After a session negotiates its version, both ends pass every
//! outgoing and incoming command through `restrict`, which drops the fields
//! the peer is not allowed to see. A field that is absent on the wire and a
//! field stripped by `restrict` are indistinguishable to the receiver.

use std::path::PathBuf;

use bytes::Bytes;
use dispatcher_api_types::{CheckError, ErrorCode, StorageInfo, VmState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::ProtocolVersion;
use super::{MigrateError, MigrationFlags, ReservedFlags};
use crate::vm::host::HostInfo;

fn gate<T>(
    field: &mut Option<T>,
    session: ProtocolVersion,
    since: ProtocolVersion,
) {
    if session < since {
        *field = None;
    }
}

/// Identifies the VM a Finish or Cancel refers to.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct VmIdentity {
    pub vm_uuid: Uuid,
    pub dir_uuid: Uuid,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CheckPreconditions {
    pub identity: VmIdentity,
    /// Serialized `VmConfig`.
    pub config: String,
    /// Newest protocol version the sender implements.
    pub version: u32,
    pub flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<VmState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    /// Parent directory for the bundle on the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_home: Option<PathBuf>,
    /// Name of the probe file the source placed in the VM home.
    pub probe_file: String,
    /// Absolute paths of the probe files placed next to external disks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_probe_files: Option<Vec<PathBuf>>,
    pub required_disk_space: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
    pub host_info: HostInfo,
}

impl CheckPreconditions {
    pub fn flags(&self) -> MigrationFlags {
        MigrationFlags::from_bits_retain(self.flags)
    }

    pub fn reserved_flags(&self) -> ReservedFlags {
        ReservedFlags::from_bits_retain(self.reserved_flags.unwrap_or(0))
    }

    pub fn restrict(&mut self, session: ProtocolVersion) {
        gate(&mut self.reserved_flags, session, ProtocolVersion::V3);
        gate(&mut self.prev_state, session, ProtocolVersion::V3);
        gate(&mut self.extra_probe_files, session, ProtocolVersion::V4);
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct CheckPreconditionsReply {
    pub errors: Vec<CheckError>,
    #[serde(default)]
    pub warnings: Vec<CheckError>,
    /// Directories of external disks the target cannot see.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_shared_disks: Option<Vec<PathBuf>>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patched_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_flags: Option<u32>,
}

impl CheckPreconditionsReply {
    pub fn reserved_flags(&self) -> ReservedFlags {
        ReservedFlags::from_bits_retain(self.reserved_flags.unwrap_or(0))
    }

    /// Whether the target sees the source bundle through shared storage.
    pub fn storage_is_shared(&self) -> bool {
        self.errors.iter().any(|e| e.code == ErrorCode::StorageIsShared)
    }

    /// Whether any error stops the migration. The shared-storage notice
    /// never does; CPU incompatibility does unless `waive_cpu`.
    pub fn has_blocking_errors(&self, waive_cpu: bool) -> bool {
        self.errors.iter().any(|e| match e.code {
            ErrorCode::StorageIsShared => false,
            ErrorCode::CpuIncompatible => !waive_cpu,
            _ => true,
        })
    }

    pub fn restrict(&mut self, session: ProtocolVersion) {
        gate(&mut self.reserved_flags, session, ProtocolVersion::V3);
        gate(&mut self.non_shared_disks, session, ProtocolVersion::V4);
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StartCommand {
    pub identity: VmIdentity,
    pub config: String,
    /// Hypervisor runtime settings, opaque to the dispatcher.
    #[serde(default)]
    pub runtime_config: String,
    pub target_home: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_permissions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_permissions: Option<u32>,
    pub flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<VmState>,
}

impl StartCommand {
    pub fn flags(&self) -> MigrationFlags {
        MigrationFlags::from_bits_retain(self.flags)
    }

    pub fn reserved_flags(&self) -> ReservedFlags {
        ReservedFlags::from_bits_retain(self.reserved_flags.unwrap_or(0))
    }

    pub fn restrict(&mut self, session: ProtocolVersion) {
        gate(&mut self.snapshot_id, session, ProtocolVersion::V2);
        gate(&mut self.bundle_permissions, session, ProtocolVersion::V3);
        gate(&mut self.config_permissions, session, ProtocolVersion::V3);
        gate(&mut self.reserved_flags, session, ProtocolVersion::V3);
        gate(&mut self.prev_state, session, ProtocolVersion::V3);
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct StartReply {
    /// Where the target keeps the memory file; `None` means the default
    /// location inside the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_path: Option<PathBuf>,
}

/// The single terminal answer to a request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Response {
    Ok,
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default)]
        errors: Vec<CheckError>,
    },
}

impl Response {
    pub fn from_error(err: &MigrateError) -> Response {
        let errors = match err {
            MigrateError::ChecksFailed(list) => list.clone(),
            _ => Vec::new(),
        };
        Response::Error { code: err.code(), message: err.to_string(), errors }
    }
}

// File-copy sub-protocol.

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CopyFirstRequest {
    pub vm_uuid: Uuid,
    pub version: u32,
    pub total_bytes: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CopyDir {
    /// '/'-separated path relative to the receiver's root.
    pub path: String,
    pub mode: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CopyFile {
    pub path: String,
    pub size: u64,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyChunk {
    pub last: bool,
    pub data: Bytes,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CopyFailure {
    pub code: ErrorCode,
    pub message: String,
}

/// One slice of a hot-migration stream. Empty data marks end of stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelChunk {
    pub channel: u8,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::host::CpuInfo;
    use proptest::prelude::*;

    fn host_info() -> HostInfo {
        HostInfo {
            server_uuid: Uuid::nil(),
            host_name: "src".to_string(),
            cpu: CpuInfo { count: 8, vendor: "v".to_string(), features: 3 },
        }
    }

    fn check(
        prev_state: Option<VmState>,
        reserved: Option<u32>,
        extra: Option<Vec<PathBuf>>,
    ) -> CheckPreconditions {
        CheckPreconditions {
            identity: VmIdentity {
                vm_uuid: Uuid::new_v4(),
                dir_uuid: Uuid::new_v4(),
            },
            config: "(uuid: \"x\")".to_string(),
            version: ProtocolVersion::CURRENT.as_u32(),
            flags: MigrationFlags::COLD_MIGRATION.bits(),
            reserved_flags: reserved,
            prev_state,
            target_name: Some("copy".to_string()),
            target_home: None,
            probe_file: "abc.123456".to_string(),
            extra_probe_files: extra,
            required_disk_space: 4096,
            storage: Some(StorageInfo {
                ha_cluster_id: Some("cluster".to_string()),
                mount_point: None,
            }),
            host_info: host_info(),
        }
    }

    #[test]
    fn restrict_drops_newer_fields() {
        let mut cmd = check(
            Some(VmState::Running),
            Some(ReservedFlags::DONT_RESUME_VM.bits()),
            Some(vec![PathBuf::from("/ext/a.123456")]),
        );
        cmd.restrict(ProtocolVersion::V3);
        assert_eq!(cmd.prev_state, Some(VmState::Running));
        assert!(cmd.reserved_flags().contains(ReservedFlags::DONT_RESUME_VM));
        assert_eq!(cmd.extra_probe_files, None);

        cmd.restrict(ProtocolVersion::V2);
        assert_eq!(cmd.prev_state, None);
        assert_eq!(cmd.reserved_flags(), ReservedFlags::empty());
    }

    #[test]
    fn absent_fields_stay_absent_on_the_wire() {
        let cmd = check(None, None, None);
        let text = ron::ser::to_string(&cmd).unwrap();
        assert!(!text.contains("prev_state"));
        assert!(!text.contains("extra_probe_files"));
        let back: CheckPreconditions = ron::de::from_str(&text).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn storage_is_shared_alone_is_not_fatal() {
        let mut reply = CheckPreconditionsReply::default();
        assert!(!reply.storage_is_shared());
        assert!(!reply.has_blocking_errors(false));

        reply.errors.push(CheckError::new(ErrorCode::StorageIsShared));
        assert!(reply.storage_is_shared());
        assert!(!reply.has_blocking_errors(false));

        reply.errors.push(CheckError::new(ErrorCode::CpuIncompatible));
        assert!(reply.has_blocking_errors(false));
        assert!(!reply.has_blocking_errors(true));

        reply.errors.push(CheckError::new(ErrorCode::NotEnoughDiskSpace));
        assert!(reply.has_blocking_errors(true));
    }

    #[test]
    fn start_restrict_keeps_snapshot_on_oldest_version() {
        let mut start = StartCommand {
            identity: VmIdentity {
                vm_uuid: Uuid::nil(),
                dir_uuid: Uuid::nil(),
            },
            config: String::new(),
            runtime_config: String::new(),
            target_home: PathBuf::from("/vms/a.pvm"),
            snapshot_id: Some(Uuid::new_v4()),
            bundle_permissions: Some(0o750),
            config_permissions: Some(0o640),
            flags: 0,
            reserved_flags: None,
            prev_state: Some(VmState::Stopped),
        };
        start.restrict(ProtocolVersion::MIN_SUPPORTED);
        assert!(start.snapshot_id.is_some());
        assert_eq!(start.bundle_permissions, None);
        assert_eq!(start.config_permissions, None);
        assert_eq!(start.prev_state, None);
    }

    #[test]
    fn error_response_carries_check_list() {
        let errs = vec![CheckError::new(ErrorCode::VmAlreadyRegisteredName)
            .with_param("web01")];
        let resp =
            Response::from_error(&MigrateError::ChecksFailed(errs.clone()));
        match resp {
            Response::Error { code, errors, .. } => {
                assert_eq!(code, ErrorCode::ChecksFailed);
                assert_eq!(errors, errs);
            }
            Response::Ok => panic!("expected an error response"),
        }
    }

    fn arb_state() -> impl Strategy<Value = Option<VmState>> {
        prop_oneof![
            Just(None),
            Just(Some(VmState::Stopped)),
            Just(Some(VmState::Running)),
            Just(Some(VmState::Paused)),
            Just(Some(VmState::Suspended)),
        ]
    }

    proptest! {
        #[test]
        fn check_preconditions_survive_ron(
            prev_state in arb_state(),
            reserved in proptest::option::of(0u32..128),
            extra in proptest::option::of(
                proptest::collection::vec("/[a-z]{1,8}/[a-z]{1,8}", 0..4)
            ),
            disk in any::<u64>(),
            version in 2u32..=4,
        ) {
            let session = ProtocolVersion::try_from(version).unwrap();
            let mut cmd = check(
                prev_state,
                reserved,
                extra.map(|v| v.into_iter().map(PathBuf::from).collect()),
            );
            cmd.required_disk_space = disk;
            cmd.restrict(session);

            let text = ron::ser::to_string(&cmd).unwrap();
            let mut back: CheckPreconditions =
                ron::de::from_str(&text).unwrap();
            back.restrict(session);
            prop_assert_eq!(&back, &cmd);
            if session < ProtocolVersion::V4 {
                prop_assert!(back.extra_probe_files.is_none());
            }
            if session < ProtocolVersion::V3 {
                prop_assert!(back.prev_state.is_none());
            }
        }
    }
}
