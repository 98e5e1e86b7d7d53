// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the VM dispatcher to its clients and to
//! peer dispatchers.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::EnumIter;
use uuid::Uuid;

/// Lifecycle state of a VM as reported by its runtime agent.
#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash, Serialize, EnumIter,
)]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Paused,
    Suspended,
    Migrating,
    Unknown,
}

impl VmState {
    /// The state a VM is considered to have been in before a migration began.
    ///
    /// A VM that is already mid-migration is treated as stopped.
    pub fn as_previous(self) -> VmState {
        match self {
            VmState::Migrating | VmState::Unknown | VmState::Starting => {
                VmState::Stopped
            }
            other => other,
        }
    }

    /// Returns true if this state implies live runtime state that must be
    /// transferred with the VM.
    pub fn is_live(self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The externally-visible phase of a migration attempt.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    Preparing,
    CheckingPreconditions,
    Starting,
    Transferring,
    Finishing,
    Finished,
    Cancelled,
    Error,
}

/// Which side of a migration a status describes.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub enum MigrationDirection {
    In,
    Out,
}

/// The status of a single migration attempt.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// The ID of the migration attempt.
    pub id: Uuid,
    pub vm_uuid: Uuid,
    pub direction: MigrationDirection,
    pub state: MigrationState,
    /// Percentage of data transferred so far.
    pub progress: u8,
}

/// The most recently published migration statuses, tagged with a generation
/// number that increases on every publication.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct MigrationMonitorResponse {
    pub gen: u64,
    pub migration_in: Option<MigrationStatus>,
    pub migration_out: Option<MigrationStatus>,
}

/// Client-visible result and event codes.
///
/// Validation codes are collected into a precondition reply; the rest
/// describe task-level failures or informational conditions.
#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash, Serialize, EnumIter,
)]
pub enum ErrorCode {
    /// Informational: the VM's home is visible from both hosts.
    StorageIsShared,
    CpuIncompatible,
    CpuCountExceedsHost,
    NotEnoughDiskSpace,
    VmHomeAlreadyExistsOnTarget,
    ExtDiskDirAlreadyExists,
    ParseVmConfig,
    DispatcherShuttingDown,
    ChangeSidRequiresClone,
    VmAlreadyRegisteredUuid,
    VmAlreadyRegisteredPath,
    VmAlreadyRegisteredName,
    VmAlreadyRegistered,
    VmAlreadyMigratingOnTarget,
    AlreadyMigrating,
    SameHost,
    DeviceNotMigratable,
    UnsupportedProtocolVersion,
    HotMigrationUnsupported,
    CannotCloneSharedVm,
    ChecksFailed,
    Unimplemented,
    Cancelled,
    Timeout,
    InternalMigrationError,
    // Non-blocking warnings.
    DeleteVmFailed,
    UnregisterVmFailed,
    NotAllFilesDeleted,
    PermissionsNotApplied,
}

impl ErrorCode {
    /// Returns true for codes that never block an otherwise-successful
    /// operation.
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            ErrorCode::StorageIsShared
                | ErrorCode::CpuCountExceedsHost
                | ErrorCode::NotEnoughDiskSpace
                | ErrorCode::DeleteVmFailed
                | ErrorCode::UnregisterVmFailed
                | ErrorCode::NotAllFilesDeleted
                | ErrorCode::PermissionsNotApplied
        )
    }
}

/// A single precondition failure or warning, with positional parameters
/// (paths, names, counts) for display.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct CheckError {
    pub code: ErrorCode,
    #[serde(default)]
    pub params: Vec<String>,
}

impl CheckError {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, params: Vec::new() }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.code)?;
        if !self.params.is_empty() {
            write!(f, " ({})", self.params.join(", "))?;
        }
        Ok(())
    }
}

/// Events published by the dispatcher to subscribed clients.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum DispatcherEventKind {
    VmStateChanged(VmState),
    VmAdded,
    VmDeleted,
    VmStarted,
    MigrateStarted,
    MigrateProgress(u8),
    MigrateFinished,
    MigrateCancelled,
    Warning(CheckError),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DispatcherEvent {
    pub vm_uuid: Uuid,
    pub dir_uuid: Uuid,
    pub kind: DispatcherEventKind,
    pub at: DateTime<Utc>,
}

/// Descriptor of the storage a VM lives on, sent with a precondition check
/// so the target can detect a shared HA cluster.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub ha_cluster_id: Option<String>,
    pub mount_point: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn previous_state_folds_transient_states() {
        for state in VmState::iter() {
            let prev = state.as_previous();
            assert!(!matches!(
                prev,
                VmState::Migrating | VmState::Unknown | VmState::Starting
            ));
        }
        assert_eq!(VmState::Running.as_previous(), VmState::Running);
        assert_eq!(VmState::Migrating.as_previous(), VmState::Stopped);
    }

    #[test]
    fn shared_storage_is_informational() {
        assert!(ErrorCode::StorageIsShared.is_warning());
        assert!(!ErrorCode::VmHomeAlreadyExistsOnTarget.is_warning());
        assert!(!ErrorCode::CpuIncompatible.is_warning());
    }

    #[test]
    fn check_error_survives_ron() {
        let err = CheckError::new(ErrorCode::VmHomeAlreadyExistsOnTarget)
            .with_param("/vms/a.pvm");
        let s = ron::ser::to_string(&err).unwrap();
        let back: CheckError = ron::de::from_str(&s).unwrap();
        assert_eq!(err, back);
        assert_eq!(
            back.to_string(),
            "VmHomeAlreadyExistsOnTarget (/vms/a.pvm)"
        );
    }
}
