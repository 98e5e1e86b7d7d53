// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitflags::bitflags;
use dispatcher_api_types::{CheckError, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

pub(crate) mod codec;
pub mod commands;
pub mod conn;
pub mod file_copy;
pub mod helper;
pub mod phase;
pub mod protocol;
pub mod pump;
pub mod rollback;
pub mod source;
pub mod target;
pub(crate) mod task_events;


/// Trait bounds for byte streams that can carry a migration session.
pub trait MigrateConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> MigrateConn for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrateRole {
    Source,
    Target,
}

impl MigrateRole {
    fn as_str(&self) -> &'static str {
        match self {
            MigrateRole::Source => "source",
            MigrateRole::Target => "target",
        }
    }
}

impl std::fmt::Display for MigrateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    /// Caller-requested migration options. The bit layout is shared with
    /// peer dispatchers and must not change within a protocol family.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MigrationFlags: u32 {
        const WARM_MIGRATION = 1 << 0;
        const HOT_MIGRATION = 1 << 1;
        const COLD_MIGRATION = 1 << 2;
        const CLONE_MODE = 1 << 3;
        const SWITCH_TEMPLATE = 1 << 4;
        const CHANGE_SID = 1 << 5;
        const IGNORE_EXISTING_BUNDLE = 1 << 6;
        const REMOVE_SOURCE_BUNDLE = 1 << 7;
    }
}

bitflags! {
    /// Flags the dispatchers exchange among themselves to record decisions
    /// taken during the handshake.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ReservedFlags: u32 {
        const DONT_COPY_VM = 1 << 1;
        const ISCSI_STORAGE = 1 << 2;
        const FULL_DISP_TASK = 1 << 3;
        const CT_MIGRATE = 1 << 4;
        const HA_MOVE_VM = 1 << 5;
        const DONT_RESUME_VM = 1 << 6;
    }
}

impl MigrationFlags {
    /// Clears the mode bits and sets exactly `mode`.
    pub fn with_mode(self, mode: MigrationFlags) -> MigrationFlags {
        let modes = MigrationFlags::WARM_MIGRATION
            | MigrationFlags::HOT_MIGRATION
            | MigrationFlags::COLD_MIGRATION;
        (self - modes) | (mode & modes)
    }

    pub fn is_live(self) -> bool {
        self.intersects(
            MigrationFlags::HOT_MIGRATION | MigrationFlags::WARM_MIGRATION,
        )
    }
}

/// Errors which may occur during the course of a migration
#[derive(Clone, Debug, Error, Deserialize, PartialEq, Serialize)]
pub enum MigrateError {
    /// An error as a result of some Websocket operation (i.e. establishing
    /// or maintaining the connection between the source and target)
    #[error("Websocket error: {0}")]
    Websocket(String),

    /// Failed to open the migration session to the target dispatcher
    #[error("couldn't establish migration connection to {0}")]
    Initiate(String),

    #[error("failed to parse the offered protocol list ({0}): {1}")]
    ProtocolParse(String, String),

    /// The source and target dispatchers are not compatible
    #[error("source ({0}) and target ({1}) have no common protocol")]
    NoMatchingProtocol(String, String),

    /// Encountered an error as part of encoding/decoding migration messages
    #[error("codec error: {0}")]
    Codec(String),

    /// Received a message out of order
    #[error("received unexpected migration message: {0}")]
    UnexpectedMessage(String),

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The peer went away mid-handshake
    #[error("migration connection closed")]
    Disconnected,

    /// The operation was cancelled, locally or by the peer
    #[error("migration was cancelled")]
    Cancelled,

    #[error("target {0} is this host")]
    SameHost(String),

    #[error("dispatcher is shutting down")]
    DispatcherShuttingDown,

    /// Another exclusive operation already holds the VM
    #[error("VM {0} is already being migrated")]
    AlreadyMigrating(Uuid),

    #[error("VM has a device that cannot be migrated: {0}")]
    DeviceNotMigratable(String),

    /// The target rejected the precondition check
    #[error("migration preconditions failed: {0:?}")]
    ChecksFailed(Vec<CheckError>),

    #[error("remote protocol version {0} does not support live migration")]
    HotMigrationUnsupported(u32),

    #[error("cannot clone a VM on shared storage")]
    CannotCloneSharedVm,

    #[error("VM {0} is not registered")]
    VmNotFound(Uuid),

    #[error("invalid VM configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("file copy failed: {0}")]
    FileCopy(String),

    #[error("hot migration channel failed: {0}")]
    Pump(String),

    #[error("VM agent error: {0}")]
    Agent(String),

    #[error("container migration is not implemented")]
    Unimplemented,

    /// The other end of the migration ran into an error
    #[error("{0:?} migration dispatcher encountered error {1:?}: {2}")]
    RemoteError(MigrateRole, ErrorCode, String),
}

impl MigrateError {
    /// Maps this error onto the code reported to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            MigrateError::Cancelled => ErrorCode::Cancelled,
            MigrateError::Timeout(_) => ErrorCode::Timeout,
            MigrateError::SameHost(_) => ErrorCode::SameHost,
            MigrateError::DispatcherShuttingDown => {
                ErrorCode::DispatcherShuttingDown
            }
            MigrateError::AlreadyMigrating(_) => ErrorCode::AlreadyMigrating,
            MigrateError::DeviceNotMigratable(_) => {
                ErrorCode::DeviceNotMigratable
            }
            MigrateError::ChecksFailed(_) => ErrorCode::ChecksFailed,
            MigrateError::HotMigrationUnsupported(_) => {
                ErrorCode::HotMigrationUnsupported
            }
            MigrateError::CannotCloneSharedVm => ErrorCode::CannotCloneSharedVm,
            MigrateError::InvalidConfig(_) => ErrorCode::ParseVmConfig,
            MigrateError::NoMatchingProtocol(_, _)
            | MigrateError::ProtocolParse(_, _) => {
                ErrorCode::UnsupportedProtocolVersion
            }
            MigrateError::Unimplemented => ErrorCode::Unimplemented,
            MigrateError::RemoteError(_, code, _) => *code,
            MigrateError::Websocket(_)
            | MigrateError::Initiate(_)
            | MigrateError::Codec(_)
            | MigrateError::UnexpectedMessage(_)
            | MigrateError::Disconnected
            | MigrateError::VmNotFound(_)
            | MigrateError::Io(_)
            | MigrateError::FileCopy(_)
            | MigrateError::Pump(_)
            | MigrateError::Agent(_) => ErrorCode::InternalMigrationError,
        }
    }

    /// Transport and internal failures are always fatal; everything else is
    /// a validation outcome or a cancellation.
    pub fn is_transport(&self) -> bool {
        self.code() == ErrorCode::InternalMigrationError
            || matches!(self, MigrateError::Timeout(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MigrateError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> MigrateError {
        MigrateError::Websocket(err.to_string())
    }
}

impl From<codec::ProtocolError> for MigrateError {
    fn from(err: codec::ProtocolError) -> Self {
        MigrateError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::Io(err.to_string())
    }
}

impl From<file_copy::CopyError> for MigrateError {
    fn from(err: file_copy::CopyError) -> Self {
        match err {
            file_copy::CopyError::Cancelled => MigrateError::Cancelled,
            file_copy::CopyError::Migrate(e) => e,
            other => MigrateError::FileCopy(other.to_string()),
        }
    }
}

impl From<pump::PumpError> for MigrateError {
    fn from(err: pump::PumpError) -> Self {
        match err {
            pump::PumpError::Cancelled => MigrateError::Cancelled,
            pump::PumpError::Connection(e) => e,
            other => MigrateError::Pump(other.to_string()),
        }
    }
}

/// Builds the child logger every migration task logs through.
pub(crate) fn task_logger(
    log: &slog::Logger,
    role: MigrateRole,
    migration_id: Uuid,
    vm_uuid: Uuid,
) -> slog::Logger {
    log.new(slog::o!(
        "migration_id" => migration_id.to_string(),
        "migrate_role" => role.as_str(),
        "vm_uuid" => vm_uuid.to_string(),
    ))
}

#[cfg(test)]
mod flag_tests {
    use super::*;

    #[test]
    fn with_mode_replaces_only_mode_bits() {
        let flags = MigrationFlags::CLONE_MODE | MigrationFlags::COLD_MIGRATION;
        let hot = flags.with_mode(MigrationFlags::HOT_MIGRATION);
        assert!(hot.contains(MigrationFlags::CLONE_MODE));
        assert!(hot.contains(MigrationFlags::HOT_MIGRATION));
        assert!(!hot.contains(MigrationFlags::COLD_MIGRATION));
        assert!(hot.is_live());
        assert!(!flags.is_live());
    }

    #[test]
    fn wire_bits_are_stable() {
        assert_eq!(ReservedFlags::DONT_COPY_VM.bits(), 0x2);
        assert_eq!(ReservedFlags::HA_MOVE_VM.bits(), 0x20);
        assert_eq!(MigrationFlags::HOT_MIGRATION.bits(), 0x2);
    }

    #[test]
    fn error_codes_classify_transport_failures() {
        assert!(MigrateError::Disconnected.is_transport());
        assert!(MigrateError::Timeout("start".into()).is_transport());
        assert!(!MigrateError::Cancelled.is_transport());
        assert!(!MigrateError::ChecksFailed(vec![]).is_transport());
        assert_eq!(
            MigrateError::RemoteError(
                MigrateRole::Target,
                ErrorCode::VmHomeAlreadyExistsOnTarget,
                String::new()
            )
            .code(),
            ErrorCode::VmHomeAlreadyExistsOnTarget
        );
    }
}
