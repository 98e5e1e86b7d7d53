// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moves or clones a VM registered on this host to a peer dispatcher.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dispatcher_api_types::{
    CheckError, DispatcherEventKind, ErrorCode, MigrationState, StorageInfo,
    VmState,
};
use slog::{error, info, warn, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::Message;
use super::commands::{
    CheckPreconditions, CheckPreconditionsReply, Response, StartCommand,
    VmIdentity,
};
use super::conn::Connection;
use super::file_copy::{enumerate, source::FileSender, CopyPlan};
use super::phase::{self, Effect, Phase, StepEvent};
use super::protocol::ProtocolVersion;
use super::pump::HotPump;
use super::rollback::StepsLedger;
use super::task_events::{cancellable, TaskEvents};
use super::{
    task_logger, MigrateError, MigrateRole, MigrationFlags, ReservedFlags,
};
use crate::registry::{Operation, OperationGuard, Vm};
use crate::server::DispatcherContext;
use crate::services::LiveMigration;
use crate::tasks::{TaskHandle, TaskKind};
use crate::vm::bundle::{self, ProbeFiles, SavedState};
use crate::vm::config::VmConfig;
use crate::vm::state_publisher::MigrationStateUpdate;

/// What a caller asks for when it starts a migration out of this host.
#[derive(Clone, Debug)]
pub struct MigrationRequest {
    pub vm_uuid: Uuid,
    /// `host:port` of the target dispatcher.
    pub target: String,
    /// Name for the copy; only meaningful with `CLONE_MODE`.
    pub target_name: Option<String>,
    /// Parent directory for the bundle on the target.
    pub target_home: Option<PathBuf>,
    pub flags: MigrationFlags,
    pub reserved: ReservedFlags,
    pub snapshot_id: Option<Uuid>,
}

impl MigrationRequest {
    pub fn new(vm_uuid: Uuid, target: impl Into<String>) -> Self {
        MigrationRequest {
            vm_uuid,
            target: target.into(),
            target_name: None,
            target_home: None,
            flags: MigrationFlags::empty(),
            reserved: ReservedFlags::empty(),
            snapshot_id: None,
        }
    }

    fn is_clone(&self) -> bool {
        self.flags.contains(MigrationFlags::CLONE_MODE)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumIter,
)]
pub enum SourcePhase {
    Preparing,
    Connecting,
    CheckingPreconditions,
    Negotiating,
    SendingStart,
    Transferring,
    AwaitingFinish,
    Committing,
    Done,
    Failed,
    Cancelled,
}

impl Phase for SourcePhase {
    const FAILED: Self = SourcePhase::Failed;
    const CANCELLED: Self = SourcePhase::Cancelled;
    const DONE: Self = SourcePhase::Done;

    fn next(self) -> Self {
        use SourcePhase::*;
        match self {
            Preparing => Connecting,
            Connecting => CheckingPreconditions,
            CheckingPreconditions => Negotiating,
            Negotiating => SendingStart,
            SendingStart => Transferring,
            Transferring => AwaitingFinish,
            AwaitingFinish => Committing,
            Committing => Done,
            terminal => terminal,
        }
    }

    fn ignores_cancel(self) -> bool {
        self == SourcePhase::Committing
    }
}

/// Forward steps the source undoes if the migration fails.
#[derive(Debug)]
enum SourceStep {
    /// A session to the target is open; the target must be told to stop.
    Connected,
    /// The VM was marked as migrating; holds the state to go back to.
    StateChanged(VmState),
    WatcherUnregistered(PathBuf),
    MigrateStarted,
    /// A rewritten saved-state pointer, to be sent in place of the original.
    SavedStateCopy(PathBuf),
    /// A rewritten saved-state pointer was swapped in on shared storage.
    SavedStateSwapped { sav: PathBuf, backup: PathBuf },
}

/// Starts migrating a VM out of this host and returns the task's handle.
///
/// Fails at once if any migration task already serves the VM.
pub fn start_migration(
    ctx: &Arc<DispatcherContext>,
    request: MigrationRequest,
) -> Result<TaskHandle, MigrateError> {
    let kind = if request.is_clone() {
        TaskKind::CloneSource
    } else {
        TaskKind::MigrateSource
    };
    let vm_uuid = request.vm_uuid;
    let task_ctx = ctx.clone();
    ctx.tasks
        .try_spawn(kind, vm_uuid, TaskKind::ALL_MIGRATIONS, move |cancel| {
            SourceTask::new(task_ctx, request, cancel).run()
        })
        .map_err(|_| MigrateError::AlreadyMigrating(vm_uuid))
}

struct SourceTask {
    ctx: Arc<DispatcherContext>,
    log: Logger,
    id: Uuid,
    request: MigrationRequest,
    cancel: CancellationToken,
    flags: MigrationFlags,
    reserved: ReservedFlags,

    guard: Option<OperationGuard>,
    vm: Option<Arc<Vm>>,
    /// Snapshot of the VM's config taken while preparing.
    config: Option<VmConfig>,
    prev_state: VmState,
    probes: ProbeFiles,

    conn: Option<Connection>,
    events: Option<TaskEvents>,
    /// Directories of external disks the target cannot see.
    non_shared: Vec<PathBuf>,
    /// Config text the target asked us to send instead of our own.
    patched_config: Option<String>,
    /// Where the target keeps the memory file.
    remote_memory: Option<PathBuf>,
    /// Saved-state pointer to send in place of the original, and its name in
    /// the bundle.
    sav_substitute: Option<(PathBuf, PathBuf, String)>,

    steps: StepsLedger<SourceStep>,
    error: Option<MigrateError>,
}

impl SourceTask {
    fn new(
        ctx: Arc<DispatcherContext>,
        request: MigrationRequest,
        cancel: CancellationToken,
    ) -> Self {
        let id = Uuid::new_v4();
        let log =
            task_logger(&ctx.log, MigrateRole::Source, id, request.vm_uuid);
        let mut reserved = request.reserved;
        if request.flags.contains(MigrationFlags::WARM_MIGRATION) {
            reserved |= ReservedFlags::DONT_RESUME_VM;
        }
        SourceTask {
            probes: ProbeFiles::new(&log),
            steps: StepsLedger::new(&log),
            flags: request.flags,
            reserved,
            ctx,
            log,
            id,
            request,
            cancel,
            guard: None,
            vm: None,
            config: None,
            prev_state: VmState::Stopped,
            conn: None,
            events: None,
            non_shared: Vec::new(),
            patched_config: None,
            remote_memory: None,
            sav_substitute: None,
            error: None,
        }
    }

    fn timeout(&self) -> Duration {
        self.ctx.config.migration.default_timeout()
    }

    fn vm(&self) -> Result<Arc<Vm>, MigrateError> {
        self.vm.clone().ok_or(MigrateError::VmNotFound(self.request.vm_uuid))
    }

    fn config(&self) -> Result<VmConfig, MigrateError> {
        self.config
            .clone()
            .ok_or(MigrateError::VmNotFound(self.request.vm_uuid))
    }

    fn identity(&self) -> Result<VmIdentity, MigrateError> {
        Ok(self.vm()?.identity().clone())
    }

    fn conn(&self) -> Result<Connection, MigrateError> {
        self.conn.clone().ok_or(MigrateError::Disconnected)
    }

    fn update_state(&self, state: MigrationState, progress: u8) {
        self.ctx.events.update_migration(MigrationStateUpdate {
            id: self.id,
            vm_uuid: self.request.vm_uuid,
            role: MigrateRole::Source,
            state,
            progress,
        });
    }

    fn warn(&self, warning: CheckError) {
        if let Ok(identity) = self.identity() {
            self.ctx.events.warn(&identity, warning);
        }
    }

    async fn run(mut self) -> Result<(), MigrateError> {
        info!(self.log, "migration out starting";
              "target" => &self.request.target,
              "flags" => ?self.flags);
        let mut phase = SourcePhase::Preparing;
        loop {
            let event = if !phase.ignores_cancel() && self.cancel.is_cancelled()
            {
                StepEvent::CancelRequested
            } else {
                match self.run_phase(phase).await {
                    Ok(()) => StepEvent::StepSucceeded,
                    Err(MigrateError::Cancelled) => StepEvent::CancelRequested,
                    Err(e) => {
                        error!(self.log, "migration phase failed";
                               "phase" => %phase, "error" => %e);
                        self.error = Some(e);
                        StepEvent::StepFailed
                    }
                }
            };

            let (next, effect) = phase::transition(phase, event);
            if next != phase {
                info!(self.log, "migration phase";
                      "from" => %phase, "to" => %next);
            }
            phase = next;
            match effect {
                Effect::RunStep | Effect::Continue => continue,
                Effect::Rollback => {
                    self.rollback().await;
                    break;
                }
                Effect::Finish => break,
            }
        }
        self.finish(phase)
    }

    async fn run_phase(
        &mut self,
        phase: SourcePhase,
    ) -> Result<(), MigrateError> {
        match phase {
            SourcePhase::Preparing => self.prepare().await,
            SourcePhase::Connecting => self.connect().await,
            SourcePhase::CheckingPreconditions => {
                self.check_preconditions().await
            }
            SourcePhase::Negotiating => self.negotiate().await,
            SourcePhase::SendingStart => self.send_start().await,
            SourcePhase::Transferring => self.transfer().await,
            SourcePhase::AwaitingFinish => self.await_finish().await,
            SourcePhase::Committing => {
                self.commit().await;
                Ok(())
            }
            SourcePhase::Done
            | SourcePhase::Failed
            | SourcePhase::Cancelled => Ok(()),
        }
    }

    async fn prepare(&mut self) -> Result<(), MigrateError> {
        let uuid = self.request.vm_uuid;
        self.update_state(MigrationState::Preparing, 0);
        if self.ctx.is_local_target(&self.request.target) {
            return Err(MigrateError::SameHost(self.request.target.clone()));
        }
        if self.ctx.is_shutting_down() {
            return Err(MigrateError::DispatcherShuttingDown);
        }

        let op = if self.request.is_clone() {
            Operation::CloneOut
        } else {
            Operation::MigrateOut
        };
        let guard = self
            .ctx
            .registry
            .lock(uuid, op)
            .map_err(|_| MigrateError::AlreadyMigrating(uuid))?;
        self.guard = Some(guard);

        let vm = self
            .ctx
            .registry
            .find(uuid)
            .map_err(|_| MigrateError::VmNotFound(uuid))?;
        let config = vm.config();
        if let Some(device) = config.unmigratable_device() {
            return Err(MigrateError::DeviceNotMigratable(device.name.clone()));
        }

        let state = self.ctx.services.agent.vm_state(uuid).await?;
        self.prev_state = state.as_previous();
        info!(self.log, "VM snapshot taken";
              "state" => %state, "home" => %config.home.display());
        self.vm = Some(vm);
        self.config = Some(config);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), MigrateError> {
        let connector = self.ctx.services.connector.clone();
        let target = self.request.target.clone();
        let connect_timeout = self.ctx.config.migration.connect_timeout();
        let ws = cancellable(&self.cancel, async {
            match tokio::time::timeout(
                connect_timeout,
                connector.connect(&target),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(MigrateError::Timeout(format!(
                    "connection to {target}"
                ))),
            }
        })
        .await?;

        let ceiling = self.ctx.config.migration.max_protocol_version;
        let offer = Connection::offer(ws, ceiling, self.log.clone());
        let (conn, inbound) = cancellable(&self.cancel, offer).await?;
        self.events = Some(TaskEvents::new(
            self.log.clone(),
            inbound,
            self.cancel.clone(),
        ));
        self.conn = Some(conn);
        self.steps.record(SourceStep::Connected);
        Ok(())
    }

    async fn check_preconditions(&mut self) -> Result<(), MigrateError> {
        let uuid = self.request.vm_uuid;
        let config = self.config()?;
        let home = &config.home;

        let probe = self.probes.create(home, uuid)?;
        let probe_file = probe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut extra_probe_files = Vec::new();
        for dir in config.external_disk_dirs() {
            extra_probe_files.push(self.probes.create(&dir, uuid)?);
        }

        let mut required_disk_space = bundle::dir_size(home)?;
        for disk in config.external_disks() {
            required_disk_space +=
                bundle::dir_size(&disk.path).map_err(|e| {
                    MigrateError::Io(format!("{}: {e}", disk.path.display()))
                })?;
        }

        let check = CheckPreconditions {
            identity: self.identity()?,
            config: config
                .to_text()
                .map_err(|e| MigrateError::InvalidConfig(e.to_string()))?,
            version: ProtocolVersion::CURRENT.as_u32(),
            flags: self.flags.bits(),
            reserved_flags: Some(self.reserved.bits()),
            prev_state: Some(self.prev_state),
            target_name: self.request.target_name.clone(),
            target_home: self.request.target_home.clone(),
            probe_file,
            extra_probe_files: Some(extra_probe_files),
            required_disk_space,
            storage: Some(StorageInfo {
                ha_cluster_id: None,
                mount_point: home.parent().map(|p| p.to_path_buf()),
            }),
            host_info: self.ctx.host.clone(),
        };

        self.update_state(MigrationState::CheckingPreconditions, 0);
        let conn = self.conn()?;
        let timeout = self.timeout();
        let events = self.events.as_mut().ok_or(MigrateError::Disconnected)?;
        let answer = events
            .request(
                &conn,
                MigrateRole::Target,
                Message::CheckPreconditions(check),
                timeout,
            )
            .await?;
        match answer.message {
            Message::CheckPreconditionsReply(reply) => {
                self.apply_check_reply(&config, reply)
            }
            other => Err(MigrateError::UnexpectedMessage(format!(
                "{:?}",
                other.kind()
            ))),
        }
    }

    fn apply_check_reply(
        &mut self,
        config: &VmConfig,
        reply: CheckPreconditionsReply,
    ) -> Result<(), MigrateError> {
        for warning in &reply.warnings {
            self.warn(warning.clone());
        }
        self.reserved |= reply.reserved_flags();

        let waive_cpu = !self.prev_state.is_live()
            || self.reserved.contains(ReservedFlags::DONT_RESUME_VM);
        if reply.has_blocking_errors(waive_cpu) {
            return Err(MigrateError::ChecksFailed(reply.errors));
        }
        if reply.storage_is_shared() {
            self.reserved |= ReservedFlags::DONT_COPY_VM;
            if config.high_availability.enabled {
                self.reserved |= ReservedFlags::HA_MOVE_VM;
            }
        }
        let cpu = reply
            .errors
            .iter()
            .filter(|e| e.code == ErrorCode::CpuIncompatible);
        for err in cpu {
            warn!(self.log, "waiving CPU incompatibility";
                  "error" => %err, "state" => %self.prev_state);
        }

        self.non_shared = match reply.non_shared_disks {
            Some(dirs) => dirs,
            // Older targets cannot tell; assume the external disks follow
            // the bundle.
            None if self.reserved.contains(ReservedFlags::DONT_COPY_VM) => {
                Vec::new()
            }
            None => config.external_disk_dirs(),
        };
        self.patched_config = reply.patched_config;
        info!(self.log, "preconditions met";
              "reserved" => ?self.reserved,
              "non_shared_disks" => self.non_shared.len(),
              "remote_version" => reply.version);
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<(), MigrateError> {
        let config = self.config()?;
        let conn = self.conn()?;

        let mode = if !self.prev_state.is_live() {
            MigrationFlags::COLD_MIGRATION
        } else if self.flags.contains(MigrationFlags::WARM_MIGRATION) {
            MigrationFlags::WARM_MIGRATION
        } else {
            MigrationFlags::HOT_MIGRATION
        };
        self.flags = self.flags.with_mode(mode);
        if self.flags.is_live() && conn.version() < ProtocolVersion::V3 {
            return Err(MigrateError::HotMigrationUnsupported(
                conn.version().as_u32(),
            ));
        }
        if self.request.is_clone()
            && self.reserved.contains(ReservedFlags::DONT_COPY_VM)
            && !config.template
        {
            return Err(MigrateError::CannotCloneSharedVm);
        }

        let vm = self.vm()?;
        let identity = vm.identity().clone();
        if !self.request.is_clone() {
            let uuid = self.request.vm_uuid;
            self.ctx
                .services
                .agent
                .set_state(uuid, VmState::Migrating)
                .await?;
            vm.reactor().prepare_to_switch(true);
            vm.reactor().state_changed(VmState::Migrating);
            self.steps.record(SourceStep::StateChanged(self.prev_state));
            self.ctx.events.emit(
                &identity,
                DispatcherEventKind::VmStateChanged(VmState::Migrating),
            );

            let config_path = vm.config_path(&self.ctx.config.bundle);
            self.ctx.services.watcher.unregister(&config_path);
            self.steps.record(SourceStep::WatcherUnregistered(config_path));
        }
        self.ctx.events.emit(&identity, DispatcherEventKind::MigrateStarted);
        self.steps.record(SourceStep::MigrateStarted);
        info!(self.log, "migration mode chosen"; "flags" => ?self.flags);
        Ok(())
    }

    async fn send_start(&mut self) -> Result<(), MigrateError> {
        let config = self.config()?;
        let config_path = config.home.join(&self.ctx.config.bundle.config_file);
        let config_text = match self.patched_config.take() {
            Some(text) => text,
            None => config
                .to_text()
                .map_err(|e| MigrateError::InvalidConfig(e.to_string()))?,
        };
        let start = StartCommand {
            identity: self.identity()?,
            config: config_text,
            runtime_config: String::new(),
            target_home: self.request.target_home.clone().unwrap_or_default(),
            snapshot_id: self.request.snapshot_id,
            bundle_permissions: bundle::permissions(&config.home).ok(),
            config_permissions: bundle::permissions(&config_path).ok(),
            flags: self.flags.bits(),
            reserved_flags: Some(self.reserved.bits()),
            prev_state: Some(self.prev_state),
        };

        self.update_state(MigrationState::Starting, 0);
        let conn = self.conn()?;
        let timeout = self.timeout();
        let events = self.events.as_mut().ok_or(MigrateError::Disconnected)?;
        let answer = events
            .request(&conn, MigrateRole::Target, Message::Start(start), timeout)
            .await?;
        let reply = match answer.message {
            Message::StartReply(reply) => reply,
            other => {
                return Err(MigrateError::UnexpectedMessage(format!(
                    "{:?}",
                    other.kind()
                )))
            }
        };
        self.remote_memory = reply.memory_path;
        self.prepare_saved_state(&config)?;
        Ok(())
    }

    /// Points a suspended VM's saved state at the memory file location the
    /// target uses, if that differs from ours.
    fn prepare_saved_state(
        &mut self,
        config: &VmConfig,
    ) -> Result<(), MigrateError> {
        if self.prev_state != VmState::Suspended {
            return Ok(());
        }
        let Some(name) = &config.saved_state else {
            return Ok(());
        };
        let sav = config.home.join(name);
        let local = SavedState::load(&sav)?.memory_dir;
        if local == self.remote_memory {
            return Ok(());
        }

        let layout = &self.ctx.config.bundle;
        let copy = bundle::rewrite_saved_state(
            &sav,
            &layout.migrate_suffix,
            self.remote_memory.as_deref(),
        )?;
        info!(self.log, "rewrote saved state for the target";
              "path" => %copy.display(),
              "memory_dir" => ?self.remote_memory);
        if self.reserved.contains(ReservedFlags::DONT_COPY_VM) {
            let mut backup = sav.clone().into_os_string();
            backup.push(&layout.backup_suffix);
            let backup = PathBuf::from(backup);
            if let Err(e) = bundle::swap_in_saved_state(&sav, &copy, &backup)
            {
                if let Err(rm) = fs::remove_file(&copy) {
                    warn!(self.log, "failed to remove saved state copy";
                          "path" => %copy.display(), "error" => %rm);
                }
                return Err(e.into());
            }
            self.steps.record(SourceStep::SavedStateSwapped { sav, backup });
        } else {
            self.steps.record(SourceStep::SavedStateCopy(copy.clone()));
            self.sav_substitute = Some((sav, copy, name.clone()));
        }
        Ok(())
    }

    async fn transfer(&mut self) -> Result<(), MigrateError> {
        self.update_state(MigrationState::Transferring, 0);
        if self.flags.is_live() {
            self.transfer_live().await
        } else {
            self.transfer_files().await
        }
    }

    async fn transfer_files(&mut self) -> Result<(), MigrateError> {
        let config = self.config()?;
        let copy_home = !self.reserved.contains(ReservedFlags::DONT_COPY_VM);
        if !copy_home && self.non_shared.is_empty() {
            info!(self.log, "storage is shared; nothing to copy");
            return Ok(());
        }

        let mut plan = if copy_home {
            enumerate::bundle_entries(&config.home, &self.ctx.config.bundle)?
        } else {
            CopyPlan::default()
        };
        let disks: Vec<PathBuf> =
            config.external_disks().map(|d| d.path.clone()).collect();
        plan.extend(enumerate::external_entries(&disks, &self.non_shared)?);
        plan.exclude(self.probes.paths());
        if let Some((sav, copy, dest)) = &self.sav_substitute {
            // The rewritten copy lives in the home; it only travels in
            // place of the original.
            plan.exclude(std::slice::from_ref(copy));
            plan.substitute(sav, copy, dest)?;
        }

        let identity = self.identity()?;
        let conn = self.conn()?;
        let timeout = self.timeout();
        let (ctx, id, uuid) = (self.ctx.clone(), self.id, self.request.vm_uuid);
        let events = self.events.as_mut().ok_or(MigrateError::Disconnected)?;
        FileSender::new(&self.log, &conn, events, timeout)
            .send(uuid, &plan, |pct| {
                ctx.events.update_migration(MigrationStateUpdate {
                    id,
                    vm_uuid: uuid,
                    role: MigrateRole::Source,
                    state: MigrationState::Transferring,
                    progress: pct,
                });
                ctx.events
                    .emit(&identity, DispatcherEventKind::MigrateProgress(pct));
            })
            .await?;
        Ok(())
    }

    async fn transfer_live(&mut self) -> Result<(), MigrateError> {
        let conn = self.conn()?;
        let params = LiveMigration {
            version: conn.version(),
            flags: self.flags,
            memory_path: self.remote_memory.clone(),
        };
        let agent = self.ctx.services.agent.clone();
        let uuid = self.request.vm_uuid;
        let channels = cancellable(&self.cancel, async {
            agent
                .begin_live_migration(uuid, params)
                .await
                .map_err(MigrateError::from)
        })
        .await?;

        let timeout = self.timeout();
        let events = self.events.as_mut().ok_or(MigrateError::Disconnected)?;
        let pump = HotPump::new(&self.log, &conn, events, timeout);
        let stats = pump.run(channels).await?;
        info!(self.log, "live state sent";
              "sent" => stats.sent, "received" => stats.received);
        self.update_state(MigrationState::Transferring, 100);
        Ok(())
    }

    async fn await_finish(&mut self) -> Result<(), MigrateError> {
        self.update_state(MigrationState::Finishing, 100);
        let identity = self.identity()?;
        let timeout = if self.flags.contains(MigrationFlags::CHANGE_SID) {
            self.ctx.config.migration.change_sid_timeout()
        } else {
            self.timeout()
        };
        let conn = self.conn()?;
        let events = self.events.as_mut().ok_or(MigrateError::Disconnected)?;
        let answer = events
            .request(
                &conn,
                MigrateRole::Target,
                Message::Finish(identity),
                timeout,
            )
            .await?;
        match answer.message {
            Message::Response(Response::Ok) => Ok(()),
            other => Err(MigrateError::UnexpectedMessage(format!(
                "{:?}",
                other.kind()
            ))),
        }
    }

    /// The target owns the VM now. Nothing here may fail the migration;
    /// cleanup problems become warnings.
    async fn commit(&mut self) {
        let (Ok(vm), Ok(config)) = (self.vm(), self.config()) else {
            return;
        };
        let identity = vm.identity().clone();
        let uuid = identity.vm_uuid;
        self.ctx.events.emit(&identity, DispatcherEventKind::MigrateFinished);
        self.update_state(MigrationState::Finished, 100);
        self.cleanup_saved_state();

        if self.request.is_clone() {
            vm.reactor().state_changed(self.prev_state);
            self.take_steps().commit();
            return;
        }

        let agent = &self.ctx.services.agent;
        if let Err(e) = agent.set_state(uuid, VmState::Stopped).await {
            warn!(self.log, "agent did not stop the VM"; "error" => %e);
        }
        vm.reactor().state_changed(VmState::Stopped);
        vm.reactor().prepare_to_switch(false);
        self.ctx.events.emit(
            &identity,
            DispatcherEventKind::VmStateChanged(VmState::Stopped),
        );

        if !self.reserved.contains(ReservedFlags::DONT_COPY_VM) {
            if let Err(e) = bundle::remove_bundle(&self.log, &config.home) {
                warn!(self.log, "failed to remove bundle"; "error" => %e);
                self.warn(
                    CheckError::new(ErrorCode::NotAllFilesDeleted)
                        .with_param(config.home.display().to_string()),
                );
            }
        }
        let copied_disks: Vec<PathBuf> = config
            .external_disks()
            .filter(|d| {
                d.path.parent().map_or(false, |p| {
                    self.non_shared.iter().any(|dir| dir == p)
                })
            })
            .map(|d| d.path.clone())
            .collect();
        let failed = bundle::remove_files(&self.log, &copied_disks);
        if !failed.is_empty() {
            let mut warning = CheckError::new(ErrorCode::NotAllFilesDeleted);
            for path in failed {
                warning = warning.with_param(path.display().to_string());
            }
            self.warn(warning);
        }

        if self.ctx.registry.undeclare(uuid).is_err() {
            self.warn(CheckError::new(ErrorCode::UnregisterVmFailed));
        }
        if let Err(e) =
            self.ctx.services.catalog.delete_item(identity.dir_uuid, uuid)
        {
            warn!(self.log, "catalog entry not removed"; "error" => %e);
            self.warn(CheckError::new(ErrorCode::DeleteVmFailed));
        }
        self.ctx.events.emit(&identity, DispatcherEventKind::VmDeleted);
        self.take_steps().commit();
    }

    /// Drops the saved-state files that only existed for the transfer.
    fn cleanup_saved_state(&self) {
        for step in self.steps.steps() {
            let leftover = match step {
                SourceStep::SavedStateCopy(copy) => copy,
                SourceStep::SavedStateSwapped { backup, .. } => backup,
                _ => continue,
            };
            if let Err(e) = fs::remove_file(leftover) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(self.log, "failed to remove saved state copy";
                          "path" => %leftover.display(), "error" => %e);
                }
            }
        }
    }

    fn take_steps(&mut self) -> StepsLedger<SourceStep> {
        std::mem::replace(&mut self.steps, StepsLedger::new(&self.log))
    }

    async fn rollback(&mut self) {
        let steps = self.take_steps();
        let undo = SourceUndo {
            ctx: self.ctx.clone(),
            log: self.log.clone(),
            uuid: self.request.vm_uuid,
            vm: self.vm.clone(),
            conn: self.conn.clone(),
            timeout: self.timeout(),
        };
        let undo = &undo;
        steps.unwind(move |step| undo.undo(step)).await;
    }

    fn finish(mut self, phase: SourcePhase) -> Result<(), MigrateError> {
        self.probes.remove_all();
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.guard.take();
        self.take_steps().commit();

        let res = match phase {
            SourcePhase::Done => Ok(()),
            SourcePhase::Cancelled => Err(MigrateError::Cancelled),
            _ => Err(self.error.take().unwrap_or_else(|| {
                MigrateError::UnexpectedMessage(format!(
                    "migration stopped in phase {phase}"
                ))
            })),
        };
        match &res {
            Ok(()) => info!(self.log, "migration out finished"),
            Err(MigrateError::Cancelled) => {
                self.update_state(MigrationState::Cancelled, 0);
                info!(self.log, "migration out cancelled");
            }
            Err(e) => {
                self.update_state(MigrationState::Error, 0);
                error!(self.log, "migration out failed"; "error" => %e);
            }
        }
        res
    }
}

/// Everything needed to undo a source step, detached from the task.
struct SourceUndo {
    ctx: Arc<DispatcherContext>,
    log: Logger,
    uuid: Uuid,
    vm: Option<Arc<Vm>>,
    conn: Option<Connection>,
    timeout: Duration,
}

impl SourceUndo {
    fn emit(&self, kind: DispatcherEventKind) {
        if let Some(vm) = &self.vm {
            self.ctx.events.emit(vm.identity(), kind);
        }
    }

    async fn undo(&self, step: SourceStep) -> Result<(), String> {
        match step {
            SourceStep::Connected => {
                let (Some(conn), Some(vm)) = (&self.conn, &self.vm) else {
                    return Ok(());
                };
                info!(self.log, "telling the target to stop");
                let mut job =
                    conn.send(Message::Cancel(vm.identity().clone()));
                conn.wait_for_send(&mut job, self.timeout)
                    .await
                    .map_err(|e| e.to_string())
            }
            SourceStep::StateChanged(prev) => {
                if let Some(vm) = &self.vm {
                    vm.reactor().prepare_to_switch(false);
                    vm.reactor().state_changed(prev);
                }
                self.emit(DispatcherEventKind::VmStateChanged(prev));
                self.ctx
                    .services
                    .agent
                    .set_state(self.uuid, prev)
                    .await
                    .map_err(|e| e.to_string())
            }
            SourceStep::WatcherUnregistered(path) => {
                self.ctx.services.watcher.register(&path);
                Ok(())
            }
            SourceStep::MigrateStarted => {
                self.emit(DispatcherEventKind::MigrateCancelled);
                Ok(())
            }
            SourceStep::SavedStateCopy(copy) => match fs::remove_file(&copy)
            {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    Err(format!("{}: {e}", copy.display()))
                }
                _ => Ok(()),
            },
            SourceStep::SavedStateSwapped { sav, backup } => {
                fs::rename(&backup, &sav)
                    .map_err(|e| format!("{}: {e}", backup.display()))
            }
        }
    }
}
