// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Receives a VM sent by a peer dispatcher and registers it on this host.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dispatcher_api_types::{
    CheckError, DispatcherEventKind, ErrorCode, MigrationState, VmState,
};
use slog::{error, info, warn, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::{Message, Package};
use super::commands::{
    CheckPreconditions, CheckPreconditionsReply, Response, StartCommand,
    StartReply, VmIdentity,
};
use super::conn::{Connection, Inbound};
use super::file_copy::target::FileReceiver;
use super::phase::{self, Effect, Phase, StepEvent};
use super::pump::HotPump;
use super::rollback::StepsLedger;
use super::task_events::{
    cancellable, unsolicited, TaskEvent, TaskEvents, Timer,
};
use super::{
    task_logger, MigrateError, MigrateRole, MigrationFlags, ReservedFlags,
};
use crate::registry::{RegistryError, Vm};
use crate::server::DispatcherContext;
use crate::services::LiveMigration;
use crate::vm::bundle;
use crate::vm::config::VmConfig;
use crate::vm::state_publisher::MigrationStateUpdate;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumIter,
)]
pub enum TargetPhase {
    ValidatingCheck,
    Locking,
    RepliedCheck,
    AwaitingStart,
    Materializing,
    Receiving,
    Committing,
    Registering,
    Notifying,
    Done,
    Failed,
    Cancelled,
}

impl Phase for TargetPhase {
    const FAILED: Self = TargetPhase::Failed;
    const CANCELLED: Self = TargetPhase::Cancelled;
    const DONE: Self = TargetPhase::Done;

    fn next(self) -> Self {
        use TargetPhase::*;
        match self {
            ValidatingCheck => Locking,
            Locking => RepliedCheck,
            RepliedCheck => AwaitingStart,
            AwaitingStart => Materializing,
            Materializing => Receiving,
            Receiving => Committing,
            Committing => Registering,
            Registering => Notifying,
            Notifying => Done,
            terminal => terminal,
        }
    }

    fn ignores_cancel(self) -> bool {
        self == TargetPhase::Notifying
    }
}

#[derive(Debug)]
enum TargetStep {
    Declared(Uuid),
    BundleCreated(PathBuf),
    /// Entries written into a bundle that existed before this attempt.
    EntriesCreated(Vec<PathBuf>),
    ExtDirCreated(PathBuf),
    MigrateStarted,
    CatalogItem,
    ConfigWatched(PathBuf),
    HaResource { name: String, bundle: PathBuf },
}

/// Check results that do not stop the source from going ahead on its own
/// terms.
fn is_waivable(err: &CheckError) -> bool {
    matches!(err.code, ErrorCode::StorageIsShared | ErrorCode::CpuIncompatible)
}

pub(crate) struct TargetTask {
    ctx: Arc<DispatcherContext>,
    log: Logger,
    id: Uuid,
    cancel: CancellationToken,
    conn: Connection,
    events: TaskEvents,

    check: CheckPreconditions,
    flags: MigrationFlags,
    reserved: ReservedFlags,
    /// The VM as the source knows it.
    source_identity: VmIdentity,
    /// The VM as it will be registered here; differs for copies.
    identity: VmIdentity,
    config: Option<VmConfig>,
    home: PathBuf,
    home_existed: bool,
    non_shared: Vec<PathBuf>,
    errors: Vec<CheckError>,
    warnings: Vec<CheckError>,
    start: Option<StartCommand>,

    /// Id of the request the source is waiting on an answer to.
    pending_request: Option<u64>,
    /// The failure has already been reported to the source.
    reported: bool,
    steps: StepsLedger<TargetStep>,
    error: Option<MigrateError>,
}

impl TargetTask {
    pub(crate) fn new(
        ctx: Arc<DispatcherContext>,
        conn: Connection,
        inbound: Inbound,
        check_id: u64,
        check: CheckPreconditions,
        cancel: CancellationToken,
    ) -> Self {
        let id = Uuid::new_v4();
        let identity = check.identity.clone();
        let log = task_logger(
            &ctx.log,
            MigrateRole::Target,
            id,
            identity.vm_uuid,
        );
        let events = TaskEvents::new(log.clone(), inbound, cancel.clone());
        TargetTask {
            steps: StepsLedger::new(&log),
            flags: check.flags(),
            reserved: check.reserved_flags(),
            source_identity: identity.clone(),
            identity,
            ctx,
            log,
            id,
            cancel,
            conn,
            events,
            check,
            config: None,
            home: PathBuf::new(),
            home_existed: false,
            non_shared: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            start: None,
            pending_request: Some(check_id),
            reported: false,
            error: None,
        }
    }

    fn timeout(&self) -> Duration {
        self.ctx.config.migration.default_timeout()
    }

    fn is_clone(&self) -> bool {
        self.flags.contains(MigrationFlags::CLONE_MODE)
    }

    fn dont_copy(&self) -> bool {
        self.reserved.contains(ReservedFlags::DONT_COPY_VM)
    }

    fn config(&self) -> Result<VmConfig, MigrateError> {
        self.config
            .clone()
            .ok_or_else(|| MigrateError::InvalidConfig("not parsed".into()))
    }

    fn update_state(&self, state: MigrationState, progress: u8) {
        self.ctx.events.update_migration(MigrationStateUpdate {
            id: self.id,
            vm_uuid: self.identity.vm_uuid,
            role: MigrateRole::Target,
            state,
            progress,
        });
    }

    pub(crate) async fn run(mut self) -> Result<(), MigrateError> {
        info!(self.log, "migration in starting";
              "flags" => ?self.flags, "reserved" => ?self.reserved);
        let mut phase = TargetPhase::ValidatingCheck;
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
        self.finish(phase).await
    }

    async fn run_phase(
        &mut self,
        phase: TargetPhase,
    ) -> Result<(), MigrateError> {
        match phase {
            TargetPhase::ValidatingCheck => {
                self.validate();
                Ok(())
            }
            TargetPhase::Locking => {
                self.declare();
                Ok(())
            }
            TargetPhase::RepliedCheck => self.reply_check().await,
            TargetPhase::AwaitingStart => self.await_start().await,
            TargetPhase::Materializing => self.materialize().await,
            TargetPhase::Receiving => self.receive().await,
            TargetPhase::Committing => self.commit().await,
            TargetPhase::Registering => self.register().await,
            TargetPhase::Notifying => self.notify().await,
            TargetPhase::Done
            | TargetPhase::Failed
            | TargetPhase::Cancelled => Ok(()),
        }
    }

    fn blocking_errors(&self) -> bool {
        self.errors.iter().any(|e| !is_waivable(e))
    }

    /// Collects every reason this host cannot take the VM. Nothing is
    /// created or locked here.
    fn validate(&mut self) {
        self.update_state(MigrationState::CheckingPreconditions, 0);
        let mut config = match VmConfig::parse(&self.check.config) {
            Ok(config) => config,
            Err(e) => {
                warn!(self.log, "unparseable VM config"; "error" => %e);
                self.errors.push(
                    CheckError::new(ErrorCode::ParseVmConfig)
                        .with_param(e.to_string()),
                );
                return;
            }
        };
        if self.ctx.is_shutting_down() {
            self.errors
                .push(CheckError::new(ErrorCode::DispatcherShuttingDown));
            return;
        }
        if self.flags.contains(MigrationFlags::CHANGE_SID) && !self.is_clone() {
            self.errors
                .push(CheckError::new(ErrorCode::ChangeSidRequiresClone));
            return;
        }

        let layout = &self.ctx.config.bundle;
        let source_parent = config.home.parent().map(|p| p.to_path_buf());
        let shared = config.home.join(&self.check.probe_file).exists()
            && match &self.check.target_home {
                Some(dir) => Some(dir) == source_parent.as_ref(),
                None => true,
            };

        self.home = if shared {
            config.home.clone()
        } else {
            let parent = self
                .check
                .target_home
                .clone()
                .unwrap_or_else(|| self.ctx.config.dispatcher.vm_dir.clone());
            let folder = if self.is_clone() {
                let name =
                    self.check.target_name.as_deref().unwrap_or(&config.name);
                layout.bundle_dir_name(name)
            } else {
                config
                    .home
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| layout.bundle_dir_name(&config.name))
            };
            parent.join(folder)
        };
        self.home_existed = self.home.exists();
        info!(self.log, "resolved bundle path";
              "home" => %self.home.display(), "shared" => shared);

        if self.is_clone() && !shared {
            let copy_uuid = Uuid::new_v4();
            config.source_uuid = Some(config.uuid);
            config.uuid = copy_uuid;
            if let Some(name) = &self.check.target_name {
                config.name = name.clone();
            }
            self.identity.vm_uuid = copy_uuid;
        }

        let ignore_existing =
            self.flags.contains(MigrationFlags::IGNORE_EXISTING_BUNDLE);
        for dir in config.external_disk_dirs() {
            let dir_shared = match &self.check.extra_probe_files {
                Some(probes) => probes.iter().any(|p| {
                    p.parent() == Some(dir.as_path()) && p.exists()
                }),
                None => shared,
            };
            if dir_shared {
                continue;
            }
            if dir.exists() && !ignore_existing {
                self.errors.push(
                    CheckError::new(ErrorCode::ExtDiskDirAlreadyExists)
                        .with_param(dir.display().to_string()),
                );
            }
            self.non_shared.push(dir);
        }

        if !shared && self.home_existed && !ignore_existing {
            self.errors.push(
                CheckError::new(ErrorCode::VmHomeAlreadyExistsOnTarget)
                    .with_param(self.home.display().to_string()),
            );
        }

        let template = config.template
            || self.flags.contains(MigrationFlags::SWITCH_TEMPLATE);
        if !template {
            if !shared {
                self.check_disk_space();
            }
            let (errors, warnings) = self.ctx.host.check_cpu(&config.cpu);
            self.errors.extend(errors);
            self.warnings.extend(warnings);
        }

        if shared {
            self.errors.push(CheckError::new(ErrorCode::StorageIsShared));
            self.reserved |= ReservedFlags::DONT_COPY_VM;
            if config.high_availability.enabled {
                self.reserved |= ReservedFlags::HA_MOVE_VM;
            }
        }
        self.config = Some(config);
    }

    fn check_disk_space(&mut self) {
        let required = self.check.required_disk_space;
        let Some(dir) = bundle::existing_ancestor(&self.home) else {
            return;
        };
        match bundle::free_space(dir) {
            Ok(free) if free < required => {
                self.warnings.push(
                    CheckError::new(ErrorCode::NotEnoughDiskSpace)
                        .with_param(required.to_string())
                        .with_param(free.to_string()),
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(self.log, "cannot query free space";
                      "path" => %dir.display(), "error" => %e);
            }
        }
    }

    /// Reserves the identity the VM will be registered under, unless the
    /// check has already failed.
    fn declare(&mut self) {
        if self.blocking_errors() {
            return;
        }
        let Some(config) = &self.config else {
            return;
        };
        let registry = &self.ctx.registry;
        match registry.declare(&self.identity, &self.home, &config.name) {
            Ok(()) => {
                self.steps.record(TargetStep::Declared(self.identity.vm_uuid))
            }
            Err(RegistryError::AlreadyRegistered(collision)) => {
                self.errors.push(CheckError::new(collision.code()))
            }
            Err(e) => {
                warn!(self.log, "declare failed"; "error" => %e);
                self.errors
                    .push(CheckError::new(ErrorCode::VmAlreadyRegistered))
            }
        }
    }

    async fn reply_check(&mut self) -> Result<(), MigrateError> {
        let check_id =
            self.pending_request.take().ok_or(MigrateError::Disconnected)?;
        let patched_config = match (&self.config, self.is_clone()) {
            (Some(config), true) => config.to_text().ok(),
            _ => None,
        };
        let reply = CheckPreconditionsReply {
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
            non_shared_disks: Some(self.non_shared.clone()),
            version: self.conn.version().as_u32(),
            patched_config,
            reserved_flags: Some(self.reserved.bits()),
        };
        let mut job = self
            .conn
            .reply(check_id, Message::CheckPreconditionsReply(reply));
        self.conn.wait_for_send(&mut job, self.timeout()).await?;

        if self.blocking_errors() {
            self.reported = true;
            return Err(MigrateError::ChecksFailed(self.errors.clone()));
        }
        for w in &self.warnings {
            warn!(self.log, "precondition warning"; "warning" => %w);
        }
        Ok(())
    }

    async fn await_start(&mut self) -> Result<(), MigrateError> {
        let wait = self.ctx.config.migration.start_wait_timeout();
        self.events.arm(Timer::StartWait, wait);
        let res = loop {
            match self.events.next().await {
                TaskEvent::Package(Package {
                    id,
                    message: Message::Start(start),
                    ..
                }) => {
                    self.pending_request = Some(id);
                    self.flags = start.flags();
                    self.reserved |= start.reserved_flags();
                    self.start = Some(start);
                    break Ok(());
                }
                TaskEvent::Package(other) => {
                    break Err(unsolicited(MigrateRole::Source, other))
                }
                TaskEvent::TimerFired(Timer::StartWait) => {
                    break Err(MigrateError::Timeout("start command".into()))
                }
                TaskEvent::TimerFired(_) => continue,
                TaskEvent::CancelRequested => {
                    break Err(MigrateError::Cancelled)
                }
                TaskEvent::Disconnected => {
                    break Err(MigrateError::Disconnected)
                }
            }
        };
        self.events.disarm(Timer::StartWait);
        res
    }

    async fn materialize(&mut self) -> Result<(), MigrateError> {
        self.update_state(MigrationState::Starting, 0);
        let start = self
            .start
            .clone()
            .ok_or_else(|| MigrateError::UnexpectedMessage("no start".into()))?;
        let config = self.config()?;

        if !self.dont_copy() {
            if !self.home.exists() {
                fs::create_dir_all(&self.home)?;
                self.steps.record(TargetStep::BundleCreated(self.home.clone()));
            }
            if let Some(mode) = start.bundle_permissions {
                bundle::set_permissions(&self.home, mode)?;
            }
            if self.is_clone() {
                let layout = &self.ctx.config.bundle;
                let marker = self.home.join(&layout.release_marker);
                fs::write(marker, b"")?;
            }
        }
        for dir in &self.non_shared {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                self.steps.record(TargetStep::ExtDirCreated(dir.clone()));
            }
        }

        self.ctx
            .events
            .emit(&self.identity, DispatcherEventKind::MigrateStarted);
        self.steps.record(TargetStep::MigrateStarted);

        let memory_path = config.memory_file_dir.filter(|dir| dir.is_dir());
        let start_id =
            self.pending_request.take().ok_or(MigrateError::Disconnected)?;
        let mut job = self
            .conn
            .reply(start_id, Message::StartReply(StartReply { memory_path }));
        self.conn.wait_for_send(&mut job, self.timeout()).await
    }

    async fn receive(&mut self) -> Result<(), MigrateError> {
        self.update_state(MigrationState::Transferring, 0);
        let timeout = self.timeout();
        if self.flags.is_live() {
            let params = LiveMigration {
                version: self.conn.version(),
                flags: self.flags,
                memory_path: self.config()?.memory_file_dir,
            };
            let agent = self.ctx.services.agent.clone();
            let (uuid, home) = (self.identity.vm_uuid, self.home.clone());
            let channels = cancellable(&self.cancel, async {
                agent
                    .start_migrated_vm(uuid, home, params)
                    .await
                    .map_err(MigrateError::from)
            })
            .await?;
            let pump =
                HotPump::new(&self.log, &self.conn, &mut self.events, timeout);
            let stats = pump.run(channels).await?;
            info!(self.log, "live state received";
                  "sent" => stats.sent, "received" => stats.received);
        } else if !self.dont_copy() || !self.non_shared.is_empty() {
            let mut receiver = FileReceiver::new(
                &self.log,
                self.home.clone(),
                self.non_shared.clone(),
            );
            let res =
                receiver.receive(&self.conn, &mut self.events, timeout).await;
            if self.home_existed || self.dont_copy() {
                let created = receiver.created().to_vec();
                self.steps.record(TargetStep::EntriesCreated(created));
            }
            if let Err(e) = res {
                // The receiver has already told the source.
                self.reported = true;
                return Err(e.into());
            }
        } else {
            info!(self.log, "storage is shared; nothing to receive");
        }
        self.update_state(MigrationState::Transferring, 100);
        Ok(())
    }

    /// Applies the final touches to the config once the source asks to
    /// finish.
    async fn commit(&mut self) -> Result<(), MigrateError> {
        self.wait_for_finish().await?;
        self.update_state(MigrationState::Finishing, 100);

        let start = self
            .start
            .clone()
            .ok_or_else(|| MigrateError::UnexpectedMessage("no start".into()))?;
        let mut config = VmConfig::parse(&start.config)
            .map_err(|e| MigrateError::InvalidConfig(e.to_string()))?;
        if let Some(checked) = &self.config {
            config.uuid = checked.uuid;
            config.source_uuid = checked.source_uuid;
            config.name = checked.name.clone();
        }
        if self.is_clone() {
            config.reset_network_identities(&mut rand::thread_rng());
            if self.flags.contains(MigrationFlags::SWITCH_TEMPLATE) {
                config.template = !config.template;
            }
        }
        self.ctx.host.normalize_cpu(&mut config.cpu);
        config.last_server_uuid = Some(self.check.host_info.server_uuid);
        config.server_uuid = Some(self.ctx.config.dispatcher.server_uuid);
        config.home = self.home.clone();

        let path = self.home.join(&self.ctx.config.bundle.config_file);
        config
            .save(&path)
            .map_err(|e| MigrateError::Io(e.to_string()))?;
        if let Some(mode) = start.config_permissions {
            if let Err(e) = bundle::set_permissions(&path, mode) {
                warn!(self.log, "config permissions not applied";
                      "error" => %e);
                self.ctx.events.warn(
                    &self.identity,
                    CheckError::new(ErrorCode::PermissionsNotApplied)
                        .with_param(path.display().to_string()),
                );
            }
        }

        if self.is_clone() && self.flags.contains(MigrationFlags::CHANGE_SID) {
            let agent = self.ctx.services.agent.clone();
            let uuid = self.identity.vm_uuid;
            let wait = self.ctx.config.migration.change_sid_timeout();
            match tokio::time::timeout(wait, agent.change_sid(uuid)).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(MigrateError::Timeout("SID change".into()))
                }
            }
        }
        self.config = Some(config);
        Ok(())
    }

    async fn wait_for_finish(&mut self) -> Result<(), MigrateError> {
        self.events.arm(Timer::Response, self.timeout());
        let res = loop {
            match self.events.next().await {
                TaskEvent::Package(Package {
                    id, message: Message::Finish(_), ..
                }) => {
                    self.pending_request = Some(id);
                    break Ok(());
                }
                TaskEvent::Package(other) => {
                    break Err(unsolicited(MigrateRole::Source, other))
                }
                TaskEvent::TimerFired(Timer::Response) => {
                    break Err(MigrateError::Timeout("finish command".into()))
                }
                TaskEvent::TimerFired(_) => continue,
                TaskEvent::CancelRequested => {
                    break Err(MigrateError::Cancelled)
                }
                TaskEvent::Disconnected => {
                    break Err(MigrateError::Disconnected)
                }
            }
        };
        self.events.disarm(Timer::Response);
        res
    }

    fn registered_state(&self) -> VmState {
        if !self.flags.is_live() {
            return self
                .start
                .as_ref()
                .and_then(|s| s.prev_state)
                .unwrap_or(VmState::Stopped);
        }
        if self.reserved.contains(ReservedFlags::DONT_RESUME_VM) {
            VmState::Paused
        } else {
            VmState::Running
        }
    }

    async fn register(&mut self) -> Result<(), MigrateError> {
        let config = self.config()?;
        let (dir, uuid) = (self.identity.dir_uuid, self.identity.vm_uuid);
        let services = &self.ctx.services;

        services.catalog.insert_item(dir, uuid, &self.home)?;
        self.steps.record(TargetStep::CatalogItem);

        let vm = Vm::new(dir, config.clone(), self.registered_state());
        let config_path = vm.config_path(&self.ctx.config.bundle);
        self.ctx
            .registry
            .bind(vm)
            .map_err(|_| MigrateError::VmNotFound(uuid))?;

        services.watcher.register(&config_path);
        self.steps.record(TargetStep::ConfigWatched(config_path));

        if config.high_availability.enabled && !config.template {
            let (name, bundle) = (config.name.clone(), self.home.clone());
            if self.reserved.contains(ReservedFlags::HA_MOVE_VM) {
                services.ha.move_resource(name.clone(), bundle.clone()).await?;
            } else {
                services.ha.add_resource(name.clone(), bundle.clone()).await?;
            }
            self.steps.record(TargetStep::HaResource { name, bundle });
        }

        self.ctx.events.emit(&self.identity, DispatcherEventKind::VmAdded);
        if self.flags.is_live() && !config.template {
            if let Err(e) = services.agent.define_network_filters(uuid).await {
                warn!(self.log, "network filters not defined"; "error" => %e);
            }
        }
        Ok(())
    }

    async fn notify(&mut self) -> Result<(), MigrateError> {
        self.ctx
            .events
            .emit(&self.source_identity, DispatcherEventKind::MigrateFinished);
        if self.registered_state() == VmState::Running {
            self.ctx
                .events
                .emit(&self.identity, DispatcherEventKind::VmStarted);
        }
        self.update_state(MigrationState::Finished, 100);
        self.take_steps().commit();

        let finish_id =
            self.pending_request.take().ok_or(MigrateError::Disconnected)?;
        let mut job =
            self.conn.reply(finish_id, Message::Response(Response::Ok));
        self.conn.wait_for_send(&mut job, self.timeout()).await
    }

    fn take_steps(&mut self) -> StepsLedger<TargetStep> {
        std::mem::replace(&mut self.steps, StepsLedger::new(&self.log))
    }

    async fn rollback(&mut self) {
        let steps = self.take_steps();
        let undo = TargetUndo {
            ctx: self.ctx.clone(),
            log: self.log.clone(),
            identity: self.identity.clone(),
        };
        let undo = &undo;
        steps.unwind(move |step| undo.undo(step)).await;
    }

    /// Tells the source why this side stopped, once.
    async fn report(&mut self, err: &MigrateError) {
        let response = Message::Response(Response::from_error(err));
        let mut job = match self.pending_request.take() {
            Some(id) => self.conn.reply(id, response),
            // The source is not waiting on us and has gone or stopped.
            None if matches!(
                err,
                MigrateError::Cancelled
                    | MigrateError::Disconnected
                    | MigrateError::RemoteError(..)
            ) =>
            {
                return
            }
            None => self.conn.send(response),
        };
        if let Err(e) = self.conn.wait_for_send(&mut job, self.timeout()).await
        {
            warn!(self.log, "could not report failure to source";
                  "error" => %e);
        }
    }

    async fn finish(mut self, phase: TargetPhase) -> Result<(), MigrateError> {
        self.take_steps().commit();
        let res = match phase {
            TargetPhase::Done => Ok(()),
            TargetPhase::Cancelled => Err(MigrateError::Cancelled),
            _ => Err(self.error.take().unwrap_or_else(|| {
                MigrateError::UnexpectedMessage(format!(
                    "migration stopped in phase {phase}"
                ))
            })),
        };
        match &res {
            Ok(()) => info!(self.log, "migration in finished";
                            "vm_uuid" => %self.identity.vm_uuid),
            Err(e) => {
                if !self.reported {
                    self.report(e).await;
                }
                let state = if matches!(e, MigrateError::Cancelled) {
                    MigrationState::Cancelled
                } else {
                    MigrationState::Error
                };
                self.update_state(state, 0);
                error!(self.log, "migration in stopped"; "error" => %e);
            }
        }
        self.conn.close();
        res
    }
}

/// Everything needed to undo a target step, detached from the task.
struct TargetUndo {
    ctx: Arc<DispatcherContext>,
    log: Logger,
    identity: VmIdentity,
}

impl TargetUndo {
    async fn undo(&self, step: TargetStep) -> Result<(), String> {
        let services = &self.ctx.services;
        match step {
            TargetStep::HaResource { name, bundle } => services
                .ha
                .remove_resource(name, bundle)
                .await
                .map_err(|e| e.to_string()),
            TargetStep::ConfigWatched(path) => {
                services.watcher.unregister(&path);
                Ok(())
            }
            TargetStep::CatalogItem => {
                // Undone before the bundle it points at is removed.
                self.ctx
                    .events
                    .emit(&self.identity, DispatcherEventKind::VmDeleted);
                services
                    .catalog
                    .delete_item(self.identity.dir_uuid, self.identity.vm_uuid)
                    .map_err(|e| e.to_string())
            }
            TargetStep::MigrateStarted => {
                let kind = DispatcherEventKind::MigrateCancelled;
                self.ctx.events.emit(&self.identity, kind);
                Ok(())
            }
            TargetStep::EntriesCreated(mut created) => {
                created.reverse();
                let failed = bundle::remove_files(&self.log, &created);
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(format!("{} entries left behind", failed.len()))
                }
            }
            TargetStep::ExtDirCreated(dir) | TargetStep::BundleCreated(dir) => {
                bundle::remove_bundle(&self.log, &dir)
                    .map_err(|e| format!("{}: {e}", dir.display()))
            }
            TargetStep::Declared(uuid) => self
                .ctx
                .registry
                .undeclare(uuid)
                .map_err(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn transitions_cover_every_pair() {
        for phase in TargetPhase::iter() {
            for event in StepEvent::iter() {
                let (next, effect) = phase::transition(phase, event);
                if phase.is_terminal() {
                    assert_eq!((next, effect), (phase, Effect::Finish));
                    continue;
                }
                let expected = match (event, phase) {
                    (StepEvent::StepSucceeded, TargetPhase::Notifying) => {
                        (TargetPhase::Done, Effect::Finish)
                    }
                    (StepEvent::StepSucceeded, _) => {
                        (phase.next(), Effect::RunStep)
                    }
                    (StepEvent::StepFailed, TargetPhase::Notifying) => {
                        (TargetPhase::Failed, Effect::Finish)
                    }
                    (StepEvent::StepFailed, _) => {
                        (TargetPhase::Failed, Effect::Rollback)
                    }
                    (StepEvent::CancelRequested, TargetPhase::Notifying) => {
                        (TargetPhase::Notifying, Effect::Continue)
                    }
                    (StepEvent::CancelRequested, _) => {
                        (TargetPhase::Cancelled, Effect::Rollback)
                    }
                };
                assert_eq!((next, effect), expected, "{phase} on {event:?}");
            }
        }
    }

    #[test]
    fn only_shared_storage_and_cpu_are_waivable() {
        assert!(is_waivable(&CheckError::new(ErrorCode::StorageIsShared)));
        assert!(is_waivable(&CheckError::new(ErrorCode::CpuIncompatible)));
        assert!(!is_waivable(&CheckError::new(
            ErrorCode::VmHomeAlreadyExistsOnTarget
        )));
        assert!(!is_waivable(&CheckError::new(ErrorCode::NotEnoughDiskSpace)));
    }
}
