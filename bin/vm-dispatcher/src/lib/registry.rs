// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The identity registry: which VM uuids this dispatcher knows about, and
//! which of them are currently held by an exclusive operation.
//!
//! An identity moves through three states. It is *undeclared* until an
//! incoming migration reserves it with [`Registry::declare`]; a *declared*
//! identity has a home path and a name but no VM object yet; a *bound*
//! identity is backed by a [`Vm`] handle. Incoming migrations always finish
//! by either binding or undeclaring what they declared.
//!
//! Independently of the entry map, [`Registry::lock`] lets an operation claim
//! a uuid exclusively. A second claim fails immediately rather than waiting.
//!
//! One process-wide `RwLock` guards both maps. It is never held across an
//! await point. Per-VM config changes go through the handle's own lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use dispatcher_api_types::{ErrorCode, VmState};
use dispatcher_config::BundleLayout;
use slog::{debug, info, Logger};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::migrate::commands::VmIdentity;
use crate::vm::config::VmConfig;

/// Kinds of exclusive per-VM operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Operation {
    MigrateOut,
    CloneOut,
    Edit,
    Delete,
}

/// Which part of a new identity clashed with an existing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collision {
    Uuid,
    Path,
    Name,
    /// The uuid is held by an exclusive operation but has no entry.
    Generic,
}

impl Collision {
    pub fn code(self) -> ErrorCode {
        match self {
            Collision::Uuid => ErrorCode::VmAlreadyRegisteredUuid,
            Collision::Path => ErrorCode::VmAlreadyRegisteredPath,
            Collision::Name => ErrorCode::VmAlreadyRegisteredName,
            Collision::Generic => ErrorCode::VmAlreadyRegistered,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("identity already registered ({0:?})")]
    AlreadyRegistered(Collision),

    #[error("VM {0} is not registered")]
    NotFound(Uuid),

    #[error("VM {0} is held by operation {1}")]
    AlreadyLocked(Uuid, Operation),
}

/// Where an identity is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Undeclared,
    Declared,
    Bound,
}

enum Entry {
    Declared { home: PathBuf, name: String },
    Bound(Arc<Vm>),
}

impl Entry {
    fn home(&self) -> PathBuf {
        match self {
            Entry::Declared { home, .. } => home.clone(),
            Entry::Bound(vm) => vm.home(),
        }
    }

    fn name_matches(&self, name: &str) -> bool {
        match self {
            Entry::Declared { name: n, .. } => n == name,
            Entry::Bound(vm) => vm.name() == name,
        }
    }
}

#[derive(Default)]
struct Maps {
    entries: HashMap<Uuid, Entry>,
    locks: HashMap<Uuid, Operation>,
}

pub struct Registry {
    log: Logger,
    maps: RwLock<Maps>,
}

impl Registry {
    pub fn new(log: &Logger) -> Arc<Self> {
        Arc::new(Registry {
            log: log.new(slog::o!("component" => "registry")),
            maps: RwLock::new(Maps::default()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves an identity for a VM that does not exist yet.
    ///
    /// A uuid clash is reported before a path clash, which is reported
    /// before a name clash.
    pub fn declare(
        &self,
        identity: &VmIdentity,
        home: &Path,
        name: &str,
    ) -> Result<(), RegistryError> {
        let mut maps = self.write();
        let uuid = identity.vm_uuid;
        if maps.entries.contains_key(&uuid) {
            return Err(RegistryError::AlreadyRegistered(Collision::Uuid));
        }
        if maps.locks.contains_key(&uuid) {
            return Err(RegistryError::AlreadyRegistered(Collision::Generic));
        }
        if maps.entries.values().any(|e| e.home() == home) {
            return Err(RegistryError::AlreadyRegistered(Collision::Path));
        }
        if maps.entries.values().any(|e| e.name_matches(name)) {
            return Err(RegistryError::AlreadyRegistered(Collision::Name));
        }
        maps.entries.insert(
            uuid,
            Entry::Declared {
                home: home.to_path_buf(),
                name: name.to_string(),
            },
        );
        info!(self.log, "declared identity";
              "vm_uuid" => %uuid, "home" => %home.display(), "name" => name);
        Ok(())
    }

    /// Removes an identity's entry, declared or bound.
    pub fn undeclare(&self, uuid: Uuid) -> Result<(), RegistryError> {
        match self.write().entries.remove(&uuid) {
            Some(_) => {
                info!(self.log, "undeclared identity"; "vm_uuid" => %uuid);
                Ok(())
            }
            None => Err(RegistryError::NotFound(uuid)),
        }
    }

    /// Promotes a declared identity to a bound one.
    pub fn bind(&self, vm: Arc<Vm>) -> Result<(), RegistryError> {
        let uuid = vm.identity().vm_uuid;
        let mut maps = self.write();
        match maps.entries.get_mut(&uuid) {
            Some(entry) if matches!(entry, Entry::Declared { .. }) => {
                *entry = Entry::Bound(vm);
                info!(self.log, "bound identity"; "vm_uuid" => %uuid);
                Ok(())
            }
            _ => Err(RegistryError::NotFound(uuid)),
        }
    }

    /// Adds a VM that already exists on this host.
    pub fn insert(&self, vm: Arc<Vm>) -> Result<(), RegistryError> {
        let identity = vm.identity().clone();
        let (home, name) = (vm.home(), vm.name());
        self.declare(&identity, &home, &name)?;
        self.bind(vm)
    }

    pub fn find(&self, uuid: Uuid) -> Result<Arc<Vm>, RegistryError> {
        match self.read().entries.get(&uuid) {
            Some(Entry::Bound(vm)) => Ok(vm.clone()),
            _ => Err(RegistryError::NotFound(uuid)),
        }
    }

    pub fn state(&self, uuid: Uuid) -> EntryState {
        match self.read().entries.get(&uuid) {
            None => EntryState::Undeclared,
            Some(Entry::Declared { .. }) => EntryState::Declared,
            Some(Entry::Bound(_)) => EntryState::Bound,
        }
    }

    /// Claims `uuid` for `op` until the returned guard is dropped.
    pub fn lock(
        self: &Arc<Self>,
        uuid: Uuid,
        op: Operation,
    ) -> Result<OperationGuard, RegistryError> {
        let mut maps = self.write();
        if let Some(held) = maps.locks.get(&uuid) {
            return Err(RegistryError::AlreadyLocked(uuid, *held));
        }
        maps.locks.insert(uuid, op);
        debug!(self.log, "locked identity"; "vm_uuid" => %uuid, "op" => %op);
        Ok(OperationGuard { registry: self.clone(), uuid, op })
    }

    /// The operation currently holding `uuid`, if any.
    pub fn held_by(&self, uuid: Uuid) -> Option<Operation> {
        self.read().locks.get(&uuid).copied()
    }
}

/// An exclusive claim on a uuid. Dropping it releases the claim.
pub struct OperationGuard {
    registry: Arc<Registry>,
    uuid: Uuid,
    op: Operation,
}

impl OperationGuard {
    pub fn operation(&self) -> Operation {
        self.op
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("uuid", &self.uuid)
            .field("op", &self.op)
            .finish()
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.write().locks.remove(&self.uuid);
        debug!(self.registry.log, "released identity";
               "vm_uuid" => %self.uuid, "op" => %self.op);
    }
}

/// Notifications about a VM's runtime that other components react to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorState {
    /// Last lifecycle state reported for the VM.
    pub state: VmState,
    /// The VM is about to be handed over to another host.
    pub switching: bool,
    pub agent_connected: bool,
    /// Bumped on every reboot and every network or device update.
    pub gen: u64,
}

/// The narrow set of runtime notifications a VM handle accepts.
pub struct Reactor {
    tx: watch::Sender<ReactorState>,
}

impl Reactor {
    fn new(state: VmState) -> Self {
        let (tx, _) = watch::channel(ReactorState {
            state,
            switching: false,
            agent_connected: false,
            gen: 0,
        });
        Reactor { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReactorState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ReactorState {
        self.tx.borrow().clone()
    }

    pub fn state_changed(&self, state: VmState) {
        self.tx.send_modify(|s| s.state = state);
    }

    pub fn prepare_to_switch(&self, switching: bool) {
        self.tx.send_modify(|s| s.switching = switching);
    }

    pub fn reboot(&self) {
        self.tx.send_modify(|s| s.gen += 1);
    }

    pub fn agent_connected(&self, connected: bool) {
        self.tx.send_modify(|s| s.agent_connected = connected);
    }

    pub fn network_updated(&self) {
        self.tx.send_modify(|s| s.gen += 1);
    }

    pub fn devices_updated(&self) {
        self.tx.send_modify(|s| s.gen += 1);
    }
}

/// A VM registered on this host.
pub struct Vm {
    identity: VmIdentity,
    config: Mutex<VmConfig>,
    reactor: Reactor,
}

impl Vm {
    pub fn new(dir_uuid: Uuid, config: VmConfig, state: VmState) -> Arc<Vm> {
        Arc::new(Vm {
            identity: VmIdentity { vm_uuid: config.uuid, dir_uuid },
            config: Mutex::new(config),
            reactor: Reactor::new(state),
        })
    }

    fn lock_config(&self) -> MutexGuard<'_, VmConfig> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn identity(&self) -> &VmIdentity {
        &self.identity
    }

    /// A snapshot of the current config.
    pub fn config(&self) -> VmConfig {
        self.lock_config().clone()
    }

    /// Applies `f` to the config under the VM's config lock.
    pub fn update_config<R>(&self, f: impl FnOnce(&mut VmConfig) -> R) -> R {
        f(&mut self.lock_config())
    }

    pub fn home(&self) -> PathBuf {
        self.lock_config().home.clone()
    }

    pub fn name(&self) -> String {
        self.lock_config().name.clone()
    }

    pub fn config_path(&self, layout: &BundleLayout) -> PathBuf {
        self.home().join(&layout.config_file)
    }

    /// Where the VM's runtime statistics are recorded.
    pub fn stats_path(&self, layout: &BundleLayout) -> PathBuf {
        self.home().join(&layout.stats_file)
    }

    /// The state the VM's agent last reported.
    pub fn agent_state(&self) -> VmState {
        self.reactor.current().state
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}
