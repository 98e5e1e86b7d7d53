// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborators the migration engine drives but does not own: the VM
//! runtime agent, the HA cluster, the directory catalog, the config watcher
//! and the transport to peer dispatchers.
//!
//! Each is a trait so tests can substitute doubles. The local
//! implementations here are what the standalone binary runs with.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dispatcher_api_types::VmState;
use slog::{info, Logger};
use thiserror::Error;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::migrate::protocol::ProtocolVersion;
use crate::migrate::{MigrateConn, MigrateError, MigrationFlags};
use crate::server::TcpConnector;

/// Any byte stream a migration can run over.
pub type BoxedConn = Box<dyn MigrateConn>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0} is not available on this host")]
    Unavailable(&'static str),

    #[error("{0}")]
    Failed(String),
}

impl From<ServiceError> for MigrateError {
    fn from(err: ServiceError) -> Self {
        MigrateError::Agent(err.to_string())
    }
}

/// Parameters the agent needs to stream a running VM's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveMigration {
    pub version: ProtocolVersion,
    pub flags: MigrationFlags,
    /// Where the target keeps the memory file, if not in the bundle.
    pub memory_path: Option<PathBuf>,
}

/// One logical stream of live VM state (memory, device state, a disk).
pub struct LiveChannel {
    pub id: u8,
    pub stream: BoxedConn,
}

impl std::fmt::Debug for LiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveChannel").field("id", &self.id).finish()
    }
}

/// Control plane of the hypervisor runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VmAgent: Send + Sync {
    async fn vm_state(&self, vm: Uuid) -> Result<VmState, ServiceError>;

    /// Moves the VM back into `state`, e.g. after a failed migration.
    async fn set_state(
        &self,
        vm: Uuid,
        state: VmState,
    ) -> Result<(), ServiceError>;

    /// Source side: asks the runtime to stream the VM out over the returned
    /// channels.
    async fn begin_live_migration(
        &self,
        vm: Uuid,
        params: LiveMigration,
    ) -> Result<Vec<LiveChannel>, ServiceError>;

    /// Target side: spawns the runtime that will receive the VM over the
    /// returned channels.
    async fn start_migrated_vm(
        &self,
        vm: Uuid,
        home: PathBuf,
        params: LiveMigration,
    ) -> Result<Vec<LiveChannel>, ServiceError>;

    async fn define_network_filters(&self, vm: Uuid)
        -> Result<(), ServiceError>;

    async fn change_sid(&self, vm: Uuid) -> Result<(), ServiceError>;
}

/// High-availability resource manager, keyed by VM name and bundle path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HaCluster: Send + Sync {
    async fn add_resource(
        &self,
        name: String,
        bundle: PathBuf,
    ) -> Result<(), ServiceError>;

    /// Re-homes a resource that already exists in the cluster.
    async fn move_resource(
        &self,
        name: String,
        bundle: PathBuf,
    ) -> Result<(), ServiceError>;

    async fn remove_resource(
        &self,
        name: String,
        bundle: PathBuf,
    ) -> Result<(), ServiceError>;
}

/// Directory of VMs visible to clients.
#[cfg_attr(test, mockall::automock)]
pub trait Catalog: Send + Sync {
    fn insert_item(
        &self,
        dir: Uuid,
        vm: Uuid,
        home: &Path,
    ) -> Result<(), ServiceError>;

    fn delete_item(&self, dir: Uuid, vm: Uuid) -> Result<(), ServiceError>;

    /// Clients that want events about `vm`.
    fn subscribers(&self, dir: Uuid, vm: Uuid) -> Vec<String>;
}

/// Watches VM config files for edits made outside the dispatcher.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigWatcher: Send + Sync {
    fn register(&self, path: &Path);
    fn unregister(&self, path: &Path);
}

/// Opens transport sessions to peer dispatchers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &str,
    ) -> Result<WebSocketStream<BoxedConn>, MigrateError>;
}

/// The collaborators a dispatcher is constructed with.
#[derive(Clone)]
pub struct Services {
    pub agent: Arc<dyn VmAgent>,
    pub ha: Arc<dyn HaCluster>,
    pub catalog: Arc<dyn Catalog>,
    pub watcher: Arc<dyn ConfigWatcher>,
    pub connector: Arc<dyn Connector>,
}

impl Services {
    /// What a standalone dispatcher runs with: no hypervisor runtime, no
    /// cluster and a catalog that lives in memory.
    pub fn local(log: &Logger, connect_timeout: Duration) -> Services {
        Services {
            agent: Arc::new(StoppedAgent::new(log)),
            ha: Arc::new(DisabledHa),
            catalog: Arc::new(InMemoryCatalog::default()),
            watcher: Arc::new(NoopWatcher),
            connector: Arc::new(TcpConnector::new(log, connect_timeout)),
        }
    }
}

/// An agent for hosts without a hypervisor runtime: every VM is stopped and
/// cannot be migrated live.
pub struct StoppedAgent {
    log: Logger,
    states: Mutex<HashMap<Uuid, VmState>>,
}

impl StoppedAgent {
    pub fn new(log: &Logger) -> Self {
        StoppedAgent {
            log: log.new(slog::o!("component" => "agent")),
            states: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VmAgent for StoppedAgent {
    async fn vm_state(&self, vm: Uuid) -> Result<VmState, ServiceError> {
        let states =
            self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(states.get(&vm).copied().unwrap_or(VmState::Stopped))
    }

    async fn set_state(
        &self,
        vm: Uuid,
        state: VmState,
    ) -> Result<(), ServiceError> {
        match state {
            VmState::Stopped | VmState::Migrating => {
                info!(self.log, "VM state set";
                      "vm_uuid" => %vm, "state" => %state);
                self.states
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(vm, state);
                Ok(())
            }
            _ => Err(ServiceError::Unavailable("VM runtime")),
        }
    }

    async fn begin_live_migration(
        &self,
        _vm: Uuid,
        _params: LiveMigration,
    ) -> Result<Vec<LiveChannel>, ServiceError> {
        Err(ServiceError::Unavailable("live migration"))
    }

    async fn start_migrated_vm(
        &self,
        _vm: Uuid,
        _home: PathBuf,
        _params: LiveMigration,
    ) -> Result<Vec<LiveChannel>, ServiceError> {
        Err(ServiceError::Unavailable("live migration"))
    }

    async fn define_network_filters(
        &self,
        _vm: Uuid,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn change_sid(&self, _vm: Uuid) -> Result<(), ServiceError> {
        Err(ServiceError::Unavailable("guest tools"))
    }
}

/// HA support for hosts outside a cluster: every call succeeds and does
/// nothing.
pub struct DisabledHa;

#[async_trait]
impl HaCluster for DisabledHa {
    async fn add_resource(
        &self,
        _name: String,
        _bundle: PathBuf,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn move_resource(
        &self,
        _name: String,
        _bundle: PathBuf,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn remove_resource(
        &self,
        _name: String,
        _bundle: PathBuf,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}

#[derive(Default)]
struct CatalogState {
    items: HashMap<(Uuid, Uuid), PathBuf>,
    subscribers: HashMap<(Uuid, Uuid), HashSet<String>>,
}

/// A catalog that lives only as long as the process.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    fn lock(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, dir: Uuid, vm: Uuid, client: &str) {
        self.lock()
            .subscribers
            .entry((dir, vm))
            .or_default()
            .insert(client.to_string());
    }

    pub fn item(&self, dir: Uuid, vm: Uuid) -> Option<PathBuf> {
        self.lock().items.get(&(dir, vm)).cloned()
    }
}

impl Catalog for InMemoryCatalog {
    fn insert_item(
        &self,
        dir: Uuid,
        vm: Uuid,
        home: &Path,
    ) -> Result<(), ServiceError> {
        let mut state = self.lock();
        if state.items.contains_key(&(dir, vm)) {
            return Err(ServiceError::Failed(format!(
                "VM {vm} already in directory {dir}"
            )));
        }
        state.items.insert((dir, vm), home.to_path_buf());
        Ok(())
    }

    fn delete_item(&self, dir: Uuid, vm: Uuid) -> Result<(), ServiceError> {
        match self.lock().items.remove(&(dir, vm)) {
            Some(_) => Ok(()),
            None => Err(ServiceError::Failed(format!(
                "VM {vm} not in directory {dir}"
            ))),
        }
    }

    fn subscribers(&self, dir: Uuid, vm: Uuid) -> Vec<String> {
        let mut clients: Vec<String> = self
            .lock()
            .subscribers
            .get(&(dir, vm))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }
}

/// A watcher for hosts that do not track external config edits.
pub struct NoopWatcher;

impl ConfigWatcher for NoopWatcher {
    fn register(&self, _path: &Path) {}
    fn unregister(&self, _path: &Path) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopped_agent_refuses_live_work() {
        let agent = StoppedAgent::new(&Logger::root(slog::Discard, slog::o!()));
        let vm = Uuid::new_v4();
        assert_eq!(agent.vm_state(vm).await.unwrap(), VmState::Stopped);
        agent.set_state(vm, VmState::Migrating).await.unwrap();
        assert_eq!(agent.vm_state(vm).await.unwrap(), VmState::Migrating);
        assert!(agent.set_state(vm, VmState::Running).await.is_err());

        let params = LiveMigration {
            version: ProtocolVersion::CURRENT,
            flags: MigrationFlags::HOT_MIGRATION,
            memory_path: None,
        };
        assert!(agent.begin_live_migration(vm, params).await.is_err());
    }

    #[test]
    fn catalog_tracks_items_and_subscribers() {
        let catalog = InMemoryCatalog::default();
        let (dir, vm) = (Uuid::new_v4(), Uuid::new_v4());
        catalog.insert_item(dir, vm, Path::new("/vms/a.pvm")).unwrap();
        assert!(catalog.insert_item(dir, vm, Path::new("/x")).is_err());
        assert_eq!(catalog.item(dir, vm), Some(PathBuf::from("/vms/a.pvm")));

        catalog.subscribe(dir, vm, "client-b");
        catalog.subscribe(dir, vm, "client-a");
        assert_eq!(catalog.subscribers(dir, vm), vec!["client-a", "client-b"]);

        catalog.delete_item(dir, vm).unwrap();
        assert!(catalog.delete_item(dir, vm).is_err());
    }
}
