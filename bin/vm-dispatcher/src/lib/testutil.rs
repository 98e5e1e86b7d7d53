// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process doubles for the collaborators a dispatcher runs with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dispatcher_api_types::VmState;
use dispatcher_config::Config;
use slog::Logger;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::migrate::{helper, MigrateError};
use crate::registry::Vm;
use crate::server::DispatcherContext;
use crate::services::{
    BoxedConn, Catalog, Connector, DisabledHa, InMemoryCatalog, LiveChannel,
    LiveMigration, NoopWatcher, ServiceError, Services, VmAgent,
};
use crate::tasks::TaskHandle;
use crate::vm::config::VmConfig;
use crate::vm::host::HostInfo;

/// What the fake runtime streams out of a running VM.
pub(crate) const LIVE_PAYLOAD: &[u8] = b"vcpu state and dirty pages";

/// What the fake runtime answers once it has received a VM.
pub(crate) const LIVE_ACK: &[u8] = b"resumed";

pub(crate) fn logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// A runtime that keeps VM states in memory and streams a fixed payload
/// for live migrations.
#[derive(Default)]
pub(crate) struct FakeAgent {
    states: Mutex<HashMap<Uuid, VmState>>,
    history: Mutex<Vec<(Uuid, VmState)>>,
    received: Arc<Mutex<Vec<u8>>>,
    sid_changed: Mutex<Vec<Uuid>>,
}

impl FakeAgent {
    pub(crate) fn set(&self, vm: Uuid, state: VmState) {
        self.states.lock().unwrap().insert(vm, state);
    }

    /// States the dispatcher moved `vm` through, oldest first.
    pub(crate) fn history(&self, vm: Uuid) -> Vec<VmState> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == vm)
            .map(|(_, s)| *s)
            .collect()
    }

    pub(crate) fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn sid_changed(&self) -> Vec<Uuid> {
        self.sid_changed.lock().unwrap().clone()
    }
}

#[async_trait]
impl VmAgent for FakeAgent {
    async fn vm_state(&self, vm: Uuid) -> Result<VmState, ServiceError> {
        let states = self.states.lock().unwrap();
        Ok(states.get(&vm).copied().unwrap_or(VmState::Stopped))
    }

    async fn set_state(
        &self,
        vm: Uuid,
        state: VmState,
    ) -> Result<(), ServiceError> {
        self.history.lock().unwrap().push((vm, state));
        self.set(vm, state);
        Ok(())
    }

    async fn begin_live_migration(
        &self,
        _vm: Uuid,
        _params: LiveMigration,
    ) -> Result<Vec<LiveChannel>, ServiceError> {
        let (pump_end, mut runtime) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            runtime.write_all(LIVE_PAYLOAD).await?;
            runtime.shutdown().await?;
            let mut ack = Vec::new();
            runtime.read_to_end(&mut ack).await?;
            Ok::<_, std::io::Error>(())
        });
        Ok(vec![LiveChannel { id: 0, stream: Box::new(pump_end) }])
    }

    async fn start_migrated_vm(
        &self,
        _vm: Uuid,
        _home: PathBuf,
        _params: LiveMigration,
    ) -> Result<Vec<LiveChannel>, ServiceError> {
        let (pump_end, mut runtime) = tokio::io::duplex(64 * 1024);
        let received = self.received.clone();
        tokio::spawn(async move {
            let mut got = Vec::new();
            runtime.read_to_end(&mut got).await?;
            received.lock().unwrap().extend_from_slice(&got);
            runtime.write_all(LIVE_ACK).await?;
            runtime.shutdown().await?;
            Ok::<_, std::io::Error>(())
        });
        Ok(vec![LiveChannel { id: 0, stream: Box::new(pump_end) }])
    }

    async fn define_network_filters(
        &self,
        _vm: Uuid,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn change_sid(&self, vm: Uuid) -> Result<(), ServiceError> {
        self.sid_changed.lock().unwrap().push(vm);
        Ok(())
    }
}

/// A websocket pair over an in-memory pipe.
pub(crate) async fn ws_pair(
) -> (WebSocketStream<BoxedConn>, WebSocketStream<BoxedConn>) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let client = WebSocketStream::from_raw_socket(
        Box::new(a) as BoxedConn,
        Role::Client,
        None,
    );
    let server = WebSocketStream::from_raw_socket(
        Box::new(b) as BoxedConn,
        Role::Server,
        None,
    );
    tokio::join!(client, server)
}

type Accepted = JoinHandle<Result<TaskHandle, MigrateError>>;

/// Connects every target address to one in-process dispatcher.
pub(crate) struct LoopbackConnector {
    target: Arc<DispatcherContext>,
    accepted: Mutex<Vec<Accepted>>,
}

impl LoopbackConnector {
    pub(crate) fn new(target: Arc<DispatcherContext>) -> Arc<Self> {
        let accepted = Mutex::new(Vec::new());
        Arc::new(LoopbackConnector { target, accepted })
    }

    /// Waits for the target task started by the most recent session.
    pub(crate) async fn target_result(&self) -> Result<(), MigrateError> {
        let accepted = self.accepted.lock().unwrap().pop();
        let Some(accepted) = accepted else {
            return Err(MigrateError::Disconnected);
        };
        let mut handle = accepted.await.unwrap()?;
        handle.wait().await
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        _target: &str,
    ) -> Result<WebSocketStream<BoxedConn>, MigrateError> {
        let (client, server) = ws_pair().await;
        let target = self.target.clone();
        let accepted = tokio::spawn(async move {
            helper::accept_session(&target, server).await
        });
        self.accepted.lock().unwrap().push(accepted);
        Ok(client)
    }
}

/// One dispatcher with fake collaborators and its own VM directory.
pub(crate) struct TestHost {
    pub ctx: Arc<DispatcherContext>,
    pub agent: Arc<FakeAgent>,
    pub catalog: Arc<InMemoryCatalog>,
    pub vm_dir: tempfile::TempDir,
}

impl TestHost {
    pub(crate) fn new(connector: Arc<dyn Connector>) -> TestHost {
        TestHost::with_services(connector, |_| {})
    }

    /// Like `new`, with a chance to swap collaborators before the
    /// dispatcher is built.
    pub(crate) fn with_services(
        connector: Arc<dyn Connector>,
        edit: impl FnOnce(&mut Services),
    ) -> TestHost {
        let vm_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.dispatcher.vm_dir = vm_dir.path().to_path_buf();
        config.migration.default_timeout_secs = 5;
        config.migration.start_wait_timeout_secs = 5;
        config.migration.connect_timeout_secs = 5;

        let agent = Arc::new(FakeAgent::default());
        let catalog = Arc::new(InMemoryCatalog::default());
        let mut services = Services {
            agent: agent.clone(),
            ha: Arc::new(DisabledHa),
            catalog: catalog.clone(),
            watcher: Arc::new(NoopWatcher),
            connector,
        };
        edit(&mut services);
        let host = HostInfo::detect(config.dispatcher.server_uuid);
        let ctx = DispatcherContext::new(logger(), config, host, services);
        TestHost { ctx, agent, catalog, vm_dir }
    }

    /// Creates a bundle for `name` under this host's VM directory, with a
    /// config, a disk image and the files migration never sends.
    pub(crate) fn add_vm(&self, name: &str) -> Arc<Vm> {
        let layout = &self.ctx.config.bundle;
        let home = self.vm_dir.path().join(layout.bundle_dir_name(name));
        std::fs::create_dir_all(home.join("disks")).unwrap();
        std::fs::write(home.join("disks/root.img"), vec![7u8; 3000]).unwrap();
        std::fs::write(home.join("nvram.dat"), b"nvram").unwrap();
        std::fs::write(home.join(&layout.log_file), b"log").unwrap();
        std::fs::write(home.join(&layout.stats_file), b"stats").unwrap();

        let mut config = VmConfig::new(Uuid::new_v4(), name, home.clone());
        config.network_adapters.push(crate::vm::config::NetworkAdapter {
            mac: "02:00:00:00:00:01".to_string(),
        });
        config.save(&home.join(&layout.config_file)).unwrap();
        std::fs::write(home.join(layout.config_backup()), b"old").unwrap();

        let vm = Vm::new(Uuid::new_v4(), config, VmState::Stopped);
        self.ctx.registry.insert(vm.clone()).unwrap();
        self.catalog
            .insert_item(vm.identity().dir_uuid, vm.identity().vm_uuid, &home)
            .unwrap();
        vm
    }
}

/// A source and a target dispatcher wired to each other.
pub(crate) fn host_pair() -> (TestHost, TestHost, Arc<LoopbackConnector>) {
    let target = TestHost::new(Arc::new(Unreachable));
    let connector = LoopbackConnector::new(target.ctx.clone());
    let source = TestHost::new(connector.clone());
    (source, target, connector)
}

/// A dispatcher nobody can reach from.
pub(crate) fn context() -> Arc<DispatcherContext> {
    TestHost::new(Arc::new(Unreachable)).ctx
}

pub(crate) struct Unreachable;

#[async_trait]
impl Connector for Unreachable {
    async fn connect(
        &self,
        target: &str,
    ) -> Result<WebSocketStream<BoxedConn>, MigrateError> {
        Err(MigrateError::Initiate(target.to_string()))
    }
}

/// Relative paths of every file below `root`, sorted.
pub(crate) fn files_below(root: &Path) -> Vec<String> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap();
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

pub(crate) const SHORT: Duration = Duration::from_secs(5);
