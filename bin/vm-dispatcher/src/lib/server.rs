// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatcher-wide state and the transport edges of the migration engine.
//!
//! Incoming TCP connections are upgraded to websockets and handed to the
//! migrate helper, which starts a target task for them. Outgoing sessions are
//! opened by [`TcpConnector`] on behalf of source tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatcher_config::Config;
use slog::{error, info, warn, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::migrate::{helper, MigrateError};
use crate::registry::Registry;
use crate::services::{BoxedConn, Connector, Services};
use crate::tasks::TaskManager;
use crate::vm::host::HostInfo;
use crate::vm::state_publisher::EventPublisher;

/// Path a source requests when it opens a migration session.
pub const MIGRATE_PATH: &str = "/migrate";

/// Objects that this dispatcher creates, owns, and shares with every
/// migration task it runs.
pub struct DispatcherContext {
    pub log: Logger,
    pub config: Config,
    /// The host snapshot sent to peers and compared against incoming VMs.
    pub host: HostInfo,
    pub registry: Arc<Registry>,
    pub services: Services,
    pub events: EventPublisher,
    pub tasks: Arc<TaskManager>,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
}

impl DispatcherContext {
    pub fn new(
        log: Logger,
        config: Config,
        host: HostInfo,
        services: Services,
    ) -> Arc<Self> {
        Arc::new(DispatcherContext {
            registry: Registry::new(&log),
            events: EventPublisher::new(&log),
            tasks: TaskManager::new(&log),
            log,
            config,
            host,
            services,
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuses new migrations, cancels the running ones and stops the
    /// accept loop.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(self.log, "dispatcher shutting down";
              "active_tasks" => self.tasks.active());
        self.tasks.cancel_all();
        self.shutdown.cancel();
    }

    /// Whether `target` names this host, by one of its configured names or
    /// the name it reports to peers.
    pub fn is_local_target(&self, target: &str) -> bool {
        let host = host_part(target);
        host.eq_ignore_ascii_case(&self.host.host_name)
            || self
                .config
                .dispatcher
                .host_names
                .iter()
                .any(|name| host_part(name).eq_ignore_ascii_case(host))
    }
}

/// Strips the port, and the brackets of an IPv6 literal, from an address.
fn host_part(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host
        }
        _ => addr,
    }
}

/// Opens migration sessions to peer dispatchers over plain TCP.
pub struct TcpConnector {
    log: Logger,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(log: &Logger, timeout: Duration) -> Self {
        TcpConnector {
            log: log.new(slog::o!("component" => "connector")),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        target: &str,
    ) -> Result<WebSocketStream<BoxedConn>, MigrateError> {
        let initiate = |e: &dyn std::fmt::Display| {
            MigrateError::Initiate(format!("{target}: {e}"))
        };
        let stream =
            tokio::time::timeout(self.timeout, TcpStream::connect(target))
                .await
                .map_err(|_| {
                    MigrateError::Timeout(format!("connection to {target}"))
                })?
                .map_err(|e| initiate(&e))?;
        let _ = stream.set_nodelay(true);

        let url = format!("ws://{target}{MIGRATE_PATH}");
        let conn: BoxedConn = Box::new(stream);
        let (ws, _) = tokio_tungstenite::client_async(url, conn)
            .await
            .map_err(|e| initiate(&e))?;
        info!(self.log, "connected to target"; "target" => target);
        Ok(ws)
    }
}

/// Accepts migration sessions until the dispatcher shuts down.
pub async fn serve(
    ctx: Arc<DispatcherContext>,
    listener: TcpListener,
) -> std::io::Result<()> {
    info!(ctx.log, "accepting migration sessions";
          "addr" => %listener.local_addr()?);
    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(ctx.log, "accept failed"; "error" => %e);
                    continue;
                }
            },
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let log = ctx.log.new(slog::o!("peer" => peer.to_string()));
            let conn: BoxedConn = Box::new(stream);
            let ws = match tokio_tungstenite::accept_async(conn).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(log, "websocket upgrade failed"; "error" => %e);
                    return;
                }
            };
            if let Err(e) = helper::accept_session(&ctx, ws).await {
                warn!(log, "migration session refused"; "error" => %e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_part_strips_ports() {
        assert_eq!(host_part("node1.example:7000"), "node1.example");
        assert_eq!(host_part("node1.example"), "node1.example");
        assert_eq!(host_part("10.0.0.1:7000"), "10.0.0.1");
        assert_eq!(host_part("[::1]:7000"), "::1");
    }

    #[test]
    fn local_target_matches_configured_names() {
        let log = Logger::root(slog::Discard, slog::o!());
        let mut config = Config::default();
        config.dispatcher.host_names = vec!["10.0.0.1".to_string()];
        let host = HostInfo::detect(config.dispatcher.server_uuid);
        let name = host.host_name.clone();
        let ctx = DispatcherContext::new(
            log.clone(),
            config,
            host,
            Services::local(&log, Duration::from_secs(1)),
        );
        assert!(ctx.is_local_target("10.0.0.1:7000"));
        assert!(!ctx.is_local_target("10.0.0.2:7000"));
        if !name.is_empty() {
            assert!(ctx.is_local_target(&format!("{name}:7000")));
        }

        assert!(!ctx.is_shutting_down());
        ctx.shutdown();
        assert!(ctx.is_shutting_down());
    }
}
