// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use slog::{info, Logger};
use vm_dispatcher::{config, server, services::Services, vm::host::HostInfo};

/// Threads to spawn for the tokio runtime running migrations
const RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// A dispatcher that moves and clones VMs between hosts
enum Args {
    /// Runs the dispatcher, accepting migration sessions from peers.
    Run {
        #[clap(name = "LISTEN_IP:PORT", action)]
        listen_addr: SocketAddr,

        /// Path to a TOML config file; built-in defaults otherwise
        #[clap(long, action)]
        config: Option<PathBuf>,

        /// Logging level for the dispatcher
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

fn build_logger(level: slog::Level) -> Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("vm-dispatcher", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    Logger::root(filtered_main.fuse(), slog::o!())
}

fn run_server(
    listen_addr: SocketAddr,
    config: config::Config,
    log: Logger,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(RT_THREADS)
        .thread_name("tokio-rt-dispatcher")
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let host = HostInfo::detect(config.dispatcher.server_uuid);
    info!(log, "host detected";
          "host_name" => &host.host_name,
          "server_uuid" => %host.server_uuid,
          "cpus" => host.cpu.count);
    let services =
        Services::local(&log, config.migration.connect_timeout());
    let ctx =
        server::DispatcherContext::new(log.clone(), config, host, services);

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;

        let shutdown_ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_ctx.shutdown();
            }
        });

        info!(log, "Starting server...");
        server::serve(ctx, listener)
            .await
            .context("migration listener failed")
    })
}

fn main() -> anyhow::Result<()> {
    // Command line arguments.
    let args = Args::parse();

    match args {
        Args::Run { listen_addr, config, log_level } => {
            let log = build_logger(log_level);
            let config = config::load(config.as_deref()).with_context(|| {
                format!("loading config {:?}", config.as_deref())
            })?;
            run_server(listen_addr, config, log)
        }
    }
}
