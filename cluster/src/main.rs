use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::signal;

use cluster::consensus::OPEN_TIMEOUT;
use cluster::{http, metrics, Configuration, ConsensusServer, KvStateMachine, TcpNetworkListener};

#[derive(Parser, Debug)]
#[command(name = "cluster", about = "Replicated key-value node")]
struct Opts {
    /// TOML configuration file; flags given on the command line override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_path: Option<PathBuf>,
    #[arg(long)]
    logs_path: Option<PathBuf>,
    /// Keep all raft state in memory
    #[arg(long)]
    dev_mode: bool,
    /// Form a new cluster if no raft state exists
    #[arg(long)]
    bootstrap: bool,
    #[arg(long, default_value = "localhost:5000")]
    raft_addr: String,
    /// Address peers use to reach this node, when it differs from raft-addr
    #[arg(long)]
    raft_adv_addr: Option<String>,
    #[arg(long, default_value = "localhost:5001")]
    http_addr: String,
    /// HTTP address of an existing member to join through
    #[arg(long)]
    join: Option<String>,
    /// Applied entries between snapshots
    #[arg(long)]
    raft_snap: Option<u64>,
}

impl Opts {
    fn configuration(&self) -> anyhow::Result<Configuration> {
        let mut config = match &self.config {
            Some(path) => Configuration::from_toml(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Configuration::default(),
        };
        if let Some(data_path) = &self.data_path {
            config.data_path = data_path.clone();
        }
        if let Some(logs_path) = &self.logs_path {
            config.logs_path = logs_path.clone();
        }
        if let Some(threshold) = self.raft_snap {
            config.snapshot_threshold = threshold;
        }
        config.dev_mode |= self.dev_mode;
        config.bootstrap |= self.bootstrap;
        config.validate()?;
        Ok(config)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let opts = Opts::parse();
    let config = opts.configuration()?;
    config.init().context("preparing data and log directories")?;

    let listener = TcpNetworkListener::bind(&opts.raft_addr, opts.raft_adv_addr.clone())
        .await
        .with_context(|| format!("binding raft address {}", opts.raft_addr))?;
    let state_machine = KvStateMachine::new();
    let server = Arc::new(
        ConsensusServer::setup(&config, Arc::new(listener), state_machine)
            .await
            .context("starting consensus server")?,
    );

    if let Some(join) = &opts.join {
        http::join(join, server.id(), server.address())
            .await
            .with_context(|| format!("joining cluster through {}", join))?;
    }

    server
        .wait_for_applied(OPEN_TIMEOUT)
        .await
        .context("waiting for the raft log to be applied")?;

    metrics::init_registry();
    let http_listener = std::net::TcpListener::bind(&opts.http_addr)
        .with_context(|| format!("binding http address {}", opts.http_addr))?;
    let (http_stop, http_stopped) = tokio::sync::oneshot::channel::<()>();
    let api = tokio::spawn(http::serve(http_listener, server.clone(), async move {
        let _ = http_stopped.await;
    }));
    info!("node {} ready", server.id());

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown requested"),
        _ = server.stopped() => error!("consensus node stopped unexpectedly"),
    }

    let _ = http_stop.send(());
    let api_result = match api.await {
        Ok(result) => result.context("http api"),
        Err(e) => Err(anyhow::anyhow!("http api task failed: {}", e)),
    };
    // A server whose node already failed reports that failure here.
    server.shutdown().await.context("consensus node")?;
    api_result
}
