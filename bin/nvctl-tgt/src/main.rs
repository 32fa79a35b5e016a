//! nvctl target daemon
//!
//! Starts the reactor pool and the NVMe bdev control plane, then answers
//! line-delimited JSON requests on a Unix socket.

mod rpc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nvctl_bdev::sim::{SimTarget, SimTransport};
use nvctl_bdev::{ControlPlane, Transport};
use nvctl_common::config::ListenAddr;
use nvctl_common::{DaemonConfig, TransportKind};
use nvctl_runtime::ReactorPool;
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nvctl-tgt")]
#[command(about = "nvctl NVMe bdev control plane daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nvctl/nvctl.toml")]
    config: PathBuf,

    /// Unix socket to accept requests on
    #[arg(short = 's', long, default_value = "/var/tmp/nvctl.sock", env = "NVCTL_RPC_SOCKET")]
    rpc_socket: PathBuf,

    /// Number of worker reactors (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Use the in-memory simulated transport
    #[arg(long)]
    simulate: bool,

    /// Transport of the simulated controllers
    #[arg(long, default_value = "tcp")]
    sim_trtype: String,

    /// Simulated target as `traddr:trsvcid:subnqn`; repeatable
    #[arg(long = "sim-target")]
    sim_targets: Vec<String>,
}

fn load_config(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn parse_sim_target(arg: &str) -> Result<SimTarget> {
    let mut parts = arg.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(traddr), Some(trsvcid), Some(subnqn)) if !traddr.is_empty() => {
            Ok(SimTarget::new(traddr, trsvcid, subnqn))
        }
        _ => bail!("Invalid simulated target '{arg}', expected traddr:trsvcid:subnqn"),
    }
}

fn build_driver(args: &Args) -> Result<Arc<dyn Transport>> {
    if !args.simulate {
        bail!("No NVMe transport driver is linked into this build; start with --simulate");
    }
    let kind: TransportKind = args.sim_trtype.parse()?;
    let sim = SimTransport::new(kind);
    for arg in &args.sim_targets {
        let target = parse_sim_target(arg)?;
        info!(
            "Simulated target {}:{} ({})",
            target.traddr, target.trsvcid, target.subnqn
        );
        sim.add_target(target);
    }
    Ok(Arc::new(sim))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(workers) = args.workers {
        config.reactor.workers = workers;
    }
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    info!("Starting nvctl target");
    info!("Config file: {}", args.config.display());
    config.validate().context("Invalid configuration")?;
    for port in &config.target.ports {
        for listen in &port.listen {
            let addr = ListenAddr::parse(listen)?;
            info!("Port {} ({}) listens on {}:{}", port.id, port.transport, addr.host, addr.port);
        }
    }
    info!(
        "{} subsystems, {} hosts configured",
        config.target.subsystems.len(),
        config.target.hosts.len()
    );

    let driver = build_driver(&args)?;
    let pool = Arc::new(ReactorPool::start(config.reactor.workers).context("Failed to start reactors")?);
    let plane = ControlPlane::start(Arc::clone(&pool), driver, config.bdev_nvme.clone())
        .await
        .context("Failed to start the control plane")?;
    if config.hotplug.enabled {
        plane
            .set_hotplug(true, Some(config.hotplug.period_us))
            .await
            .context("Failed to enable hotplug")?;
    }

    if args.rpc_socket.exists() {
        warn!("Removing stale socket {}", args.rpc_socket.display());
        std::fs::remove_file(&args.rpc_socket)?;
    }
    let listener = UnixListener::bind(&args.rpc_socket)
        .with_context(|| format!("Failed to bind {}", args.rpc_socket.display()))?;
    info!("Listening for requests on {}", args.rpc_socket.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let plane = plane.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = rpc::serve(&plane, reader, writer).await {
                        warn!("Request connection closed: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = plane.shutdown().await {
        error!("Control plane shutdown failed: {}", e);
    }
    pool.shutdown();
    let _ = std::fs::remove_file(&args.rpc_socket);
    info!("nvctl target stopped");
    Ok(())
}
