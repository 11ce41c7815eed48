//! dbctl -- high-availability sidecar for replicated database engines.
//!
//! One-shot subcommands run a single operation against the local engine
//! and print its envelope as JSON.  `serve` runs the HA loop until
//! SIGTERM/SIGINT, then releases any held lease and exits.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dbctl::config::{Config, LoggingConfig};
use dbctl::dcs::clock::SystemClock;
use dbctl::dcs::coordinator::LeaseCoordinator;
use dbctl::dcs::ha::HaLoop;
use dbctl::dcs::{open_store, HaConfig, Member, StoreBackend};
use dbctl::engines::context::OpContext;
use dbctl::identity::{Env, Identity};
use dbctl::operations::{self, OpsResponse};
use dbctl::{DbManager, ManagerRegistry};

/// Command-line arguments for dbctl.
#[derive(Parser, Debug)]
#[command(
    name = "dbctl",
    version,
    about = "High-availability sidecar for replicated database engines"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "dbctl.yaml")]
    config: String,

    /// Override the engine type (otherwise `KB_ENGINE_TYPE` or the config).
    #[arg(short, long)]
    engine: Option<String>,

    /// Deadline for one-shot operations, in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HA loop until terminated.
    Serve,
    /// Print the replica role.
    Getrole,
    /// Make the instance read-only.
    Lock {
        /// Reason recorded in the audit log.
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Lift write protection.
    Unlock,
    /// Run a write statement.
    Exec { sql: String },
    /// Run a read statement and print its rows.
    Query { sql: String },
    /// Report whether the engine answers.
    CheckRunning,
    /// Ask the current leader to step down, optionally naming its successor.
    Switchover {
        /// Member expected to step down; must hold the lease.
        #[arg(long)]
        leader: Option<String>,
        /// Member expected to take over.
        #[arg(long)]
        candidate: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = Env::from_process();
    let mut config = dbctl::config::load_config(&cli.config, &env)?;
    if let Some(engine) = cli.engine.clone() {
        config.engine.engine_type = engine;
    }

    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let identity = Identity::from_process(&env)?;
    let registry = ManagerRegistry::with_default_engines(config.clone(), identity.clone(), env);
    let manager = registry.init_manager(&config.engine.engine_type)?;

    let ctx = OpContext::with_timeout(Duration::from_secs(cli.timeout));
    let resp = match cli.command {
        Command::Serve => {
            let result = serve(&config, &identity, manager.clone()).await;
            manager.shutdown().await;
            return result;
        }
        Command::Getrole => operations::get_role(manager.as_ref(), &ctx).await,
        Command::Lock { reason } => operations::lock_instance(manager.as_ref(), &ctx, &reason).await,
        Command::Unlock => operations::unlock_instance(manager.as_ref(), &ctx).await,
        Command::Exec { sql } => operations::exec(manager.as_ref(), &ctx, &sql).await,
        Command::Query { sql } => operations::query(manager.as_ref(), &ctx, &sql).await,
        Command::CheckRunning => operations::check_running(manager.as_ref(), &ctx).await,
        Command::Switchover { leader, candidate } => {
            let coordinator = build_coordinator(&config, &identity)?;
            operations::switchover(&coordinator, leader.as_deref(), candidate.as_deref()).await
        }
    };
    manager.shutdown().await;
    finish(&resp)
}

fn finish(resp: &OpsResponse) -> anyhow::Result<()> {
    print_response(resp)?;
    if !resp.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_response(resp: &OpsResponse) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(resp)?);
    Ok(())
}

/// Coordinator over the cluster-wide lease store.  Refuses stores that
/// other members cannot see.
fn build_coordinator(config: &Config, identity: &Identity) -> anyhow::Result<Arc<LeaseCoordinator>> {
    let backend: StoreBackend = config.dcs.backend.parse()?;
    if !backend.is_shared() {
        anyhow::bail!(
            "lease store backend {:?} is private to this process; configure dcs.backend: sqlite",
            config.dcs.backend
        );
    }
    let cluster = if identity.cluster_name.is_empty() {
        identity.cluster_comp_name.clone()
    } else {
        identity.cluster_name.clone()
    };
    let address = if identity.pod_fqdn.is_empty() {
        identity.pod_ip.clone()
    } else {
        identity.pod_fqdn.clone()
    };
    let member = Member::new(identity.pod_name.clone(), address)?;
    let store = open_store(&config.dcs, &cluster)?;
    Ok(Arc::new(LeaseCoordinator::new(
        cluster,
        member,
        store,
        Arc::new(SystemClock),
        HaConfig::from(&config.dcs),
    )))
}

async fn serve(
    config: &Config,
    identity: &Identity,
    manager: Arc<dyn DbManager>,
) -> anyhow::Result<()> {
    if config.observability.metrics {
        let addr = dbctl::metrics::init_metrics(&config.observability.metrics_addr)?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let coordinator = build_coordinator(config, identity)?;

    let startup_ctx = OpContext::with_timeout(Duration::from_secs(config.dcs.health_check_period));
    if manager.is_startup_ready(&startup_ctx).await {
        info!("{} is ready", manager.engine());
    } else {
        warn!("{} is not ready yet; the HA loop will keep probing", manager.engine());
    }

    let shutdown = CancellationToken::new();
    let ha = HaLoop::new(
        manager,
        coordinator,
        Duration::from_secs(config.dcs.health_check_period),
        shutdown.clone(),
    );
    ha.bootstrap().await?;
    let handle = tokio::spawn(async move { ha.run().await });
    info!("dbctl serving");

    shutdown_signal().await;
    shutdown.cancel();
    handle.await?;
    info!("dbctl shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
