//! `svpn-daemon`: the split-VPN routing control plane binary. Grounded
//! on `wirewarden-daemon/src/main.rs`'s `clap` + `#[tokio::main]` +
//! `shutdown_signal` shape, generalized from "poll servers, diff
//! WireGuard peers" to "reconcile domain groups, run the resolver
//! scheduler, and prune caches in the background."

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use svpn_reconciler::{
    run_cleanup_loop, CleanupSettings, FileDnsManager, HttpResolvers, IpsetOperator, IptablesRuleApplier, Reconciler,
    ResolverEndpoints, ResolverScheduler, ResolverSettings, SystemCommandExecutor,
};
use svpn_store::Store;
use svpn_types::{EgressVpn, StaticVpnLister};

type DaemonReconciler = Reconciler<
    IpsetOperator<SystemCommandExecutor>,
    IptablesRuleApplier<SystemCommandExecutor>,
    FileDnsManager<SystemCommandExecutor>,
    StaticVpnLister,
>;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "policy-based split-VPN routing control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconciler, resolver scheduler, and background cleanup
    /// loop (systemd entrypoint).
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "/etc/svpn/svpn.toml")]
        config: PathBuf,
    },

    /// Reconcile once and exit (cron / manual use).
    Apply {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "/etc/svpn/svpn.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run_daemon(config).await,
        Command::Apply { config } => run_apply_once(config).await,
    }
}

async fn build_reconciler(cfg: &config::SvpnConfig) -> Result<Arc<DaemonReconciler>, Box<dyn std::error::Error>> {
    let store = Store::open(&cfg.database_path).await?;

    let vpns: Vec<EgressVpn> = cfg
        .egress_vpns
        .iter()
        .map(|v| EgressVpn {
            name: v.name.clone(),
            interface_name: v.interface_name.clone(),
            fw_mark: v.fw_mark,
            route_table: v.route_table,
        })
        .collect();

    let reconciler = Reconciler::new(
        store,
        IpsetOperator::new(SystemCommandExecutor),
        IptablesRuleApplier::new(SystemCommandExecutor),
        FileDnsManager::new(SystemCommandExecutor, config::dns_hint_path(cfg), config::dns_reload_command(cfg)),
        StaticVpnLister::new(vpns),
        cfg.cache_retention_days,
    );

    Ok(Arc::new(reconciler))
}

async fn run_apply_once(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!(config = %config_path.display(), "running one-shot reconcile");
    let cfg = config::load(&config_path).await?;
    let reconciler = build_reconciler(&cfg).await?;
    reconciler.apply().await?;
    info!("one-shot reconcile complete");
    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!(config = %config_path.display(), version = env!("GIT_VERSION"), "starting svpn daemon");

    let cfg = config::load(&config_path).await?;

    if cfg.egress_vpns.is_empty() {
        warn!("no egress VPNs configured — groups referencing any egress VPN will fail validation");
    }

    let reconciler = build_reconciler(&cfg).await?;

    let endpoints = ResolverEndpoints {
        doh_url: cfg.resolver_doh_endpoint.clone(),
        asn_url: cfg.resolver_asn_endpoint.clone(),
        ct_url: cfg.resolver_ct_endpoint.clone(),
        timeout: std::time::Duration::from_secs(config::effective_resolver_timeout_seconds(&cfg)),
    };
    let resolvers = Arc::new(HttpResolvers::new(endpoints)?);
    let settings = ResolverSettings::new(
        cfg.resolver_interval_seconds,
        config::effective_resolver_timeout_seconds(&cfg),
        cfg.resolver_parallelism,
    );

    let store_for_cleanup = Store::open(&cfg.database_path).await?;
    let store_for_scheduler = Store::open(&cfg.database_path).await?;

    let scheduler = ResolverScheduler::new(store_for_scheduler, resolvers, reconciler.clone(), settings);
    scheduler.start();

    let cleanup_cancel = Arc::new(tokio::sync::Notify::new());
    let cleanup_settings = CleanupSettings {
        interval: std::time::Duration::from_secs(3600),
        stats_retention_days: cfg.stats_retention_days,
        cache_retention_days: cfg.cache_retention_days,
    };
    let cleanup_handle = run_cleanup_loop(store_for_cleanup, cleanup_settings, cleanup_cancel.clone());

    info!("running startup reconcile");
    if let Err(err) = reconciler.apply().await {
        warn!(error = %err, "startup reconcile failed, continuing (next scheduled run will retry)");
    }

    info!("entering wait loop");
    shutdown_signal().await;
    info!("received shutdown signal, stopping scheduler and cleanup loop");

    scheduler.stop().await;
    cleanup_cancel.notify_one();
    cleanup_handle.abort();

    debug!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
