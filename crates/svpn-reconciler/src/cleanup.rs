//! Background Cleanup: prune `stats_history` rows past retention and
//! purge expired resolver/pre-warm cache rows (spec.md §4.10). Grounded
//! on `wirewarden-daemon::main::run_daemon`'s sleep-then-work poll loop,
//! adapted to a `Notify`-cancelled background task — the same
//! cancellation shape as `ResolverScheduler`'s loop — since this task is
//! spawned alongside other daemon components rather than owning the
//! process's top-level loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use svpn_store::Store;

const DEFAULT_INTERVAL_SECS: u64 = 3600;
const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Cleanup task configuration (spec.md §4.10, §2.3 retention defaults).
#[derive(Debug, Clone, Copy)]
pub struct CleanupSettings {
    /// How often the task runs.
    pub interval: Duration,
    /// Days of `stats_history` rows to retain.
    pub stats_retention_days: i64,
    /// Days of resolver/pre-warm cache rows to retain.
    pub cache_retention_days: i64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        CleanupSettings {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            stats_retention_days: DEFAULT_RETENTION_DAYS,
            cache_retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Run one cleanup pass: prune `stats_history`, purge expired resolver
/// and pre-warm cache rows. Idempotent; a failed sub-step is logged and
/// does not prevent the others from running.
pub async fn run_once(store: &Store, settings: &CleanupSettings) {
    match store.prune_stats_history(settings.stats_retention_days).await {
        Ok(pruned) => debug!(pruned, "pruned stats_history"),
        Err(err) => error!(error = %err, "failed to prune stats_history"),
    }
    match store.purge_expired_resolver_cache(settings.cache_retention_days).await {
        Ok(purged) => debug!(purged, "purged expired resolver cache rows"),
        Err(err) => error!(error = %err, "failed to purge expired resolver cache"),
    }
    match store.purge_expired_prewarm_cache(settings.cache_retention_days).await {
        Ok(purged) => debug!(purged, "purged expired pre-warm cache rows"),
        Err(err) => error!(error = %err, "failed to purge expired pre-warm cache"),
    }
}

/// Spawn the periodic cleanup loop, cancellable via `cancel`.
pub fn run_cleanup_loop(store: Store, settings: CleanupSettings, cancel: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?settings.interval, "starting background cleanup loop");
        loop {
            run_once(&store, &settings).await;
            tokio::select! {
                _ = tokio::time::sleep(settings.interval) => {}
                _ = cancel.notified() => {
                    info!("cleanup loop cancelled");
                    break;
                }
            }
        }
    })
}
