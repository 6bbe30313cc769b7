//! Resolver Scheduler: periodic + on-demand selector resolution with
//! bounded parallelism, progress publication, and cache replacement
//! (spec.md §4.6). Grounded on `wirewarden-daemon/src/reconcile.rs`'s
//! `reconcile_all` (concurrent fetch via `FuturesUnordered`, then apply),
//! generalized into a pull-and-fill bounded pool and a `watch`-channel
//! progress slot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use svpn_store::Store;
use svpn_types::{ResolverCacheRow, ResolverRunRecord, ResolverSelector, ResolverValues, SelectorKind};

use crate::resolvers::Resolvers;

const DEFAULT_INTERVAL_SECS: u64 = 3600;
const MAX_INTERVAL_SECS: u64 = 86_400;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PARALLELISM: usize = 6;
const MAX_PARALLELISM: usize = 64;

/// Errors the scheduler can surface.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `trigger_now` was called while a run was already in progress.
    #[error("a resolver run is already in progress")]
    AlreadyRunning,

    /// The store returned an error while collecting selectors or
    /// persisting results.
    #[error(transparent)]
    Store(#[from] svpn_store::StoreError),
}

/// Whatever should happen once a resolver run successfully replaces the
/// snapshot: re-invoke the reconciler so new prefixes propagate
/// (spec.md §4.6, implemented by `Reconciler` in `crate::manager`).
pub trait ApplyTrigger: Send + Sync {
    /// Re-run reconciliation.
    fn trigger(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Bounded configuration for the scheduler's periodic loop and runs
/// (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    interval: Duration,
    timeout: Duration,
    parallelism: usize,
}

impl ResolverSettings {
    /// Construct settings, clamping each field into its spec-mandated
    /// range. A `parallelism` of zero coerces to the default, and so does
    /// a `timeout_secs` of zero.
    pub fn new(interval_secs: u64, timeout_secs: u64, parallelism: usize) -> Self {
        let interval = Duration::from_secs(interval_secs.min(MAX_INTERVAL_SECS));
        let timeout = if timeout_secs == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(timeout_secs.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS))
        };
        let parallelism = if parallelism == 0 { DEFAULT_PARALLELISM } else { parallelism.min(MAX_PARALLELISM) };
        ResolverSettings { interval, timeout, parallelism }
    }

    /// The configured sleep interval between periodic runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The configured per-request resolver timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings::new(DEFAULT_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_PARALLELISM)
    }
}

/// Snapshot of an in-progress or just-finished run, published to
/// subscribers via a `watch` channel (spec.md §4.6 "single-slot
/// callback; no queueing").
#[derive(Debug, Clone, Default)]
pub struct ResolverProgress {
    /// Epoch seconds the run started.
    pub started_at: i64,
    /// Total selectors dispatched this run.
    pub selectors_total: usize,
    /// Selectors completed (success or failure) so far.
    pub selectors_done: usize,
    /// Running total of resolved prefixes (v4+v6) across completed jobs.
    pub prefixes_resolved: usize,
    /// The selector most recently completed, if any.
    pub current_selector: Option<ResolverSelector>,
    /// Completed-job count per provider kind.
    pub per_provider: HashMap<SelectorKind, usize>,
}

/// Which state the scheduler's periodic loop is in (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// `start()` has not been called, or `stop()` has completed.
    Stopped,
    /// The loop is running and no resolution is currently in flight.
    Idle,
    /// A resolver run (periodic or on-demand) is currently in flight.
    RunActive,
}

/// Periodic + on-demand selector resolution (spec.md §4.6).
pub struct ResolverScheduler<R, T> {
    store: Store,
    resolvers: Arc<R>,
    apply_trigger: Arc<T>,
    settings: StdMutex<ResolverSettings>,
    state: StdMutex<LoopState>,
    run_lock: AsyncMutex<()>,
    progress_tx: watch::Sender<ResolverProgress>,
    /// Root of the cancellation tree (spec.md §7 "every
    /// externally-originated operation carries a cancellation token").
    /// `stop()` cancels this; each run derives a [`CancellationToken::child_token`]
    /// from it, so cancelling the root reaches both the periodic loop and
    /// any run in flight, whether loop-triggered or `trigger_now`-invoked.
    cancel: StdMutex<CancellationToken>,
    loop_task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<R, T> ResolverScheduler<R, T>
where
    R: Resolvers + 'static,
    T: ApplyTrigger + 'static,
{
    /// Construct a scheduler over `store`, `resolvers`, and the
    /// reconciler `apply_trigger`, starting in state `Stopped`.
    pub fn new(store: Store, resolvers: Arc<R>, apply_trigger: Arc<T>, settings: ResolverSettings) -> Arc<Self> {
        let (progress_tx, _rx) = watch::channel(ResolverProgress::default());
        Arc::new(ResolverScheduler {
            store,
            resolvers,
            apply_trigger,
            settings: StdMutex::new(settings),
            state: StdMutex::new(LoopState::Stopped),
            run_lock: AsyncMutex::new(()),
            progress_tx,
            cancel: StdMutex::new(CancellationToken::new()),
            loop_task: AsyncMutex::new(None),
        })
    }

    /// Subscribe to progress updates. The receiver always has the latest
    /// snapshot available, never a backlog.
    pub fn subscribe(&self) -> watch::Receiver<ResolverProgress> {
        self.progress_tx.subscribe()
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        *self.state.lock().unwrap()
    }

    /// Replace the scheduler's settings; takes effect on the periodic
    /// loop's next sleep.
    pub fn update_settings(&self, settings: ResolverSettings) {
        *self.settings.lock().unwrap() = settings;
    }

    fn settings(&self) -> ResolverSettings {
        *self.settings.lock().unwrap()
    }

    /// Start the periodic loop if not already running.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state != LoopState::Stopped {
            return;
        }
        *state = LoopState::Idle;
        drop(state);

        // Restarting after a stop needs a fresh root: the previous one is
        // permanently cancelled.
        let root = {
            let mut cancel = self.cancel.lock().unwrap();
            *cancel = CancellationToken::new();
            cancel.clone()
        };

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let interval = scheduler.settings().interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = root.cancelled() => break,
                }
                if let Err(e) = scheduler.trigger_now().await {
                    warn!(error = %e, "periodic resolver run failed to start");
                }
            }
        });

        // Safe: `start` only runs synchronously up to the first await
        // inside the spawned task, so no run can race this assignment.
        if let Ok(mut guard) = self.loop_task.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Stop the periodic loop and cancel any in-flight run, whether
    /// dispatched by the loop itself or a directly-invoked `trigger_now`
    /// (spec.md §7 "`stop()` cancels both the loop and any active run").
    pub async fn stop(&self) {
        self.cancel.lock().unwrap().cancel();
        if let Some(handle) = self.loop_task.lock().await.take() {
            handle.abort();
        }
        *self.state.lock().unwrap() = LoopState::Stopped;
    }

    /// Collect every selector from every rule in every group, deduplicate
    /// by `(type, key)`, and sort stably (type asc, key asc).
    async fn collect_selectors(&self) -> Result<Vec<ResolverSelector>, SchedulerError> {
        let groups = self.store.list_groups().await?;
        let mut seen = HashSet::new();
        let mut selectors = Vec::new();
        for group in &groups {
            for rule in &group.rules {
                for selector in rule.resolver_selectors() {
                    if seen.insert(selector.clone()) {
                        selectors.push(selector);
                    }
                }
            }
        }
        selectors.sort();
        Ok(selectors)
    }

    /// Run one resolution pass now, regardless of loop state. Returns an
    /// error if a run is already in progress.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_now(&self) -> Result<ResolverRunRecord, SchedulerError> {
        let _guard = self.run_lock.try_lock().map_err(|_| SchedulerError::AlreadyRunning)?;
        *self.state.lock().unwrap() = LoopState::RunActive;

        let result = self.run_once().await;

        {
            let mut state = self.state.lock().unwrap();
            if *state != LoopState::Stopped {
                *state = LoopState::Idle;
            }
        }

        result
    }

    async fn run_once(&self) -> Result<ResolverRunRecord, SchedulerError> {
        let started_at = now_epoch();
        let selectors = self.collect_selectors().await?;
        let total = selectors.len();
        let settings = self.settings();
        let token = self.cancel.lock().unwrap().child_token();

        info!(selectors_total = total, "starting resolver run");
        self.progress_tx.send_replace(ResolverProgress { started_at, selectors_total: total, ..Default::default() });

        let mut jobs = selectors.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..settings.parallelism {
            if let Some(selector) = jobs.next() {
                in_flight.push(resolve_job(Arc::clone(&self.resolvers), selector, token.clone()));
            } else {
                break;
            }
        }

        let mut rows: Vec<ResolverCacheRow> = Vec::new();
        let mut done = 0usize;
        let mut prefixes_resolved = 0usize;
        let mut per_provider: HashMap<SelectorKind, usize> = HashMap::new();
        let mut first_error: Option<String> = None;

        while let Some((selector, outcome)) = in_flight.next().await {
            done += 1;
            match outcome {
                Ok(values) => {
                    prefixes_resolved += values.len();
                    *per_provider.entry(selector.kind).or_insert(0) += 1;
                    rows.push(ResolverCacheRow { selector: selector.clone(), values, updated_at: now_epoch() });
                }
                Err(e) => {
                    warn!(selector = ?selector, error = %e, "resolver job failed");
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                        // Fail-fast: cancel every sibling still in flight
                        // rather than letting them run to completion
                        // (spec.md §7 "the first job error ... cancels
                        // siblings").
                        token.cancel();
                    }
                }
            }

            self.progress_tx.send_replace(ResolverProgress {
                started_at,
                selectors_total: total,
                selectors_done: done,
                prefixes_resolved,
                current_selector: Some(selector),
                per_provider: per_provider.clone(),
            });

            if first_error.is_none() {
                if let Some(next_selector) = jobs.next() {
                    in_flight.push(resolve_job(Arc::clone(&self.resolvers), next_selector, token.clone()));
                }
            }
        }

        let finished_at = now_epoch();
        let record = ResolverRunRecord {
            id: 0,
            started_at,
            finished_at: Some(finished_at),
            duration_ms: Some((finished_at - started_at).max(0) * 1000),
            selectors_total: total as i32,
            selectors_done: done as i32,
            prefixes_resolved: prefixes_resolved as i32,
            error: first_error.clone(),
        };

        if let Some(error) = &first_error {
            error!(error = %error, "resolver run failed, snapshot not replaced");
            self.store.save_resolver_run(&record).await?;
            return Ok(record);
        }

        self.store.replace_resolver_snapshot(&rows).await?;
        self.store.save_resolver_run(&record).await?;
        info!(prefixes_resolved, "resolver run complete, snapshot replaced");

        self.apply_trigger.trigger().await;

        Ok(record)
    }
}

async fn resolve_job<R: Resolvers>(
    resolvers: Arc<R>,
    selector: ResolverSelector,
    token: CancellationToken,
) -> (ResolverSelector, Result<ResolverValues, crate::resolvers::ResolverError>) {
    let result = match selector.kind {
        SelectorKind::Domain => resolvers.resolve_domain(&selector.key, &token).await,
        SelectorKind::Asn => resolvers.resolve_asn(&selector.key, &token).await,
        SelectorKind::Wildcard => {
            let base = selector.key.trim_start_matches("*.");
            resolve_wildcard_job(&*resolvers, base, &token).await
        }
    };
    (selector, result)
}

async fn resolve_wildcard_job<R: Resolvers>(
    resolvers: &R,
    base: &str,
    token: &CancellationToken,
) -> Result<ResolverValues, crate::resolvers::ResolverError> {
    let mut discovered = resolvers.resolve_wildcard(base, token).await?;
    if discovered.is_empty() {
        discovered.push(base.to_string());
    }
    debug!(base, count = discovered.len(), "wildcard discovery complete, resolving subdomains");

    let mut values = ResolverValues::default();
    for domain in discovered {
        let resolved = resolvers.resolve_domain(&domain, token).await?;
        values.merge(&resolved);
    }
    Ok(values)
}

fn now_epoch() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolvers::FakeResolvers;

    struct CountingTrigger {
        count: std::sync::atomic::AtomicUsize,
    }

    impl CountingTrigger {
        fn new() -> Self {
            CountingTrigger { count: std::sync::atomic::AtomicUsize::new(0) }
        }

        fn count(&self) -> usize {
            self.count.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl ApplyTrigger for CountingTrigger {
        async fn trigger(&self) {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    async fn test_store() -> Store {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        svpn_store::migrate(&pool).await.unwrap();
        Store::new(pool)
    }

    #[tokio::test]
    async fn trigger_now_dedups_and_replaces_snapshot() {
        let store = test_store().await;
        let group = store.create_group("G", "wg-sgp").await.unwrap();
        let mut rule = svpn_types::RoutingRule::default();
        rule.exact_domains = vec!["example.com".to_string()];
        rule.destination_asns = vec!["AS13335".to_string()];
        rule.wildcard_domains = vec!["*.apple.com".to_string()];
        store.replace_rules(group.id, &[rule]).await.unwrap();

        let resolvers = Arc::new(FakeResolvers::new());
        resolvers.script_domain("example.com", ResolverValues { v4: vec!["1.1.1.1/32".into()], v6: vec![] });
        resolvers.script_asn("AS13335", ResolverValues { v4: vec!["104.16.0.0/13".into()], v6: vec![] });
        resolvers.script_wildcard("apple.com", vec!["www.apple.com".to_string()]);
        resolvers.script_domain("www.apple.com", ResolverValues { v4: vec!["17.0.0.1/32".into()], v6: vec![] });

        let trigger = Arc::new(CountingTrigger::new());
        let scheduler = ResolverScheduler::new(store.clone(), resolvers, trigger.clone(), ResolverSettings::default());

        let record = scheduler.trigger_now().await.unwrap();
        assert_eq!(record.selectors_total, 3);
        assert!(record.error.is_none());
        assert_eq!(trigger.count(), 1);

        let snapshot = store.load_resolver_snapshot(7).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        let asn_row = snapshot.iter().find(|r| r.selector.kind == SelectorKind::Asn).unwrap();
        assert_eq!(asn_row.values.v4, vec!["104.16.0.0/13".to_string()]);
    }

    #[tokio::test]
    async fn trigger_now_rejects_concurrent_runs() {
        let store = test_store().await;
        let resolvers = Arc::new(FakeResolvers::new());
        let trigger = Arc::new(CountingTrigger::new());
        let scheduler = ResolverScheduler::new(store, resolvers, trigger, ResolverSettings::default());

        let _guard = scheduler.run_lock.try_lock().unwrap();
        let err = scheduler.trigger_now().await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning));
    }

    #[tokio::test]
    async fn failed_job_prevents_snapshot_replacement() {
        let store = test_store().await;
        let group = store.create_group("G", "wg-sgp").await.unwrap();
        let mut rule = svpn_types::RoutingRule::default();
        rule.exact_domains = vec!["bad.example.com".to_string(), "good.example.com".to_string()];
        store.replace_rules(group.id, &[rule]).await.unwrap();

        let resolvers = Arc::new(FakeResolvers::new());
        resolvers.fail("bad.example.com");
        resolvers.script_domain("good.example.com", ResolverValues { v4: vec!["9.9.9.9/32".into()], v6: vec![] });

        let trigger = Arc::new(CountingTrigger::new());
        let scheduler = ResolverScheduler::new(store.clone(), resolvers, trigger.clone(), ResolverSettings::default());

        let record = scheduler.trigger_now().await.unwrap();
        assert!(record.error.is_some());
        assert_eq!(trigger.count(), 0);

        let snapshot = store.load_resolver_snapshot(7).await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn first_error_cancels_siblings_still_in_flight() {
        let store = test_store().await;
        let group = store.create_group("G", "wg-sgp").await.unwrap();
        let mut rule = svpn_types::RoutingRule::default();
        rule.exact_domains = vec!["bad.example.com".to_string(), "slow.example.com".to_string()];
        store.replace_rules(group.id, &[rule]).await.unwrap();

        let resolvers = Arc::new(FakeResolvers::new());
        resolvers.fail("bad.example.com");
        resolvers.script_delay("slow.example.com", Duration::from_millis(200));
        resolvers.script_domain("slow.example.com", ResolverValues { v4: vec!["9.9.9.9/32".into()], v6: vec![] });

        let trigger = Arc::new(CountingTrigger::new());
        let scheduler = ResolverScheduler::new(store, resolvers, trigger, ResolverSettings::default());

        let before = std::time::Instant::now();
        let record = scheduler.trigger_now().await.unwrap();
        assert!(record.error.is_some());
        // The slow job should have been cancelled almost immediately after
        // the fast failure, not left to run its full 200ms delay.
        assert!(before.elapsed() < Duration::from_millis(150), "sibling job was not actively cancelled");
    }

    #[tokio::test]
    async fn stop_cancels_a_directly_invoked_trigger_now_run() {
        let store = test_store().await;
        let group = store.create_group("G", "wg-sgp").await.unwrap();
        let mut rule = svpn_types::RoutingRule::default();
        rule.exact_domains = vec!["slow.example.com".to_string()];
        store.replace_rules(group.id, &[rule]).await.unwrap();

        let resolvers = Arc::new(FakeResolvers::new());
        resolvers.script_delay("slow.example.com", Duration::from_secs(5));

        let trigger = Arc::new(CountingTrigger::new());
        let scheduler = ResolverScheduler::new(store, resolvers, trigger, ResolverSettings::default());

        let run_scheduler = Arc::clone(&scheduler);
        let run = tokio::spawn(async move { run_scheduler.trigger_now().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;

        let record = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("trigger_now did not observe stop()'s cancellation")
            .unwrap()
            .unwrap();
        assert!(record.error.is_some());
    }

    #[test]
    fn settings_clamp_out_of_range_values() {
        let settings = ResolverSettings::new(999_999, 0, 0);
        assert_eq!(settings.interval(), Duration::from_secs(MAX_INTERVAL_SECS));
        assert_eq!(settings.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn settings_clamp_timeout_above_max() {
        let settings = ResolverSettings::new(DEFAULT_INTERVAL_SECS, 999, DEFAULT_PARALLELISM);
        assert_eq!(settings.timeout(), Duration::from_secs(MAX_TIMEOUT_SECS));
    }
}
