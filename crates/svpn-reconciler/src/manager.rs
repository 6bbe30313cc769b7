//! Reconciler: the Manager component that turns the store's declarative
//! state into kernel-level address sets, firewall chains, policy routes,
//! and the DNS hint file (spec.md §4.9). Grounded on
//! `wirewarden-daemon/src/reconcile.rs`'s `reconcile_all` — a single
//! `#[tracing::instrument]`'d entry point walking numbered phases, each
//! logged at its own level, composing errors via `#[from]` — generalized
//! from "diff WireGuard peers against desired config" to "diff address
//! sets, chains, and policy routes against declarative groups".

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use svpn_store::{Store, StoreError};
use svpn_types::model::RoutingRule;
use svpn_types::{DomainGroup, Family, PrewarmRow, ResolverCacheRow, ResolverSelector, ValidationError, VpnLister};

use crate::dns_hints::{DnsHint, DnsManager, DnsHintError};
use crate::ipset::{rule_set_name, slug_base, staged_swap, AddressSetOperator, IpsetError, SetRole, SET_NAME_PREFIX};
use crate::prefix::{self, PrefixError};
use crate::rules::{RouteBinding, RuleApplier, RuleError};
use crate::scheduler::ApplyTrigger;

/// Errors the reconciler can surface.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// An underlying store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An underlying address-set operation failed.
    #[error(transparent)]
    Ipset(#[from] IpsetError),

    /// An underlying rule-applier operation failed.
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// Writing or reloading the DNS hint file failed.
    #[error(transparent)]
    Dns(#[from] DnsHintError),

    /// A prefix could not be collapsed (malformed entry slipped past
    /// canonicalization).
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    /// A selector or name failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A group references an egress VPN that does not exist or is not
    /// usable (missing mark/table/interface).
    #[error("group {group:?} references unknown or unusable egress VPN {egress_vpn:?}")]
    InvalidEgressVpn {
        /// The offending group's name.
        group: String,
        /// The egress VPN name it referenced.
        egress_vpn: String,
    },
}

/// Per-rule computed address-set names and contents, built once per
/// `apply` pass and shared between the staged address-set swap and the
/// `RouteBinding` handed to the rule applier.
struct PlannedRule {
    binding: RouteBinding,
    sets: Vec<(String, Family, Vec<String>)>,
    dns_hints: Vec<DnsHint>,
}

/// The orchestrator tying the Store together with the kernel-facing
/// capability traits: [`AddressSetOperator`], [`RuleApplier`],
/// [`DnsManager`], and [`VpnLister`] (spec.md §4.9). Mutating operations
/// serialize through an internal mutex so concurrent callers (the API
/// surface and the resolver scheduler) never interleave a partial apply.
pub struct Reconciler<A, R, D, V> {
    store: Store,
    sets: A,
    rule_applier: R,
    dns: D,
    vpn_lister: V,
    cache_retention_days: i64,
    mutex: AsyncMutex<()>,
}

impl<A, R, D, V> Reconciler<A, R, D, V>
where
    A: AddressSetOperator,
    R: RuleApplier,
    D: DnsManager,
    V: VpnLister,
{
    /// Wire a reconciler over its store and capability implementations.
    pub fn new(store: Store, sets: A, rule_applier: R, dns: D, vpn_lister: V, cache_retention_days: i64) -> Self {
        Reconciler {
            store,
            sets,
            rule_applier,
            dns,
            vpn_lister,
            cache_retention_days,
            mutex: AsyncMutex::new(()),
        }
    }

    /// List all groups, fully hydrated.
    pub async fn list_groups(&self) -> Result<Vec<DomainGroup>, ReconcileError> {
        Ok(self.store.list_groups().await?)
    }

    /// Fetch one group by id.
    pub async fn get_group(&self, id: i64) -> Result<Option<DomainGroup>, ReconcileError> {
        Ok(self.store.get_group(id).await?)
    }

    /// Create a group, validating its egress VPN before persisting
    /// anything, then re-apply (spec.md §8 scenario 3: "missing egress
    /// VPN rejected ... no persistence").
    pub async fn create_group(&self, name: &str, egress_vpn: &str) -> Result<DomainGroup, ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.validate_egress_vpn(name, egress_vpn)?;
        let group = self.store.create_group(name, egress_vpn).await?;
        self.apply_locked().await?;
        Ok(group)
    }

    /// Update a group's name/egress VPN, validate, then re-apply.
    pub async fn update_group(&self, id: i64, name: &str, egress_vpn: &str) -> Result<DomainGroup, ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.validate_egress_vpn(name, egress_vpn)?;
        let group = self.store.update_group(id, name, egress_vpn).await?;
        self.apply_locked().await?;
        Ok(group)
    }

    /// Delete a group, then re-apply (spec.md §8 scenario 2: deleting
    /// the last group flushes rules and destroys every managed set).
    pub async fn delete_group(&self, id: i64) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.store.delete_group(id).await?;
        self.apply_locked().await
    }

    /// Replace a group's rule list, then re-apply.
    pub async fn replace_rules(&self, group_id: i64, rules: &[RoutingRule]) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.store.replace_rules(group_id, rules).await?;
        self.apply_locked().await
    }

    /// Bulk-replace the resolver snapshot, then re-apply. `groups` is
    /// accepted for parity with the declarative `{groups, resolverSnapshot}`
    /// shape; the store remains the sole source of truth for group state,
    /// so only the resolver snapshot is actually replaced here.
    pub async fn replace_state(
        &self,
        groups: &[DomainGroup],
        resolver_snapshot: &[ResolverCacheRow],
    ) -> Result<(), ReconcileError> {
        let _ = groups;
        let _guard = self.mutex.lock().await;
        self.store.replace_resolver_snapshot(resolver_snapshot).await?;
        self.apply_locked().await
    }

    /// Merge `rows` into the resolver cache and recompute destination
    /// address-set contents only, without re-invoking the rule applier
    /// (spec.md §8 scenario 7/8: resolver and pre-warm upserts are
    /// rules-neutral).
    pub async fn upsert_resolver_snapshot(&self, rows: &[ResolverCacheRow]) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.store.upsert_resolver_snapshot(rows).await?;
        self.refresh_destination_sets_locked().await
    }

    /// Merge `rows` into the pre-warm cache and recompute destination
    /// address-set contents only.
    pub async fn upsert_prewarm_snapshot(&self, rows: &[PrewarmRow]) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.store.upsert_prewarm_snapshot(rows).await?;
        self.refresh_destination_sets_locked().await
    }

    /// Clear the resolver cache and recompute destination set contents.
    pub async fn clear_resolver_cache(&self) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.store.clear_resolver_cache().await?;
        self.refresh_destination_sets_locked().await
    }

    /// Clear the pre-warm cache and recompute destination set contents.
    pub async fn clear_prewarm_cache(&self) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.store.clear_prewarm_cache().await?;
        self.refresh_destination_sets_locked().await
    }

    /// Re-run the full reconciliation procedure from current store state.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> Result<(), ReconcileError> {
        let _guard = self.mutex.lock().await;
        self.apply_locked().await
    }

    fn validate_egress_vpn(&self, group_name: &str, egress_vpn: &str) -> Result<(), ReconcileError> {
        match self.vpn_lister.get(egress_vpn) {
            Some(vpn) if vpn.is_usable() => Ok(()),
            _ => Err(ReconcileError::InvalidEgressVpn {
                group: group_name.to_string(),
                egress_vpn: egress_vpn.to_string(),
            }),
        }
    }

    /// Full reconciliation procedure (spec.md §4.9):
    /// 1. purge expired cache rows,
    /// 2. empty state flushes rules, destroys every managed set, writes
    ///    an empty hint file,
    /// 3. validate every referenced egress VPN before any kernel change,
    /// 4. plan each rule's address-set contents and `RouteBinding`,
    /// 5. stage-swap address sets in ascending name order,
    /// 6. write the DNS hint file,
    /// 7. apply firewall/policy-route state (root-jump switch happens
    ///    here, before any stale-set destruction),
    /// 8. destroy stale managed sets no longer referenced.
    async fn apply_locked(&self) -> Result<(), ReconcileError> {
        debug!("starting reconcile pass");
        // Fresh per-pass: a reconcile is not itself externally cancellable,
        // but every kernel-facing call below still carries a token so the
        // capability traits have one seam (spec.md §7).
        let token = CancellationToken::new();
        self.store.purge_expired_resolver_cache(self.cache_retention_days).await?;
        self.store.purge_expired_prewarm_cache(self.cache_retention_days).await?;

        let groups = self.store.list_groups().await?;
        if groups.is_empty() {
            info!("no groups configured, flushing all managed state");
            self.rule_applier.flush(&token).await?;
            self.destroy_all_managed_sets(&token).await?;
            self.dns.emit(Vec::new(), &token).await?;
            return Ok(());
        }

        for group in &groups {
            self.validate_egress_vpn(&group.name, &group.egress_vpn)?;
        }

        let resolver_map = self.load_resolver_map().await?;
        let prewarm_map = self.load_prewarm_map().await?;

        let mut planned = Vec::new();
        for group in &groups {
            let vpn = self
                .vpn_lister
                .get(&group.egress_vpn)
                .expect("validated above");
            for rule in &group.rules {
                if rule.is_comment_only() {
                    continue;
                }
                planned.push(plan_rule(group, rule, &vpn, &resolver_map, &prewarm_map)?);
            }
        }
        planned.sort_by(|a, b| {
            (a.binding.group_name.as_str(), a.binding.rule_index)
                .cmp(&(b.binding.group_name.as_str(), b.binding.rule_index))
        });

        let mut desired_sets: BTreeMap<String, (Family, Vec<String>)> = BTreeMap::new();
        let mut hints = Vec::new();
        for rule in &planned {
            for (name, family, entries) in &rule.sets {
                desired_sets.insert(name.clone(), (*family, entries.clone()));
            }
            hints.extend(rule.dns_hints.iter().cloned());
        }

        for (name, (family, entries)) in &desired_sets {
            staged_swap(&self.sets, name, *family, entries, &token).await?;
        }

        self.dns.emit(hints, &token).await?;

        let bindings: Vec<RouteBinding> = planned.into_iter().map(|p| p.binding).collect();
        self.rule_applier.apply(&bindings, &token).await?;

        let active: HashSet<&str> = desired_sets.keys().map(String::as_str).collect();
        let existing = self.sets.list(SET_NAME_PREFIX, &token).await?;
        for name in existing {
            if !active.contains(name.as_str()) {
                warn!(set = %name, "destroying stale address set");
                self.sets.destroy(&name, &token).await?;
            }
        }

        info!(groups = groups.len(), sets = desired_sets.len(), "reconcile pass complete");
        Ok(())
    }

    /// Recompute only destination-set contents from current state and
    /// stage-swap them, without touching the rule applier or DNS hints
    /// (spec.md §8 scenarios 7/8: cache mutations are rules-neutral).
    async fn refresh_destination_sets_locked(&self) -> Result<(), ReconcileError> {
        let token = CancellationToken::new();
        let groups = self.store.list_groups().await?;
        if groups.is_empty() {
            return Ok(());
        }
        for group in &groups {
            self.validate_egress_vpn(&group.name, &group.egress_vpn)?;
        }

        let resolver_map = self.load_resolver_map().await?;
        let prewarm_map = self.load_prewarm_map().await?;

        for group in &groups {
            let base = slug_base(&group.name);
            for rule in &group.rules {
                if rule.is_comment_only() || !rule.has_destination() {
                    continue;
                }
                let rule_number = (rule.position + 1) as usize;
                let name_v4 = rule_set_name(&base, rule_number, SetRole::Destination, Family::Inet);
                let name_v6 = rule_set_name(&base, rule_number, SetRole::Destination, Family::Inet6);
                let (v4, v6) = destination_contents(rule, &resolver_map, &prewarm_map, &name_v4, &name_v6);
                let v4_refs: Vec<&str> = v4.iter().map(String::as_str).collect();
                let v6_refs: Vec<&str> = v6.iter().map(String::as_str).collect();
                let v4 = prefix::collapse(&v4_refs, Family::Inet)?;
                let v6 = prefix::collapse(&v6_refs, Family::Inet6)?;
                staged_swap(&self.sets, &name_v4, Family::Inet, &v4, &token).await?;
                staged_swap(&self.sets, &name_v6, Family::Inet6, &v6, &token).await?;
            }
        }
        Ok(())
    }

    async fn destroy_all_managed_sets(&self, token: &CancellationToken) -> Result<(), ReconcileError> {
        for name in self.sets.list(SET_NAME_PREFIX, token).await? {
            self.sets.destroy(&name, token).await?;
        }
        Ok(())
    }

    async fn load_resolver_map(&self) -> Result<HashMap<ResolverSelector, svpn_types::ResolverValues>, ReconcileError> {
        let rows = self.store.load_resolver_snapshot(self.cache_retention_days).await?;
        Ok(rows.into_iter().map(|row| (row.selector, row.values)).collect())
    }

    async fn load_prewarm_map(&self) -> Result<HashMap<String, svpn_types::ResolverValues>, ReconcileError> {
        let rows = self.store.load_prewarm_snapshot(self.cache_retention_days).await?;
        Ok(rows.into_iter().map(|row| (row.set_name, row.values)).collect())
    }
}

impl<A, R, D, V> ApplyTrigger for Reconciler<A, R, D, V>
where
    A: AddressSetOperator,
    R: RuleApplier,
    D: DnsManager,
    V: VpnLister,
{
    async fn trigger(&self) {
        if let Err(err) = self.apply().await {
            warn!(error = %err, "reconcile triggered by resolver run failed");
        }
    }
}

fn destination_contents(
    rule: &RoutingRule,
    resolver_map: &HashMap<ResolverSelector, svpn_types::ResolverValues>,
    prewarm_map: &HashMap<String, svpn_types::ResolverValues>,
    set_name_v4: &str,
    set_name_v6: &str,
) -> (Vec<String>, Vec<String>) {
    let (mut v4, mut v6) = prefix::split_by_family(&rule.destination_cidrs);

    for selector in rule.resolver_selectors() {
        if let Some(values) = resolver_map.get(&selector) {
            v4.extend(values.v4.iter().cloned());
            v6.extend(values.v6.iter().cloned());
        }
    }

    for key in [set_name_v4, set_name_v6] {
        if let Some(values) = prewarm_map.get(key) {
            v4.extend(values.v4.iter().cloned());
            v6.extend(values.v6.iter().cloned());
        }
    }

    (v4, v6)
}

fn plan_rule(
    group: &DomainGroup,
    rule: &RoutingRule,
    vpn: &svpn_types::EgressVpn,
    resolver_map: &HashMap<ResolverSelector, svpn_types::ResolverValues>,
    prewarm_map: &HashMap<String, svpn_types::ResolverValues>,
) -> Result<PlannedRule, ReconcileError> {
    let base = slug_base(&group.name);
    let rule_number = (rule.position + 1) as usize;

    let source_set_v4 = rule_set_name(&base, rule_number, SetRole::Source, Family::Inet);
    let source_set_v6 = rule_set_name(&base, rule_number, SetRole::Source, Family::Inet6);
    let destination_set_v4 = rule_set_name(&base, rule_number, SetRole::Destination, Family::Inet);
    let destination_set_v6 = rule_set_name(&base, rule_number, SetRole::Destination, Family::Inet6);
    let excluded_source_set_v4 = rule_set_name(&base, rule_number, SetRole::ExcludedSource, Family::Inet);
    let excluded_source_set_v6 = rule_set_name(&base, rule_number, SetRole::ExcludedSource, Family::Inet6);
    let excluded_destination_set_v4 = rule_set_name(&base, rule_number, SetRole::ExcludedDestination, Family::Inet);
    let excluded_destination_set_v6 = rule_set_name(&base, rule_number, SetRole::ExcludedDestination, Family::Inet6);

    let mut sets = Vec::new();

    if rule.has_source() {
        let (v4, v6) = prefix::split_by_family(&rule.source_cidrs);
        sets.push((source_set_v4.clone(), Family::Inet, collapse_family(&v4, Family::Inet)?));
        sets.push((source_set_v6.clone(), Family::Inet6, collapse_family(&v6, Family::Inet6)?));
    }

    if rule.has_destination() {
        let (v4, v6) = destination_contents(rule, resolver_map, prewarm_map, &destination_set_v4, &destination_set_v6);
        sets.push((destination_set_v4.clone(), Family::Inet, collapse_family(&v4, Family::Inet)?));
        sets.push((destination_set_v6.clone(), Family::Inet6, collapse_family(&v6, Family::Inet6)?));
    }

    if rule.has_excluded_source() {
        let (v4, v6) = prefix::split_by_family(&rule.excluded_source_cidrs);
        sets.push((excluded_source_set_v4.clone(), Family::Inet, collapse_family(&v4, Family::Inet)?));
        sets.push((excluded_source_set_v6.clone(), Family::Inet6, collapse_family(&v6, Family::Inet6)?));
    }

    if rule.has_excluded_destination() {
        let (v4, v6) = prefix::split_by_family(&rule.excluded_destination_cidrs);
        sets.push((excluded_destination_set_v4.clone(), Family::Inet, collapse_family(&v4, Family::Inet)?));
        sets.push((excluded_destination_set_v6.clone(), Family::Inet6, collapse_family(&v6, Family::Inet6)?));
    }

    let mut dns_hints = Vec::new();
    for domain in &rule.exact_domains {
        dns_hints.push(DnsHint {
            domain: domain.clone(),
            v4_set: destination_set_v4.clone(),
            v6_set: destination_set_v6.clone(),
        });
    }
    for base_domain in &rule.wildcard_domains {
        dns_hints.push(DnsHint {
            domain: format!("*.{base_domain}"),
            v4_set: destination_set_v4.clone(),
            v6_set: destination_set_v6.clone(),
        });
    }

    let binding = RouteBinding {
        group_name: group.name.clone(),
        rule_index: rule.position as usize,
        source_set_v4,
        source_set_v6,
        destination_set_v4,
        destination_set_v6,
        excluded_source_set_v4,
        excluded_source_set_v6,
        excluded_destination_set_v4,
        excluded_destination_set_v6,
        source_interfaces: rule.source_interfaces.clone(),
        source_macs: rule.source_macs.clone(),
        destination_ports: rule.destination_ports.clone(),
        excluded_destination_ports: rule.excluded_destination_ports.clone(),
        exclude_multicast: rule.exclude_multicast.effective(),
        mark: vpn.fw_mark,
        route_table: vpn.route_table as u32,
        interface: vpn.interface_name.clone(),
        has_source: rule.has_source(),
        has_destination: rule.has_destination(),
        has_excluded_source: rule.has_excluded_source(),
        has_excluded_destination: rule.has_excluded_destination(),
    };

    Ok(PlannedRule { binding, sets, dns_hints })
}

fn collapse_family(entries: &[String], family: Family) -> Result<Vec<String>, PrefixError> {
    let refs: Vec<&str> = entries.iter().map(String::as_str).collect();
    prefix::collapse(&refs, family)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use svpn_types::model::{ExcludeMulticast, Port, Protocol};
    use svpn_types::EgressVpn;

    use crate::executor::RecordingExecutor;
    use crate::ipset::IpsetOperator;
    use crate::rules::IptablesRuleApplier;

    struct RecordingDns {
        calls: StdMutex<Vec<Vec<DnsHint>>>,
    }

    impl RecordingDns {
        fn new() -> Self {
            RecordingDns { calls: StdMutex::new(Vec::new()) }
        }

        fn calls(&self) -> Vec<Vec<DnsHint>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DnsManager for RecordingDns {
        async fn emit(&self, hints: Vec<DnsHint>, _token: &CancellationToken) -> Result<(), DnsHintError> {
            self.calls.lock().unwrap().push(hints);
            Ok(())
        }
    }

    struct StaticLister(Vec<EgressVpn>);

    impl VpnLister for StaticLister {
        fn list(&self) -> Vec<EgressVpn> {
            self.0.clone()
        }
    }

    fn sgp_vpn() -> EgressVpn {
        EgressVpn { name: "wg-sgp".into(), interface_name: "wg-sgp".into(), fw_mark: 0x169, route_table: 201 }
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

    fn test_reconciler(
        store: Store,
        vpns: Vec<EgressVpn>,
    ) -> Reconciler<IpsetOperator<RecordingExecutor>, IptablesRuleApplier<RecordingExecutor>, RecordingDns, StaticLister> {
        Reconciler::new(
            store,
            IpsetOperator::new(RecordingExecutor::new()),
            IptablesRuleApplier::new(RecordingExecutor::new()),
            RecordingDns::new(),
            StaticLister(vpns),
            7,
        )
    }

    fn sample_rule() -> RoutingRule {
        RoutingRule {
            destination_cidrs: vec!["203.0.113.0/24".to_string()],
            destination_ports: vec![Port::new(Protocol::Tcp, 443, 443).unwrap()],
            exclude_multicast: ExcludeMulticast(None),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_group_rejects_missing_egress_vpn() {
        let store = test_store().await;
        let reconciler = test_reconciler(store, vec![]);
        let err = reconciler.create_group("streaming-sg", "wg-sgp").await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidEgressVpn { .. }));
        assert!(reconciler.list_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_group_applies_routing_with_exact_set_names() {
        let store = test_store().await;
        let reconciler = test_reconciler(store, vec![sgp_vpn()]);
        let group = reconciler.create_group("Streaming-SG", "wg-sgp").await.unwrap();
        reconciler.replace_rules(group.id, std::slice::from_ref(&sample_rule())).await.unwrap();

        let dns_calls = reconciler.dns.calls();
        assert_eq!(dns_calls.len(), 2, "one from create_group, one from replace_rules");

        let rule_calls = reconciler.rule_applier.executor.calls();
        let applied_bindings_calls = rule_calls.iter().filter(|c| c.name.ends_with("iptables")).count();
        assert!(applied_bindings_calls > 0);

        let set_calls = reconciler.sets.executor.calls();
        let create_calls: Vec<&str> = set_calls
            .iter()
            .filter(|c| c.argv.first().map(String::as_str) == Some("create"))
            .map(|c| c.argv[1].as_str())
            .collect();
        assert!(create_calls.contains(&"svpn_streaming_sg_r1d4"));
        assert!(create_calls.contains(&"svpn_streaming_sg_r1d6"));
    }

    #[tokio::test]
    async fn deleting_last_group_flushes_and_destroys_sets() {
        let store = test_store().await;
        let reconciler = test_reconciler(store, vec![sgp_vpn()]);
        let group = reconciler.create_group("streaming-sg", "wg-sgp").await.unwrap();
        reconciler.replace_rules(group.id, std::slice::from_ref(&sample_rule())).await.unwrap();

        reconciler.delete_group(group.id).await.unwrap();

        let rule_calls = reconciler.rule_applier.executor.calls();
        assert!(rule_calls.iter().any(|c| c.argv.contains(&"-F".to_string())));

        let dns_calls = reconciler.dns.calls();
        assert!(dns_calls.last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_resolver_snapshot_is_rules_neutral() {
        let store = test_store().await;
        let reconciler = test_reconciler(store, vec![sgp_vpn()]);
        let group = reconciler.create_group("streaming-sg", "wg-sgp").await.unwrap();
        let mut rule = sample_rule();
        rule.destination_cidrs.clear();
        rule.exact_domains = vec!["example.com".to_string()];
        reconciler.replace_rules(group.id, std::slice::from_ref(&rule)).await.unwrap();

        let rule_calls_before = reconciler.rule_applier.executor.calls().len();

        reconciler
            .upsert_resolver_snapshot(&[ResolverCacheRow {
                selector: ResolverSelector::new(svpn_types::SelectorKind::Domain, "example.com".to_string()),
                values: svpn_types::ResolverValues { v4: vec!["198.51.100.1/32".to_string()], v6: vec![] },
                updated_at: 0,
            }])
            .await
            .unwrap();

        let rule_calls_after = reconciler.rule_applier.executor.calls().len();
        assert_eq!(rule_calls_before, rule_calls_after, "rule applier must not be re-invoked");

        let set_calls = reconciler.sets.executor.calls();
        let adds: Vec<&str> = set_calls
            .iter()
            .filter(|c| c.argv.first().map(String::as_str) == Some("add"))
            .map(|c| c.argv[2].as_str())
            .collect();
        assert!(adds.contains(&"198.51.100.1/32"));
    }
}
