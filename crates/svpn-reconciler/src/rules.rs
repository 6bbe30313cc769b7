//! Rule Applier: double-buffered `iptables`/`ip6tables` chain generation,
//! MARK/NAT/policy-route rule emission, and selector expansion
//! (spec.md §4.8). No direct teacher analog (the daemon manages WireGuard
//! interfaces, not packet-mangling chains); grounded on
//! `wirewarden-daemon/src/netlink.rs`'s diff/full-apply split
//! (`apply_config`/`apply_config_diff`) for the "detect current state,
//! compute the minimal command sequence" shape, executed over the same
//! [`crate::executor::CommandExecutor`] seam as the rest of this crate.

use std::collections::HashSet;
use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svpn_types::model::{Port, Protocol};
use svpn_types::Family;

use crate::executor::{CommandExecutor, ExecutorError};

const ROOT_MARK_CHAIN: &str = "SVPN_MARK";
const ROOT_NAT_CHAIN: &str = "SVPN_NAT";
const POLICY_ROUTE_PRIORITY: u32 = 100;

/// Errors the rule applier can surface.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The underlying command invocation failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Two active bindings share a `fw_mark` but demand different
    /// `route_table`s (spec.md §3 invariant, §9 open question (a):
    /// "current behaviour rejects").
    #[error("fw_mark {mark:#x} is bound to both route_table {table_a} and {table_b}")]
    ConflictingMark {
        /// The shared firewall mark.
        mark: u32,
        /// First route table seen for this mark.
        table_a: u32,
        /// Second, conflicting route table.
        table_b: u32,
    },

    /// A binding failed basic validation (`mark >= 200`, `route_table >=
    /// 200`, non-empty `interface`).
    #[error("invalid binding for {group}/{rule_index}: {detail}")]
    InvalidBinding {
        /// Owning group name.
        group: String,
        /// Rule index within the group.
        rule_index: usize,
        /// What failed validation.
        detail: String,
    },
}

/// One active rule's derived firewall state (spec.md §3 `RouteBinding`).
#[derive(Debug, Clone)]
pub struct RouteBinding {
    /// Owning group's name.
    pub group_name: String,
    /// Rule's position within its group.
    pub rule_index: usize,
    /// Source address-set names, present only when `has_source`.
    pub source_set_v4: String,
    /// Source address-set name (IPv6).
    pub source_set_v6: String,
    /// Destination address-set name (IPv4).
    pub destination_set_v4: String,
    /// Destination address-set name (IPv6).
    pub destination_set_v6: String,
    /// Excluded-source address-set name (IPv4).
    pub excluded_source_set_v4: String,
    /// Excluded-source address-set name (IPv6).
    pub excluded_source_set_v6: String,
    /// Excluded-destination address-set name (IPv4).
    pub excluded_destination_set_v4: String,
    /// Excluded-destination address-set name (IPv6).
    pub excluded_destination_set_v6: String,
    /// Source interface names.
    pub source_interfaces: Vec<String>,
    /// Source MAC addresses.
    pub source_macs: Vec<String>,
    /// The rule's own destination port selectors.
    pub destination_ports: Vec<Port>,
    /// Excluded destination port selectors.
    pub excluded_destination_ports: Vec<Port>,
    /// Effective (ternary-resolved) multicast exclusion.
    pub exclude_multicast: bool,
    /// Egress VPN firewall mark.
    pub mark: u32,
    /// Egress VPN route table.
    pub route_table: u32,
    /// Egress VPN interface name.
    pub interface: String,
    /// Whether a source address set should be matched.
    pub has_source: bool,
    /// Whether a destination address set should be matched.
    pub has_destination: bool,
    /// Whether an excluded-source address set should be matched.
    pub has_excluded_source: bool,
    /// Whether an excluded-destination address set should be matched.
    pub has_excluded_destination: bool,
}

impl RouteBinding {
    fn validate(&self) -> Result<(), RuleError> {
        if self.mark < 200 || self.route_table < 200 || self.interface.is_empty() {
            return Err(RuleError::InvalidBinding {
                group: self.group_name.clone(),
                rule_index: self.rule_index,
                detail: format!(
                    "mark={:#x} route_table={} interface={:?}",
                    self.mark, self.route_table, self.interface
                ),
            });
        }
        Ok(())
    }

    fn source_set(&self, family: Family) -> &str {
        match family {
            Family::Inet => &self.source_set_v4,
            Family::Inet6 => &self.source_set_v6,
        }
    }

    fn destination_set(&self, family: Family) -> &str {
        match family {
            Family::Inet => &self.destination_set_v4,
            Family::Inet6 => &self.destination_set_v6,
        }
    }

    fn excluded_source_set(&self, family: Family) -> &str {
        match family {
            Family::Inet => &self.excluded_source_set_v4,
            Family::Inet6 => &self.excluded_source_set_v6,
        }
    }

    fn excluded_destination_set(&self, family: Family) -> &str {
        match family {
            Family::Inet => &self.excluded_destination_set_v4,
            Family::Inet6 => &self.excluded_destination_set_v6,
        }
    }
}

fn expand_protocol(protocol: Protocol) -> &'static [&'static str] {
    match protocol {
        Protocol::Tcp => &["tcp"],
        Protocol::Udp => &["udp"],
        Protocol::Both => &["tcp", "udp"],
    }
}

/// One expanded `(protocol, start, end)` triple used both for MARK-rule
/// port variants and excluded-port exclusion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortVariant {
    protocol: &'static str,
    start: u16,
    end: u16,
}

fn port_variants(ports: &[Port]) -> Vec<PortVariant> {
    let mut out = Vec::new();
    for port in ports {
        for proto in expand_protocol(port.protocol) {
            out.push(PortVariant { protocol: proto, start: port.start, end: port.end });
        }
    }
    out
}

/// The excluded destination port exclusions to emit for this binding: if
/// the rule has no destination port selectors of its own, every excluded
/// port applies unconditionally; otherwise only excluded ports whose
/// protocol+range overlaps one of the rule's own selectors apply, each
/// expanded per protocol (spec.md §9 open question (b)).
fn excluded_port_rules(binding: &RouteBinding) -> Vec<PortVariant> {
    let mut out = Vec::new();
    for excluded in &binding.excluded_destination_ports {
        let applies =
            binding.destination_ports.is_empty() || binding.destination_ports.iter().any(|d| excluded.overlaps(d));
        if !applies {
            continue;
        }
        for variant in port_variants(std::slice::from_ref(excluded)) {
            if !out.contains(&variant) {
                out.push(variant);
            }
        }
    }
    out
}

/// Double-buffered chain generation, mark/NAT/policy-route rule
/// emission (spec.md §4.8).
pub trait RuleApplier: Send + Sync {
    /// Apply the full set of active bindings, replacing the working
    /// generation and switching the root jump.
    fn apply(&self, bindings: &[RouteBinding], token: &CancellationToken) -> impl Future<Output = Result<(), RuleError>> + Send;

    /// Remove both generations, their sub-chains, the root chains, and
    /// all managed policy-routing rules.
    fn flush(&self, token: &CancellationToken) -> impl Future<Output = Result<(), RuleError>> + Send;
}

/// Production [`RuleApplier`] over a [`CommandExecutor`].
pub struct IptablesRuleApplier<E> {
    pub(crate) executor: E,
}

impl<E: CommandExecutor> IptablesRuleApplier<E> {
    /// Wrap `executor` as a rule applier.
    pub fn new(executor: E) -> Self {
        IptablesRuleApplier { executor }
    }

    async fn detect_active_generation(&self, family: Family, token: &CancellationToken) -> Result<Option<char>, RuleError> {
        let binary = family.iptables_binary();
        let argv = vec!["-t".to_string(), "mangle".to_string(), "-S".to_string(), ROOT_MARK_CHAIN.to_string()];
        let output = match self.executor.output(binary, &argv, token).await {
            Ok(out) => out,
            Err(_) => return Ok(None),
        };
        let text = String::from_utf8_lossy(&output);
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix(&format!("-A {ROOT_MARK_CHAIN} -j {ROOT_MARK_CHAIN}_")) {
                if let Some(letter) = rest.chars().next() {
                    return Ok(Some(letter));
                }
            }
        }
        Ok(None)
    }

    async fn ensure_chain(&self, binary: &str, table: &str, chain: &str, token: &CancellationToken) -> Result<(), RuleError> {
        match self
            .executor
            .run(binary, &["-t".to_string(), table.to_string(), "-N".to_string(), chain.to_string()], token)
            .await
        {
            Ok(()) => Ok(()),
            Err(ExecutorError::NonZeroExit { output, .. }) if output.contains("Chain already exists") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush_chain(&self, binary: &str, table: &str, chain: &str, token: &CancellationToken) -> Result<(), RuleError> {
        self.executor
            .run(binary, &["-t".to_string(), table.to_string(), "-F".to_string(), chain.to_string()], token)
            .await?;
        Ok(())
    }

    async fn delete_chain(&self, binary: &str, table: &str, chain: &str, token: &CancellationToken) -> Result<(), RuleError> {
        match self
            .executor
            .run(binary, &["-t".to_string(), table.to_string(), "-X".to_string(), chain.to_string()], token)
            .await
        {
            Ok(()) => Ok(()),
            Err(ExecutorError::NonZeroExit { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_jump(&self, binary: &str, table: &str, parent: &str, target: &str, token: &CancellationToken) -> Result<(), RuleError> {
        let probe = vec!["-t".to_string(), table.to_string(), "-C".to_string(), parent.to_string(), "-j".to_string(), target.to_string()];
        if self.executor.run(binary, &probe, token).await.is_ok() {
            return Ok(());
        }
        self.executor
            .run(
                binary,
                &["-t".to_string(), table.to_string(), "-A".to_string(), parent.to_string(), "-j".to_string(), target.to_string()],
                token,
            )
            .await?;
        Ok(())
    }

    async fn list_chains(&self, binary: &str, table: &str, prefix: &str, token: &CancellationToken) -> Result<Vec<String>, RuleError> {
        let output = self.executor.output(binary, &["-t".to_string(), table.to_string(), "-S".to_string()], token).await?;
        let text = String::from_utf8_lossy(&output);
        let mut names: Vec<String> = text
            .lines()
            .filter_map(|l| l.strip_prefix("-N "))
            .map(str::to_string)
            .filter(|n| n.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_stale_subchains(&self, family: Family, generation: char, token: &CancellationToken) -> Result<(), RuleError> {
        let binary = family.iptables_binary();
        let prefix = format!("SVPN{generation}_");
        let mangle_chains = self.list_chains(binary, "mangle", &prefix, token).await?;
        for chain in mangle_chains {
            self.flush_chain(binary, "mangle", &chain, token).await?;
            self.delete_chain(binary, "mangle", &chain, token).await?;
        }
        Ok(())
    }

    async fn apply_family(&self, bindings: &[RouteBinding], family: Family, token: &CancellationToken) -> Result<(), RuleError> {
        let binary = family.iptables_binary();
        let active = self.detect_active_generation(family, token).await?;
        let working = match active {
            Some('A') => 'B',
            Some('B') => 'A',
            _ => 'A',
        };
        let legacy_migration = active.is_none();

        self.ensure_chain(binary, "mangle", ROOT_MARK_CHAIN, token).await?;
        self.ensure_chain(binary, "nat", ROOT_NAT_CHAIN, token).await?;
        self.ensure_jump(binary, "mangle", "PREROUTING", ROOT_MARK_CHAIN, token).await?;
        self.ensure_jump(binary, "nat", "POSTROUTING", ROOT_NAT_CHAIN, token).await?;

        if legacy_migration {
            self.flush_chain(binary, "mangle", ROOT_MARK_CHAIN, token).await?;
            self.flush_chain(binary, "nat", ROOT_NAT_CHAIN, token).await?;
        }

        let mark_gen_chain = format!("{ROOT_MARK_CHAIN}_{working}");
        let nat_gen_chain = format!("{ROOT_NAT_CHAIN}_{working}");
        self.ensure_chain(binary, "mangle", &mark_gen_chain, token).await?;
        self.flush_chain(binary, "mangle", &mark_gen_chain, token).await?;
        self.ensure_chain(binary, "nat", &nat_gen_chain, token).await?;
        self.flush_chain(binary, "nat", &nat_gen_chain, token).await?;
        self.remove_stale_subchains(family, working, token).await?;

        let mut desired_marks: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
        let mut nat_pairs: HashSet<(u32, String)> = HashSet::new();

        for (idx, binding) in bindings.iter().enumerate() {
            binding.validate()?;

            if let Some(&existing_table) = desired_marks.get(&binding.mark) {
                if existing_table != binding.route_table {
                    return Err(RuleError::ConflictingMark {
                        mark: binding.mark,
                        table_a: existing_table,
                        table_b: binding.route_table,
                    });
                }
            } else {
                desired_marks.insert(binding.mark, binding.route_table);
            }

            let subchain = format!("SVPN{working}_{idx:03}_{}", family.name_suffix());
            self.ensure_chain(binary, "mangle", &subchain, token).await?;
            self.flush_chain(binary, "mangle", &subchain, token).await?;
            self.ensure_jump(binary, "mangle", &mark_gen_chain, &subchain, token).await?;

            if binding.exclude_multicast {
                self.executor
                    .run(
                        binary,
                        &[
                            "-t".to_string(),
                            "mangle".to_string(),
                            "-A".to_string(),
                            subchain.clone(),
                            "-d".to_string(),
                            family.multicast_cidr().to_string(),
                            "-j".to_string(),
                            "RETURN".to_string(),
                        ],
                        token,
                    )
                    .await?;
            }

            if binding.has_excluded_source {
                self.emit_set_return(binary, &subchain, binding.excluded_source_set(family), "src", token).await?;
            }
            if binding.has_excluded_destination {
                self.emit_set_return(binary, &subchain, binding.excluded_destination_set(family), "dst", token).await?;
            }
            for excluded in excluded_port_rules(binding) {
                self.executor
                    .run(
                        binary,
                        &[
                            "-t".to_string(),
                            "mangle".to_string(),
                            "-A".to_string(),
                            subchain.clone(),
                            "-p".to_string(),
                            excluded.protocol.to_string(),
                            "--dport".to_string(),
                            format_port_range(excluded.start, excluded.end),
                            "-j".to_string(),
                            "RETURN".to_string(),
                        ],
                        token,
                    )
                    .await?;
            }

            self.emit_mark_rules(binary, &subchain, binding, family, token).await?;

            let mark_hex = format!("{:#x}", binding.mark);
            nat_pairs.insert((binding.mark, binding.interface.clone()));
            let _ = mark_hex;
        }

        let mut nat_pairs: Vec<(u32, String)> = nat_pairs.into_iter().collect();
        nat_pairs.sort();
        for (mark, interface) in nat_pairs {
            self.executor
                .run(
                    binary,
                    &[
                        "-t".to_string(),
                        "nat".to_string(),
                        "-A".to_string(),
                        nat_gen_chain.clone(),
                        "-m".to_string(),
                        "mark".to_string(),
                        "--mark".to_string(),
                        format!("{mark:#x}"),
                        "-o".to_string(),
                        interface,
                        "-j".to_string(),
                        "MASQUERADE".to_string(),
                    ],
                    token,
                )
                .await?;
        }

        self.switch_root_jump(binary, "mangle", ROOT_MARK_CHAIN, working, token).await?;
        self.switch_root_jump(binary, "nat", ROOT_NAT_CHAIN, working, token).await?;

        self.reconcile_policy_routes(family, &desired_marks, token).await?;

        Ok(())
    }

    async fn emit_set_return(
        &self,
        binary: &str,
        subchain: &str,
        set_name: &str,
        side: &str,
        token: &CancellationToken,
    ) -> Result<(), RuleError> {
        self.executor
            .run(
                binary,
                &[
                    "-t".to_string(),
                    "mangle".to_string(),
                    "-A".to_string(),
                    subchain.to_string(),
                    "-m".to_string(),
                    "set".to_string(),
                    "--match-set".to_string(),
                    set_name.to_string(),
                    side.to_string(),
                    "-j".to_string(),
                    "RETURN".to_string(),
                ],
                token,
            )
            .await?;
        Ok(())
    }

    async fn emit_mark_rules(
        &self,
        binary: &str,
        subchain: &str,
        binding: &RouteBinding,
        family: Family,
        token: &CancellationToken,
    ) -> Result<(), RuleError> {
        let ifaces: Vec<Option<&str>> =
            if binding.source_interfaces.is_empty() { vec![None] } else { binding.source_interfaces.iter().map(|s| Some(s.as_str())).collect() };
        let macs: Vec<Option<&str>> =
            if binding.source_macs.is_empty() { vec![None] } else { binding.source_macs.iter().map(|s| Some(s.as_str())).collect() };
        let ports: Vec<Option<PortVariant>> = {
            let variants = port_variants(&binding.destination_ports);
            if variants.is_empty() { vec![None] } else { variants.into_iter().map(Some).collect() }
        };

        for iface in &ifaces {
            for mac in &macs {
                for port in &ports {
                    let mut argv =
                        vec!["-t".to_string(), "mangle".to_string(), "-A".to_string(), subchain.to_string()];
                    if binding.has_source {
                        argv.extend(["-m".to_string(), "set".to_string(), "--match-set".to_string(), binding.source_set(family).to_string(), "src".to_string()]);
                    }
                    if binding.has_destination {
                        argv.extend(["-m".to_string(), "set".to_string(), "--match-set".to_string(), binding.destination_set(family).to_string(), "dst".to_string()]);
                    }
                    if let Some(iface) = iface {
                        argv.extend(["-i".to_string(), iface.to_string()]);
                    }
                    if let Some(mac) = mac {
                        argv.extend(["-m".to_string(), "mac".to_string(), "--mac-source".to_string(), mac.to_string()]);
                    }
                    if let Some(port) = port {
                        argv.extend(["-p".to_string(), port.protocol.to_string(), "--dport".to_string(), format_port_range(port.start, port.end)]);
                    }
                    argv.extend(["-j".to_string(), "MARK".to_string(), "--set-mark".to_string(), format!("{:#x}", binding.mark)]);
                    self.executor.run(binary, &argv, token).await?;
                }
            }
        }
        Ok(())
    }

    async fn switch_root_jump(&self, binary: &str, table: &str, root: &str, working: char, token: &CancellationToken) -> Result<(), RuleError> {
        let target = format!("{root}_{working}");
        let probe = vec!["-t".to_string(), table.to_string(), "-C".to_string(), root.to_string(), "-j".to_string(), target.clone()];
        if self.executor.run(binary, &probe, token).await.is_err() {
            self.executor
                .run(
                    binary,
                    &["-t".to_string(), table.to_string(), "-I".to_string(), root.to_string(), "1".to_string(), "-j".to_string(), target.clone()],
                    token,
                )
                .await?;
        }

        let stale = format!("{root}_{}", other_generation(working));
        for _ in 0..64 {
            let probe = vec!["-t".to_string(), table.to_string(), "-C".to_string(), root.to_string(), "-j".to_string(), stale.clone()];
            if self.executor.run(binary, &probe, token).await.is_err() {
                break;
            }
            self.executor
                .run(binary, &["-t".to_string(), table.to_string(), "-D".to_string(), root.to_string(), "-j".to_string(), stale.clone()], token)
                .await?;
        }
        Ok(())
    }

    async fn reconcile_policy_routes(
        &self,
        family: Family,
        desired: &std::collections::HashMap<u32, u32>,
        token: &CancellationToken,
    ) -> Result<(), RuleError> {
        let binary = "ip";
        let mut argv: Vec<String> = family.ip_rule_flag().iter().map(|s| s.to_string()).collect();
        argv.extend(["rule".to_string(), "show".to_string()]);
        let output = self.executor.output(binary, &argv, token).await.unwrap_or_default();
        let text = String::from_utf8_lossy(&output);

        let mut existing: Vec<(u32, u32)> = Vec::new();
        for line in text.lines() {
            let mark = extract_hex_field(line, "fwmark");
            let table = extract_decimal_field(line, "lookup");
            if let (Some(mark), Some(table)) = (mark, table) {
                if mark >= 200 && table >= 200 {
                    existing.push((mark, table));
                }
            }
        }

        for (&mark, &table) in desired {
            if !existing.contains(&(mark, table)) {
                let mut add: Vec<String> = family.ip_rule_flag().iter().map(|s| s.to_string()).collect();
                add.extend([
                    "rule".to_string(),
                    "add".to_string(),
                    "fwmark".to_string(),
                    format!("{mark:#x}"),
                    "table".to_string(),
                    table.to_string(),
                    "priority".to_string(),
                    POLICY_ROUTE_PRIORITY.to_string(),
                ]);
                self.executor.run(binary, &add, token).await?;
            }
        }

        for (mark, table) in existing {
            let wanted = desired.get(&mark) == Some(&table);
            if !wanted {
                let mut del: Vec<String> = family.ip_rule_flag().iter().map(|s| s.to_string()).collect();
                del.extend([
                    "rule".to_string(),
                    "del".to_string(),
                    "fwmark".to_string(),
                    format!("{mark:#x}"),
                    "table".to_string(),
                    table.to_string(),
                    "priority".to_string(),
                    POLICY_ROUTE_PRIORITY.to_string(),
                ]);
                // Bounded retry: tolerate the entry already being gone.
                let _ = self.executor.run(binary, &del, token).await;
            }
        }
        Ok(())
    }
}

fn other_generation(g: char) -> char {
    if g == 'A' {
        'B'
    } else {
        'A'
    }
}

fn format_port_range(start: u16, end: u16) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

fn extract_hex_field(line: &str, key: &str) -> Option<u32> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let idx = parts.iter().position(|p| *p == key)?;
    let raw = parts.get(idx + 1)?.trim_start_matches("0x");
    u32::from_str_radix(raw, 16).ok()
}

fn extract_decimal_field(line: &str, key: &str) -> Option<u32> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let idx = parts.iter().position(|p| *p == key)?;
    parts.get(idx + 1)?.parse().ok()
}

impl<E: CommandExecutor> RuleApplier for IptablesRuleApplier<E> {
    async fn apply(&self, bindings: &[RouteBinding], token: &CancellationToken) -> Result<(), RuleError> {
        let mut sorted: Vec<&RouteBinding> = bindings.iter().collect();
        sorted.sort_by(|a, b| (&a.group_name, a.rule_index).cmp(&(&b.group_name, b.rule_index)));
        let owned: Vec<RouteBinding> = sorted.into_iter().cloned().collect();

        debug!(count = owned.len(), "applying rule bindings");
        self.apply_family(&owned, Family::Inet, token).await?;
        self.apply_family(&owned, Family::Inet6, token).await?;
        info!(count = owned.len(), "rule bindings applied");
        Ok(())
    }

    async fn flush(&self, token: &CancellationToken) -> Result<(), RuleError> {
        for family in [Family::Inet, Family::Inet6] {
            let binary = family.iptables_binary();
            for generation in ['A', 'B'] {
                self.remove_stale_subchains(family, generation, token).await?;
                let _ = self.flush_chain(binary, "mangle", &format!("{ROOT_MARK_CHAIN}_{generation}"), token).await;
                let _ = self.delete_chain(binary, "mangle", &format!("{ROOT_MARK_CHAIN}_{generation}"), token).await;
                let _ = self.flush_chain(binary, "nat", &format!("{ROOT_NAT_CHAIN}_{generation}"), token).await;
                let _ = self.delete_chain(binary, "nat", &format!("{ROOT_NAT_CHAIN}_{generation}"), token).await;
            }
            let _ = self.flush_chain(binary, "mangle", ROOT_MARK_CHAIN, token).await;
            let _ = self.delete_chain(binary, "mangle", ROOT_MARK_CHAIN, token).await;
            let _ = self.flush_chain(binary, "nat", ROOT_NAT_CHAIN, token).await;
            let _ = self.delete_chain(binary, "nat", ROOT_NAT_CHAIN, token).await;

            warn!(family = ?family, "flushing managed policy-routing rules");
            self.reconcile_policy_routes(family, &std::collections::HashMap::new(), token).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;

    fn base_binding() -> RouteBinding {
        RouteBinding {
            group_name: "Streaming-SG".to_string(),
            rule_index: 0,
            source_set_v4: "svpn_streaming_sg_r1s4".to_string(),
            source_set_v6: "svpn_streaming_sg_r1s6".to_string(),
            destination_set_v4: "svpn_streaming_sg_r1d4".to_string(),
            destination_set_v6: "svpn_streaming_sg_r1d6".to_string(),
            excluded_source_set_v4: "svpn_streaming_sg_r1xs4".to_string(),
            excluded_source_set_v6: "svpn_streaming_sg_r1xs6".to_string(),
            excluded_destination_set_v4: "svpn_streaming_sg_r1xd4".to_string(),
            excluded_destination_set_v6: "svpn_streaming_sg_r1xd6".to_string(),
            source_interfaces: vec![],
            source_macs: vec![],
            destination_ports: vec![],
            excluded_destination_ports: vec![],
            exclude_multicast: true,
            mark: 0x169,
            route_table: 201,
            interface: "wg-sgp".to_string(),
            has_source: false,
            has_destination: true,
            has_excluded_source: false,
            has_excluded_destination: false,
        }
    }

    #[test]
    fn excluded_port_rules_emits_unconditionally_without_own_ports() {
        let mut binding = base_binding();
        binding.excluded_destination_ports = vec![Port::new(Protocol::Udp, 5353, 5353).unwrap()];
        let variants = excluded_port_rules(&binding);
        assert_eq!(variants, vec![PortVariant { protocol: "udp", start: 5353, end: 5353 }]);
    }

    #[test]
    fn excluded_port_rules_filters_by_overlap_when_rule_has_own_ports() {
        let mut binding = base_binding();
        binding.destination_ports = vec![Port::new(Protocol::Tcp, 443, 443).unwrap()];
        binding.excluded_destination_ports = vec![Port::new(Protocol::Udp, 5353, 5353).unwrap()];
        assert!(excluded_port_rules(&binding).is_empty());
    }

    #[test]
    fn excluded_port_rules_expands_both_per_protocol() {
        let mut binding = base_binding();
        binding.excluded_destination_ports = vec![Port::new(Protocol::Both, 53, 53).unwrap()];
        let variants = excluded_port_rules(&binding);
        assert_eq!(variants.len(), 2);
    }

    #[tokio::test]
    async fn apply_emits_combined_interface_and_mac_rule() {
        let executor = RecordingExecutor::new();
        let applier = IptablesRuleApplier::new(executor);
        let mut binding = base_binding();
        binding.has_destination = false;
        binding.source_interfaces = vec!["br6".to_string()];
        binding.source_macs = vec!["00:30:93:10:0a:12".to_string()];

        applier.apply(&[binding], &CancellationToken::new()).await.unwrap();

        let calls = applier.executor.calls_matching(|c| c.name == "iptables" && c.argv.contains(&"MARK".to_string()));
        assert_eq!(calls.len(), 1);
        let argv = &calls[0].argv;
        assert!(argv.windows(2).any(|w| w == ["-i", "br6"]));
        assert!(argv.windows(2).any(|w| w == ["--mac-source", "00:30:93:10:0a:12"]));
    }

    #[tokio::test]
    async fn apply_emits_exclusions_in_spec_order() {
        let executor = RecordingExecutor::new();
        let applier = IptablesRuleApplier::new(executor);
        let mut binding = base_binding();
        binding.has_excluded_destination = true;
        binding.excluded_destination_ports = vec![Port::new(Protocol::Udp, 5353, 5353).unwrap()];

        applier.apply(&[binding], &CancellationToken::new()).await.unwrap();

        let v4_calls = applier.executor.calls_matching(|c| c.name == "iptables" && c.argv.iter().any(|a| a == "RETURN" || a == "MARK"));
        let jump_targets: Vec<&str> = v4_calls
            .iter()
            .map(|c| {
                if c.argv.contains(&"224.0.0.0/4".to_string()) {
                    "multicast"
                } else if c.argv.contains(&"dst".to_string()) && c.argv.contains(&"RETURN".to_string()) {
                    "excluded_dst_set"
                } else if c.argv.contains(&"RETURN".to_string()) {
                    "excluded_port"
                } else {
                    "mark"
                }
            })
            .collect();
        assert_eq!(jump_targets, vec!["multicast", "excluded_dst_set", "excluded_port", "mark"]);
    }

    #[tokio::test]
    async fn apply_is_deterministic_across_runs() {
        let binding = base_binding();

        let executor_a = RecordingExecutor::new();
        IptablesRuleApplier::new(executor_a).apply(&[binding.clone()], &CancellationToken::new()).await.unwrap();
        let calls_a = {
            let applier = IptablesRuleApplier::new(RecordingExecutor::new());
            applier.apply(&[binding.clone()], &CancellationToken::new()).await.unwrap();
            applier.executor.calls()
        };
        let calls_b = {
            let applier = IptablesRuleApplier::new(RecordingExecutor::new());
            applier.apply(&[binding], &CancellationToken::new()).await.unwrap();
            applier.executor.calls()
        };
        assert_eq!(calls_a, calls_b);
    }

    #[tokio::test]
    async fn apply_deduplicates_nat_masquerade_per_mark_and_interface() {
        let executor = RecordingExecutor::new();
        let applier = IptablesRuleApplier::new(executor);
        let mut b1 = base_binding();
        b1.rule_index = 0;
        let mut b2 = base_binding();
        b2.rule_index = 1;

        applier.apply(&[b1, b2], &CancellationToken::new()).await.unwrap();

        let nat_calls = applier.executor.calls_matching(|c| c.argv.contains(&"MASQUERADE".to_string()));
        assert_eq!(nat_calls.len(), 1);
    }

    #[tokio::test]
    async fn flush_removes_both_generations_and_root_chains() {
        let executor = RecordingExecutor::new();
        let applier = IptablesRuleApplier::new(executor);
        applier.flush(&CancellationToken::new()).await.unwrap();

        let deletes = applier.executor.calls_matching(|c| c.argv.contains(&"-X".to_string()));
        let deleted_chains: HashSet<&String> = deletes.iter().map(|c| c.argv.last().unwrap()).collect();
        assert!(deleted_chains.contains(&"SVPN_MARK_A".to_string()));
        assert!(deleted_chains.contains(&"SVPN_MARK_B".to_string()));
        assert!(deleted_chains.contains(&"SVPN_MARK".to_string()));
        assert!(deleted_chains.contains(&"SVPN_NAT".to_string()));
    }
}
