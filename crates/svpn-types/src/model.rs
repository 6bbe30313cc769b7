//! Declarative data model: domain groups, routing rules, and selectors.

use serde::{Deserialize, Serialize};

use crate::canon;
use crate::errors::ValidationError;
use crate::resolver::{ResolverSelector, SelectorKind};

/// A named binding of one or more [`RoutingRule`]s to a single egress VPN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainGroup {
    /// Stable integer id assigned by the store.
    pub id: i64,
    /// Unique, case-sensitive name (`^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$`).
    pub name: String,
    /// Name of the [`crate::vpn::EgressVpn`] this group's traffic egresses through.
    pub egress_vpn: String,
    /// Creation time, epoch seconds.
    pub created_at: i64,
    /// Last update time, epoch seconds.
    pub updated_at: i64,
    /// Ordered rule list (position ascending).
    pub rules: Vec<RoutingRule>,
}

/// Transport protocol for a port selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
    /// Both TCP and UDP (expands into one rule per protocol at apply time).
    Both,
}

impl Protocol {
    /// True if `self` and `other` name at least one protocol in common.
    pub fn overlaps(&self, other: Protocol) -> bool {
        matches!(
            (self, other),
            (Protocol::Both, _)
                | (_, Protocol::Both)
                | (Protocol::Tcp, Protocol::Tcp)
                | (Protocol::Udp, Protocol::Udp)
        )
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            other => Err(ValidationError::InvalidPortRange(
                other.parse().unwrap_or(0),
                0,
            )),
        }
    }
}

/// A destination port range selector: `{protocol, start..=end}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Transport protocol this range applies to.
    pub protocol: Protocol,
    /// Inclusive range start, 1..=65535.
    pub start: u16,
    /// Inclusive range end, >= start.
    pub end: u16,
}

impl Port {
    /// Build a port range, validating bounds.
    pub fn new(protocol: Protocol, start: u16, end: u16) -> Result<Self, ValidationError> {
        if start == 0 || end < start {
            return Err(ValidationError::InvalidPortRange(start as u32, end as u32));
        }
        Ok(Port { protocol, start, end })
    }

    /// True if this range's protocol overlaps `other`'s and the port
    /// ranges intersect.
    pub fn overlaps(&self, other: &Port) -> bool {
        self.protocol.overlaps(other.protocol) && self.start <= other.end && other.start <= self.end
    }
}

/// Ternary "exclude multicast" attribute: absent means `true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludeMulticast(pub Option<bool>);

impl ExcludeMulticast {
    /// Resolve the ternary to its effective boolean (absent => true).
    pub fn effective(&self) -> bool {
        self.0.unwrap_or(true)
    }
}

/// Which typed child-table / selector kind a [`RawSelectorLine`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawSelectorKind {
    /// `routing_rule_source_interfaces`
    SourceInterface,
    /// `routing_rule_source_macs`
    SourceMac,
    /// `routing_rule_source_cidrs`
    SourceCidr,
    /// `routing_rule_excluded_source_cidrs`
    ExcludedSourceCidr,
    /// `routing_rule_destination_cidrs`
    DestinationCidr,
    /// `routing_rule_excluded_destination_cidrs`
    ExcludedDestinationCidr,
    /// `routing_rule_ports`
    DestinationPort,
    /// `routing_rule_excluded_ports`
    ExcludedDestinationPort,
    /// `routing_rule_asns`
    DestinationAsn,
    /// `routing_rule_excluded_asns`
    ExcludedDestinationAsn,
    /// `routing_rule_domains` with `is_wildcard = false`
    ExactDomain,
    /// `routing_rule_domains` with `is_wildcard = true`
    WildcardDomain,
}

/// One exact-user-entered selector line, source of truth for round-tripping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSelectorLine {
    /// Which selector table this line normalizes into.
    pub kind: RawSelectorKind,
    /// The exact text the user typed, including any `#comment` suffix or
    /// leading `#` that disables the line entirely.
    pub line: String,
    /// Position within its kind's line list.
    pub position: i32,
}

impl RawSelectorLine {
    /// The selector value with any trailing `#comment` stripped, or `None`
    /// if the line is wholly disabled (leading `#`, or blank).
    pub fn effective_value(&self) -> Option<&str> {
        let trimmed = self.line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let value = match trimmed.split_once('#') {
            Some((before, _comment)) => before.trim(),
            None => trimmed,
        };
        if value.is_empty() { None } else { Some(value) }
    }
}

/// An ordered predicate within a [`DomainGroup`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Stable integer id assigned by the store.
    pub id: i64,
    /// Position within the owning group's rule list (0-based).
    pub position: i32,
    /// Source interface names, lowercased.
    pub source_interfaces: Vec<String>,
    /// Source MAC addresses, canonical lowercase colon form.
    pub source_macs: Vec<String>,
    /// Source CIDRs (IPv4/IPv6), canonical network form.
    pub source_cidrs: Vec<String>,
    /// Excluded source CIDRs.
    pub excluded_source_cidrs: Vec<String>,
    /// Destination CIDRs.
    pub destination_cidrs: Vec<String>,
    /// Excluded destination CIDRs.
    pub excluded_destination_cidrs: Vec<String>,
    /// Destination port ranges.
    pub destination_ports: Vec<Port>,
    /// Excluded destination port ranges.
    pub excluded_destination_ports: Vec<Port>,
    /// Destination ASNs, canonical `AS<n>` form.
    pub destination_asns: Vec<String>,
    /// Excluded destination ASNs.
    pub excluded_destination_asns: Vec<String>,
    /// Exact domain names.
    pub exact_domains: Vec<String>,
    /// Wildcard domain base names (without the `*.` prefix).
    pub wildcard_domains: Vec<String>,
    /// Ternary multicast exclusion.
    pub exclude_multicast: ExcludeMulticast,
    /// User-entered raw selector lines, source of truth for round-tripping.
    pub raw_selectors: Option<Vec<RawSelectorLine>>,
}

impl RoutingRule {
    /// True when this rule has no selectors at all (a comment-only line
    /// group): the reconciler skips such rules entirely.
    pub fn is_comment_only(&self) -> bool {
        self.source_interfaces.is_empty()
            && self.source_macs.is_empty()
            && self.source_cidrs.is_empty()
            && self.excluded_source_cidrs.is_empty()
            && self.destination_cidrs.is_empty()
            && self.excluded_destination_cidrs.is_empty()
            && self.destination_ports.is_empty()
            && self.excluded_destination_ports.is_empty()
            && self.destination_asns.is_empty()
            && self.excluded_destination_asns.is_empty()
            && self.exact_domains.is_empty()
            && self.wildcard_domains.is_empty()
    }

    /// Whether a source address set should exist for this rule.
    pub fn has_source(&self) -> bool {
        !self.source_cidrs.is_empty()
    }

    /// Whether a destination address set should exist for this rule
    /// (static CIDRs or anything that resolves into CIDRs at apply time).
    pub fn has_destination(&self) -> bool {
        !self.destination_cidrs.is_empty()
            || !self.exact_domains.is_empty()
            || !self.wildcard_domains.is_empty()
            || !self.destination_asns.is_empty()
    }

    /// Whether an excluded-source address set should exist.
    pub fn has_excluded_source(&self) -> bool {
        !self.excluded_source_cidrs.is_empty()
    }

    /// Whether an excluded-destination address set should exist.
    pub fn has_excluded_destination(&self) -> bool {
        !self.excluded_destination_cidrs.is_empty()
    }

    /// Collect the deduplicated set of resolver selectors this rule
    /// contributes to a resolver run's job list.
    pub fn resolver_selectors(&self) -> Vec<ResolverSelector> {
        let mut out = Vec::new();
        for domain in &self.exact_domains {
            out.push(ResolverSelector::new(SelectorKind::Domain, domain.clone()));
        }
        for base in &self.wildcard_domains {
            out.push(ResolverSelector::new(
                SelectorKind::Wildcard,
                format!("*.{base}"),
            ));
        }
        for asn in &self.destination_asns {
            out.push(ResolverSelector::new(SelectorKind::Asn, asn.clone()));
        }
        out
    }

    /// Rebuild the normalized selector vectors of `self` from
    /// `raw_selectors`, validating and canonicalizing each effective line.
    /// Disabled/comment-only lines are skipped but remain in
    /// `raw_selectors` for round-tripping.
    pub fn normalize_from_raw(&mut self) -> Result<(), ValidationError> {
        let Some(lines) = self.raw_selectors.clone() else {
            return Ok(());
        };

        self.source_interfaces.clear();
        self.source_macs.clear();
        self.source_cidrs.clear();
        self.excluded_source_cidrs.clear();
        self.destination_cidrs.clear();
        self.excluded_destination_cidrs.clear();
        self.destination_ports.clear();
        self.excluded_destination_ports.clear();
        self.destination_asns.clear();
        self.excluded_destination_asns.clear();
        self.exact_domains.clear();
        self.wildcard_domains.clear();

        for raw in &lines {
            let Some(value) = raw.effective_value() else {
                continue;
            };
            match raw.kind {
                RawSelectorKind::SourceInterface => {
                    self.source_interfaces.push(canon::normalize_interface(value)?)
                }
                RawSelectorKind::SourceMac => self.source_macs.push(canon::normalize_mac(value)?),
                RawSelectorKind::SourceCidr => {
                    self.source_cidrs.push(canon::canonicalize_cidr(value)?)
                }
                RawSelectorKind::ExcludedSourceCidr => self
                    .excluded_source_cidrs
                    .push(canon::canonicalize_cidr(value)?),
                RawSelectorKind::DestinationCidr => {
                    self.destination_cidrs.push(canon::canonicalize_cidr(value)?)
                }
                RawSelectorKind::ExcludedDestinationCidr => self
                    .excluded_destination_cidrs
                    .push(canon::canonicalize_cidr(value)?),
                RawSelectorKind::DestinationPort => {
                    self.destination_ports.push(parse_port_selector(value)?)
                }
                RawSelectorKind::ExcludedDestinationPort => self
                    .excluded_destination_ports
                    .push(parse_port_selector(value)?),
                RawSelectorKind::DestinationAsn => {
                    self.destination_asns.push(canon::normalize_asn(value)?)
                }
                RawSelectorKind::ExcludedDestinationAsn => self
                    .excluded_destination_asns
                    .push(canon::normalize_asn(value)?),
                RawSelectorKind::ExactDomain => self.exact_domains.push(canon::normalize_domain(value)?),
                RawSelectorKind::WildcardDomain => self
                    .wildcard_domains
                    .push(canon::normalize_wildcard_base(value)?),
            }
        }

        Ok(())
    }
}

/// Parse `"tcp:80-443"`, `"udp:53"`, or `"both:1000-2000"` into a [`Port`].
fn parse_port_selector(value: &str) -> Result<Port, ValidationError> {
    let (proto_str, range_str) = value
        .split_once(':')
        .ok_or_else(|| ValidationError::InvalidPortRange(0, 0))?;
    let protocol: Protocol = proto_str.parse()?;
    let (start, end) = match range_str.split_once('-') {
        Some((s, e)) => (
            s.parse().map_err(|_| ValidationError::InvalidPortRange(0, 0))?,
            e.parse().map_err(|_| ValidationError::InvalidPortRange(0, 0))?,
        ),
        None => {
            let port: u16 = range_str
                .parse()
                .map_err(|_| ValidationError::InvalidPortRange(0, 0))?;
            (port, port)
        }
    };
    Port::new(protocol, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_multicast_default_true() {
        assert!(ExcludeMulticast(None).effective());
        assert!(!ExcludeMulticast(Some(false)).effective());
    }

    #[test]
    fn port_overlap_both_matches_tcp_and_udp() {
        let both = Port::new(Protocol::Both, 1, 100).unwrap();
        let tcp = Port::new(Protocol::Tcp, 50, 60).unwrap();
        let udp = Port::new(Protocol::Udp, 200, 300).unwrap();
        assert!(both.overlaps(&tcp));
        assert!(!both.overlaps(&udp)); // ranges don't intersect
    }

    #[test]
    fn port_new_rejects_inverted_range() {
        assert!(Port::new(Protocol::Tcp, 100, 50).is_err());
        assert!(Port::new(Protocol::Tcp, 0, 50).is_err());
    }

    #[test]
    fn raw_selector_effective_value_strips_comment() {
        let line = RawSelectorLine {
            kind: RawSelectorKind::ExactDomain,
            line: "example.com # streaming".to_string(),
            position: 0,
        };
        assert_eq!(line.effective_value(), Some("example.com"));
    }

    #[test]
    fn raw_selector_disabled_line_is_none() {
        let line = RawSelectorLine {
            kind: RawSelectorKind::ExactDomain,
            line: "# example.com".to_string(),
            position: 0,
        };
        assert_eq!(line.effective_value(), None);
    }

    #[test]
    fn normalize_from_raw_populates_structured_fields() {
        let mut rule = RoutingRule {
            raw_selectors: Some(vec![
                RawSelectorLine {
                    kind: RawSelectorKind::ExactDomain,
                    line: "Max.com".to_string(),
                    position: 0,
                },
                RawSelectorLine {
                    kind: RawSelectorKind::WildcardDomain,
                    line: "*.Apple.com".to_string(),
                    position: 1,
                },
                RawSelectorLine {
                    kind: RawSelectorKind::DestinationPort,
                    line: "udp:5353".to_string(),
                    position: 2,
                },
            ]),
            ..Default::default()
        };
        rule.normalize_from_raw().unwrap();
        assert_eq!(rule.exact_domains, vec!["max.com"]);
        assert_eq!(rule.wildcard_domains, vec!["apple.com"]);
        assert_eq!(rule.destination_ports, vec![Port::new(Protocol::Udp, 5353, 5353).unwrap()]);
    }

    #[test]
    fn is_comment_only_true_for_empty_rule() {
        assert!(RoutingRule::default().is_comment_only());
    }
}
