//! Resolver cache data model: selectors, resolved values, and run records.

use serde::{Deserialize, Serialize};

/// The kind of selector a resolver run resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    /// Exact domain name, resolved via DNS-over-HTTPS.
    Domain,
    /// Autonomous system number, resolved via an announced-prefix service.
    Asn,
    /// Wildcard domain, resolved via certificate-transparency discovery
    /// followed by per-subdomain DNS resolution.
    Wildcard,
}

impl SelectorKind {
    /// The serialized lowercase name, also used to order kinds
    /// alphabetically (`asn` < `domain` < `wildcard`).
    fn as_str(&self) -> &'static str {
        match self {
            SelectorKind::Domain => "domain",
            SelectorKind::Asn => "asn",
            SelectorKind::Wildcard => "wildcard",
        }
    }
}

impl PartialOrd for SelectorKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SelectorKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// `{type, key}` — a normalized resolver job identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResolverSelector {
    /// Which provider resolves this selector.
    pub kind: SelectorKind,
    /// The normalized key (lowercase domain without trailing dot,
    /// canonical `AS<n>`, or `*.<base>` wildcard).
    pub key: String,
}

impl ResolverSelector {
    /// Construct a selector from an already-normalized key.
    pub fn new(kind: SelectorKind, key: String) -> Self {
        ResolverSelector { kind, key }
    }
}

/// Resolved CIDR lists, split by address family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverValues {
    /// IPv4 canonical prefixes (`ip/len`, host = `/32`).
    pub v4: Vec<String>,
    /// IPv6 canonical prefixes (`ip/len`, host = `/128`).
    pub v6: Vec<String>,
}

impl ResolverValues {
    /// Merge `other` into `self`, deduplicating but not re-sorting
    /// (callers that need sorted/collapsed output should run the prefix
    /// aggregator over the result).
    pub fn merge(&mut self, other: &ResolverValues) {
        for entry in &other.v4 {
            if !self.v4.contains(entry) {
                self.v4.push(entry.clone());
            }
        }
        for entry in &other.v6 {
            if !self.v6.contains(entry) {
                self.v6.push(entry.clone());
            }
        }
    }

    /// Total prefix count across both families.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// True if there are no prefixes in either family.
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// One resolver-cache row: a selector's resolved values and freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverCacheRow {
    /// The resolved selector.
    pub selector: ResolverSelector,
    /// Its resolved CIDR values.
    pub values: ResolverValues,
    /// Epoch seconds this row was last (re)written.
    pub updated_at: i64,
}

/// One pre-warm-cache row: externally-sourced additive contribution to a
/// concrete address set, keyed by the set's kernel name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmRow {
    /// The concrete address-set name this row contributes to.
    pub set_name: String,
    /// Contributed CIDR values.
    pub values: ResolverValues,
    /// Epoch seconds this row was last (re)written.
    pub updated_at: i64,
}

/// A record of one resolver scheduler run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverRunRecord {
    /// Store-assigned id.
    pub id: i64,
    /// Epoch seconds the run began.
    pub started_at: i64,
    /// Epoch seconds the run finished, if it did.
    pub finished_at: Option<i64>,
    /// Wall-clock duration in milliseconds, if finished.
    pub duration_ms: Option<i64>,
    /// Total selectors dispatched.
    pub selectors_total: i32,
    /// Selectors completed (success or failure) before the run ended.
    pub selectors_done: i32,
    /// Total prefixes resolved (union of v4+v6 across all jobs).
    pub prefixes_resolved: i32,
    /// The first job error encountered, if the run failed.
    pub error: Option<String>,
}
