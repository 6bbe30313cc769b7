//! Domain/ASN/Wildcard Resolvers: per-selector-type providers over HTTP
//! (spec.md §4.5). Grounded on `wirewarden-daemon/src/api.rs::fetch_config`'s
//! shape — a `reqwest::Client` held by the caller, one `#[tracing::instrument]`
//! function per call, an explicit status-code match rather than
//! `error_for_status`.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use svpn_types::ResolverValues;

/// Errors a resolver provider call can surface.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The HTTP request itself failed (connect, timeout, TLS, etc).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The upstream returned a non-200, non-tolerated status.
    #[error("upstream returned {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body, best-effort.
        body: String,
    },

    /// The response body could not be parsed as the expected shape.
    #[error("malformed response from {provider}: {detail}")]
    Malformed {
        /// Which provider produced the unparsable response.
        provider: &'static str,
        /// What went wrong.
        detail: String,
    },

    /// The call was cancelled via its [`CancellationToken`] before the
    /// upstream responded.
    #[error("{provider} resolution cancelled")]
    Cancelled {
        /// Which provider was in flight when cancellation fired.
        provider: &'static str,
    },
}

/// DNS-over-HTTPS JSON envelope (RFC 8427-ish `application/dns-json`).
#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
}

const DOH_TYPE_A: u16 = 1;
const DOH_TYPE_CNAME: u16 = 5;
const DOH_TYPE_AAAA: u16 = 28;
const DOH_STATUS_NOERROR: i32 = 0;
const DOH_STATUS_NXDOMAIN: i32 = 3;
const MAX_CNAME_TARGETS: usize = 5;

#[derive(Debug, Deserialize)]
struct AsnPrefixResponse {
    data: AsnPrefixData,
}

#[derive(Debug, Deserialize)]
struct AsnPrefixData {
    prefixes: Vec<AsnPrefixEntry>,
}

#[derive(Debug, Deserialize)]
struct AsnPrefixEntry {
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct CtLogEntry {
    name_value: String,
}

/// Configuration shared by all three HTTP-backed providers: endpoint URLs
/// and the per-request timeout (spec.md §4.5, §6 `resolver_timeout_seconds`).
#[derive(Debug, Clone)]
pub struct ResolverEndpoints {
    /// DNS-over-HTTPS JSON endpoint, e.g. `https://cloudflare-dns.com/dns-query`.
    pub doh_url: String,
    /// Announced-prefix service base, e.g. `https://stat.ripe.net/data/announced-prefixes/data.json`.
    pub asn_url: String,
    /// Certificate-transparency search endpoint, e.g. `https://crt.sh`.
    pub ct_url: String,
    /// Per-request timeout, bounded `[0s, 60s]` by the caller (0 coerces
    /// to the scheduler's default).
    pub timeout: Duration,
}

impl Default for ResolverEndpoints {
    fn default() -> Self {
        ResolverEndpoints {
            doh_url: "https://cloudflare-dns.com/dns-query".to_string(),
            asn_url: "https://stat.ripe.net/data/announced-prefixes/data.json".to_string(),
            ct_url: "https://crt.sh".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// The three selector-resolution capabilities the scheduler consumes
/// (spec.md §4.5). One trait bundling three operations, mirroring the
/// single-capability-trait-realized-by-prod-and-fake shape used
/// throughout this crate.
pub trait Resolvers: Send + Sync {
    /// Resolve a single domain to its A/AAAA addresses, following up to
    /// [`MAX_CNAME_TARGETS`] CNAME targets. Aborts in-flight HTTP requests
    /// on `token` cancellation (spec.md §7 "every externally-originated
    /// operation carries a cancellation token").
    fn resolve_domain(
        &self,
        domain: &str,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<ResolverValues, ResolverError>> + Send;

    /// Resolve an ASN's announced prefixes, bucketed by family.
    fn resolve_asn(
        &self,
        asn: &str,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<ResolverValues, ResolverError>> + Send;

    /// Discover the subdomains certificate-transparency logs have observed
    /// under `base` (e.g. `apple.com` for wildcard `*.apple.com`).
    fn resolve_wildcard(
        &self,
        base: &str,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<String>, ResolverError>> + Send;
}

/// Production [`Resolvers`] backed by `reqwest`.
pub struct HttpResolvers {
    client: reqwest::Client,
    endpoints: ResolverEndpoints,
}

impl HttpResolvers {
    /// Build a client honoring `endpoints.timeout` as the request timeout.
    pub fn new(endpoints: ResolverEndpoints) -> Result<Self, ResolverError> {
        let client = reqwest::Client::builder().timeout(endpoints.timeout).build()?;
        Ok(HttpResolvers { client, endpoints })
    }

    #[tracing::instrument(skip(self, token), fields(doh_url = %self.endpoints.doh_url))]
    async fn doh_query(&self, name: &str, rtype: &str, token: &CancellationToken) -> Result<DohResponse, ResolverError> {
        let request = self
            .client
            .get(&self.endpoints.doh_url)
            .header("accept", "application/dns-json")
            .query(&[("name", name), ("type", rtype)])
            .send();

        let resp = tokio::select! {
            result = request => result?,
            _ = token.cancelled() => return Err(ResolverError::Cancelled { provider: "doh" }),
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, name, rtype, "DoH endpoint returned non-200");
            return Err(ResolverError::Upstream { status, body });
        }

        let parsed: DohResponse = resp
            .json()
            .await
            .map_err(|e| ResolverError::Malformed { provider: "doh", detail: e.to_string() })?;
        Ok(parsed)
    }
}

impl Resolvers for HttpResolvers {
    #[tracing::instrument(skip(self, token), fields(domain))]
    async fn resolve_domain(&self, domain: &str, token: &CancellationToken) -> Result<ResolverValues, ResolverError> {
        debug!(domain, "resolving domain via DoH");

        let cname = self.doh_query(domain, "CNAME", token).await?;
        let mut targets: Vec<String> = cname
            .answer
            .iter()
            .filter(|a| a.rtype == DOH_TYPE_CNAME)
            .map(|a| a.data.trim_end_matches('.').to_string())
            .take(MAX_CNAME_TARGETS)
            .collect();
        if !targets.contains(&domain.to_string()) {
            targets.insert(0, domain.to_string());
        }

        let mut values = ResolverValues::default();
        for target in &targets {
            for rtype in ["A", "AAAA"] {
                let resp = match self.doh_query(target, rtype, token).await {
                    Ok(r) => r,
                    Err(e) => return Err(e),
                };
                if resp.status != DOH_STATUS_NOERROR && resp.status != DOH_STATUS_NXDOMAIN {
                    return Err(ResolverError::Upstream {
                        status: resp.status as u16,
                        body: format!("DoH status {} for {target} {rtype}", resp.status),
                    });
                }
                for answer in &resp.answer {
                    match answer.rtype {
                        DOH_TYPE_A if rtype == "A" => values.v4.push(format!("{}/32", answer.data)),
                        DOH_TYPE_AAAA if rtype == "AAAA" => values.v6.push(format!("{}/128", answer.data)),
                        _ => {}
                    }
                }
            }
        }
        values.v4.dedup();
        values.v6.dedup();
        Ok(values)
    }

    #[tracing::instrument(skip(self, token), fields(asn))]
    async fn resolve_asn(&self, asn: &str, token: &CancellationToken) -> Result<ResolverValues, ResolverError> {
        debug!(asn, "resolving ASN announced prefixes");
        let numeric = asn.trim_start_matches("AS").trim_start_matches("as");
        let request = self
            .client
            .get(&self.endpoints.asn_url)
            .query(&[("resource", format!("AS{numeric}"))])
            .send();

        let resp = tokio::select! {
            result = request => result?,
            _ = token.cancelled() => return Err(ResolverError::Cancelled { provider: "asn" }),
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ResolverError::Upstream { status, body });
        }

        let parsed: AsnPrefixResponse = resp
            .json()
            .await
            .map_err(|e| ResolverError::Malformed { provider: "asn", detail: e.to_string() })?;

        let mut values = ResolverValues::default();
        for entry in parsed.data.prefixes {
            match entry.prefix.parse::<ipnetwork::IpNetwork>() {
                Ok(ipnetwork::IpNetwork::V4(net)) => values.v4.push(net.to_string()),
                Ok(ipnetwork::IpNetwork::V6(net)) => values.v6.push(net.to_string()),
                Err(_) => warn!(prefix = %entry.prefix, "skipping unparsable announced prefix"),
            }
        }
        Ok(values)
    }

    #[tracing::instrument(skip(self, token), fields(base))]
    async fn resolve_wildcard(&self, base: &str, token: &CancellationToken) -> Result<Vec<String>, ResolverError> {
        debug!(base, "discovering subdomains via certificate transparency");
        let request = self
            .client
            .get(format!("{}/", self.endpoints.ct_url.trim_end_matches('/')))
            .query(&[("q", format!("%.{base}")), ("output".to_string(), "json".to_string())])
            .send();

        let resp = tokio::select! {
            result = request => result?,
            _ = token.cancelled() => return Err(ResolverError::Cancelled { provider: "ct_log" }),
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ResolverError::Upstream { status, body });
        }

        let entries: Vec<CtLogEntry> = resp
            .json()
            .await
            .map_err(|e| ResolverError::Malformed { provider: "ct_log", detail: e.to_string() })?;

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            for line in entry.name_value.lines() {
                let candidate = line.trim().trim_start_matches("*.").to_lowercase();
                if candidate == base || candidate.ends_with(&format!(".{base}")) {
                    if !names.contains(&candidate) {
                        names.push(candidate);
                    }
                } else if line.trim().to_lowercase() == base {
                    if !names.contains(&line.trim().to_lowercase()) {
                        names.push(line.trim().to_lowercase());
                    }
                }
            }
        }
        if names.is_empty() {
            names.push(base.to_string());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Scripted [`Resolvers`] double used by scheduler and manager tests, the
/// same recording/scripting shape as [`crate::executor::RecordingExecutor`].
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FakeResolvers {
    domains: std::sync::Mutex<std::collections::HashMap<String, ResolverValues>>,
    asns: std::sync::Mutex<std::collections::HashMap<String, ResolverValues>>,
    wildcards: std::sync::Mutex<std::collections::HashMap<String, Vec<String>>>,
    failing: std::sync::Mutex<std::collections::HashSet<String>>,
    /// Keys that sleep for the given duration before resolving, letting
    /// tests race cancellation against an in-flight job.
    delays: std::sync::Mutex<std::collections::HashMap<String, Duration>>,
}

#[cfg(test)]
impl FakeResolvers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_domain(&self, domain: &str, values: ResolverValues) {
        self.domains.lock().unwrap().insert(domain.to_string(), values);
    }

    pub(crate) fn script_asn(&self, asn: &str, values: ResolverValues) {
        self.asns.lock().unwrap().insert(asn.to_string(), values);
    }

    pub(crate) fn script_wildcard(&self, base: &str, domains: Vec<String>) {
        self.wildcards.lock().unwrap().insert(base.to_string(), domains);
    }

    pub(crate) fn script_delay(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub(crate) fn fail(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }
}

#[cfg(test)]
impl Resolvers for FakeResolvers {
    async fn resolve_domain(&self, domain: &str, token: &CancellationToken) -> Result<ResolverValues, ResolverError> {
        if token.is_cancelled() {
            return Err(ResolverError::Cancelled { provider: "doh" });
        }
        if let Some(delay) = self.delays.lock().unwrap().get(domain).copied() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return Err(ResolverError::Cancelled { provider: "doh" }),
            }
        }
        if self.failing.lock().unwrap().contains(domain) {
            return Err(ResolverError::Upstream { status: 500, body: "scripted failure".to_string() });
        }
        Ok(self.domains.lock().unwrap().get(domain).cloned().unwrap_or_default())
    }

    async fn resolve_asn(&self, asn: &str, token: &CancellationToken) -> Result<ResolverValues, ResolverError> {
        if token.is_cancelled() {
            return Err(ResolverError::Cancelled { provider: "asn" });
        }
        if self.failing.lock().unwrap().contains(asn) {
            return Err(ResolverError::Upstream { status: 500, body: "scripted failure".to_string() });
        }
        Ok(self.asns.lock().unwrap().get(asn).cloned().unwrap_or_default())
    }

    async fn resolve_wildcard(&self, base: &str, token: &CancellationToken) -> Result<Vec<String>, ResolverError> {
        if token.is_cancelled() {
            return Err(ResolverError::Cancelled { provider: "ct_log" });
        }
        if self.failing.lock().unwrap().contains(base) {
            return Err(ResolverError::Upstream { status: 500, body: "scripted failure".to_string() });
        }
        Ok(self.wildcards.lock().unwrap().get(base).cloned().unwrap_or_else(|| vec![base.to_string()]))
    }
}
