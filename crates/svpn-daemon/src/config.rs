//! On-disk configuration for the `svpn-daemon` binary. Grounded on
//! `wirewarden-daemon/src/config.rs::{load, save}` — missing file means
//! defaults, not an error; `toml` + `tokio::fs` for read/write.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_DATABASE_PATH: &str = "/var/lib/svpn/svpn.db";
const DEFAULT_DNS_HINT_PATH: &str = "/etc/svpn/dns-hints.conf";
const DEFAULT_RESOLVER_INTERVAL_SECS: u64 = 3600;
const DEFAULT_RESOLVER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESOLVER_PARALLELISM: usize = 6;
const DEFAULT_CACHE_RETENTION_DAYS: i64 = 7;
const DEFAULT_STATS_RETENTION_DAYS: i64 = 7;
const MAX_RESOLVER_INTERVAL_SECS: u64 = 86_400;
const MIN_RESOLVER_TIMEOUT_SECS: u64 = 1;
const MAX_RESOLVER_TIMEOUT_SECS: u64 = 60;
const MAX_RESOLVER_PARALLELISM: usize = 64;

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_string()
}

fn default_dns_hint_path() -> String {
    DEFAULT_DNS_HINT_PATH.to_string()
}

fn default_resolver_interval() -> u64 {
    DEFAULT_RESOLVER_INTERVAL_SECS
}

fn default_resolver_timeout() -> u64 {
    DEFAULT_RESOLVER_TIMEOUT_SECS
}

fn default_resolver_parallelism() -> usize {
    DEFAULT_RESOLVER_PARALLELISM
}

fn default_doh_endpoint() -> String {
    "https://cloudflare-dns.com/dns-query".to_string()
}

fn default_asn_endpoint() -> String {
    "https://stat.ripe.net/data/announced-prefixes/data.json".to_string()
}

fn default_ct_endpoint() -> String {
    "https://crt.sh".to_string()
}

fn default_cache_retention_days() -> i64 {
    DEFAULT_CACHE_RETENTION_DAYS
}

fn default_stats_retention_days() -> i64 {
    DEFAULT_STATS_RETENTION_DAYS
}

fn default_dns_reload_command() -> Vec<String> {
    vec!["systemctl".to_string(), "reload".to_string(), "unbound".to_string()]
}

/// A known egress VPN profile, loaded from the config file (spec.md §3
/// "EgressVPN (external)"; this daemon treats VPN lifecycle as
/// externally owned, so profiles are a fixed, read-only list here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressVpnEntry {
    /// Unique VPN name.
    pub name: String,
    /// Kernel interface name.
    pub interface_name: String,
    /// Firewall mark, `>= 200` to be usable.
    pub fw_mark: u32,
    /// Policy-routing table, `>= 200` to be usable.
    pub route_table: i32,
}

/// Top-level `svpn-daemon` configuration file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvpnConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Path the DNS hint file is written to.
    #[serde(default = "default_dns_hint_path")]
    pub dns_hint_path: String,

    /// Seconds between periodic resolver runs, `[0, 86400]`.
    #[serde(default = "default_resolver_interval")]
    pub resolver_interval_seconds: u64,

    /// Per-request resolver HTTP timeout in seconds, `[1, 60]`.
    #[serde(default = "default_resolver_timeout")]
    pub resolver_timeout_seconds: u64,

    /// Resolver worker-pool size, `[1, 64]`; `0` coerces to the default.
    #[serde(default = "default_resolver_parallelism")]
    pub resolver_parallelism: usize,

    /// DNS-over-HTTPS endpoint for the domain resolver.
    #[serde(default = "default_doh_endpoint")]
    pub resolver_doh_endpoint: String,

    /// Announced-prefix service endpoint for the ASN resolver.
    #[serde(default = "default_asn_endpoint")]
    pub resolver_asn_endpoint: String,

    /// Certificate-transparency search endpoint for the wildcard resolver.
    #[serde(default = "default_ct_endpoint")]
    pub resolver_ct_endpoint: String,

    /// Days resolver/pre-warm cache rows are retained before expiry.
    #[serde(default = "default_cache_retention_days")]
    pub cache_retention_days: i64,

    /// Days `stats_history` rows are retained before pruning.
    #[serde(default = "default_stats_retention_days")]
    pub stats_retention_days: i64,

    /// Argv used to reload the recursive resolver after writing hints.
    #[serde(default = "default_dns_reload_command")]
    pub dns_reload_command: Vec<String>,

    /// Known egress VPN profiles.
    #[serde(default)]
    pub egress_vpns: Vec<EgressVpnEntry>,
}

impl Default for SvpnConfig {
    fn default() -> Self {
        SvpnConfig {
            database_path: default_database_path(),
            dns_hint_path: default_dns_hint_path(),
            resolver_interval_seconds: default_resolver_interval(),
            resolver_timeout_seconds: default_resolver_timeout(),
            resolver_parallelism: default_resolver_parallelism(),
            resolver_doh_endpoint: default_doh_endpoint(),
            resolver_asn_endpoint: default_asn_endpoint(),
            resolver_ct_endpoint: default_ct_endpoint(),
            cache_retention_days: default_cache_retention_days(),
            stats_retention_days: default_stats_retention_days(),
            dns_reload_command: default_dns_reload_command(),
            egress_vpns: Vec::new(),
        }
    }
}

/// Errors from loading, saving, or validating [`SvpnConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    /// The config file's contents were not valid TOML for this shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized back to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field was out of its allowed range.
    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        /// Offending field name.
        field: &'static str,
        /// Lower bound, inclusive.
        min: i64,
        /// Upper bound, inclusive.
        max: i64,
        /// The value that failed validation.
        value: i64,
    },

    /// Two egress VPN entries share a name.
    #[error("duplicate egress VPN name: {0}")]
    DuplicateEgressVpn(String),
}

/// Load `path`, falling back to [`SvpnConfig::default`] if it does not
/// exist (spec.md-adjacent "missing file is not an error", matching
/// `wirewarden-daemon::config::load`).
pub async fn load(path: &Path) -> Result<SvpnConfig, ConfigError> {
    debug!(path = %path.display(), "loading config");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: SvpnConfig = toml::from_str(&contents)?;
            validate(&config)?;
            info!(path = %path.display(), vpn_count = config.egress_vpns.len(), "loaded config");
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, using defaults");
            Ok(SvpnConfig::default())
        }
        Err(e) => Err(ConfigError::Read(e)),
    }
}

/// Write `config` to `path`, creating parent directories as needed.
pub async fn save(path: &Path, config: &SvpnConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = toml::to_string_pretty(config)?;
    tokio::fs::write(path, contents).await?;
    info!(path = %path.display(), "saved config");
    Ok(())
}

/// Validate bounds and uniqueness before any of `config`'s values are
/// used to construct the reconciler/scheduler (mirrors
/// `wirewarden-daemon::config::validate_new_entry`'s typed-error-before-
/// any-state-change pattern).
pub fn validate(config: &SvpnConfig) -> Result<(), ConfigError> {
    if config.resolver_interval_seconds > MAX_RESOLVER_INTERVAL_SECS {
        return Err(ConfigError::OutOfRange {
            field: "resolver_interval_seconds",
            min: 0,
            max: MAX_RESOLVER_INTERVAL_SECS as i64,
            value: config.resolver_interval_seconds as i64,
        });
    }
    if config.resolver_timeout_seconds != 0
        && !(MIN_RESOLVER_TIMEOUT_SECS..=MAX_RESOLVER_TIMEOUT_SECS).contains(&config.resolver_timeout_seconds)
    {
        return Err(ConfigError::OutOfRange {
            field: "resolver_timeout_seconds",
            min: MIN_RESOLVER_TIMEOUT_SECS as i64,
            max: MAX_RESOLVER_TIMEOUT_SECS as i64,
            value: config.resolver_timeout_seconds as i64,
        });
    }
    if config.resolver_parallelism > MAX_RESOLVER_PARALLELISM {
        return Err(ConfigError::OutOfRange {
            field: "resolver_parallelism",
            min: 0,
            max: MAX_RESOLVER_PARALLELISM as i64,
            value: config.resolver_parallelism as i64,
        });
    }

    let mut seen = std::collections::HashSet::new();
    for vpn in &config.egress_vpns {
        if !seen.insert(vpn.name.as_str()) {
            return Err(ConfigError::DuplicateEgressVpn(vpn.name.clone()));
        }
    }

    Ok(())
}

/// Resolve the configured resolver HTTP timeout into scheduler-bound
/// seconds, applying the `0` (=> default) coercion spec.md §6 specifies
/// at the config layer rather than inside [`svpn_reconciler::ResolverSettings`].
pub fn effective_resolver_timeout_seconds(config: &SvpnConfig) -> u64 {
    if config.resolver_timeout_seconds == 0 {
        DEFAULT_RESOLVER_TIMEOUT_SECS
    } else {
        config.resolver_timeout_seconds
    }
}

/// The DNS reload command as the `(name, argv)` pair the Command
/// Executor / DNS hint emitter expect.
pub fn dns_reload_command(config: &SvpnConfig) -> (String, Vec<String>) {
    let mut parts = config.dns_reload_command.clone();
    if parts.is_empty() {
        parts = default_dns_reload_command();
    }
    let name = parts.remove(0);
    (name, parts)
}

/// The configured DNS hint file path.
pub fn dns_hint_path(config: &SvpnConfig) -> PathBuf {
    PathBuf::from(&config.dns_hint_path)
}
