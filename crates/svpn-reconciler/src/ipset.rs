//! Address-Set Operator: create/flush/add/swap/destroy/list named kernel
//! address sets over the Command Executor (spec.md §4.3). Grounded on
//! `wirewarden-daemon/src/netlink.rs::linux`'s shape — thin wrapper
//! functions per operation, one error type per call — generalized from
//! WireGuard device/peer calls to `ipset` invocations.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use svpn_types::Family;

use crate::executor::{CommandExecutor, ExecutorError};

/// Default entry timeout (seconds) for addresses added to a set
/// (spec.md §4.3: "24-hour default entry timeout").
pub const DEFAULT_ENTRY_TIMEOUT_SECS: u32 = 86_400;

/// Kernel address-set name prefix this system owns exclusively; it never
/// destroys or flushes a set without this prefix (spec.md §5).
pub const SET_NAME_PREFIX: &str = "svpn_";

/// Which selector role an address set backs, used to build its kernel
/// name (spec.md §4.3 naming scheme).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRole {
    /// Rule source CIDRs.
    Source,
    /// Rule destination CIDRs (plus resolved domain/wildcard/ASN/pre-warm
    /// contributions).
    Destination,
    /// Excluded source CIDRs.
    ExcludedSource,
    /// Excluded destination CIDRs.
    ExcludedDestination,
}

impl SetRole {
    fn code(&self) -> &'static str {
        match self {
            SetRole::Source => "s",
            SetRole::Destination => "d",
            SetRole::ExcludedSource => "xs",
            SetRole::ExcludedDestination => "xd",
        }
    }
}

/// Errors the address-set operator can surface.
#[derive(Debug, Error)]
pub enum IpsetError {
    /// The underlying command invocation failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// A computed or user-supplied set name is invalid
    /// (`^[A-Za-z0-9_.:-]+$`, <= 31 chars).
    #[error("invalid address-set name: {0}")]
    InvalidName(String),
}

/// Lowercase a group name into the `<base>` component of an address-set
/// name: non-alphanumerics collapse to `_`, repeats collapse, and the
/// result is trimmed of leading/trailing `_` (spec.md §4.3).
pub fn slug_base(group_name: &str) -> String {
    let mut out = String::with_capacity(group_name.len());
    let mut last_was_underscore = false;
    for c in group_name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// FNV-1a 32-bit hash, used to disambiguate truncated address-set names.
fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Build the deterministic per-rule, per-family address-set name:
/// `svpn_<base>_r<rule_number>{s|d|xs|xd}{4|6}`, truncating `<base>` and
/// appending an 8-hex FNV32a suffix when the name would exceed the
/// kernel's 31-character `ipset` name limit (spec.md §3, §4.3).
///
/// `rule_number` is 1-based (the rule's position within its group, plus
/// one).
pub fn rule_set_name(base: &str, rule_number: usize, role: SetRole, family: Family) -> String {
    let suffix = format!("_r{rule_number}{}{}", role.code(), family.name_suffix());
    build_name(base, &suffix)
}

fn build_name(base: &str, suffix: &str) -> String {
    let full = format!("{SET_NAME_PREFIX}{base}{suffix}");
    if full.len() <= 31 {
        return full;
    }
    let hash_suffix = format!("_{:08x}", fnv1a32(base.as_bytes()));
    let reserved = SET_NAME_PREFIX.len() + suffix.len() + hash_suffix.len();
    let available = 31usize.saturating_sub(reserved);
    let truncated_base: String = base.chars().take(available).collect();
    format!("{SET_NAME_PREFIX}{truncated_base}{suffix}{hash_suffix}")
}

/// A name valid for `ipset create`: `^[A-Za-z0-9_.:-]+$`, <= 31 chars.
pub fn validate_name(name: &str) -> Result<(), IpsetError> {
    let valid = !name.is_empty()
        && name.len() <= 31
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(IpsetError::InvalidName(name.to_string()))
    }
}

/// Build a staged sibling name for an atomic swap (`<name>_n`), itself
/// subject to the same 31-char / hashed-truncation rule (spec.md §4.9
/// step 6: "Length rules apply to the staged name too").
pub fn staged_name(name: &str) -> String {
    let candidate = format!("{name}_n");
    if candidate.len() <= 31 {
        return candidate;
    }
    let hash_suffix = format!("_{:08x}", fnv1a32(name.as_bytes()));
    let reserved = "_n".len() + hash_suffix.len();
    let available = 31usize.saturating_sub(reserved);
    let truncated: String = name.chars().take(available).collect();
    format!("{truncated}_n{hash_suffix}")
}

/// Create/flush/add/swap/destroy/list named kernel address sets
/// (spec.md §4.3). Every call takes a [`CancellationToken`] so an
/// in-flight apply can be aborted (spec.md §7).
pub trait AddressSetOperator: Send + Sync {
    /// Idempotent create of kind `hash:ip`/`hash:ip6`, tolerating
    /// "already exists".
    fn ensure(&self, name: &str, family: Family, token: &CancellationToken) -> impl Future<Output = Result<(), IpsetError>> + Send;

    /// Idempotent add with the default entry timeout.
    fn add(&self, name: &str, entry: &str, token: &CancellationToken) -> impl Future<Output = Result<(), IpsetError>> + Send;

    /// Remove every entry from `name`.
    fn flush(&self, name: &str, token: &CancellationToken) -> impl Future<Output = Result<(), IpsetError>> + Send;

    /// Destroy `name` entirely.
    fn destroy(&self, name: &str, token: &CancellationToken) -> impl Future<Output = Result<(), IpsetError>> + Send;

    /// Atomically swap the contents of two same-family sets.
    fn swap(&self, a: &str, b: &str, token: &CancellationToken) -> impl Future<Output = Result<(), IpsetError>> + Send;

    /// List set names matching `prefix`, sorted ascending.
    fn list(&self, prefix: &str, token: &CancellationToken) -> impl Future<Output = Result<Vec<String>, IpsetError>> + Send;
}

use std::future::Future;

/// Production [`AddressSetOperator`] wrapping a [`CommandExecutor`].
pub struct IpsetOperator<E> {
    pub(crate) executor: E,
}

impl<E: CommandExecutor> IpsetOperator<E> {
    /// Wrap `executor` as an `ipset` operator.
    pub fn new(executor: E) -> Self {
        IpsetOperator { executor }
    }
}

impl<E: CommandExecutor> AddressSetOperator for IpsetOperator<E> {
    async fn ensure(&self, name: &str, family: Family, token: &CancellationToken) -> Result<(), IpsetError> {
        validate_name(name)?;
        let argv = vec![
            "create".to_string(),
            name.to_string(),
            family.ipset_set_type().to_string(),
            "family".to_string(),
            family.ipset_family().to_string(),
            "timeout".to_string(),
            DEFAULT_ENTRY_TIMEOUT_SECS.to_string(),
            "-exist".to_string(),
        ];
        self.executor.run("ipset", &argv, token).await?;
        Ok(())
    }

    async fn add(&self, name: &str, entry: &str, token: &CancellationToken) -> Result<(), IpsetError> {
        let argv = vec![
            "add".to_string(),
            name.to_string(),
            entry.to_string(),
            "timeout".to_string(),
            DEFAULT_ENTRY_TIMEOUT_SECS.to_string(),
            "-exist".to_string(),
        ];
        self.executor.run("ipset", &argv, token).await?;
        Ok(())
    }

    async fn flush(&self, name: &str, token: &CancellationToken) -> Result<(), IpsetError> {
        self.executor.run("ipset", &["flush".to_string(), name.to_string()], token).await?;
        Ok(())
    }

    async fn destroy(&self, name: &str, token: &CancellationToken) -> Result<(), IpsetError> {
        self.executor.run("ipset", &["destroy".to_string(), name.to_string()], token).await?;
        Ok(())
    }

    async fn swap(&self, a: &str, b: &str, token: &CancellationToken) -> Result<(), IpsetError> {
        self.executor.run("ipset", &["swap".to_string(), a.to_string(), b.to_string()], token).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str, token: &CancellationToken) -> Result<Vec<String>, IpsetError> {
        let output = self.executor.output("ipset", &["list".to_string(), "-name".to_string()], token).await?;
        let text = String::from_utf8_lossy(&output);
        let mut names: Vec<String> =
            text.lines().map(str::trim).filter(|l| !l.is_empty() && l.starts_with(prefix)).map(str::to_string).collect();
        names.sort();
        Ok(names)
    }
}

/// Stage-ensure-flush-add-swap-destroy a set's contents atomically
/// (spec.md §4.9 step 6, §9 "Staged address-set swap"). `entries` need
/// not be pre-sorted; callers typically pass the output of
/// [`crate::prefix::collapse`].
pub async fn staged_swap<A: AddressSetOperator>(
    operator: &A,
    name: &str,
    family: Family,
    entries: &[String],
    token: &CancellationToken,
) -> Result<(), IpsetError> {
    let staged = staged_name(name);
    operator.ensure(name, family, token).await?;
    operator.ensure(&staged, family, token).await?;
    operator.flush(&staged, token).await?;
    for entry in entries {
        operator.add(&staged, entry, token).await?;
    }
    operator.swap(name, &staged, token).await?;
    operator.destroy(&staged, token).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use test_case::test_case;

    #[test_case("Streaming-SG", "streaming_sg"; "hyphen and case")]
    #[test_case("My Group!!", "my_group"; "collapsing punctuation")]
    #[test_case("__leading", "leading"; "trims leading underscores")]
    fn slug_base_cases(input: &str, expected: &str) {
        assert_eq!(slug_base(input), expected);
    }

    #[test]
    fn rule_set_name_matches_spec_example() {
        let base = slug_base("Streaming-SG");
        assert_eq!(rule_set_name(&base, 1, SetRole::Destination, Family::Inet), "svpn_streaming_sg_r1d4");
        assert_eq!(rule_set_name(&base, 1, SetRole::Destination, Family::Inet6), "svpn_streaming_sg_r1d6");
    }

    #[test]
    fn rule_set_name_truncates_with_hash_when_too_long() {
        let base = slug_base(&"a".repeat(40));
        let name = rule_set_name(&base, 12, SetRole::ExcludedDestination, Family::Inet6);
        assert!(name.len() <= 31, "{name} exceeds 31 chars");
        assert!(name.starts_with("svpn_"));
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn rule_set_name_is_deterministic() {
        let base = slug_base(&"x".repeat(40));
        let a = rule_set_name(&base, 3, SetRole::Source, Family::Inet);
        let b = rule_set_name(&base, 3, SetRole::Source, Family::Inet);
        assert_eq!(a, b);
    }

    #[test_case("svpn_ok-name.1:2", true; "valid chars")]
    #[test_case("has space", false; "rejects space")]
    #[test_case(&"a".repeat(32), false; "rejects too long")]
    fn validate_name_cases(name: &str, ok: bool) {
        assert_eq!(validate_name(name).is_ok(), ok);
    }

    #[tokio::test]
    async fn ensure_emits_expected_ipset_create() {
        let executor = RecordingExecutor::new();
        let operator = IpsetOperator::new(executor);
        operator.ensure("svpn_x_r1d4", Family::Inet, &CancellationToken::new()).await.unwrap();

        let calls = operator.executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ipset");
        assert_eq!(
            calls[0].argv,
            vec!["create", "svpn_x_r1d4", "hash:ip", "family", "inet", "timeout", "86400", "-exist"]
        );
    }

    #[tokio::test]
    async fn staged_swap_ensures_flushes_adds_swaps_and_destroys() {
        let executor = RecordingExecutor::new();
        let operator = IpsetOperator::new(executor);
        staged_swap(&operator, "svpn_x_r1d4", Family::Inet, &["10.0.0.0/24".to_string()], &CancellationToken::new())
            .await
            .unwrap();

        let calls = operator.executor.calls();
        let subcommands: Vec<&str> = calls.iter().map(|c| c.argv[0].as_str()).collect();
        assert_eq!(subcommands, vec!["create", "create", "flush", "add", "swap", "destroy"]);
        assert_eq!(calls[1].argv[1], "svpn_x_r1d4_n");
        assert_eq!(calls[4].argv[1..], vec!["svpn_x_r1d4".to_string(), "svpn_x_r1d4_n".to_string()]);
    }

    #[tokio::test]
    async fn staged_swap_stops_on_cancellation() {
        let executor = RecordingExecutor::new();
        let operator = IpsetOperator::new(executor);
        let token = CancellationToken::new();
        token.cancel();
        let err = staged_swap(&operator, "svpn_x_r1d4", Family::Inet, &["10.0.0.0/24".to_string()], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, IpsetError::Executor(ExecutorError::Cancelled { .. })));
        assert!(operator.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_sorts() {
        let executor = RecordingExecutor::new();
        executor.script_output("ipset list", b"svpn_b\nother_set\nsvpn_a\n".to_vec());
        let operator = IpsetOperator::new(executor);
        let names = operator.list("svpn_", &CancellationToken::new()).await.unwrap();
        assert_eq!(names, vec!["svpn_a".to_string(), "svpn_b".to_string()]);
    }
}
