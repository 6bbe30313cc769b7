//! Validation errors shared by the model, store, and reconciler layers.

/// A selector or identifier failed to canonicalize.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Group name doesn't match `^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$`.
    #[error("invalid group name: {0}")]
    InvalidName(String),

    /// Interface name doesn't match `[a-z0-9._-]+`.
    #[error("invalid interface name: {0}")]
    InvalidInterface(String),

    /// MAC address could not be parsed into six hex octets.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// ASN could not be parsed as `AS<decimal>` / bare decimal >= 1.
    #[error("invalid ASN: {0}")]
    InvalidAsn(String),

    /// Domain was empty after trimming.
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// CIDR or host address failed to parse.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Port range is out of bounds or inverted.
    #[error("invalid port range: {0}..{1}")]
    InvalidPortRange(u32, u32),

    /// Egress VPN referenced by a group does not exist, or has an
    /// out-of-range mark/table/interface.
    #[error("invalid egress VPN: {0}")]
    InvalidEgressVpn(String),
}
