//! Canonicalization and validation for the selector primitives in `model`.
//!
//! Every helper here is idempotent: `normalize(normalize(x)) == normalize(x)`
//! for any valid `x`, which is the round-trip property the test suite
//! checks directly.

use std::net::IpAddr;

use crate::errors::ValidationError;

/// Validate and lowercase a group name: `^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$`.
pub fn normalize_group_name(raw: &str) -> Result<String, ValidationError> {
    if raw.is_empty() || raw.len() > 64 {
        return Err(ValidationError::InvalidName(raw.to_string()));
    }
    let mut chars = raw.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(ValidationError::InvalidName(raw.to_string()));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
        return Err(ValidationError::InvalidName(raw.to_string()));
    }
    Ok(raw.to_string())
}

/// Lowercase and validate an interface name: `[a-z0-9._-]+`.
pub fn normalize_interface(raw: &str) -> Result<String, ValidationError> {
    let lowered = raw.to_ascii_lowercase();
    if lowered.is_empty()
        || !lowered
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidInterface(raw.to_string()));
    }
    Ok(lowered)
}

/// Canonicalize a MAC address to lowercase colon-separated form.
pub fn normalize_mac(raw: &str) -> Result<String, ValidationError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidMac(raw.to_string()));
    }
    let octets: Vec<&str> = (0..12).step_by(2).map(|i| &cleaned[i..i + 2]).collect();
    Ok(octets.join(":"))
}

/// Canonicalize an ASN to `AS<decimal>` with no leading zeros, value >= 1.
pub fn normalize_asn(raw: &str) -> Result<String, ValidationError> {
    let digits = raw
        .strip_prefix("AS")
        .or_else(|| raw.strip_prefix("as"))
        .unwrap_or(raw);
    let value: u64 = digits
        .parse()
        .map_err(|_| ValidationError::InvalidAsn(raw.to_string()))?;
    if value < 1 {
        return Err(ValidationError::InvalidAsn(raw.to_string()));
    }
    Ok(format!("AS{value}"))
}

/// Lowercase a domain and strip a single trailing dot.
pub fn normalize_domain(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidDomain(raw.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Normalize a wildcard domain (`*.example.com` or bare `example.com`) to
/// its base domain, without the `*.` prefix.
pub fn normalize_wildcard_base(raw: &str) -> Result<String, ValidationError> {
    let base = raw.strip_prefix("*.").unwrap_or(raw);
    normalize_domain(base)
}

/// Mask an IPv4/IPv6 host-or-CIDR string to its canonical network form
/// (`ip/len`, a bare host becomes `/32` or `/128`).
pub fn canonicalize_cidr(raw: &str) -> Result<String, ValidationError> {
    let (addr_str, len) = match raw.split_once('/') {
        Some((a, l)) => (
            a,
            l.parse::<u8>()
                .map_err(|_| ValidationError::InvalidCidr(raw.to_string()))?,
        ),
        None => (raw, 0),
    };
    let addr: IpAddr = addr_str
        .parse()
        .map_err(|_| ValidationError::InvalidCidr(raw.to_string()))?;

    let (max_len, masked) = match addr {
        IpAddr::V4(v4) => {
            let len = if raw.contains('/') { len } else { 32 };
            if len > 32 {
                return Err(ValidationError::InvalidCidr(raw.to_string()));
            }
            let bits = u32::from(v4);
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            (32u8, IpAddr::V4((bits & mask).into()))
        }
        IpAddr::V6(v6) => {
            let len = if raw.contains('/') { len } else { 128 };
            if len > 128 {
                return Err(ValidationError::InvalidCidr(raw.to_string()));
            }
            let bits = u128::from(v6);
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            (128u8, IpAddr::V6((bits & mask).into()))
        }
    };
    let _ = max_len;
    Ok(format!("{masked}/{len}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("svpn_group", true; "valid")]
    #[test_case("", false; "empty")]
    #[test_case("_leading-underscore", false; "leading underscore")]
    #[test_case("has space", false; "space")]
    fn group_name(input: &str, ok: bool) {
        assert_eq!(normalize_group_name(input).is_ok(), ok);
    }

    #[test]
    fn mac_round_trip() {
        let once = normalize_mac("00:30:93:10:0A:12").unwrap();
        assert_eq!(once, "00:30:93:10:0a:12");
        let twice = normalize_mac(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn mac_accepts_dashes() {
        assert_eq!(
            normalize_mac("00-30-93-10-0a-12").unwrap(),
            "00:30:93:10:0a:12"
        );
    }

    #[test_case("AS13335", "AS13335"; "already canonical")]
    #[test_case("as13335", "AS13335"; "lowercase prefix")]
    #[test_case("13335", "AS13335"; "bare digits")]
    fn asn_forms(input: &str, expected: &str) {
        assert_eq!(normalize_asn(input).unwrap(), expected);
    }

    #[test]
    fn asn_rejects_zero() {
        assert!(normalize_asn("AS0").is_err());
    }

    #[test]
    fn domain_strips_trailing_dot_and_lowercases() {
        assert_eq!(normalize_domain("Example.COM.").unwrap(), "example.com");
    }

    #[test]
    fn wildcard_strips_prefix() {
        assert_eq!(normalize_wildcard_base("*.Apple.com").unwrap(), "apple.com");
        assert_eq!(normalize_wildcard_base("apple.com").unwrap(), "apple.com");
    }

    #[test_case("198.51.100.5", "198.51.100.5/32"; "bare v4 host")]
    #[test_case("198.51.100.5/24", "198.51.100.0/24"; "v4 masked")]
    #[test_case("2001:db8::1", "2001:db8::1/128"; "bare v6 host")]
    #[test_case("2001:db8::5/32", "2001:db8::/32"; "v6 masked")]
    fn cidr_canonical_forms(input: &str, expected: &str) {
        assert_eq!(canonicalize_cidr(input).unwrap(), expected);
    }

    #[test]
    fn cidr_idempotent() {
        let once = canonicalize_cidr("198.51.100.5/24").unwrap();
        let twice = canonicalize_cidr(&once).unwrap();
        assert_eq!(once, twice);
    }
}
