//! Prefix Aggregator: collapse/merge IP-prefix lists by family, used both
//! to compute final address-set contents and to preview selector
//! expansion (spec.md §4.2). No direct analog in the teacher's daemon
//! crate (it has no CIDR-merge code of its own); `ipnetwork` is pulled
//! from `wirewarden-api`'s dependency table, where it backs `IpNetwork`
//! columns, so the merge works over typed networks instead of hand-rolled
//! bit math.

use ipnetwork::IpNetwork;
use svpn_types::Family;
use thiserror::Error;

/// Errors the prefix aggregator can surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixError {
    /// An entry could not be parsed as a bare IP or `ip/len` CIDR.
    #[error("invalid prefix: {0}")]
    Invalid(String),

    /// An entry's address family does not match the requested family.
    #[error("family mismatch: {0} is not {1:?}")]
    FamilyMismatch(String, Family),
}

/// Split a mixed list of canonical CIDR entries into `(v4, v6)` buckets.
/// Entries that fail to parse are dropped; callers compose this with
/// [`collapse`], which validates and merges each bucket in turn.
pub fn split_by_family(entries: &[String]) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for entry in entries {
        match entry.parse::<IpNetwork>() {
            Ok(IpNetwork::V4(_)) => v4.push(entry.clone()),
            Ok(IpNetwork::V6(_)) => v6.push(entry.clone()),
            Err(_) => {}
        }
    }
    (v4, v6)
}

/// Parse `entries` (bare IPs or `ip/len`, all of one `family`), mask each
/// to its network address, and merge adjacent/overlapping prefixes into
/// the minimum covering set, in ascending order.
pub fn collapse(entries: &[&str], family: Family) -> Result<Vec<String>, PrefixError> {
    let mut ranges: Vec<(u128, u128)> = Vec::with_capacity(entries.len());

    for entry in entries {
        let net: IpNetwork = entry.parse().map_err(|_| PrefixError::Invalid(entry.to_string()))?;
        let entry_family = match net {
            IpNetwork::V4(_) => Family::Inet,
            IpNetwork::V6(_) => Family::Inet6,
        };
        if entry_family != family {
            return Err(PrefixError::FamilyMismatch(entry.to_string(), family));
        }
        ranges.push(network_range(net));
    }

    ranges.sort_unstable();
    let merged = merge_ranges(ranges);

    let mut out = Vec::new();
    for (start, end) in merged {
        for (block_start, prefix_len) in range_to_cidrs(start, end, family.max_prefix_len()) {
            out.push(format_cidr(block_start, prefix_len, family));
        }
    }
    Ok(out)
}

/// `(network_address, broadcast_address)` as `u128`, regardless of
/// family — IPv4 values occupy the low 32 bits.
fn network_range(net: IpNetwork) -> (u128, u128) {
    match net {
        IpNetwork::V4(v4) => {
            let start = u32::from(v4.network()) as u128;
            let end = u32::from(v4.broadcast()) as u128;
            (start, end)
        }
        IpNetwork::V6(v6) => {
            let start = u128::from(v6.network());
            let mask = if v6.prefix() == 0 { 0 } else { u128::MAX << (128 - v6.prefix()) };
            let end = start | !mask;
            (start, end)
        }
    }
}

/// Merge a sorted list of inclusive `(start, end)` ranges, combining any
/// pair where the next range starts at or before `end + 1`.
fn merge_ranges(ranges: Vec<(u128, u128)>) -> Vec<(u128, u128)> {
    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some((_, last_end)) if start <= last_end.saturating_add(1) => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Decompose an inclusive `[start, end]` range into the minimum-length
/// list of aligned CIDR blocks that exactly cover it (the standard
/// greedy range-to-CIDR algorithm).
fn range_to_cidrs(start: u128, end: u128, max_bits: u8) -> Vec<(u128, u8)> {
    let mut blocks = Vec::new();
    let mut current = start;
    loop {
        let max_size_bits = if current == 0 {
            max_bits
        } else {
            (current.trailing_zeros() as u8).min(max_bits)
        };
        let remaining = match end.checked_sub(current).and_then(|d| d.checked_add(1)) {
            Some(r) => r,
            None => {
                blocks.push((current, max_bits - max_size_bits));
                break;
            }
        };
        let remaining_bits = (127 - remaining.leading_zeros()) as u8;
        let size_bits = max_size_bits.min(remaining_bits);
        let prefix_len = max_bits - size_bits;
        blocks.push((current, prefix_len));

        if size_bits >= 128 {
            break;
        }
        let block_size = 1u128 << size_bits;
        match current.checked_add(block_size) {
            Some(next) if next <= end => current = next,
            _ => break,
        }
    }
    blocks
}

fn format_cidr(addr: u128, prefix_len: u8, family: Family) -> String {
    match family {
        Family::Inet => {
            let addr = std::net::Ipv4Addr::from(addr as u32);
            format!("{addr}/{prefix_len}")
        }
        Family::Inet6 => {
            let addr = std::net::Ipv6Addr::from(addr);
            format!("{addr}/{prefix_len}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn split_by_family_buckets_and_drops_garbage() {
        let entries = vec!["10.0.0.0/24".to_string(), "2001:db8::/64".to_string(), "not-a-cidr".to_string()];
        let (v4, v6) = split_by_family(&entries);
        assert_eq!(v4, vec!["10.0.0.0/24"]);
        assert_eq!(v6, vec!["2001:db8::/64"]);
    }

    #[test]
    fn collapse_merges_contiguous_v4_hosts() {
        let entries = ["198.51.100.0/32", "198.51.100.1/32", "198.51.100.2/32", "198.51.100.3/32"];
        let result = collapse(&entries, Family::Inet).unwrap();
        assert_eq!(result, vec!["198.51.100.0/30"]);
    }

    #[test]
    fn collapse_merges_contiguous_v6_hosts() {
        let entries = ["2001:db8::1/128", "2001:db8::2/128", "2001:db8::3/128", "2001:db8::4/128"];
        let result = collapse(&entries, Family::Inet6).unwrap();
        assert_eq!(result, vec!["2001:db8::1/128", "2001:db8::2/127", "2001:db8::4/128"]);
    }

    #[test]
    fn collapse_rejects_family_mismatch() {
        let entries = ["198.51.100.1/32", "2001:db8::1/128"];
        assert!(collapse(&entries, Family::Inet).is_err());
    }

    #[test]
    fn collapse_rejects_invalid_entry() {
        assert!(collapse(&["not-an-ip"], Family::Inet).is_err());
    }

    #[test]
    fn collapse_is_idempotent() {
        let entries = ["10.0.0.0/24", "10.0.1.0/24"];
        let once = collapse(&entries, Family::Inet).unwrap();
        let once_refs: Vec<&str> = once.iter().map(|s| s.as_str()).collect();
        let twice = collapse(&once_refs, Family::Inet).unwrap();
        assert_eq!(once, twice);
    }

    #[test_case(&["10.0.0.5"], &["10.0.0.5/32"]; "bare host")]
    #[test_case(&["10.0.0.0/24", "10.0.1.0/24"], &["10.0.0.0/24", "10.0.1.0/24"]; "non adjacent kept separate")]
    #[test_case(&["10.0.0.0/25", "10.0.0.128/25"], &["10.0.0.0/24"]; "adjacent halves merge")]
    #[test_case(&["10.0.0.5/32", "10.0.0.1/32"], &["10.0.0.1/32", "10.0.0.5/32"]; "sorts ascending")]
    fn collapse_cases(input: &[&str], expected: &[&str]) {
        assert_eq!(collapse(input, Family::Inet).unwrap(), expected);
    }

    #[test]
    fn collapse_empty_input_is_empty() {
        assert!(collapse(&[], Family::Inet).unwrap().is_empty());
    }

    #[test]
    fn collapse_deduplicates_identical_entries() {
        let result = collapse(&["10.0.0.1/32", "10.0.0.1/32"], Family::Inet).unwrap();
        assert_eq!(result, vec!["10.0.0.1/32"]);
    }
}
