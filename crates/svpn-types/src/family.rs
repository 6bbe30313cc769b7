//! Address family used throughout address-set naming, prefix aggregation,
//! and kernel `ipset`/`iptables` invocations.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// IPv4 or IPv6, named after the kernel's `ipset`/`iptables` family
/// vocabulary (`inet`/`inet6`) rather than a bare "v4"/"v6".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// IPv4, `ipset family inet`.
    Inet,
    /// IPv6, `ipset family inet6`.
    Inet6,
}

impl Family {
    /// The family an address belongs to.
    pub fn of(addr: IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    /// Maximum prefix length for this family (32 / 128).
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            Family::Inet => 32,
            Family::Inet6 => 128,
        }
    }

    /// The `ipset create ... family <inet|inet6>` argument.
    pub fn ipset_family(&self) -> &'static str {
        match self {
            Family::Inet => "inet",
            Family::Inet6 => "inet6",
        }
    }

    /// The `ipset create ... hash:ip[6]` set-type argument.
    pub fn ipset_set_type(&self) -> &'static str {
        match self {
            Family::Inet => "hash:ip",
            Family::Inet6 => "hash:ip6",
        }
    }

    /// Single-character suffix used in address-set names (`4`/`6`).
    pub fn name_suffix(&self) -> &'static str {
        match self {
            Family::Inet => "4",
            Family::Inet6 => "6",
        }
    }

    /// The `iptables`/`ip6tables` binary name for this family.
    pub fn iptables_binary(&self) -> &'static str {
        match self {
            Family::Inet => "iptables",
            Family::Inet6 => "ip6tables",
        }
    }

    /// The `ip [-6] rule` flag for this family (empty for IPv4).
    pub fn ip_rule_flag(&self) -> &'static [&'static str] {
        match self {
            Family::Inet => &[],
            Family::Inet6 => &["-6"],
        }
    }

    /// The multicast CIDR excluded by `ExcludeMulticast` for this family.
    pub fn multicast_cidr(&self) -> &'static str {
        match self {
            Family::Inet => "224.0.0.0/4",
            Family::Inet6 => "ff00::/8",
        }
    }
}
