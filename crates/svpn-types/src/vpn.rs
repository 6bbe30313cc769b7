//! The external egress-VPN collaborator: this crate only consumes its
//! shape via [`EgressVpn`] and the [`VpnLister`] capability trait; VPN
//! lifecycle (creating tunnels, rotating keys) is out of scope.

use serde::{Deserialize, Serialize};

/// A named tunnel endpoint with a dedicated route table and firewall mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressVpn {
    /// Unique VPN name, referenced by [`crate::model::DomainGroup::egress_vpn`].
    pub name: String,
    /// Kernel interface name traffic egresses through (e.g. `wg-sgp`).
    pub interface_name: String,
    /// Firewall mark applied to traffic steered through this VPN. Must be
    /// `>= 200` to be usable by a group.
    pub fw_mark: u32,
    /// Policy-routing table traffic bearing `fw_mark` is steered into.
    /// Must be `>= 200` to be usable by a group.
    pub route_table: i32,
}

impl EgressVpn {
    /// True if this VPN's mark/table/interface satisfy the invariants
    /// required for it to back an active group (spec.md §3).
    pub fn is_usable(&self) -> bool {
        self.fw_mark >= 200 && self.route_table >= 200 && !self.interface_name.is_empty()
    }
}

/// Capability interface the reconciler depends on to resolve
/// `DomainGroup::egress_vpn` names into concrete VPN profiles. Realized
/// by a production struct that talks to whatever owns VPN lifecycle, and
/// by in-memory test doubles.
pub trait VpnLister: Send + Sync {
    /// List all known egress VPN profiles.
    fn list(&self) -> Vec<EgressVpn>;

    /// Look up a single VPN profile by name.
    fn get(&self, name: &str) -> Option<EgressVpn> {
        self.list().into_iter().find(|v| v.name == name)
    }
}

/// A fixed, in-memory [`VpnLister`] over a profile list loaded once at
/// startup (this system treats VPN lifecycle as externally owned and
/// read-only).
#[derive(Debug, Clone, Default)]
pub struct StaticVpnLister(Vec<EgressVpn>);

impl StaticVpnLister {
    /// Wrap a fixed VPN profile list.
    pub fn new(profiles: Vec<EgressVpn>) -> Self {
        StaticVpnLister(profiles)
    }
}

impl VpnLister for StaticVpnLister {
    fn list(&self) -> Vec<EgressVpn> {
        self.0.clone()
    }
}
