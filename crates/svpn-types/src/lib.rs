//! svpn-types: shared data model for the split-VPN routing control plane.
//!
//! This crate contains the declarative data model (domain groups, routing
//! rules, selectors, resolver cache rows) and the canonicalization helpers
//! shared between the persistence layer and the reconciliation engine.

#![warn(missing_docs)]

pub mod canon;
pub mod errors;
pub mod family;
pub mod model;
pub mod resolver;
pub mod vpn;

pub use errors::ValidationError;
pub use family::Family;
pub use model::{DomainGroup, ExcludeMulticast, Port, Protocol, RawSelectorLine, RoutingRule};
pub use resolver::{
    PrewarmRow, ResolverCacheRow, ResolverRunRecord, ResolverSelector, ResolverValues, SelectorKind,
};
pub use vpn::{EgressVpn, StaticVpnLister, VpnLister};
