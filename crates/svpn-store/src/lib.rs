//! svpn-store: SQLite persistence for domain groups, routing rules, and
//! the resolver/pre-warm caches.
//!
//! Mirrors `wirewarden-api`'s db layer: a migrated connection pool, a
//! typed error enum mapping constraint violations, and a single `Store`
//! struct exposing one method per operation.

#![warn(missing_docs)]

mod errors;
mod schema;
mod store;

pub use errors::StoreError;
pub use schema::{migrate, open};
pub use store::Store;
