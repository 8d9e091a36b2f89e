//! Core of the nibble nutrition tracker.
//!
//! The crate keeps an in-memory [`cache::EntryCache`] of a user's logged
//! entries consistent with a [`store::RemoteStore`] through a push-based
//! change feed ([`reconciler::ChangeReconciler`]), tracks store reachability
//! ([`connection::ConnectionMonitor`]), and derives analytics from cache
//! snapshots ([`analytics`]). [`session::SyncSession`] wires the pieces
//! together for consumers.

pub mod analytics;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod reconciler;
pub mod session;
pub mod sqlite_store;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
