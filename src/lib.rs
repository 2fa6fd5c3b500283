//! Offline connectivity, caching and write-queue layer for the constituency
//! portal.
//!
//! [`client::PortalClient`] is the entry point: it wires the
//! [`cache::CacheStore`], the [`connectivity::ConnectivityMonitor`], the
//! [`intercept::Interceptor`] and the [`sync::SyncProcessor`] together.

pub mod cache;
pub mod client;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod event;
pub mod http;
pub mod intercept;
pub mod logging;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{CacheResult, CacheSource, PortalClient, SubmitOutcome};
pub use config::Config;
pub use connectivity::ConnectionState;
