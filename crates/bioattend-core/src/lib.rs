//! BioAttend core - offline-first cache and sync engine for event check-in.
//!
//! Requests go through a [`cache::CacheRouter`] that applies per-route
//! network-first or cache-first strategies over a durable response cache.
//! Registrations and check-ins are captured in a durable
//! [`queue::LocalWriteQueue`] and replayed in order by the
//! [`sync::SyncCoordinator`] whenever connectivity returns.
//! [`engine::OfflineEngine`] owns and wires all of it.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod queue;
pub mod sync;

pub use config::Config;
pub use engine::{Fetched, HostSignal, OfflineEngine};
pub use error::{Error, Result};
