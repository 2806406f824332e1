//! REST API client module for the check-in backend.
//!
//! `ApiClient` speaks the backend's fixed REST surface (register, check-in,
//! bulk sync, events, sessions, users, dashboard). It is also the transport
//! behind the cache router (`Network`), the sync coordinator (`RemoteApi`)
//! and the connectivity probe (`Reachability`).
//!
//! Authentication is a bearer token handed over by the external identity flow.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
