//! Offline response cache and asset store.
//!
//! - `Caches`: durable key -> response store, partitioned by store name and
//!   build version tag
//! - `CacheRouter`: classifies outgoing requests and applies the matching
//!   cache-first / network-first strategy
//! - `CacheLifecycle`: precache install, waiting version and activation
//!   (old versions are deleted on activation)

mod entry;
mod lifecycle;
mod request;
mod router;
mod storage;

pub use entry::{CacheEntry, CacheStrategy};
pub use lifecycle::{CacheLifecycle, InstallOutcome};
pub use request::{HttpRequest, HttpResponse, RequestIdentity};
pub use router::{
    CacheEvent, CacheRouter, Network, ResponseSource, RouteConfig, RoutePattern, Routed,
    RouterOptions, STALE_HEADER,
};
pub use storage::{Caches, StoreSummary, ASSET_STORE};
