//! Network reachability, reduced to debounced online/offline edges.
//!
//! Raw samples come from the host (`report`) or from a periodic probe
//! (`spawn_probe`). Samples that flip back and forth within the debounce
//! window collapse into at most one edge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Buffered edges per subscriber
const EDGE_CHANNEL_CAPACITY: usize = 16;

/// Host reachability primitive.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEdge {
    Online,
    Offline,
}

pub struct ConnectivityMonitor {
    raw: Arc<watch::Sender<bool>>,
    stable: watch::Receiver<bool>,
    edges: broadcast::Sender<ConnectivityEdge>,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Start the debounce task. Must be called inside a tokio runtime.
    pub fn spawn(initially_online: bool, debounce: Duration) -> Self {
        let (raw, raw_rx) = watch::channel(initially_online);
        let (stable_tx, stable) = watch::channel(initially_online);
        let (edges, _) = broadcast::channel(EDGE_CHANNEL_CAPACITY);
        let task = tokio::spawn(debounce_samples(raw_rx, stable_tx, edges.clone(), debounce));

        Self {
            raw: Arc::new(raw),
            stable,
            edges,
            task,
        }
    }

    /// Feed one raw reachability sample.
    pub fn report(&self, online: bool) {
        report_sample(&self.raw, online);
    }

    /// Debounced state.
    pub fn is_online(&self) -> bool {
        *self.stable.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEdge> {
        self.edges.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.stable.clone()
    }

    /// Poll `target` every `interval` and feed the results as samples.
    pub fn spawn_probe(&self, target: Arc<dyn Reachability>, interval: Duration) -> JoinHandle<()> {
        let raw = Arc::clone(&self.raw);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = target.probe().await;
                report_sample(&raw, online);
            }
        })
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn report_sample(raw: &watch::Sender<bool>, online: bool) {
    let changed = raw.send_if_modified(|current| {
        if *current == online {
            false
        } else {
            *current = online;
            true
        }
    });
    if changed {
        debug!(online, "Reachability sample changed");
    }
}

async fn debounce_samples(
    mut raw: watch::Receiver<bool>,
    stable: watch::Sender<bool>,
    edges: broadcast::Sender<ConnectivityEdge>,
    window: Duration,
) {
    loop {
        if raw.changed().await.is_err() {
            return;
        }

        // Wait until samples have been quiet for a full window
        loop {
            tokio::select! {
                changed = raw.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(window) => break,
            }
        }

        let current = *raw.borrow_and_update();
        if current != *stable.borrow() {
            stable.send_replace(current);
            let edge = if current {
                ConnectivityEdge::Online
            } else {
                ConnectivityEdge::Offline
            };
            info!(?edge, "Connectivity changed");
            let _ = edges.send(edge);
        }
    }
}
