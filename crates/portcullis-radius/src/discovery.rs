//! Backend discovery feed boundary
//!
//! Cluster membership changes arrive as events on a bounded channel; the
//! pump applies them to the pool. The proxy never queries the discovery
//! source itself, so anything able to produce these events (an orchestrator
//! watch, a config reloader, a test) can drive the pool.

use crate::backend::BackendPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One membership change observed by the external watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A backend became ready at `host:port`
    Ready(String),
    /// A backend terminated or stopped being ready
    Gone(String),
}

/// Apply discovery events to the pool until the feed closes
pub async fn run_discovery_pump(pool: Arc<BackendPool>, mut events: mpsc::Receiver<DiscoveryEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Ready(addr) => {
                info!(addr = %addr, "Discovery: backend ready");
                pool.add_backend(&addr);
            }
            DiscoveryEvent::Gone(addr) => {
                info!(addr = %addr, "Discovery: backend gone");
                pool.delete_backend(&addr);
            }
        }
    }
    debug!("Discovery feed closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_mutate_pool_membership() {
        let pool = Arc::new(BackendPool::new([]));
        let (tx, rx) = mpsc::channel(16);

        let pump = tokio::spawn(run_discovery_pump(pool.clone(), rx));

        tx.send(DiscoveryEvent::Ready("10.0.0.1:1812".to_string()))
            .await
            .unwrap();
        tx.send(DiscoveryEvent::Ready("10.0.0.2:1812".to_string()))
            .await
            .unwrap();
        tx.send(DiscoveryEvent::Gone("10.0.0.1:1812".to_string()))
            .await
            .unwrap();
        drop(tx);
        pump.await.unwrap();

        assert!(!pool.contains("10.0.0.1:1812"));
        assert!(pool.contains("10.0.0.2:1812"));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ready_events_are_noops() {
        let pool = Arc::new(BackendPool::new([]));
        let (tx, rx) = mpsc::channel(16);

        let pump = tokio::spawn(run_discovery_pump(pool.clone(), rx));

        for _ in 0..3 {
            tx.send(DiscoveryEvent::Ready("10.0.0.1:1812".to_string()))
                .await
                .unwrap();
        }
        drop(tx);
        pump.await.unwrap();

        assert_eq!(pool.len(), 1);
    }
}
