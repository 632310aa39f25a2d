//! Backend pool and selection policy

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// One candidate RADIUS server
#[derive(Debug, PartialEq, Eq)]
pub struct Backend {
    addr: String,
}

impl Backend {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// `host:port` of the backend
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// Policy choosing a backend for a fresh session
///
/// Only liveness is contractual: every pool member must be eventually
/// selectable. Fairness is a policy property, not a correctness one.
pub trait BackendSelector: Send + Sync + fmt::Debug {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

/// Default policy: rotate through the membership snapshot
#[derive(Debug, Default)]
pub struct RotatingSelector {
    next: AtomicUsize,
}

impl BackendSelector for RotatingSelector {
    fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % backends.len();
        Some(backends[index].clone())
    }
}

/// Mutable set of backend addresses, driven by the discovery feed
///
/// Reads and mutations are eventually consistent: a selection racing a
/// removal may still pick the removed backend, which in-flight traffic
/// tolerates anyway.
#[derive(Debug)]
pub struct BackendPool {
    backends: RwLock<Vec<Arc<Backend>>>,
    selector: Box<dyn BackendSelector>,
}

impl BackendPool {
    pub fn new(addrs: impl IntoIterator<Item = String>) -> Self {
        Self::with_selector(addrs, Box::<RotatingSelector>::default())
    }

    pub fn with_selector(
        addrs: impl IntoIterator<Item = String>,
        selector: Box<dyn BackendSelector>,
    ) -> Self {
        let pool = Self {
            backends: RwLock::new(Vec::new()),
            selector,
        };
        for addr in addrs {
            pool.add_backend(&addr);
        }
        pool
    }

    /// Add a backend; adding a present address is a no-op
    pub fn add_backend(&self, addr: &str) {
        let mut backends = self.backends.write().unwrap();
        if backends.iter().any(|b| b.addr() == addr) {
            debug!(addr = %addr, "Backend already in pool");
            return;
        }
        info!(addr = %addr, "Adding backend");
        backends.push(Arc::new(Backend::new(addr)));
    }

    /// Remove a backend; deleting an absent address is a no-op
    pub fn delete_backend(&self, addr: &str) {
        let mut backends = self.backends.write().unwrap();
        let before = backends.len();
        backends.retain(|b| b.addr() != addr);
        if backends.len() < before {
            info!(addr = %addr, "Removing backend");
        }
    }

    /// Pick a backend for a fresh session via the configured policy
    pub fn select(&self) -> Option<Arc<Backend>> {
        let snapshot = self.backends.read().unwrap().clone();
        self.selector.select(&snapshot)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.backends.read().unwrap().iter().any(|b| b.addr() == addr)
    }

    pub fn len(&self) -> usize {
        self.backends.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().unwrap().is_empty()
    }
}
