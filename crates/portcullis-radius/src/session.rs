//! Sticky session table with sliding-window TTL

use crate::backend::Backend;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Returned when a session's expiry has already passed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Session timed out")]
pub struct SessionExpired;

/// One sticky session: a correlation token bound to one backend
///
/// The backend binding never changes for the session's lifetime; only the
/// expiry moves, and only forward.
#[derive(Debug)]
struct Session {
    backend: Arc<Backend>,
    timeout: Duration,
    expiry: RwLock<Instant>,
}

impl Session {
    fn new(timeout: Duration, backend: Arc<Backend>) -> Self {
        Self {
            backend,
            timeout,
            expiry: RwLock::new(Instant::now() + timeout),
        }
    }

    fn is_expired(&self) -> bool {
        *self.expiry.read().unwrap() <= Instant::now()
    }

    /// Slide the expiry window; expired sessions never come back
    fn extend(&self) -> Result<(), SessionExpired> {
        let mut expiry = self.expiry.write().unwrap();
        if *expiry <= Instant::now() {
            return Err(SessionExpired);
        }
        *expiry = Instant::now() + self.timeout;
        Ok(())
    }
}

/// Concurrent mapping from correlation token to session
///
/// Serialization is scoped to a single session's expiry lock; operations on
/// different tokens interleave freely. Only the store's own sweep ever
/// deletes an entry.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a live session's backend, extending its expiry as a side
    /// effect. Expired entries behave as absent even before the sweep
    /// reclaims them.
    pub fn lookup(&self, token: &str) -> Option<Arc<Backend>> {
        let session = self.sessions.read().unwrap().get(token).cloned()?;
        match session.extend() {
            Ok(()) => {
                trace!(token = %token, backend = %session.backend.addr(), "Session hit");
                Some(session.backend.clone())
            }
            Err(SessionExpired) => None,
        }
    }

    /// Install a new session, overwriting any prior entry for the token
    pub fn create(&self, token: &str, timeout: Duration, backend: Arc<Backend>) {
        debug!(token = %token, backend = %backend.addr(), "Session created");
        self.sessions
            .write()
            .unwrap()
            .insert(token.to_string(), Arc::new(Session::new(timeout, backend)));
    }

    /// Number of entries, including not-yet-swept expired ones
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().len() == 0
    }

    fn sweep_once(&self) {
        let snapshot: Vec<(String, Arc<Session>)> = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .map(|(token, session)| (token.clone(), session.clone()))
            .collect();

        for (token, session) in snapshot {
            if session.is_expired() {
                let mut sessions = self.sessions.write().unwrap();
                // An expired session can never extend again, so it is safe to
                // remove; the pointer check keeps a fresh replacement session
                // under the same token alive.
                if let Some(current) = sessions.get(&token) {
                    if Arc::ptr_eq(current, &session) {
                        sessions.remove(&token);
                        debug!(token = %token, "Swept expired session");
                    }
                }
            }
        }
    }

    /// Periodic eviction of expired sessions, until `stop` fires
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.sweep_once(),
            }
        }
        debug!("Session sweeper stopped");
    }
}
