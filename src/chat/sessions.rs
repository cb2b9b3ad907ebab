//! Session registry and idle sweeper.
//!
//! Sessions live in memory only. Each one sits behind its own async mutex so
//! at most one action runs per session; a second concurrent action is
//! rejected rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chat::core::{ChatError, ChatResult, SessionConfig, SessionId};
use crate::chat::transcript::Session;

/// Shared handle to one session.
pub type SharedSession = Arc<Mutex<Session>>;

/// Live sessions keyed by id.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SharedSession>,
    /// Slots reserved against `max_sessions`.
    reserved: AtomicUsize,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions: config.max_sessions,
            idle_ttl: Duration::from_secs(config.idle_ttl_seconds),
        }
    }

    /// Register a session.
    ///
    /// # Errors
    /// `SessionLimit` when the registry is full.
    pub fn insert(&self, session: Session) -> ChatResult<SessionId> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .map_err(|_| ChatError::SessionLimit(self.max_sessions))?;
        let id = session.id;
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        debug!(session = %id, live = self.sessions.len(), "session created");
        Ok(id)
    }

    /// Handle to a session.
    ///
    /// # Errors
    /// `SessionNotFound` for unknown ids.
    pub fn get(&self, id: SessionId) -> ChatResult<SharedSession> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ChatError::SessionNotFound(id))
    }

    /// Exclusive access for one action, without waiting.
    ///
    /// # Errors
    /// `SessionNotFound`, or `SessionBusy` while another action holds it.
    pub fn acquire(&self, id: SessionId) -> ChatResult<OwnedMutexGuard<Session>> {
        self.get(id)?
            .try_lock_owned()
            .map_err(|_| ChatError::SessionBusy(id))
    }

    /// Remove a session.
    ///
    /// # Errors
    /// `SessionNotFound` for unknown ids.
    pub fn destroy(&self, id: SessionId) -> ChatResult<()> {
        if self.sessions.remove(&id).is_none() {
            return Err(ChatError::SessionNotFound(id));
        }
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        debug!(session = %id, live = self.sessions.len(), "session destroyed");
        Ok(())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove sessions idle for longer than the configured TTL.
    ///
    /// Sessions with an action in flight are never evicted. Returns the
    /// number removed.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = match session.try_lock() {
                Ok(guard) => !is_idle(guard.last_active, now, self.idle_ttl),
                Err(_) => true,
            };
            if !keep {
                removed += 1;
            }
            keep
        });
        self.reserved.fetch_sub(removed, Ordering::AcqRel);
        removed
    }
}

fn is_idle(last_active: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    now.signed_duration_since(last_active)
        .to_std()
        .is_ok_and(|idle| idle > ttl)
}

/// Background task evicting idle sessions.
pub struct SessionSweeper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl SessionSweeper {
    /// Sweeper for `registry`, running every `config.sweep_interval_seconds`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: &SessionConfig) -> Self {
        Self {
            registry,
            interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Notifier that stops the sweeper.
    #[must_use]
    pub fn shutdown_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Spawn the sweep loop.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval = ?self.interval, "starting session sweeper");
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {
                    let evicted = self.registry.evict_idle(Utc::now());
                    if evicted > 0 {
                        info!(evicted, live = self.registry.len(), "evicted idle sessions");
                    } else {
                        debug!("no idle sessions to evict");
                    }
                }
                () = self.shutdown.notified() => {
                    info!("session sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_sessions: usize) -> SessionConfig {
        SessionConfig {
            idle_ttl_seconds: 60,
            max_sessions,
            sweep_interval_seconds: 1,
        }
    }

    #[test]
    fn test_create_get_destroy() {
        let registry = SessionRegistry::new(&config(10));
        let id = registry.insert(Session::new("sys", "hi")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_ok());

        registry.destroy(id).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.get(id), Err(ChatError::SessionNotFound(_))));
        assert!(matches!(registry.destroy(id), Err(ChatError::SessionNotFound(_))));
    }

    #[test]
    fn test_session_limit() {
        let registry = SessionRegistry::new(&config(1));
        registry.insert(Session::new("sys", "hi")).unwrap();
        assert!(matches!(
            registry.insert(Session::new("sys", "hi")),
            Err(ChatError::SessionLimit(1))
        ));
    }

    #[test]
    fn test_limit_holds_under_concurrent_creates() {
        let registry = SessionRegistry::new(&config(8));
        let created = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..64 {
                scope.spawn(|| {
                    if registry.insert(Session::new("sys", "hi")).is_ok() {
                        created.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(created.load(Ordering::Relaxed), 8);
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_destroy_frees_a_slot() {
        let registry = SessionRegistry::new(&config(1));
        let id = registry.insert(Session::new("sys", "hi")).unwrap();
        registry.destroy(id).unwrap();
        assert!(registry.insert(Session::new("sys", "hi")).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_action_is_busy() {
        let registry = SessionRegistry::new(&config(10));
        let id = registry.insert(Session::new("sys", "hi")).unwrap();

        let guard = registry.acquire(id).unwrap();
        assert!(matches!(registry.acquire(id), Err(ChatError::SessionBusy(_))));
        drop(guard);
        assert!(registry.acquire(id).is_ok());
    }

    #[tokio::test]
    async fn test_evicts_only_stale_sessions() {
        let registry = SessionRegistry::new(&config(10));
        let mut stale = Session::new("sys", "hi");
        stale.last_active = Utc::now() - chrono::Duration::seconds(600);
        let stale_id = registry.insert(stale).unwrap();
        let fresh_id = registry.insert(Session::new("sys", "hi")).unwrap();

        let mut busy = Session::new("sys", "hi");
        busy.last_active = Utc::now() - chrono::Duration::seconds(600);
        let busy_id = registry.insert(busy).unwrap();
        let guard = registry.acquire(busy_id).unwrap();

        assert_eq!(registry.evict_idle(Utc::now()), 1);
        assert!(registry.get(stale_id).is_err());
        assert!(registry.get(fresh_id).is_ok());
        assert!(registry.get(busy_id).is_ok());
        drop(guard);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::new(&config(10)));
        let sweeper = SessionSweeper::new(Arc::clone(&registry), &config(10));
        let shutdown = sweeper.shutdown_notifier();
        let handle = sweeper.spawn();

        tokio::task::yield_now().await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
