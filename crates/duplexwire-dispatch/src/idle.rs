//! Session idle tracking.
//!
//! Each session owns a [`SessionActivity`] whose timestamp and in-flight
//! counter are atomics, so the read loop, the writer task and request tasks
//! update it without locking. The manager's map is only locked to register,
//! unregister and sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Activity record for one session.
#[derive(Debug)]
pub struct SessionActivity {
    /// Registration key; unique per manager even when ids repeat.
    key: u64,
    id: String,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last envelope read or written.
    last_activity: AtomicU64,
    in_flight: AtomicUsize,
    cancel: CancellationToken,
}

impl SessionActivity {
    fn new(key: u64, id: String, epoch: Instant, cancel: CancellationToken) -> Self {
        let activity = Self {
            key,
            id,
            epoch,
            last_activity: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            cancel,
        };
        activity.touch();
        activity
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record activity now.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Requests currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Mark a request in flight until the guard drops.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            activity: Arc::clone(self),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Holds a session's in-flight count up while a request is processed.
#[derive(Debug)]
pub struct InFlightGuard {
    activity: Arc<SessionActivity>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // Completion counts as activity so the idle clock restarts here.
        self.activity.touch();
        self.activity.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct IdleInner {
    timeout: Option<Duration>,
    epoch: Instant,
    next_key: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<SessionActivity>>>,
}

/// Closes sessions that stay idle longer than a timeout.
#[derive(Clone)]
pub struct SessionIdleManager {
    inner: Arc<IdleInner>,
}

impl SessionIdleManager {
    /// `None` disables idle closing; sessions are still tracked.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(IdleInner {
                timeout,
                epoch: Instant::now(),
                next_key: AtomicU64::new(0),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    /// Track a session. `cancel` is triggered if the session goes idle; the
    /// session is untracked when the returned handle drops. Ids need not be
    /// unique: sessions from different listeners may share one.
    pub fn register(&self, id: impl Into<String>, cancel: CancellationToken) -> IdleHandle {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let activity = Arc::new(SessionActivity::new(
            key,
            id.into(),
            self.inner.epoch,
            cancel,
        ));
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.insert(key, Arc::clone(&activity));
        }
        IdleHandle {
            activity,
            manager: self.clone(),
        }
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session idle longer than the timeout with nothing in
    /// flight. Returns the ids of the sessions closed.
    pub fn sweep(&self) -> Vec<String> {
        let Some(timeout) = self.inner.timeout else {
            return Vec::new();
        };
        let Ok(mut sessions) = self.inner.sessions.lock() else {
            return Vec::new();
        };

        let expired: Vec<u64> = sessions
            .values()
            .filter(|activity| activity.in_flight() == 0 && activity.idle_for() > timeout)
            .map(|activity| activity.key)
            .collect();

        let mut closed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(activity) = sessions.remove(&key) {
                info!(
                    connection_id = %activity.id,
                    idle_ms = activity.idle_for().as_millis() as u64,
                    "closing idle session"
                );
                activity.cancel.cancel();
                closed.push(activity.id.clone());
            }
        }
        closed
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("idle sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn unregister(&self, key: u64) {
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.remove(&key);
        }
    }
}

impl std::fmt::Debug for SessionIdleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdleManager")
            .field("timeout", &self.inner.timeout)
            .field("sessions", &self.len())
            .finish()
    }
}

/// A session's registration with the idle manager.
#[derive(Debug)]
pub struct IdleHandle {
    activity: Arc<SessionActivity>,
    manager: SessionIdleManager,
}

impl IdleHandle {
    pub fn activity(&self) -> &Arc<SessionActivity> {
        &self.activity
    }
}

impl Drop for IdleHandle {
    fn drop(&mut self) {
        self.manager.unregister(self.activity.key);
    }
}
