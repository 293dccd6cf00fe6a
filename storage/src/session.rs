//! Ephemeral multipart session state with time-bounded expiry.
//!
//! A [`SessionManager`] keeps two sharded maps keyed by [`UploadId`]: one for
//! the session itself (where the upload will land) and one for the parts
//! received so far. Both entries carry an expiry deadline which is pushed back
//! whenever the upload makes progress. Completion and abort remove their
//! entries synchronously; [`GcHandle`] runs the periodic sweep which reclaims
//! uploads that were started and then abandoned.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use storage_driver::UploadId;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Session lifetime used by the reference configuration.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Sweep interval used by the reference configuration.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(3);

fn as_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

struct Inner<S, P> {
    ttl_millis: AtomicU64,
    sessions: DashMap<UploadId, Expiring<S>>,
    parts: DashMap<UploadId, Expiring<P>>,
}

/// Concurrent table of in-flight multipart sessions.
///
/// `S` is the per-session descriptor and `P` the accumulated part state.
/// Cloning the manager is cheap and every clone shares the same tables.
pub struct SessionManager<S, P> {
    inner: Arc<Inner<S, P>>,
}

impl<S, P> Clone for SessionManager<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, P> fmt::Debug for SessionManager<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.ttl())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl<S, P> Default for SessionManager<S, P> {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl<S, P> SessionManager<S, P> {
    /// Create an empty manager whose sessions live for `ttl` after their last use.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl_millis: AtomicU64::new(as_millis(ttl)),
                sessions: DashMap::new(),
                parts: DashMap::new(),
            }),
        }
    }

    /// The session time-to-live.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.inner.ttl_millis.load(Ordering::Relaxed))
    }

    /// Change the time-to-live for every clone of this manager.
    ///
    /// Deadlines already handed out are kept; the new lifetime applies from
    /// the next time a session is opened or refreshed.
    pub fn set_ttl(&self, ttl: Duration) {
        self.inner.ttl_millis.store(as_millis(ttl), Ordering::Relaxed);
    }

    /// Open a new session under a freshly generated id.
    pub fn open(&self, session: S, parts: P) -> UploadId {
        let id = UploadId::new_v4();
        self.insert(id.clone(), session, parts);
        id
    }

    /// Register a session under an id assigned elsewhere (e.g. by a backend's
    /// native multipart API).
    pub fn insert(&self, id: UploadId, session: S, parts: P) {
        let expires_at = Instant::now() + self.ttl();
        self.inner.parts.insert(
            id.clone(),
            Expiring {
                value: parts,
                expires_at,
            },
        );
        self.inner.sessions.insert(
            id,
            Expiring {
                value: session,
                expires_at,
            },
        );
    }

    /// Whether `id` names a live (unexpired) session.
    pub fn contains(&self, id: &UploadId) -> bool {
        self.inner
            .sessions
            .get(id)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }

    /// Inspect a live session.
    pub fn with_session<R>(&self, id: &UploadId, f: impl FnOnce(&S) -> R) -> Option<R> {
        let entry = self.inner.sessions.get(id)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(f(&entry.value))
    }

    /// Mutate a live session, refreshing its expiry.
    pub fn with_session_mut<R>(&self, id: &UploadId, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let now = Instant::now();
        let ttl = self.ttl();
        let mut entry = self.inner.sessions.get_mut(id)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at = now + ttl;
        Some(f(&mut entry.value))
    }

    /// Inspect the parts of a live session.
    pub fn with_parts<R>(&self, id: &UploadId, f: impl FnOnce(&P) -> R) -> Option<R> {
        let entry = self.inner.parts.get(id)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(f(&entry.value))
    }

    /// Mutate the parts of a live session and refresh the expiry of both entries.
    ///
    /// Only the shard holding `id` is locked while `f` runs.
    pub fn with_parts_mut<R>(&self, id: &UploadId, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        let now = Instant::now();
        let deadline = now + self.ttl();
        let result = {
            let mut entry = self.inner.parts.get_mut(id)?;
            if entry.is_expired(now) {
                return None;
            }
            entry.expires_at = deadline;
            f(&mut entry.value)
        };
        if let Some(mut session) = self.inner.sessions.get_mut(id) {
            session.expires_at = deadline;
        }
        Some(result)
    }

    /// Push back the expiry of a live session without changing it.
    pub fn touch(&self, id: &UploadId) -> bool {
        self.with_parts_mut(id, |_| ()).is_some()
    }

    /// Remove a live session, returning its state.
    pub fn take(&self, id: &UploadId) -> Option<(S, P)> {
        let now = Instant::now();
        let session = self.inner.sessions.remove(id);
        let parts = self.inner.parts.remove(id);
        match (session, parts) {
            (Some((_, session)), Some((_, parts)))
                if !session.is_expired(now) && !parts.is_expired(now) =>
            {
                Some((session.value, parts.value))
            }
            _ => None,
        }
    }

    /// Remove a session whether or not it exists. Returns `true` if something was removed.
    pub fn remove(&self, id: &UploadId) -> bool {
        let session = self.inner.sessions.remove(id).is_some();
        let parts = self.inner.parts.remove(id).is_some();
        session || parts
    }

    /// Number of sessions currently tracked, including expired sessions not yet swept.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Sweep both tables, removing every expired entry in one batch.
    ///
    /// Returns the expired sessions so callers can release backend resources.
    pub fn collect_expired(&self) -> Vec<(UploadId, S)> {
        let now = Instant::now();

        let expired_sessions: Vec<UploadId> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let expired_parts: Vec<UploadId> = self
            .inner
            .parts
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired_parts {
            self.inner
                .parts
                .remove_if(id, |_, entry| entry.is_expired(now));
        }

        let mut reaped = Vec::with_capacity(expired_sessions.len());
        for id in expired_sessions {
            if let Some((id, entry)) = self
                .inner
                .sessions
                .remove_if(&id, |_, entry| entry.is_expired(now))
            {
                reaped.push((id, entry.value));
            }
        }

        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "reaped expired upload sessions");
        }

        reaped
    }
}

/// Handle to a running garbage collection task.
///
/// The task stops when [`GcHandle::shutdown`] is awaited or when the handle is dropped.
#[derive(Debug)]
pub struct GcHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GcHandle {
    /// Spawn a periodic sweep onto the current tokio runtime.
    ///
    /// `sweep` is invoked once per `interval`; the first sweep happens one full
    /// interval after spawning.
    pub fn spawn<F, Fut>(interval: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let token = token.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::trace!("upload gc stopped");
                            break;
                        }
                        _ = ticker.tick() => {
                            sweep().await;
                        }
                    }
                }
            }
            .instrument(tracing::debug_span!("upload-gc", ?interval))
        });

        Self {
            token,
            task: Some(task),
        }
    }

    /// Spawn a sweep over a single [`SessionManager`], dropping expired sessions.
    pub fn for_sessions<S, P>(sessions: &SessionManager<S, P>, interval: Duration) -> Self
    where
        S: Send + Sync + 'static,
        P: Send + Sync + 'static,
    {
        let sessions = sessions.clone();
        GcHandle::spawn(interval, move || {
            let reaped = sessions.collect_expired().len();
            async move {
                if reaped > 0 {
                    tracing::trace!(reaped, "gc sweep");
                }
            }
        })
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::warn!("upload gc task failed: {error}");
            }
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
