use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::handoff::HandoffQueue;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the sweeper looks for expired sessions.
    pub sweep_interval: Duration,
    /// How long a disconnected session is kept for a reconnect.
    pub grace_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            grace_window: DEFAULT_GRACE_WINDOW,
        }
    }
}

/// Identity of one long-poll connection: the user plus the address it polled
/// from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub address: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.user_id, self.address)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub created_at: Instant,
    pub last_active_at: Instant,
    /// `None` while the holder is polling.
    pub disconnected_at: Option<Instant>,
    live_handles: usize,
}

impl Session {
    fn new(key: SessionKey, now: Instant) -> Self {
        Self {
            key,
            created_at: now,
            last_active_at: now,
            disconnected_at: None,
            live_handles: 0,
        }
    }

    /// Number of [`MailboxHandle`]s currently held for this session.
    pub fn live_handles(&self) -> usize {
        self.live_handles
    }

    fn is_expired(&self, cutoff: Instant) -> bool {
        matches!(self.disconnected_at, Some(left) if left < cutoff)
    }
}

/// One user's queue plus every session polling it.
pub struct Mailbox {
    user_id: String,
    created_at: Instant,
    queue: HandoffQueue<String>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Mailbox {
    fn new(user_id: String, now: Instant) -> Self {
        Self {
            user_id,
            created_at: now,
            queue: HandoffQueue::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    fn activate(&self, address: &str, now: Instant) {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(address) {
            Some(session) => {
                session.last_active_at = now;
                session.disconnected_at = None;
                session.live_handles += 1;
            }
            None => {
                let key = SessionKey::new(self.user_id.clone(), address);
                let mut session = Session::new(key, now);
                session.live_handles = 1;
                sessions.insert(address.to_string(), session);
            }
        }
    }

    /// A handle went away. The grace window starts only once the last handle
    /// for the session is gone.
    fn release(&self, address: &str, now: Instant) {
        if let Some(session) = self.sessions.lock().get_mut(address) {
            session.live_handles = session.live_handles.saturating_sub(1);
            if session.live_handles == 0 {
                session.disconnected_at = Some(now);
            }
        }
    }

    fn mark_disconnected(&self, address: &str, now: Instant) -> bool {
        match self.sessions.lock().get_mut(address) {
            Some(session) => {
                session.disconnected_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Drops sessions that left before `cutoff` and reports how many went.
    fn expire(&self, cutoff: Instant) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(cutoff));
        before - sessions.len()
    }
}

/// Handle returned by [`SessionStore::connect`]. Dropping the last handle for
/// a session marks it disconnected, which starts its grace window.
pub struct MailboxHandle {
    mailbox: Arc<Mailbox>,
    key: SessionKey,
}

impl MailboxHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub async fn wait(&self, timeout: Duration) -> Option<String> {
        self.mailbox.queue.wait(timeout).await
    }
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        self.mailbox.release(&self.key.address, Instant::now());
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_expired: usize,
    pub mailboxes_removed: usize,
}

#[derive(Debug, Clone)]
pub struct MailboxSnapshot {
    pub user_id: String,
    pub sessions: usize,
    pub pending_messages: usize,
}

/// Per-user mailboxes with lease-based session expiry.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

struct SessionStoreInner {
    mailboxes: DashMap<String, Arc<Mailbox>>,
    config: SessionConfig,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                mailboxes: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Registers (or reactivates) the session `(user_id, address)` and returns
    /// a handle on the user's mailbox.
    pub fn connect(&self, user_id: &str, address: &str) -> MailboxHandle {
        let now = Instant::now();
        // The session is inserted while the shard lock is held so a concurrent
        // sweep can never observe the mailbox without it.
        let mailbox = match self.inner.mailboxes.entry(user_id.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().activate(address, now);
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                let mailbox = Arc::new(Mailbox::new(user_id.to_string(), now));
                mailbox.activate(address, now);
                entry.insert(Arc::clone(&mailbox));
                debug!(user_id = %user_id, "mailbox opened");
                mailbox
            }
        };
        gauge!(
            "beach_post_mailboxes_active",
            self.inner.mailboxes.len() as f64
        );

        MailboxHandle {
            mailbox,
            key: SessionKey::new(user_id, address),
        }
    }

    /// Starts the grace window for a session right away, even if handles for
    /// it are still held. Returns `false` if the session is unknown.
    pub fn disconnect(&self, key: &SessionKey) -> bool {
        let Some(entry) = self.inner.mailboxes.get(&key.user_id) else {
            return false;
        };
        let mailbox = Arc::clone(entry.value());
        drop(entry);
        mailbox.mark_disconnected(&key.address, Instant::now())
    }

    /// Offers `message` to the user's mailbox. `false` means the user has no
    /// mailbox on this node.
    pub fn deliver(&self, user_id: &str, message: impl Into<String>) -> bool {
        let Some(entry) = self.inner.mailboxes.get(user_id) else {
            return false;
        };
        let mailbox = Arc::clone(entry.value());
        drop(entry);

        mailbox.queue.offer(message.into());
        counter!("beach_post_messages_delivered_local_total", 1);
        true
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.inner.mailboxes.contains_key(user_id)
    }

    pub fn mailbox_count(&self) -> usize {
        self.inner.mailboxes.len()
    }

    pub fn mailbox(&self, user_id: &str) -> Option<Arc<Mailbox>> {
        self.inner
            .mailboxes
            .get(user_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Expires sessions that disconnected before `now - grace_window` and
    /// removes mailboxes left without sessions.
    pub fn sweep_expired(&self, now: Instant) -> SweepReport {
        let Some(cutoff) = now.checked_sub(self.inner.config.grace_window) else {
            return SweepReport::default();
        };

        let user_ids: Vec<String> = self
            .inner
            .mailboxes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for user_id in user_ids {
            // `remove_if` holds the shard lock across the predicate, so a
            // `connect` for this user either lands before the expiry check or
            // after the removal, never in between.
            let removed = self.inner.mailboxes.remove_if(&user_id, |_, mailbox| {
                report.sessions_expired += mailbox.expire(cutoff);
                mailbox.session_count() == 0
            });
            if removed.is_some() {
                report.mailboxes_removed += 1;
                debug!(user_id = %user_id, "mailbox closed after last session expired");
            }
        }

        if report.sessions_expired > 0 {
            counter!(
                "beach_post_sessions_expired_total",
                report.sessions_expired as u64
            );
        }
        gauge!(
            "beach_post_mailboxes_active",
            self.inner.mailboxes.len() as f64
        );
        report
    }

    pub fn snapshot(&self) -> Vec<MailboxSnapshot> {
        let mailboxes: Vec<Arc<Mailbox>> = self
            .inner
            .mailboxes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots: Vec<MailboxSnapshot> = mailboxes
            .into_iter()
            .map(|mailbox| MailboxSnapshot {
                user_id: mailbox.user_id().to_string(),
                sessions: mailbox.session_count(),
                pending_messages: mailbox.pending_messages(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        snapshots
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            info!(
                interval_ms = store.inner.config.sweep_interval.as_millis() as u64,
                grace_ms = store.inner.config.grace_window.as_millis() as u64,
                "session sweeper started"
            );
            loop {
                interval.tick().await;
                let report = store.sweep_expired(Instant::now());
                if report.sessions_expired > 0 {
                    debug!(
                        sessions_expired = report.sessions_expired,
                        mailboxes_removed = report.mailboxes_removed,
                        "expired idle sessions"
                    );
                }
            }
        })
    }
}
