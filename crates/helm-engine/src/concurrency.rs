//! Per-session mutual exclusion with a FIFO waiter queue.
//!
//! At most one holder per session. Later callers queue behind it and are
//! promoted in arrival order when the holder releases. Clearing a session
//! rejects every waiter and drops the record.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use helm_core::{MessageId, PipelineError, SessionId};
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// What a lock holder (or waiter) is processing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDescriptor {
    pub message_id: MessageId,
    pub submitted_at: DateTime<Utc>,
}

impl MessageDescriptor {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            submitted_at: Utc::now(),
        }
    }
}

type WaitResult = Result<(), PipelineError>;

struct Waiter {
    ticket: u64,
    descriptor: MessageDescriptor,
    tx: oneshot::Sender<WaitResult>,
}

struct LockRecord {
    holder_ticket: u64,
    holder: MessageDescriptor,
    waiters: VecDeque<Waiter>,
}

/// Completion handle returned by [`ConcurrencyManager::acquire_lock`].
pub struct WaitHandle {
    session_id: SessionId,
    rx: Option<oneshot::Receiver<WaitResult>>,
}

impl WaitHandle {
    fn ready(session_id: SessionId) -> Self {
        Self { session_id, rx: None }
    }

    /// True when the lock was granted immediately.
    pub fn is_ready(&self) -> bool {
        self.rx.is_none()
    }

    /// Resolve once this caller holds the lock. Rejected with
    /// [`PipelineError::SessionCleared`] if the session is cleared first.
    pub async fn wait(self) -> WaitResult {
        let Some(rx) = self.rx else {
            return Ok(());
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::SessionCleared {
                session_id: self.session_id,
                reason: "lock record dropped".to_owned(),
            }),
        }
    }
}

/// Result of [`ConcurrencyManager::acquire_lock`].
pub struct LockAcquisition {
    pub acquired: bool,
    /// Identifies this caller's place (holder or waiter) in the record.
    pub ticket: u64,
    pub wait: WaitHandle,
}

/// Per-session lock table.
#[derive(Default)]
pub struct ConcurrencyManager {
    locks: Mutex<HashMap<SessionId, LockRecord>>,
    next_ticket: AtomicU64,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the holder, or join the queue behind the current one.
    #[instrument(skip(self, descriptor), fields(session_id = %session_id, message_id = %descriptor.message_id))]
    pub fn acquire_lock(&self, session_id: &SessionId, descriptor: MessageDescriptor) -> LockAcquisition {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut locks = self.locks.lock();

        let acquisition = match locks.get_mut(session_id) {
            None => {
                let _ = locks.insert(
                    session_id.clone(),
                    LockRecord {
                        holder_ticket: ticket,
                        holder: descriptor,
                        waiters: VecDeque::new(),
                    },
                );
                debug!("lock acquired");
                LockAcquisition {
                    acquired: true,
                    ticket,
                    wait: WaitHandle::ready(session_id.clone()),
                }
            }
            Some(record) => {
                let (tx, rx) = oneshot::channel();
                record.waiters.push_back(Waiter {
                    ticket,
                    descriptor,
                    tx,
                });
                debug!(position = record.waiters.len(), "queued behind holder");
                LockAcquisition {
                    acquired: false,
                    ticket,
                    wait: WaitHandle {
                        session_id: session_id.clone(),
                        rx: Some(rx),
                    },
                }
            }
        };
        publish_gauges(&locks);
        acquisition
    }

    /// Acquire and wait for the lock, returning a guard that releases it.
    pub async fn lease(
        self: &Arc<Self>,
        session_id: &SessionId,
        descriptor: MessageDescriptor,
    ) -> Result<SessionLease, PipelineError> {
        let acquisition = self.acquire_lock(session_id, descriptor);
        let lease = SessionLease::new(Arc::clone(self), session_id.clone(), acquisition.ticket);
        match acquisition.wait.wait().await {
            Ok(()) => Ok(lease),
            Err(e) => {
                lease.forget();
                Err(e)
            }
        }
    }

    /// Drop the holder and promote the next live waiter. Returns `false`
    /// when the session had no lock record.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn release_lock(&self, session_id: &SessionId) -> bool {
        let mut locks = self.locks.lock();
        let released = release_locked(&mut locks, session_id);
        publish_gauges(&locks);
        released
    }

    /// Reject every waiter with `SessionCleared` and delete the record.
    /// Returns how many waiters were rejected.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn clear_session(&self, session_id: &SessionId, reason: &str) -> usize {
        let record = {
            let mut locks = self.locks.lock();
            let record = locks.remove(session_id);
            publish_gauges(&locks);
            record
        };
        let Some(record) = record else {
            return 0;
        };
        let rejected = record.waiters.len();
        for waiter in record.waiters {
            let _ = waiter.tx.send(Err(PipelineError::SessionCleared {
                session_id: session_id.clone(),
                reason: reason.to_owned(),
            }));
        }
        if rejected > 0 {
            warn!(rejected, reason, "session cleared with pending messages");
        } else {
            info!(reason, "session cleared");
        }
        rejected
    }

    pub fn is_processing(&self, session_id: &SessionId) -> bool {
        self.locks.lock().contains_key(session_id)
    }

    /// Number of callers waiting behind the holder.
    pub fn queue_depth(&self, session_id: &SessionId) -> usize {
        self.locks
            .lock()
            .get(session_id)
            .map_or(0, |r| r.waiters.len())
    }

    pub fn holder(&self, session_id: &SessionId) -> Option<MessageDescriptor> {
        self.locks.lock().get(session_id).map(|r| r.holder.clone())
    }

    /// Descriptors of queued callers, oldest first.
    pub fn waiters(&self, session_id: &SessionId) -> Vec<MessageDescriptor> {
        self.locks
            .lock()
            .get(session_id)
            .map(|r| r.waiters.iter().map(|w| w.descriptor.clone()).collect())
            .unwrap_or_default()
    }

    pub fn active_sessions(&self) -> usize {
        self.locks.lock().len()
    }

    // Release on behalf of one ticket: a holder releases, a waiter leaves
    // the queue. Anything else (cleared, already released) is a no-op.
    fn release_ticket(&self, session_id: &SessionId, ticket: u64) {
        let mut locks = self.locks.lock();
        let Some(record) = locks.get_mut(session_id) else {
            return;
        };
        if record.holder_ticket == ticket {
            let _ = release_locked(&mut locks, session_id);
        } else {
            record.waiters.retain(|w| w.ticket != ticket);
        }
        publish_gauges(&locks);
    }

    fn holds(&self, session_id: &SessionId, ticket: u64) -> bool {
        self.locks
            .lock()
            .get(session_id)
            .is_some_and(|r| r.holder_ticket == ticket)
    }
}

fn release_locked(locks: &mut HashMap<SessionId, LockRecord>, session_id: &SessionId) -> bool {
    let Some(record) = locks.get_mut(session_id) else {
        debug!("release on unlocked session");
        return false;
    };
    while let Some(waiter) = record.waiters.pop_front() {
        if waiter.tx.is_closed() {
            debug!(message_id = %waiter.descriptor.message_id, "skipping abandoned waiter");
            continue;
        }
        let ticket = waiter.ticket;
        let descriptor = waiter.descriptor.clone();
        if waiter.tx.send(Ok(())).is_ok() {
            debug!(message_id = %descriptor.message_id, "promoted next waiter");
            record.holder_ticket = ticket;
            record.holder = descriptor;
            return true;
        }
    }
    let _ = locks.remove(session_id);
    debug!("lock released");
    true
}

#[allow(clippy::cast_precision_loss)]
fn publish_gauges(locks: &HashMap<SessionId, LockRecord>) {
    let waiting: usize = locks.values().map(|r| r.waiters.len()).sum();
    gauge!("session_locks_active").set(locks.len() as f64);
    gauge!("session_lock_waiters").set(waiting as f64);
}

/// Guard over a lock ticket.
///
/// Dropping it releases the lock (or leaves the queue if still waiting).
/// [`SessionLease::fail`] clears the session instead, rejecting waiters.
pub struct SessionLease {
    manager: Arc<ConcurrencyManager>,
    session_id: SessionId,
    ticket: u64,
    armed: bool,
}

impl SessionLease {
    pub fn new(manager: Arc<ConcurrencyManager>, session_id: SessionId, ticket: u64) -> Self {
        Self {
            manager,
            session_id,
            ticket,
            armed: true,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_held(&self) -> bool {
        self.armed && self.manager.holds(&self.session_id, self.ticket)
    }

    /// Release the lock and promote the next waiter.
    pub fn release(mut self) {
        self.armed = false;
        self.manager.release_ticket(&self.session_id, self.ticket);
    }

    /// Clear the session: every waiter is rejected and the record removed.
    /// Returns the number of rejected waiters.
    pub fn fail(mut self, reason: &str) -> usize {
        self.armed = false;
        if self.manager.holds(&self.session_id, self.ticket) {
            self.manager.clear_session(&self.session_id, reason)
        } else {
            self.manager.release_ticket(&self.session_id, self.ticket);
            0
        }
    }

    fn forget(mut self) {
        self.armed = false;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.armed {
            self.manager.release_ticket(&self.session_id, self.ticket);
        }
    }
}
