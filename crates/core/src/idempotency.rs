//! At-most-once execution control for client-retried operations.
//!
//! Each client-supplied key owns at most one record which moves through
//! `Absent → InFlight → Completed`. The `Absent → InFlight` transition is a
//! single atomic test-and-set on the map entry, so two concurrent requests
//! can never both win ownership of a key. There is no lock shared across
//! keys.

use crate::config::IdempotencyConfig;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

/// Identifies the logical operation an idempotency key was issued for.
pub type Fingerprint = [u8; 32];

/// SHA-256 over method, path, and the normalized query string. Query pairs
/// are sorted so `?a=1&b=2` and `?b=2&a=1` name the same operation.
pub fn fingerprint(method: &str, path: &str, query: Option<&str>) -> Fingerprint {
    let mut pairs: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();
    pairs.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    for pair in pairs {
        hasher.update(pair.as_bytes());
        hasher.update([b'&']);
    }
    hasher.finalize().into()
}

/// Response snapshot replayed verbatim for retried requests.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

enum RecordState {
    InFlight { notify: Arc<Notify> },
    Completed { response: StoredResponse },
}

struct IdempotencyRecord {
    fingerprint: Fingerprint,
    state: RecordState,
    created_at: Instant,
}

impl IdempotencyRecord {
    fn in_flight(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            state: RecordState::InFlight {
                notify: Arc::new(Notify::new()),
            },
            created_at: Instant::now(),
        }
    }
}

/// Outcome of [`IdempotencyStore::guard`].
#[derive(Debug)]
pub enum GuardDecision {
    /// The caller owns the key and must run the operation, then either
    /// `complete` the guard or drop it to make the key retryable.
    Allow(ExecutionGuard),
    /// A previous execution finished; return its response verbatim.
    Replay(StoredResponse),
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Another request holds the key and did not finish within the wait
    /// timeout.
    AlreadyExecuting,
    /// The key was issued for a different method/path/query.
    FingerprintMismatch,
}

#[derive(Debug, Clone, Copy)]
struct Tunables {
    wait_timeout: Duration,
    retention: Duration,
}

/// In-memory keyed record store. Per-key transitions are atomic through the
/// map entry; waiting for an in-flight owner never holds a map lock.
pub struct IdempotencyStore {
    records: DashMap<Uuid, IdempotencyRecord>,
    tunables: RwLock<Tunables>,
}

enum Probe {
    Acquired,
    Replay(StoredResponse),
    Mismatch,
    Wait(Arc<Notify>),
}

impl IdempotencyStore {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            records: DashMap::new(),
            tunables: RwLock::new(Tunables::from(config)),
        }
    }

    /// Update tunables (called on config hot-reload).
    pub fn update_config(&self, config: &IdempotencyConfig) {
        if let Ok(mut tunables) = self.tunables.write() {
            *tunables = Tunables::from(config);
        }
    }

    /// Decide whether an operation keyed by `key` may execute.
    ///
    /// When another request holds the key for the same operation, blocks up
    /// to the configured wait timeout for the owner to finish, then replays
    /// its response; on timeout the caller is rejected, never left hanging.
    pub async fn guard(self: &Arc<Self>, key: Uuid, fingerprint: Fingerprint) -> GuardDecision {
        let wait_timeout = self.tunables().wait_timeout;
        let deadline = tokio::time::Instant::now() + wait_timeout;

        loop {
            let notify = match self.probe(key, fingerprint) {
                Probe::Acquired => return GuardDecision::Allow(self.execution_guard(key)),
                Probe::Replay(response) => return GuardDecision::Replay(response),
                Probe::Mismatch => {
                    return GuardDecision::Reject(RejectReason::FingerprintMismatch)
                }
                Probe::Wait(notify) => notify,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // The owner may have finished between the probe and the waiter
            // registration above; look again before sleeping.
            match self.probe(key, fingerprint) {
                Probe::Acquired => return GuardDecision::Allow(self.execution_guard(key)),
                Probe::Replay(response) => return GuardDecision::Replay(response),
                Probe::Mismatch => {
                    return GuardDecision::Reject(RejectReason::FingerprintMismatch)
                }
                Probe::Wait(_) => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Timed out. One final look: the owner may have completed
                // right at the deadline.
                return match self.probe(key, fingerprint) {
                    Probe::Replay(response) => GuardDecision::Replay(response),
                    _ => GuardDecision::Reject(RejectReason::AlreadyExecuting),
                };
            }
        }
    }

    /// Single atomic examination of the key, taking ownership when the key
    /// is absent or its record has expired.
    fn probe(&self, key: Uuid, fingerprint: Fingerprint) -> Probe {
        let retention = self.tunables().retention;

        match self.records.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(IdempotencyRecord::in_flight(fingerprint));
                Probe::Acquired
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get();
                if record.created_at.elapsed() >= retention {
                    // Expired Completed records are evicted; expired InFlight
                    // records count as abandoned. Either way the key is
                    // Absent again and the caller takes ownership.
                    if let RecordState::InFlight { notify } = &record.state {
                        notify.notify_waiters();
                    }
                    entry.insert(IdempotencyRecord::in_flight(fingerprint));
                    return Probe::Acquired;
                }
                if record.fingerprint != fingerprint {
                    return Probe::Mismatch;
                }
                match &record.state {
                    RecordState::Completed { response } => Probe::Replay(response.clone()),
                    RecordState::InFlight { notify } => Probe::Wait(notify.clone()),
                }
            }
        }
    }

    fn execution_guard(self: &Arc<Self>, key: Uuid) -> ExecutionGuard {
        ExecutionGuard {
            store: self.clone(),
            key,
            armed: true,
        }
    }

    /// `InFlight → Completed`. The retention window restarts here so the
    /// replay window is measured from completion, not from acquisition.
    fn complete(&self, key: Uuid, response: StoredResponse) {
        if let Some(mut record) = self.records.get_mut(&key)
            && let RecordState::InFlight { notify } = &record.state
        {
            let notify = notify.clone();
            record.state = RecordState::Completed { response };
            record.created_at = Instant::now();
            notify.notify_waiters();
        }
    }

    /// Removes an in-flight record so the key becomes retryable. Completed
    /// records are never touched.
    fn abandon(&self, key: Uuid) {
        if let Some((_, record)) = self
            .records
            .remove_if(&key, |_, r| matches!(r.state, RecordState::InFlight { .. }))
            && let RecordState::InFlight { notify } = record.state
        {
            notify.notify_waiters();
        }
    }

    /// Drop expired records. Invoked periodically by the application so the
    /// store stays bounded even for keys that are never looked up again.
    pub fn purge_expired(&self) -> usize {
        let retention = self.tunables().retention;
        let before = self.records.len();
        self.records.retain(|_, record| {
            let expired = record.created_at.elapsed() >= retention;
            if expired
                && let RecordState::InFlight { notify } = &record.state
            {
                notify.notify_waiters();
            }
            !expired
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn tunables(&self) -> Tunables {
        *self.tunables.read().expect("tunables lock poisoned")
    }
}

impl From<&IdempotencyConfig> for Tunables {
    fn from(config: &IdempotencyConfig) -> Self {
        Self {
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
            retention: Duration::from_secs(config.retention_secs),
        }
    }
}

/// RAII ownership of an in-flight key. `complete` caches the response for
/// replay; dropping the guard without completing (handler failure, client
/// disconnect dropping the request future) resets the key to `Absent` so a
/// retry can execute.
pub struct ExecutionGuard {
    store: Arc<IdempotencyStore>,
    key: Uuid,
    armed: bool,
}

impl fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl ExecutionGuard {
    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn complete(mut self, response: StoredResponse) {
        self.armed = false;
        self.store.complete(self.key, response);
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.store.abandon(self.key);
        }
    }
}
