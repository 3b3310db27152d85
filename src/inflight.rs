//! In-flight registry (C3): a process-wide table admitting correlation IDs
//! against global and per-client caps, with cancellation on drop and
//! bulk-fail on shutdown (spec §4.3).
//!
//! The table itself (`GLOBAL`) is a single process-wide [`DashMap`] so that
//! several [`crate::client::Client`] instances in one process share one
//! resource-bounding table, matching spec §4.3's "Process-wide lock-free
//! map" and the two-step admission check (global cap, then per-client cap).
//! Each `Client` gets its own [`InflightRegistry`] handle (cheap to clone —
//! it is just a client id plus its configured caps) rather than holding a
//! connection back-reference, so there are no ownership cycles between
//! connections and the registry (spec §9).
//!
//! C3 owns admission and cancellation only. Reply delivery is owned by the
//! connection that sent the request: C2's read pump correlates each reply to
//! its waiter through its own per-connection, send-order queue of oneshots
//! (`connection.rs`'s `order_tx`/`order_rx`), since RESP carries no wire-level
//! request id to key a shared table on. `PendingRequest` is a pure admission
//! guard — it does not carry a completion value, so there is no second,
//! redundant completion path to keep in sync with the connection's.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{RedisCoreError, RedisCoreResult};

pub type CorrelationId = u64;
pub type ClientId = u64;

struct Entry {
    client_id: ClientId,
}

struct GlobalState {
    entries: DashMap<CorrelationId, Entry>,
    next_correlation_id: AtomicU64,
    next_client_id: AtomicU64,
    global_pending: AtomicI64,
    per_client_pending: DashMap<ClientId, Arc<AtomicI64>>,
}

static GLOBAL: Lazy<GlobalState> = Lazy::new(|| GlobalState {
    entries: DashMap::new(),
    next_correlation_id: AtomicU64::new(1),
    next_client_id: AtomicU64::new(1),
    global_pending: AtomicI64::new(0),
    per_client_pending: DashMap::new(),
});

/// A handle to the shared registry, scoped to one logical client. Cloning is
/// cheap: it does not clone the table, only the (client id, caps) pair.
#[derive(Clone, Copy, Debug)]
pub struct InflightRegistry {
    client_id: ClientId,
    max_global: i64,
    max_per_client: i64,
}

impl InflightRegistry {
    pub fn new(max_global: usize, max_per_client: usize) -> Self {
        let client_id = GLOBAL.next_client_id.fetch_add(1, Ordering::Relaxed);
        GLOBAL
            .per_client_pending
            .insert(client_id, Arc::new(AtomicI64::new(0)));
        InflightRegistry {
            client_id,
            max_global: max_global as i64,
            max_per_client: max_per_client as i64,
        }
    }

    /// Admission (spec §4.3 `register`). On success, returns a
    /// [`PendingRequest`] guard that holds the request's slot in both caps
    /// until it is dropped — on normal completion, on timeout, or on early
    /// cancellation (spec §4.9: "dropping the returned future signals C3,
    /// which removes the entry and decrements counters").
    pub fn register(&self) -> RedisCoreResult<PendingRequest> {
        let global = GLOBAL.global_pending.load(Ordering::Relaxed);
        if self.max_global > 0 && global >= self.max_global {
            return Err(RedisCoreError::Backpressure {
                pending: global.max(0) as usize,
            });
        }

        let per_client_counter = GLOBAL
            .per_client_pending
            .entry(self.client_id)
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();

        if self.max_per_client > 0 {
            let current = per_client_counter.load(Ordering::Relaxed);
            if current >= self.max_per_client {
                return Err(RedisCoreError::ClientInflightExceeded {
                    pending: current.max(0) as usize,
                });
            }
        }

        let id = GLOBAL.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        GLOBAL.entries.insert(id, Entry { client_id: self.client_id });
        GLOBAL.global_pending.fetch_add(1, Ordering::Relaxed);
        per_client_counter.fetch_add(1, Ordering::Relaxed);

        Ok(PendingRequest {
            registry: *self,
            id,
            live: true,
        })
    }

    /// Removes the entry and decrements both counters; used by
    /// [`PendingRequest::drop`] and [`Self::close`].
    fn cancel(&self, id: CorrelationId) {
        if let Some((_, entry)) = GLOBAL.entries.remove(&id) {
            self.decrement(entry.client_id);
        }
    }

    fn decrement(&self, client_id: ClientId) {
        GLOBAL.global_pending.fetch_sub(1, Ordering::Relaxed);
        if let Some(counter) = GLOBAL.per_client_pending.get(&client_id) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Shutdown (spec §4.3): release every in-flight admission this client
    /// holds, then clear its counter. Callers already in `Client::execute`
    /// observe the closed state through [`crate::client::Client`]'s own
    /// `closed` flag, not through this table.
    pub fn close(&self) {
        let ids: Vec<CorrelationId> = GLOBAL
            .entries
            .iter()
            .filter(|entry| entry.value().client_id == self.client_id)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.cancel(id);
        }
        GLOBAL.per_client_pending.remove(&self.client_id);
    }

    pub fn pending_count(&self) -> i64 {
        GLOBAL
            .per_client_pending
            .get(&self.client_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn global_pending_count() -> i64 {
        GLOBAL.global_pending.load(Ordering::Relaxed)
    }
}

/// An admission guard for one logical request. Holds its correlation id's
/// slot in both the global and per-client caps until dropped; the reply
/// itself is delivered by the connection's own oneshot, not by this type.
pub struct PendingRequest {
    registry: InflightRegistry,
    id: CorrelationId,
    live: bool,
}

impl PendingRequest {
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.live {
            self.live = false;
            self.registry.cancel(self.id);
        }
    }
}

/// Used only by tests that need a wall-clock-free view of admission deadlines.
#[cfg(test)]
pub(crate) fn now() -> Instant {
    Instant::now()
}
