//! Correlation of asynchronous chunk requests with their responses.
//!
//! The simulation thread registers a request and the network thread
//! resolves it, so the map is a [`DashMap`] and ids come from an atomic
//! counter. Callbacks run after the entry has been removed, never while a
//! shard lock is held.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::coords::ChunkCoord;

/// Correlation id, unique per registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Completion callback of a pending request. `Sync` so the registry can be
/// shared between the thread that issues and the one that resolves.
pub type Callback<P> = Box<dyn FnOnce(P) + Send + Sync + 'static>;

struct PendingRequest<P> {
    coord: ChunkCoord,
    on_complete: Callback<P>,
    cancelled: bool,
}

/// What [`PendingRequestRegistry::resolve`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The callback ran.
    Completed,
    /// The request had been cancelled; the payload was dropped.
    Cancelled,
    /// No such request (already resolved, or never issued here).
    Unknown,
}

/// Outstanding requests keyed by [`RequestId`].
pub struct PendingRequestRegistry<P> {
    next_id: AtomicU64,
    entries: DashMap<RequestId, PendingRequest<P>>,
}

impl<P> Default for PendingRequestRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PendingRequestRegistry<P> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Next id from the monotonic counter.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Tracks `id` until resolved. Re-registering an id replaces the old
    /// entry, which is dropped without running its callback.
    pub fn register(
        &self,
        id: RequestId,
        coord: ChunkCoord,
        on_complete: impl FnOnce(P) + Send + Sync + 'static,
    ) {
        let previous = self.entries.insert(
            id,
            PendingRequest {
                coord,
                on_complete: Box::new(on_complete),
                cancelled: false,
            },
        );
        if previous.is_some() {
            tracing::warn!(%id, "pending request re-registered");
        }
    }

    /// Allocates an id and registers the request under it.
    pub fn issue(
        &self,
        coord: ChunkCoord,
        on_complete: impl FnOnce(P) + Send + Sync + 'static,
    ) -> RequestId {
        let id = self.next_id();
        self.register(id, coord, on_complete);
        id
    }

    /// Removes the entry and, unless it was cancelled, hands `payload` to
    /// its callback.
    pub fn resolve(&self, id: RequestId, payload: P) -> Resolution {
        let Some((_, request)) = self.entries.remove(&id) else {
            tracing::debug!(%id, "response for unknown request");
            return Resolution::Unknown;
        };
        if request.cancelled {
            tracing::debug!(%id, coord = %request.coord, "dropping response for cancelled request");
            return Resolution::Cancelled;
        }
        (request.on_complete)(payload);
        Resolution::Completed
    }

    /// Marks a request cancelled. Returns `false` if it is not pending.
    /// Calling it again is harmless.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Drops cancelled entries whose responses will never arrive.
    pub fn purge_cancelled(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, r| !r.cancelled);
        before - self.entries.len()
    }

    /// Live (not cancelled) requests, oldest id first.
    pub fn outstanding(&self) -> Vec<(RequestId, ChunkCoord)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|e| !e.cancelled)
            .map(|e| (*e.key(), e.coord))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn coord_of(&self, id: RequestId) -> Option<ChunkCoord> {
        self.entries.get(&id).map(|e| e.coord)
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.entries.get(&id).is_some_and(|e| !e.cancelled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry and returns their callbacks, e.g. to fail them
    /// all on shutdown.
    pub fn drain(&self) -> Vec<(RequestId, ChunkCoord, Callback<P>)> {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, request)) = self.entries.remove(&id)
                && !request.cancelled
            {
                out.push((id, request.coord, request.on_complete));
            }
        }
        out.sort_by_key(|(id, _, _)| *id);
        out
    }
}
