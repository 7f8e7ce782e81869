//! The chunk data provider contract.
//!
//! A provider is called from the simulation thread and must never block it:
//! `fetch` and `persist` return handles immediately while the work happens on
//! the worker pool or the network. Errors stay inside the provider; the
//! simulation thread only ever sees a [`FetchOutcome`].

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};

use crate::chunk::ChunkContent;
use crate::coords::ChunkCoord;
use crate::serializer::ChunkSerError;
use crate::worker::{CancelToken, PoolError};

/// Result of a fetch as seen by the simulation thread.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Content is available. `generated` is set when nothing was stored for
    /// the coordinate and the content was synthesized; such chunks need a
    /// save.
    Ready {
        content: ChunkContent,
        generated: bool,
    },
    /// Transient failure; the caller may issue the fetch again.
    Retry { reason: String },
    /// Retries are exhausted; the user has to choose what happens.
    NeedsUserDecision { reason: String },
}

impl FetchOutcome {
    pub fn ready(content: ChunkContent) -> Self {
        Self::Ready {
            content,
            generated: false,
        }
    }
}

/// Provider-internal failures. Mapped to [`FetchOutcome`] before crossing to
/// the simulation thread.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("chunk i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk data is corrupt: {0}")]
    Corrupt(#[from] ChunkSerError),
    #[error("stored chunk claims coordinate {found}, expected {expected}")]
    WrongCoordinate {
        expected: ChunkCoord,
        found: ChunkCoord,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("connection to the data source was lost")]
    Disconnected,
}

type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// Simulation-side end of an outstanding fetch.
pub struct FetchHandle {
    coord: ChunkCoord,
    receiver: Receiver<FetchOutcome>,
    token: CancelToken,
    on_cancel: Option<CancelHook>,
}

/// Worker-side end of an outstanding fetch.
pub struct FetchCompleter {
    coord: ChunkCoord,
    sender: Sender<FetchOutcome>,
    token: CancelToken,
}

impl FetchHandle {
    /// A connected handle/completer pair.
    pub fn pair(coord: ChunkCoord) -> (FetchCompleter, FetchHandle) {
        let (sender, receiver) = bounded(1);
        let token = CancelToken::new();
        (
            FetchCompleter {
                coord,
                sender,
                token: token.clone(),
            },
            FetchHandle {
                coord,
                receiver,
                token,
                on_cancel: None,
            },
        )
    }

    /// A handle that is already complete.
    pub fn ready(coord: ChunkCoord, outcome: FetchOutcome) -> Self {
        let (completer, handle) = Self::pair(coord);
        completer.complete(outcome);
        handle
    }

    /// Runs `hook` when the handle is cancelled, e.g. to drop a pending
    /// network request.
    pub fn with_cancel_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Non-blocking completion check. A completer dropped without answering
    /// reads as a retryable failure.
    pub fn poll(&self) -> Option<FetchOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(FetchOutcome::Retry {
                reason: format!("fetch for {} was abandoned", self.coord),
            }),
        }
    }

    /// Blocking wait. Only for tests and shutdown paths, never the
    /// simulation loop.
    pub fn wait(&self, timeout: Duration) -> Option<FetchOutcome> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(FetchOutcome::Retry {
                reason: format!("fetch for {} was abandoned", self.coord),
            }),
        }
    }

    /// Cancels the fetch. Any later result is discarded by the completer.
    pub fn cancel(mut self) {
        self.token.cancel();
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle")
            .field("coord", &self.coord)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl FetchCompleter {
    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Delivers the outcome. Returns `false` if the fetch was cancelled or
    /// the handle is gone; the outcome is dropped in that case.
    pub fn complete(self, outcome: FetchOutcome) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.sender.send(outcome).is_ok()
    }
}

/// Result of a persist request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Written to local storage.
    Saved,
    /// Handed to the network; no acknowledgement will follow.
    Sent,
    Failed(String),
}

/// Completion of a persist request.
#[derive(Debug)]
pub struct PersistHandle {
    receiver: Receiver<PersistOutcome>,
}

/// Worker-side end of a persist request.
#[derive(Debug)]
pub struct PersistCompleter {
    sender: Sender<PersistOutcome>,
}

impl PersistHandle {
    pub fn pair() -> (PersistCompleter, PersistHandle) {
        let (sender, receiver) = bounded(1);
        (PersistCompleter { sender }, PersistHandle { receiver })
    }

    pub fn done(outcome: PersistOutcome) -> Self {
        let (completer, handle) = Self::pair();
        completer.complete(outcome);
        handle
    }

    pub fn poll(&self) -> Option<PersistOutcome> {
        self.receiver.try_recv().ok()
    }

    /// Blocking wait for shutdown paths.
    pub fn wait(&self, timeout: Duration) -> Option<PersistOutcome> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl PersistCompleter {
    pub fn complete(self, outcome: PersistOutcome) {
        let _ = self.sender.send(outcome);
    }
}

/// Supplies chunk content for coordinates and persists it back.
///
/// Coordinates passed in are already x-wrapped and within the world's
/// vertical range.
pub trait ChunkDataProvider: Send + Sync {
    fn fetch(&self, coord: ChunkCoord) -> FetchHandle;

    fn persist(&self, content: ChunkContent) -> PersistHandle;

    /// Whether `persist` writes the authoritative copy. Content synthesized
    /// on this side is only queued for saving when it does.
    fn owns_storage(&self) -> bool {
        true
    }

    /// Pushes anything still buffered to durable storage. Blocking; used at
    /// shutdown.
    fn flush(&self) {}
}
