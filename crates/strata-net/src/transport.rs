//! Outbound side of a session.
//!
//! [`Transport::send`] is called from the simulation thread and from worker
//! pool jobs, so it must be thread-safe and must not block: the TCP
//! implementations encode the message and push it onto a connection's
//! bounded outbound queue.

use std::sync::Mutex;

use rustc_hash::FxHashSet;

use crate::messages::{Message, MessageError, PeerId};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no connection to {0}")]
    UnknownPeer(PeerId),
    #[error("outbound queue for {0} is full")]
    QueueFull(PeerId),
    #[error("connection to {0} is closed")]
    Closed(PeerId),
    #[error(transparent)]
    Encode(#[from] MessageError),
}

pub trait Transport: Send + Sync {
    fn send(&self, to: PeerId, message: Message) -> Result<(), SendError>;

    /// Sends `message` to every peer in `to`, logging failures.
    fn send_all(&self, to: &[PeerId], message: &Message) {
        for &peer in to {
            if let Err(e) = self.send(peer, message.clone()) {
                tracing::warn!(%peer, error = %e, "send failed");
            }
        }
    }
}

/// In-memory transport that queues sent messages for the caller to deliver.
///
/// Used to run several sessions in one process without sockets.
#[derive(Debug, Default)]
pub struct QueueTransport {
    sent: Mutex<Vec<(PeerId, Message)>>,
    unreachable: Mutex<FxHashSet<PeerId>>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything sent so far, in send order.
    pub fn take(&self) -> Vec<(PeerId, Message)> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }

    /// Makes sends to `peer` fail with [`SendError::Closed`].
    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        if let Ok(mut set) = self.unreachable.lock() {
            if unreachable {
                set.insert(peer);
            } else {
                set.remove(&peer);
            }
        }
    }
}

impl Transport for QueueTransport {
    fn send(&self, to: PeerId, message: Message) -> Result<(), SendError> {
        if self
            .unreachable
            .lock()
            .map(|set| set.contains(&to))
            .unwrap_or(false)
        {
            return Err(SendError::Closed(to));
        }
        self.sent
            .lock()
            .map_err(|_| SendError::Closed(to))?
            .push((to, message));
        Ok(())
    }
}
