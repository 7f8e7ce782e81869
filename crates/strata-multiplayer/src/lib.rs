//! Sessions on top of the chunk store: who is connected, where chunks come
//! from, and how entity ids stay unique across peers.
//!
//! The host runs a [`HostSession`]; its store reads and writes disk through
//! a [`NetworkHostProvider`], and remote chunk requests go through the
//! [`ChunkRequestArbiter`]. Each client runs a [`ClientSession`] whose store
//! fetches through a [`NetworkClientProvider`]. Both sides create and remove
//! entities through a [`ReplicationBroker`] and sync moving entities through
//! a [`SyncCoordinator`].

pub mod arbiter;
pub mod id_assigner;
pub mod peers;
pub mod providers;
pub mod replication;
pub mod session;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use arbiter::{ArbiterStats, ChunkRequestArbiter, ChunkSource};
pub use id_assigner::{IdAssigner, IdClaim};
pub use peers::{PeerInfo, PeerRegistry};
pub use providers::{NetworkClientProvider, NetworkHostProvider};
pub use replication::{ReplicationBroker, ReplicationError};
pub use session::{ClientSession, HostSession, SessionError, SessionSettings, SessionStatus};
pub use sync::SyncCoordinator;
