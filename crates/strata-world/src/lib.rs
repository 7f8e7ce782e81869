//! Chunked world streaming for a horizontally wrapping 2D world.
//!
//! A [`ChunkStore`] keeps a 3×3 window of [`Chunk`]s centered on a moving
//! focus. Content comes from a [`ChunkDataProvider`]: [`FileProvider`]
//! offline, or the network providers in `strata-multiplayer`. Blocking work
//! runs on a [`WorkerPool`]; the simulation thread only polls handles.

pub mod chunk;
pub mod collab;
pub mod coords;
pub mod entity;
pub mod file_provider;
pub mod pending;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod store;
pub mod terrain;
pub mod worker;

pub use chunk::{
    BlockId, CONNECTIVITY_DIRTY, Chunk, ChunkContent, LOADING, SAVE_DIRTY, Tile, TileGrid,
};
pub use collab::{CorruptChunkChoice, LoadingUi, NoPhysics, PhysicsSink};
pub use coords::{ChunkCoord, WINDOW, WorldGeometry};
pub use entity::{
    AVATAR_TAG, Avatar, CHEST_TAG, Chest, Collidable, DEBUG_MARKER_TAG, DebugMarker,
    EntityInstance, EntityState, LightEmitter, ObjectId, Replicable, TORCH_TAG, Torch,
    avatar_owner,
};
pub use file_provider::{ChunkFiles, FileProvider, chunk_file_name, world_dir};
pub use pending::{Callback, PendingRequestRegistry, RequestId, Resolution};
pub use provider::{
    ChunkDataProvider, FetchCompleter, FetchHandle, FetchOutcome, PersistCompleter,
    PersistHandle, PersistOutcome, ProviderError,
};
pub use registry::{EntityFactory, EntityRegistry, RegistryError};
pub use retry::{Backoff, RetryPolicy};
pub use serializer::{ByteReader, ByteWriter, ChunkSerError, ChunkSerializer, EncodeTarget};
pub use store::{
    ChunkStore, StoreContext, StoreSettings, StoreStats, TickOutcome, Transition,
    TransitionReport,
};
pub use terrain::{FlatTerrain, LayeredTerrain, TerrainGenerator};
pub use worker::{CancelToken, PoolError, WorkerPool};
