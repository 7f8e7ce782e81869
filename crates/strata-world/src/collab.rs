//! Narrow interfaces to the physics and UI collaborators.

use crate::coords::ChunkCoord;
use crate::entity::EntityInstance;

/// Receives entities as chunks enter and leave the simulation.
pub trait PhysicsSink {
    fn add_entities(&mut self, entities: &[EntityInstance]);
    fn remove_entities(&mut self, entities: &[EntityInstance]);
}

/// The user's answer when a chunk cannot be loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptChunkChoice {
    /// Replace the chunk with fresh terrain.
    Regenerate,
    /// Leave the session.
    Abort,
}

/// Loading feedback and the corrupt-chunk prompt.
pub trait LoadingUi {
    /// Called only when the state changes.
    fn show_loading_screen(&mut self, visible: bool);

    /// Modal prompt; the simulation is frozen while it is open.
    fn show_corrupt_chunk_dialog(&mut self, coord: ChunkCoord) -> CorruptChunkChoice;
}

/// Physics sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPhysics;

impl PhysicsSink for NoPhysics {
    fn add_entities(&mut self, _entities: &[EntityInstance]) {}
    fn remove_entities(&mut self, _entities: &[EntityInstance]) {}
}
