//! Chunk storage: the tile grid, the chunk's entities, and its load/save flags.
//!
//! A [`Chunk`] is created once per window slot and relocated for the rest of
//! the session. While [`LOADING`] is set its content belongs to a previous
//! coordinate (or is placeholder air) and every reader gets `None`.

use serde::{Deserialize, Serialize};

use crate::coords::ChunkCoord;
use crate::entity::{EntityInstance, ObjectId};

/// Block identifier. `0` is air.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub i32);

impl BlockId {
    pub const AIR: BlockId = BlockId(0);
    pub const STONE: BlockId = BlockId(1);
    pub const DIRT: BlockId = BlockId(2);
    pub const GRASS: BlockId = BlockId(3);
}

/// One grid cell: a foreground and a background block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub fg: BlockId,
    pub bg: BlockId,
}

impl Tile {
    pub const AIR: Tile = Tile {
        fg: BlockId::AIR,
        bg: BlockId::AIR,
    };

    pub const fn new(fg: BlockId, bg: BlockId) -> Self {
        Self { fg, bg }
    }
}

/// Square tile grid stored row-major (`index = y * size + x`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileGrid {
    size: u32,
    tiles: Vec<Tile>,
}

impl TileGrid {
    pub fn new_air(size: u32) -> Self {
        Self {
            size,
            tiles: vec![Tile::AIR; (size * size) as usize],
        }
    }

    /// Builds a grid from row-major tiles. Returns `None` on a length mismatch.
    pub fn from_tiles(size: u32, tiles: Vec<Tile>) -> Option<Self> {
        (tiles.len() == (size * size) as usize).then_some(Self { size, tiles })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Tile> {
        self.index(x, y).map(|i| self.tiles[i])
    }

    /// Returns `false` when `(x, y)` is outside the grid.
    pub fn set(&mut self, x: u32, y: u32, tile: Tile) -> bool {
        match self.index(x, y) {
            Some(i) => {
                self.tiles[i] = tile;
                true
            }
            None => false,
        }
    }

    pub fn fill(&mut self, tile: Tile) {
        self.tiles.fill(tile);
    }

    pub fn is_all_air(&self) -> bool {
        self.tiles.iter().all(|t| *t == Tile::AIR)
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.size && y < self.size).then(|| (y * self.size + x) as usize)
    }
}

/// Everything a provider delivers for one coordinate.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkContent {
    pub coord: ChunkCoord,
    pub tiles: TileGrid,
    pub entities: Vec<EntityInstance>,
}

impl ChunkContent {
    pub fn air(coord: ChunkCoord, chunk_size: u32) -> Self {
        Self {
            coord,
            tiles: TileGrid::new_air(chunk_size),
            entities: Vec::new(),
        }
    }
}

/// Flag bit: an asynchronous load is outstanding; content must not be read.
pub const LOADING: u8 = 0b0000_0001;
/// Flag bit: content diverged from what was last persisted.
pub const SAVE_DIRTY: u8 = 0b0000_0010;
/// Flag bit: tile connectivity must be recomputed before rendering.
pub const CONNECTIVITY_DIRTY: u8 = 0b0000_0100;

/// A window slot's chunk.
#[derive(Debug)]
pub struct Chunk {
    coord: ChunkCoord,
    tiles: TileGrid,
    entities: Vec<EntityInstance>,
    flags: u8,
    /// Bumped whenever the chunk is repositioned.
    generation: u64,
}

impl Chunk {
    /// A clean all-air chunk at `coord`.
    pub fn placeholder(coord: ChunkCoord, chunk_size: u32) -> Self {
        Self {
            coord,
            tiles: TileGrid::new_air(chunk_size),
            entities: Vec::new(),
            flags: 0,
            generation: 0,
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// `true` while a load is outstanding.
    pub fn is_dirty(&self) -> bool {
        self.flags & LOADING != 0
    }

    pub fn needs_save(&self) -> bool {
        self.flags & SAVE_DIRTY != 0
    }

    pub fn needs_connectivity(&self) -> bool {
        self.flags & CONNECTIVITY_DIRTY != 0
    }

    pub fn mark(&mut self, flags: u8) {
        self.flags |= flags;
    }

    pub fn clear(&mut self, flags: u8) {
        self.flags &= !flags;
    }

    pub fn tiles(&self) -> Option<&TileGrid> {
        (!self.is_dirty()).then_some(&self.tiles)
    }

    pub fn entities(&self) -> Option<&[EntityInstance]> {
        (!self.is_dirty()).then_some(self.entities.as_slice())
    }

    pub fn tile(&self, x: u32, y: u32) -> Option<Tile> {
        self.tiles()?.get(x, y)
    }

    /// Edits a tile. Refused while loading.
    pub fn set_tile(&mut self, x: u32, y: u32, tile: Tile) -> bool {
        if self.is_dirty() || !self.tiles.set(x, y, tile) {
            return false;
        }
        self.flags |= SAVE_DIRTY | CONNECTIVITY_DIRTY;
        true
    }

    /// Repositions the chunk and marks it loading. The previous content
    /// stays in place, unreadable, until [`Chunk::apply`] replaces it.
    pub fn begin_move(&mut self, coord: ChunkCoord) {
        self.coord = coord;
        self.generation += 1;
        self.flags = LOADING;
    }

    /// Installs freshly loaded content. The caller has already checked that
    /// `content.coord` matches.
    pub fn apply(&mut self, content: ChunkContent) {
        debug_assert_eq!(content.coord, self.coord);
        self.tiles = content.tiles;
        self.entities = content.entities;
        self.flags = CONNECTIVITY_DIRTY;
    }

    /// Relocates `source`'s content into this chunk without I/O.
    ///
    /// Tiles and the entity list are moved, so `source` is left holding this
    /// chunk's previous buffers; it is expected to be overwritten or
    /// re-moved next. The result carries `source`'s flags, so a loaded
    /// source produces a clean chunk.
    pub fn move_and_copy(&mut self, source: &mut Chunk) {
        self.coord = source.coord;
        self.generation += 1;
        std::mem::swap(&mut self.tiles, &mut source.tiles);
        std::mem::swap(&mut self.entities, &mut source.entities);
        self.flags = source.flags;
        source.entities.clear();
        source.flags = LOADING;
    }

    /// Drops content and returns the entities so the caller can detach them
    /// from physics. The chunk stays loading until moved again.
    pub fn dispose(&mut self) -> Vec<EntityInstance> {
        self.flags = LOADING;
        self.tiles.fill(Tile::AIR);
        std::mem::take(&mut self.entities)
    }

    /// Content snapshot for persistence. `None` while loading.
    pub fn snapshot(&self) -> Option<ChunkContent> {
        if self.is_dirty() {
            return None;
        }
        Some(ChunkContent {
            coord: self.coord,
            tiles: self.tiles.clone(),
            entities: self.entities.clone(),
        })
    }

    // --- entity access (loaded chunks only) ---

    pub fn push_entity(&mut self, entity: EntityInstance) -> bool {
        if self.is_dirty() {
            return false;
        }
        self.entities.push(entity);
        self.flags |= SAVE_DIRTY;
        true
    }

    pub fn take_entity(&mut self, id: ObjectId) -> Option<EntityInstance> {
        if self.is_dirty() {
            return None;
        }
        let index = self.entities.iter().position(|e| e.object_id == id)?;
        self.flags |= SAVE_DIRTY;
        Some(self.entities.remove(index))
    }

    pub fn entity(&self, id: ObjectId) -> Option<&EntityInstance> {
        self.entities()?.iter().find(|e| e.object_id == id)
    }

    pub fn entity_mut(&mut self, id: ObjectId) -> Option<&mut EntityInstance> {
        if self.is_dirty() {
            return None;
        }
        self.entities.iter_mut().find(|e| e.object_id == id)
    }

    /// Removes every entity matching `pred`, returning them.
    pub fn drain_entities_where(
        &mut self,
        mut pred: impl FnMut(&EntityInstance) -> bool,
    ) -> Vec<EntityInstance> {
        if self.is_dirty() {
            return Vec::new();
        }
        let (drained, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entities).into_iter().partition(|e| pred(e));
        self.entities = kept;
        drained
    }
}
