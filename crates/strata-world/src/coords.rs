//! Chunk coordinates and cylindrical world geometry.
//!
//! The world wraps horizontally: chunk `x` lives in `0..width_chunks` and
//! positions past the seam fold back around. Vertically it is clamped to
//! `0..height_chunks`; window rows outside that range exist but are always
//! air and never touch storage.

use glam::Vec2;
use serde::{Deserialize, Serialize};
use strata_config::WorldConfig;

/// Side length of the always-loaded chunk window.
pub const WINDOW: usize = 3;

/// Integer chunk coordinate. `x` is kept wrapped by [`WorldGeometry`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Dimensions of a world and the conversions between world space and chunk
/// space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldGeometry {
    /// Chunk side in tiles.
    pub chunk_size: u32,
    /// Tile side in world units.
    pub block_size: f32,
    /// World circumference in chunks.
    pub width_chunks: i32,
    /// World height in chunks.
    pub height_chunks: i32,
}

impl WorldGeometry {
    pub fn new(chunk_size: u32, block_size: f32, width_chunks: i32, height_chunks: i32) -> Self {
        Self {
            chunk_size,
            block_size,
            width_chunks,
            height_chunks,
        }
    }

    pub fn from_config(config: &WorldConfig) -> Self {
        Self::new(
            config.chunk_size,
            config.block_size,
            config.planet_width_chunks,
            config.planet_height_chunks,
        )
    }

    /// Side of one chunk in world units.
    pub fn chunk_world_size(&self) -> f32 {
        self.chunk_size as f32 * self.block_size
    }

    /// Circumference of the world in world units.
    pub fn world_width(&self) -> f32 {
        self.width_chunks as f32 * self.chunk_world_size()
    }

    /// Number of tiles in one chunk.
    pub fn tiles_per_chunk(&self) -> usize {
        (self.chunk_size * self.chunk_size) as usize
    }

    pub fn wrap_x(&self, x: i32) -> i32 {
        x.rem_euclid(self.width_chunks)
    }

    /// Wrap `x` around the cylinder; `y` is left untouched.
    pub fn wrap(&self, coord: ChunkCoord) -> ChunkCoord {
        ChunkCoord::new(self.wrap_x(coord.x), coord.y)
    }

    pub fn clamp_y(&self, y: i32) -> i32 {
        y.clamp(0, self.height_chunks - 1)
    }

    /// Whether the row exists in the world (as opposed to padding above or
    /// below it).
    pub fn contains_row(&self, y: i32) -> bool {
        (0..self.height_chunks).contains(&y)
    }

    /// Chunk containing a world position: floored, x wrapped, y clamped.
    pub fn chunk_of(&self, position: Vec2) -> ChunkCoord {
        let size = self.chunk_world_size();
        let x = (position.x / size).floor() as i32;
        let y = (position.y / size).floor() as i32;
        ChunkCoord::new(self.wrap_x(x), self.clamp_y(y))
    }

    /// Fold a world position's x back into `0..world_width`.
    pub fn wrap_position(&self, position: Vec2) -> Vec2 {
        Vec2::new(position.x.rem_euclid(self.world_width()), position.y)
    }

    /// Shortest signed x distance from `from` to `to` around the cylinder.
    pub fn delta_x(&self, from: i32, to: i32) -> i32 {
        let w = self.width_chunks;
        let d = (to - from).rem_euclid(w);
        if d > w / 2 { d - w } else { d }
    }

    /// `(dx, dy)` from `from` to `to`, x measured the short way round.
    pub fn displacement(&self, from: ChunkCoord, to: ChunkCoord) -> (i32, i32) {
        (self.delta_x(from.x, to.x), to.y - from.y)
    }

    /// World-space anchor (lower-left corner) of a chunk.
    pub fn chunk_origin(&self, coord: ChunkCoord) -> Vec2 {
        let size = self.chunk_world_size();
        Vec2::new(self.wrap_x(coord.x) as f32 * size, coord.y as f32 * size)
    }

    /// Position relative to a chunk's origin, measured across the seam when
    /// the chunk sits at the wrap boundary.
    pub fn to_chunk_relative(&self, coord: ChunkCoord, position: Vec2) -> Vec2 {
        let origin = self.chunk_origin(coord);
        let width = self.world_width();
        let mut dx = (position.x - origin.x).rem_euclid(width);
        // Entities hanging just left of the origin stay slightly negative.
        if dx > width / 2.0 {
            dx -= width;
        }
        Vec2::new(dx, position.y - origin.y)
    }

    pub fn to_world(&self, coord: ChunkCoord, relative: Vec2) -> Vec2 {
        self.wrap_position(self.chunk_origin(coord) + relative)
    }

    /// Coordinates of the window centered on `center`, indexed `[i][j]`
    /// with `i` along x and `j` along y. Rows are not clamped.
    pub fn window_around(&self, center: ChunkCoord) -> [[ChunkCoord; WINDOW]; WINDOW] {
        std::array::from_fn(|i| {
            std::array::from_fn(|j| {
                ChunkCoord::new(
                    self.wrap_x(center.x + i as i32 - 1),
                    center.y + j as i32 - 1,
                )
            })
        })
    }

    /// Whether `coord` falls in the window centered on `center`.
    pub fn window_contains(&self, center: ChunkCoord, coord: ChunkCoord) -> bool {
        let (dx, dy) = self.displacement(center, coord);
        dx.abs() <= 1 && dy.abs() <= 1
    }

    /// Distance between two world positions, x measured around the seam.
    pub fn distance(&self, a: Vec2, b: Vec2) -> f32 {
        let width = self.world_width();
        let mut dx = (b.x - a.x).rem_euclid(width);
        if dx > width / 2.0 {
            dx = width - dx;
        }
        Vec2::new(dx, b.y - a.y).length()
    }
}
