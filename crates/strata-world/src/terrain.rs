//! Terrain generation collaborator.
//!
//! The store only needs `generate(seed, coord) -> tiles`; [`LayeredTerrain`]
//! is the generator shipped with the binary.

use std::f64::consts::TAU;

use noise::{NoiseFn, Perlin};

use crate::chunk::{BlockId, Tile, TileGrid};
use crate::coords::{ChunkCoord, WorldGeometry};

/// Produces the tile grid for a chunk from the world seed.
pub trait TerrainGenerator: Send + Sync {
    fn generate(&self, seed: u64, coord: ChunkCoord, geometry: &WorldGeometry) -> TileGrid;
}

/// Flat ground: stone below `surface_tile`, grass on it, air above.
#[derive(Debug, Clone, Copy)]
pub struct FlatTerrain {
    /// Surface height in world tiles.
    pub surface_tile: i64,
}

impl TerrainGenerator for FlatTerrain {
    fn generate(&self, _seed: u64, coord: ChunkCoord, geometry: &WorldGeometry) -> TileGrid {
        let size = geometry.chunk_size;
        let mut grid = TileGrid::new_air(size);
        for ly in 0..size {
            let wy = coord.y as i64 * size as i64 + ly as i64;
            let tile = if wy < self.surface_tile {
                Tile::new(BlockId::STONE, BlockId::STONE)
            } else if wy == self.surface_tile {
                Tile::new(BlockId::GRASS, BlockId::DIRT)
            } else {
                continue;
            };
            for lx in 0..size {
                grid.set(lx, ly, tile);
            }
        }
        grid
    }
}

/// Perlin heightline sampled around a circle so the surface is seamless
/// across the horizontal wrap.
#[derive(Debug, Clone, Copy)]
pub struct LayeredTerrain {
    /// Mean surface height as a fraction of world height.
    pub surface_fraction: f64,
    /// Surface variation in tiles.
    pub amplitude: f64,
    /// Hills per world circumference.
    pub hills: f64,
    /// Dirt thickness in tiles below the grass line.
    pub dirt_depth: f64,
}

impl Default for LayeredTerrain {
    fn default() -> Self {
        Self {
            surface_fraction: 0.6,
            amplitude: 24.0,
            hills: 12.0,
            dirt_depth: 4.0,
        }
    }
}

impl LayeredTerrain {
    /// Surface height in tiles at world tile column `wx`.
    pub fn surface_at(&self, perlin: &Perlin, wx: i64, geometry: &WorldGeometry) -> f64 {
        let width_tiles = geometry.width_chunks as f64 * geometry.chunk_size as f64;
        let height_tiles = geometry.height_chunks as f64 * geometry.chunk_size as f64;
        let angle = TAU * wx as f64 / width_tiles;
        let radius = self.hills / TAU;
        let sample = perlin.get([radius * angle.cos(), radius * angle.sin()]);
        height_tiles * self.surface_fraction + sample * self.amplitude
    }
}

impl TerrainGenerator for LayeredTerrain {
    fn generate(&self, seed: u64, coord: ChunkCoord, geometry: &WorldGeometry) -> TileGrid {
        // Perlin takes a u32 seed; fold the high half in.
        let perlin = Perlin::new((seed ^ (seed >> 32)) as u32);
        let size = geometry.chunk_size;
        let mut grid = TileGrid::new_air(size);

        for lx in 0..size {
            let wx = geometry.wrap_x(coord.x) as i64 * size as i64 + lx as i64;
            let surface = self.surface_at(&perlin, wx, geometry);
            for ly in 0..size {
                let wy = (coord.y as i64 * size as i64 + ly as i64) as f64;
                let tile = if wy < surface - self.dirt_depth {
                    Tile::new(BlockId::STONE, BlockId::STONE)
                } else if wy < surface - 1.0 {
                    Tile::new(BlockId::DIRT, BlockId::DIRT)
                } else if wy < surface {
                    Tile::new(BlockId::GRASS, BlockId::DIRT)
                } else {
                    continue;
                };
                grid.set(lx, ly, tile);
            }
        }
        grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> WorldGeometry {
        WorldGeometry::new(16, 8.0, 8, 4)
    }

    #[test]
    fn test_generation_is_deterministic() {
        let g = geometry();
        let t = LayeredTerrain::default();
        let a = t.generate(42, ChunkCoord::new(3, 2), &g);
        let b = t.generate(42, ChunkCoord::new(3, 2), &g);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bottom_row_is_solid_and_top_is_air() {
        let g = geometry();
        let t = LayeredTerrain {
            amplitude: 4.0,
            ..LayeredTerrain::default()
        };
        let bottom = t.generate(1, ChunkCoord::new(0, 0), &g);
        assert!(bottom.tiles().iter().all(|tile| tile.fg == BlockId::STONE));
        let top = t.generate(1, ChunkCoord::new(0, 3), &g);
        assert!(top.is_all_air());
    }

    #[test]
    fn test_surface_is_seamless_across_wrap() {
        let g = geometry();
        let t = LayeredTerrain::default();
        let perlin = Perlin::new(9);
        let width_tiles = (g.width_chunks * g.chunk_size as i32) as i64;
        let first = t.surface_at(&perlin, 0, &g);
        let wrapped = t.surface_at(&perlin, width_tiles, &g);
        assert!((first - wrapped).abs() < 1e-9);
    }

    #[test]
    fn test_flat_terrain_layers() {
        let g = geometry();
        let grid = FlatTerrain { surface_tile: 20 }.generate(0, ChunkCoord::new(0, 1), &g);
        // world rows 16..32: rows below 20 stone, row 20 grass
        assert_eq!(grid.get(0, 3).unwrap().fg, BlockId::STONE);
        assert_eq!(grid.get(0, 4).unwrap().fg, BlockId::GRASS);
        assert_eq!(grid.get(0, 5).unwrap(), Tile::AIR);
    }
}
