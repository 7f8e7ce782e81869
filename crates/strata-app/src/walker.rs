//! Scripted player movement for headless runs.

use std::time::Duration;

use glam::Vec2;
use strata_world::WorldGeometry;

/// Moves the focus at a constant velocity. x wraps around the world; y
/// bounces off the top and bottom edges.
#[derive(Debug, Clone, Copy)]
pub struct FocusWalker {
    geometry: WorldGeometry,
    position: Vec2,
    /// World units per second.
    velocity: Vec2,
}

impl FocusWalker {
    pub fn new(geometry: WorldGeometry, start: Vec2, velocity: Vec2) -> Self {
        Self {
            geometry,
            position: geometry.wrap_position(start),
            velocity,
        }
    }

    /// Walks east along the row at `height_fraction` of the world height,
    /// covering `chunks_per_second` chunks each second.
    pub fn eastward(geometry: WorldGeometry, height_fraction: f32, chunks_per_second: f32) -> Self {
        let height = geometry.height_chunks as f32 * geometry.chunk_world_size();
        let start = Vec2::new(
            geometry.chunk_world_size() * 0.5,
            (height * height_fraction).clamp(0.0, height - 1.0),
        );
        let velocity = Vec2::new(chunks_per_second * geometry.chunk_world_size(), 0.0);
        Self::new(geometry, start, velocity)
    }

    pub fn position(&self) -> Vec2 {
        self.position
    }

    pub fn velocity(&self) -> Vec2 {
        self.velocity
    }

    pub fn advance(&mut self, dt: Duration) -> Vec2 {
        let height = self.geometry.height_chunks as f32 * self.geometry.chunk_world_size();
        let mut next = self.position + self.velocity * dt.as_secs_f32();
        if next.y < 0.0 {
            next.y = -next.y;
            self.velocity.y = -self.velocity.y;
        } else if next.y >= height {
            next.y = (2.0 * height - next.y).max(0.0);
            self.velocity.y = -self.velocity.y;
        }
        self.position = self.geometry.wrap_position(next);
        self.position
    }
}

#[cfg(test)]
mod tests {
    use strata_world::ChunkCoord;

    use super::*;

    fn geometry() -> WorldGeometry {
        // 32 world units per chunk, 4 chunks around, 2 high.
        WorldGeometry::new(4, 8.0, 4, 2)
    }

    #[test]
    fn test_eastward_starts_on_row() {
        let walker = FocusWalker::eastward(geometry(), 0.75, 2.0);
        assert_eq!(walker.position(), Vec2::new(16.0, 48.0));
        assert_eq!(walker.velocity(), Vec2::new(64.0, 0.0));
    }

    #[test]
    fn test_wraps_around_the_world() {
        let g = geometry();
        let mut walker = FocusWalker::new(g, Vec2::new(120.0, 10.0), Vec2::new(16.0, 0.0));
        let p = walker.advance(Duration::from_secs(1));
        assert_eq!(p, Vec2::new(8.0, 10.0));
        assert_eq!(g.chunk_of(p), ChunkCoord::new(0, 0));
    }

    #[test]
    fn test_bounces_off_the_top() {
        let mut walker = FocusWalker::new(geometry(), Vec2::new(0.0, 60.0), Vec2::new(0.0, 8.0));
        let p = walker.advance(Duration::from_secs(1));
        assert_eq!(p.y, 60.0);
        assert_eq!(walker.velocity().y, -8.0);
        let p = walker.advance(Duration::from_secs(1));
        assert_eq!(p.y, 52.0);
    }

    #[test]
    fn test_bounces_off_the_bottom() {
        let mut walker = FocusWalker::new(geometry(), Vec2::new(0.0, 2.0), Vec2::new(0.0, -4.0));
        let p = walker.advance(Duration::from_secs(1));
        assert_eq!(p.y, 2.0);
        assert_eq!(walker.velocity().y, 4.0);
    }
}
