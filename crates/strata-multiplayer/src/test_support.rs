//! Fixtures shared by the unit tests of this crate.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use strata_world::{
    ChunkCoord, ChunkDataProvider, ChunkFiles, ChunkSerializer, ChunkStore, CorruptChunkChoice,
    EntityRegistry, FileProvider, FlatTerrain, LoadingUi, NoPhysics, RetryPolicy, StoreContext,
    StoreSettings, WorkerPool, WorldGeometry, world_dir,
};

pub(crate) const SEED: u64 = 0x5EED;

/// World size of one chunk in [`geometry`].
pub(crate) const CS: f32 = 32.0;

pub(crate) fn geometry() -> WorldGeometry {
    WorldGeometry::new(4, 8.0, 16, 8)
}

pub(crate) fn serializer() -> Arc<ChunkSerializer> {
    Arc::new(ChunkSerializer::new(
        geometry(),
        Arc::new(EntityRegistry::with_builtins()),
    ))
}

pub(crate) fn focus_in(x: i32, y: i32) -> Vec2 {
    Vec2::new((x as f32 + 0.5) * CS, (y as f32 + 0.5) * CS)
}

pub(crate) fn terrain() -> Arc<FlatTerrain> {
    Arc::new(FlatTerrain { surface_tile: 9 })
}

#[derive(Debug, Default)]
pub(crate) struct TestUi {
    pub loading: bool,
    pub prompts: Vec<ChunkCoord>,
}

impl LoadingUi for TestUi {
    fn show_loading_screen(&mut self, visible: bool) {
        self.loading = visible;
    }

    fn show_corrupt_chunk_dialog(&mut self, coord: ChunkCoord) -> CorruptChunkChoice {
        self.prompts.push(coord);
        CorruptChunkChoice::Regenerate
    }
}

pub(crate) type TestStore = ChunkStore<NoPhysics, TestUi>;

pub(crate) fn pool() -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(2, 64).unwrap())
}

pub(crate) fn open_files(dir: &Path) -> Arc<ChunkFiles> {
    Arc::new(ChunkFiles::open(world_dir(dir, SEED), (*serializer()).clone()).unwrap())
}

pub(crate) fn file_provider(files: &Arc<ChunkFiles>, pool: &Arc<WorkerPool>) -> FileProvider {
    FileProvider::new(
        Arc::clone(files),
        Arc::clone(pool),
        RetryPolicy::immediate(2),
        SEED,
    )
    .with_generator(terrain())
}

pub(crate) fn store_with(
    provider: Arc<dyn ChunkDataProvider>,
    pool: &Arc<WorkerPool>,
    focus: Vec2,
) -> TestStore {
    let context = StoreContext {
        geometry: geometry(),
        settings: StoreSettings {
            settle: Duration::ZERO,
            ..StoreSettings::default()
        },
        seed: SEED,
        provider,
        pool: Arc::clone(pool),
        generator: terrain(),
    };
    ChunkStore::new(context, NoPhysics, TestUi::default(), focus)
}

/// An offline store over `dir`, not yet loaded.
pub(crate) fn offline_store(dir: &Path, focus: Vec2) -> TestStore {
    let pool = pool();
    let files = open_files(dir);
    store_with(Arc::new(file_provider(&files, &pool)), &pool, focus)
}

/// Ticks until every in-world slot of the window is loaded.
pub(crate) fn settle(store: &mut TestStore, focus: Vec2) {
    let expected = window_size(store);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        store.tick(focus, Instant::now());
        if store.loaded_coords().len() == expected {
            return;
        }
        assert!(Instant::now() < deadline, "window never finished loading");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn window_size(store: &TestStore) -> usize {
    let g = *store.geometry();
    store
        .window_coords()
        .iter()
        .flatten()
        .filter(|c| g.contains_row(c.y))
        .count()
}
