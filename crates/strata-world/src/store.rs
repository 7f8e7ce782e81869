//! The 3×3 chunk window kept centered on a moving focus.
//!
//! [`ChunkStore`] owns nine slots and is mutated only from the simulation
//! thread. Each tick it collects finished fetches, compares the focus chunk
//! with the center slot, and performs one of three transitions:
//!
//! | displacement        | transition                                        |
//! |---------------------|---------------------------------------------------|
//! | `(0, 0)`            | none                                              |
//! | unit (8 directions) | shift after the settle delay                      |
//! | anything larger     | full reload, immediately                          |
//!
//! A shift evicts the slots leaving the window (saving them first when
//! needed), relocates surviving content in memory with
//! [`Chunk::move_and_copy`], and fetches the entering coordinates through the
//! active [`ChunkDataProvider`]. Slots whose row lies outside the world are
//! filled with air locally and never fetched or saved.
//!
//! A fetch that fails transiently is reissued after the [`RetryPolicy`]
//! delay. Once the policy's attempts are spent the slot keeps asking every
//! `max_delay`; only a [`FetchOutcome::NeedsUserDecision`] reaches the
//! corrupt-chunk dialog. Saves are tracked until their handle reports back,
//! and a failed save is reissued or left marked for the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use strata_config::StreamingConfig;

use crate::chunk::{Chunk, ChunkContent, SAVE_DIRTY, Tile};
use crate::collab::{CorruptChunkChoice, LoadingUi, PhysicsSink};
use crate::coords::{ChunkCoord, WINDOW, WorldGeometry};
use crate::entity::{EntityInstance, ObjectId};
use crate::provider::{ChunkDataProvider, FetchHandle, FetchOutcome, PersistHandle, PersistOutcome};
use crate::retry::{Backoff, RetryPolicy};
use crate::terrain::TerrainGenerator;
use crate::worker::WorkerPool;

const SLOT_COUNT: usize = WINDOW * WINDOW;
const CENTER: usize = idx(1, 1);

const fn idx(i: usize, j: usize) -> usize {
    i * WINDOW + j
}

// ---------------------------------------------------------------------------
// Settings and context
// ---------------------------------------------------------------------------

/// Store tunables.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Delay between crossing a chunk boundary and shifting the window.
    pub settle: Duration,
    /// Freeze whenever the center slot is loading.
    pub freeze_when_center_dirty: bool,
    /// Freeze once this fraction of slots is loading. `0.0` freezes on any
    /// loading slot.
    pub freeze_dirty_fraction: f32,
    /// Backoff for fetches that fail transiently and for failed saves.
    pub retry: RetryPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(150),
            freeze_when_center_dirty: true,
            freeze_dirty_fraction: 0.0,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreSettings {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            settle: Duration::from_millis(config.settle_ms),
            freeze_when_center_dirty: config.freeze_when_center_dirty,
            freeze_dirty_fraction: config.freeze_dirty_fraction,
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Everything the store needs besides its collaborators.
#[derive(Clone)]
pub struct StoreContext {
    pub geometry: WorldGeometry,
    pub settings: StoreSettings,
    pub seed: u64,
    pub provider: Arc<dyn ChunkDataProvider>,
    /// Runs regeneration jobs after a corrupt chunk.
    pub pool: Arc<WorkerPool>,
    pub generator: Arc<dyn TerrainGenerator>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What the caller should do with this frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// All slots needed for simulation are loaded.
    Simulate,
    /// Loading; show the loading state instead of ticking world content.
    Frozen,
    /// The user chose to abort after a corrupt chunk.
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Shift { dx: i32, dy: i32 },
    FullReload,
}

/// Slot operations performed by the last transition. Slot positions are
/// `(i, j)` with `i` along x.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionReport {
    pub transition: Transition,
    pub center: ChunkCoord,
    /// Coordinates whose content left the window.
    pub disposed: Vec<ChunkCoord>,
    /// `(to, from)` pairs relocated in memory.
    pub copied: Vec<((usize, usize), (usize, usize))>,
    /// Slots repositioned to a new coordinate and awaiting content.
    pub moved: Vec<(usize, usize)>,
    /// Coordinates persisted on eviction.
    pub saved: Vec<ChunkCoord>,
}

impl TransitionReport {
    fn new(transition: Transition, center: ChunkCoord) -> Self {
        Self {
            transition,
            center,
            disposed: Vec::new(),
            copied: Vec::new(),
            moved: Vec::new(),
            saved: Vec::new(),
        }
    }
}

/// Running counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub transitions: u64,
    pub fetches_issued: u64,
    pub fetches_cancelled: u64,
    pub stale_discarded: u64,
    pub saves_issued: u64,
    pub saves_failed: u64,
    pub regenerations: u64,
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

struct InFlight {
    handle: FetchHandle,
    backoff: Backoff,
    /// Content comes from the terrain generator after a corrupt load and
    /// must be saved once applied.
    regenerate: bool,
}

/// A transiently failed fetch waiting out its backoff.
struct Waiting {
    at: Instant,
    backoff: Backoff,
    regenerate: bool,
}

struct Slot {
    chunk: Chunk,
    fetch: Option<InFlight>,
    waiting: Option<Waiting>,
    /// Set when the provider reports unreadable data; cleared by the user's
    /// choice.
    failed: Option<String>,
}

/// A save whose handle has not reported back. The content is kept so a
/// failed save can be issued again.
struct PendingSave {
    coord: ChunkCoord,
    content: ChunkContent,
    handle: PersistHandle,
    attempts: u32,
}

impl Slot {
    fn cancel_fetch(&mut self) -> bool {
        self.waiting = None;
        match self.fetch.take() {
            Some(inflight) => {
                inflight.handle.cancel();
                true
            }
            None => false,
        }
    }
}

fn pair_mut(slots: &mut [Slot], a: usize, b: usize) -> (&mut Slot, &mut Slot) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = slots.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = slots.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// Iteration order for one axis of a shift so that each source slot is read
/// before it is overwritten.
fn axis_order(delta: i32) -> [usize; WINDOW] {
    if delta >= 0 { [0, 1, 2] } else { [2, 1, 0] }
}

// ---------------------------------------------------------------------------
// ChunkStore
// ---------------------------------------------------------------------------

/// The always-loaded chunk window.
pub struct ChunkStore<P: PhysicsSink, U: LoadingUi> {
    geometry: WorldGeometry,
    settings: StoreSettings,
    seed: u64,
    provider: Arc<dyn ChunkDataProvider>,
    pool: Arc<WorkerPool>,
    generator: Arc<dyn TerrainGenerator>,
    physics: P,
    ui: U,

    slots: Vec<Slot>,
    center: ChunkCoord,
    /// Unit move waiting out the settle delay: target center and when the
    /// focus first entered it.
    pending_shift: Option<(ChunkCoord, Instant)>,
    saves: Vec<PendingSave>,
    loading_shown: bool,
    aborted: bool,
    last_transition: Option<TransitionReport>,
    stats: StoreStats,
}

impl<P: PhysicsSink, U: LoadingUi> ChunkStore<P, U> {
    /// Creates the window around `focus` and starts loading all nine slots.
    pub fn new(context: StoreContext, physics: P, ui: U, focus: Vec2) -> Self {
        let geometry = context.geometry;
        let center = geometry.chunk_of(focus);
        let window = geometry.window_around(center);
        let slots = (0..SLOT_COUNT)
            .map(|n| Slot {
                chunk: Chunk::placeholder(window[n / WINDOW][n % WINDOW], geometry.chunk_size),
                fetch: None,
                waiting: None,
                failed: None,
            })
            .collect();

        let mut store = Self {
            geometry,
            settings: context.settings,
            seed: context.seed,
            provider: context.provider,
            pool: context.pool,
            generator: context.generator,
            physics,
            ui,
            slots,
            center,
            pending_shift: None,
            saves: Vec::new(),
            loading_shown: false,
            aborted: false,
            last_transition: None,
            stats: StoreStats::default(),
        };
        store.full_reload(center);
        store.update_loading_screen();
        store
    }

    /// Advances the window for this frame.
    pub fn tick(&mut self, focus: Vec2, now: Instant) -> TickOutcome {
        if self.aborted {
            return TickOutcome::Aborted;
        }

        self.poll_saves();
        self.poll_fetches(now);

        let target = self.geometry.chunk_of(focus);
        let (dx, dy) = self.geometry.displacement(self.center, target);
        if (dx, dy) == (0, 0) {
            self.pending_shift = None;
        } else if dx.abs() > 1 || dy.abs() > 1 {
            self.pending_shift = None;
            self.full_reload(target);
        } else {
            match self.pending_shift {
                Some((pending, since)) if pending == target => {
                    if now.duration_since(since) >= self.settings.settle {
                        self.pending_shift = None;
                        self.shift(dx, dy);
                    }
                }
                _ if self.settings.settle.is_zero() => self.shift(dx, dy),
                _ => self.pending_shift = Some((target, now)),
            }
        }

        self.reissue_due(now);
        self.update_loading_screen();
        self.resolve_failures();

        if self.aborted {
            TickOutcome::Aborted
        } else if self.loading_shown {
            TickOutcome::Frozen
        } else {
            TickOutcome::Simulate
        }
    }

    /// Moves the window to `focus` without the settle delay.
    pub fn teleport(&mut self, focus: Vec2) {
        self.pending_shift = None;
        let target = self.geometry.chunk_of(focus);
        let (dx, dy) = self.geometry.displacement(self.center, target);
        if (dx, dy) == (0, 0) {
            return;
        }
        if dx.abs() > 1 || dy.abs() > 1 {
            self.full_reload(target);
        } else {
            self.shift(dx, dy);
        }
        self.update_loading_screen();
    }

    // --- transitions ---

    fn shift(&mut self, dx: i32, dy: i32) {
        let new_center = ChunkCoord::new(self.geometry.wrap_x(self.center.x + dx), self.center.y + dy);
        let mut report = TransitionReport::new(Transition::Shift { dx, dy }, new_center);
        let inside = |v: i32| (0..WINDOW as i32).contains(&v);

        // --- Step 1: evict content leaving the window ---
        for i in 0..WINDOW {
            for j in 0..WINDOW {
                if !(inside(i as i32 - dx) && inside(j as i32 - dy)) {
                    self.evict(idx(i, j), &mut report);
                }
            }
        }

        // --- Step 2: relocate surviving content ---
        for i in axis_order(dx) {
            for j in axis_order(dy) {
                let (si, sj) = (i as i32 + dx, j as i32 + dy);
                if !(inside(si) && inside(sj)) {
                    continue;
                }
                let (si, sj) = (si as usize, sj as usize);
                let (target, source) = pair_mut(&mut self.slots, idx(i, j), idx(si, sj));
                target.chunk.move_and_copy(&mut source.chunk);
                target.fetch = source.fetch.take();
                target.waiting = source.waiting.take();
                target.failed = source.failed.take();
                report.copied.push(((i, j), (si, sj)));
            }
        }

        // --- Step 3: fetch entering coordinates ---
        self.center = new_center;
        let window = self.geometry.window_around(new_center);
        for i in 0..WINDOW {
            for j in 0..WINDOW {
                if !(inside(i as i32 + dx) && inside(j as i32 + dy)) {
                    self.move_slot(idx(i, j), window[i][j]);
                    report.moved.push((i, j));
                }
            }
        }

        tracing::debug!(
            dx,
            dy,
            center = %new_center,
            disposed = report.disposed.len(),
            copied = report.copied.len(),
            moved = report.moved.len(),
            "window shifted"
        );
        self.stats.transitions += 1;
        self.last_transition = Some(report);
    }

    fn full_reload(&mut self, center: ChunkCoord) {
        let center = ChunkCoord::new(self.geometry.wrap_x(center.x), center.y);
        let mut report = TransitionReport::new(Transition::FullReload, center);
        for n in 0..SLOT_COUNT {
            self.evict(n, &mut report);
        }

        self.center = center;
        let window = self.geometry.window_around(center);
        for i in 0..WINDOW {
            for j in 0..WINDOW {
                self.move_slot(idx(i, j), window[i][j]);
                report.moved.push((i, j));
            }
        }

        tracing::debug!(center = %center, saved = report.saved.len(), "window reloaded");
        self.stats.transitions += 1;
        self.last_transition = Some(report);
    }

    /// Saves the slot if needed, then drops its content and detaches its
    /// entities from physics.
    fn evict(&mut self, n: usize, report: &mut TransitionReport) {
        let geometry = self.geometry;
        let slot = &mut self.slots[n];
        if slot.cancel_fetch() {
            self.stats.fetches_cancelled += 1;
        }
        slot.failed = None;

        let coord = slot.chunk.coord();
        let loaded = !slot.chunk.is_dirty();
        if loaded
            && slot.chunk.needs_save()
            && geometry.contains_row(coord.y)
            && let Some(content) = slot.chunk.snapshot()
        {
            slot.chunk.clear(SAVE_DIRTY);
            // The provider stages the bytes before returning, so a fetch
            // issued right after sees this save.
            self.issue_save(content, 1);
            report.saved.push(coord);
        }

        let slot = &mut self.slots[n];
        let entities = slot.chunk.dispose();
        if loaded && !entities.is_empty() {
            self.physics.remove_entities(&entities);
        }
        report.disposed.push(coord);
    }

    /// Repositions a slot and starts loading its new content.
    fn move_slot(&mut self, n: usize, coord: ChunkCoord) {
        let size = self.geometry.chunk_size;
        let contains_row = self.geometry.contains_row(coord.y);
        let slot = &mut self.slots[n];
        if slot.cancel_fetch() {
            self.stats.fetches_cancelled += 1;
        }
        slot.failed = None;
        slot.chunk.begin_move(coord);

        if !contains_row {
            slot.chunk.apply(ChunkContent::air(coord, size));
            return;
        }
        let backoff = self.settings.retry.backoff();
        self.issue_fetch(n, backoff);
    }

    fn issue_fetch(&mut self, n: usize, backoff: Backoff) {
        let coord = self.slots[n].chunk.coord();
        let handle = self.provider.fetch(coord);
        self.stats.fetches_issued += 1;
        self.slots[n].fetch = Some(InFlight {
            handle,
            backoff,
            regenerate: false,
        });
    }

    /// Replaces a failed slot's content with generator output, off the
    /// simulation thread.
    fn start_regeneration(&mut self, n: usize, backoff: Backoff) {
        let coord = self.slots[n].chunk.coord();
        let (completer, handle) = FetchHandle::pair(coord);
        let token = completer.token().clone();
        let generator = Arc::clone(&self.generator);
        let geometry = self.geometry;
        let seed = self.seed;

        let submitted = self.pool.submit_cancellable(token, move || {
            let mut content = ChunkContent::air(coord, geometry.chunk_size);
            content.tiles = generator.generate(seed, coord, &geometry);
            completer.complete(FetchOutcome::Ready {
                content,
                generated: true,
            });
        });
        let handle = match submitted {
            Ok(()) => handle,
            Err(e) => FetchHandle::ready(coord, FetchOutcome::Retry {
                reason: e.to_string(),
            }),
        };
        self.stats.regenerations += 1;
        self.slots[n].fetch = Some(InFlight {
            handle,
            backoff,
            regenerate: true,
        });
    }

    /// Hands `content` to the provider and tracks the save until it reports
    /// back. `attempts` counts this one.
    fn issue_save(&mut self, content: ChunkContent, attempts: u32) {
        let coord = content.coord;
        let handle = self.provider.persist(content.clone());
        self.stats.saves_issued += 1;
        self.saves.push(PendingSave {
            coord,
            content,
            handle,
            attempts,
        });
    }

    // --- per-tick bookkeeping ---

    fn poll_fetches(&mut self, now: Instant) {
        for n in 0..SLOT_COUNT {
            let Some(outcome) = self.slots[n].fetch.as_ref().and_then(|f| f.handle.poll()) else {
                continue;
            };
            let Some(inflight) = self.slots[n].fetch.take() else {
                continue;
            };
            let coord = self.slots[n].chunk.coord();

            match outcome {
                FetchOutcome::Ready { content, .. } if content.coord != coord => {
                    tracing::debug!(slot = %coord, got = %content.coord, "discarding stale chunk data");
                    self.stats.stale_discarded += 1;
                    self.reissue(n, inflight.backoff, inflight.regenerate);
                }
                FetchOutcome::Ready { content, generated } => {
                    let owns_storage = self.provider.owns_storage();
                    let chunk = &mut self.slots[n].chunk;
                    chunk.apply(content);
                    // Locally synthesized content never replaces a peer's
                    // stored copy.
                    if (generated || inflight.regenerate) && owns_storage {
                        chunk.mark(SAVE_DIRTY);
                    }
                    if let Some(entities) = chunk.entities()
                        && !entities.is_empty()
                    {
                        self.physics.add_entities(entities);
                    }
                    tracing::trace!(%coord, "chunk loaded");
                }
                FetchOutcome::Retry { reason } => {
                    let InFlight {
                        mut backoff,
                        regenerate,
                        ..
                    } = inflight;
                    let delay = match backoff.next_delay() {
                        Some(delay) => {
                            tracing::warn!(
                                %coord,
                                attempt = backoff.attempts(),
                                %reason,
                                "chunk fetch failed, retrying in {delay:?}"
                            );
                            delay
                        }
                        None => {
                            tracing::error!(
                                %coord,
                                attempts = backoff.attempts(),
                                %reason,
                                "chunk still unavailable, asking again"
                            );
                            backoff = self.settings.retry.backoff();
                            self.settings.retry.max_delay
                        }
                    };
                    self.slots[n].waiting = Some(Waiting {
                        at: now + delay,
                        backoff,
                        regenerate,
                    });
                }
                FetchOutcome::NeedsUserDecision { reason } => {
                    self.slots[n].failed = Some(reason);
                }
            }
        }
    }

    /// Reissues fetches whose backoff has run out.
    fn reissue_due(&mut self, now: Instant) {
        for n in 0..SLOT_COUNT {
            let due = self.slots[n].waiting.as_ref().is_some_and(|w| w.at <= now);
            if !due {
                continue;
            }
            if let Some(waiting) = self.slots[n].waiting.take() {
                self.reissue(n, waiting.backoff, waiting.regenerate);
            }
        }
    }

    fn reissue(&mut self, n: usize, backoff: Backoff, regenerate: bool) {
        if regenerate {
            self.start_regeneration(n, backoff);
        } else {
            self.issue_fetch(n, backoff);
        }
    }

    /// Collects finished saves and handles the failed ones.
    fn poll_saves(&mut self) {
        let mut failed = Vec::new();
        let mut i = 0;
        while i < self.saves.len() {
            match self.saves[i].handle.poll() {
                None => i += 1,
                Some(PersistOutcome::Saved | PersistOutcome::Sent) => {
                    self.saves.remove(i);
                }
                Some(PersistOutcome::Failed(reason)) => {
                    failed.push((self.saves.remove(i), reason));
                }
            }
        }
        for (save, reason) in failed {
            self.save_failed(save, &reason);
        }
    }

    /// A newer save of the same chunk supersedes a failed one. A failed save
    /// of a chunk that is loaded again marks it for the next save; otherwise
    /// the kept content is saved again until the retry policy gives up.
    fn save_failed(&mut self, save: PendingSave, reason: &str) {
        self.stats.saves_failed += 1;
        let coord = save.coord;
        if self.saves.iter().any(|s| s.coord == coord) {
            tracing::warn!(%coord, %reason, "chunk save failed, a newer save is pending");
            return;
        }
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.chunk.coord() == coord && !s.chunk.is_dirty())
        {
            tracing::warn!(%coord, %reason, "chunk save failed, keeping it marked for saving");
            slot.chunk.mark(SAVE_DIRTY);
            return;
        }
        if save.attempts >= self.settings.retry.max_attempts {
            tracing::error!(%coord, attempts = save.attempts, %reason, "giving up on chunk save");
            return;
        }
        tracing::warn!(%coord, attempt = save.attempts, %reason, "chunk save failed, saving again");
        self.issue_save(save.content, save.attempts + 1);
    }

    fn resolve_failures(&mut self) {
        for n in 0..SLOT_COUNT {
            let Some(reason) = self.slots[n].failed.take() else {
                continue;
            };
            let coord = self.slots[n].chunk.coord();
            match self.ui.show_corrupt_chunk_dialog(coord) {
                CorruptChunkChoice::Regenerate => {
                    tracing::warn!(%coord, %reason, "regenerating unreadable chunk");
                    let backoff = self.settings.retry.backoff();
                    self.start_regeneration(n, backoff);
                }
                CorruptChunkChoice::Abort => {
                    tracing::error!(%coord, %reason, "aborting on unreadable chunk");
                    self.aborted = true;
                    return;
                }
            }
        }
    }

    fn should_freeze(&self) -> bool {
        let dirty = self.slots.iter().filter(|s| s.chunk.is_dirty()).count();
        if dirty == 0 {
            return false;
        }
        if self.settings.freeze_when_center_dirty && self.slots[CENTER].chunk.is_dirty() {
            return true;
        }
        dirty as f32 / SLOT_COUNT as f32 >= self.settings.freeze_dirty_fraction
    }

    fn update_loading_screen(&mut self) {
        let frozen = self.should_freeze();
        if frozen != self.loading_shown {
            self.ui.show_loading_screen(frozen);
            self.loading_shown = frozen;
        }
    }

    // --- queries ---

    /// Chunk coordinate of the center slot.
    pub fn center(&self) -> ChunkCoord {
        self.center
    }

    pub fn geometry(&self) -> &WorldGeometry {
        &self.geometry
    }

    /// The chunk in slot `(i, j)`, loaded or not.
    pub fn slot(&self, i: usize, j: usize) -> &Chunk {
        &self.slots[idx(i, j)].chunk
    }

    pub fn window_coords(&self) -> [[ChunkCoord; WINDOW]; WINDOW] {
        std::array::from_fn(|i| std::array::from_fn(|j| self.slots[idx(i, j)].chunk.coord()))
    }

    /// The loaded chunk at `coord`, if it is in the window.
    pub fn chunk(&self, coord: ChunkCoord) -> Option<&Chunk> {
        let coord = self.geometry.wrap(coord);
        self.slots
            .iter()
            .map(|s| &s.chunk)
            .find(|c| c.coord() == coord && !c.is_dirty())
    }

    /// Coordinates of loaded in-world chunks.
    pub fn loaded_coords(&self) -> Vec<ChunkCoord> {
        self.slots
            .iter()
            .map(|s| &s.chunk)
            .filter(|c| !c.is_dirty() && self.geometry.contains_row(c.coord().y))
            .map(Chunk::coord)
            .collect()
    }

    pub fn is_frozen(&self) -> bool {
        self.loading_shown
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn last_transition(&self) -> Option<&TransitionReport> {
        self.last_transition.as_ref()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Saves issued but not yet reported back.
    pub fn pending_saves(&self) -> usize {
        self.saves.len()
    }

    pub fn physics(&self) -> &P {
        &self.physics
    }

    pub fn physics_mut(&mut self) -> &mut P {
        &mut self.physics
    }

    pub fn ui(&self) -> &U {
        &self.ui
    }

    pub fn ui_mut(&mut self) -> &mut U {
        &mut self.ui
    }

    // --- tiles ---

    /// Slot index and local tile coordinates for a world position.
    fn locate(&self, position: Vec2) -> Option<(usize, u32, u32)> {
        let row = (position.y / self.geometry.chunk_world_size()).floor() as i32;
        if !self.geometry.contains_row(row) {
            return None;
        }
        let coord = self.geometry.chunk_of(position);
        let n = self.slots.iter().position(|s| s.chunk.coord() == coord)?;
        let relative = self.geometry.to_chunk_relative(coord, position);
        let last = self.geometry.chunk_size as i64 - 1;
        let local = |v: f32| ((v / self.geometry.block_size).floor() as i64).clamp(0, last) as u32;
        Some((n, local(relative.x), local(relative.y)))
    }

    /// Tile at a world position. `None` outside the window or while its
    /// chunk is loading.
    pub fn tile_at(&self, position: Vec2) -> Option<Tile> {
        let (n, x, y) = self.locate(position)?;
        self.slots[n].chunk.tile(x, y)
    }

    pub fn set_tile_at(&mut self, position: Vec2, tile: Tile) -> bool {
        match self.locate(position) {
            Some((n, x, y)) => self.slots[n].chunk.set_tile(x, y, tile),
            None => false,
        }
    }

    // --- entities ---

    fn slot_index_for(&self, position: Vec2) -> Option<usize> {
        let coord = self.geometry.chunk_of(position);
        self.slots
            .iter()
            .position(|s| s.chunk.coord() == coord && !s.chunk.is_dirty())
    }

    fn slot_index_of_entity(&self, id: ObjectId) -> Option<usize> {
        self.slots.iter().position(|s| s.chunk.entity(id).is_some())
    }

    /// Anchors an entity to the loaded chunk under its position and hands it
    /// to physics. Gives the entity back if no loaded chunk covers it.
    pub fn insert_entity(&mut self, entity: EntityInstance) -> Result<ChunkCoord, EntityInstance> {
        let Some(n) = self.slot_index_for(entity.position) else {
            return Err(entity);
        };
        self.physics.add_entities(std::slice::from_ref(&entity));
        let chunk = &mut self.slots[n].chunk;
        chunk.push_entity(entity);
        Ok(chunk.coord())
    }

    pub fn remove_entity(&mut self, id: ObjectId) -> Option<EntityInstance> {
        let n = self.slot_index_of_entity(id)?;
        let entity = self.slots[n].chunk.take_entity(id)?;
        self.physics.remove_entities(std::slice::from_ref(&entity));
        Some(entity)
    }

    pub fn entity(&self, id: ObjectId) -> Option<&EntityInstance> {
        self.slots.iter().find_map(|s| s.chunk.entity(id))
    }

    /// Mutable access; marks the owning chunk for saving.
    pub fn entity_mut(&mut self, id: ObjectId) -> Option<&mut EntityInstance> {
        let n = self.slot_index_of_entity(id)?;
        let chunk = &mut self.slots[n].chunk;
        chunk.mark(SAVE_DIRTY);
        chunk.entity_mut(id)
    }

    /// Moves an entity, re-anchoring it if it crossed into another loaded
    /// chunk. Refused if the destination is not loaded.
    pub fn move_entity(&mut self, id: ObjectId, position: Vec2) -> bool {
        let position = self.geometry.wrap_position(position);
        let Some(from) = self.slot_index_of_entity(id) else {
            return false;
        };
        let Some(to) = self.slot_index_for(position) else {
            return false;
        };
        if from == to {
            let chunk = &mut self.slots[from].chunk;
            chunk.mark(SAVE_DIRTY);
            if let Some(entity) = chunk.entity_mut(id) {
                entity.position = position;
            }
            return true;
        }
        let (source, target) = pair_mut(&mut self.slots, from, to);
        match source.chunk.take_entity(id) {
            Some(mut entity) => {
                entity.position = position;
                target.chunk.push_entity(entity)
            }
            None => false,
        }
    }

    /// Renames an entity after an id correction from the host.
    pub fn reassign_entity_id(&mut self, old: ObjectId, new: ObjectId) -> bool {
        let Some(n) = self.slot_index_of_entity(old) else {
            return false;
        };
        let chunk = &mut self.slots[n].chunk;
        let Some(entity) = chunk.entity_mut(old) else {
            return false;
        };
        let before = entity.clone();
        entity.object_id = new;
        let after = entity.clone();
        chunk.mark(SAVE_DIRTY);
        self.physics.remove_entities(std::slice::from_ref(&before));
        self.physics.add_entities(std::slice::from_ref(&after));
        true
    }

    /// Removes every loaded entity matching `pred` and detaches them from
    /// physics.
    pub fn remove_entities_where(
        &mut self,
        mut pred: impl FnMut(&EntityInstance) -> bool,
    ) -> Vec<EntityInstance> {
        let mut removed = Vec::new();
        for slot in &mut self.slots {
            let drained = slot.chunk.drain_entities_where(&mut pred);
            if !drained.is_empty() {
                slot.chunk.mark(SAVE_DIRTY);
                removed.extend(drained);
            }
        }
        if !removed.is_empty() {
            self.physics.remove_entities(&removed);
        }
        removed
    }

    /// Entities of every loaded chunk.
    pub fn entities(&self) -> impl Iterator<Item = &EntityInstance> {
        self.slots
            .iter()
            .filter_map(|s| s.chunk.entities())
            .flatten()
    }

    // --- persistence ---

    /// Persists every loaded in-world chunk that needs a save. Returns how
    /// many saves were issued.
    pub fn save_all(&mut self) -> usize {
        let mut contents = Vec::new();
        for slot in &mut self.slots {
            let chunk = &mut slot.chunk;
            if !chunk.needs_save() || !self.geometry.contains_row(chunk.coord().y) {
                continue;
            }
            if let Some(content) = chunk.snapshot() {
                chunk.clear(SAVE_DIRTY);
                contents.push(content);
            }
        }
        let issued = contents.len();
        for content in contents {
            self.issue_save(content, 1);
        }
        issued
    }

    /// Saves everything, cancels outstanding fetches, waits up to `timeout`
    /// for every tracked save and flushes the provider.
    pub fn shutdown(&mut self, timeout: Duration) {
        self.save_all();
        for slot in &mut self.slots {
            if slot.cancel_fetch() {
                self.stats.fetches_cancelled += 1;
            }
        }
        let deadline = Instant::now() + timeout;
        let saves = std::mem::take(&mut self.saves);
        let total = saves.len();
        let mut unsaved = 0;
        for save in saves {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match save.handle.wait(remaining) {
                Some(PersistOutcome::Saved | PersistOutcome::Sent) => {}
                Some(PersistOutcome::Failed(reason)) => {
                    unsaved += 1;
                    self.stats.saves_failed += 1;
                    tracing::warn!(coord = %save.coord, %reason, "chunk save failed at shutdown");
                }
                None => {
                    unsaved += 1;
                    tracing::warn!(coord = %save.coord, "chunk save still pending at shutdown");
                }
            }
        }
        self.provider.flush();
        tracing::info!(saves = total, unsaved, "chunk store shut down");
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
