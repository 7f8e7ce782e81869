//! Chunk persistence in a per-world directory.
//!
//! Each chunk lives in `<world_dir>/<x>_<y>.chunk`, with `world_dir` named
//! after the seed. Writes go through a save buffer: encoded bytes are
//! visible to readers as soon as `persist` returns and stay there until the
//! temp-file-plus-rename write has landed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::chunk::ChunkContent;
use crate::coords::ChunkCoord;
use crate::provider::{
    ChunkDataProvider, FetchHandle, FetchOutcome, PersistHandle, PersistOutcome, ProviderError,
};
use crate::retry::RetryPolicy;
use crate::serializer::{ChunkSerializer, EncodeTarget, read_world_meta, write_world_meta};
use crate::terrain::TerrainGenerator;
use crate::worker::WorkerPool;

/// Directory for the world with `seed` under `save_root`.
pub fn world_dir(save_root: &Path, seed: u64) -> PathBuf {
    save_root.join(format!("world_{seed:016x}"))
}

pub fn chunk_file_name(coord: ChunkCoord) -> String {
    format!("{}_{}.chunk", coord.x, coord.y)
}

// ---------------------------------------------------------------------------
// ChunkFiles
// ---------------------------------------------------------------------------

/// Synchronous chunk file access plus the save buffer. Shared between the
/// provider front-end and its worker jobs.
///
/// Writes for one coordinate are serialized, and a write only lands while
/// its bytes are still the staged version, so disk never goes back to an
/// older save.
pub struct ChunkFiles {
    dir: PathBuf,
    serializer: ChunkSerializer,
    save_buffer: DashMap<ChunkCoord, Arc<Vec<u8>>>,
    write_locks: DashMap<ChunkCoord, Arc<Mutex<()>>>,
    next_tmp: AtomicU64,
}

impl ChunkFiles {
    pub fn open(dir: PathBuf, serializer: ChunkSerializer) -> Result<Self, ProviderError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            serializer,
            save_buffer: DashMap::new(),
            write_locks: DashMap::new(),
            next_tmp: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn serializer(&self) -> &ChunkSerializer {
        &self.serializer
    }

    pub fn path_for(&self, coord: ChunkCoord) -> PathBuf {
        let coord = self.serializer.geometry().wrap(coord);
        self.dir.join(chunk_file_name(coord))
    }

    /// Bytes of a save that has not reached disk yet.
    pub fn buffered(&self, coord: ChunkCoord) -> Option<Arc<Vec<u8>>> {
        let coord = self.serializer.geometry().wrap(coord);
        self.save_buffer.get(&coord).map(|b| Arc::clone(&b))
    }

    pub fn buffered_count(&self) -> usize {
        self.save_buffer.len()
    }

    /// File contents on disk, ignoring the save buffer. `None` if missing.
    pub fn read_disk(&self, coord: ChunkCoord) -> Result<Option<Vec<u8>>, ProviderError> {
        match std::fs::read(self.path_for(coord)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Freshest stored bytes: the save buffer first, then disk.
    pub fn read_bytes(&self, coord: ChunkCoord) -> Result<Option<Vec<u8>>, ProviderError> {
        if let Some(bytes) = self.buffered(coord) {
            return Ok(Some(bytes.as_ref().clone()));
        }
        self.read_disk(coord)
    }

    /// Reads and decodes. `Ok(None)` if nothing is stored.
    pub fn load(&self, coord: ChunkCoord) -> Result<Option<ChunkContent>, ProviderError> {
        let coord = self.serializer.geometry().wrap(coord);
        let Some(bytes) = self.read_bytes(coord)? else {
            return Ok(None);
        };
        let content = self.serializer.decode(&bytes)?;
        if content.coord != coord {
            return Err(ProviderError::WrongCoordinate {
                expected: coord,
                found: content.coord,
            });
        }
        Ok(Some(content))
    }

    /// Puts encoded bytes in the save buffer.
    pub fn stage(&self, coord: ChunkCoord, bytes: Vec<u8>) -> Arc<Vec<u8>> {
        let coord = self.serializer.geometry().wrap(coord);
        let bytes = Arc::new(bytes);
        self.save_buffer.insert(coord, Arc::clone(&bytes));
        bytes
    }

    /// Writes staged bytes to disk atomically, then drops them from the
    /// buffer. Returns `false` without touching disk when a newer save has
    /// replaced `bytes` in the buffer; that save writes instead.
    pub fn write_staged(&self, coord: ChunkCoord, bytes: &Arc<Vec<u8>>) -> Result<bool, ProviderError> {
        let coord = self.serializer.geometry().wrap(coord);
        let lock = Arc::clone(self.write_locks.entry(coord).or_default().value());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self
            .save_buffer
            .get(&coord)
            .is_some_and(|staged| Arc::ptr_eq(staged.value(), bytes));
        if !current {
            tracing::debug!(%coord, "skipping superseded chunk save");
            return Ok(false);
        }

        let path = self.path_for(coord);
        let tmp = self.dir.join(format!(
            "{}.{}.tmp",
            chunk_file_name(coord),
            self.next_tmp.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = std::fs::write(&tmp, bytes.as_slice()).and_then(|()| std::fs::rename(&tmp, &path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.save_buffer
            .remove_if(&coord, |_, staged| Arc::ptr_eq(staged, bytes));
        Ok(true)
    }

    /// Decodes `bytes`, checking that they hold the chunk at `coord`.
    pub fn decode_at(&self, coord: ChunkCoord, bytes: &[u8]) -> Result<ChunkContent, ProviderError> {
        let coord = self.serializer.geometry().wrap(coord);
        let decoded = self.serializer.decode(bytes)?;
        if decoded.coord != coord {
            return Err(ProviderError::WrongCoordinate {
                expected: coord,
                found: decoded.coord,
            });
        }
        Ok(decoded)
    }

    /// Swaps the staged bytes for `replacement` if `current` is still the
    /// staged version. Returns the new buffer entry.
    pub fn restage(
        &self,
        coord: ChunkCoord,
        current: &Arc<Vec<u8>>,
        replacement: Vec<u8>,
    ) -> Option<Arc<Vec<u8>>> {
        let coord = self.serializer.geometry().wrap(coord);
        let mut entry = self.save_buffer.get_mut(&coord)?;
        if !Arc::ptr_eq(entry.value(), current) {
            return None;
        }
        let replacement = Arc::new(replacement);
        *entry.value_mut() = Arc::clone(&replacement);
        Some(replacement)
    }

    /// Drops `bytes` from the buffer if they are still the staged version.
    pub fn discard_staged(&self, coord: ChunkCoord, bytes: &Arc<Vec<u8>>) {
        let coord = self.serializer.geometry().wrap(coord);
        self.save_buffer
            .remove_if(&coord, |_, current| Arc::ptr_eq(current, bytes));
    }

    /// Writes every buffered save. Blocking. Returns how many were written.
    pub fn flush_buffer(&self) -> Result<usize, ProviderError> {
        let staged: Vec<(ChunkCoord, Arc<Vec<u8>>)> = self
            .save_buffer
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        let mut written = 0;
        for (coord, bytes) in &staged {
            if self.write_staged(*coord, bytes)? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn load_meta(&self) -> Result<Option<i32>, ProviderError> {
        Ok(read_world_meta(&self.dir)?)
    }

    pub fn save_meta(&self, current_id: i32) -> Result<(), ProviderError> {
        Ok(write_world_meta(&self.dir, current_id)?)
    }
}

// ---------------------------------------------------------------------------
// FileProvider
// ---------------------------------------------------------------------------

/// Offline provider backed by [`ChunkFiles`].
pub struct FileProvider {
    files: Arc<ChunkFiles>,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    seed: u64,
    generator: Option<Arc<dyn TerrainGenerator>>,
}

impl FileProvider {
    pub fn new(files: Arc<ChunkFiles>, pool: Arc<WorkerPool>, retry: RetryPolicy, seed: u64) -> Self {
        Self {
            files,
            pool,
            retry,
            seed,
            generator: None,
        }
    }

    /// Generate terrain for coordinates with no stored file instead of
    /// returning air.
    pub fn with_generator(mut self, generator: Arc<dyn TerrainGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn files(&self) -> &Arc<ChunkFiles> {
        &self.files
    }

    /// Persists already-encoded bytes, e.g. a save request from a peer.
    ///
    /// The bytes are staged at once so reads issued after this call see
    /// them. Decoding to validate them happens on the pool; bytes that fail
    /// validation are dropped from the buffer and never written. Peers never
    /// see local-only entities, so any the stored version holds are carried
    /// over into the new one before it is written.
    pub fn persist_encoded(&self, coord: ChunkCoord, bytes: Vec<u8>) -> PersistHandle {
        let coord = self.files.serializer().geometry().wrap(coord);
        let previous = self.files.buffered(coord);
        let staged = self.files.stage(coord, bytes);
        let (completer, handle) = PersistHandle::pair();
        let ours = Arc::clone(&staged);
        let files = Arc::clone(&self.files);
        let submitted = self.pool.submit(move || {
            let incoming = match files.decode_at(coord, &staged) {
                Ok(content) => content,
                Err(e) => {
                    tracing::error!(%coord, error = %e, "rejecting invalid chunk save");
                    files.discard_staged(coord, &staged);
                    completer.complete(PersistOutcome::Failed(e.to_string()));
                    return;
                }
            };
            let staged = match merge_local_entities(&files, coord, previous, incoming) {
                Some(merged) => files.restage(coord, &staged, merged).unwrap_or(staged),
                None => staged,
            };
            match files.write_staged(coord, &staged) {
                Ok(_) => completer.complete(PersistOutcome::Saved),
                Err(e) => {
                    tracing::error!(%coord, error = %e, "chunk save failed; kept in save buffer");
                    completer.complete(PersistOutcome::Failed(e.to_string()));
                }
            }
        });
        if let Err(e) = submitted {
            tracing::warn!(%coord, error = %e, "could not schedule chunk save validation");
            self.files.discard_staged(coord, &ours);
            return PersistHandle::done(PersistOutcome::Failed(e.to_string()));
        }
        handle
    }

    fn write_in_background(&self, coord: ChunkCoord, bytes: Vec<u8>) -> PersistHandle {
        let staged = self.files.stage(coord, bytes);
        let (completer, handle) = PersistHandle::pair();
        let files = Arc::clone(&self.files);
        let submitted = self.pool.submit(move || {
            match files.write_staged(coord, &staged) {
                Ok(_) => completer.complete(PersistOutcome::Saved),
                Err(e) => {
                    tracing::error!(%coord, error = %e, "chunk save failed; kept in save buffer");
                    completer.complete(PersistOutcome::Failed(e.to_string()));
                }
            }
        });
        if let Err(e) = submitted {
            // Still readable from the buffer; written by the next flush.
            tracing::warn!(%coord, error = %e, "chunk save deferred");
            return PersistHandle::done(PersistOutcome::Failed(e.to_string()));
        }
        handle
    }
}

/// Re-encodes `incoming` with the non-replicable entities of the stored
/// version added back. `None` when there is nothing to add.
fn merge_local_entities(
    files: &ChunkFiles,
    coord: ChunkCoord,
    previous: Option<Arc<Vec<u8>>>,
    mut incoming: ChunkContent,
) -> Option<Vec<u8>> {
    let stored_bytes = match previous {
        Some(bytes) => bytes.as_ref().clone(),
        None => files.read_disk(coord).ok().flatten()?,
    };
    let stored = files.decode_at(coord, &stored_bytes).ok()?;
    let mut carried = 0;
    for entity in stored.entities {
        if entity.is_replicable()
            || incoming.entities.iter().any(|e| e.object_id == entity.object_id)
        {
            continue;
        }
        incoming.entities.push(entity);
        carried += 1;
    }
    if carried == 0 {
        return None;
    }
    tracing::debug!(%coord, carried, "kept local-only entities in peer save");
    match files.serializer().encode(&incoming, EncodeTarget::Disk) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(%coord, error = %e, "could not merge local-only entities");
            None
        }
    }
}

impl ChunkDataProvider for FileProvider {
    fn fetch(&self, coord: ChunkCoord) -> FetchHandle {
        let geometry = *self.files.serializer().geometry();
        let coord = geometry.wrap(coord);
        let (completer, handle) = FetchHandle::pair(coord);
        let token = completer.token().clone();

        let files = Arc::clone(&self.files);
        let generator = self.generator.clone();
        let retry = self.retry.clone();
        let seed = self.seed;

        let job = move || {
            let mut backoff = retry.backoff();
            let outcome = loop {
                if completer.is_cancelled() {
                    return;
                }
                match files.load(coord) {
                    Ok(Some(content)) => break FetchOutcome::ready(content),
                    Ok(None) => {
                        let mut content = ChunkContent::air(coord, geometry.chunk_size);
                        let generated = match &generator {
                            Some(generator) => {
                                content.tiles = generator.generate(seed, coord, &geometry);
                                true
                            }
                            None => false,
                        };
                        break FetchOutcome::Ready { content, generated };
                    }
                    Err(e) => match backoff.next_delay() {
                        Some(delay) => {
                            tracing::warn!(
                                %coord,
                                attempt = backoff.attempts(),
                                error = %e,
                                "chunk load failed, retrying in {delay:?}"
                            );
                            std::thread::sleep(delay);
                        }
                        None => {
                            tracing::error!(%coord, error = %e, "chunk is unreadable");
                            break FetchOutcome::NeedsUserDecision {
                                reason: e.to_string(),
                            };
                        }
                    },
                }
            };
            completer.complete(outcome);
        };

        if let Err(e) = self.pool.submit_cancellable(token, job) {
            tracing::warn!(%coord, error = %e, "could not queue chunk load");
            return FetchHandle::ready(coord, FetchOutcome::Retry {
                reason: e.to_string(),
            });
        }
        handle
    }

    fn persist(&self, content: ChunkContent) -> PersistHandle {
        let coord = content.coord;
        match self.files.serializer().encode(&content, EncodeTarget::Disk) {
            Ok(bytes) => self.write_in_background(coord, bytes),
            Err(e) => {
                tracing::error!(%coord, error = %e, "chunk encode failed");
                PersistHandle::done(PersistOutcome::Failed(e.to_string()))
            }
        }
    }

    fn flush(&self) {
        match self.files.flush_buffer() {
            Ok(0) => {}
            Ok(n) => tracing::info!(chunks = n, "flushed buffered chunk saves"),
            Err(e) => tracing::error!(error = %e, "flushing chunk saves failed"),
        }
    }
}
