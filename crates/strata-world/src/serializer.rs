//! Binary encode/decode of chunk content, shared by disk and network.
//!
//! ## Layout (big-endian, then zlib/DEFLATE compressed)
//!
//! | Field | Type |
//! |-------|------|
//! | coord x, coord y | `i32`, `i32` |
//! | tiles, row-major | `chunk_size²` × (`i32` fg, `i32` bg) |
//! | entity count | `i32` |
//! | per entity: type tag | `u16` length + UTF-8 |
//! | per entity: position | `f32`, `f32` (chunk-relative) |
//! | per entity: object id | `i32` |
//! | per entity: properties | `bool`, then `i32` count + count × (utf8 key, utf8 value) |
//! | per entity: payload | type-specific, consumed by the registered factory |
//!
//! Positions are chunk-relative on disk and on the wire. [`ChunkSerializer`]
//! converts from and to world-absolute positions, which is what
//! [`EntityInstance`] holds in memory.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use glam::Vec2;

use crate::chunk::{BlockId, ChunkContent, Tile, TileGrid};
use crate::coords::{ChunkCoord, WorldGeometry};
use crate::entity::{EntityInstance, ObjectId};
use crate::registry::EntityRegistry;

/// Upper bound on decompressed chunk size; guards against zip bombs.
const MAX_DECODED_BYTES: u64 = 64 * 1024 * 1024;

/// Errors that can occur during chunk (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum ChunkSerError {
    /// The data is shorter than the layout requires.
    #[error("data truncated at byte {offset}: needed {needed} more")]
    Truncated { offset: usize, needed: usize },
    /// Bytes left over after the last entity.
    #[error("{0} trailing bytes after chunk data")]
    TrailingBytes(usize),
    /// A count field is negative or absurd.
    #[error("invalid count {0}")]
    InvalidCount(i32),
    /// A string is not valid UTF-8.
    #[error("invalid utf-8 string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// A string does not fit the u16 length prefix.
    #[error("string of {0} bytes exceeds the format limit")]
    StringTooLong(usize),
    /// No factory is registered for the entity tag.
    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),
    /// The decoded tile count does not match the configured chunk size.
    #[error("expected {expected} tiles, found {found}")]
    TileCountMismatch { expected: usize, found: usize },
    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Byte codec
// ---------------------------------------------------------------------------

/// Big-endian writer.
///
/// A string too long for its length prefix is not written; the writer
/// remembers it and [`finish`](Self::finish) fails.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
    oversized: Option<usize>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            oversized: None,
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    /// Writes a `u16`-length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        let Ok(len) = u16::try_from(s.len()) else {
            self.oversized.get_or_insert(s.len());
            return;
        };
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The written bytes, or [`ChunkSerError::StringTooLong`] if a string
    /// was rejected.
    pub fn finish(self) -> Result<Vec<u8>, ChunkSerError> {
        match self.oversized {
            Some(len) => Err(ChunkSerError::StringTooLong(len)),
            None => Ok(self.buf),
        }
    }

    /// The written bytes, for callers that write no strings.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Big-endian reader over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChunkSerError> {
        if self.remaining() < n {
            return Err(ChunkSerError::Truncated {
                offset: self.offset,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ChunkSerError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_i32(&mut self) -> Result<i32, ChunkSerError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, ChunkSerError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn get_f32(&mut self) -> Result<f32, ChunkSerError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    pub fn get_bool(&mut self) -> Result<bool, ChunkSerError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn get_str(&mut self) -> Result<String, ChunkSerError> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    /// Reads an `i32` count, rejecting negatives.
    pub fn get_count(&mut self) -> Result<usize, ChunkSerError> {
        let n = self.get_i32()?;
        usize::try_from(n).map_err(|_| ChunkSerError::InvalidCount(n))
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    pub fn finish(&self) -> Result<(), ChunkSerError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ChunkSerError::TrailingBytes(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk serializer
// ---------------------------------------------------------------------------

/// Which audience an encoding is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeTarget {
    /// Local persistence: every entity.
    Disk,
    /// Another peer: replicable entities only.
    Wire,
}

/// Encodes and decodes [`ChunkContent`] for a given world geometry.
#[derive(Clone)]
pub struct ChunkSerializer {
    geometry: WorldGeometry,
    registry: Arc<EntityRegistry>,
}

impl ChunkSerializer {
    pub fn new(geometry: WorldGeometry, registry: Arc<EntityRegistry>) -> Self {
        Self { geometry, registry }
    }

    pub fn geometry(&self) -> &WorldGeometry {
        &self.geometry
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Encodes and compresses a chunk.
    pub fn encode(&self, content: &ChunkContent, target: EncodeTarget) -> Result<Vec<u8>, ChunkSerError> {
        compress(&self.encode_raw(content, target)?)
    }

    /// Decompresses and decodes a chunk. Either the whole chunk decodes or
    /// an error is returned; nothing is partially built.
    pub fn decode(&self, bytes: &[u8]) -> Result<ChunkContent, ChunkSerError> {
        self.decode_raw(&decompress(bytes)?)
    }

    /// Uncompressed encoding.
    pub fn encode_raw(
        &self,
        content: &ChunkContent,
        target: EncodeTarget,
    ) -> Result<Vec<u8>, ChunkSerError> {
        let tiles = content.tiles.tiles();
        let mut out = ByteWriter::with_capacity(12 + tiles.len() * 8);

        out.put_i32(content.coord.x);
        out.put_i32(content.coord.y);
        for tile in tiles {
            out.put_i32(tile.fg.0);
            out.put_i32(tile.bg.0);
        }

        let entities: Vec<&EntityInstance> = content
            .entities
            .iter()
            .filter(|e| !e.is_transient())
            .filter(|e| target == EncodeTarget::Disk || e.is_replicable())
            .collect();
        out.put_i32(entities.len() as i32);
        for entity in entities {
            out.put_str(entity.type_tag());
            let rel = self.geometry.to_chunk_relative(content.coord, entity.position);
            out.put_f32(rel.x);
            out.put_f32(rel.y);
            out.put_i32(entity.object_id.0);
            encode_entity_tail(entity, &mut out);
        }
        out.finish()
    }

    pub fn decode_raw(&self, bytes: &[u8]) -> Result<ChunkContent, ChunkSerError> {
        let mut input = ByteReader::new(bytes);
        let coord = ChunkCoord::new(input.get_i32()?, input.get_i32()?);

        let expected = self.geometry.tiles_per_chunk();
        // Reject short tile data up front instead of allocating for it.
        if input.remaining() < expected * 8 {
            return Err(ChunkSerError::TileCountMismatch {
                expected,
                found: input.remaining() / 8,
            });
        }
        let mut tiles = Vec::with_capacity(expected);
        for _ in 0..expected {
            let fg = BlockId(input.get_i32()?);
            let bg = BlockId(input.get_i32()?);
            tiles.push(Tile { fg, bg });
        }
        let tiles = TileGrid::from_tiles(self.geometry.chunk_size, tiles).ok_or(
            ChunkSerError::TileCountMismatch {
                expected,
                found: 0,
            },
        )?;

        let count = input.get_count()?;
        let mut entities = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let tag = input.get_str()?;
            let rel = Vec2::new(input.get_f32()?, input.get_f32()?);
            let id = ObjectId(input.get_i32()?);
            let position = self.geometry.to_world(coord, rel);
            entities.push(decode_entity_tail(&self.registry, &tag, id, position, &mut input)?);
        }
        input.finish()?;

        Ok(ChunkContent {
            coord,
            tiles,
            entities,
        })
    }

    /// The property-and-payload part of an entity, as carried by
    /// object-created packets.
    pub fn entity_tail(&self, entity: &EntityInstance) -> Result<Vec<u8>, ChunkSerError> {
        let mut out = ByteWriter::new();
        encode_entity_tail(entity, &mut out);
        out.finish()
    }

    /// Rebuilds an entity from its tag, id, world position and tail bytes.
    pub fn entity_from_tail(
        &self,
        tag: &str,
        id: ObjectId,
        position: Vec2,
        tail: &[u8],
    ) -> Result<EntityInstance, ChunkSerError> {
        let mut input = ByteReader::new(tail);
        let entity = decode_entity_tail(
            &self.registry,
            tag,
            id,
            self.geometry.wrap_position(position),
            &mut input,
        )?;
        input.finish()?;
        Ok(entity)
    }
}

fn encode_entity_tail(entity: &EntityInstance, out: &mut ByteWriter) {
    match &entity.properties {
        Some(props) => {
            out.put_bool(true);
            out.put_i32(props.len() as i32);
            for (k, v) in props {
                out.put_str(k);
                out.put_str(v);
            }
        }
        None => out.put_bool(false),
    }
    entity.state().encode_payload(out);
}

fn decode_entity_tail(
    registry: &EntityRegistry,
    tag: &str,
    id: ObjectId,
    position: Vec2,
    input: &mut ByteReader<'_>,
) -> Result<EntityInstance, ChunkSerError> {
    let properties = if input.get_bool()? {
        let n = input.get_count()?;
        let mut props = BTreeMap::new();
        for _ in 0..n {
            let k = input.get_str()?;
            let v = input.get_str()?;
            props.insert(k, v);
        }
        Some(props)
    } else {
        None
    };
    let state = registry.decode(tag, input)?;
    let mut entity = EntityInstance::new(id, position, state);
    entity.properties = properties;
    Ok(entity)
}

/// zlib-wrapped DEFLATE.
pub fn compress(raw: &[u8]) -> Result<Vec<u8>, ChunkSerError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, ChunkSerError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_DECODED_BYTES)
        .read_to_end(&mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// World metadata
// ---------------------------------------------------------------------------

/// File holding the id assigner's current value.
pub const WORLD_META_FILE: &str = "world.meta";

/// Reads the persisted id counter. `Ok(None)` for a fresh world.
pub fn read_world_meta(world_dir: &Path) -> Result<Option<i32>, ChunkSerError> {
    match std::fs::read(world_dir.join(WORLD_META_FILE)) {
        Ok(bytes) => {
            let mut input = ByteReader::new(&bytes);
            let value = input.get_i32()?;
            input.finish()?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn write_world_meta(world_dir: &Path, current_id: i32) -> Result<(), ChunkSerError> {
    std::fs::create_dir_all(world_dir)?;
    let tmp = world_dir.join(format!("{WORLD_META_FILE}.tmp"));
    std::fs::write(&tmp, current_id.to_be_bytes())?;
    std::fs::rename(tmp, world_dir.join(WORLD_META_FILE))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
