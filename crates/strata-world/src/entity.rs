//! Entity instances anchored to chunks.
//!
//! Entity kinds are plain structs implementing [`EntityState`]. Optional
//! behaviour is exposed through capability traits ([`Collidable`],
//! [`Replicable`], [`LightEmitter`]) which a kind opts into by overriding the
//! matching accessor.

use std::collections::BTreeMap;
use std::fmt;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::serializer::{ByteReader, ByteWriter, ChunkSerError};

/// Globally unique entity id handed out by the host's id assigner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub i32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Axis-aligned collision footprint.
pub trait Collidable {
    /// Half extents in world units.
    fn half_extents(&self) -> Vec2;
}

/// Point light source.
pub trait LightEmitter {
    fn light_radius(&self) -> f32;
    fn light_color(&self) -> [f32; 3];
}

/// Entities whose existence and state are mirrored on every peer.
pub trait Replicable {
    /// Volatile state sent with entity bound updates.
    fn encode_state(&self, out: &mut ByteWriter) {
        let _ = out;
    }

    fn apply_state(&mut self, input: &mut ByteReader<'_>) -> Result<(), ChunkSerError> {
        let _ = input;
        Ok(())
    }
}

/// Type-specific part of an entity.
pub trait EntityState: fmt::Debug + Send + Sync {
    /// Stable tag used to pick the decode factory.
    fn type_tag(&self) -> &'static str;

    /// Writes the type-specific payload that follows the property map.
    /// The matching factory must consume exactly these bytes.
    fn encode_payload(&self, out: &mut ByteWriter) {
        let _ = out;
    }

    fn clone_box(&self) -> Box<dyn EntityState>;

    /// Transient entities exist only while their owner is in the session and
    /// are never written into chunk data.
    fn is_transient(&self) -> bool {
        false
    }

    fn as_collidable(&self) -> Option<&dyn Collidable> {
        None
    }

    fn as_light(&self) -> Option<&dyn LightEmitter> {
        None
    }

    fn as_replicable(&self) -> Option<&dyn Replicable> {
        None
    }

    fn as_replicable_mut(&mut self) -> Option<&mut dyn Replicable> {
        None
    }
}

impl Clone for Box<dyn EntityState> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A placed entity.
///
/// `position` is world-absolute with x inside `0..world_width`.
#[derive(Debug, Clone)]
pub struct EntityInstance {
    pub object_id: ObjectId,
    pub position: Vec2,
    pub properties: Option<BTreeMap<String, String>>,
    state: Box<dyn EntityState>,
}

impl EntityInstance {
    pub fn new(object_id: ObjectId, position: Vec2, state: Box<dyn EntityState>) -> Self {
        Self {
            object_id,
            position,
            properties: None,
            state,
        }
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn type_tag(&self) -> &'static str {
        self.state.type_tag()
    }

    pub fn state(&self) -> &dyn EntityState {
        self.state.as_ref()
    }

    pub fn state_mut(&mut self) -> &mut dyn EntityState {
        self.state.as_mut()
    }

    pub fn is_replicable(&self) -> bool {
        self.state.as_replicable().is_some()
    }

    pub fn is_transient(&self) -> bool {
        self.state.is_transient()
    }

    pub fn is_collidable(&self) -> bool {
        self.state.as_collidable().is_some()
    }

    /// Serialized type-specific payload.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        self.state.encode_payload(&mut out);
        out.into_inner()
    }
}

impl PartialEq for EntityInstance {
    fn eq(&self, other: &Self) -> bool {
        self.object_id == other.object_id
            && self.position == other.position
            && self.properties == other.properties
            && self.type_tag() == other.type_tag()
            && self.payload_bytes() == other.payload_bytes()
    }
}

// ---------------------------------------------------------------------------
// Built-in kinds
// ---------------------------------------------------------------------------

pub const TORCH_TAG: &str = "strata:torch";
pub const CHEST_TAG: &str = "strata:chest";
pub const DEBUG_MARKER_TAG: &str = "strata:debug_marker";
pub const AVATAR_TAG: &str = "strata:avatar";

/// Wall torch. Light source while lit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Torch {
    pub lit: bool,
}

impl EntityState for Torch {
    fn type_tag(&self) -> &'static str {
        TORCH_TAG
    }

    fn encode_payload(&self, out: &mut ByteWriter) {
        out.put_bool(self.lit);
    }

    fn clone_box(&self) -> Box<dyn EntityState> {
        Box::new(*self)
    }

    fn as_light(&self) -> Option<&dyn LightEmitter> {
        if self.lit { Some(self) } else { None }
    }

    fn as_replicable(&self) -> Option<&dyn Replicable> {
        Some(self)
    }

    fn as_replicable_mut(&mut self) -> Option<&mut dyn Replicable> {
        Some(self)
    }
}

impl LightEmitter for Torch {
    fn light_radius(&self) -> f32 {
        96.0
    }

    fn light_color(&self) -> [f32; 3] {
        [1.0, 0.8, 0.5]
    }
}

impl Replicable for Torch {
    fn encode_state(&self, out: &mut ByteWriter) {
        out.put_bool(self.lit);
    }

    fn apply_state(&mut self, input: &mut ByteReader<'_>) -> Result<(), ChunkSerError> {
        self.lit = input.get_bool()?;
        Ok(())
    }
}

impl Torch {
    pub(crate) fn decode(input: &mut ByteReader<'_>) -> Result<Box<dyn EntityState>, ChunkSerError> {
        Ok(Box::new(Torch {
            lit: input.get_bool()?,
        }))
    }
}

/// Storage chest holding block ids. The contents are its payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chest {
    pub items: Vec<i32>,
}

impl EntityState for Chest {
    fn type_tag(&self) -> &'static str {
        CHEST_TAG
    }

    fn encode_payload(&self, out: &mut ByteWriter) {
        out.put_i32(self.items.len() as i32);
        for item in &self.items {
            out.put_i32(*item);
        }
    }

    fn clone_box(&self) -> Box<dyn EntityState> {
        Box::new(self.clone())
    }

    fn as_collidable(&self) -> Option<&dyn Collidable> {
        Some(self)
    }

    fn as_replicable(&self) -> Option<&dyn Replicable> {
        Some(self)
    }

    fn as_replicable_mut(&mut self) -> Option<&mut dyn Replicable> {
        Some(self)
    }
}

impl Collidable for Chest {
    fn half_extents(&self) -> Vec2 {
        Vec2::new(8.0, 6.0)
    }
}

impl Replicable for Chest {}

impl Chest {
    pub(crate) fn decode(input: &mut ByteReader<'_>) -> Result<Box<dyn EntityState>, ChunkSerError> {
        let count = input.get_count()?;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(input.get_i32()?);
        }
        Ok(Box::new(Chest { items }))
    }
}

/// Local-only annotation. Saved with the chunk, never sent to peers.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugMarker {
    pub label: String,
}

impl EntityState for DebugMarker {
    fn type_tag(&self) -> &'static str {
        DEBUG_MARKER_TAG
    }

    fn encode_payload(&self, out: &mut ByteWriter) {
        out.put_str(&self.label);
    }

    fn clone_box(&self) -> Box<dyn EntityState> {
        Box::new(self.clone())
    }
}

impl DebugMarker {
    pub(crate) fn decode(input: &mut ByteReader<'_>) -> Result<Box<dyn EntityState>, ChunkSerError> {
        Ok(Box::new(DebugMarker {
            label: input.get_str()?,
        }))
    }
}

/// A player's body. Announced through object messages and removed when the
/// player leaves.
#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    /// Session peer id of the owning player.
    pub owner: u64,
    pub name: String,
}

impl EntityState for Avatar {
    fn type_tag(&self) -> &'static str {
        AVATAR_TAG
    }

    fn encode_payload(&self, out: &mut ByteWriter) {
        out.put_u64(self.owner);
        out.put_str(&self.name);
    }

    fn clone_box(&self) -> Box<dyn EntityState> {
        Box::new(self.clone())
    }

    fn is_transient(&self) -> bool {
        true
    }

    fn as_collidable(&self) -> Option<&dyn Collidable> {
        Some(self)
    }

    fn as_replicable(&self) -> Option<&dyn Replicable> {
        Some(self)
    }

    fn as_replicable_mut(&mut self) -> Option<&mut dyn Replicable> {
        Some(self)
    }
}

impl Collidable for Avatar {
    fn half_extents(&self) -> Vec2 {
        Vec2::new(6.0, 14.0)
    }
}

impl Replicable for Avatar {}

impl Avatar {
    pub(crate) fn decode(input: &mut ByteReader<'_>) -> Result<Box<dyn EntityState>, ChunkSerError> {
        Ok(Box::new(Avatar {
            owner: input.get_u64()?,
            name: input.get_str()?,
        }))
    }
}

/// Owner of `entity` if it is an avatar.
pub fn avatar_owner(entity: &EntityInstance) -> Option<u64> {
    if entity.type_tag() != AVATAR_TAG {
        return None;
    }
    let payload = entity.payload_bytes();
    ByteReader::new(&payload).get_u64().ok()
}
