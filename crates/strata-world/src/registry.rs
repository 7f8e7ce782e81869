//! Entity type registry: maps stable type tags to decode factories.
//!
//! Built once at startup; the serializer looks tags up while decoding a chunk
//! and fails the whole chunk on an unknown tag.

use rustc_hash::FxHashMap;

use thiserror::Error;

use crate::entity::{
    AVATAR_TAG, Avatar, CHEST_TAG, Chest, DEBUG_MARKER_TAG, DebugMarker, EntityState, TORCH_TAG,
    Torch,
};
use crate::serializer::{ByteReader, ChunkSerError};

/// Reads a type-specific payload and builds the entity state.
pub type EntityFactory =
    fn(&mut ByteReader<'_>) -> Result<Box<dyn EntityState>, ChunkSerError>;

/// Errors that can occur during entity type registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A factory with the same tag has already been registered.
    #[error("duplicate entity type tag: {0}")]
    DuplicateTag(String),
}

/// Tag → factory lookup.
#[derive(Default)]
pub struct EntityRegistry {
    factories: FxHashMap<String, EntityFactory>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (tag, factory) in [
            (TORCH_TAG, Torch::decode as EntityFactory),
            (CHEST_TAG, Chest::decode as EntityFactory),
            (DEBUG_MARKER_TAG, DebugMarker::decode as EntityFactory),
            (AVATAR_TAG, Avatar::decode as EntityFactory),
        ] {
            // Fresh registry, tags are distinct.
            let _ = registry.register(tag, factory);
        }
        registry
    }

    /// Registers a factory for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateTag`] if the tag is taken.
    pub fn register(&mut self, tag: &str, factory: EntityFactory) -> Result<(), RegistryError> {
        if self.factories.contains_key(tag) {
            return Err(RegistryError::DuplicateTag(tag.to_string()));
        }
        self.factories.insert(tag.to_string(), factory);
        tracing::debug!(tag, "registered entity type");
        Ok(())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Decodes the payload for `tag`.
    pub fn decode(
        &self,
        tag: &str,
        input: &mut ByteReader<'_>,
    ) -> Result<Box<dyn EntityState>, ChunkSerError> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| ChunkSerError::UnknownEntityType(tag.to_string()))?;
        factory(input)
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("EntityRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = EntityRegistry::with_builtins();
        assert_eq!(registry.len(), 4);
        assert!(registry.contains(TORCH_TAG));
        assert!(registry.contains(CHEST_TAG));
        assert!(registry.contains(DEBUG_MARKER_TAG));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut registry = EntityRegistry::with_builtins();
        let err = registry.register(TORCH_TAG, Torch::decode).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTag(t) if t == TORCH_TAG));
    }

    #[test]
    fn test_decode_dispatches_by_tag() {
        let registry = EntityRegistry::with_builtins();
        let bytes = [1u8];
        let state = registry.decode(TORCH_TAG, &mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(state.type_tag(), TORCH_TAG);
        assert!(state.as_light().is_some());
    }

    #[test]
    fn test_unknown_tag_errors() {
        let registry = EntityRegistry::new();
        assert!(registry.is_empty());
        let result = registry.decode("nope", &mut ByteReader::new(&[]));
        assert!(matches!(result, Err(ChunkSerError::UnknownEntityType(_))));
    }
}
