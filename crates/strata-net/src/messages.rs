//! Wire messages exchanged between a host and its clients.
//!
//! A packet is `[compression flag][protocol version][postcard body]`; see
//! [`encode_packet`]. Chunk bytes travel inside messages exactly as the
//! chunk serializer produced them, so a peer decodes a received chunk with
//! the same routine it uses for files.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_world::{ChunkCoord, ObjectId, RequestId, WorldGeometry};

use crate::compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};

/// Bumped on any incompatible change to [`Message`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Identity of a session participant. The host is always [`PeerId::HOST`];
/// clients get ids from the server's connection counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const HOST: PeerId = PeerId(0);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            f.write_str("host")
        } else {
            write!(f, "peer-{}", self.0)
        }
    }
}

/// Minimum delivery guarantee a message needs.
///
/// TCP delivers everything in order; the class matters for code that picks a
/// channel per message and for deciding what may be dropped under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    ReliableOrdered,
    Unordered,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// First message a client sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol: u8,
    pub name: String,
}

/// World parameters a client needs to build a matching geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldInfo {
    pub seed: u64,
    pub chunk_size: u32,
    pub block_size: f32,
    pub width_chunks: i32,
    pub height_chunks: i32,
}

impl WorldInfo {
    pub fn new(seed: u64, geometry: &WorldGeometry) -> Self {
        Self {
            seed,
            chunk_size: geometry.chunk_size,
            block_size: geometry.block_size,
            width_chunks: geometry.width_chunks,
            height_chunks: geometry.height_chunks,
        }
    }

    pub fn geometry(&self) -> WorldGeometry {
        WorldGeometry::new(
            self.chunk_size,
            self.block_size,
            self.width_chunks,
            self.height_chunks,
        )
    }
}

/// Host's answer to [`Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub peer_id: PeerId,
    pub world: WorldInfo,
    /// Id assigner value at the time of joining.
    pub current_id: i32,
    /// Players already in the session, host included.
    pub players: Vec<(PeerId, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerJoin {
    pub peer: PeerId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerLeft {
    pub peer: PeerId,
}

/// A client's window center and focus position, sent when the center changes
/// and periodically with the focus position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusUpdate {
    pub center: ChunkCoord,
    pub position: [f32; 2],
}

// ---------------------------------------------------------------------------
// Chunk traffic
// ---------------------------------------------------------------------------

/// Asks for a chunk's bytes. Clients send it to the host; the host forwards
/// it to a peer holding the chunk, with itself as `connection_id` and its own
/// request id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub connection_id: PeerId,
    pub position: ChunkCoord,
    pub request_id: RequestId,
    /// Set on a resubmission: the peer that can no longer serve it.
    pub rejected_by: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub request_id: RequestId,
    /// Encoded chunk, same bytes as a chunk file.
    pub file_bytes: Vec<u8>,
}

/// A peer cannot serve a forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkDeclined {
    pub request_id: RequestId,
}

/// Fire-and-forget save of a chunk the sender is evicting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSave {
    pub connection_id: PeerId,
    pub position: ChunkCoord,
    pub chunk_data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Object lifecycle
// ---------------------------------------------------------------------------

/// A new entity. `property_bytes` is the entity's property map and payload
/// as laid out in chunk data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreated {
    pub object_id: ObjectId,
    pub type_name: String,
    pub x: f32,
    pub y: f32,
    pub property_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectRemoved {
    pub object_id: ObjectId,
}

/// The host's verdict on an id guessed by the entity's creator. Equal ids
/// confirm the guess.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectIdCorrection {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
}

/// The host's id assigner moved on; the next entity gets `new_current_id`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdCounterUpdate {
    pub new_current_id: i32,
}

/// Position and volatile state of an entity, sent by the authority of the
/// region the entity is in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBoundUpdate {
    pub object_id: ObjectId,
    pub x: f32,
    pub y: f32,
    pub state: Vec<u8>,
}

/// `authority` simulates the chunk-sized region `region` from now on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionAuthority {
    pub region: ChunkCoord,
    pub authority: PeerId,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    PlayerJoin(PlayerJoin),
    PlayerLeft(PlayerLeft),
    FocusUpdate(FocusUpdate),
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
    ChunkDeclined(ChunkDeclined),
    ChunkSave(ChunkSave),
    ObjectCreated(ObjectCreated),
    ObjectRemoved(ObjectRemoved),
    ObjectIdCorrection(ObjectIdCorrection),
    IdCounterUpdate(IdCounterUpdate),
    EntityBoundUpdate(EntityBoundUpdate),
    RegionAuthority(RegionAuthority),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl Message {
    /// Entity creation, id corrections and counter updates must keep their
    /// relative order; removals, bound updates and keepalives need not.
    pub fn delivery(&self) -> Delivery {
        match self {
            Message::ObjectRemoved(_)
            | Message::EntityBoundUpdate(_)
            | Message::Ping { .. }
            | Message::Pong { .. } => Delivery::Unordered,
            _ => Delivery::ReliableOrdered,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("empty message")]
    EmptyPayload,
    #[error("protocol version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Version byte followed by the postcard encoding.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, MessageError> {
    let mut out = vec![PROTOCOL_VERSION];
    out.extend_from_slice(&postcard::to_allocvec(message)?);
    Ok(out)
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, MessageError> {
    let (&version, body) = bytes.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion {
            found: version,
            expected: PROTOCOL_VERSION,
        });
    }
    Ok(postcard::from_bytes(body)?)
}

/// Encodes and optionally compresses a message, ready for framing.
pub fn encode_packet(message: &Message, config: &CompressionConfig) -> Result<Vec<u8>, MessageError> {
    Ok(compress_payload(&encode_message(message)?, config))
}

pub fn decode_packet(packet: &[u8]) -> Result<Message, MessageError> {
    decode_message(&decompress_payload(packet)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::FLAG_LZ4;

    #[test]
    fn test_chunk_request_roundtrip_keeps_rejection_marker() {
        let message = Message::ChunkRequest(ChunkRequest {
            connection_id: PeerId(3),
            position: ChunkCoord::new(-1, 4),
            request_id: RequestId(42),
            rejected_by: Some(PeerId(2)),
        });
        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_object_lifecycle_messages_roundtrip() {
        let messages = [
            Message::ObjectCreated(ObjectCreated {
                object_id: ObjectId(17),
                type_name: "strata:torch".into(),
                x: 12.5,
                y: -3.0,
                property_bytes: vec![0, 1],
            }),
            Message::ObjectIdCorrection(ObjectIdCorrection {
                old_id: ObjectId(5),
                new_id: ObjectId(7),
            }),
            Message::IdCounterUpdate(IdCounterUpdate { new_current_id: 8 }),
        ];
        for message in messages {
            let packet = encode_packet(&message, &CompressionConfig::default()).unwrap();
            assert_eq!(decode_packet(&packet).unwrap(), message);
        }
    }

    #[test]
    fn test_version_byte_leads_and_is_checked() {
        let mut bytes = encode_message(&Message::Ping { nonce: 1 }).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);

        bytes[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            decode_message(&bytes),
            Err(MessageError::UnsupportedVersion { expected: PROTOCOL_VERSION, .. })
        ));
        assert!(matches!(decode_message(&[]), Err(MessageError::EmptyPayload)));
    }

    #[test]
    fn test_garbage_body_is_a_postcard_error() {
        assert!(matches!(
            decode_message(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]),
            Err(MessageError::Postcard(_))
        ));
    }

    #[test]
    fn test_large_chunk_response_is_compressed() {
        let message = Message::ChunkResponse(ChunkResponse {
            request_id: RequestId(1),
            file_bytes: vec![0u8; 16 * 1024],
        });
        let packet = encode_packet(&message, &CompressionConfig::default()).unwrap();
        assert_eq!(packet[0], FLAG_LZ4);
        assert_eq!(decode_packet(&packet).unwrap(), message);
    }

    #[test]
    fn test_delivery_classes() {
        let removed = Message::ObjectRemoved(ObjectRemoved {
            object_id: ObjectId(1),
        });
        let counter = Message::IdCounterUpdate(IdCounterUpdate { new_current_id: 2 });
        let bound = Message::EntityBoundUpdate(EntityBoundUpdate {
            object_id: ObjectId(1),
            x: 0.0,
            y: 0.0,
            state: Vec::new(),
        });
        assert_eq!(removed.delivery(), Delivery::Unordered);
        assert_eq!(bound.delivery(), Delivery::Unordered);
        assert_eq!(counter.delivery(), Delivery::ReliableOrdered);
    }

    #[test]
    fn test_world_info_rebuilds_geometry() {
        let geometry = WorldGeometry::new(16, 8.0, 32, 8);
        let info = WorldInfo::new(99, &geometry);
        assert_eq!(info.geometry(), geometry);
        assert_eq!(info.seed, 99);
    }

    #[test]
    fn test_peer_display() {
        assert_eq!(PeerId::HOST.to_string(), "host");
        assert_eq!(PeerId(4).to_string(), "peer-4");
    }
}
