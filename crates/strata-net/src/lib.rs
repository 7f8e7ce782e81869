//! TCP transport for Strata sessions: framing, message codec, routing and
//! connection lifecycle.
//!
//! Socket tasks run on tokio. Everything they receive is turned into
//! [`NetEvent`]s on a bounded channel that the simulation thread drains once
//! per tick; outbound messages go through a [`Transport`], which never blocks
//! the caller.

pub mod compression;
pub mod framing;
pub mod messages;
pub mod reconnection;
pub mod routing;
pub mod tcp_client;
pub mod tcp_server;
pub mod transport;

pub use compression::{CompressionConfig, CompressionError, compress_payload, decompress_payload};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use messages::{
    ChunkDeclined, ChunkRequest, ChunkResponse, ChunkSave, Delivery, EntityBoundUpdate,
    FocusUpdate, Hello, IdCounterUpdate, Message, MessageError, ObjectCreated,
    ObjectIdCorrection, ObjectRemoved, PROTOCOL_VERSION, PeerId, PlayerJoin, PlayerLeft,
    RegionAuthority, Welcome, WorldInfo, decode_message, decode_packet, encode_message,
    encode_packet,
};
pub use reconnection::{ReconnectError, reconnect, reconnect_policy};
pub use routing::{Handler, MessageRouter, MessageTag, NetEvent, drain_events, event_channel};
pub use tcp_client::{ClientConfig, ClientError, ClientHandle, ConnectionState, GameClient};
pub use tcp_server::{ConnectionMap, GameServer, ServerConfig, ServerHandle};
pub use transport::{QueueTransport, SendError, Transport};
