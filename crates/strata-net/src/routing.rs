//! Inbound event channel and tag-based message dispatch.
//!
//! Socket tasks push [`NetEvent`]s into a bounded [`mpsc`] channel. The
//! simulation thread drains it once per tick ([`drain_events`]) and hands
//! each message to a [`MessageRouter`], which calls the handler registered
//! for the message's [`MessageTag`] with mutable access to the session
//! state.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::messages::{Message, PeerId};

// ---------------------------------------------------------------------------
// MessageTag
// ---------------------------------------------------------------------------

/// Payload-free discriminant of [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageTag {
    Hello,
    Welcome,
    PlayerJoin,
    PlayerLeft,
    FocusUpdate,
    ChunkRequest,
    ChunkResponse,
    ChunkDeclined,
    ChunkSave,
    ObjectCreated,
    ObjectRemoved,
    ObjectIdCorrection,
    IdCounterUpdate,
    EntityBoundUpdate,
    RegionAuthority,
    Ping,
    Pong,
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Hello(_) => MessageTag::Hello,
            Message::Welcome(_) => MessageTag::Welcome,
            Message::PlayerJoin(_) => MessageTag::PlayerJoin,
            Message::PlayerLeft(_) => MessageTag::PlayerLeft,
            Message::FocusUpdate(_) => MessageTag::FocusUpdate,
            Message::ChunkRequest(_) => MessageTag::ChunkRequest,
            Message::ChunkResponse(_) => MessageTag::ChunkResponse,
            Message::ChunkDeclined(_) => MessageTag::ChunkDeclined,
            Message::ChunkSave(_) => MessageTag::ChunkSave,
            Message::ObjectCreated(_) => MessageTag::ObjectCreated,
            Message::ObjectRemoved(_) => MessageTag::ObjectRemoved,
            Message::ObjectIdCorrection(_) => MessageTag::ObjectIdCorrection,
            Message::IdCounterUpdate(_) => MessageTag::IdCounterUpdate,
            Message::EntityBoundUpdate(_) => MessageTag::EntityBoundUpdate,
            Message::RegionAuthority(_) => MessageTag::RegionAuthority,
            Message::Ping { .. } => MessageTag::Ping,
            Message::Pong { .. } => MessageTag::Pong,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What the socket tasks report to the simulation thread.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connected { peer: PeerId, addr: SocketAddr },
    Message { from: PeerId, message: Message },
    Disconnected { peer: PeerId, reason: String },
}

/// Bounded channel between socket tasks and the simulation thread.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<NetEvent>, mpsc::Receiver<NetEvent>) {
    mpsc::channel(capacity)
}

/// Takes at most `max` queued events without waiting.
pub fn drain_events(receiver: &mut mpsc::Receiver<NetEvent>, max: usize) -> Vec<NetEvent> {
    let mut events = Vec::new();
    while events.len() < max {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
    }
    events
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// A message handler over session state `S`.
///
/// Handlers are plain function pointers so a session can copy one out of its
/// own router and call it with `&mut self`.
pub type Handler<S> = fn(&mut S, PeerId, Message);

pub struct MessageRouter<S> {
    handlers: HashMap<MessageTag, Handler<S>>,
}

impl<S> Default for MessageRouter<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> MessageRouter<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `tag`, returning the handler it replaces.
    pub fn register(&mut self, tag: MessageTag, handler: Handler<S>) -> Option<Handler<S>> {
        self.handlers.insert(tag, handler)
    }

    /// Builder-style [`register`](Self::register).
    pub fn on(mut self, tag: MessageTag, handler: Handler<S>) -> Self {
        self.handlers.insert(tag, handler);
        self
    }

    pub fn handler(&self, tag: MessageTag) -> Option<Handler<S>> {
        self.handlers.get(&tag).copied()
    }

    /// Dispatches `message`. Returns `false` when no handler is registered,
    /// in which case the message is dropped.
    pub fn route(&self, state: &mut S, from: PeerId, message: Message) -> bool {
        let tag = message.tag();
        match self.handler(tag) {
            Some(handler) => {
                handler(state, from, message);
                true
            }
            None => {
                tracing::debug!(?tag, %from, "no handler registered, dropping message");
                false
            }
        }
    }

    pub fn registered_tags(&self) -> Vec<MessageTag> {
        let mut tags: Vec<MessageTag> = self.handlers.keys().copied().collect();
        tags.sort();
        tags
    }
}
