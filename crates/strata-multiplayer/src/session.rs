//! Host and client sessions.
//!
//! A session owns the player's [`ChunkStore`] and everything that keeps it in
//! step with the other peers. The app feeds it [`NetEvent`]s drained from the
//! transport and ticks it once per frame with the player's focus.
//!
//! Inbound messages are dispatched through a [`MessageRouter`] over the
//! session itself. Keepalives never reach a session; the connection tasks
//! answer them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use strata_config::NetworkConfig;
use strata_net::{
    FocusUpdate, Hello, Message, MessageRouter, MessageTag, NetEvent, PROTOCOL_VERSION, PeerId,
    PlayerJoin, PlayerLeft, Transport, Welcome, WorldInfo,
};
use strata_world::{
    Avatar, Chunk, ChunkCoord, ChunkFiles, ChunkSerializer, ChunkStore, EntityRegistry,
    EntityState, FileProvider, LoadingUi, ObjectId, PersistHandle, PersistOutcome, PhysicsSink,
    ProviderError, RetryPolicy, StoreContext, StoreSettings, TerrainGenerator, TickOutcome,
    WorkerPool,
};

use crate::arbiter::ChunkRequestArbiter;
use crate::id_assigner::IdAssigner;
use crate::peers::PeerRegistry;
use crate::providers::{NetworkClientProvider, NetworkHostProvider};
use crate::replication::{ReplicationBroker, ReplicationError};
use crate::sync::SyncCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("host closed the connection before welcoming us: {0}")]
    Rejected(String),
    #[error("no welcome from the host within {0:?}")]
    WelcomeTimeout(Duration),
    #[error("world storage: {0}")]
    Storage(#[from] ProviderError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Player name announced to the others.
    pub name: String,
    /// Time a peer must stay on its center chunk before it is asked for
    /// chunk data.
    pub min_dwell: Duration,
    pub bound_update_rate_hz: u32,
    /// Players admitted by the host, itself included.
    pub max_players: usize,
    /// A client repeats its focus update at least this often.
    pub focus_interval: Duration,
    /// Time allowed for the final saves on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: "player".to_string(),
            min_dwell: Duration::from_millis(2000),
            bound_update_rate_hz: 20,
            max_players: 8,
            focus_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionSettings {
    pub fn from_config(name: impl Into<String>, network: &NetworkConfig) -> Self {
        Self {
            name: name.into(),
            min_dwell: Duration::from_millis(network.dwell_threshold_ms),
            bound_update_rate_hz: network.bound_update_rate_hz,
            max_players: network.max_players as usize,
            focus_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(u64::from(network.timeout_seconds)),
        }
    }
}

/// Local collaborators a session builds its store from.
pub struct StoreParts<P, U> {
    pub pool: Arc<WorkerPool>,
    pub generator: Arc<dyn TerrainGenerator>,
    pub settings: StoreSettings,
    pub physics: P,
    pub ui: U,
    pub focus: Vec2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Disconnected { reason: String },
}

/// First message a client sends.
pub fn hello(name: &str) -> Message {
    Message::Hello(Hello {
        protocol: PROTOCOL_VERSION,
        name: name.to_string(),
    })
}

/// Looks for the host's welcome among events received before the session
/// exists. Losing the host connection at this point is an error.
pub fn welcome_from(event: NetEvent) -> Result<Option<Welcome>, SessionError> {
    match event {
        NetEvent::Message {
            message: Message::Welcome(welcome),
            ..
        } => Ok(Some(welcome)),
        NetEvent::Disconnected { peer, reason } if peer.is_host() => {
            Err(SessionError::Rejected(reason))
        }
        _ => Ok(None),
    }
}

fn avatar_state(owner: PeerId, name: &str) -> Box<dyn EntityState> {
    Box::new(Avatar {
        owner: owner.0,
        name: name.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// A peer's chunk save still being validated and written.
struct RemoteSave {
    from: PeerId,
    coord: ChunkCoord,
    handle: PersistHandle,
}

/// The authoritative peer. Serves chunk requests, assigns entity ids and
/// region authority, and persists every peer's saves.
pub struct HostSession<P: PhysicsSink, U: LoadingUi> {
    store: ChunkStore<P, U>,
    provider: Arc<NetworkHostProvider>,
    files: Arc<ChunkFiles>,
    transport: Arc<dyn Transport>,
    peers: PeerRegistry,
    arbiter: ChunkRequestArbiter,
    broker: ReplicationBroker,
    sync: SyncCoordinator,
    router: MessageRouter<Self>,
    world: WorldInfo,
    settings: SessionSettings,
    remote_saves: Vec<RemoteSave>,
    remote_saves_failed: u64,
    now: Instant,
}

impl<P: PhysicsSink, U: LoadingUi> HostSession<P, U> {
    /// Opens the world in `files`, restoring the id counter from its
    /// metadata.
    pub fn new(
        files: Arc<ChunkFiles>,
        seed: u64,
        retry: RetryPolicy,
        parts: StoreParts<P, U>,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let geometry = *files.serializer().geometry();
        let ids = Arc::new(match files.load_meta()? {
            Some(current) => IdAssigner::new(current),
            None => IdAssigner::default(),
        });
        tracing::info!(dir = %files.dir().display(), current_id = ids.current(), "hosting world");

        let local = FileProvider::new(Arc::clone(&files), Arc::clone(&parts.pool), retry, seed)
            .with_generator(Arc::clone(&parts.generator));
        let provider = Arc::new(NetworkHostProvider::new(local));
        let arbiter = ChunkRequestArbiter::new(
            Arc::clone(&files),
            Arc::clone(&parts.pool),
            Arc::clone(&transport),
            seed,
            settings.min_dwell,
        )
        .with_generator(Arc::clone(&parts.generator));
        let serializer = Arc::new(files.serializer().clone());
        let broker = ReplicationBroker::new(PeerId::HOST, serializer, ids, Arc::clone(&transport));
        let sync = SyncCoordinator::new(geometry, PeerId::HOST, settings.bound_update_rate_hz);

        let now = Instant::now();
        let mut peers = PeerRegistry::new();
        peers.join(PeerId::HOST, settings.name.clone(), now);

        let context = StoreContext {
            geometry,
            settings: parts.settings,
            seed,
            provider: provider.clone(),
            pool: parts.pool,
            generator: parts.generator,
        };
        let store = ChunkStore::new(context, parts.physics, parts.ui, parts.focus);

        let router = MessageRouter::new()
            .on(MessageTag::Hello, Self::on_hello)
            .on(MessageTag::FocusUpdate, Self::on_focus)
            .on(MessageTag::ChunkRequest, Self::on_chunk_request)
            .on(MessageTag::ChunkResponse, Self::on_chunk_response)
            .on(MessageTag::ChunkDeclined, Self::on_chunk_declined)
            .on(MessageTag::ChunkSave, Self::on_chunk_save)
            .on(MessageTag::ObjectCreated, Self::on_object_created)
            .on(MessageTag::ObjectRemoved, Self::on_object_removed)
            .on(MessageTag::EntityBoundUpdate, Self::on_bound_update);

        Ok(Self {
            store,
            provider,
            files,
            transport,
            peers,
            arbiter,
            broker,
            sync,
            router,
            world: WorldInfo::new(seed, &geometry),
            settings,
            remote_saves: Vec::new(),
            remote_saves_failed: 0,
            now,
        })
    }

    pub fn store(&self) -> &ChunkStore<P, U> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChunkStore<P, U> {
        &mut self.store
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Peer saves not yet on disk.
    pub fn pending_remote_saves(&self) -> usize {
        self.remote_saves.len()
    }

    /// Peer saves that were rejected or could not be written.
    pub fn remote_saves_failed(&self) -> u64 {
        self.remote_saves_failed
    }

    pub fn arbiter(&self) -> &ChunkRequestArbiter {
        &self.arbiter
    }

    pub fn broker(&self) -> &ReplicationBroker {
        &self.broker
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn provider(&self) -> &Arc<NetworkHostProvider> {
        &self.provider
    }

    pub fn world(&self) -> WorldInfo {
        self.world
    }

    pub fn handle_event(&mut self, event: NetEvent, now: Instant) {
        self.now = now;
        match event {
            NetEvent::Connected { peer, addr } => {
                tracing::debug!(%peer, %addr, "connection opened, waiting for hello");
            }
            NetEvent::Message { from, message } => {
                let tag = message.tag();
                if tag != MessageTag::Hello && !self.peers.contains(from) {
                    tracing::debug!(%from, ?tag, "message from a peer that never said hello");
                    return;
                }
                match self.router.handler(tag) {
                    Some(handler) => handler(self, from, message),
                    None => tracing::debug!(%from, ?tag, "host ignores message"),
                }
            }
            NetEvent::Disconnected { peer, reason } => self.on_disconnected(peer, &reason),
        }
    }

    /// Advances the store and pushes the host's view to the peers.
    pub fn tick(&mut self, focus: Vec2, now: Instant) -> TickOutcome {
        self.now = now;
        let outcome = self.store.tick(focus, now);
        self.poll_remote_saves();
        let focus = self.store.geometry().wrap_position(focus);
        self.peers
            .update_focus(PeerId::HOST, self.store.center(), focus, now);
        self.drive_avatar(focus);
        self.broker.retry_deferred(&mut self.store);

        let remotes = self.peers.remote_ids();
        for change in self.sync.reassign(&self.peers) {
            self.transport
                .send_all(&remotes, &Message::RegionAuthority(change));
        }
        if self.sync.due(now) && !remotes.is_empty() {
            let broker = &self.broker;
            for update in self
                .sync
                .outgoing_updates(&self.store, |id| broker.is_unconfirmed(id))
            {
                self.transport
                    .send_all(&remotes, &Message::EntityBoundUpdate(update));
            }
        }
        outcome
    }

    fn drive_avatar(&mut self, focus: Vec2) {
        match self.broker.avatar_of(PeerId::HOST) {
            Some(id) => {
                if !self.broker.materialize_avatar(&mut self.store, id, focus) {
                    return;
                }
                self.store.move_entity(id, focus);
            }
            None => {
                if self.store.chunk(self.store.center()).is_none() {
                    return;
                }
                let state = avatar_state(PeerId::HOST, &self.settings.name);
                let remotes = self.peers.remote_ids();
                match self.broker.host_spawn(&mut self.store, &remotes, state, focus) {
                    Ok(id) => tracing::info!(%id, "spawned host avatar"),
                    Err(e) => tracing::debug!(error = %e, "host avatar not spawned yet"),
                }
            }
        }
    }

    /// Drops finished peer saves and logs the failed ones. Bytes that
    /// failed to write stay in the save buffer for the shutdown flush.
    fn poll_remote_saves(&mut self) {
        let mut failed = 0;
        self.remote_saves.retain(|save| match save.handle.poll() {
            None => true,
            Some(PersistOutcome::Failed(reason)) => {
                failed += 1;
                tracing::warn!(peer = %save.from, coord = %save.coord, %reason, "peer chunk save failed");
                false
            }
            Some(_) => false,
        });
        self.remote_saves_failed += failed;
    }

    /// Creates an entity and announces it to every peer.
    pub fn spawn(
        &mut self,
        state: Box<dyn EntityState>,
        position: Vec2,
    ) -> Result<ObjectId, SessionError> {
        let remotes = self.peers.remote_ids();
        Ok(self
            .broker
            .host_spawn(&mut self.store, &remotes, state, position)?)
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        let remotes = self.peers.remote_ids();
        self.broker
            .host_remove(&mut self.store, &remotes, id)
            .is_some()
    }

    /// Saves the world and the id counter.
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        for save in std::mem::take(&mut self.remote_saves) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match save.handle.wait(remaining) {
                Some(PersistOutcome::Failed(reason)) => {
                    self.remote_saves_failed += 1;
                    tracing::warn!(peer = %save.from, coord = %save.coord, %reason, "peer chunk save failed");
                }
                Some(_) => {}
                None => {
                    tracing::warn!(peer = %save.from, coord = %save.coord, "peer chunk save still pending at shutdown");
                }
            }
        }
        self.store.shutdown(self.settings.shutdown_timeout);
        let current = self.broker.ids().current();
        self.files.save_meta(current)?;
        tracing::info!(current_id = current, "world saved");
        Ok(())
    }

    // --- handlers ---

    fn on_hello(&mut self, from: PeerId, message: Message) {
        let Message::Hello(hello) = message else {
            return;
        };
        if hello.protocol != PROTOCOL_VERSION {
            tracing::warn!(%from, protocol = hello.protocol, "hello with another protocol version");
            return;
        }
        if self.peers.contains(from) {
            tracing::debug!(%from, "repeated hello");
            return;
        }
        if self.peers.len() >= self.settings.max_players {
            tracing::warn!(%from, max = self.settings.max_players, "session full, ignoring hello");
            return;
        }
        let others = self.peers.remote_ids();
        self.peers.join(from, hello.name.clone(), self.now);
        tracing::info!(peer = %from, name = %hello.name, "player joined");

        let welcome = Welcome {
            peer_id: from,
            world: self.world,
            current_id: self.broker.ids().current(),
            players: self.peers.roster(),
        };
        self.send(from, Message::Welcome(welcome));
        self.transport.send_all(
            &others,
            &Message::PlayerJoin(PlayerJoin {
                peer: from,
                name: hello.name,
            }),
        );
        for created in self.broker.avatar_announcements() {
            self.send(from, Message::ObjectCreated(created));
        }
        for assignment in self.sync.assignments() {
            self.send(from, Message::RegionAuthority(assignment));
        }
    }

    fn on_focus(&mut self, from: PeerId, message: Message) {
        let Message::FocusUpdate(FocusUpdate { center, position }) = message else {
            return;
        };
        let geometry = *self.store.geometry();
        self.peers.update_focus(
            from,
            geometry.wrap(center),
            Vec2::from(position),
            self.now,
        );
    }

    fn on_chunk_request(&mut self, from: PeerId, message: Message) {
        let Message::ChunkRequest(request) = message else {
            return;
        };
        let store = &self.store;
        let host_chunks = |coord: ChunkCoord| store.chunk(coord).and_then(Chunk::snapshot);
        let source = self
            .arbiter
            .handle_request(from, request, &self.peers, &host_chunks, self.now);
        tracing::trace!(%from, coord = %request.position, ?source, "chunk request routed");
    }

    fn on_chunk_response(&mut self, from: PeerId, message: Message) {
        let Message::ChunkResponse(response) = message else {
            return;
        };
        self.arbiter.handle_response(from, response);
    }

    fn on_chunk_declined(&mut self, from: PeerId, message: Message) {
        let Message::ChunkDeclined(declined) = message else {
            return;
        };
        let store = &self.store;
        let host_chunks = |coord: ChunkCoord| store.chunk(coord).and_then(Chunk::snapshot);
        self.arbiter
            .handle_declined(from, declined, &self.peers, &host_chunks, self.now);
    }

    fn on_chunk_save(&mut self, from: PeerId, message: Message) {
        let Message::ChunkSave(save) = message else {
            return;
        };
        let coord = save.position;
        let handle = self.provider.persist_remote(from, save);
        self.remote_saves.push(RemoteSave { from, coord, handle });
    }

    fn on_object_created(&mut self, from: PeerId, message: Message) {
        let Message::ObjectCreated(created) = message else {
            return;
        };
        let others = self.peers.remote_ids_except(from);
        self.broker
            .host_on_created(&mut self.store, from, created, &others);
    }

    fn on_object_removed(&mut self, from: PeerId, message: Message) {
        let Message::ObjectRemoved(removed) = message else {
            return;
        };
        let others = self.peers.remote_ids_except(from);
        self.broker
            .host_on_removed(&mut self.store, removed, &others);
    }

    fn on_bound_update(&mut self, from: PeerId, message: Message) {
        let Message::EntityBoundUpdate(update) = message else {
            return;
        };
        let id = update.object_id;
        let reported = Vec2::new(update.x, update.y);
        let position = self.store.entity(id).map_or(reported, |e| e.position);
        let region = self.store.geometry().chunk_of(position);
        let owner = self.broker.avatar_owner(id);
        if !self.sync.accepts(from, region, owner) {
            tracing::trace!(%from, %id, %region, "dropping bound update from non-authority");
            return;
        }
        if owner.is_some() {
            self.broker.materialize_avatar(&mut self.store, id, reported);
        }
        self.sync.apply_bound_update(&mut self.store, &update);
        let others = self.peers.remote_ids_except(from);
        self.transport
            .send_all(&others, &Message::EntityBoundUpdate(update));
    }

    fn on_disconnected(&mut self, peer: PeerId, reason: &str) {
        if self.peers.leave(peer).is_none() {
            tracing::debug!(%peer, %reason, "unknown connection closed");
            return;
        }
        tracing::info!(%peer, %reason, "player left");
        let store = &self.store;
        let host_chunks = |coord: ChunkCoord| store.chunk(coord).and_then(Chunk::snapshot);
        let rerouted = self
            .arbiter
            .peer_left(peer, &self.peers, &host_chunks, self.now);
        if rerouted > 0 {
            tracing::debug!(%peer, rerouted, "rerouted requests held by departed player");
        }
        self.broker.remove_avatars_of(&mut self.store, peer);
        self.sync.forget_peer(peer);
        self.transport.send_all(
            &self.peers.remote_ids(),
            &Message::PlayerLeft(PlayerLeft { peer }),
        );
    }

    fn send(&self, to: PeerId, message: Message) {
        if let Err(e) = self.transport.send(to, message) {
            tracing::warn!(peer = %to, error = %e, "send failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A joined player. Chunks come from the host; entities created here get
/// their final ids from the host.
pub struct ClientSession<P: PhysicsSink, U: LoadingUi> {
    self_id: PeerId,
    store: ChunkStore<P, U>,
    provider: Arc<NetworkClientProvider>,
    transport: Arc<dyn Transport>,
    broker: ReplicationBroker,
    sync: SyncCoordinator,
    router: MessageRouter<Self>,
    players: BTreeMap<PeerId, String>,
    status: SessionStatus,
    settings: SessionSettings,
    last_focus: Option<(ChunkCoord, Instant)>,
}

impl<P: PhysicsSink, U: LoadingUi> ClientSession<P, U> {
    /// Builds the session from the host's welcome. The store starts loading
    /// at once.
    pub fn new(
        welcome: Welcome,
        parts: StoreParts<P, U>,
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
    ) -> Self {
        let self_id = welcome.peer_id;
        let geometry = welcome.world.geometry();
        let serializer = Arc::new(ChunkSerializer::new(
            geometry,
            Arc::new(EntityRegistry::with_builtins()),
        ));
        let provider = Arc::new(NetworkClientProvider::new(
            self_id,
            Arc::clone(&transport),
            Arc::clone(&serializer),
            Arc::clone(&parts.pool),
        ));
        let ids = Arc::new(IdAssigner::new(welcome.current_id));
        let broker = ReplicationBroker::new(self_id, serializer, ids, Arc::clone(&transport));
        let sync = SyncCoordinator::new(geometry, self_id, settings.bound_update_rate_hz);
        tracing::info!(peer = %self_id, seed = welcome.world.seed, players = welcome.players.len(), "joined session");

        let context = StoreContext {
            geometry,
            settings: parts.settings,
            seed: welcome.world.seed,
            provider: provider.clone(),
            pool: parts.pool,
            generator: parts.generator,
        };
        let store = ChunkStore::new(context, parts.physics, parts.ui, parts.focus);

        let router = MessageRouter::new()
            .on(MessageTag::PlayerJoin, Self::on_player_join)
            .on(MessageTag::PlayerLeft, Self::on_player_left)
            .on(MessageTag::ChunkRequest, Self::on_forwarded_request)
            .on(MessageTag::ChunkResponse, Self::on_chunk_response)
            .on(MessageTag::ChunkDeclined, Self::on_chunk_declined)
            .on(MessageTag::ObjectCreated, Self::on_object_created)
            .on(MessageTag::ObjectRemoved, Self::on_object_removed)
            .on(MessageTag::ObjectIdCorrection, Self::on_verdict)
            .on(MessageTag::IdCounterUpdate, Self::on_counter)
            .on(MessageTag::RegionAuthority, Self::on_region_authority)
            .on(MessageTag::EntityBoundUpdate, Self::on_bound_update);

        Self {
            self_id,
            store,
            provider,
            transport,
            broker,
            sync,
            router,
            players: welcome.players.into_iter().collect(),
            status: SessionStatus::Active,
            settings,
            last_focus: None,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn store(&self) -> &ChunkStore<P, U> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChunkStore<P, U> {
        &mut self.store
    }

    pub fn provider(&self) -> &Arc<NetworkClientProvider> {
        &self.provider
    }

    pub fn broker(&self) -> &ReplicationBroker {
        &self.broker
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    /// Everyone in the session, this player and the host included.
    pub fn players(&self) -> &BTreeMap<PeerId, String> {
        &self.players
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { .. } => {}
            NetEvent::Message { from, message } => {
                if !from.is_host() {
                    tracing::warn!(%from, "message from a peer other than the host");
                    return;
                }
                let tag = message.tag();
                match self.router.handler(tag) {
                    Some(handler) => handler(self, from, message),
                    None => tracing::debug!(?tag, "client ignores message"),
                }
            }
            NetEvent::Disconnected { peer, reason } if peer.is_host() => self.on_host_lost(reason),
            NetEvent::Disconnected { peer, .. } => {
                tracing::debug!(%peer, "disconnect for a non-host peer");
            }
        }
    }

    /// Advances the store and reports this player's state to the host.
    pub fn tick(&mut self, focus: Vec2, now: Instant) -> TickOutcome {
        let outcome = self.store.tick(focus, now);
        if !self.is_active() {
            return outcome;
        }
        let focus = self.store.geometry().wrap_position(focus);
        self.report_focus(focus, now);
        self.drive_avatar(focus);
        self.broker.retry_deferred(&mut self.store);
        if self.sync.due(now) {
            let broker = &self.broker;
            for update in self
                .sync
                .outgoing_updates(&self.store, |id| broker.is_unconfirmed(id))
            {
                self.send(Message::EntityBoundUpdate(update));
            }
        }
        outcome
    }

    fn report_focus(&mut self, focus: Vec2, now: Instant) {
        let center = self.store.center();
        let due = match self.last_focus {
            Some((last, at)) => {
                last != center || now.saturating_duration_since(at) >= self.settings.focus_interval
            }
            None => true,
        };
        if due {
            self.last_focus = Some((center, now));
            self.send(Message::FocusUpdate(FocusUpdate {
                center,
                position: focus.to_array(),
            }));
        }
    }

    fn drive_avatar(&mut self, focus: Vec2) {
        match self.broker.avatar_of(self.self_id) {
            Some(id) => {
                if self.broker.materialize_avatar(&mut self.store, id, focus) {
                    self.store.move_entity(id, focus);
                }
            }
            None => {
                if self.store.chunk(self.store.center()).is_none() {
                    return;
                }
                let state = avatar_state(self.self_id, &self.settings.name);
                match self.broker.client_spawn(&mut self.store, state, focus) {
                    Ok(id) => tracing::info!(%id, "spawned avatar"),
                    Err(e) => tracing::debug!(error = %e, "avatar not spawned yet"),
                }
            }
        }
    }

    /// Creates an entity under a guessed id. Returns the local id, which the
    /// host may still change.
    pub fn spawn(
        &mut self,
        state: Box<dyn EntityState>,
        position: Vec2,
    ) -> Result<ObjectId, SessionError> {
        Ok(self.broker.client_spawn(&mut self.store, state, position)?)
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        self.broker.client_remove(&mut self.store, id).is_some()
    }

    /// Sends every unsaved chunk to the host.
    pub fn shutdown(&mut self) {
        self.store.shutdown(self.settings.shutdown_timeout);
    }

    // --- handlers ---

    fn on_player_join(&mut self, _from: PeerId, message: Message) {
        let Message::PlayerJoin(join) = message else {
            return;
        };
        tracing::info!(peer = %join.peer, name = %join.name, "player joined");
        self.players.insert(join.peer, join.name);
    }

    fn on_player_left(&mut self, _from: PeerId, message: Message) {
        let Message::PlayerLeft(PlayerLeft { peer }) = message else {
            return;
        };
        self.players.remove(&peer);
        let removed = self.broker.remove_avatars_of(&mut self.store, peer);
        self.sync.forget_peer(peer);
        tracing::info!(%peer, removed, "player left");
    }

    fn on_forwarded_request(&mut self, _from: PeerId, message: Message) {
        let Message::ChunkRequest(request) = message else {
            return;
        };
        let content = self
            .store
            .chunk(request.position)
            .and_then(Chunk::snapshot);
        self.provider.answer_forwarded(request, content);
    }

    fn on_chunk_response(&mut self, _from: PeerId, message: Message) {
        let Message::ChunkResponse(response) = message else {
            return;
        };
        self.provider.on_response(response);
    }

    fn on_chunk_declined(&mut self, _from: PeerId, message: Message) {
        let Message::ChunkDeclined(declined) = message else {
            return;
        };
        self.provider.on_declined(declined);
    }

    fn on_object_created(&mut self, _from: PeerId, message: Message) {
        let Message::ObjectCreated(created) = message else {
            return;
        };
        self.broker.client_on_created(&mut self.store, created);
    }

    fn on_object_removed(&mut self, _from: PeerId, message: Message) {
        let Message::ObjectRemoved(removed) = message else {
            return;
        };
        self.broker.on_removed(&mut self.store, removed);
    }

    fn on_verdict(&mut self, _from: PeerId, message: Message) {
        let Message::ObjectIdCorrection(verdict) = message else {
            return;
        };
        self.broker.client_on_verdict(&mut self.store, verdict);
    }

    fn on_counter(&mut self, _from: PeerId, message: Message) {
        let Message::IdCounterUpdate(update) = message else {
            return;
        };
        self.broker.on_counter(update);
    }

    fn on_region_authority(&mut self, _from: PeerId, message: Message) {
        let Message::RegionAuthority(assignment) = message else {
            return;
        };
        self.sync.apply(assignment);
    }

    fn on_bound_update(&mut self, _from: PeerId, message: Message) {
        let Message::EntityBoundUpdate(update) = message else {
            return;
        };
        let id = update.object_id;
        if let Some(owner) = self.broker.avatar_owner(id) {
            if owner == self.self_id {
                return;
            }
            self.broker
                .materialize_avatar(&mut self.store, id, Vec2::new(update.x, update.y));
        }
        self.sync.apply_bound_update(&mut self.store, &update);
    }

    fn on_host_lost(&mut self, reason: String) {
        tracing::warn!(%reason, "lost connection to host");
        let failed = self.provider.fail_outstanding();
        let cleared = self.broker.clear_replicated(&mut self.store);
        tracing::debug!(failed, cleared, "dropped host state");
        self.players.retain(|id, _| *id == self.self_id);
        self.status = SessionStatus::Disconnected { reason };
    }

    fn send(&self, message: Message) {
        if let Err(e) = self.transport.send(PeerId::HOST, message) {
            tracing::debug!(error = %e, "send to host failed");
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
