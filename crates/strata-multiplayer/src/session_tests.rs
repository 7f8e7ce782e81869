use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use strata_net::{ChunkSave, EntityBoundUpdate, QueueTransport};
use strata_world::{BlockId, CHEST_TAG, Chest, DebugMarker, NoPhysics, TORCH_TAG, Tile, Torch};

use super::*;
use crate::test_support::{CS, SEED, TestUi, focus_in, open_files, pool, terrain};

type Host = HostSession<NoPhysics, TestUi>;
type Client = ClientSession<NoPhysics, TestUi>;

fn settings(name: &str) -> SessionSettings {
    SessionSettings {
        name: name.to_string(),
        min_dwell: Duration::ZERO,
        focus_interval: Duration::from_millis(50),
        ..SessionSettings::default()
    }
}

fn parts(focus: Vec2) -> StoreParts<NoPhysics, TestUi> {
    StoreParts {
        pool: pool(),
        generator: terrain(),
        settings: StoreSettings {
            settle: Duration::ZERO,
            ..StoreSettings::default()
        },
        physics: NoPhysics,
        ui: TestUi::default(),
        focus,
    }
}

struct Remote {
    session: Client,
    transport: Arc<QueueTransport>,
    focus: Vec2,
}

/// A host and its clients wired through in-memory queues.
struct Net {
    _dir: tempfile::TempDir,
    files: Arc<ChunkFiles>,
    host: Host,
    host_transport: Arc<QueueTransport>,
    host_focus: Vec2,
    clients: BTreeMap<PeerId, Remote>,
}

impl Net {
    fn new(host_focus: Vec2) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let files = open_files(dir.path());
        let host_transport = Arc::new(QueueTransport::new());
        let host = HostSession::new(
            Arc::clone(&files),
            SEED,
            RetryPolicy::immediate(2),
            parts(host_focus),
            host_transport.clone(),
            settings("host"),
        )
        .unwrap();
        Self {
            _dir: dir,
            files,
            host,
            host_transport,
            host_focus,
            clients: BTreeMap::new(),
        }
    }

    fn dir(&self) -> &Path {
        self._dir.path()
    }

    fn client(&self, id: u64) -> &Client {
        &self.clients[&PeerId(id)].session
    }

    fn client_mut(&mut self, id: u64) -> &mut Client {
        &mut self.clients.get_mut(&PeerId(id)).unwrap().session
    }

    fn join(&mut self, id: u64, focus: Vec2) {
        let peer = PeerId(id);
        self.host.handle_event(
            NetEvent::Message {
                from: peer,
                message: hello(&format!("p{id}")),
            },
            Instant::now(),
        );
        let mut welcome = None;
        let mut backlog = Vec::new();
        for (to, message) in self.host_transport.take() {
            if to != peer {
                self.deliver_to_client(to, message);
            } else if welcome.is_none() {
                let event = NetEvent::Message {
                    from: PeerId::HOST,
                    message,
                };
                welcome = welcome_from(event).unwrap();
            } else {
                backlog.push(message);
            }
        }
        let welcome = welcome.expect("host did not welcome the client");
        assert_eq!(welcome.peer_id, peer);
        let transport = Arc::new(QueueTransport::new());
        let session = ClientSession::new(
            welcome,
            parts(focus),
            transport.clone(),
            settings(&format!("p{id}")),
        );
        self.clients.insert(
            peer,
            Remote {
                session,
                transport,
                focus,
            },
        );
        for message in backlog {
            self.deliver_to_client(peer, message);
        }
    }

    fn deliver_to_client(&mut self, to: PeerId, message: Message) {
        if let Some(remote) = self.clients.get_mut(&to) {
            remote.session.handle_event(NetEvent::Message {
                from: PeerId::HOST,
                message,
            });
        }
    }

    /// Delivers everything queued so far. Returns the number of messages.
    fn pump(&mut self) -> usize {
        let mut moved = 0;
        for (to, message) in self.host_transport.take() {
            moved += 1;
            self.deliver_to_client(to, message);
        }
        let outbound: Vec<(PeerId, Vec<(PeerId, Message)>)> = self
            .clients
            .iter()
            .map(|(id, remote)| (*id, remote.transport.take()))
            .collect();
        for (from, messages) in outbound {
            for (_, message) in messages {
                moved += 1;
                self.host
                    .handle_event(NetEvent::Message { from, message }, Instant::now());
            }
        }
        moved
    }

    /// Pumps until no message moves for a short while, without ticking.
    fn drain(&mut self) {
        let mut quiet = 0;
        while quiet < 5 {
            if self.pump() == 0 {
                quiet += 1;
                std::thread::sleep(Duration::from_millis(2));
            } else {
                quiet = 0;
            }
        }
    }

    fn step(&mut self) {
        let now = Instant::now();
        self.host.tick(self.host_focus, now);
        for remote in self.clients.values_mut() {
            remote.session.tick(remote.focus, now);
        }
        self.pump();
    }

    fn run_until(&mut self, what: &str, done: impl Fn(&Net) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            self.step();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn all_loaded(&self) -> bool {
        self.host.store().loaded_coords().len() == 9
            && self
                .clients
                .values()
                .all(|r| r.session.store().loaded_coords().len() == 9)
    }

    /// Every avatar is known with its final id on every peer, and present
    /// wherever its owner stands inside the peer's window.
    fn avatars_settled(&self) -> bool {
        let mut owners = vec![(PeerId::HOST, self.host_focus)];
        owners.extend(self.clients.iter().map(|(id, r)| (*id, r.focus)));
        let present = |broker: &ReplicationBroker, store: &ChunkStore<NoPhysics, TestUi>| {
            owners.iter().all(|(owner, at)| {
                let visible = store.chunk(store.geometry().chunk_of(*at)).is_some();
                broker
                    .avatar_of(*owner)
                    .is_some_and(|id| !visible || store.entity(id).is_some())
            })
        };
        let host_ok = present(self.host.broker(), self.host.store());
        let clients_ok = self.clients.values().all(|r| {
            r.session.broker().unconfirmed_count() == 0
                && present(r.session.broker(), r.session.store())
        });
        host_ok && clients_ok
    }

    fn settle(&mut self) {
        self.run_until("windows and avatars", |net| {
            net.all_loaded() && net.avatars_settled()
        });
        self.drain();
    }
}

fn tag_at(store: &ChunkStore<NoPhysics, TestUi>, id: i32) -> Option<&'static str> {
    store.entity(ObjectId(id)).map(|e| e.type_tag())
}

#[test]
fn test_client_joins_and_loads_host_window() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.run_until("host window", |net| net.all_loaded());
    net.join(1, spot);
    net.settle();

    let client = net.client(1);
    assert!(client.is_active());
    assert_eq!(
        client.players().keys().copied().collect::<Vec<_>>(),
        vec![PeerId::HOST, PeerId(1)]
    );
    for coord in net.host.store().loaded_coords() {
        let ours = net.host.store().chunk(coord).and_then(Chunk::snapshot).unwrap();
        let theirs = client.store().chunk(coord).and_then(Chunk::snapshot).unwrap();
        assert_eq!(ours.tiles, theirs.tiles, "tiles differ at {coord}");
    }
    assert!(net.host.arbiter().stats().from_host_window >= 9);
}

#[test]
fn test_entity_ids_converge_across_three_peers() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.join(1, spot);
    net.join(2, spot);
    net.settle();

    let next = net.host.broker().ids().current();
    let host_corrections = net.host.broker().corrections();
    let client_corrections = net.client(1).broker().corrections();
    assert_eq!(net.client(1).broker().ids().current(), next);
    assert_eq!(net.client(2).broker().ids().current(), next);

    // Host and client 1 create at the same time and pick the same id.
    net.host
        .spawn(Box::new(Torch { lit: true }), spot + Vec2::new(3.0, 0.0))
        .unwrap();
    let guessed = net
        .client_mut(1)
        .spawn(Box::new(Chest { items: vec![4] }), spot - Vec2::new(3.0, 0.0))
        .unwrap();
    assert_eq!(guessed, ObjectId(next));
    net.drain();

    let stores = [
        net.host.store(),
        net.client(1).store(),
        net.client(2).store(),
    ];
    for store in stores {
        assert_eq!(tag_at(store, next), Some(TORCH_TAG));
        assert_eq!(tag_at(store, next + 1), Some(CHEST_TAG));
        assert!(store.entities().all(|e| e.object_id.0 >= 0));
    }
    assert_eq!(net.host.broker().corrections(), host_corrections + 1);
    assert_eq!(net.client(1).broker().corrections(), client_corrections + 1);
    for id in [1, 2] {
        assert_eq!(net.client(id).broker().ids().current(), next + 2);
    }
}

#[test]
fn test_forwarded_chunk_carries_peer_edits() {
    let away = focus_in(8, 3);
    let mut net = Net::new(focus_in(2, 3));
    net.join(1, away);
    net.settle();

    let marked = Tile::new(BlockId(42), BlockId::DIRT);
    let cell = away + Vec2::new(CS / 4.0, CS / 4.0);
    assert!(net.client_mut(1).store_mut().set_tile_at(cell, marked));

    net.join(2, away);
    net.settle();
    assert_eq!(net.client(2).store().tile_at(cell), Some(marked));
    assert!(net.host.arbiter().stats().from_peers >= 1);
}

#[test]
fn test_departed_player_avatar_is_removed_everywhere() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.join(1, spot);
    net.join(2, spot);
    net.settle();
    let avatar = net.client(2).broker().avatar_of(PeerId(1)).unwrap();
    assert!(net.client(2).store().entity(avatar).is_some());

    net.clients.remove(&PeerId(1));
    net.host.handle_event(
        NetEvent::Disconnected {
            peer: PeerId(1),
            reason: "closed".into(),
        },
        Instant::now(),
    );
    net.drain();

    assert!(!net.host.peers().contains(PeerId(1)));
    assert!(net.host.store().entity(avatar).is_none());
    assert!(net.client(2).store().entity(avatar).is_none());
    assert!(!net.client(2).players().contains_key(&PeerId(1)));
    assert!(net.host.sync().regions_of(PeerId(1)).is_empty());
}

#[test]
fn test_client_save_reaches_host_disk() {
    let away = focus_in(8, 3);
    let mut net = Net::new(focus_in(2, 3));
    net.join(1, away);
    net.settle();

    let id = net
        .client_mut(1)
        .spawn(Box::new(Chest { items: vec![7, 7] }), away)
        .unwrap();
    net.run_until("chest id confirmed", |net| {
        net.client(1).broker().unconfirmed_count() == 0
    });
    net.client_mut(1).shutdown();
    net.drain();

    let coord = ChunkCoord::new(8, 3);
    let deadline = Instant::now() + Duration::from_secs(10);
    let saved = loop {
        if let Ok(Some(content)) = net.files.load(coord) {
            break content;
        }
        assert!(Instant::now() < deadline, "save never reached the host");
        std::thread::sleep(Duration::from_millis(5));
    };
    let tags: Vec<&str> = saved.entities.iter().map(|e| e.type_tag()).collect();
    assert_eq!(tags, vec![CHEST_TAG]);
    assert_eq!(saved.entities[0].object_id, id);
    assert!(net.dir().join(format!("world_{SEED:016x}")).is_dir());
}

#[test]
fn test_invalid_client_save_is_reported() {
    let away = focus_in(8, 3);
    let mut net = Net::new(focus_in(2, 3));
    net.join(1, away);
    net.settle();

    let coord = ChunkCoord::new(12, 3);
    let save = ChunkSave {
        connection_id: PeerId(1),
        position: coord,
        chunk_data: vec![1, 2, 3],
    };
    net.host.handle_event(
        NetEvent::Message {
            from: PeerId(1),
            message: Message::ChunkSave(save),
        },
        Instant::now(),
    );
    assert_eq!(net.host.pending_remote_saves(), 1);
    net.run_until("rejected save reported", |net| {
        net.host.remote_saves_failed() == 1
    });
    assert_eq!(net.host.pending_remote_saves(), 0);
    assert_eq!(net.files.read_disk(coord).unwrap(), None);
    assert_eq!(net.files.buffered(coord), None);
}

#[test]
fn test_host_loss_keeps_only_local_entities() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.join(1, spot);
    net.settle();

    let torch = net
        .host
        .spawn(Box::new(Torch { lit: true }), spot + Vec2::new(2.0, 0.0))
        .unwrap();
    net.drain();
    let marker = net
        .client_mut(1)
        .spawn(
            Box::new(DebugMarker {
                label: "mine".into(),
            }),
            spot,
        )
        .unwrap();
    net.drain();
    assert!(net.client(1).store().entity(torch).is_some());

    let client = net.client_mut(1);
    client.handle_event(NetEvent::Disconnected {
        peer: PeerId::HOST,
        reason: "timeout".into(),
    });
    assert_eq!(
        client.status(),
        &SessionStatus::Disconnected {
            reason: "timeout".into()
        }
    );
    assert!(client.store().entity(torch).is_none());
    assert!(client.store().entity(marker).is_some());
    assert_eq!(client.players().len(), 1);
}

#[test]
fn test_avatar_moves_follow_their_owner() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.join(1, spot);
    net.settle();
    let avatar = net.host.broker().avatar_of(PeerId(1)).unwrap();

    let moved = spot + Vec2::new(6.0, 0.0);
    net.clients.get_mut(&PeerId(1)).unwrap().focus = moved;
    net.run_until("avatar position on host", |net| {
        net.host
            .store()
            .entity(avatar)
            .is_some_and(|e| e.position == moved)
    });
}

#[test]
fn test_bound_update_from_non_authority_is_dropped() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.join(1, spot);
    net.settle();
    assert_eq!(
        net.host.sync().authority_of(ChunkCoord::new(2, 3)),
        Some(PeerId::HOST)
    );

    let at = spot + Vec2::new(2.0, 0.0);
    let torch = net.host.spawn(Box::new(Torch { lit: true }), at).unwrap();
    net.drain();
    net.host.handle_event(
        NetEvent::Message {
            from: PeerId(1),
            message: Message::EntityBoundUpdate(EntityBoundUpdate {
                object_id: torch,
                x: at.x + 5.0,
                y: at.y,
                state: vec![0],
            }),
        },
        Instant::now(),
    );
    assert_eq!(net.host.store().entity(torch).unwrap().position, at);
}

#[test]
fn test_id_counter_survives_host_restart() {
    let spot = focus_in(2, 3);
    let mut net = Net::new(spot);
    net.settle();
    net.host.spawn(Box::new(Torch { lit: true }), spot).unwrap();
    let current = net.host.broker().ids().current();
    net.host.shutdown().unwrap();

    let reopened = HostSession::new(
        open_files(net.dir()),
        SEED,
        RetryPolicy::immediate(2),
        parts(spot),
        Arc::new(QueueTransport::new()),
        settings("host"),
    )
    .unwrap();
    assert_eq!(reopened.broker().ids().current(), current);
}
