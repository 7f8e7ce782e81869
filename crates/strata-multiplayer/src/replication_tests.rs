use std::sync::Arc;

use glam::Vec2;
use strata_net::QueueTransport;
use strata_world::{Avatar, Chest, DebugMarker, TORCH_TAG, Torch};

use super::*;
use crate::test_support::{TestStore, focus_in, offline_store, serializer, settle};

struct Peer {
    _dir: tempfile::TempDir,
    store: TestStore,
    broker: ReplicationBroker,
    transport: Arc<QueueTransport>,
}

fn peer(id: PeerId, current_id: i32) -> Peer {
    let dir = tempfile::tempdir().unwrap();
    let focus = focus_in(2, 3);
    let mut store = offline_store(dir.path(), focus);
    settle(&mut store, focus);
    let transport = Arc::new(QueueTransport::new());
    let broker = ReplicationBroker::new(
        id,
        serializer(),
        Arc::new(IdAssigner::new(current_id)),
        transport.clone(),
    );
    Peer {
        _dir: dir,
        store,
        broker,
        transport,
    }
}

fn spot(dx: f32) -> Vec2 {
    focus_in(2, 3) + Vec2::new(dx, 0.0)
}

fn created_to_host(transport: &QueueTransport) -> ObjectCreated {
    match transport.take().pop() {
        Some((PeerId::HOST, Message::ObjectCreated(created))) => created,
        other => panic!("expected an announcement to the host, got {other:?}"),
    }
}

fn tag_of(store: &TestStore, id: i32) -> Option<&'static str> {
    store.entity(ObjectId(id)).map(EntityInstance::type_tag)
}

#[test]
fn test_host_spawn_announces_and_advances_counter() {
    let mut host = peer(PeerId::HOST, 1);
    let peers = [PeerId(1), PeerId(2)];
    let id = host
        .broker
        .host_spawn(&mut host.store, &peers, Box::new(Torch { lit: true }), spot(1.0))
        .unwrap();
    assert_eq!(id, ObjectId(1));
    assert_eq!(tag_of(&host.store, 1), Some(TORCH_TAG));

    let sent = host.transport.take();
    assert_eq!(sent.len(), 4);
    assert!(matches!(&sent[0], (PeerId(1), Message::ObjectCreated(c)) if c.object_id == ObjectId(1)));
    assert_eq!(
        sent[3],
        (
            PeerId(2),
            Message::IdCounterUpdate(IdCounterUpdate { new_current_id: 2 })
        )
    );
}

#[test]
fn test_unencodable_spawn_is_refused() {
    let mut client = peer(PeerId(1), 5);
    let marker = DebugMarker {
        label: "z".repeat(70_000),
    };
    let err = client
        .broker
        .client_spawn(&mut client.store, Box::new(marker), spot(1.0))
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Codec(ChunkSerError::StringTooLong(70_000))));
    assert!(client.transport.take().is_empty());
    assert_eq!(client.broker.unconfirmed_count(), 0);
}

#[test]
fn test_host_spawn_outside_window_burns_no_id() {
    let mut host = peer(PeerId::HOST, 1);
    let far = focus_in(9, 3);
    let err = host
        .broker
        .host_spawn(&mut host.store, &[], Box::new(Torch { lit: true }), far)
        .unwrap_err();
    assert!(matches!(err, ReplicationError::NotLoaded(_)));
    assert_eq!(host.broker.ids().current(), 1);
}

#[test]
fn test_matching_guess_is_confirmed() {
    let mut host = peer(PeerId::HOST, 5);
    let mut client = peer(PeerId(1), 5);

    let local = client
        .broker
        .client_spawn(&mut client.store, Box::new(Chest { items: vec![] }), spot(2.0))
        .unwrap();
    assert_eq!(local, ObjectId(5));
    let created = created_to_host(&client.transport);

    let claim = host
        .broker
        .host_on_created(&mut host.store, PeerId(1), created, &[PeerId(2)]);
    assert_eq!(claim, IdClaim::Accepted(ObjectId(5)));
    assert!(host.store.entity(ObjectId(5)).is_some());

    let sent = host.transport.take();
    let verdict = ObjectIdCorrection {
        old_id: ObjectId(5),
        new_id: ObjectId(5),
    };
    assert_eq!(sent[0], (PeerId(1), Message::ObjectIdCorrection(verdict)));
    assert!(matches!(&sent[1], (PeerId(2), Message::ObjectCreated(c)) if c.object_id == ObjectId(5)));

    client.broker.client_on_verdict(&mut client.store, verdict);
    assert_eq!(client.broker.unconfirmed_count(), 0);
    assert_eq!(client.broker.corrections(), 0);
    assert!(client.store.entity(ObjectId(5)).is_some());
}

#[test]
fn test_stale_guess_is_renamed() {
    let mut host = peer(PeerId::HOST, 7);
    let mut client = peer(PeerId(1), 5);

    client
        .broker
        .client_spawn(&mut client.store, Box::new(Torch { lit: false }), spot(2.0))
        .unwrap();
    let created = created_to_host(&client.transport);
    let claim = host
        .broker
        .host_on_created(&mut host.store, PeerId(1), created, &[]);
    assert_eq!(
        claim,
        IdClaim::Corrected {
            guessed: ObjectId(5),
            assigned: ObjectId(7)
        }
    );

    for (to, message) in host.transport.take() {
        assert_eq!(to, PeerId(1));
        match message {
            Message::ObjectIdCorrection(v) => client.broker.client_on_verdict(&mut client.store, v),
            Message::IdCounterUpdate(u) => client.broker.on_counter(u),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(client.store.entity(ObjectId(5)).is_none());
    assert_eq!(tag_of(&client.store, 7), Some(TORCH_TAG));
    assert_eq!(client.broker.ids().current(), 8);
    assert_eq!(client.broker.corrections(), 1);
}

#[test]
fn test_lost_guess_parks_local_entity() {
    let mut client = peer(PeerId(1), 5);
    client
        .broker
        .client_spawn(&mut client.store, Box::new(Chest { items: vec![] }), spot(2.0))
        .unwrap();
    client.transport.take();

    // Another player's torch got id 5 first.
    let torch = EntityInstance::new(ObjectId(5), spot(-3.0), Box::new(Torch { lit: true }));
    let relayed = client.broker.announcement(&torch).unwrap();
    client.broker.client_on_created(&mut client.store, relayed);
    assert_eq!(tag_of(&client.store, 5), Some(TORCH_TAG));
    assert!(client.store.entity(ObjectId(-1)).is_some());

    client.broker.client_on_verdict(
        &mut client.store,
        ObjectIdCorrection {
            old_id: ObjectId(5),
            new_id: ObjectId(6),
        },
    );
    assert_eq!(tag_of(&client.store, 5), Some(TORCH_TAG));
    assert_eq!(tag_of(&client.store, 6), Some(strata_world::CHEST_TAG));
    assert!(client.store.entity(ObjectId(-1)).is_none());
}

#[test]
fn test_local_only_entity_claims_id_without_relay() {
    let mut host = peer(PeerId::HOST, 3);
    let mut client = peer(PeerId(1), 3);
    client
        .broker
        .client_spawn(
            &mut client.store,
            Box::new(DebugMarker {
                label: "note".into(),
            }),
            spot(0.0),
        )
        .unwrap();
    let created = created_to_host(&client.transport);
    host.broker
        .host_on_created(&mut host.store, PeerId(1), created, &[PeerId(2)]);

    let sent = host.transport.take();
    assert!(sent.iter().all(|(_, m)| !matches!(m, Message::ObjectCreated(_))));
    assert!(host.store.entity(ObjectId(3)).is_none());
    assert_eq!(host.broker.ids().current(), 4);
}

#[test]
fn test_removal_before_verdict_uses_final_id() {
    let mut client = peer(PeerId(1), 5);
    let local = client
        .broker
        .client_spawn(&mut client.store, Box::new(Torch { lit: true }), spot(1.0))
        .unwrap();
    client.transport.take();

    assert!(client.broker.client_remove(&mut client.store, local).is_some());
    assert!(client.transport.take().is_empty());

    client.broker.client_on_verdict(
        &mut client.store,
        ObjectIdCorrection {
            old_id: ObjectId(5),
            new_id: ObjectId(8),
        },
    );
    assert_eq!(
        client.transport.take(),
        vec![(
            PeerId::HOST,
            Message::ObjectRemoved(ObjectRemoved {
                object_id: ObjectId(8)
            })
        )]
    );
}

#[test]
fn test_avatar_rebuilt_from_template() {
    let mut client = peer(PeerId(1), 1);
    let avatar = EntityInstance::new(
        ObjectId(4),
        spot(0.0),
        Box::new(Avatar {
            owner: 2,
            name: "bea".into(),
        }),
    );
    let announced = client.broker.announcement(&avatar).unwrap();
    client.broker.client_on_created(&mut client.store, announced);
    assert_eq!(client.broker.avatar_owner(ObjectId(4)), Some(PeerId(2)));
    assert!(client.store.entity(ObjectId(4)).is_some());

    // Gone with its chunk, then seen again.
    client.store.remove_entity(ObjectId(4));
    assert!(
        client
            .broker
            .materialize_avatar(&mut client.store, ObjectId(4), spot(5.0))
    );
    assert_eq!(client.store.entity(ObjectId(4)).unwrap().position, spot(5.0));

    assert_eq!(client.broker.remove_avatars_of(&mut client.store, PeerId(2)), 1);
    assert!(
        !client
            .broker
            .materialize_avatar(&mut client.store, ObjectId(4), spot(5.0))
    );
}

#[test]
fn test_creation_for_loading_chunk_is_deferred() {
    let dir = tempfile::tempdir().unwrap();
    let focus = focus_in(2, 3);
    let mut store = offline_store(dir.path(), focus);
    let mut broker = ReplicationBroker::new(
        PeerId(1),
        serializer(),
        Arc::new(IdAssigner::default()),
        Arc::new(QueueTransport::new()),
    );
    let torch = EntityInstance::new(ObjectId(9), spot(0.0), Box::new(Torch { lit: true }));
    let relayed = broker.announcement(&torch).unwrap();
    broker.client_on_created(&mut store, relayed);

    settle(&mut store, focus);
    broker.retry_deferred(&mut store);
    assert!(store.entity(ObjectId(9)).is_some());
}

#[test]
fn test_clear_replicated_keeps_local_only() {
    let mut host = peer(PeerId::HOST, 1);
    host.broker
        .host_spawn(&mut host.store, &[], Box::new(Torch { lit: true }), spot(0.0))
        .unwrap();
    host.broker
        .host_spawn(
            &mut host.store,
            &[],
            Box::new(DebugMarker {
                label: "keep".into(),
            }),
            spot(1.0),
        )
        .unwrap();
    assert_eq!(host.broker.clear_replicated(&mut host.store), 1);
    assert!(host.store.entity(ObjectId(2)).is_some());
}
