//! Entity creation and removal across peers, and the global id protocol.
//!
//! The host's [`IdAssigner`] is the only source of ids. A client creating an
//! entity guesses the next id from its own copy of the counter, inserts the
//! entity locally at once and announces it. The host answers the creator
//! with a verdict ([`ObjectIdCorrection`], equal ids when the guess stood),
//! relays the entity under its final id to everyone else and broadcasts the
//! new counter value. All of these ride the ordered channel, so a client
//! sees the verdicts for its guesses in the order it made them.
//!
//! When a relayed creation reuses an id the client is still holding as an
//! unconfirmed guess, the guess was lost: the local entity moves to a
//! provisional negative id until its verdict arrives.
//!
//! Avatars are not part of chunk data. Their announcements are kept as
//! templates so an avatar can be rebuilt when it walks back into a window,
//! and so the host can introduce existing players to a newcomer.

use std::sync::Arc;

use glam::Vec2;
use rustc_hash::{FxHashMap, FxHashSet};
use strata_net::{
    IdCounterUpdate, Message, ObjectCreated, ObjectIdCorrection, ObjectRemoved, PeerId, Transport,
};
use strata_world::{
    AVATAR_TAG, ChunkCoord, ChunkSerError, ChunkSerializer, ChunkStore, EntityInstance,
    EntityState, LoadingUi, ObjectId, PhysicsSink, avatar_owner,
};

use crate::id_assigner::{IdAssigner, IdClaim};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("no loaded chunk under {0}")]
    NotLoaded(Vec2),
    #[error("entity codec: {0}")]
    Codec(#[from] ChunkSerError),
}

#[derive(Debug, Clone)]
struct AvatarTemplate {
    owner: PeerId,
    announcement: ObjectCreated,
}

pub struct ReplicationBroker {
    self_id: PeerId,
    serializer: Arc<ChunkSerializer>,
    ids: Arc<IdAssigner>,
    transport: Arc<dyn Transport>,
    /// Guess -> id the entity has locally while the verdict is outstanding.
    unconfirmed: FxHashMap<ObjectId, ObjectId>,
    /// Guesses removed locally before their verdict arrived.
    removed_unconfirmed: FxHashSet<ObjectId>,
    next_provisional: i32,
    avatars: FxHashMap<ObjectId, AvatarTemplate>,
    /// Creations for window chunks that were still loading.
    deferred: Vec<ObjectCreated>,
    corrections: u64,
}

impl ReplicationBroker {
    pub fn new(
        self_id: PeerId,
        serializer: Arc<ChunkSerializer>,
        ids: Arc<IdAssigner>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            self_id,
            serializer,
            ids,
            transport,
            unconfirmed: FxHashMap::default(),
            removed_unconfirmed: FxHashSet::default(),
            next_provisional: -1,
            avatars: FxHashMap::default(),
            deferred: Vec::new(),
            corrections: 0,
        }
    }

    pub fn ids(&self) -> &Arc<IdAssigner> {
        &self.ids
    }

    /// Guesses still waiting for the host's verdict.
    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Whether `id` is a local entity whose final id is not known yet.
    pub fn is_unconfirmed(&self, id: ObjectId) -> bool {
        id.0 < 0 || self.unconfirmed.values().any(|local| *local == id)
    }

    /// Id corrections handled so far: issued on the host, applied on a
    /// client.
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Owner of the avatar with `id`, if one was announced.
    pub fn avatar_owner(&self, id: ObjectId) -> Option<PeerId> {
        self.avatars.get(&id).map(|t| t.owner)
    }

    /// Id of `owner`'s avatar, if one was announced.
    pub fn avatar_of(&self, owner: PeerId) -> Option<ObjectId> {
        self.avatars
            .iter()
            .filter(|(_, t)| t.owner == owner)
            .map(|(id, _)| *id)
            .min()
    }

    /// Announcements of every known avatar, in id order.
    pub fn avatar_announcements(&self) -> Vec<ObjectCreated> {
        let mut out: Vec<ObjectCreated> =
            self.avatars.values().map(|t| t.announcement.clone()).collect();
        out.sort_by_key(|a| a.object_id);
        out
    }

    fn announcement(&self, entity: &EntityInstance) -> Result<ObjectCreated, ChunkSerError> {
        Ok(ObjectCreated {
            object_id: entity.object_id,
            type_name: entity.type_tag().to_string(),
            x: entity.position.x,
            y: entity.position.y,
            property_bytes: self.serializer.entity_tail(entity)?,
        })
    }

    fn rebuild(&self, created: &ObjectCreated) -> Result<EntityInstance, ChunkSerError> {
        self.serializer.entity_from_tail(
            &created.type_name,
            created.object_id,
            Vec2::new(created.x, created.y),
            &created.property_bytes,
        )
    }

    fn remember_avatar(&mut self, created: &ObjectCreated) {
        if created.type_name != AVATAR_TAG {
            return;
        }
        match self.rebuild(created) {
            Ok(entity) => {
                if let Some(owner) = avatar_owner(&entity) {
                    self.avatars.insert(
                        created.object_id,
                        AvatarTemplate {
                            owner: PeerId(owner),
                            announcement: created.clone(),
                        },
                    );
                }
            }
            Err(e) => tracing::warn!(id = %created.object_id, error = %e, "avatar did not decode"),
        }
    }

    fn chunk_under(&self, position: Vec2) -> ChunkCoord {
        self.serializer.geometry().chunk_of(position)
    }

    /// Inserts a received entity. Creations for window chunks still loading
    /// are kept and retried by [`retry_deferred`](Self::retry_deferred).
    fn place<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        created: ObjectCreated,
    ) {
        if store.entity(created.object_id).is_some() {
            tracing::debug!(id = %created.object_id, "entity already present");
            return;
        }
        let entity = match self.rebuild(&created) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!(id = %created.object_id, tag = %created.type_name, error = %e, "dropping undecodable entity");
                return;
            }
        };
        if store.insert_entity(entity).is_err() {
            let coord = self.chunk_under(Vec2::new(created.x, created.y));
            if store.window_coords().iter().flatten().any(|c| *c == coord) {
                self.deferred.push(created);
            } else {
                tracing::trace!(id = %created.object_id, %coord, "entity outside window");
            }
        }
    }

    /// Inserts deferred creations whose chunk has loaded; drops those whose
    /// chunk left the window.
    pub fn retry_deferred<P: PhysicsSink, U: LoadingUi>(&mut self, store: &mut ChunkStore<P, U>) {
        if self.deferred.is_empty() {
            return;
        }
        let window = store.window_coords();
        let pending = std::mem::take(&mut self.deferred);
        for created in pending {
            let coord = self.chunk_under(Vec2::new(created.x, created.y));
            if !window.iter().flatten().any(|c| *c == coord) {
                continue;
            }
            if store.chunk(coord).is_some() {
                self.place(store, created);
            } else {
                self.deferred.push(created);
            }
        }
    }

    /// Rebuilds a known avatar at `position` if it is not in the store,
    /// e.g. after it walked back into the window. Returns `true` if the
    /// avatar is present afterwards.
    pub fn materialize_avatar<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        id: ObjectId,
        position: Vec2,
    ) -> bool {
        if store.entity(id).is_some() {
            return true;
        }
        let Some(template) = self.avatars.get(&id) else {
            return false;
        };
        let mut announcement = template.announcement.clone();
        announcement.object_id = id;
        announcement.x = position.x;
        announcement.y = position.y;
        match self.rebuild(&announcement) {
            Ok(entity) => store.insert_entity(entity).is_ok(),
            Err(_) => false,
        }
    }

    /// Drops every avatar of `peer`, locally and from the templates.
    pub fn remove_avatars_of<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        peer: PeerId,
    ) -> usize {
        self.avatars.retain(|_, t| t.owner != peer);
        self.deferred.retain(|c| {
            c.type_name != AVATAR_TAG
                || self
                    .serializer
                    .entity_from_tail(&c.type_name, c.object_id, Vec2::ZERO, &c.property_bytes)
                    .ok()
                    .and_then(|e| avatar_owner(&e))
                    != Some(peer.0)
        });
        let removed = store.remove_entities_where(|e| avatar_owner(e) == Some(peer.0));
        if !removed.is_empty() {
            tracing::debug!(%peer, count = removed.len(), "removed avatars of departed player");
        }
        removed.len()
    }

    /// Drops every replicated entity, e.g. after the host connection is
    /// lost. Local-only entities stay.
    pub fn clear_replicated<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
    ) -> usize {
        self.unconfirmed.clear();
        self.removed_unconfirmed.clear();
        self.avatars.clear();
        self.deferred.clear();
        store.remove_entities_where(EntityInstance::is_replicable).len()
    }

    // -----------------------------------------------------------------------
    // Host
    // -----------------------------------------------------------------------

    /// Creates an entity on the host under the next id and announces it to
    /// `peers`.
    pub fn host_spawn<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        peers: &[PeerId],
        state: Box<dyn EntityState>,
        position: Vec2,
    ) -> Result<ObjectId, ReplicationError> {
        if store.chunk(self.chunk_under(position)).is_none() {
            return Err(ReplicationError::NotLoaded(position));
        }
        let id = self.ids.allocate();
        let entity = EntityInstance::new(id, position, state);
        let shared = entity.is_replicable();
        let created = self.announcement(&entity)?;
        if let Err(entity) = store.insert_entity(entity) {
            return Err(ReplicationError::NotLoaded(entity.position));
        }
        if shared {
            self.remember_avatar(&created);
            self.transport.send_all(peers, &Message::ObjectCreated(created));
        }
        self.broadcast_counter(peers);
        Ok(id)
    }

    /// A client announced an entity under a guessed id. Answers the creator
    /// with a verdict, relays the entity under its final id to `others` and
    /// sends the new counter value to everyone. Local-only entities are
    /// announced only to claim an id and are not relayed.
    pub fn host_on_created<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        from: PeerId,
        mut created: ObjectCreated,
        others: &[PeerId],
    ) -> IdClaim {
        let claim = self.ids.claim(created.object_id);
        if let IdClaim::Corrected { guessed, assigned } = claim {
            self.corrections += 1;
            tracing::info!(%from, %guessed, %assigned, "corrected guessed entity id");
        }
        let verdict = ObjectIdCorrection {
            old_id: created.object_id,
            new_id: claim.id(),
        };
        if let Err(e) = self.transport.send(from, Message::ObjectIdCorrection(verdict)) {
            tracing::warn!(peer = %from, error = %e, "could not send id verdict");
        }

        created.object_id = claim.id();
        let shared = match self.rebuild(&created) {
            Ok(entity) => entity.is_replicable(),
            Err(e) => {
                tracing::warn!(%from, tag = %created.type_name, error = %e, "announced entity did not decode");
                false
            }
        };
        if shared {
            self.remember_avatar(&created);
            self.place(store, created.clone());
            self.transport.send_all(others, &Message::ObjectCreated(created));
        }

        let mut everyone = others.to_vec();
        everyone.push(from);
        self.broadcast_counter(&everyone);
        claim
    }

    /// Removes an entity on the host and tells `peers`.
    pub fn host_remove<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        peers: &[PeerId],
        id: ObjectId,
    ) -> Option<EntityInstance> {
        let removed = store.remove_entity(id);
        self.avatars.remove(&id);
        self.transport.send_all(
            peers,
            &Message::ObjectRemoved(ObjectRemoved { object_id: id }),
        );
        removed
    }

    fn broadcast_counter(&self, peers: &[PeerId]) {
        let update = IdCounterUpdate {
            new_current_id: self.ids.current(),
        };
        self.transport
            .send_all(peers, &Message::IdCounterUpdate(update));
    }

    // -----------------------------------------------------------------------
    // Client
    // -----------------------------------------------------------------------

    fn provisional(&mut self) -> ObjectId {
        let id = ObjectId(self.next_provisional);
        self.next_provisional -= 1;
        id
    }

    /// Creates an entity under a guessed id and announces it to the host.
    /// Returns the id the entity has locally, which the host's verdict may
    /// change.
    pub fn client_spawn<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        state: Box<dyn EntityState>,
        position: Vec2,
    ) -> Result<ObjectId, ReplicationError> {
        if store.chunk(self.chunk_under(position)).is_none() {
            return Err(ReplicationError::NotLoaded(position));
        }
        let guess = self.ids.allocate();
        let local = if store.entity(guess).is_some() {
            self.provisional()
        } else {
            guess
        };
        let entity = EntityInstance::new(local, position, state);
        let mut created = self.announcement(&entity)?;
        created.object_id = guess;
        if let Err(entity) = store.insert_entity(entity) {
            return Err(ReplicationError::NotLoaded(entity.position));
        }
        self.remember_avatar(&created);
        if local != guess
            && let Some(template) = self.avatars.remove(&guess)
        {
            self.avatars.insert(local, template);
        }
        self.unconfirmed.insert(guess, local);
        if let Err(e) = self
            .transport
            .send(PeerId::HOST, Message::ObjectCreated(created))
        {
            tracing::warn!(%guess, error = %e, "could not announce entity");
        }
        Ok(local)
    }

    /// Removes a local entity and tells the host. An entity whose verdict is
    /// outstanding is announced as removed once its final id is known.
    pub fn client_remove<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        id: ObjectId,
    ) -> Option<EntityInstance> {
        let removed = store.remove_entity(id)?;
        self.avatars.remove(&id);
        let guess = self
            .unconfirmed
            .iter()
            .find(|(_, local)| **local == id)
            .map(|(guess, _)| *guess);
        match guess {
            Some(guess) => {
                self.removed_unconfirmed.insert(guess);
            }
            None => self.send_removed(id),
        }
        Some(removed)
    }

    fn send_removed(&self, id: ObjectId) {
        let message = Message::ObjectRemoved(ObjectRemoved { object_id: id });
        if let Err(e) = self.transport.send(PeerId::HOST, message) {
            tracing::warn!(%id, error = %e, "could not announce removal");
        }
    }

    /// An entity created elsewhere.
    pub fn client_on_created<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        created: ObjectCreated,
    ) {
        let id = created.object_id;
        if self.unconfirmed.get(&id) == Some(&id) {
            // Our guess lost; park our entity until the verdict renames it.
            let provisional = self.provisional();
            store.reassign_entity_id(id, provisional);
            if let Some(template) = self.avatars.remove(&id) {
                self.avatars.insert(provisional, template);
            }
            self.unconfirmed.insert(id, provisional);
            tracing::debug!(%id, %provisional, "guessed id taken, parked local entity");
        }
        self.remember_avatar(&created);
        self.place(store, created);
    }

    /// The host's verdict on one of our guesses.
    pub fn client_on_verdict<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        verdict: ObjectIdCorrection,
    ) {
        let (guess, assigned) = (verdict.old_id, verdict.new_id);
        let Some(local) = self.unconfirmed.remove(&guess) else {
            tracing::debug!(%guess, "verdict for unknown guess");
            return;
        };
        if local != assigned {
            store.reassign_entity_id(local, assigned);
            if let Some(mut template) = self.avatars.remove(&local) {
                template.announcement.object_id = assigned;
                self.avatars.insert(assigned, template);
            }
        }
        if guess != assigned {
            self.corrections += 1;
            tracing::info!(%guess, %assigned, "entity id corrected by host");
        }
        if self.removed_unconfirmed.remove(&guess) {
            self.send_removed(assigned);
        }
    }

    pub fn on_counter(&self, update: IdCounterUpdate) {
        self.ids.observe(update.new_current_id);
    }

    /// An entity removed elsewhere. Returns `true` if it was present.
    pub fn on_removed<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        removed: ObjectRemoved,
    ) -> bool {
        let id = removed.object_id;
        self.avatars.remove(&id);
        self.deferred.retain(|c| c.object_id != id);
        store.remove_entity(id).is_some()
    }

    /// Host side of a removal: apply it and relay it to `others`.
    pub fn host_on_removed<P: PhysicsSink, U: LoadingUi>(
        &mut self,
        store: &mut ChunkStore<P, U>,
        removed: ObjectRemoved,
        others: &[PeerId],
    ) -> bool {
        let present = self.on_removed(store, removed);
        self.transport
            .send_all(others, &Message::ObjectRemoved(removed));
        present
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }
}

#[cfg(test)]
#[path = "replication_tests.rs"]
mod tests;
