//! Region authority and entity-bound updates.
//!
//! Every chunk-sized region inside some player's window has exactly one
//! authority: the peer that simulates the entities in it and sends their
//! positions to everyone else. The host decides; clients learn the result
//! through [`RegionAuthority`] messages. Avatars are the exception: a
//! player's own avatar is always driven by that player.

use std::time::{Duration, Instant};

use glam::Vec2;
use rustc_hash::FxHashMap;
use strata_net::{EntityBoundUpdate, PeerId, RegionAuthority};
use strata_world::{
    ByteReader, ByteWriter, ChunkCoord, ChunkStore, LoadingUi, ObjectId, PhysicsSink,
    WorldGeometry, avatar_owner,
};

use crate::peers::{PeerInfo, PeerRegistry};

pub struct SyncCoordinator {
    geometry: WorldGeometry,
    self_id: PeerId,
    authorities: FxHashMap<ChunkCoord, PeerId>,
    interval: Duration,
    last_sent: Option<Instant>,
}

impl SyncCoordinator {
    /// `rate_hz` is the bound update rate; zero disables outgoing updates.
    pub fn new(geometry: WorldGeometry, self_id: PeerId, rate_hz: u32) -> Self {
        let interval = if rate_hz == 0 {
            Duration::MAX
        } else {
            Duration::from_secs_f64(1.0 / f64::from(rate_hz))
        };
        Self {
            geometry,
            self_id,
            authorities: FxHashMap::default(),
            interval,
            last_sent: None,
        }
    }

    pub fn authority_of(&self, region: ChunkCoord) -> Option<PeerId> {
        self.authorities.get(&self.geometry.wrap(region)).copied()
    }

    /// Regions `peer` is authoritative for, sorted.
    pub fn regions_of(&self, peer: PeerId) -> Vec<ChunkCoord> {
        let mut regions: Vec<ChunkCoord> = self
            .authorities
            .iter()
            .filter(|(_, a)| **a == peer)
            .map(|(c, _)| *c)
            .collect();
        regions.sort();
        regions
    }

    pub fn is_local_authority(&self, region: ChunkCoord) -> bool {
        self.authority_of(region) == Some(self.self_id)
    }

    /// Every region with an authority, sorted.
    pub fn assignments(&self) -> Vec<RegionAuthority> {
        let mut out: Vec<RegionAuthority> = self
            .authorities
            .iter()
            .map(|(&region, &authority)| RegionAuthority { region, authority })
            .collect();
        out.sort_by_key(|a| a.region);
        out
    }

    // -----------------------------------------------------------------------
    // Host
    // -----------------------------------------------------------------------

    /// Recomputes authorities from the players' windows and returns the
    /// changes. The current authority keeps a region while the region is
    /// still in its window; otherwise the eligible player nearest to the
    /// region's center takes over, the host winning ties. Regions outside
    /// every window are dropped without a message.
    pub fn reassign(&mut self, peers: &PeerRegistry) -> Vec<RegionAuthority> {
        let mut regions: Vec<ChunkCoord> = peers
            .iter()
            .filter_map(|p| p.center)
            .flat_map(|center| self.geometry.window_around(center).into_iter().flatten())
            .filter(|c| self.geometry.contains_row(c.y))
            .map(|c| self.geometry.wrap(c))
            .collect();
        regions.sort();
        regions.dedup();

        self.authorities.retain(|c, _| regions.binary_search(c).is_ok());

        let mut changes = Vec::new();
        for region in regions {
            let current = self.authorities.get(&region).copied();
            let keeps = current
                .and_then(|id| peers.get(id))
                .is_some_and(|p| p.window_contains(&self.geometry, region));
            if keeps {
                continue;
            }
            let Some(winner) = self.nearest_eligible(peers, region) else {
                continue;
            };
            if current != Some(winner) {
                tracing::debug!(%region, authority = %winner, "region authority changed");
                self.authorities.insert(region, winner);
                changes.push(RegionAuthority {
                    region,
                    authority: winner,
                });
            }
        }
        changes
    }

    fn nearest_eligible(&self, peers: &PeerRegistry, region: ChunkCoord) -> Option<PeerId> {
        let half = self.geometry.chunk_world_size() / 2.0;
        let target = self.geometry.chunk_origin(region) + Vec2::splat(half);
        peers
            .iter()
            .filter(|p| p.window_contains(&self.geometry, region))
            .min_by(|a, b| {
                let da = self.geometry.distance(a.position, target);
                let db = self.geometry.distance(b.position, target);
                da.total_cmp(&db)
                    .then_with(|| host_first(a).cmp(&host_first(b)))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|p| p.id)
    }

    /// Drops every region `peer` held; the next [`reassign`](Self::reassign)
    /// hands them out again.
    pub fn forget_peer(&mut self, peer: PeerId) -> usize {
        let before = self.authorities.len();
        self.authorities.retain(|_, a| *a != peer);
        before - self.authorities.len()
    }

    /// Whether a bound update from `from` for an entity in `region` should be
    /// applied. Avatars (with `owner`) only move at their owner's word.
    pub fn accepts(&self, from: PeerId, region: ChunkCoord, owner: Option<PeerId>) -> bool {
        match owner {
            Some(owner) => owner == from,
            None => self.authority_of(region) == Some(from),
        }
    }

    // -----------------------------------------------------------------------
    // Both sides
    // -----------------------------------------------------------------------

    /// A region assignment from the host.
    pub fn apply(&mut self, assignment: RegionAuthority) {
        self.authorities
            .insert(self.geometry.wrap(assignment.region), assignment.authority);
    }

    /// Whether bound updates are due at `now`. Starts a new interval when
    /// they are.
    pub fn due(&mut self, now: Instant) -> bool {
        let due = self
            .last_sent
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last_sent = Some(now);
        }
        due
    }

    /// Bound updates for the entities this peer drives: its own avatar and
    /// the replicable entities in regions it is authoritative for. Entities
    /// for which `unconfirmed` holds are skipped until their id is final.
    pub fn outgoing_updates<P: PhysicsSink, U: LoadingUi>(
        &self,
        store: &ChunkStore<P, U>,
        unconfirmed: impl Fn(ObjectId) -> bool,
    ) -> Vec<EntityBoundUpdate> {
        let mut updates: Vec<EntityBoundUpdate> = store
            .entities()
            .filter(|e| e.is_replicable() && !unconfirmed(e.object_id))
            .filter(|e| match avatar_owner(e) {
                Some(owner) => PeerId(owner) == self.self_id,
                None => self.is_local_authority(self.geometry.chunk_of(e.position)),
            })
            .map(|e| {
                let mut out = ByteWriter::new();
                if let Some(replicable) = e.state().as_replicable() {
                    replicable.encode_state(&mut out);
                }
                EntityBoundUpdate {
                    object_id: e.object_id,
                    x: e.position.x,
                    y: e.position.y,
                    state: out.into_inner(),
                }
            })
            .collect();
        updates.sort_by_key(|u| u.object_id);
        updates
    }

    /// Applies a bound update to the local copy of the entity. An entity
    /// that moved out of the window is dropped; its new chunk carries it.
    /// Returns `false` if nothing was applied.
    pub fn apply_bound_update<P: PhysicsSink, U: LoadingUi>(
        &self,
        store: &mut ChunkStore<P, U>,
        update: &EntityBoundUpdate,
    ) -> bool {
        let id = update.object_id;
        let position = Vec2::new(update.x, update.y);
        if store.entity(id).is_none() {
            return false;
        }
        if !store.move_entity(id, position) {
            let target = self.geometry.chunk_of(position);
            let in_window = store.window_coords().iter().flatten().any(|c| *c == target);
            if !in_window {
                tracing::trace!(%id, %target, "entity left the window");
                store.remove_entity(id);
                return true;
            }
        }
        let Some(entity) = store.entity_mut(id) else {
            return false;
        };
        let Some(replicable) = entity.state_mut().as_replicable_mut() else {
            return false;
        };
        if let Err(e) = replicable.apply_state(&mut ByteReader::new(&update.state)) {
            tracing::warn!(%id, error = %e, "bound update state did not decode");
            return false;
        }
        true
    }
}

fn host_first(peer: &PeerInfo) -> bool {
    !peer.id.is_host()
}
