//! Connected players and where their windows are.
//!
//! The host keeps one [`PeerInfo`] per player, itself included under
//! [`PeerId::HOST`]. Focus updates move a player's window; the time spent on
//! the current center chunk (the dwell) decides whether the player can be
//! asked for chunk data.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use glam::Vec2;
use strata_net::PeerId;
use strata_world::{ChunkCoord, WorldGeometry};

/// One connected player as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    /// Center of the player's window, once reported.
    pub center: Option<ChunkCoord>,
    /// Last reported focus position in world space.
    pub position: Vec2,
    /// When the player arrived on `center`.
    pub center_since: Instant,
}

impl PeerInfo {
    /// Time spent on the current center chunk. Zero before the first focus
    /// update.
    pub fn dwell(&self, now: Instant) -> Duration {
        match self.center {
            Some(_) => now.saturating_duration_since(self.center_since),
            None => Duration::ZERO,
        }
    }

    pub fn window_contains(&self, geometry: &WorldGeometry, coord: ChunkCoord) -> bool {
        self.center
            .is_some_and(|center| geometry.window_contains(center, geometry.wrap(coord)))
    }

    /// Whether the player holds `coord` in a window it has settled into.
    pub fn holds(
        &self,
        geometry: &WorldGeometry,
        coord: ChunkCoord,
        min_dwell: Duration,
        now: Instant,
    ) -> bool {
        self.window_contains(geometry, coord) && self.dwell(now) >= min_dwell
    }
}

/// Connected players, iterated in id order.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerInfo>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player. Returns `false` if the id is already registered, in
    /// which case nothing changes.
    pub fn join(&mut self, id: PeerId, name: impl Into<String>, now: Instant) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(
            id,
            PeerInfo {
                id,
                name: name.into(),
                center: None,
                position: Vec2::ZERO,
                center_since: now,
            },
        );
        true
    }

    pub fn leave(&mut self, id: PeerId) -> Option<PeerInfo> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    /// Every connected player other than the host.
    pub fn remote_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().filter(|id| !id.is_host()).collect()
    }

    /// Remote players except `except`.
    pub fn remote_ids_except(&self, except: PeerId) -> Vec<PeerId> {
        self.peers
            .keys()
            .copied()
            .filter(|&id| !id.is_host() && id != except)
            .collect()
    }

    /// `(id, name)` of every player, host included.
    pub fn roster(&self) -> Vec<(PeerId, String)> {
        self.peers.values().map(|p| (p.id, p.name.clone())).collect()
    }

    /// Records a focus update. The dwell clock restarts only when the center
    /// chunk changes. Returns `false` for unknown players.
    pub fn update_focus(
        &mut self,
        id: PeerId,
        center: ChunkCoord,
        position: Vec2,
        now: Instant,
    ) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        if peer.center != Some(center) {
            tracing::trace!(peer = %id, %center, "peer changed center chunk");
            peer.center = Some(center);
            peer.center_since = now;
        }
        peer.position = position;
        true
    }

    /// Remote players holding `coord` in a settled window, in id order,
    /// skipping `exclude`.
    pub fn remote_holders(
        &self,
        geometry: &WorldGeometry,
        coord: ChunkCoord,
        min_dwell: Duration,
        now: Instant,
        exclude: &[PeerId],
    ) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| !p.id.is_host() && !exclude.contains(&p.id))
            .filter(|p| p.holds(geometry, coord, min_dwell, now))
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> WorldGeometry {
        WorldGeometry::new(4, 8.0, 16, 8)
    }

    #[test]
    fn test_join_is_idempotent() {
        let now = Instant::now();
        let mut peers = PeerRegistry::new();
        assert!(peers.join(PeerId(1), "ada", now));
        assert!(!peers.join(PeerId(1), "bob", now));
        assert_eq!(peers.get(PeerId(1)).unwrap().name, "ada");
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_dwell_restarts_only_on_center_change() {
        let t0 = Instant::now();
        let mut peers = PeerRegistry::new();
        peers.join(PeerId(1), "ada", t0);
        assert_eq!(peers.get(PeerId(1)).unwrap().dwell(t0), Duration::ZERO);

        peers.update_focus(PeerId(1), ChunkCoord::new(2, 2), Vec2::new(70.0, 70.0), t0);
        let t1 = t0 + Duration::from_secs(2);
        peers.update_focus(PeerId(1), ChunkCoord::new(2, 2), Vec2::new(75.0, 70.0), t1);
        assert_eq!(peers.get(PeerId(1)).unwrap().dwell(t1), Duration::from_secs(2));

        peers.update_focus(PeerId(1), ChunkCoord::new(3, 2), Vec2::new(100.0, 70.0), t1);
        assert_eq!(peers.get(PeerId(1)).unwrap().dwell(t1), Duration::ZERO);
    }

    #[test]
    fn test_holders_need_window_and_dwell() {
        let g = geometry();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(5);
        let mut peers = PeerRegistry::new();
        peers.join(PeerId::HOST, "host", t0);
        peers.join(PeerId(1), "settled", t0);
        peers.join(PeerId(2), "fresh", t0);
        peers.join(PeerId(3), "far", t0);
        peers.update_focus(PeerId::HOST, ChunkCoord::new(0, 2), Vec2::ZERO, t0);
        peers.update_focus(PeerId(1), ChunkCoord::new(0, 2), Vec2::ZERO, t0);
        peers.update_focus(PeerId(2), ChunkCoord::new(1, 2), Vec2::ZERO, later);
        peers.update_focus(PeerId(3), ChunkCoord::new(8, 2), Vec2::ZERO, t0);

        let min = Duration::from_secs(1);
        // (15, 3) is in the window around (0, 2) across the seam.
        let holders = peers.remote_holders(&g, ChunkCoord::new(15, 3), min, later, &[]);
        assert_eq!(holders, vec![PeerId(1)]);
        let holders = peers.remote_holders(&g, ChunkCoord::new(0, 2), min, later, &[PeerId(1)]);
        assert!(holders.is_empty());
    }

    #[test]
    fn test_remote_ids_skip_host() {
        let now = Instant::now();
        let mut peers = PeerRegistry::new();
        peers.join(PeerId::HOST, "host", now);
        peers.join(PeerId(2), "b", now);
        peers.join(PeerId(1), "a", now);
        assert_eq!(peers.remote_ids(), vec![PeerId(1), PeerId(2)]);
        assert_eq!(peers.remote_ids_except(PeerId(1)), vec![PeerId(2)]);
        assert_eq!(peers.roster().len(), 3);
    }
}
