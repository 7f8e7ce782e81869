//! Answers clients' chunk requests on the host.
//!
//! Sources are tried freshest first:
//!
//! 1. the save buffer, for a save that has not reached disk;
//! 2. a remote player whose settled window holds the chunk, skipping the
//!    requester and anyone who already declined or was rejected;
//! 3. the host's own window, under the same dwell rule;
//! 4. disk, or fresh terrain when nothing is stored.
//!
//! Forwarded requests carry an id from the arbiter's own counter. When the
//! holder declines or disconnects, the request moves on to the next source.
//! Encoding and disk reads run on the worker pool and reply through the
//! [`Transport`], so the simulation thread never blocks here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use strata_net::{ChunkDeclined, ChunkRequest, ChunkResponse, Message, PeerId, Transport};
use strata_world::{
    ChunkContent, ChunkCoord, ChunkFiles, EncodeTarget, RequestId, TerrainGenerator, TileGrid,
    WorkerPool, WorldGeometry,
};

use crate::peers::PeerRegistry;

/// Where a request was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    SaveBuffer,
    Peer(PeerId),
    HostWindow,
    Disk,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub from_buffer: u64,
    pub forwarded: u64,
    pub from_peers: u64,
    pub from_host_window: u64,
    pub from_disk: u64,
    pub declines: u64,
    pub reroutes: u64,
}

/// Loaded chunks of the host's own window, by coordinate.
pub type HostChunks<'a> = &'a dyn Fn(ChunkCoord) -> Option<ChunkContent>;

#[derive(Debug, Clone)]
struct Routing {
    requester: PeerId,
    request_id: RequestId,
    coord: ChunkCoord,
    /// Peers that must not be asked.
    excluded: Vec<PeerId>,
}

#[derive(Debug)]
struct Forwarded {
    holder: PeerId,
    routing: Routing,
}

pub struct ChunkRequestArbiter {
    geometry: WorldGeometry,
    files: Arc<ChunkFiles>,
    pool: Arc<WorkerPool>,
    transport: Arc<dyn Transport>,
    generator: Option<Arc<dyn TerrainGenerator>>,
    seed: u64,
    min_dwell: Duration,
    next_forward_id: u64,
    forwarded: FxHashMap<RequestId, Forwarded>,
    stats: ArbiterStats,
}

impl ChunkRequestArbiter {
    pub fn new(
        files: Arc<ChunkFiles>,
        pool: Arc<WorkerPool>,
        transport: Arc<dyn Transport>,
        seed: u64,
        min_dwell: Duration,
    ) -> Self {
        Self {
            geometry: *files.serializer().geometry(),
            files,
            pool,
            transport,
            generator: None,
            seed,
            min_dwell,
            next_forward_id: 1,
            forwarded: FxHashMap::default(),
            stats: ArbiterStats::default(),
        }
    }

    /// Generate terrain for coordinates with nothing stored instead of
    /// serving air.
    pub fn with_generator(mut self, generator: Arc<dyn TerrainGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    /// Requests waiting on a remote holder.
    pub fn forwarded_count(&self) -> usize {
        self.forwarded.len()
    }

    /// Answers or forwards a request from `from`.
    pub fn handle_request(
        &mut self,
        from: PeerId,
        request: ChunkRequest,
        peers: &PeerRegistry,
        host_chunks: HostChunks<'_>,
        now: Instant,
    ) -> ChunkSource {
        if request.connection_id != from {
            tracing::warn!(
                %from,
                claimed = %request.connection_id,
                "chunk request names another connection; answering the sender"
            );
        }
        let mut excluded = vec![from];
        if let Some(rejected) = request.rejected_by {
            tracing::debug!(%from, %rejected, coord = %request.position, "resubmitted chunk request");
            excluded.push(rejected);
        }
        let routing = Routing {
            requester: from,
            request_id: request.request_id,
            coord: self.geometry.wrap(request.position),
            excluded,
        };
        self.route(routing, peers, host_chunks, now)
    }

    /// A holder answered a forwarded request. Returns `false` if the
    /// response matches nothing forwarded to `from`.
    pub fn handle_response(&mut self, from: PeerId, response: ChunkResponse) -> bool {
        let Some(entry) = self.take_forwarded(from, response.request_id) else {
            tracing::debug!(%from, id = %response.request_id, "unexpected chunk response");
            return false;
        };
        self.stats.from_peers += 1;
        respond(
            self.transport.as_ref(),
            entry.routing.requester,
            entry.routing.request_id,
            response.file_bytes,
        );
        true
    }

    /// A holder could not serve a forwarded request; try the next source.
    pub fn handle_declined(
        &mut self,
        from: PeerId,
        declined: ChunkDeclined,
        peers: &PeerRegistry,
        host_chunks: HostChunks<'_>,
        now: Instant,
    ) -> Option<ChunkSource> {
        let Some(entry) = self.take_forwarded(from, declined.request_id) else {
            tracing::debug!(%from, id = %declined.request_id, "unexpected chunk decline");
            return None;
        };
        self.stats.declines += 1;
        let mut routing = entry.routing;
        tracing::debug!(%from, coord = %routing.coord, "holder declined, rerouting");
        routing.excluded.push(from);
        Some(self.route(routing, peers, host_chunks, now))
    }

    /// `peer` disconnected. Requests it was holding are rerouted; requests
    /// it made are dropped. Returns the number rerouted.
    pub fn peer_left(
        &mut self,
        peer: PeerId,
        peers: &PeerRegistry,
        host_chunks: HostChunks<'_>,
        now: Instant,
    ) -> usize {
        let mut affected: Vec<RequestId> = self
            .forwarded
            .iter()
            .filter(|(_, f)| f.holder == peer || f.routing.requester == peer)
            .map(|(id, _)| *id)
            .collect();
        affected.sort();

        let mut rerouted = 0;
        for id in affected {
            let Some(entry) = self.forwarded.remove(&id) else {
                continue;
            };
            if entry.routing.requester == peer {
                continue;
            }
            let mut routing = entry.routing;
            routing.excluded.push(peer);
            self.stats.reroutes += 1;
            self.route(routing, peers, host_chunks, now);
            rerouted += 1;
        }
        if rerouted > 0 {
            tracing::info!(%peer, rerouted, "rerouted chunk requests held by departed peer");
        }
        rerouted
    }

    fn take_forwarded(&mut self, from: PeerId, id: RequestId) -> Option<Forwarded> {
        match self.forwarded.get(&id) {
            Some(entry) if entry.holder == from => self.forwarded.remove(&id),
            _ => None,
        }
    }

    fn route(
        &mut self,
        mut routing: Routing,
        peers: &PeerRegistry,
        host_chunks: HostChunks<'_>,
        now: Instant,
    ) -> ChunkSource {
        let coord = routing.coord;

        if let Some(bytes) = self.files.buffered(coord) {
            self.stats.from_buffer += 1;
            respond(
                self.transport.as_ref(),
                routing.requester,
                routing.request_id,
                bytes.as_ref().clone(),
            );
            return ChunkSource::SaveBuffer;
        }

        let holders =
            peers.remote_holders(&self.geometry, coord, self.min_dwell, now, &routing.excluded);
        for holder in holders {
            let id = RequestId(self.next_forward_id);
            self.next_forward_id += 1;
            let forward = ChunkRequest {
                connection_id: PeerId::HOST,
                position: coord,
                request_id: id,
                rejected_by: None,
            };
            match self.transport.send(holder, Message::ChunkRequest(forward)) {
                Ok(()) => {
                    tracing::debug!(requester = %routing.requester, %holder, %coord, "forwarded chunk request");
                    self.stats.forwarded += 1;
                    self.forwarded.insert(id, Forwarded { holder, routing });
                    return ChunkSource::Peer(holder);
                }
                Err(e) => {
                    tracing::warn!(%holder, %coord, error = %e, "could not forward chunk request");
                    routing.excluded.push(holder);
                }
            }
        }

        let host_settled = !routing.excluded.contains(&PeerId::HOST)
            && peers
                .get(PeerId::HOST)
                .is_some_and(|host| host.holds(&self.geometry, coord, self.min_dwell, now));
        if host_settled && let Some(content) = host_chunks(coord) {
            self.stats.from_host_window += 1;
            self.serve_content(&routing, content);
            return ChunkSource::HostWindow;
        }

        self.stats.from_disk += 1;
        self.serve_from_disk(&routing);
        ChunkSource::Disk
    }

    fn serve_content(&self, routing: &Routing, content: ChunkContent) {
        let transport = Arc::clone(&self.transport);
        let files = Arc::clone(&self.files);
        let (requester, request_id) = (routing.requester, routing.request_id);
        let job = move || match files.serializer().encode(&content, EncodeTarget::Wire) {
            Ok(bytes) => respond(transport.as_ref(), requester, request_id, bytes),
            Err(e) => {
                tracing::error!(coord = %content.coord, error = %e, "could not encode chunk for peer");
                decline(transport.as_ref(), requester, request_id);
            }
        };
        if let Err(e) = self.pool.submit(job) {
            tracing::warn!(coord = %routing.coord, error = %e, "could not schedule chunk encode");
            decline(self.transport.as_ref(), requester, request_id);
        }
    }

    fn serve_from_disk(&self, routing: &Routing) {
        let transport = Arc::clone(&self.transport);
        let files = Arc::clone(&self.files);
        let generator = self.generator.clone();
        let (seed, geometry) = (self.seed, self.geometry);
        let (requester, request_id, coord) = (routing.requester, routing.request_id, routing.coord);
        let job = move || {
            let bytes = match files.read_bytes(coord) {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => {
                    let tiles = match &generator {
                        Some(generator) => generator.generate(seed, coord, &geometry),
                        None => TileGrid::new_air(geometry.chunk_size),
                    };
                    let content = ChunkContent {
                        coord,
                        tiles,
                        entities: Vec::new(),
                    };
                    files
                        .serializer()
                        .encode(&content, EncodeTarget::Disk)
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };
            match bytes {
                Ok(bytes) => respond(transport.as_ref(), requester, request_id, bytes),
                Err(e) => {
                    tracing::error!(%coord, error = %e, "could not read chunk for peer");
                    decline(transport.as_ref(), requester, request_id);
                }
            }
        };
        if let Err(e) = self.pool.submit(job) {
            tracing::warn!(%coord, error = %e, "could not schedule chunk read");
            decline(self.transport.as_ref(), requester, request_id);
        }
    }
}

fn respond(transport: &dyn Transport, to: PeerId, request_id: RequestId, file_bytes: Vec<u8>) {
    let response = ChunkResponse {
        request_id,
        file_bytes,
    };
    if let Err(e) = transport.send(to, Message::ChunkResponse(response)) {
        tracing::warn!(peer = %to, id = %request_id, error = %e, "could not deliver chunk");
    }
}

fn decline(transport: &dyn Transport, to: PeerId, request_id: RequestId) {
    if let Err(e) = transport.send(to, Message::ChunkDeclined(ChunkDeclined { request_id })) {
        tracing::warn!(peer = %to, id = %request_id, error = %e, "could not decline chunk request");
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;
    use strata_net::QueueTransport;
    use strata_world::{
        ChunkDataProvider, ChunkSerializer, DebugMarker, EntityInstance, EntityRegistry,
        FetchOutcome, FileProvider, ObjectId, RetryPolicy, Torch, world_dir,
    };

    use super::*;

    const SEED: u64 = 0x5EED;
    const DWELL: Duration = Duration::from_secs(1);

    struct Fixture {
        _tmp: tempfile::TempDir,
        files: Arc<ChunkFiles>,
        pool: Arc<WorkerPool>,
        transport: Arc<QueueTransport>,
        arbiter: ChunkRequestArbiter,
        peers: PeerRegistry,
        t0: Instant,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let serializer = ChunkSerializer::new(
            WorldGeometry::new(4, 8.0, 16, 8),
            Arc::new(EntityRegistry::with_builtins()),
        );
        let files = Arc::new(ChunkFiles::open(world_dir(tmp.path(), SEED), serializer).unwrap());
        let pool = Arc::new(WorkerPool::new(2, 32).unwrap());
        let transport = Arc::new(QueueTransport::new());
        let arbiter = ChunkRequestArbiter::new(
            Arc::clone(&files),
            Arc::clone(&pool),
            transport.clone(),
            SEED,
            DWELL,
        );
        let t0 = Instant::now();
        let mut peers = PeerRegistry::new();
        for (id, name) in [(0, "host"), (1, "ada"), (2, "bea"), (3, "cy")] {
            peers.join(PeerId(id), name, t0);
        }
        Fixture {
            _tmp: tmp,
            files,
            pool,
            transport,
            arbiter,
            peers,
            t0,
        }
    }

    impl Fixture {
        fn settle(&mut self, peer: u64, center: ChunkCoord) {
            self.peers.update_focus(PeerId(peer), center, Vec2::ZERO, self.t0);
        }

        fn later(&self) -> Instant {
            self.t0 + DWELL * 2
        }

        fn request(&mut self, from: u64, coord: ChunkCoord, id: u64, rejected: Option<u64>) -> ChunkSource {
            let request = ChunkRequest {
                connection_id: PeerId(from),
                position: coord,
                request_id: RequestId(id),
                rejected_by: rejected.map(PeerId),
            };
            let now = self.later();
            self.arbiter
                .handle_request(PeerId(from), request, &self.peers, &no_host_chunks, now)
        }

        /// Waits for pool jobs to reply.
        fn sent(&self, count: usize) -> Vec<(PeerId, Message)> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.transport.pending_count() < count && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
            self.transport.take()
        }

        fn store_chunk(&self, content: &ChunkContent) -> Vec<u8> {
            let bytes = self.files.serializer().encode(content, EncodeTarget::Disk).unwrap();
            let staged = self.files.stage(content.coord, bytes.clone());
            self.files.write_staged(content.coord, &staged).unwrap();
            bytes
        }
    }

    fn no_host_chunks(_: ChunkCoord) -> Option<ChunkContent> {
        None
    }

    fn response_bytes(message: &Message, id: u64) -> Vec<u8> {
        match message {
            Message::ChunkResponse(r) if r.request_id == RequestId(id) => r.file_bytes.clone(),
            other => panic!("expected response {id}, got {other:?}"),
        }
    }

    fn forwarded_id(message: &Message) -> RequestId {
        match message {
            Message::ChunkRequest(r) => {
                assert_eq!(r.connection_id, PeerId::HOST);
                r.request_id
            }
            other => panic!("expected forwarded request, got {other:?}"),
        }
    }

    fn sample(f: &Fixture, coord: ChunkCoord) -> ChunkContent {
        let g = f.files.serializer().geometry();
        let mut content = ChunkContent::air(coord, g.chunk_size);
        let origin = g.chunk_origin(coord);
        content.entities.push(EntityInstance::new(
            ObjectId(3),
            origin + Vec2::new(4.0, 4.0),
            Box::new(Torch { lit: true }),
        ));
        content.entities.push(EntityInstance::new(
            ObjectId(4),
            origin + Vec2::new(12.0, 4.0),
            Box::new(DebugMarker { label: "x".into() }),
        ));
        content
    }

    #[test]
    fn test_disk_bytes_served_verbatim() {
        let mut f = fixture();
        let coord = ChunkCoord::new(0, 0);
        f.store_chunk(&sample(&f, coord));
        // Just arrived: not asked.
        f.peers
            .update_focus(PeerId(2), coord, Vec2::ZERO, f.later());

        assert_eq!(f.request(1, coord, 7, None), ChunkSource::Disk);
        let sent = f.sent(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PeerId(1));
        let bytes = response_bytes(&sent[0].1, 7);
        assert_eq!(Some(bytes.clone()), f.files.read_disk(coord).unwrap());

        let local = FileProvider::new(Arc::clone(&f.files), Arc::clone(&f.pool), RetryPolicy::immediate(1), SEED);
        match local.fetch(coord).wait(Duration::from_secs(5)) {
            Some(FetchOutcome::Ready { content, .. }) => {
                assert_eq!(content, f.files.serializer().decode(&bytes).unwrap());
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_save_buffer_wins_over_holders() {
        let mut f = fixture();
        let coord = ChunkCoord::new(2, 2);
        f.settle(2, coord);
        let bytes = f
            .files
            .serializer()
            .encode(&sample(&f, coord), EncodeTarget::Disk)
            .unwrap();
        f.files.stage(coord, bytes.clone());

        assert_eq!(f.request(1, coord, 1, None), ChunkSource::SaveBuffer);
        let sent = f.transport.take();
        assert_eq!(response_bytes(&sent[0].1, 1), bytes);
        assert_eq!(f.arbiter.stats().from_buffer, 1);
    }

    #[test]
    fn test_settled_holder_gets_forwarded_request() {
        let mut f = fixture();
        f.settle(2, ChunkCoord::new(0, 2));

        assert_eq!(f.request(1, ChunkCoord::new(1, 3), 9, None), ChunkSource::Peer(PeerId(2)));
        let sent = f.transport.take();
        assert_eq!(sent[0].0, PeerId(2));
        let forward = forwarded_id(&sent[0].1);
        assert_eq!(f.arbiter.forwarded_count(), 1);

        // Only the holder may answer.
        let stray = ChunkResponse {
            request_id: forward,
            file_bytes: vec![1],
        };
        assert!(!f.arbiter.handle_response(PeerId(3), stray));

        let answer = ChunkResponse {
            request_id: forward,
            file_bytes: vec![4, 2],
        };
        assert!(f.arbiter.handle_response(PeerId(2), answer));
        let sent = f.transport.take();
        assert_eq!(sent[0].0, PeerId(1));
        assert_eq!(response_bytes(&sent[0].1, 9), vec![4, 2]);
        assert_eq!(f.arbiter.forwarded_count(), 0);
    }

    #[test]
    fn test_requester_and_rejected_peer_are_skipped() {
        let mut f = fixture();
        let coord = ChunkCoord::new(5, 3);
        f.settle(1, coord);
        f.settle(2, coord);

        assert_eq!(f.request(1, coord, 2, Some(2)), ChunkSource::Disk);
        let sent = f.sent(1);
        let content = f
            .files
            .serializer()
            .decode(&response_bytes(&sent[0].1, 2))
            .unwrap();
        assert_eq!(content, ChunkContent::air(coord, 4));
    }

    #[test]
    fn test_decline_moves_to_next_source() {
        let mut f = fixture();
        let coord = ChunkCoord::new(3, 3);
        f.settle(0, coord);
        f.settle(2, coord);
        f.settle(3, coord);
        f.transport.set_unreachable(PeerId(2), true);

        // Peer 2 cannot be reached, so peer 3 is asked.
        assert_eq!(f.request(1, coord, 5, None), ChunkSource::Peer(PeerId(3)));
        let sent = f.transport.take();
        assert_eq!(sent.len(), 1);
        let forward = forwarded_id(&sent[0].1);

        let host_copy = sample(&f, coord);
        let host_chunks = |c: ChunkCoord| (c == coord).then(|| host_copy.clone());
        let now = f.later();
        let source = f.arbiter.handle_declined(
            PeerId(3),
            ChunkDeclined { request_id: forward },
            &f.peers,
            &host_chunks,
            now,
        );
        assert_eq!(source, Some(ChunkSource::HostWindow));

        let sent = f.sent(1);
        let served = f
            .files
            .serializer()
            .decode(&response_bytes(&sent[0].1, 5))
            .unwrap();
        // Local-only entities stay on the host.
        assert_eq!(served.entities.len(), 1);
        assert_eq!(served.entities[0].object_id, ObjectId(3));
        assert_eq!(f.arbiter.stats().declines, 1);
    }

    #[test]
    fn test_departed_holder_request_is_rerouted() {
        let mut f = fixture();
        let coord = ChunkCoord::new(6, 1);
        f.settle(2, coord);
        assert_eq!(f.request(1, coord, 11, None), ChunkSource::Peer(PeerId(2)));
        f.transport.take();

        f.peers.leave(PeerId(2));
        let now = f.later();
        assert_eq!(f.arbiter.peer_left(PeerId(2), &f.peers, &no_host_chunks, now), 1);
        let sent = f.sent(1);
        assert_eq!(sent[0].0, PeerId(1));
        response_bytes(&sent[0].1, 11);
        assert_eq!(f.arbiter.stats().reroutes, 1);
    }

    #[test]
    fn test_departed_requester_drops_forward() {
        let mut f = fixture();
        let coord = ChunkCoord::new(6, 1);
        f.settle(2, coord);
        f.request(1, coord, 11, None);
        f.transport.take();

        f.peers.leave(PeerId(1));
        let now = f.later();
        assert_eq!(f.arbiter.peer_left(PeerId(1), &f.peers, &no_host_chunks, now), 0);
        assert_eq!(f.arbiter.forwarded_count(), 0);
        assert!(f.transport.take().is_empty());
    }

    #[test]
    fn test_missing_chunk_is_generated_when_configured() {
        let mut f = fixture();
        f.arbiter = ChunkRequestArbiter::new(
            Arc::clone(&f.files),
            Arc::clone(&f.pool),
            f.transport.clone(),
            SEED,
            DWELL,
        )
        .with_generator(Arc::new(strata_world::FlatTerrain { surface_tile: 2 }));
        let coord = ChunkCoord::new(1, 0);
        f.request(1, coord, 3, None);
        let sent = f.sent(1);
        let content = f
            .files
            .serializer()
            .decode(&response_bytes(&sent[0].1, 3))
            .unwrap();
        assert!(!content.tiles.is_all_air());
        // Generated chunks are not written back by the host.
        assert!(!f.files.path_for(coord).exists());
    }
}
