//! Chunk data providers for networked sessions.

use std::sync::Arc;

use strata_net::{
    ChunkDeclined, ChunkRequest, ChunkResponse, ChunkSave, Message, PeerId, Transport,
};
use strata_world::{
    ChunkContent, ChunkCoord, ChunkDataProvider, ChunkSerializer, EncodeTarget, FetchHandle,
    FetchOutcome, FileProvider, PendingRequestRegistry, PersistHandle, PersistOutcome, RequestId,
    Resolution, WorkerPool,
};

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Fetches chunks from the host and sends evicted chunks back to it.
///
/// Each fetch sends a [`ChunkRequest`] under a fresh id from the pending
/// registry. The session hands the matching [`ChunkResponse`] to
/// [`on_response`](Self::on_response) from the simulation thread; decoding
/// then runs on the worker pool. A declined request completes as a retry.
pub struct NetworkClientProvider {
    self_id: PeerId,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequestRegistry<Option<Vec<u8>>>>,
    serializer: Arc<ChunkSerializer>,
    pool: Arc<WorkerPool>,
}

impl NetworkClientProvider {
    pub fn new(
        self_id: PeerId,
        transport: Arc<dyn Transport>,
        serializer: Arc<ChunkSerializer>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            self_id,
            transport,
            pending: Arc::new(PendingRequestRegistry::new()),
            serializer,
            pool,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn serializer(&self) -> &Arc<ChunkSerializer> {
        &self.serializer
    }

    /// Requests still waiting for an answer.
    pub fn outstanding(&self) -> Vec<(RequestId, ChunkCoord)> {
        self.pending.outstanding()
    }

    pub fn on_response(&self, response: ChunkResponse) -> Resolution {
        self.pending.resolve(response.request_id, Some(response.file_bytes))
    }

    pub fn on_declined(&self, declined: ChunkDeclined) -> Resolution {
        self.pending.resolve(declined.request_id, None)
    }

    /// Completes every outstanding fetch as a retry, e.g. after the host
    /// connection is lost. Returns how many were failed.
    pub fn fail_outstanding(&self) -> usize {
        let drained = self.pending.drain();
        let count = drained.len();
        for (_, _, callback) in drained {
            callback(None);
        }
        self.pending.purge_cancelled();
        count
    }

    /// Answers a request the host forwarded to this client. `content` is
    /// the loaded chunk, or `None` if it is not loaded here anymore.
    pub fn answer_forwarded(&self, request: ChunkRequest, content: Option<ChunkContent>) {
        let request_id = request.request_id;
        let Some(content) = content else {
            tracing::debug!(coord = %request.position, "declining forwarded request");
            decline(self.transport.as_ref(), request_id);
            return;
        };
        let serializer = Arc::clone(&self.serializer);
        let transport = Arc::clone(&self.transport);
        let job = move || match serializer.encode(&content, EncodeTarget::Wire) {
            Ok(file_bytes) => {
                let response = ChunkResponse {
                    request_id,
                    file_bytes,
                };
                if let Err(e) = transport.send(PeerId::HOST, Message::ChunkResponse(response)) {
                    tracing::warn!(error = %e, "could not answer forwarded request");
                }
            }
            Err(e) => {
                tracing::error!(coord = %content.coord, error = %e, "could not encode chunk for host");
                decline(transport.as_ref(), request_id);
            }
        };
        if let Err(e) = self.pool.submit(job) {
            tracing::warn!(coord = %request.position, error = %e, "could not schedule chunk encode");
            decline(self.transport.as_ref(), request_id);
        }
    }
}

fn decline(transport: &dyn Transport, request_id: RequestId) {
    if let Err(e) = transport.send(PeerId::HOST, Message::ChunkDeclined(ChunkDeclined { request_id })) {
        tracing::warn!(error = %e, "could not decline forwarded request");
    }
}

/// Decodes a received chunk. Local-only entities never belong to a received
/// chunk, even if the sender included them.
fn decode_received(serializer: &ChunkSerializer, coord: ChunkCoord, bytes: &[u8]) -> FetchOutcome {
    match serializer.decode(bytes) {
        Ok(mut content) if content.coord == coord => {
            content.entities.retain(|e| e.is_replicable() && !e.is_transient());
            FetchOutcome::ready(content)
        }
        Ok(content) => FetchOutcome::Retry {
            reason: format!("response for {coord} carried {}", content.coord),
        },
        Err(e) => FetchOutcome::Retry {
            reason: format!("received chunk {coord} did not decode: {e}"),
        },
    }
}

impl ChunkDataProvider for NetworkClientProvider {
    fn fetch(&self, coord: ChunkCoord) -> FetchHandle {
        let coord = self.serializer.geometry().wrap(coord);
        let (completer, handle) = FetchHandle::pair(coord);
        let serializer = Arc::clone(&self.serializer);
        let pool = Arc::clone(&self.pool);

        let id = self.pending.issue(coord, move |payload: Option<Vec<u8>>| {
            let Some(bytes) = payload else {
                completer.complete(FetchOutcome::Retry {
                    reason: format!("no source could serve {coord}"),
                });
                return;
            };
            let token = completer.token().clone();
            let job = move || {
                let outcome = decode_received(&serializer, coord, &bytes);
                completer.complete(outcome);
            };
            // A dropped completer reads as a retry on the simulation side.
            if let Err(e) = pool.submit_cancellable(token, job) {
                tracing::warn!(%coord, error = %e, "could not schedule chunk decode");
            }
        });

        let request = ChunkRequest {
            connection_id: self.self_id,
            position: coord,
            request_id: id,
            rejected_by: None,
        };
        if let Err(e) = self.transport.send(PeerId::HOST, Message::ChunkRequest(request)) {
            tracing::warn!(%coord, error = %e, "could not send chunk request");
            self.pending.resolve(id, None);
        }

        let pending = Arc::clone(&self.pending);
        handle.with_cancel_hook(move || {
            pending.cancel(id);
        })
    }

    /// Encoded on the calling thread so the save is queued ahead of any later
    /// request for the same chunk.
    fn persist(&self, content: ChunkContent) -> PersistHandle {
        let coord = content.coord;
        let chunk_data = match self.serializer.encode(&content, EncodeTarget::Disk) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(%coord, error = %e, "could not encode chunk save");
                return PersistHandle::done(PersistOutcome::Failed(e.to_string()));
            }
        };
        let save = ChunkSave {
            connection_id: self.self_id,
            position: coord,
            chunk_data,
        };
        match self.transport.send(PeerId::HOST, Message::ChunkSave(save)) {
            Ok(()) => PersistHandle::done(PersistOutcome::Sent),
            Err(e) => {
                tracing::warn!(%coord, error = %e, "chunk save not sent");
                PersistHandle::done(PersistOutcome::Failed(e.to_string()))
            }
        }
    }

    /// The host keeps the stored copy.
    fn owns_storage(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// The host's provider: its own fetches and saves go straight to disk
/// without a network round trip. Saves sent by clients land here too.
/// Requests from clients are routed by the
/// [`ChunkRequestArbiter`](crate::arbiter::ChunkRequestArbiter).
pub struct NetworkHostProvider {
    local: FileProvider,
}

impl NetworkHostProvider {
    pub fn new(local: FileProvider) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &FileProvider {
        &self.local
    }

    /// Persists a client's save. The bytes are readable from the save buffer
    /// immediately and written once validated.
    pub fn persist_remote(&self, from: PeerId, save: ChunkSave) -> PersistHandle {
        if save.connection_id != from {
            tracing::warn!(%from, claimed = %save.connection_id, "chunk save names another connection");
        }
        tracing::debug!(%from, coord = %save.position, bytes = save.chunk_data.len(), "chunk save from peer");
        self.local.persist_encoded(save.position, save.chunk_data)
    }
}

impl ChunkDataProvider for NetworkHostProvider {
    fn fetch(&self, coord: ChunkCoord) -> FetchHandle {
        self.local.fetch(coord)
    }

    fn persist(&self, content: ChunkContent) -> PersistHandle {
        self.local.persist(content)
    }

    fn flush(&self) {
        self.local.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::Vec2;
    use strata_net::QueueTransport;
    use strata_world::{
        ChunkFiles, DebugMarker, EntityInstance, EntityRegistry, ObjectId, RetryPolicy, Torch,
        WorldGeometry, world_dir,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn serializer() -> Arc<ChunkSerializer> {
        Arc::new(ChunkSerializer::new(
            WorldGeometry::new(4, 8.0, 16, 8),
            Arc::new(EntityRegistry::with_builtins()),
        ))
    }

    fn client() -> (NetworkClientProvider, Arc<QueueTransport>) {
        let transport = Arc::new(QueueTransport::new());
        let pool = Arc::new(WorkerPool::new(2, 32).unwrap());
        let provider = NetworkClientProvider::new(PeerId(3), transport.clone(), serializer(), pool);
        (provider, transport)
    }

    fn sent_request(transport: &QueueTransport) -> ChunkRequest {
        match transport.take().pop() {
            Some((PeerId::HOST, Message::ChunkRequest(request))) => request,
            other => panic!("expected a chunk request to the host, got {other:?}"),
        }
    }

    fn with_entities(coord: ChunkCoord) -> ChunkContent {
        let s = serializer();
        let origin = s.geometry().chunk_origin(coord);
        let mut content = ChunkContent::air(coord, 4);
        content.entities.push(EntityInstance::new(
            ObjectId(1),
            origin + Vec2::new(3.0, 3.0),
            Box::new(Torch { lit: false }),
        ));
        content.entities.push(EntityInstance::new(
            ObjectId(2),
            origin + Vec2::new(5.0, 3.0),
            Box::new(DebugMarker { label: "mine".into() }),
        ));
        content
    }

    #[test]
    fn test_fetch_sends_request_and_decodes_response() {
        let (provider, transport) = client();
        let coord = ChunkCoord::new(17, 2);
        let handle = provider.fetch(coord);
        let request = sent_request(&transport);
        assert_eq!(request.connection_id, PeerId(3));
        assert_eq!(request.position, ChunkCoord::new(1, 2));

        let content = with_entities(ChunkCoord::new(1, 2));
        let bytes = provider.serializer().encode(&content, EncodeTarget::Disk).unwrap();
        assert_eq!(
            provider.on_response(ChunkResponse {
                request_id: request.request_id,
                file_bytes: bytes,
            }),
            Resolution::Completed
        );
        match handle.wait(WAIT) {
            Some(FetchOutcome::Ready { content, generated }) => {
                assert!(!generated);
                assert_eq!(content.entities.len(), 1);
                assert_eq!(content.entities[0].object_id, ObjectId(1));
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_requests_resolve_independently() {
        let (provider, transport) = client();
        let a = provider.fetch(ChunkCoord::new(0, 0));
        let first = sent_request(&transport);
        let b = provider.fetch(ChunkCoord::new(0, 0));
        let second = sent_request(&transport);
        assert_ne!(first.request_id, second.request_id);

        let bytes = provider
            .serializer()
            .encode(&ChunkContent::air(ChunkCoord::new(0, 0), 4), EncodeTarget::Wire)
            .unwrap();
        provider.on_response(ChunkResponse {
            request_id: second.request_id,
            file_bytes: bytes,
        });
        assert!(matches!(b.wait(WAIT), Some(FetchOutcome::Ready { .. })));
        assert!(a.poll().is_none());
        assert_eq!(provider.outstanding(), vec![(first.request_id, ChunkCoord::new(0, 0))]);
    }

    #[test]
    fn test_decline_and_garbage_read_as_retry() {
        let (provider, transport) = client();
        let declined = provider.fetch(ChunkCoord::new(1, 1));
        let request = sent_request(&transport);
        provider.on_declined(ChunkDeclined {
            request_id: request.request_id,
        });
        assert!(matches!(declined.wait(WAIT), Some(FetchOutcome::Retry { .. })));

        let garbled = provider.fetch(ChunkCoord::new(1, 1));
        let request = sent_request(&transport);
        provider.on_response(ChunkResponse {
            request_id: request.request_id,
            file_bytes: vec![0xde, 0xad],
        });
        assert!(matches!(garbled.wait(WAIT), Some(FetchOutcome::Retry { .. })));
    }

    #[test]
    fn test_response_for_other_coordinate_is_retried() {
        let (provider, transport) = client();
        let handle = provider.fetch(ChunkCoord::new(2, 2));
        let request = sent_request(&transport);
        let bytes = provider
            .serializer()
            .encode(&ChunkContent::air(ChunkCoord::new(3, 2), 4), EncodeTarget::Wire)
            .unwrap();
        provider.on_response(ChunkResponse {
            request_id: request.request_id,
            file_bytes: bytes,
        });
        assert!(matches!(handle.wait(WAIT), Some(FetchOutcome::Retry { .. })));
    }

    #[test]
    fn test_cancelled_fetch_ignores_late_response() {
        let (provider, transport) = client();
        let handle = provider.fetch(ChunkCoord::new(0, 1));
        let request = sent_request(&transport);
        handle.cancel();
        let bytes = provider
            .serializer()
            .encode(&ChunkContent::air(ChunkCoord::new(0, 1), 4), EncodeTarget::Wire)
            .unwrap();
        assert_eq!(
            provider.on_response(ChunkResponse {
                request_id: request.request_id,
                file_bytes: bytes,
            }),
            Resolution::Cancelled
        );
    }

    #[test]
    fn test_unsendable_request_retries_at_once() {
        let (provider, transport) = client();
        transport.set_unreachable(PeerId::HOST, true);
        let handle = provider.fetch(ChunkCoord::new(0, 0));
        assert!(matches!(handle.wait(WAIT), Some(FetchOutcome::Retry { .. })));
        assert!(provider.outstanding().is_empty());
    }

    #[test]
    fn test_fail_outstanding_completes_everything() {
        let (provider, _transport) = client();
        let a = provider.fetch(ChunkCoord::new(0, 0));
        let b = provider.fetch(ChunkCoord::new(1, 0));
        assert_eq!(provider.fail_outstanding(), 2);
        assert!(matches!(a.wait(WAIT), Some(FetchOutcome::Retry { .. })));
        assert!(matches!(b.wait(WAIT), Some(FetchOutcome::Retry { .. })));
    }

    #[test]
    fn test_persist_sends_save_to_host() {
        let (provider, transport) = client();
        let content = with_entities(ChunkCoord::new(4, 4));
        let handle = provider.persist(content.clone());
        assert_eq!(handle.poll(), Some(PersistOutcome::Sent));
        match transport.take().pop() {
            Some((PeerId::HOST, Message::ChunkSave(save))) => {
                assert_eq!(save.connection_id, PeerId(3));
                assert_eq!(save.position, ChunkCoord::new(4, 4));
                assert_eq!(provider.serializer().decode(&save.chunk_data).unwrap(), content);
            }
            other => panic!("expected a chunk save, got {other:?}"),
        }
    }

    #[test]
    fn test_forwarded_request_answered_or_declined() {
        let (provider, transport) = client();
        let request = ChunkRequest {
            connection_id: PeerId::HOST,
            position: ChunkCoord::new(4, 4),
            request_id: RequestId(70),
            rejected_by: None,
        };
        provider.answer_forwarded(request, None);
        assert_eq!(
            transport.take(),
            vec![(
                PeerId::HOST,
                Message::ChunkDeclined(ChunkDeclined {
                    request_id: RequestId(70)
                })
            )]
        );

        provider.answer_forwarded(request, Some(with_entities(ChunkCoord::new(4, 4))));
        let deadline = std::time::Instant::now() + WAIT;
        while transport.pending_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        match transport.take().pop() {
            Some((PeerId::HOST, Message::ChunkResponse(response))) => {
                assert_eq!(response.request_id, RequestId(70));
                let decoded = provider.serializer().decode(&response.file_bytes).unwrap();
                assert_eq!(decoded.entities.len(), 1);
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn test_host_provider_persists_remote_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let s = serializer();
        let files = Arc::new(
            ChunkFiles::open(world_dir(tmp.path(), 1), ChunkSerializer::clone(&s)).unwrap(),
        );
        let pool = Arc::new(WorkerPool::new(1, 8).unwrap());
        let host = NetworkHostProvider::new(FileProvider::new(
            Arc::clone(&files),
            pool,
            RetryPolicy::immediate(1),
            1,
        ));
        let coord = ChunkCoord::new(2, 1);
        let chunk_data = s.encode(&ChunkContent::air(coord, 4), EncodeTarget::Disk).unwrap();
        let handle = host.persist_remote(
            PeerId(2),
            ChunkSave {
                connection_id: PeerId(2),
                position: coord,
                chunk_data: chunk_data.clone(),
            },
        );
        assert_eq!(handle.wait(WAIT), Some(PersistOutcome::Saved));
        assert_eq!(files.read_disk(coord).unwrap(), Some(chunk_data));
        assert!(matches!(host.fetch(coord).wait(WAIT), Some(FetchOutcome::Ready { .. })));
        assert!(host.owns_storage());
    }

    #[test]
    fn test_client_provider_is_shared_and_not_storage_owner() {
        fn shared(_: Arc<dyn ChunkDataProvider>) {}
        let (provider, _transport) = client();
        assert!(!provider.owns_storage());
        let provider = Arc::new(provider);
        let fetcher = {
            let provider = Arc::clone(&provider);
            std::thread::spawn(move || provider.fetch(ChunkCoord::new(1, 1)))
        };
        let handle = fetcher.join().unwrap();
        assert_eq!(provider.outstanding().len(), 1);
        handle.cancel();
        shared(provider);
    }
}
