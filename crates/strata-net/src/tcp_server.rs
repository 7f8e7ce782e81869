//! Host-side TCP server.
//!
//! One accept loop plus two tasks per connection: a reader that turns frames
//! into [`NetEvent`]s and a writer that drains the connection's outbound
//! queue. Keepalive pings are answered by the reader directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use strata_config::NetworkConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::compression::CompressionConfig;
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::messages::{Message, PeerId, decode_packet, encode_packet};
use crate::routing::NetEvent;
use crate::transport::{SendError, Transport};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to listen on.
    pub bind_addr: String,
    /// Remote clients accepted at once; the host itself does not count.
    pub max_connections: usize,
    pub frame: FrameConfig,
    pub compression: CompressionConfig,
    /// Packets queued per connection before sends fail with `QueueFull`.
    pub outbound_capacity: usize,
    /// A connection silent for this long is dropped.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7777".to_string(),
            max_connections: 7,
            frame: FrameConfig::default(),
            compression: CompressionConfig::default(),
            outbound_capacity: 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: format!("{}:{}", network.server_address, network.server_port),
            max_connections: (network.max_players.saturating_sub(1) as usize).max(1),
            frame: FrameConfig::from_config(network),
            compression: CompressionConfig::from_config(network),
            idle_timeout: Duration::from_secs(u64::from(network.timeout_seconds.max(1))),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Outbound queues of live connections. Removing an entry closes the
/// connection's writer once its queue is drained.
#[derive(Clone, Default)]
pub struct ConnectionMap {
    inner: Arc<DashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
}

impl ConnectionMap {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.inner.contains_key(&peer)
    }

    /// Connected peers in id order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.iter().map(|e| *e.key()).collect();
        peers.sort();
        peers
    }

    fn insert(&self, peer: PeerId, queue: mpsc::Sender<Vec<u8>>) {
        self.inner.insert(peer, queue);
    }

    fn remove(&self, peer: PeerId) {
        self.inner.remove(&peer);
    }

    fn enqueue(&self, peer: PeerId, packet: Vec<u8>) -> Result<(), SendError> {
        let queue = self.inner.get(&peer).ok_or(SendError::UnknownPeer(peer))?;
        queue.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull(peer),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(peer),
        })
    }
}

/// Cloneable sending side of a [`GameServer`].
#[derive(Clone)]
pub struct ServerHandle {
    connections: ConnectionMap,
    compression: CompressionConfig,
}

impl ServerHandle {
    pub fn connections(&self) -> &ConnectionMap {
        &self.connections
    }

    /// Closes the connection to `peer` after its queued packets are sent.
    pub fn disconnect(&self, peer: PeerId) {
        self.connections.remove(peer);
    }
}

impl Transport for ServerHandle {
    fn send(&self, to: PeerId, message: Message) -> Result<(), SendError> {
        let packet = encode_packet(&message, &self.compression)?;
        self.connections.enqueue(to, packet)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Everything a connection task needs, detached from the server's lifetime.
#[derive(Clone)]
struct ConnectionContext {
    connections: ConnectionMap,
    events: mpsc::Sender<NetEvent>,
    frame: FrameConfig,
    compression: CompressionConfig,
    idle_timeout: Duration,
}

pub struct GameServer {
    config: ServerConfig,
    connections: ConnectionMap,
    events: mpsc::Sender<NetEvent>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GameServer {
    pub fn new(config: ServerConfig, events: mpsc::Sender<NetEvent>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            connections: ConnectionMap::default(),
            events,
            // 0 is the host.
            next_id: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            connections: self.connections.clone(),
            compression: self.config.compression,
        }
    }

    pub fn connections(&self) -> &ConnectionMap {
        &self.connections
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "server listening");
        self.run_with_listener(listener).await
    }

    /// Accept loop on a pre-bound listener. Returns after [`shutdown`](Self::shutdown).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let context = ConnectionContext {
            connections: self.connections.clone(),
            events: self.events.clone(),
            frame: self.config.frame,
            compression: self.config.compression,
            idle_timeout: self.config.idle_timeout,
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    if self.connections.len() >= self.config.max_connections {
                        tracing::warn!(%addr, max = self.config.max_connections, "connection limit reached, rejecting");
                        continue;
                    }
                    stream.set_nodelay(true)?;

                    let peer = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
                    let (queue_tx, queue_rx) = mpsc::channel(self.config.outbound_capacity);
                    self.connections.insert(peer, queue_tx);
                    tracing::info!(%peer, %addr, "client connected");

                    if self.events.send(NetEvent::Connected { peer, addr }).await.is_err() {
                        tracing::warn!("event receiver dropped, stopping accept loop");
                        break;
                    }
                    let context = context.clone();
                    let shutdown = self.shutdown_rx.clone();
                    tokio::spawn(serve_connection(peer, addr, stream, queue_rx, context, shutdown));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn serve_connection(
    peer: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    mut queue: mpsc::Receiver<Vec<u8>>,
    context: ConnectionContext,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();

    let frame = context.frame;
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &packet, &frame).await {
                tracing::debug!(%peer, error = %e, "write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reason = read_loop(peer, reader, &context, shutdown).await;

    context.connections.remove(peer);
    let _ = writer_task.await;
    tracing::info!(%peer, %addr, %reason, "client disconnected");
    let _ = context
        .events
        .send(NetEvent::Disconnected { peer, reason })
        .await;
}

/// Reads until the connection ends and returns why it ended.
async fn read_loop(
    peer: PeerId,
    mut reader: OwnedReadHalf,
    context: &ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
) -> String {
    loop {
        let packet = tokio::select! {
            read = tokio::time::timeout(context.idle_timeout, read_frame(&mut reader, &context.frame)) => {
                match read {
                    Ok(Ok(packet)) => packet,
                    Ok(Err(FrameError::ConnectionClosed)) => return "closed by peer".to_string(),
                    Ok(Err(e)) => return e.to_string(),
                    Err(_) => return "timed out".to_string(),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return "server shutdown".to_string();
                }
                continue;
            }
        };

        let message = match decode_packet(&packet) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping undecodable packet");
                continue;
            }
        };
        match message {
            Message::Ping { nonce } => {
                if let Ok(pong) = encode_packet(&Message::Pong { nonce }, &context.compression) {
                    let _ = context.connections.enqueue(peer, pong);
                }
            }
            Message::Pong { .. } => {}
            message => {
                if context
                    .events
                    .send(NetEvent::Message { from: peer, message })
                    .await
                    .is_err()
                {
                    return "event receiver dropped".to_string();
                }
            }
        }
    }
}
