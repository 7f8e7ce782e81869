//! Client-side connection to a host.
//!
//! [`GameClient`] runs a reader task (frames to [`NetEvent`]s, idle timeout)
//! and a writer task (outbound queue plus keepalive pings). Connection state
//! is published on a [`watch`] channel.

use std::time::Duration;

use strata_config::NetworkConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::compression::CompressionConfig;
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::messages::{Message, PeerId, decode_packet, encode_packet};
use crate::routing::NetEvent;
use crate::transport::{SendError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_addr: String,
    pub frame: FrameConfig,
    pub compression: CompressionConfig,
    pub outbound_capacity: usize,
    pub heartbeat_interval: Duration,
    /// The connection is considered lost after this long without a frame.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7777".to_string(),
            frame: FrameConfig::default(),
            compression: CompressionConfig::default(),
            outbound_capacity: 1024,
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn from_config(network: &NetworkConfig) -> Self {
        let idle_timeout = Duration::from_secs(u64::from(network.timeout_seconds.max(1)));
        Self {
            server_addr: format!("{}:{}", network.server_address, network.server_port),
            frame: FrameConfig::from_config(network),
            compression: CompressionConfig::from_config(network),
            // Several pings per timeout window.
            heartbeat_interval: idle_timeout / 4,
            idle_timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {addr}")]
    Timeout { addr: String },
}

/// Cloneable sending side of a [`GameClient`]. A client only talks to the
/// host.
#[derive(Clone)]
pub struct ClientHandle {
    queue: mpsc::Sender<Vec<u8>>,
    compression: CompressionConfig,
}

impl Transport for ClientHandle {
    fn send(&self, to: PeerId, message: Message) -> Result<(), SendError> {
        if !to.is_host() {
            return Err(SendError::UnknownPeer(to));
        }
        let packet = encode_packet(&message, &self.compression)?;
        self.queue.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull(to),
            mpsc::error::TrySendError::Closed(_) => SendError::Closed(to),
        })
    }
}

pub struct GameClient {
    handle: ClientHandle,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GameClient {
    pub async fn connect(
        config: &ClientConfig,
        events: mpsc::Sender<NetEvent>,
    ) -> Result<Self, ClientError> {
        let addr = config.server_addr.clone();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout { addr: addr.clone() })?
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        tracing::info!(%addr, "connected to host");
        Ok(Self::start(stream, config, events))
    }

    /// Runs the client over an already established stream.
    pub fn start<S>(stream: S, config: &ClientConfig, events: mpsc::Sender<NetEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(config.outbound_capacity);

        let writer = tokio::spawn(write_loop(
            write_half,
            queue_rx,
            config.clone(),
            shutdown_rx.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            read_half,
            config.clone(),
            events,
            state_tx,
            shutdown_rx,
        ));

        Self {
            handle: ClientHandle {
                queue: queue_tx,
                compression: config.compression,
            },
            state: state_rx,
            shutdown: shutdown_tx,
            reader,
            writer,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stops both tasks. The reader reports a `Disconnected` event.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Disconnects and waits for both tasks to finish.
    pub async fn close(self) {
        self.disconnect();
        let _ = self.writer.await;
        let _ = self.reader.await;
    }
}

async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    config: ClientConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, config.heartbeat_interval);
    let mut nonce = 0u64;

    loop {
        let packet = tokio::select! {
            queued = queue.recv() => match queued {
                Some(packet) => packet,
                None => break,
            },
            _ = heartbeat.tick() => {
                nonce += 1;
                match encode_packet(&Message::Ping { nonce }, &config.compression) {
                    Ok(packet) => packet,
                    Err(_) => continue,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = write_frame(&mut writer, &packet, &config.frame).await {
            tracing::debug!(error = %e, "write to host failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    config: ClientConfig,
    events: mpsc::Sender<NetEvent>,
    state: watch::Sender<ConnectionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        let packet = tokio::select! {
            read = tokio::time::timeout(config.idle_timeout, read_frame(&mut reader, &config.frame)) => {
                match read {
                    Ok(Ok(packet)) => packet,
                    Ok(Err(FrameError::ConnectionClosed)) => break "closed by host".to_string(),
                    Ok(Err(e)) => break e.to_string(),
                    Err(_) => break "timed out".to_string(),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break "disconnected locally".to_string();
                }
                continue;
            }
        };

        match decode_packet(&packet) {
            Ok(Message::Pong { .. }) => {}
            Ok(message) => {
                let event = NetEvent::Message {
                    from: PeerId::HOST,
                    message,
                };
                if events.send(event).await.is_err() {
                    break "event receiver dropped".to_string();
                }
            }
            Err(e) => tracing::warn!(error = %e, "dropping undecodable packet from host"),
        }
    };

    tracing::info!(%reason, "connection to host ended");
    let _ = state.send(ConnectionState::Disconnected);
    let _ = events
        .send(NetEvent::Disconnected {
            peer: PeerId::HOST,
            reason,
        })
        .await;
}
