//! Relay engine contract
//!
//! The TURN state machine (allocations, permissions, channel bindings, data
//! relaying) lives behind [`RelayEngine`]. This crate hands it sockets, the
//! authentication decision function and the relay address policy; it never
//! parses or emits STUN/TURN messages itself.
//!
//! [`InertEngine`] owns the sockets and drains whatever arrives without
//! answering. The binary runs [`crate::turn_engine::TurnEngine`] instead.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace};

use crate::auth::AuthGateway;
use crate::relay_address::RelayAddressGenerator;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid relay address: {0}")]
    InvalidRelayAddress(String),
    #[error("Relay server error: {0}")]
    Server(String),
    #[error("Engine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Source of accepted TCP connections for the engine.
#[async_trait]
pub trait StreamListener: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl StreamListener for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A UDP socket plus the policy for relay addresses allocated through it.
pub struct PacketConnConfig {
    pub socket: UdpSocket,
    pub relay_address: Arc<dyn RelayAddressGenerator>,
}

/// A TCP listener plus the policy for relay addresses allocated through it.
pub struct ListenerConfig {
    pub listener: Box<dyn StreamListener>,
    pub relay_address: Arc<dyn RelayAddressGenerator>,
}

/// Everything the front-end supplies to the engine.
pub struct EngineConfig {
    pub realm: String,
    pub auth: AuthGateway,
    pub packet_conn_configs: Vec<PacketConnConfig>,
    pub listener_configs: Vec<ListenerConfig>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.realm.is_empty() {
            return Err(EngineError::InvalidConfig("realm must not be empty".to_string()));
        }
        if self.packet_conn_configs.is_empty() && self.listener_configs.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one packet conn or listener config is required".to_string(),
            ));
        }
        for config in &self.packet_conn_configs {
            config.relay_address.validate()?;
        }
        for config in &self.listener_configs {
            config.relay_address.validate()?;
        }
        Ok(())
    }
}

/// A started engine instance.
#[async_trait]
pub trait RelayEngine: Send {
    /// Release every allocation and every socket handed over at start.
    async fn close(self: Box<Self>) -> Result<(), EngineError>;
}

#[async_trait]
pub trait RelayEngineFactory: Send + Sync {
    async fn start(&self, config: EngineConfig) -> Result<Box<dyn RelayEngine>, EngineError>;
}

/// Factory for [`InertEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct InertEngineFactory;

#[async_trait]
impl RelayEngineFactory for InertEngineFactory {
    async fn start(&self, config: EngineConfig) -> Result<Box<dyn RelayEngine>, EngineError> {
        Ok(Box::new(InertEngine::start(config)?))
    }
}

/// Engine that accepts traffic and discards it.
pub struct InertEngine {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl InertEngine {
    pub fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::new();

        for packet in config.packet_conn_configs {
            info!(local_addr = ?packet.socket.local_addr().ok(), realm = %config.realm, "Engine serving UDP");
            tasks.push(tokio::spawn(drain_packets(packet.socket, shutdown_tx.subscribe())));
        }

        for listener in config.listener_configs {
            info!(local_addr = ?listener.listener.local_addr().ok(), realm = %config.realm, "Engine serving TCP");
            tasks.push(tokio::spawn(drain_streams(listener.listener, shutdown_tx.subscribe())));
        }

        Ok(Self { shutdown_tx, tasks })
    }
}

#[async_trait]
impl RelayEngine for InertEngine {
    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            task.await?;
        }
        debug!("Engine closed, sockets released");
        Ok(())
    }
}

async fn drain_packets(socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => trace!(%from, len, "Discarding datagram"),
                Err(e) => {
                    debug!("UDP receive error: {}", e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

pub(crate) async fn drain_streams(mut listener: Box<dyn StreamListener>, mut shutdown: watch::Receiver<bool>) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((mut stream, from)) => {
                    trace!(%from, "Draining TCP stream");
                    streams.spawn(async move {
                        let mut buf = [0u8; 4096];
                        while let Ok(n) = stream.read(&mut buf).await {
                            if n == 0 {
                                break;
                            }
                        }
                    });
                }
                Err(e) => {
                    debug!("TCP accept stopped: {}", e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    streams.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RejectAll;
    use crate::relay_address::StaticRelayAddress;
    use tracing::Span;

    fn policy() -> Arc<dyn RelayAddressGenerator> {
        Arc::new(StaticRelayAddress::new("203.0.113.7".parse().unwrap()))
    }

    fn gateway() -> AuthGateway {
        AuthGateway::new(Arc::new(RejectAll), Span::none())
    }

    #[tokio::test]
    async fn config_without_sockets_is_invalid() {
        let config = EngineConfig {
            realm: "pion.ly".to_string(),
            auth: gateway(),
            packet_conn_configs: Vec::new(),
            listener_configs: Vec::new(),
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn close_releases_sockets() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let tcp_addr = tcp.local_addr().unwrap();

        let engine = InertEngineFactory
            .start(EngineConfig {
                realm: "pion.ly".to_string(),
                auth: gateway(),
                packet_conn_configs: vec![PacketConnConfig { socket: udp, relay_address: policy() }],
                listener_configs: vec![ListenerConfig { listener: Box::new(tcp), relay_address: policy() }],
            })
            .await
            .unwrap();

        let mut client = TcpStream::connect(tcp_addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"\x00\x01\x00\x00").await.unwrap();

        engine.close().await.unwrap();

        UdpSocket::bind(udp_addr).await.unwrap();
        TcpListener::bind(tcp_addr).await.unwrap();
    }
}
