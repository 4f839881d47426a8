//! Relay engine backed by the webrtc-rs TURN server
//!
//! UDP packet conns are served by [`turn::server::Server`], which asks the
//! [`AuthGateway`] for every authenticated request and the relay address
//! policy for every allocation. The TURN server has no stream transport, so
//! TCP listeners are accepted and drained.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turn::server::config::{ConnConfig, ServerConfig};
use turn::server::Server;
use webrtc_util::Conn;

use crate::auth::AuthGateway;
use crate::engine::{drain_streams, EngineConfig, EngineError, RelayEngine, RelayEngineFactory};
use crate::relay_address::RelayAddressGenerator;

/// How often `close` checks that the server let go of its sockets.
const RELEASE_POLL: Duration = Duration::from_millis(10);

/// Factory for [`TurnEngine`], the engine the binary runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnEngineFactory;

#[async_trait]
impl RelayEngineFactory for TurnEngineFactory {
    async fn start(&self, config: EngineConfig) -> Result<Box<dyn RelayEngine>, EngineError> {
        Ok(Box::new(TurnEngine::start(config).await?))
    }
}

/// A running TURN server plus the drains for its TCP listeners.
pub struct TurnEngine {
    server: Server,
    sockets: Vec<Weak<UdpSocket>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TurnEngine {
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let mut sockets = Vec::new();
        let mut conn_configs = Vec::new();
        for packet in config.packet_conn_configs {
            info!(local_addr = ?packet.socket.local_addr().ok(), realm = %config.realm, "TURN server listening on UDP");
            let socket = Arc::new(packet.socket);
            sockets.push(Arc::downgrade(&socket));
            let conn: Arc<dyn Conn + Send + Sync> = socket;
            conn_configs.push(ConnConfig {
                conn,
                relay_addr_generator: Box::new(PolicyRelay(packet.relay_address)),
            });
        }

        let server = Server::new(ServerConfig {
            conn_configs,
            realm: config.realm,
            auth_handler: Arc::new(GatewayAuth(config.auth)),
            channel_bind_timeout: Duration::ZERO,
            alloc_close_notify: None,
        })
        .await
        .map_err(|e| EngineError::Server(e.to_string()))?;

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::new();
        for listener in config.listener_configs {
            warn!(local_addr = ?listener.listener.local_addr().ok(), "TURN over TCP is not served, draining connections");
            tasks.push(tokio::spawn(drain_streams(listener.listener, shutdown_tx.subscribe())));
        }

        Ok(Self {
            server,
            sockets,
            shutdown_tx,
            tasks,
        })
    }
}

#[async_trait]
impl RelayEngine for TurnEngine {
    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        let TurnEngine {
            server,
            sockets,
            shutdown_tx,
            tasks,
        } = *self;

        let _ = shutdown_tx.send(true);
        let closed = server.close().await.map_err(|e| EngineError::Server(e.to_string()));
        for task in tasks {
            task.await?;
        }
        closed?;

        // The server's read loops drop their socket handles after close returns.
        for socket in &sockets {
            while socket.strong_count() > 0 {
                tokio::time::sleep(RELEASE_POLL).await;
            }
        }
        debug!("TURN server closed, sockets released");
        Ok(())
    }
}

/// Feeds TURN credential lookups through the gateway.
struct GatewayAuth(AuthGateway);

impl turn::auth::AuthHandler for GatewayAuth {
    fn auth_handle(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Result<Vec<u8>, turn::Error> {
        self.0
            .authenticate(username, realm, src_addr)
            .map(|key| key.as_bytes().to_vec())
            .ok_or_else(|| turn::Error::Other(format!("no credentials for {}", username)))
    }
}

/// Allocates relay sockets through the address policy.
struct PolicyRelay(Arc<dyn RelayAddressGenerator>);

#[async_trait]
impl turn::relay::RelayAddressGenerator for PolicyRelay {
    fn validate(&self) -> Result<(), turn::Error> {
        self.0.validate().map_err(|e| turn::Error::Other(e.to_string()))
    }

    async fn allocate_conn(
        &self,
        _use_ipv4: bool,
        requested_port: u16,
    ) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr), turn::Error> {
        let (socket, candidate) = self
            .0
            .allocate_packet_conn(requested_port)
            .await
            .map_err(|e| turn::Error::Other(e.to_string()))?;
        debug!(local = %candidate.local, advertised = %candidate.advertised, "Allocated relay socket");
        let conn: Arc<dyn Conn + Send + Sync> = Arc::new(socket);
        Ok((conn, candidate.advertised))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialTable, RejectAll};
    use crate::engine::{ListenerConfig, PacketConnConfig};
    use crate::metrics::EdgeMetrics;
    use crate::relay_address::StaticRelayAddress;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tracing::Span;
    use turn::auth::AuthHandler as _;
    use turn::relay::RelayAddressGenerator as _;

    const PUBLIC_IP: &str = "203.0.113.7";

    fn policy() -> Arc<dyn RelayAddressGenerator> {
        Arc::new(StaticRelayAddress::new(PUBLIC_IP.parse().unwrap()).with_bind_ip("127.0.0.1".parse().unwrap()))
    }

    fn src() -> SocketAddr {
        "198.51.100.9:40000".parse().unwrap()
    }

    #[test]
    fn credential_lookups_go_through_gateway() {
        let metrics = Arc::new(EdgeMetrics::new().unwrap());
        let table = CredentialTable::new("pion.ly", [("alice", "s3cret")]);
        let auth = GatewayAuth(AuthGateway::new(Arc::new(table), Span::none()).with_metrics(metrics.clone()));

        let key = auth.auth_handle("alice", "pion.ly", src()).unwrap();
        assert_eq!(hex::encode(key), "b2e3b37f02a26bd57d217d754f69edf2");
        assert!(auth.auth_handle("mallory", "pion.ly", src()).is_err());
        assert_eq!(metrics.auth_attempts(true), 1);
        assert_eq!(metrics.auth_attempts(false), 1);
    }

    #[tokio::test]
    async fn allocations_advertise_public_ip() {
        let relay = PolicyRelay(policy());
        assert!(relay.validate().is_ok());

        let (conn, advertised) = relay.allocate_conn(true, 0).await.unwrap();
        let local = conn.local_addr().unwrap();
        assert_eq!(advertised, SocketAddr::new(PUBLIC_IP.parse().unwrap(), local.port()));
        assert_ne!(local.ip(), advertised.ip());
    }

    #[test]
    fn unspecified_public_ip_is_refused() {
        let relay = PolicyRelay(Arc::new(StaticRelayAddress::new("0.0.0.0".parse().unwrap())));
        assert!(relay.validate().is_err());
    }

    #[tokio::test]
    async fn answers_binding_and_releases_sockets_on_close() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let tcp_addr = tcp.local_addr().unwrap();

        let engine = TurnEngineFactory
            .start(EngineConfig {
                realm: "pion.ly".to_string(),
                auth: AuthGateway::new(Arc::new(RejectAll), Span::none()),
                packet_conn_configs: vec![PacketConnConfig { socket: udp, relay_address: policy() }],
                listener_configs: vec![ListenerConfig { listener: Box::new(tcp), relay_address: policy() }],
            })
            .await
            .unwrap();

        // STUN binding request
        let txid = [7u8; 12];
        let mut request = vec![0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42];
        request.extend_from_slice(&txid);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&request, udp_addr).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();

        assert_eq!(from, udp_addr);
        assert!(n >= 20);
        // Binding success response for the same transaction
        assert_eq!(&buf[..2], &[0x01, 0x01]);
        assert_eq!(&buf[8..20], &txid);

        let _tcp_client = TcpStream::connect(tcp_addr).await.unwrap();
        engine.close().await.unwrap();

        UdpSocket::bind(udp_addr).await.unwrap();
        TcpListener::bind(tcp_addr).await.unwrap();
    }

    #[tokio::test]
    async fn authenticated_allocation_gets_public_relay_address() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let metrics = Arc::new(EdgeMetrics::new().unwrap());
        let table = CredentialTable::new("pion.ly", [("alice", "s3cret")]);

        let engine = TurnEngineFactory
            .start(EngineConfig {
                realm: "pion.ly".to_string(),
                auth: AuthGateway::new(Arc::new(table), Span::none()).with_metrics(metrics.clone()),
                packet_conn_configs: vec![PacketConnConfig { socket: udp, relay_address: policy() }],
                listener_configs: Vec::new(),
            })
            .await
            .unwrap();

        let client = turn::client::Client::new(turn::client::ClientConfig {
            stun_serv_addr: String::new(),
            turn_serv_addr: udp_addr.to_string(),
            username: "alice".to_string(),
            password: "s3cret".to_string(),
            realm: String::new(),
            software: String::new(),
            rto_in_ms: 0,
            conn: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            vnet: None,
        })
        .await
        .unwrap();
        client.listen().await.unwrap();

        let relay = timeout(Duration::from_secs(5), client.allocate()).await.unwrap().unwrap();
        assert_eq!(relay.local_addr().unwrap().ip(), PUBLIC_IP.parse::<std::net::IpAddr>().unwrap());
        assert!(metrics.auth_attempts(true) >= 1);

        relay.close().await.unwrap();
        client.close().await.unwrap();
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_allocate_is_challenged() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let metrics = Arc::new(EdgeMetrics::new().unwrap());

        let engine = TurnEngineFactory
            .start(EngineConfig {
                realm: "pion.ly".to_string(),
                auth: AuthGateway::new(Arc::new(RejectAll), Span::none()).with_metrics(metrics.clone()),
                packet_conn_configs: vec![PacketConnConfig { socket: udp, relay_address: policy() }],
                listener_configs: Vec::new(),
            })
            .await
            .unwrap();

        // Allocate request with REQUESTED-TRANSPORT UDP and no credentials
        let txid = [9u8; 12];
        let mut request = vec![0x00, 0x03, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42];
        request.extend_from_slice(&txid);
        request.extend_from_slice(&[0x00, 0x19, 0x00, 0x04, 17, 0, 0, 0]);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&request, udp_addr).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();

        assert!(n >= 20);
        // Allocate error response
        assert_eq!(&buf[..2], &[0x01, 0x13]);
        assert_eq!(&buf[8..20], &txid);
        // No USERNAME was offered, so the gateway was not consulted.
        assert_eq!(metrics.auth_attempts(true) + metrics.auth_attempts(false), 0);

        engine.close().await.unwrap();
    }
}
