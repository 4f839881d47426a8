//! Socket provisioning

use std::net::{Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tracing::info;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("Failed to create TURN server {transport} listener on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// The UDP endpoint and TCP listener the service runs on.
///
/// Both are bound on 0.0.0.0 at the same port. The set is owned by the
/// lifecycle and handed whole to the relay engine, which releases it on close.
#[derive(Debug)]
pub struct ListenerSet {
    pub udp: UdpSocket,
    pub tcp: TcpListener,
}

impl ListenerSet {
    /// Bind both sockets on all IPv4 interfaces.
    ///
    /// With `port` 0 the TCP listener picks an ephemeral port and the UDP
    /// socket is bound to the same number. Failures are not retried.
    pub async fn bind(port: u16) -> Result<Self, BindError> {
        let tcp_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let tcp = TcpListener::bind(tcp_addr).await.map_err(|source| BindError::Bind {
            transport: "TCP",
            addr: tcp_addr,
            source,
        })?;

        let port = local_port(&tcp, tcp_addr)?;
        let udp_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let udp = UdpSocket::bind(udp_addr).await.map_err(|source| BindError::Bind {
            transport: "UDP",
            addr: udp_addr,
            source,
        })?;

        info!(port, "Bound UDP and TCP listeners on all interfaces");
        Ok(Self { udp, tcp })
    }

    pub fn port(&self) -> u16 {
        self.tcp.local_addr().map(|a| a.port()).unwrap_or_default()
    }
}

fn local_port(tcp: &TcpListener, requested: SocketAddr) -> Result<u16, BindError> {
    tcp.local_addr()
        .map(|addr| addr.port())
        .map_err(|source| BindError::Bind {
            transport: "TCP",
            addr: requested,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_and_tcp_share_the_port() {
        let set = ListenerSet::bind(0).await.unwrap();
        let udp = set.udp.local_addr().unwrap();
        let tcp = set.tcp.local_addr().unwrap();

        assert_eq!(udp.port(), tcp.port());
        assert_eq!(set.port(), tcp.port());
        assert!(udp.ip().is_unspecified());
        assert!(tcp.ip().is_unspecified());
    }

    #[tokio::test]
    async fn port_in_use_fails_immediately() {
        let set = ListenerSet::bind(0).await.unwrap();
        let err = ListenerSet::bind(set.port()).await.unwrap_err();
        let BindError::Bind { transport, addr, .. } = err;
        assert_eq!(transport, "TCP");
        assert_eq!(addr.port(), set.port());
    }

    #[tokio::test]
    async fn released_port_can_be_rebound() {
        let port = {
            let set = ListenerSet::bind(0).await.unwrap();
            set.port()
        };
        let again = ListenerSet::bind(port).await.unwrap();
        assert_eq!(again.port(), port);
    }
}
