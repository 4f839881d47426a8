//! Relay address advertisement
//!
//! The service binds every interface but always advertises the configured
//! public IP in relay candidates. One generator instance is shared by the UDP
//! and TCP engine configs so both report the same address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::engine::EngineError;

/// A relay socket's real bound address paired with the address clients are told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCandidate {
    pub local: SocketAddr,
    pub advertised: SocketAddr,
}

#[async_trait]
pub trait RelayAddressGenerator: Send + Sync {
    /// Checked once when the engine starts.
    fn validate(&self) -> Result<(), EngineError>;

    /// Candidate for a relay socket bound at `local`.
    fn candidate(&self, local: SocketAddr) -> RelayCandidate;

    /// Bind a relay socket for a new allocation. `requested_port` 0 picks
    /// an ephemeral port.
    async fn allocate_packet_conn(&self, requested_port: u16) -> std::io::Result<(UdpSocket, RelayCandidate)>;
}

/// Static public address, no discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRelayAddress {
    relay_ip: IpAddr,
    bind_ip: IpAddr,
}

impl StaticRelayAddress {
    /// Advertise `relay_ip`, listen on 0.0.0.0.
    pub fn new(relay_ip: IpAddr) -> Self {
        Self {
            relay_ip,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn relay_ip(&self) -> IpAddr {
        self.relay_ip
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }
}

#[async_trait]
impl RelayAddressGenerator for StaticRelayAddress {
    fn validate(&self) -> Result<(), EngineError> {
        if self.relay_ip.is_unspecified() {
            return Err(EngineError::InvalidRelayAddress(format!(
                "relay address {} is unspecified",
                self.relay_ip
            )));
        }
        if self.relay_ip.is_ipv4() != self.bind_ip.is_ipv4() {
            return Err(EngineError::InvalidRelayAddress(format!(
                "relay address {} and bind address {} are of different families",
                self.relay_ip, self.bind_ip
            )));
        }
        Ok(())
    }

    fn candidate(&self, local: SocketAddr) -> RelayCandidate {
        RelayCandidate {
            local,
            advertised: SocketAddr::new(self.relay_ip, local.port()),
        }
    }

    async fn allocate_packet_conn(&self, requested_port: u16) -> std::io::Result<(UdpSocket, RelayCandidate)> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, requested_port)).await?;
        let candidate = self.candidate(socket.local_addr()?);
        Ok((socket, candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn binds_all_interfaces_by_default() {
        let policy = StaticRelayAddress::new("203.0.113.7".parse().unwrap());
        assert_eq!(policy.bind_ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn unspecified_or_mixed_family_is_invalid() {
        assert!(StaticRelayAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).validate().is_err());
        assert!(StaticRelayAddress::new("2001:db8::1".parse().unwrap()).validate().is_err());
    }

    #[tokio::test]
    async fn allocated_socket_advertises_public_ip() {
        let public: IpAddr = "203.0.113.7".parse().unwrap();
        let policy = StaticRelayAddress::new(public).with_bind_ip("127.0.0.1".parse().unwrap());

        let (socket, candidate) = policy.allocate_packet_conn(0).await.unwrap();
        let local = socket.local_addr().unwrap();

        assert_eq!(candidate.local, local);
        assert_eq!(candidate.advertised, SocketAddr::new(public, local.port()));
    }

    proptest! {
        #[test]
        fn advertised_ip_ignores_receiving_interface(
            local_ip in any::<[u8; 4]>(),
            port in any::<u16>(),
        ) {
            let public: IpAddr = "198.51.100.20".parse().unwrap();
            let policy = StaticRelayAddress::new(public);
            let local = SocketAddr::from((local_ip, port));

            let candidate = policy.candidate(local);
            prop_assert_eq!(candidate.advertised.ip(), public);
            prop_assert_eq!(candidate.advertised.port(), port);
            prop_assert_eq!(candidate.local, local);
        }
    }
}
