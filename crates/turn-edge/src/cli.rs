//! Command-line flags

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::config::AuthStrategy;

/// TURN front-end: provisions the listening sockets, splits HTTP traffic off
/// the TURN port and gates allocations with long-term credentials.
#[derive(Parser, Debug, Default)]
#[command(name = "turn-edge")]
#[command(version, about = "TURN server front-end with HTTP traffic splitting")]
pub struct Cli {
    /// IP address that TURN can be contacted by (advertised in relay candidates)
    #[arg(long = "public-ip", env = "TURN_EDGE_PUBLIC_IP")]
    pub public_ip: Option<IpAddr>,

    /// Listening port for both UDP and TCP [default: 3478]
    #[arg(long, env = "TURN_EDGE_PORT")]
    pub port: Option<u16>,

    /// Long-term auth secret
    #[arg(long = "static-auth-secret", env = "TURN_EDGE_STATIC_AUTH_SECRET", hide_env_values = true)]
    pub static_auth_secret: Option<String>,

    /// Split regular HTTP traffic to a different server
    #[arg(long = "http-server", env = "TURN_EDGE_HTTP_SERVER")]
    pub http_server: Option<String>,

    /// Realm [default: pion.ly]
    #[arg(long, env = "TURN_EDGE_REALM")]
    pub realm: Option<String>,

    /// Credential strategy used to answer authentication requests
    #[arg(long = "auth", value_enum, env = "TURN_EDGE_AUTH")]
    pub auth: Option<AuthStrategy>,

    /// Static credential table, e.g. "alice=pass1,bob=pass2"
    #[arg(long, env = "TURN_EDGE_USERS", hide_env_values = true)]
    pub users: Option<String>,

    /// How long to wait for enough bytes to classify a TCP connection
    #[arg(long = "classify-timeout-ms", env = "TURN_EDGE_CLASSIFY_TIMEOUT_MS")]
    pub classify_timeout_ms: Option<u64>,

    /// Serve /health and /metrics on this address
    #[arg(long = "metrics-addr", env = "TURN_EDGE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// TOML config file path
    #[arg(long, short = 'f', env = "TURN_EDGE_CONFIG")]
    pub config: Option<PathBuf>,
}
