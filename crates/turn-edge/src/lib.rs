//! turn-edge: TURN server front-end
//!
//! Provisions the UDP and TCP listeners of a TURN service, optionally splits
//! plain HTTP traffic off the TCP port towards an upstream origin, answers
//! long-term credential lookups and always advertises the configured public
//! IP in relay candidates. The TURN state machine itself plugs in through
//! [`engine::RelayEngineFactory`]; [`TurnEngineFactory`] runs the webrtc-rs
//! TURN server.

pub mod auth;
pub mod cli;
pub mod config;
pub mod demux;
pub mod engine;
pub mod lifecycle;
pub mod listeners;
pub mod metrics;
pub mod relay_address;
pub mod turn_engine;

pub use auth::{AuthGateway, AuthHandler, AuthKey};
pub use cli::Cli;
pub use config::ServerConfig;
pub use engine::{InertEngineFactory, RelayEngine, RelayEngineFactory};
pub use lifecycle::{LifecycleError, LifecycleManager, RunningService, ServiceState, TerminationSignal};
pub use turn_engine::TurnEngineFactory;
