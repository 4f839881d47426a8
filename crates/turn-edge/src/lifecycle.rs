//! Service assembly, state tracking and shutdown
//!
//! [`LifecycleManager`] turns a [`ServerConfig`] into a running relay engine:
//! it validates the configuration, binds the listeners, wires the
//! demultiplexer, the auth gateway and the relay address policy, and starts
//! the engine. The resulting [`RunningService`] is shut down exactly once.
//!
//! ```text
//! Starting ──> Running ──> ShuttingDown ──> Stopped
//!     └─────────────────────────────────────────^  (startup failure)
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Span};

use crate::auth::{AuthGateway, AuthHandler, CredentialTable, RejectAll, StaticSecret};
use crate::config::{AuthStrategy, ConfigError, ServerConfig};
use crate::demux::{Classifier, Demultiplexer, UpstreamProxy};
use crate::engine::{
    EngineConfig, EngineError, ListenerConfig, PacketConnConfig, RelayEngine, RelayEngineFactory, StreamListener,
};
use crate::listeners::{BindError, ListenerSet};
use crate::metrics::{self, EdgeMetrics};
use crate::relay_address::{RelayAddressGenerator, StaticRelayAddress};

/// Service state, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServiceState {
    Starting = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("Relay engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Failed to build HTTP proxy client: {0}")]
    Proxy(#[from] reqwest::Error),
    #[error("Failed to bind metrics server on {addr}: {source}")]
    MetricsServer {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to listen for termination signals: {0}")]
    Signal(#[source] io::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Forward-only state holder shared by the manager and the running service.
struct StateMachine {
    tx: watch::Sender<ServiceState>,
    metrics: Arc<EdgeMetrics>,
    span: Span,
}

impl StateMachine {
    fn advance(&self, next: ServiceState) {
        let moved = self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            self.metrics.set_state(next);
            info!(parent: &self.span, state = ?next, "Service state changed");
        }
    }

    fn current(&self) -> ServiceState {
        *self.tx.borrow()
    }
}

/// Builds and starts the service from configuration.
pub struct LifecycleManager {
    config: ServerConfig,
    state: StateMachine,
}

impl LifecycleManager {
    /// `span` is the log sink for lifecycle and authentication events.
    pub fn new(config: ServerConfig, span: Span) -> Result<Self, LifecycleError> {
        let metrics = Arc::new(EdgeMetrics::new()?);
        metrics.set_state(ServiceState::Starting);
        let (tx, _) = watch::channel(ServiceState::Starting);
        Ok(Self {
            config,
            state: StateMachine { tx, metrics, span },
        })
    }

    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state.tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<EdgeMetrics> {
        &self.state.metrics
    }

    /// Validate, bind and start the engine.
    ///
    /// Any failure moves the service straight to [`ServiceState::Stopped`];
    /// configuration errors are reported before a single socket is opened.
    pub async fn start(self, factory: &dyn RelayEngineFactory) -> Result<RunningService, LifecycleError> {
        let assembled = self.assemble(factory).await;
        match assembled {
            Ok(parts) => {
                let service = RunningService {
                    parts,
                    state: self.state,
                };
                service.state.advance(ServiceState::Running);
                info!(
                    parent: &service.state.span,
                    udp = %service.parts.udp_addr,
                    tcp = %service.parts.tcp_addr,
                    "TURN front-end running"
                );
                Ok(service)
            }
            Err(e) => {
                error!(parent: &self.state.span, "Startup failed: {}", e);
                self.state.advance(ServiceState::Stopped);
                Err(e)
            }
        }
    }

    async fn assemble(&self, factory: &dyn RelayEngineFactory) -> Result<Parts, LifecycleError> {
        let config = &self.config;
        let metrics = &self.state.metrics;
        let span = &self.state.span;

        config.validate()?;
        let public_ip = config.public_ip()?;
        let proxy = match config.upstream_url()? {
            Some(url) => Some(UpstreamProxy::new(url, metrics.clone())?),
            None => None,
        };

        let handler: Arc<dyn AuthHandler> = match config.auth_strategy {
            AuthStrategy::Reject => Arc::new(RejectAll),
            AuthStrategy::StaticSecret => Arc::new(StaticSecret::new(config.static_auth_secret()?.as_bytes())),
            AuthStrategy::Table => Arc::new(CredentialTable::new(&config.realm, config.users.iter())),
        };
        let auth = AuthGateway::new(handler, span.clone()).with_metrics(metrics.clone());

        // One policy for both transports.
        let relay_address: Arc<dyn RelayAddressGenerator> = Arc::new(StaticRelayAddress::new(public_ip));
        relay_address.validate()?;

        info!(parent: span, ?config, "Starting TURN front-end");
        let ListenerSet { udp, tcp } = ListenerSet::bind(config.port).await?;
        let udp_addr = udp.local_addr()?;
        let tcp_addr = tcp.local_addr()?;

        let metrics_listener = match config.metrics_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|source| LifecycleError::MetricsServer { addr, source })?,
            ),
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (listener, demux) = match proxy {
            Some(proxy) => {
                let classifier = Classifier::http(config.classify_timeout());
                let (relay, handle) =
                    Demultiplexer::new(classifier, proxy, metrics.clone()).spawn(tcp, shutdown_rx.clone())?;
                (Box::new(relay) as Box<dyn StreamListener>, Some(handle))
            }
            None => (Box::new(tcp) as Box<dyn StreamListener>, None),
        };

        let engine = factory.start(EngineConfig {
            realm: config.realm.clone(),
            auth,
            packet_conn_configs: vec![PacketConnConfig {
                socket: udp,
                relay_address: relay_address.clone(),
            }],
            listener_configs: vec![ListenerConfig {
                listener,
                relay_address,
            }],
        })
        .await;
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                let _ = shutdown_tx.send(true);
                if let Some(demux) = demux {
                    let _ = demux.await;
                }
                return Err(e.into());
            }
        };

        let metrics_server = metrics_listener.map(|listener| {
            let metrics_addr = listener.local_addr().ok();
            let router = metrics::router(metrics.clone(), self.state.tx.subscribe());
            let handle = tokio::spawn(metrics::serve(listener, router, shutdown_rx.clone()));
            (metrics_addr, handle)
        });

        Ok(Parts {
            engine,
            shutdown_tx,
            demux,
            metrics_server,
            udp_addr,
            tcp_addr,
        })
    }
}

struct Parts {
    engine: Box<dyn RelayEngine>,
    shutdown_tx: watch::Sender<bool>,
    demux: Option<JoinHandle<()>>,
    metrics_server: Option<(Option<SocketAddr>, JoinHandle<io::Result<()>>)>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
}

/// A started service. Dropping it without calling [`RunningService::shutdown`]
/// leaves the engine running.
pub struct RunningService {
    parts: Parts,
    state: StateMachine,
}

impl RunningService {
    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state.tx.subscribe()
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.parts.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.parts.tcp_addr
    }

    pub fn metrics(&self) -> &Arc<EdgeMetrics> {
        &self.state.metrics
    }

    /// Bound address of the health/metrics server, if one was configured.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.parts.metrics_server.as_ref().and_then(|(addr, _)| *addr)
    }

    /// Run until `signal` resolves, then shut down.
    ///
    /// An error from the signal future still triggers the shutdown and is
    /// returned afterwards.
    pub async fn run_until<F>(self, signal: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = Result<(), LifecycleError>>,
    {
        let received = signal.await;
        if let Err(e) = &received {
            error!(parent: &self.state.span, "{}", e);
        }
        let closed = self.shutdown().await;
        received.and(closed)
    }

    /// Stop accepting, close the engine and release every socket.
    ///
    /// There is no deadline: if the engine never finishes closing, neither
    /// does this.
    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        let Self { parts, state } = self;
        debug_assert_eq!(state.current(), ServiceState::Running);
        state.advance(ServiceState::ShuttingDown);

        let _ = parts.shutdown_tx.send(true);
        if let Some(demux) = parts.demux {
            if let Err(e) = demux.await {
                warn!(parent: &state.span, "Demultiplexer task failed: {}", e);
            }
        }

        let closed = parts.engine.close().await;

        if let Some((_, server)) = parts.metrics_server {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(parent: &state.span, "Metrics server error: {}", e),
                Err(e) => warn!(parent: &state.span, "Metrics server task failed: {}", e),
            }
        }

        state.advance(ServiceState::Stopped);
        match closed {
            Ok(()) => {
                info!(parent: &state.span, "Shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(parent: &state.span, "Failed to close relay engine: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Resolve once `shutdown` has been set to true or its sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// SIGINT and SIGTERM listeners.
///
/// Handlers are registered by [`TerminationSignal::install`], so a signal
/// that arrives between install and [`TerminationSignal::recv`] is not lost.
pub struct TerminationSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl TerminationSignal {
    pub fn install() -> Result<Self, LifecycleError> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate()).map_err(LifecycleError::Signal)?,
                sigint: signal(SignalKind::interrupt()).map_err(LifecycleError::Signal)?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the first termination signal.
    pub async fn recv(mut self) -> Result<(), LifecycleError> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigterm.recv() => info!("Received SIGTERM, starting graceful shutdown"),
                _ = self.sigint.recv() => info!("Received SIGINT, starting graceful shutdown"),
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.map_err(LifecycleError::Signal)?;
            info!("Received SIGINT, starting graceful shutdown");
            Ok(())
        }
    }
}
