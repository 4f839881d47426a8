//! Protocol demultiplexing on the shared TCP port
//!
//! Every accepted connection gets its own task: it is classified by peeking,
//! HTTP traffic is proxied upstream and everything else is queued for the
//! relay engine through [`RelayListener`].

pub mod classify;
pub mod proxy;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use classify::{
    ClassifiedConnection, Classifier, Http1RequestLine, Http2Preface, Matcher, Protocol, Verdict,
};
pub use proxy::{ProxyError, UpstreamProxy};

use crate::engine::StreamListener;
use crate::lifecycle::wait_for_shutdown;
use crate::metrics::EdgeMetrics;

/// Relay connections waiting for the engine to accept them.
const RELAY_BACKLOG: usize = 128;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Splits one TCP listener between the HTTP upstream and the relay engine.
#[derive(Clone)]
pub struct Demultiplexer {
    classifier: Arc<Classifier>,
    proxy: UpstreamProxy,
    metrics: Arc<EdgeMetrics>,
}

impl Demultiplexer {
    pub fn new(classifier: Classifier, proxy: UpstreamProxy, metrics: Arc<EdgeMetrics>) -> Self {
        Self {
            classifier: Arc::new(classifier),
            proxy,
            metrics,
        }
    }

    /// Take over `listener` and start the accept loop.
    ///
    /// The loop runs until `shutdown` flips to true; it then drops the
    /// listener and aborts connections still being classified or proxied.
    /// The returned [`RelayListener`] yields the non-HTTP connections.
    pub fn spawn(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<(RelayListener, JoinHandle<()>)> {
        let local_addr = listener.local_addr()?;
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_BACKLOG);

        info!(%local_addr, upstream = %self.proxy.upstream(), "Demultiplexing TCP connections");
        let handle = tokio::spawn(self.accept_loop(listener, relay_tx, shutdown));

        let relay = RelayListener {
            connections: relay_rx,
            local_addr,
        };
        Ok((relay, handle))
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        relay: mpsc::Sender<(TcpStream, SocketAddr)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(self.clone().dispatch(stream, peer, relay.clone()));
                    }
                    Err(e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        drop(listener);
        info!(in_flight = connections.len(), "Demultiplexer stopped accepting");
        connections.shutdown().await;
    }

    async fn dispatch(self, stream: TcpStream, peer: SocketAddr, relay: mpsc::Sender<(TcpStream, SocketAddr)>) {
        let id = Uuid::new_v4();
        let (stream, peer, protocol) = self.classifier.classify(stream, peer).await.into_parts();
        self.metrics.record_connection(protocol);
        debug!(%id, %peer, %protocol, "Classified connection");

        if protocol.is_http() {
            self.proxy.serve(stream, peer).await;
            debug!(%id, %peer, "HTTP connection closed");
        } else if relay.send((stream, peer)).await.is_err() {
            debug!(%id, %peer, "Relay listener gone, dropping connection");
        }
    }
}

/// Listener handed to the relay engine in place of the raw TCP listener.
///
/// Connections arrive with nothing consumed. `accept` fails with
/// [`io::ErrorKind::NotConnected`] once the demultiplexer has stopped.
pub struct RelayListener {
    connections: mpsc::Receiver<(TcpStream, SocketAddr)>,
    local_addr: SocketAddr,
}

#[async_trait]
impl StreamListener for RelayListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        self.connections
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "demultiplexer stopped"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
