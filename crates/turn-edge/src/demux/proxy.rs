//! Single-upstream HTTP reverse proxy
//!
//! Each HTTP connection split off the TURN port is served with hyper (HTTP/1
//! and cleartext HTTP/2) and every request is replayed against the configured
//! origin with the same method, path, headers and body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::{Body as _, Incoming};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use reqwest::{redirect, Client, Url};
use thiserror::Error;
use tokio::net::TcpStream;
use tower::Service;
use tracing::{debug, warn};

use crate::metrics::EdgeMetrics;

/// Headers that describe one hop and are not forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

struct ProxyState {
    client: Client,
    upstream: Url,
    metrics: Arc<EdgeMetrics>,
}

/// Forwards HTTP connections to one fixed origin.
#[derive(Clone)]
pub struct UpstreamProxy {
    router: Router,
    upstream: Url,
}

impl UpstreamProxy {
    pub fn new(upstream: Url, metrics: Arc<EdgeMetrics>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().redirect(redirect::Policy::none()).build()?;
        let state = Arc::new(ProxyState {
            client,
            upstream: upstream.clone(),
            metrics,
        });
        let router = Router::new().fallback(forward).with_state(state);
        Ok(Self { router, upstream })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Serve one classified HTTP connection until the client goes away.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let router = self.router.clone();
        let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(peer));
            router.clone().call(request)
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!(%peer, "HTTP connection ended: {}", e);
        }
    }
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match forward_request(&state, peer, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%peer, upstream = %state.upstream, "HTTP proxy error: {}", e);
            state.metrics.record_proxy_error();
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn forward_request(state: &ProxyState, peer: SocketAddr, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let url = target_url(&state.upstream, &parts.uri);
    let headers = request_headers(parts.headers, &parts.uri, peer);

    debug!(%peer, method = %parts.method, %url, "Forwarding HTTP request");
    let mut outgoing = state.client.request(parts.method, url).headers(headers);
    // Bodies are streamed through as they arrive.
    if !body.is_end_stream() {
        outgoing = outgoing.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let upstream = outgoing.send().await?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(out) = response.headers_mut() {
        let mut upstream_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut upstream_headers);
        out.extend(upstream_headers);
    }

    Ok(response
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()))
}

/// Headers sent upstream for a client request.
fn request_headers(mut headers: HeaderMap, uri: &Uri, peer: SocketAddr) -> HeaderMap {
    let trailers = headers
        .get_all(header::TE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("trailers"));

    strip_hop_by_hop(&mut headers);
    if trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
    if !headers.contains_key(header::HOST) {
        // HTTP/2 carries the host as :authority
        if let Some(value) = uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()) {
            headers.insert(header::HOST, value);
        }
    }
    append_forwarded_for(&mut headers, peer);
    headers
}

/// Join the request path and query onto the upstream URL the way a
/// single-host reverse proxy does.
fn target_url(upstream: &Url, uri: &Uri) -> Url {
    let mut url = upstream.clone();
    url.set_path(&join_paths(upstream.path(), uri.path()));

    let query = match (upstream.query().filter(|q| !q.is_empty()), uri.query()) {
        (Some(base), Some(extra)) => Some(format!("{}&{}", base, extra)),
        (base, extra) => extra.or(base).map(str::to_owned),
    };
    url.set_query(query.as_deref());
    url
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn joins_paths_like_single_host_proxy() {
        assert_eq!(join_paths("/", "/a"), "/a");
        assert_eq!(join_paths("/base", "/a"), "/base/a");
        assert_eq!(join_paths("/base/", "/a"), "/base/a");
        assert_eq!(join_paths("/base", "a"), "/base/a");
    }

    #[test]
    fn target_url_keeps_path_and_query() {
        let upstream = url("http://127.0.0.1:8080");
        let uri: Uri = "/v1/items?limit=5".parse().unwrap();
        assert_eq!(target_url(&upstream, &uri).as_str(), "http://127.0.0.1:8080/v1/items?limit=5");

        let upstream = url("http://backend/api?key=1");
        let uri: Uri = "/x?y=2".parse().unwrap();
        assert_eq!(target_url(&upstream, &uri).as_str(), "http://backend/api/x?key=1&y=2");

        let uri: Uri = "/x".parse().unwrap();
        assert_eq!(target_url(&upstream, &uri).as_str(), "http://backend/api/x?key=1");
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::AUTHORIZATION], "Bearer t");
    }

    #[test]
    fn te_trailers_survives_other_te_values_do_not() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let uri: Uri = "/grpc.Health/Check".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::TE, HeaderValue::from_static("gzip, Trailers"));
        let out = request_headers(headers, &uri, peer);
        assert_eq!(out[header::TE], "trailers");

        let mut headers = HeaderMap::new();
        headers.insert(header::TE, HeaderValue::from_static("gzip"));
        let out = request_headers(headers, &uri, peer);
        assert!(!out.contains_key(header::TE));
    }

    #[test]
    fn request_headers_fill_host_from_authority() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let uri: Uri = "http://edge.example:3478/x".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        let out = request_headers(headers, &uri, peer);

        assert_eq!(out[header::HOST], "edge.example:3478");
        assert_eq!(out[header::CONTENT_LENGTH], "12");
        assert_eq!(out["x-forwarded-for"], "192.0.2.1");
        assert!(!out.contains_key(header::CONNECTION));
    }

    #[test]
    fn forwarded_for_is_appended() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers["x-forwarded-for"], "192.0.2.1");

        append_forwarded_for(&mut headers, "198.51.100.2:1".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "192.0.2.1, 198.51.100.2");
    }
}
