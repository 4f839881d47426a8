//! Long-term credential authentication (RFC 5389 §10.2)
//!
//! The relay engine calls [`AuthGateway::authenticate`] once per
//! authenticated request. The gateway delegates the decision to a pluggable
//! [`AuthHandler`] and records one structured log event per attempt under the
//! span it was given. Key material never reaches the log.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use tracing::{info, Span};

use crate::metrics::EdgeMetrics;

type HmacSha1 = Hmac<Sha1>;

/// 16-byte long-term key: `MD5(username ":" realm ":" password)`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthKey([u8; 16]);

impl AuthKey {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

/// Derive the long-term key for a user.
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> AuthKey {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    AuthKey(hasher.finalize().into())
}

/// One authentication attempt as seen by the relay engine.
#[derive(Debug, Clone, Copy)]
pub struct AuthAttempt<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub src_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept(AuthKey),
    Reject,
}

impl AuthDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthDecision::Accept(_))
    }

    pub fn into_key(self) -> Option<AuthKey> {
        match self {
            AuthDecision::Accept(key) => Some(key),
            AuthDecision::Reject => None,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            AuthDecision::Accept(_) => "accepted",
            AuthDecision::Reject => "rejected",
        }
    }
}

/// Credential decision strategy.
///
/// Implementations must be pure with respect to their inputs: the same
/// attempt yields the same decision, and no state is carried between calls.
pub trait AuthHandler: Send + Sync {
    /// Short strategy name, used in logs.
    fn name(&self) -> &'static str;

    fn authenticate(&self, attempt: &AuthAttempt<'_>) -> AuthDecision;
}

/// Reference policy: no backing store, every attempt fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl AuthHandler for RejectAll {
    fn name(&self) -> &'static str {
        "reject-all"
    }

    fn authenticate(&self, _attempt: &AuthAttempt<'_>) -> AuthDecision {
        AuthDecision::Reject
    }
}

/// Time-limited credentials derived from a shared secret (TURN REST API).
///
/// Usernames have the form `<unix-expiry>[:<user>]`; the matching password
/// is `base64(HMAC-SHA1(secret, username))`.
pub struct StaticSecret {
    secret: Vec<u8>,
    now: fn() -> u64,
}

impl StaticSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            now: unix_now,
        }
    }

    /// Replace the wall clock used for expiry checks.
    pub fn with_clock(mut self, now: fn() -> u64) -> Self {
        self.now = now;
        self
    }

    /// Password a client must present for `username`, or `None` if the
    /// secret cannot key the MAC.
    pub fn password_for(&self, username: &str) -> Option<String> {
        let mut mac = HmacSha1::new_from_slice(&self.secret).ok()?;
        mac.update(username.as_bytes());
        Some(BASE64.encode(mac.finalize().into_bytes()))
    }

    fn expiry(username: &str) -> Option<u64> {
        let stamp = username.split_once(':').map_or(username, |(stamp, _)| stamp);
        stamp.parse().ok()
    }
}

impl fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSecret").finish_non_exhaustive()
    }
}

impl AuthHandler for StaticSecret {
    fn name(&self) -> &'static str {
        "static-secret"
    }

    fn authenticate(&self, attempt: &AuthAttempt<'_>) -> AuthDecision {
        match Self::expiry(attempt.username) {
            Some(expiry) if expiry > (self.now)() => {}
            _ => return AuthDecision::Reject,
        }

        match self.password_for(attempt.username) {
            Some(password) => AuthDecision::Accept(generate_auth_key(attempt.username, attempt.realm, &password)),
            None => AuthDecision::Reject,
        }
    }
}

/// Fixed table of users with keys precomputed for one realm.
#[derive(Default)]
pub struct CredentialTable {
    realm: String,
    keys: HashMap<String, AuthKey>,
}

impl CredentialTable {
    pub fn new<I, U, P>(realm: &str, users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: AsRef<str>,
    {
        let keys = users
            .into_iter()
            .map(|(user, pass)| {
                let user = user.into();
                let key = generate_auth_key(&user, realm, pass.as_ref());
                (user, key)
            })
            .collect();

        Self {
            realm: realm.to_string(),
            keys,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for CredentialTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialTable")
            .field("realm", &self.realm)
            .field("users", &self.keys.len())
            .finish()
    }
}

impl AuthHandler for CredentialTable {
    fn name(&self) -> &'static str {
        "credential-table"
    }

    fn authenticate(&self, attempt: &AuthAttempt<'_>) -> AuthDecision {
        if attempt.realm != self.realm {
            return AuthDecision::Reject;
        }
        match self.keys.get(attempt.username) {
            Some(key) => AuthDecision::Accept(*key),
            None => AuthDecision::Reject,
        }
    }
}

/// Decision function handed to the relay engine.
#[derive(Clone)]
pub struct AuthGateway {
    handler: Arc<dyn AuthHandler>,
    span: Span,
    metrics: Option<Arc<EdgeMetrics>>,
}

impl AuthGateway {
    /// `span` is the log sink every attempt is recorded under.
    pub fn new(handler: Arc<dyn AuthHandler>, span: Span) -> Self {
        Self {
            handler,
            span,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EdgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn strategy(&self) -> &'static str {
        self.handler.name()
    }

    /// Returns the user's key on success, `None` when the attempt is rejected.
    pub fn authenticate(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Option<AuthKey> {
        let attempt = AuthAttempt {
            username,
            realm,
            src_addr,
        };
        let decision = self.handler.authenticate(&attempt);

        info!(
            parent: &self.span,
            username = %username,
            realm = %realm,
            src_addr = %src_addr,
            strategy = self.handler.name(),
            outcome = decision.outcome(),
            "Authentication"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_auth(decision.is_accepted());
        }

        decision.into_key()
    }
}

impl fmt::Debug for AuthGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGateway")
            .field("strategy", &self.handler.name())
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
