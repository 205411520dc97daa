//! Quota gate: per-scope policies applied to inbound HTTP requests.
//!
//! Every applicable scope is hit concurrently. The request passes only if
//! all of them allow it; the `X-RateLimit-*` headers describe whichever scope
//! resets soonest.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::limiter::{RateLimiter, MAX_WINDOW_SECS};
use crate::types::{HitResult, PolicyError};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";

// ---------------------------------------------------------------------------
// Scopes and policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Org,
    Ip,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Org => "org",
            Scope::Ip => "ip",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopePolicy {
    pub scope: Scope,
    pub limit: i64,
    pub window_secs: u64,
}

impl ScopePolicy {
    pub fn new(scope: Scope, limit: i64, window_secs: u64) -> Self {
        Self {
            scope,
            limit,
            window_secs,
        }
    }

    /// Parse `<limit>/<window_secs>`, e.g. `600/60`.
    pub fn parse(scope: Scope, value: &str) -> Result<Self, PolicyError> {
        let malformed = || PolicyError::Malformed(value.to_string());
        let (limit, window) = value.trim().split_once('/').ok_or_else(malformed)?;
        let limit = i64::from_str(limit.trim()).map_err(|_| malformed())?;
        let window_secs = u64::from_str(window.trim()).map_err(|_| malformed())?;
        if window_secs > MAX_WINDOW_SECS {
            return Err(malformed());
        }
        Ok(Self::new(scope, limit, window_secs))
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }
}

// ---------------------------------------------------------------------------
// Who is calling
// ---------------------------------------------------------------------------

/// Authenticated caller, inserted as a request extension by whatever
/// authenticates the request. Absent for anonymous calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
}

/// Everything the gate keys on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub principal: Principal,
    pub ip: Option<IpAddr>,
}

impl Identity {
    /// Principal from extensions; IP from the socket peer.
    ///
    /// With `trust_forwarded_for` the first `X-Forwarded-For` hop wins over
    /// the peer. Only set it when every request arrives through a proxy that
    /// overwrites the header, otherwise clients pick their own IP bucket.
    pub fn from_request(request: &Request, trust_forwarded_for: bool) -> Self {
        let principal = request
            .extensions()
            .get::<Principal>()
            .cloned()
            .unwrap_or_default();
        let peer = || {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        };
        let ip = if trust_forwarded_for {
            forwarded_ip(request.headers()).or_else(peer)
        } else {
            peer()
        };
        Self { principal, ip }
    }

    fn id_for(&self, scope: Scope) -> Option<String> {
        match scope {
            Scope::User => self.principal.user_id.clone(),
            Scope::Org => self.principal.org_id.clone(),
            Scope::Ip => self.ip.map(|ip| ip.to_string()),
        }
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Merged outcome over every scope that applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Result of the scope that resets soonest; drives the headers.
    pub tightest: HitResult,
    /// Seconds until every denying scope has reset. Zero when allowed.
    pub retry_after: u64,
}

impl Decision {
    /// `None` for an empty set.
    pub fn merge(results: &[HitResult]) -> Option<Self> {
        let tightest = *results.iter().min_by_key(|r| r.reset_seconds)?;
        let retry_after = results
            .iter()
            .filter(|r| !r.allowed)
            .map(|r| r.reset_seconds)
            .max()
            .unwrap_or(0);
        Some(Self {
            allowed: results.iter().all(|r| r.allowed),
            tightest,
            retry_after,
        })
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.tightest.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.tightest.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.tightest.reset_seconds));
    }
}

#[derive(Serialize)]
struct RejectBody {
    error: &'static str,
    retry_after: u64,
}

impl IntoResponse for Decision {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RejectBody {
                error: "Rate limit exceeded",
                retry_after: self.retry_after,
            }),
        )
            .into_response();
        self.apply_headers(response.headers_mut());
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after));
        response
    }
}

// ---------------------------------------------------------------------------
// QuotaGate
// ---------------------------------------------------------------------------

pub struct QuotaGate {
    limiter: Arc<RateLimiter>,
    policies: Vec<ScopePolicy>,
    trust_forwarded_for: bool,
}

impl QuotaGate {
    /// Disabled policies (`limit <= 0`) are dropped here. The IP scope keys
    /// on the socket peer until `trust_forwarded_for` is turned on.
    pub fn new(limiter: Arc<RateLimiter>, policies: impl IntoIterator<Item = ScopePolicy>) -> Self {
        Self {
            limiter,
            policies: policies.into_iter().filter(ScopePolicy::is_enabled).collect(),
            trust_forwarded_for: false,
        }
    }

    /// Key the IP scope on the first `X-Forwarded-For` hop when present.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn trusts_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    pub fn policies(&self) -> &[ScopePolicy] {
        &self.policies
    }

    /// Bucket key for one scope: `<scope>:<id>:<method>:<path>`.
    pub fn key(scope: Scope, id: &str, method: &Method, path: &str) -> String {
        format!("{scope}:{id}:{method}:{path}")
    }

    /// Hit every policy the identity has an id for. `None` when none apply.
    pub async fn check(&self, identity: &Identity, method: &Method, path: &str) -> Option<Decision> {
        let hits = self.policies.iter().filter_map(|policy| {
            let id = identity.id_for(policy.scope)?;
            let key = Self::key(policy.scope, &id, method, path);
            Some(async move {
                self.limiter
                    .hit(&key, policy.limit, policy.window_secs)
                    .await
            })
        });

        let results = join_all(hits).await;
        Decision::merge(&results)
    }
}

/// axum middleware. Install with
/// `axum::middleware::from_fn_with_state(gate, enforce_quota)`.
pub async fn enforce_quota(State(gate): State<Arc<QuotaGate>>, request: Request, next: Next) -> Response {
    let identity = Identity::from_request(&request, gate.trusts_forwarded_for());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let Some(decision) = gate.check(&identity, &method, &path).await else {
        debug!(%method, path = %path, "No quota scope applies");
        return next.run(request).await;
    };

    if !decision.allowed {
        warn!(
            %method,
            path = %path,
            user_id = identity.principal.user_id.as_deref(),
            org_id = identity.principal.org_id.as_deref(),
            ip = identity.ip.map(|ip| ip.to_string()).as_deref(),
            retry_after = decision.retry_after,
            "Quota exceeded"
        );
        return decision.into_response();
    }

    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    response
}
