//! Fixed-window rate limiting middleware.
//!
//! Applies a [`RateLimitPolicy`] against a shared [`RateLimitStore`]. Key
//! derivation defaults to `client-ip:method:path`; it can be scoped to the
//! authenticated user or replaced entirely. User-scoped keys only see an
//! identity when this layer runs after authentication - the default
//! composition runs it before, trading perfect per-user accounting for
//! shielding the identity lookup itself from abusive traffic.
//!
//! # Response Headers
//!
//! Admitted requests carry `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
//! `X-RateLimit-Reset` (seconds until the window resets) and
//! `X-RateLimit-Used`. The 429 short-circuit additionally sets `Retry-After`
//! and forces `X-RateLimit-Remaining: 0` even when a custom limit hook
//! substitutes the response body.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use crate::context::IdentityExt;
use crate::error::{ApiError, ErrorBody};
use crate::metrics;
use crate::middleware::ip::{TrustedProxies, client_ip};
use crate::middleware::store::{RateLimitInfo, RateLimitStore};

/// Hook invoked on the limit-exceeded path to substitute the 429 response.
pub type LimitHook = Arc<dyn Fn(&RateLimitInfo) -> Response<Body> + Send + Sync>;

/// Caller-supplied key derivation function.
pub type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// How the per-request counter key is derived.
#[derive(Clone, Default)]
pub enum RateLimitKey {
    /// `client-ip:method:path` - the default, identity-free scope.
    #[default]
    IpMethodPath,
    /// The authenticated user id; falls back to the client IP for anonymous
    /// callers (or when this layer runs before authentication).
    UserId,
    /// Fully custom derivation.
    Custom(KeyFn),
}

impl fmt::Debug for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::IpMethodPath => write!(f, "IpMethodPath"),
            RateLimitKey::UserId => write!(f, "UserId"),
            RateLimitKey::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Composition-time rate limiting configuration.
#[derive(Clone)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u32,
    pub key: RateLimitKey,
    pub on_limit: Option<LimitHook>,
    pub trusted_proxies: TrustedProxies,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("key", &self.key)
            .field("on_limit", &self.on_limit.is_some())
            .finish()
    }
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            key: RateLimitKey::IpMethodPath,
            on_limit: None,
            trusted_proxies: TrustedProxies::default(),
        }
    }

    // Named presets - configuration shortcuts, not separate algorithms.

    /// 10 requests per minute.
    pub fn strict() -> Self {
        Self::new(Duration::from_secs(60), 10)
    }

    /// 60 requests per minute.
    pub fn moderate() -> Self {
        Self::new(Duration::from_secs(60), 60)
    }

    /// 300 requests per minute.
    pub fn lenient() -> Self {
        Self::new(Duration::from_secs(60), 300)
    }

    /// 5 requests per 15 minutes - credential endpoints, brute-force guard.
    pub fn auth() -> Self {
        Self::new(Duration::from_secs(15 * 60), 5)
    }

    /// 30 requests per minute - query-heavy search endpoints.
    pub fn search() -> Self {
        Self::new(Duration::from_secs(60), 30)
    }

    /// 10 requests per 10 minutes - large payload ingestion.
    pub fn upload() -> Self {
        Self::new(Duration::from_secs(10 * 60), 10)
    }

    pub fn with_key(mut self, key: RateLimitKey) -> Self {
        self.key = key;
        self
    }

    pub fn on_limit(mut self, hook: LimitHook) -> Self {
        self.on_limit = Some(hook);
        self
    }

    pub fn with_trusted_proxies(mut self, trusted: TrustedProxies) -> Self {
        self.trusted_proxies = trusted;
        self
    }

    /// Derive the counter key for a request.
    pub fn derive_key(&self, req: &Request<Body>) -> String {
        match &self.key {
            RateLimitKey::IpMethodPath => {
                let ip = client_ip(req, &self.trusted_proxies);
                format!("{}:{}:{}", ip, req.method(), req.uri().path())
            }
            RateLimitKey::UserId => match req.identity() {
                Some(identity) => format!("user:{}", identity.user_id),
                None => format!("ip:{}", client_ip(req, &self.trusted_proxies)),
            },
            RateLimitKey::Custom(f) => f(req),
        }
    }
}

/// Rate limiting layer for the pipeline stack.
#[derive(Clone)]
pub struct RateLimitLayer {
    policy: Arc<RateLimitPolicy>,
    store: Arc<RateLimitStore>,
}

impl RateLimitLayer {
    pub fn new(policy: RateLimitPolicy, store: Arc<RateLimitStore>) -> Self {
        Self {
            policy: Arc::new(policy),
            store,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            policy: self.policy.clone(),
            store: self.store.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    policy: Arc<RateLimitPolicy>,
    store: Arc<RateLimitStore>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ApiError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = ApiError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let policy = self.policy.clone();
        let store = self.store.clone();
        let mut inner = self.inner.clone();

        let key = policy.derive_key(&req);
        let decision = store.hit(&key, policy.window, policy.max_requests);

        Box::pin(async move {
            if decision.allowed {
                let mut response = inner.call(req).await?;
                set_rate_limit_headers(&mut response, &decision.info);
                return Ok(response);
            }

            warn!(
                key = %key,
                limit = decision.info.limit,
                total_hits = decision.info.total_hits,
                "Rate limit exceeded"
            );
            metrics::record_short_circuit("rate_limit");

            let mut response = match &policy.on_limit {
                Some(hook) => hook(&decision.info),
                None => limit_exceeded_response(),
            };
            set_rate_limit_headers(&mut response, &decision.info);
            response.headers_mut().insert(
                "retry-after",
                HeaderValue::from(reset_secs(&decision.info)),
            );

            Ok(response)
        })
    }
}

/// Seconds until the window resets, rounded up so callers never retry early.
fn reset_secs(info: &RateLimitInfo) -> u64 {
    let secs = info.reset_after.as_secs();
    if info.reset_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

fn set_rate_limit_headers(response: &mut Response<Body>, info: &RateLimitInfo) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(info.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(info.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_secs(info)));
    headers.insert("x-ratelimit-used", HeaderValue::from(info.total_hits));
}

/// Canonical 429 response.
fn limit_exceeded_response() -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(ErrorBody::new(
            "Rate limit exceeded. Please retry later.".to_string(),
            None,
        )),
    )
        .into_response()
}
