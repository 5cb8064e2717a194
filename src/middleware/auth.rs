//! Caller identity resolution middleware.
//!
//! Identity comes from an external [`IdentityResolver`] capability - the
//! pipeline never inspects raw credentials itself. The resolver is called
//! exactly once per request and never retried; resolution failures are
//! logged and treated as "anonymous", not as errors.
//!
//! # Development Fallback
//!
//! With `dev_fallback_identity` configured and the process in development
//! mode, requests without a resolvable identity are attributed to the
//! fallback user. The fallback is ignored outright in production mode, no
//! matter what the policy says.
//!
//! # Admin Restriction
//!
//! `admin_user_ids` is explicit: `None` disables the admin check entirely,
//! `Some(set)` admits only listed users - an empty set admits nobody.
//! Unauthenticated callers are rejected with 401 before the admin check
//! runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::Mode;
use crate::context::{Identity, IdentitySlot};
use crate::error::{ApiError, ErrorBody};
use crate::metrics;

/// External identity-verification capability.
///
/// Implementations map a request to a user id, typically by validating a
/// bearer token against an identity provider. Returning `Ok(None)` means
/// "no identity"; returning `Err` is treated the same way by the pipeline,
/// after logging.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, req: &Request<Body>) -> anyhow::Result<Option<String>>;
}

/// Hook substituting the canonical 401 response.
pub type UnauthorizedHook = Arc<dyn Fn() -> Response<Body> + Send + Sync>;

/// Composition-time authentication configuration.
#[derive(Clone, Default)]
pub struct AuthPolicy {
    pub require_auth: bool,
    pub dev_fallback_identity: Option<String>,
    pub admin_user_ids: Option<HashSet<String>>,
    pub unauthorized_response: Option<UnauthorizedHook>,
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("require_auth", &self.require_auth)
            .field("dev_fallback_identity", &self.dev_fallback_identity)
            .field("admin_user_ids", &self.admin_user_ids)
            .field("unauthorized_response", &self.unauthorized_response.is_some())
            .finish()
    }
}

impl AuthPolicy {
    /// Anonymous access allowed; identity still resolved when present.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Identity required; unauthenticated callers get 401.
    pub fn required() -> Self {
        Self {
            require_auth: true,
            ..Self::default()
        }
    }

    /// Identity required and restricted to the given admin users.
    pub fn admin<I, S>(admin_user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            require_auth: true,
            admin_user_ids: Some(admin_user_ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_dev_fallback(mut self, user_id: impl Into<String>) -> Self {
        self.dev_fallback_identity = Some(user_id.into());
        self
    }

    pub fn with_unauthorized_response(mut self, hook: UnauthorizedHook) -> Self {
        self.unauthorized_response = Some(hook);
        self
    }
}

/// Authentication layer for the pipeline stack.
#[derive(Clone)]
pub struct AuthLayer {
    policy: Arc<AuthPolicy>,
    resolver: Arc<dyn IdentityResolver>,
    mode: Mode,
}

impl AuthLayer {
    pub fn new(policy: AuthPolicy, resolver: Arc<dyn IdentityResolver>, mode: Mode) -> Self {
        Self {
            policy: Arc::new(policy),
            resolver,
            mode,
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            policy: self.policy.clone(),
            resolver: self.resolver.clone(),
            mode: self.mode,
        }
    }
}

/// Authentication service wrapper.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    policy: Arc<AuthPolicy>,
    resolver: Arc<dyn IdentityResolver>,
    mode: Mode,
}

impl<S> Service<Request<Body>> for AuthService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let policy = self.policy.clone();
        let resolver = self.resolver.clone();
        let mode = self.mode;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Single resolution; a failing capability is an anonymous caller
            let resolved = match resolver.resolve(&req).await {
                Ok(user_id) => user_id,
                Err(err) => {
                    warn!(error = %err, "Identity resolution failed, treating caller as anonymous");
                    None
                }
            };

            let identity = match resolved {
                Some(user_id) => Some(Identity::new(user_id)),
                None => match (&policy.dev_fallback_identity, mode) {
                    (Some(fallback), Mode::Development) => {
                        debug!(user_id = %fallback, "Using development fallback identity");
                        Some(Identity::new(fallback.clone()))
                    }
                    _ => None,
                },
            };

            let Some(identity) = identity else {
                if policy.require_auth {
                    warn!(path = %req.uri().path(), "Rejecting unauthenticated request");
                    metrics::record_short_circuit("auth");
                    let response = match &policy.unauthorized_response {
                        Some(hook) => hook(),
                        None => unauthorized_response(),
                    };
                    return Ok(response);
                }
                return inner.call(req).await;
            };

            // Make the identity visible to the error normalizer even if an
            // inner layer fails after this point
            if let Some(slot) = req.extensions().get::<IdentitySlot>() {
                slot.fill(identity.clone());
            }

            if let Some(admins) = &policy.admin_user_ids
                && !admins.contains(&identity.user_id)
            {
                warn!(user_id = %identity.user_id, path = %req.uri().path(), "Admin access denied");
                metrics::record_short_circuit("auth");
                return Err(ApiError::admin_required());
            }

            req.extensions_mut().insert(identity);
            inner.call(req).await
        })
    }
}

/// Canonical 401 response.
fn unauthorized_response() -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        axum::Json(ErrorBody::new("Authentication required".to_string(), None)),
    )
        .into_response()
}

/// Static bearer-token resolver.
///
/// Maps configured tokens to user ids with constant-time comparison, so
/// response timing does not leak token prefixes. Suitable for the demo
/// server and tests; real deployments plug in their identity provider.
pub struct BearerTokenResolver {
    tokens: HashMap<String, String>,
}

impl BearerTokenResolver {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Single token convenience constructor.
    pub fn single(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.into(), user_id.into());
        Self { tokens }
    }
}

// Hand-written in the form `#[async_trait]` desugars to, rather than using
// the macro, so the bearer token can be extracted from `req` *before* the
// boxed future is constructed. `Request<Body>` is `Send` but not `Sync`, so a
// `&Request<Body>` captured inside the (required `Send`) future would make it
// `!Send`; hoisting the borrow out keeps only the owned token in the future.
// Behaviour is identical to the straightforward `async fn` body.
impl IdentityResolver for BearerTokenResolver {
    fn resolve<'life0, 'life1, 'async_trait>(
        &'life0 self,
        req: &'life1 Request<Body>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        let token = extract_bearer_token(req).map(str::to_owned);
        Box::pin(async move {
            let Some(token) = token else {
                return Ok(None);
            };

            for (expected, user_id) in &self.tokens {
                if constant_time_eq(&token, expected) {
                    return Ok(Some(user_id.clone()));
                }
            }

            Ok(None)
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
fn extract_bearer_token<B>(req: &Request<B>) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Constant-time string comparison, preventing timing attacks on token
/// validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::IdentityExt;
    use tower::ServiceExt;
    use tower::service_fn;

    /// Inner service that reports whether an identity was attached.
    fn identity_probe()
    -> impl Service<Request<Body>, Response = Response<Body>, Error = ApiError, Future: Send> + Clone + Send + 'static {
        service_fn(|req: Request<Body>| async move {
            let body = match req.identity() {
                Some(identity) => identity.user_id.clone(),
                None => "anonymous".to_string(),
            };
            Ok::<_, ApiError>(Response::new(Body::from(body)))
        })
    }

    struct FailingResolver;

    #[async_trait]
    impl IdentityResolver for FailingResolver {
        async fn resolve(&self, _req: &Request<Body>) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("identity provider unreachable"))
        }
    }

    fn bearer_request(token: &str) -> Request<Body> {
        Request::builder()
            .uri("/items")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn anonymous_request() -> Request<Body> {
        Request::builder().uri("/items").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_resolved_identity_reaches_handler() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let layer = AuthLayer::new(AuthPolicy::required(), resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(bearer_request("tok-1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"u1");
    }

    #[tokio::test]
    async fn test_missing_identity_gets_401() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let layer = AuthLayer::new(AuthPolicy::required(), resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(anonymous_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Bearer");
    }

    #[tokio::test]
    async fn test_custom_unauthorized_response() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let policy = AuthPolicy::required().with_unauthorized_response(Arc::new(|| {
            (StatusCode::UNAUTHORIZED, "token please").into_response()
        }));
        let layer = AuthLayer::new(policy, resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(anonymous_request())
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"token please");
    }

    #[tokio::test]
    async fn test_dev_fallback_applies_in_development() {
        let resolver = Arc::new(BearerTokenResolver::new(HashMap::new()));
        let policy = AuthPolicy::required().with_dev_fallback("dev-user-123");
        let layer = AuthLayer::new(policy, resolver, Mode::Development);

        let response = layer
            .layer(identity_probe())
            .oneshot(anonymous_request())
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"dev-user-123");
    }

    #[tokio::test]
    async fn test_dev_fallback_ignored_in_production() {
        let resolver = Arc::new(BearerTokenResolver::new(HashMap::new()));
        let policy = AuthPolicy::required().with_dev_fallback("dev-user-123");
        let layer = AuthLayer::new(policy, resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(anonymous_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_anonymous_passthrough_without_require() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let layer = AuthLayer::new(AuthPolicy::anonymous(), resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(anonymous_request())
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"anonymous");
    }

    #[tokio::test]
    async fn test_resolver_failure_is_anonymous() {
        let layer = AuthLayer::new(
            AuthPolicy::anonymous(),
            Arc::new(FailingResolver),
            Mode::Production,
        );

        let response = layer
            .layer(identity_probe())
            .oneshot(bearer_request("whatever"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"anonymous");
    }

    #[tokio::test]
    async fn test_admin_allow_list_rejects_non_member() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-2", "u2"));
        let layer = AuthLayer::new(AuthPolicy::admin(["u1"]), resolver, Mode::Production);

        let err = layer
            .layer(identity_probe())
            .oneshot(bearer_request("tok-2"))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.client_message(), "Admin access required");
    }

    #[tokio::test]
    async fn test_admin_allow_list_admits_member() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let layer = AuthLayer::new(AuthPolicy::admin(["u1"]), resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(bearer_request("tok-1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_unauthenticated_gets_401_not_403() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let layer = AuthLayer::new(AuthPolicy::admin(["u1"]), resolver, Mode::Production);

        let response = layer
            .layer(identity_probe())
            .oneshot(anonymous_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_admin_set_denies_everyone() {
        let resolver = Arc::new(BearerTokenResolver::single("tok-1", "u1"));
        let layer = AuthLayer::new(
            AuthPolicy::admin(Vec::<String>::new()),
            resolver,
            Mode::Production,
        );

        let err = layer
            .layer(identity_probe())
            .oneshot(bearer_request("tok-1"))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token(&bearer_request("abc")), Some("abc"));
        assert_eq!(extract_bearer_token(&anonymous_request()), None);

        let basic = Request::builder()
            .header("authorization", "Basic dXNlcjpwYXNz")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&basic), None);

        let empty = Request::builder()
            .header("authorization", "Bearer   ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&empty), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret123", "secret123"));
        assert!(!constant_time_eq("secret123", "secret456"));
        assert!(!constant_time_eq("short", "much-longer-string"));
    }
}
