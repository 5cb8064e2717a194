//! CORS negotiation and baseline security headers.
//!
//! Hand-rolled rather than `tower_http::cors` because the origin decision
//! here is request-dependent in a way that layer cannot express: an origin
//! is echoed (with credentials) when it is allow-listed, when the request
//! carries or asks for an `Authorization` header, or - with no allow-list
//! configured - when it is a loopback origin. Everything else degrades to
//! `Access-Control-Allow-Origin: *` without credentials. The wildcard and
//! credentials are never combined; the two are mutually exclusive in the
//! underlying HTTP semantics.
//!
//! `OPTIONS` requests are always treated as preflights and short-circuit
//! before any inner layer runs.
//!
//! The response side also applies baseline hardening headers
//! (`X-Content-Type-Options`, `X-Frame-Options`, `X-XSS-Protection`,
//! `Referrer-Policy`) regardless of the CORS outcome.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderValue};
use axum::http::{Method, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::debug;

use crate::context::RequestMeta;
use crate::error::ApiError;
use crate::metrics;

/// Composition-time CORS configuration.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    /// Origins echoed with credentials. Empty enables the loopback fallback.
    pub allowed_origins: HashSet<String>,
    pub allowed_methods: Vec<Method>,
    pub allowed_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    /// Whether echoed origins are granted `Allow-Credentials: true`.
    pub allow_credentials: bool,
    pub max_age: Duration,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allowed_origins: HashSet::new(),
            allowed_methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ],
            allowed_headers: vec![
                "content-type".to_string(),
                "authorization".to_string(),
                "x-requested-with".to_string(),
            ],
            expose_headers: vec![
                "x-request-id".to_string(),
                "x-ratelimit-limit".to_string(),
                "x-ratelimit-remaining".to_string(),
                "x-ratelimit-reset".to_string(),
            ],
            allow_credentials: true,
            max_age: Duration::from_secs(86_400),
        }
    }
}

impl CorsPolicy {
    /// Policy with an explicit origin allow-list.
    pub fn with_origins<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_origins: origins.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// How the allow-origin header is produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginDecision {
    /// Echo the caller's exact origin, optionally with credentials.
    Echo(String),
    /// `*`, never combined with credentials.
    Wildcard,
}

/// Stateless CORS decision engine, shared by the layer and the error
/// normalizer (which must re-apply headers on the error path).
#[derive(Debug, Clone)]
pub struct CorsNegotiator {
    policy: CorsPolicy,
}

impl CorsNegotiator {
    pub fn new(policy: CorsPolicy) -> Self {
        Self { policy }
    }

    fn origin_decision(&self, meta: &RequestMeta) -> OriginDecision {
        match &meta.origin {
            Some(origin)
                if self.policy.allowed_origins.contains(origin)
                    || meta.has_authorization
                    || (self.policy.allowed_origins.is_empty() && is_loopback_origin(origin)) =>
            {
                OriginDecision::Echo(origin.clone())
            }
            _ => OriginDecision::Wildcard,
        }
    }

    /// Build the preflight response: requested method/headers are echoed
    /// when present, the policy allow-lists are the fallback.
    pub fn preflight_response(&self, meta: &RequestMeta) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;

        let methods = match &meta.acr_method {
            Some(requested) => requested.clone(),
            None => self.methods_header(),
        };
        let headers_value = match &meta.acr_headers {
            Some(requested) => requested.clone(),
            None => self.policy.allowed_headers.join(", "),
        };

        insert_str(
            &mut response,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            &methods,
        );
        insert_str(
            &mut response,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            &headers_value,
        );
        response.headers_mut().insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from(self.policy.max_age.as_secs()),
        );

        self.apply_origin(meta, &mut response);
        apply_security_headers(&mut response);
        response
    }

    /// Apply response-side CORS headers plus the hardening baseline. Runs
    /// on every non-preflight response leaving the pipeline, errors
    /// included.
    pub fn apply_headers(&self, meta: &RequestMeta, response: &mut Response<Body>) {
        insert_str(
            response,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            &self.methods_header(),
        );
        if !self.policy.expose_headers.is_empty() {
            insert_str(
                response,
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                &self.policy.expose_headers.join(", "),
            );
        }

        self.apply_origin(meta, response);
        apply_security_headers(response);
    }

    fn apply_origin(&self, meta: &RequestMeta, response: &mut Response<Body>) {
        match self.origin_decision(meta) {
            OriginDecision::Echo(origin) => {
                insert_str(response, header::ACCESS_CONTROL_ALLOW_ORIGIN, &origin);
                if self.policy.allow_credentials {
                    response.headers_mut().insert(
                        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                        HeaderValue::from_static("true"),
                    );
                }
                // Origin-specific response: tell caches not to reuse it
                response
                    .headers_mut()
                    .append(header::VARY, HeaderValue::from_static("Origin"));
                response.headers_mut().append(
                    header::VARY,
                    HeaderValue::from_static("Access-Control-Request-Headers"),
                );
            }
            OriginDecision::Wildcard => {
                response.headers_mut().insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
            }
        }
    }

    fn methods_header(&self) -> String {
        self.policy
            .allowed_methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Insert a dynamically-built header value, skipping values that are not
/// valid header text (origins arrive pre-validated, so this is a formality).
fn insert_str(response: &mut Response<Body>, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn apply_security_headers(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

/// Loopback origins accepted by the no-allow-list fallback.
fn is_loopback_origin(origin: &str) -> bool {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"));
    let Some(rest) = rest else {
        return false;
    };

    let host = rest.split(':').next().unwrap_or(rest);
    host == "localhost" || host == "127.0.0.1" || host == "[::1]"
}

/// CORS layer for the pipeline stack.
#[derive(Clone)]
pub struct CorsLayer {
    negotiator: Arc<CorsNegotiator>,
}

impl CorsLayer {
    pub fn new(negotiator: Arc<CorsNegotiator>) -> Self {
        Self { negotiator }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsService {
            inner,
            negotiator: self.negotiator.clone(),
        }
    }
}

/// CORS service wrapper.
#[derive(Clone)]
pub struct CorsService<S> {
    inner: S,
    negotiator: Arc<CorsNegotiator>,
}

impl<S> Service<Request<Body>> for CorsService<S>
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
        let negotiator = self.negotiator.clone();
        let mut inner = self.inner.clone();
        let meta = RequestMeta::capture(&req);

        Box::pin(async move {
            if meta.method == Method::OPTIONS {
                debug!(path = %meta.path, "Answering CORS preflight");
                metrics::record_short_circuit("cors_preflight");
                return Ok(negotiator.preflight_response(&meta));
            }

            // Errors unwind past this layer; the normalizer re-applies the
            // same negotiation on the error path
            let mut response = inner.call(req).await?;
            negotiator.apply_headers(&meta, &mut response);
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tower::ServiceExt;
    use tower::service_fn;

    fn negotiator(policy: CorsPolicy) -> CorsNegotiator {
        CorsNegotiator::new(policy)
    }

    fn meta_for(req: Request<Body>) -> RequestMeta {
        RequestMeta::capture(&req)
    }

    fn get_with_origin(origin: &str) -> RequestMeta {
        meta_for(
            Request::builder()
                .uri("/items")
                .header("origin", origin)
                .body(Body::empty())
                .unwrap(),
        )
    }

    #[test]
    fn test_allow_listed_origin_is_echoed_with_credentials() {
        let negotiator = negotiator(CorsPolicy::with_origins(["https://app.example.com"]));
        let mut response = Response::new(Body::empty());

        negotiator.apply_headers(&get_with_origin("https://app.example.com"), &mut response);

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );
        let vary: Vec<_> = response.headers().get_all(header::VARY).iter().collect();
        assert_eq!(vary.len(), 2);
    }

    #[test]
    fn test_unlisted_origin_gets_wildcard_without_credentials() {
        let negotiator = negotiator(CorsPolicy::with_origins(["https://app.example.com"]));
        let mut response = Response::new(Body::empty());

        negotiator.apply_headers(&get_with_origin("https://evil.example.com"), &mut response);

        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(
            !response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_CREDENTIALS)
        );
    }

    #[test]
    fn test_authorization_header_forces_echo() {
        let negotiator = negotiator(CorsPolicy::with_origins(["https://app.example.com"]));
        let meta = meta_for(
            Request::builder()
                .uri("/items")
                .header("origin", "https://other.example.com")
                .header("authorization", "Bearer tok")
                .body(Body::empty())
                .unwrap(),
        );

        let mut response = Response::new(Body::empty());
        negotiator.apply_headers(&meta, &mut response);

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://other.example.com"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );
    }

    #[test]
    fn test_loopback_fallback_without_allow_list() {
        let negotiator = negotiator(CorsPolicy::default());
        let mut response = Response::new(Body::empty());

        negotiator.apply_headers(&get_with_origin("http://localhost:5173"), &mut response);

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[test]
    fn test_no_origin_gets_wildcard_and_methods() {
        let negotiator = negotiator(CorsPolicy::default());
        let meta = meta_for(Request::builder().uri("/items").body(Body::empty()).unwrap());

        let mut response = Response::new(Body::empty());
        negotiator.apply_headers(&meta, &mut response);

        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(
            response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS)
        );
    }

    #[test]
    fn test_security_headers_always_present() {
        let negotiator = negotiator(CorsPolicy::default());
        let meta = meta_for(Request::builder().uri("/items").body(Body::empty()).unwrap());

        let mut response = Response::new(Body::empty());
        negotiator.apply_headers(&meta, &mut response);

        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(response.headers()[header::X_XSS_PROTECTION], "1; mode=block");
        assert_eq!(
            response.headers()[header::REFERRER_POLICY],
            "strict-origin-when-cross-origin"
        );
    }

    #[test]
    fn test_preflight_echoes_requested_method_and_headers() {
        let negotiator = negotiator(CorsPolicy::default());
        let meta = meta_for(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/items")
                .header("origin", "http://localhost:3000")
                .header("access-control-request-method", "DELETE")
                .header("access-control-request-headers", "x-custom-header")
                .body(Body::empty())
                .unwrap(),
        );

        let response = negotiator.preflight_response(&meta);

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "DELETE"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "x-custom-header"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[test]
    fn test_preflight_falls_back_to_policy_lists() {
        let negotiator = negotiator(CorsPolicy::default());
        let meta = meta_for(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/items")
                .body(Body::empty())
                .unwrap(),
        );

        let response = negotiator.preflight_response(&meta);

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, PUT, PATCH, DELETE, OPTIONS"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "content-type, authorization, x-requested-with"
        );
    }

    #[test]
    fn test_is_loopback_origin() {
        assert!(is_loopback_origin("http://localhost"));
        assert!(is_loopback_origin("http://localhost:5173"));
        assert!(is_loopback_origin("https://127.0.0.1:8443"));
        assert!(!is_loopback_origin("https://app.example.com"));
        assert!(!is_loopback_origin("localhost")); // no scheme
        assert!(!is_loopback_origin("http://localhost.evil.com"));
    }

    #[tokio::test]
    async fn test_layer_short_circuits_preflight() {
        let negotiator = Arc::new(CorsNegotiator::new(CorsPolicy::default()));
        let service = CorsLayer::new(negotiator).layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, ApiError>(Response::new(Body::from("handler ran")))
        }));

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/items")
            .header("origin", "http://localhost:3000")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(bytes.is_empty(), "preflight must not reach the handler");
    }

    #[tokio::test]
    async fn test_layer_applies_headers_to_handler_response() {
        let negotiator = Arc::new(CorsNegotiator::new(CorsPolicy::default()));
        let service = CorsLayer::new(negotiator).layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, ApiError>(Response::new(Body::from("ok")))
        }));

        let request = Request::builder()
            .uri("/items")
            .header("origin", "https://app.example.com")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();

        // Unlisted, no auth: wildcard
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
    }
}
