//! Error normalization - the outermost pipeline layer.
//!
//! Wraps the entire composed chain and never fails itself: every
//! [`ApiError`] raised by an inner layer or the terminal handler is caught
//! here exactly once, logged exactly once with full request context, and
//! converted to the canonical `{error, details?, timestamp}` response shape.
//!
//! Failures unwind past the CORS layer without running its response step,
//! so this layer re-applies CORS negotiation to every error response - the
//! invariant that responses leaving the composer always carry correct CORS
//! headers holds on the error path too.
//!
//! `include_details` gates whether error internals (source-chain text)
//! appear in response bodies; production compositions keep it off so
//! internals never leak to callers. Validation field breakdowns are always
//! included regardless - they are the caller's own input.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::error;

use crate::context::{IdentitySlot, RequestMeta};
use crate::error::{ApiError, ErrorBody, ErrorKind};
use crate::metrics;
use crate::middleware::cors::CorsNegotiator;

/// Per-kind response override.
#[derive(Debug, Clone, Default)]
pub struct ErrorOverride {
    pub status: Option<StatusCode>,
    pub message: Option<String>,
    pub include_details: Option<bool>,
}

/// Composition-time error handling configuration.
#[derive(Debug, Clone)]
pub struct ErrorPolicy {
    pub log_errors: bool,
    /// Expose non-validation error details to callers. Keep off in
    /// production.
    pub include_details: bool,
    pub overrides: HashMap<ErrorKind, ErrorOverride>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            log_errors: true,
            include_details: false,
            overrides: HashMap::new(),
        }
    }
}

impl ErrorPolicy {
    /// Verbose variant for local development.
    pub fn development() -> Self {
        Self {
            include_details: true,
            ..Self::default()
        }
    }

    /// Locked-down variant: generic messages, no detail leakage.
    pub fn production() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, kind: ErrorKind, replacement: ErrorOverride) -> Self {
        self.overrides.insert(kind, replacement);
        self
    }
}

/// Error normalization layer for the pipeline stack.
#[derive(Clone)]
pub struct NormalizeLayer {
    policy: Arc<ErrorPolicy>,
    negotiator: Arc<CorsNegotiator>,
}

impl NormalizeLayer {
    pub fn new(policy: ErrorPolicy, negotiator: Arc<CorsNegotiator>) -> Self {
        Self {
            policy: Arc::new(policy),
            negotiator,
        }
    }
}

impl<S> Layer<S> for NormalizeLayer {
    type Service = NormalizeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        NormalizeService {
            inner,
            policy: self.policy.clone(),
            negotiator: self.negotiator.clone(),
        }
    }
}

/// Error normalization service wrapper.
#[derive(Clone)]
pub struct NormalizeService<S> {
    inner: S,
    policy: Arc<ErrorPolicy>,
    negotiator: Arc<CorsNegotiator>,
}

impl<S> Service<Request<Body>> for NormalizeService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = ApiError> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The inner stack is clone-per-call and always ready; failures
        // surface through `call`, never through readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let policy = self.policy.clone();
        let negotiator = self.negotiator.clone();
        let mut inner = self.inner.clone();

        let meta = RequestMeta::capture(&req);
        // Plant the slot so the auth layer can report the resolved identity
        // back to this layer even when the request fails deeper in the stack
        let slot = IdentitySlot::new();
        req.extensions_mut().insert(slot.clone());

        let started = Instant::now();

        Box::pin(async move {
            let response = match inner.call(req).await {
                Ok(response) => response,
                Err(err) => {
                    let mut response = normalize(&err, &meta, &slot, &policy);
                    // The error unwound past the CORS layer; keep the
                    // headers invariant intact on this path as well
                    negotiator.apply_headers(&meta, &mut response);
                    response
                }
            };

            metrics::record_request(meta.method.as_str(), response.status().as_u16());
            metrics::record_request_duration(started.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

/// Convert a caught error into the canonical response, logging it once.
fn normalize(
    err: &ApiError,
    meta: &RequestMeta,
    slot: &IdentitySlot,
    policy: &ErrorPolicy,
) -> Response<Body> {
    let kind = err.kind();
    let replacement = policy.overrides.get(&kind);

    let status = replacement
        .and_then(|r| r.status)
        .unwrap_or_else(|| err.status_code());
    let message = replacement
        .and_then(|r| r.message.clone())
        .unwrap_or_else(|| err.client_message());
    let include_details = replacement
        .and_then(|r| r.include_details)
        .unwrap_or(policy.include_details);

    if policy.log_errors {
        error!(
            kind = kind.as_str(),
            status = status.as_u16(),
            method = %meta.method,
            path = %meta.path,
            origin = meta.origin.as_deref().unwrap_or("-"),
            user_agent = meta.user_agent.as_deref().unwrap_or("-"),
            request_id = meta.request_id.as_deref().unwrap_or("-"),
            user_id = slot.get().map(|i| i.user_id.as_str()).unwrap_or("-"),
            error = %err,
            "Request failed"
        );
    }
    metrics::record_error(kind.as_str());

    let mut response = (
        status,
        axum::Json(ErrorBody::new(message, err.details_value(include_details))),
    )
        .into_response();

    if let ApiError::RateLimited {
        retry_after_secs, ..
    } = err
    {
        response.headers_mut().insert(
            "retry-after",
            axum::http::HeaderValue::from(*retry_after_secs),
        );
    }

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::cors::CorsPolicy;
    use axum::http::header;
    use serde_json::Value;
    use tower::ServiceExt;
    use tower::service_fn;

    fn layer(policy: ErrorPolicy) -> NormalizeLayer {
        NormalizeLayer::new(
            policy,
            Arc::new(CorsNegotiator::new(CorsPolicy::default())),
        )
    }

    fn failing_service(
        err: fn() -> ApiError,
    ) -> impl Service<Request<Body>, Response = Response<Body>, Error = ApiError, Future: Send> + Clone + Send + 'static {
        service_fn(move |_req: Request<Body>| async move { Err::<Response<Body>, _>(err()) })
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ok_responses_pass_through() {
        let service = layer(ErrorPolicy::default()).layer(service_fn(
            |_req: Request<Body>| async { Ok::<_, ApiError>(Response::new(Body::from("ok"))) },
        ));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_not_found_is_normalized() {
        let service = layer(ErrorPolicy::default())
            .layer(failing_service(|| ApiError::NotFound("item not found".to_string())));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "item not found");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_error_path_still_gets_cors_headers() {
        let service = layer(ErrorPolicy::default())
            .layer(failing_service(|| ApiError::NotFound("nope".to_string())));

        let request = Request::builder()
            .uri("/x")
            .header("origin", "http://localhost:3000")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert!(
            response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS)
        );
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
    }

    #[tokio::test]
    async fn test_internal_error_is_sanitized_by_default() {
        let service = layer(ErrorPolicy::production()).layer(failing_service(|| {
            ApiError::Internal(anyhow::anyhow!("secret connection string"))
        }));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn test_development_policy_includes_details() {
        let service = layer(ErrorPolicy::development()).layer(failing_service(|| {
            ApiError::Internal(anyhow::anyhow!("root cause here"))
        }));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert!(json["details"].as_str().unwrap().contains("root cause here"));
    }

    #[tokio::test]
    async fn test_override_replaces_status_and_message() {
        let policy = ErrorPolicy::default().with_override(
            ErrorKind::NotFound,
            ErrorOverride {
                status: Some(StatusCode::GONE),
                message: Some("it is gone".to_string()),
                include_details: None,
            },
        );
        let service =
            layer(policy).layer(failing_service(|| ApiError::NotFound("x".to_string())));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GONE);
        let json = body_json(response).await;
        assert_eq!(json["error"], "it is gone");
    }

    #[tokio::test]
    async fn test_rate_limited_error_sets_retry_after() {
        let service = layer(ErrorPolicy::default()).layer(failing_service(|| {
            ApiError::RateLimited {
                message: "upstream rate limit".to_string(),
                retry_after_secs: 7,
            }
        }));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "7");
    }

    #[tokio::test]
    async fn test_validation_details_survive_production_policy() {
        let service = layer(ErrorPolicy::production()).layer(failing_service(|| {
            ApiError::validation(vec![crate::schema::FieldError::new(
                "name",
                vec!["is required".to_string()],
            )])
        }));

        let response = service
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["details"][0]["field"], "name");
    }
}
