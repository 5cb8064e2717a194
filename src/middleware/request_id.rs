//! Request ID propagation for log correlation.
//!
//! Runs outside the composed pipeline, at the host router level: incoming
//! `X-Request-Id` headers are propagated, missing ones are minted as UUIDv4.
//! The id is written onto the request (so the error normalizer can log it)
//! and onto the response (so callers can correlate).

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Fallback header value when an inherited id is not valid header text.
static UNKNOWN_REQUEST_ID: HeaderValue = HeaderValue::from_static("unknown");

/// Request ID layer for the host middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = extract_or_generate(&req);
        let header_value = request_id
            .parse()
            .unwrap_or_else(|_| UNKNOWN_REQUEST_ID.clone());

        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
            Ok(response)
        })
    }
}

/// Propagate an existing id or mint a fresh UUIDv4.
fn extract_or_generate<B>(req: &Request<B>) -> String {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = value.to_str()
        && !value.is_empty()
    {
        return value.to_string();
    }

    Uuid::new_v4().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use tower::ServiceExt;
    use tower::service_fn;

    #[test]
    fn test_existing_id_is_propagated() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_or_generate(&req), "existing-id-123");
    }

    #[test]
    fn test_missing_id_is_generated() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert!(Uuid::parse_str(&extract_or_generate(&req)).is_ok());
    }

    #[tokio::test]
    async fn test_response_carries_the_id() {
        let service = RequestIdLayer::new().layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, ApiError>(Response::new(Body::empty()))
        }));

        let request = Request::builder()
            .header("x-request-id", "corr-1")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-request-id"], "corr-1");
    }
}
