//! Per-request context threaded through the pipeline.
//!
//! Each inbound call gets a fresh context; nothing here outlives the request
//! or is shared across requests. Values travel in `http::Extensions`:
//!
//! - [`Identity`] - written once by the auth layer, read-only downstream
//! - [`Validated`] - written once by the validation layer, immutable after
//! - [`PathParams`] - supplied by the host router adapter, read by validation
//! - [`IdentitySlot`] - a shared slot the error normalizer plants so the
//!   resolved identity survives the error path (the request itself is
//!   consumed by inner layers and cannot be read back after a failure)
//!
//! [`RequestMeta`] is the immutable snapshot of request facts (origin,
//! method, header presence) the CORS negotiator and the normalizer need
//! after the request has been moved into inner services.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use axum::http::{Method, Request, header};

/// The resolved caller identity, or absent for anonymous callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Typed data produced by the validation layer.
///
/// Each target is present only if a schema was configured for it. Handlers
/// only ever see validated, typed values for fields that had a schema.
#[derive(Debug, Clone, Default)]
pub struct Validated {
    pub body: Option<serde_json::Value>,
    pub query: Option<serde_json::Value>,
    pub params: Option<serde_json::Value>,
}

/// Raw path parameters supplied by the host router.
///
/// The pipeline is router-agnostic; an adapter (or test) inserts this
/// extension before the composed handler runs. Absent extension means an
/// empty parameter map.
#[derive(Debug, Clone, Default)]
pub struct PathParams(pub HashMap<String, String>);

/// Write-once identity slot planted by the error normalizer.
///
/// The auth layer fills it when it resolves a caller, so error logs can
/// include the identity even though the failing request was consumed deeper
/// in the stack. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct IdentitySlot(Arc<OnceLock<Identity>>);

impl IdentitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the resolved identity. Later calls are no-ops; the first
    /// resolution wins, matching the single-resolution contract.
    pub fn fill(&self, identity: Identity) {
        let _ = self.0.set(identity);
    }

    pub fn get(&self) -> Option<&Identity> {
        self.0.get()
    }
}

/// Immutable request facts captured before the request is consumed.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub origin: Option<String>,
    /// The request carries an `Authorization` header, or its CORS preflight
    /// asks for one via `Access-Control-Request-Headers`.
    pub has_authorization: bool,
    pub acr_method: Option<String>,
    pub acr_headers: Option<String>,
    pub user_agent: Option<String>,
    /// Correlation id, present when the host stack runs the request-id
    /// layer outside the pipeline.
    pub request_id: Option<String>,
}

impl RequestMeta {
    /// Snapshot the facts the outer layers need after the request moves on.
    pub fn capture<B>(req: &Request<B>) -> Self {
        let header_str = |name: header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        let acr_headers = header_str(header::ACCESS_CONTROL_REQUEST_HEADERS);
        let has_authorization = req.headers().contains_key(header::AUTHORIZATION)
            || acr_headers
                .as_deref()
                .is_some_and(|h| h.to_ascii_lowercase().contains("authorization"));

        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            origin: header_str(header::ORIGIN),
            has_authorization,
            acr_method: header_str(header::ACCESS_CONTROL_REQUEST_METHOD),
            acr_headers,
            user_agent: header_str(header::USER_AGENT),
            request_id: req
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
        }
    }
}

/// Accessor for the resolved identity on a request.
pub trait IdentityExt {
    fn identity(&self) -> Option<&Identity>;
}

impl<B> IdentityExt for Request<B> {
    fn identity(&self) -> Option<&Identity> {
        self.extensions().get::<Identity>()
    }
}

/// Accessor for validated request data.
pub trait ValidatedExt {
    fn validated(&self) -> Option<&Validated>;
}

impl<B> ValidatedExt for Request<B> {
    fn validated(&self) -> Option<&Validated> {
        self.extensions().get::<Validated>()
    }
}
