//! Request validation middleware.
//!
//! Validates up to three independent targets - body, query string and path
//! parameters - each against its own optional [`ObjectSchema`]. All targets
//! are checked even when an earlier one fails, and every failure is
//! collected into a single 400 response, so callers fix their whole request
//! in one round trip instead of resubmitting field by field.
//!
//! The 400 `details` list carries one entry per failing target (`"body"`,
//! `"query"`, `"params"`), each holding the field-qualified messages from
//! that target's schema.
//!
//! The body is buffered exactly once (size-capped); the raw bytes are put
//! back on the request afterwards, so terminal handlers can still consume
//! the body even though it was read here. A body that fails to parse at all
//! is reported as a field error on `"body"`, distinct from schema
//! mismatches.
//!
//! On success the typed values land in the [`Validated`] request extension;
//! downstream layers and the handler only ever see validated, typed data
//! for targets that had a schema.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Method, Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use crate::context::{PathParams, Validated};
use crate::error::ApiError;
use crate::metrics;
use crate::schema::{FieldError, ObjectSchema, parse_query_string};

/// Default cap on buffered request bodies (10 MB), preventing
/// denial-of-service via large payloads.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Composition-time validation configuration.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub body: Option<ObjectSchema>,
    pub query: Option<ObjectSchema>,
    pub params: Option<ObjectSchema>,
    /// Methods that bypass validation entirely.
    pub skip_on: HashSet<Method>,
    /// Maximum number of body bytes buffered for validation.
    pub max_body_bytes: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            body: None,
            query: None,
            params: None,
            skip_on: HashSet::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ValidationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, schema: ObjectSchema) -> Self {
        self.body = Some(schema);
        self
    }

    pub fn query(mut self, schema: ObjectSchema) -> Self {
        self.query = Some(schema);
        self
    }

    pub fn params(mut self, schema: ObjectSchema) -> Self {
        self.params = Some(schema);
        self
    }

    pub fn skip_on(mut self, method: Method) -> Self {
        self.skip_on.insert(method);
        self
    }

    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    fn is_empty(&self) -> bool {
        self.body.is_none() && self.query.is_none() && self.params.is_none()
    }
}

/// Validation layer for the pipeline stack.
#[derive(Clone)]
pub struct ValidateLayer {
    policy: Arc<ValidationPolicy>,
}

impl ValidateLayer {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for ValidateLayer {
    type Service = ValidateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidateService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Validation service wrapper.
#[derive(Clone)]
pub struct ValidateService<S> {
    inner: S,
    policy: Arc<ValidationPolicy>,
}

impl<S> Service<Request<Body>> for ValidateService<S>
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
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if policy.is_empty() || policy.skip_on.contains(req.method()) {
                return inner.call(req).await;
            }

            let mut errors: Vec<FieldError> = Vec::new();
            let mut validated = Validated::default();

            let buffer_body = policy.body.is_some() && method_carries_body(req.method());
            let (parts, body) = req.into_parts();

            // Body target - buffered once, restored below
            let body = if buffer_body {
                match axum::body::to_bytes(body, policy.max_body_bytes).await {
                    Ok(bytes) => {
                        if let Some(schema) = &policy.body {
                            match serde_json::from_slice::<serde_json::Value>(&bytes) {
                                Ok(value) => match schema.validate_value(&value) {
                                    Ok(typed) => validated.body = Some(typed),
                                    Err(body_errors) => {
                                        errors.push(target_error("body", body_errors));
                                    }
                                },
                                // Unparseable payloads get a dedicated
                                // message, distinct from schema mismatches
                                Err(_) => errors.push(FieldError::new(
                                    "body",
                                    vec!["Request body must be valid JSON".to_string()],
                                )),
                            }
                        }
                        Body::from(bytes)
                    }
                    Err(_) => {
                        errors.push(FieldError::new(
                            "body",
                            vec!["Request body could not be read".to_string()],
                        ));
                        Body::empty()
                    }
                }
            } else {
                body
            };

            // Query target - validated even if the body already failed
            if let Some(schema) = &policy.query {
                let raw = parse_query_string(parts.uri.query().unwrap_or(""));
                match schema.validate_strings(&raw) {
                    Ok(typed) => validated.query = Some(typed),
                    Err(query_errors) => errors.push(target_error("query", query_errors)),
                }
            }

            // Params target - supplied by the host router adapter
            if let Some(schema) = &policy.params {
                let raw = parts
                    .extensions
                    .get::<PathParams>()
                    .map(|p| p.0.clone())
                    .unwrap_or_default();
                match schema.validate_strings(&raw) {
                    Ok(typed) => validated.params = Some(typed),
                    Err(params_errors) => errors.push(target_error("params", params_errors)),
                }
            }

            if !errors.is_empty() {
                debug!(count = errors.len(), "Request failed validation");
                metrics::record_short_circuit("validation");
                return Err(ApiError::validation(errors));
            }

            let mut req = Request::from_parts(parts, body);
            req.extensions_mut().insert(validated);
            inner.call(req).await
        })
    }
}

/// Methods whose requests carry a body worth validating.
fn method_carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Collapse one target's field errors into a single `details` entry keyed
/// by the target name, with field-qualified messages.
fn target_error(target: &str, field_errors: Vec<FieldError>) -> FieldError {
    let mut messages = Vec::new();
    for FieldError { field, errors } in field_errors {
        for message in errors {
            if field == target {
                messages.push(message);
            } else {
                messages.push(format!("{field} {message}"));
            }
        }
    }
    FieldError::new(target, messages)
}
