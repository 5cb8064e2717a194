//! # Turnpike
//!
//! A composable HTTP policy middleware pipeline for Axum services:
//! authentication resolution, CORS negotiation, schema validation,
//! fixed-window rate limiting and error normalization, wrapped around an
//! arbitrary terminal handler in a fixed, predictable order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Host Axum Router                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Host middleware (Request ID → Trace → Body limit)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Composed pipeline (per route)                              │
//! │    Error Normalizer → CORS → Rate Limit → Validate → Auth   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Terminal handler (opaque to the pipeline)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every response leaving a composed handler carries CORS and hardening
//! headers - including responses produced for errors raised deep inside the
//! chain - and every non-2xx body has the same `{error, details?,
//! timestamp}` shape.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turnpike::{BearerTokenResolver, PipelineOptions, compose};
//! use turnpike::schema::{FieldSpec, ObjectSchema};
//! use turnpike::middleware::ValidationPolicy;
//! use axum::body::Body;
//! use axum::http::{Request, Response};
//! use axum::response::IntoResponse;
//!
//! async fn create_item(_req: Request<Body>) -> turnpike::ApiResult<Response<Body>> {
//!     Ok(axum::Json(serde_json::json!({"ok": true})).into_response())
//! }
//!
//! let options = PipelineOptions::standard().with_validation(
//!     ValidationPolicy::new()
//!         .body(ObjectSchema::new().field(FieldSpec::text("name").required().min_len(1))),
//! );
//! let resolver = Arc::new(BearerTokenResolver::single("secret-token", "u1"));
//! let handler = compose(create_item, options, resolver);
//!
//! let app: axum::Router = axum::Router::new()
//!     .route("/items", axum::routing::post_service(handler));
//! ```
//!
//! ## Scope
//!
//! Single-process only: rate-limit counters are in-memory and not shared
//! across instances. Timeouts, TLS and transport concerns belong to the
//! surrounding stack.

pub mod compose;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod schema;
pub mod utils;

// Re-exports for convenience
pub use compose::{ComposedHandler, PipelineOptions, compose};
pub use config::{Config, Mode};
pub use context::{Identity, PathParams, RequestMeta, Validated};
pub use error::{ApiError, ApiResult, ErrorKind};
pub use middleware::auth::{AuthPolicy, BearerTokenResolver, IdentityResolver};
pub use middleware::cors::CorsPolicy;
pub use middleware::normalize::ErrorPolicy;
pub use middleware::rate_limit::{RateLimitKey, RateLimitPolicy};
pub use middleware::store::RateLimitStore;
pub use middleware::validate::ValidationPolicy;
pub use routes::build_router;
