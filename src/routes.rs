//! Demo router: preset pipelines mounted over trivial terminal handlers.
//!
//! The handlers here are deliberately thin - they echo validated input back
//! so the pipeline's behavior is observable end to end. Real applications
//! mount their own handlers the same way: compose a pipeline per route (or
//! route group) and attach it with `route_service`/`get_service`.
//!
//! # Route Groups
//!
//! - `GET /health` - liveness, outside any pipeline
//! - `GET /items` - public preset, query schema
//! - `POST /items` - standard preset (auth required), body + query schemas
//! - `GET /admin/stats` - admin preset, allow-list from configuration

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, get_service};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::compose::{PipelineOptions, compose};
use crate::config::Config;
use crate::context::{IdentityExt, ValidatedExt};
use crate::error::ApiError;
use crate::middleware::auth::{AuthPolicy, BearerTokenResolver, IdentityResolver};
use crate::middleware::cors::CorsPolicy;
use crate::middleware::ip::TrustedProxies;
use crate::middleware::normalize::ErrorPolicy;
use crate::middleware::rate_limit::RateLimitPolicy;
use crate::middleware::request_id::RequestIdLayer;
use crate::middleware::store::RateLimitStore;
use crate::middleware::validate::ValidationPolicy;
use crate::schema::{FieldSpec, ObjectSchema};

/// Build the demo router and the shared counter store backing its
/// pipelines. The store is returned so the host can run purge sweeps.
pub fn build_router(config: &Config) -> (Router, Arc<RateLimitStore>) {
    let resolver: Arc<dyn IdentityResolver> =
        Arc::new(BearerTokenResolver::new(config.api_tokens.clone()));
    let store = Arc::new(RateLimitStore::new());

    let cors = cors_policy(config);
    let errors = if config.mode.is_production() {
        ErrorPolicy::production()
    } else {
        ErrorPolicy::development()
    };

    let base = PipelineOptions::default()
        .with_mode(config.mode)
        .with_cors(cors)
        .with_errors(errors)
        .with_store(store.clone());

    // GET /items - anonymous listing with a typed query string
    let list_items = compose(
        list_items_handler,
        base.clone()
            .with_rate_limit(rate_policy(config, RateLimitPolicy::lenient()))
            .with_validation(ValidationPolicy::new().query(list_query_schema())),
        resolver.clone(),
    );

    // POST /items - authenticated creation with body + query schemas
    let create_items = compose(
        create_item_handler,
        base.clone()
            .with_auth(auth_policy(config))
            .with_rate_limit(rate_policy(config, RateLimitPolicy::moderate()))
            .with_validation(
                ValidationPolicy::new()
                    .body(item_body_schema())
                    .query(list_query_schema())
                    .max_body_bytes(config.max_request_body_size),
            ),
        resolver.clone(),
    );

    // GET /admin/stats - allow-listed users only
    let admin_stats = compose(
        admin_stats_handler,
        base.clone()
            .with_auth(admin_auth_policy(config))
            .with_rate_limit(rate_policy(config, RateLimitPolicy::strict())),
        resolver,
    );

    info!(
        mode = ?config.mode,
        admin_users = config.admin_user_ids.len(),
        rate_limiting = config.rate_limiting_enabled(),
        "Demo routes composed"
    );

    let router = Router::new()
        .route("/health", get(health_check))
        .route(
            "/items",
            get_service(list_items).post_service(create_items),
        )
        .route("/admin/stats", get_service(admin_stats))
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new());

    (router, store)
}

// =============================================================================
// Policy assembly from configuration
// =============================================================================

fn cors_policy(config: &Config) -> CorsPolicy {
    if config.cors_allowed_origins.is_empty() {
        CorsPolicy::default()
    } else {
        CorsPolicy::with_origins(config.cors_allowed_origins.iter().cloned())
    }
}

fn auth_policy(config: &Config) -> AuthPolicy {
    let mut policy = AuthPolicy::required();
    if let Some(fallback) = &config.dev_fallback_identity {
        policy = policy.with_dev_fallback(fallback.clone());
    }
    policy
}

fn admin_auth_policy(config: &Config) -> AuthPolicy {
    let mut policy = AuthPolicy::admin(config.admin_user_ids.iter().cloned());
    if let Some(fallback) = &config.dev_fallback_identity {
        policy = policy.with_dev_fallback(fallback.clone());
    }
    policy
}

/// Scale a preset's window/limit from configuration when rate limiting is
/// enabled; the preset is used unchanged otherwise.
fn rate_policy(config: &Config, preset: RateLimitPolicy) -> RateLimitPolicy {
    let mut policy = if config.rate_limiting_enabled() {
        preset
    } else {
        // Effectively unlimited while keeping the observability headers
        RateLimitPolicy::new(std::time::Duration::from_secs(60), u32::MAX)
    };
    policy = policy.with_trusted_proxies(TrustedProxies::new(&config.trusted_proxies));
    policy
}

// =============================================================================
// Schemas
// =============================================================================

fn list_query_schema() -> ObjectSchema {
    ObjectSchema::new()
        .field(FieldSpec::integer("limit").min(1).max(100))
        .field(FieldSpec::boolean("archived"))
        .field(FieldSpec::one_of("sort", &["asc", "desc"]))
}

fn item_body_schema() -> ObjectSchema {
    ObjectSchema::new()
        .field(FieldSpec::text("name").required().min_len(1).max_len(255))
        .field(FieldSpec::integer("priority").min(0).max(10))
        .field(FieldSpec::boolean("done"))
}

// =============================================================================
// Terminal handlers (demo only - business logic is not the pipeline's job)
// =============================================================================

async fn health_check() -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_items_handler(req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let limit = req
        .validated()
        .and_then(|v| v.query.as_ref())
        .and_then(|q| q.get("limit"))
        .and_then(|v| v.as_i64())
        .unwrap_or(20);

    Ok(axum::Json(json!({ "items": [], "limit": limit })).into_response())
}

async fn create_item_handler(req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user_id = req
        .identity()
        .map(|i| i.user_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    let body = req
        .validated()
        .and_then(|v| v.body.clone())
        .unwrap_or_default();

    Ok((
        StatusCode::CREATED,
        axum::Json(json!({
            "id": uuid::Uuid::new_v4(),
            "created_by": user_id,
            "item": body,
        })),
    )
        .into_response())
}

async fn admin_stats_handler(req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let user_id = req
        .identity()
        .map(|i| i.user_id.clone())
        .ok_or_else(ApiError::authentication_required)?;

    Ok(axum::Json(json!({
        "admin": user_id,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response())
}
