//! The composer: wraps a terminal handler in the fixed policy chain.
//!
//! Wrapping order, outermost to innermost:
//!
//! **error normalizer → CORS → rate limiter → validation → auth → handler**
//!
//! The order is deliberate: errors raised anywhere must still produce a
//! response with CORS headers; abusive traffic is rejected before the cost
//! of schema validation or an identity lookup is paid; malformed input
//! fails before the identity check; authentication sits closest to the
//! handler because it is the handler's direct precondition.
//!
//! Composition is pure configuration - composing the same
//! [`PipelineOptions`] twice yields behaviorally identical handlers. Each
//! composition owns a private counter store unless one is shared explicitly
//! with [`PipelineOptions::with_store`].
//!
//! # Presets
//!
//! `standard`, `public`, `admin`, `search`, `upload`, `dev` and `prod` are
//! pre-filled option bundles over the same composer; there is no alternate
//! control flow behind them.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, service_fn};

use crate::config::Mode;
use crate::error::ApiError;
use crate::middleware::auth::{AuthLayer, AuthPolicy, IdentityResolver};
use crate::middleware::cors::{CorsLayer, CorsNegotiator, CorsPolicy};
use crate::middleware::normalize::{ErrorPolicy, NormalizeLayer};
use crate::middleware::rate_limit::{RateLimitLayer, RateLimitPolicy};
use crate::middleware::store::RateLimitStore;
use crate::middleware::validate::{ValidateLayer, ValidationPolicy};

/// Immutable, composition-time policy bundle for one pipeline.
#[derive(Clone)]
pub struct PipelineOptions {
    pub mode: Mode,
    pub auth: AuthPolicy,
    pub cors: CorsPolicy,
    pub validation: Option<ValidationPolicy>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub errors: ErrorPolicy,
    /// Explicitly shared counter store; `None` gives each composition its
    /// own.
    store: Option<Arc<RateLimitStore>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Production,
            auth: AuthPolicy::anonymous(),
            cors: CorsPolicy::default(),
            validation: None,
            rate_limit: None,
            errors: ErrorPolicy::default(),
            store: None,
        }
    }
}

impl PipelineOptions {
    /// Authenticated endpoint with a moderate rate budget.
    pub fn standard() -> Self {
        Self {
            auth: AuthPolicy::required(),
            rate_limit: Some(RateLimitPolicy::moderate()),
            ..Self::default()
        }
    }

    /// Anonymous endpoint with a lenient rate budget.
    pub fn public() -> Self {
        Self {
            rate_limit: Some(RateLimitPolicy::lenient()),
            ..Self::default()
        }
    }

    /// Authenticated endpoint restricted to the given admin users, with a
    /// strict rate budget. An empty list denies everyone.
    pub fn admin<I, S>(admin_user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            auth: AuthPolicy::admin(admin_user_ids),
            rate_limit: Some(RateLimitPolicy::strict()),
            ..Self::default()
        }
    }

    /// Anonymous query endpoint with the search rate budget.
    pub fn search() -> Self {
        Self {
            rate_limit: Some(RateLimitPolicy::search()),
            ..Self::default()
        }
    }

    /// Authenticated ingestion endpoint with the upload rate budget.
    pub fn upload() -> Self {
        Self {
            auth: AuthPolicy::required(),
            rate_limit: Some(RateLimitPolicy::upload()),
            ..Self::default()
        }
    }

    /// Local development: no rate limiting, verbose errors, development
    /// mode (enables the identity fallback when the auth policy carries
    /// one).
    pub fn dev() -> Self {
        Self {
            mode: Mode::Development,
            errors: ErrorPolicy::development(),
            ..Self::default()
        }
    }

    /// Production hardening: authenticated, moderate rate budget, generic
    /// error messages with no detail leakage.
    pub fn prod() -> Self {
        Self {
            mode: Mode::Production,
            auth: AuthPolicy::required(),
            rate_limit: Some(RateLimitPolicy::moderate()),
            errors: ErrorPolicy::production(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_cors(mut self, cors: CorsPolicy) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_errors(mut self, errors: ErrorPolicy) -> Self {
        self.errors = errors;
        self
    }

    /// Share a counter store across compositions (e.g., one budget for a
    /// whole route group). Without this every composition counts alone.
    pub fn with_store(mut self, store: Arc<RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// A fully composed request handler.
///
/// Implements `Service<Request<Body>>` with `Error = Infallible`, so it can
/// be mounted directly on an axum router via `route_service` or driven
/// in-process with `tower::ServiceExt::oneshot`.
#[derive(Clone)]
pub struct ComposedHandler {
    inner: BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>,
}

impl Service<Request<Body>> for ComposedHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future =
        <BoxCloneSyncService<Request<Body>, Response<Body>, Infallible> as Service<
            Request<Body>,
        >>::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        self.inner.call(req)
    }
}

/// Boxed intermediate stage with the pipeline's internal error type.
type PolicyStage = BoxCloneSyncService<Request<Body>, Response<Body>, ApiError>;

/// Compose a terminal handler with the fixed policy chain.
///
/// The handler is any async function from a request to a
/// `Result<Response, ApiError>`; business handlers stay opaque to the
/// pipeline. Identity verification is delegated to `resolver`.
pub fn compose<H, Fut>(
    handler: H,
    options: PipelineOptions,
    resolver: Arc<dyn IdentityResolver>,
) -> ComposedHandler
where
    H: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>, ApiError>> + Send + 'static,
{
    let negotiator = Arc::new(CorsNegotiator::new(options.cors.clone()));
    let store = options
        .store
        .clone()
        .unwrap_or_else(|| Arc::new(RateLimitStore::new()));

    let terminal = service_fn(handler);

    // Innermost to outermost; each stage is boxed so optional layers keep a
    // uniform type
    let stage: PolicyStage = BoxCloneSyncService::new(
        AuthLayer::new(options.auth.clone(), resolver, options.mode).layer(terminal),
    );

    let stage: PolicyStage = BoxCloneSyncService::new(
        ValidateLayer::new(options.validation.clone().unwrap_or_default()).layer(stage),
    );

    let stage: PolicyStage = match options.rate_limit.clone() {
        Some(policy) => {
            BoxCloneSyncService::new(RateLimitLayer::new(policy, store).layer(stage))
        }
        None => stage,
    };

    let stage: PolicyStage =
        BoxCloneSyncService::new(CorsLayer::new(negotiator.clone()).layer(stage));

    let outer = NormalizeLayer::new(options.errors.clone(), negotiator).layer(stage);

    ComposedHandler {
        inner: BoxCloneSyncService::new(outer),
    }
}
