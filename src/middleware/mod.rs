//! Policy middleware layers composed around terminal handlers.
//!
//! Each layer is a tower `Layer`/`Service` pair carrying an immutable,
//! composition-time policy. The composer wires them in a fixed order:
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │ Error Normalizer │ ← catches every inner failure, logs once
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← OPTIONS preflight short-circuits here
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Rate Limiter   │ ← 429 before validation/identity cost is paid
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Validation    │ ← 400 with the full field-error list
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401/403, closest to the handler
//! └────────┬─────────┘
//!          ▼
//!       Handler
//! ```
//!
//! Responses flow back outward; every layer may add headers but none may
//! undo another's. CORS headers are guaranteed on every response, including
//! errors raised three layers in.

pub mod auth;
pub mod cors;
pub mod ip;
pub mod normalize;
pub mod rate_limit;
pub mod request_id;
pub mod store;
pub mod validate;

pub use auth::{AuthLayer, AuthPolicy, BearerTokenResolver, IdentityResolver};
pub use cors::{CorsLayer, CorsNegotiator, CorsPolicy};
pub use ip::{TrustedProxies, UNKNOWN_IP, client_ip};
pub use normalize::{ErrorOverride, ErrorPolicy, NormalizeLayer};
pub use rate_limit::{RateLimitKey, RateLimitLayer, RateLimitPolicy};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use store::{RateLimitInfo, RateLimitStore};
pub use validate::{ValidateLayer, ValidationPolicy};
