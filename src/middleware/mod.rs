//! HTTP middleware for request admission.
//!
//! - **Identity**: trusted-proxy aware client IP resolution and device fingerprint
//! - **CORS**: live origin registry behind `tower-http`'s `CorsLayer`
//! - **Admission**: threat scan, route quotas and the geographic gate
//! - **Admin auth**: constant-time key check with a per-IP failure limiter
//!
//! # Architecture
//!
//! ```text
//! Request → CORS → Request ID → Trace → Admission → [Admin Auth] → Handler
//!            ↓                             ↓              ↓
//!        preflight              400 / 413 / 429 / 403    401 / 429
//! ```

pub mod admin_auth;
pub mod admission;
pub mod cors;
pub mod ip;

pub use admin_auth::{ADMIN_KEY_HEADER, AdminAuth};
pub use admission::{AdmissionLayer, Pipeline, Rejection, apply_security_headers};
pub use cors::{OriginError, OriginListing, OriginPolicy, OriginRegistry, cors_layer};
pub use ip::{ClientIdentity, IdentityResolver, IpSource, TrustedProxyConfig, UNKNOWN_IP};
