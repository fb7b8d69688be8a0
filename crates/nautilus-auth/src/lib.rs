//! # Nautilus Auth
//!
//! Authentication schemes whose credential checks are scripts, and
//! claim-based authorization policies.
//!
//! - **Schemes**: `Basic`, `ApiKey { header }` and `Bearer`, each with an
//!   optional validator (returns a verdict) and claim issuer (returns claims)
//! - **Policies**: required authentication, allowed schemes, required claims
//!   with an optional value where `*` accepts any value
//!
//! Authentication failures map to 401 with `WWW-Authenticate` challenges for
//! Basic and Bearer schemes; policy failures map to 403.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod policy;
pub mod registry;
pub mod scheme;

pub use error::AuthFailure;
pub use policy::{AuthPolicy, ClaimRequirement, PolicyViolation};
pub use registry::AuthRegistry;
pub use scheme::{AuthScheme, Credentials, SchemeKind, DEFAULT_API_KEY_HEADER, IDENTITY_NAME_LOCAL};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::AuthFailure;
    pub use crate::policy::{AuthPolicy, ClaimRequirement};
    pub use crate::registry::AuthRegistry;
    pub use crate::scheme::{AuthScheme, SchemeKind};
}
