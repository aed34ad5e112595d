//! Authentication
//!
//! JWT validation only; token issuance lives outside this service. The
//! middleware turns a valid bearer token into an explicit request-scoped
//! `AuthUser`; nothing downstream reads ambient request state.

pub mod jwt;
pub mod middleware;

pub use middleware::AuthUser;
