//! `campus-auth` — pure authentication/authorization boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage. Identity is
//! external: a validated JWT supplies the user id and roles; policy checks
//! are pure functions over that context.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod roles;

pub use authorize::{authorize, AuthzError, CommandAuthorization, Principal};
pub use claims::{validate_claims, Hs256JwtValidator, JwtClaims, JwtValidator, TokenValidationError};
pub use permissions::Permission;
pub use roles::Role;
