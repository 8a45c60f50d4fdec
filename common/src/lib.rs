//! Shared plumbing for the opkssh workspace: base64url helpers, compact JWS
//! handling, JWK/JWKS types, provider configuration, error kinds, and the
//! filesystem abstraction used by both the login and verify binaries.

pub mod b64;
pub mod config;
pub mod error;
pub mod fs;
pub mod jwk;
pub mod jws;

pub use error::AuthError;
