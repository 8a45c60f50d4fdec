//! Verify-side service: JWKS resolution, policy evaluation, and the
//! `AuthorizedKeysCommand` entrypoint `sshd` invokes per authentication.

pub mod jwks;
pub mod policy;
pub mod readhome;
pub mod verify;

pub use verify::VerifyFlow;
