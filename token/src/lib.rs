//! PK Token construction and verification.
//!
//! A PK Token binds an OP-issued ID token to a client-chosen ephemeral key:
//! the OP's RS256 signature (or its Guillou-Quisquater transform) and the
//! client's proof-of-possession signature share a single payload segment.
//! This crate also carries the SSH certificate binder that ferries PK Tokens
//! to `sshd` and back.

pub mod cic;
pub mod gq;
pub mod pktoken;
pub mod signer;
pub mod sshcert;

pub use pktoken::{Audience, IdClaims, OpKeyResolver, PkToken, VerifiedToken};
