//! Login-side client: OP providers, the authorization-code + PKCE loopback
//! flow, and the orchestration that turns an OP identity into an ephemeral
//! SSH key plus an OpenPubkey certificate on disk.

pub mod login;
pub mod oidc;
pub mod provider;

pub use login::{login, login_with_provider, LoginArtifacts, LoginOptions, LoginOutcome};
pub use provider::{MockOp, OpProvider};
