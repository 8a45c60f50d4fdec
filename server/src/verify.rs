//! The `AuthorizedKeysCommand` entrypoint.
//!
//! `sshd` invokes `opkssh verify <user> <key-blob-b64> <key-type>` once per
//! authentication attempt. The flow is strictly sequential: certificate
//! parse, PK Token verification (which resolves OP keys), policy, output.
//! On success exactly one authorized-keys line goes to stdout; on any
//! failure stdout stays empty and the error code goes to the log, which is
//! how `sshd` learns "no match".

use chrono::Utc;
use tracing::{debug, info};

use opkssh_common::{config::Config, error::AuthError};
use opkssh_token::{sshcert, OpKeyResolver};

use crate::policy::PolicyEngine;

/// Options prepended to the emitted authorized-keys line. `restrict` drops
/// everything, `pty` re-enables terminal allocation.
pub const AUTHORIZED_KEY_OPTIONS: &str = "restrict,pty";

pub struct VerifyFlow<R: OpKeyResolver> {
    config: Config,
    resolver: R,
    policy: PolicyEngine,
}

impl<R: OpKeyResolver> VerifyFlow<R> {
    pub fn new(config: Config, resolver: R, policy: PolicyEngine) -> Self {
        Self {
            config,
            resolver,
            policy,
        }
    }

    /// Run the flow against the current clock.
    pub async fn verify(
        &self,
        principal: &str,
        key_blob_b64: &str,
        key_type: &str,
    ) -> Result<String, AuthError> {
        self.verify_at(principal, key_blob_b64, key_type, Utc::now().timestamp())
            .await
    }

    /// Deterministic body, fixed `now` for tests.
    pub async fn verify_at(
        &self,
        principal: &str,
        key_blob_b64: &str,
        key_type: &str,
        now: i64,
    ) -> Result<String, AuthError> {
        crate::readhome::validate_principal(principal)?;

        let (cert, pk_token) = sshcert::parse_and_extract(key_type, key_blob_b64, now)?;
        debug!(key_id = cert.key_id(), "parsed session certificate");

        let verified = pk_token
            .verify_at(&self.resolver, &self.config, now)
            .await?;

        self.policy
            .authorize(&self.config, &verified.claims, principal)
            .await?;

        let public = ssh_key::PublicKey::from(cert.public_key().clone());
        let line = public
            .to_openssh()
            .map_err(|e| AuthError::Malformed(format!("public key encoding: {e}")))?;

        info!(
            principal,
            sub = %verified.claims.sub,
            iss = %verified.claims.iss,
            "authentication authorized"
        );
        Ok(format!("{AUTHORIZED_KEY_OPTIONS} {line}"))
    }
}
