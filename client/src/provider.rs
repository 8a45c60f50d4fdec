//! OP providers.
//!
//! One `authorize` operation over a tagged set of provider kinds:
//!
//! - `Standard`: any interactive OIDC issuer, authorization-code + PKCE
//!   over the loopback redirect. The CIC commitment rides in `nonce`.
//! - `GithubActions`: the runner's machine identity endpoint. The runner
//!   cannot choose a nonce, so the commitment is requested as the token's
//!   `audience`; these tokens are always GQ-signed before use.
//! - `Mock`: an in-process OP with a generated RSA key, for tests and
//!   offline development.

use async_trait::async_trait;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use opkssh_common::{
    b64,
    config::ProviderConfig,
    error::AuthError,
    jwk::{Jwk, JwkSet, RsaJwk},
    jws::{self, ProtectedHeader, ALG_RS256},
};
use opkssh_token::{cic::Cic, pktoken::GITHUB_ACTIONS_ISSUER, OpKeyResolver};

use crate::oidc;

const ACTIONS_URL_ENV: &str = "ACTIONS_ID_TOKEN_REQUEST_URL";
const ACTIONS_TOKEN_ENV: &str = "ACTIONS_ID_TOKEN_REQUEST_TOKEN";

pub enum OpProvider {
    Mock(MockOp),
    Standard(StandardOp),
    GithubActions(GithubActionsOp),
}

impl OpProvider {
    /// Choose the provider kind for a configuration entry.
    pub fn from_config(config: &ProviderConfig, open_browser: bool) -> Self {
        if config.issuer.trim_end_matches('/') == GITHUB_ACTIONS_ISSUER {
            OpProvider::GithubActions(GithubActionsOp {
                client_id: config.client_id.clone(),
            })
        } else {
            OpProvider::Standard(StandardOp {
                config: config.clone(),
                open_browser,
            })
        }
    }

    pub fn issuer(&self) -> &str {
        match self {
            OpProvider::Mock(op) => &op.issuer,
            OpProvider::Standard(op) => &op.config.issuer,
            OpProvider::GithubActions(_) => GITHUB_ACTIONS_ISSUER,
        }
    }

    /// GithubActions tokens leak a reusable `aud`-bound credential if
    /// shipped raw, so the GQ transform is mandatory there.
    pub fn requires_gq(&self) -> bool {
        matches!(self, OpProvider::GithubActions(_))
    }

    /// Obtain a signed ID token bound to the CIC commitment.
    pub async fn authorize(&self, cic: &Cic) -> Result<String, AuthError> {
        match self {
            OpProvider::Mock(op) => op.authorize(cic),
            OpProvider::Standard(op) => {
                oidc::authorization_code_flow(&op.config, &cic.commitment(), op.open_browser)
                    .await
            }
            OpProvider::GithubActions(op) => op.authorize(cic).await,
        }
    }

    /// The RSA key that signed `kid`, needed for the GQ transform.
    pub async fn op_key(&self, kid: &str) -> Result<RsaPublicKey, AuthError> {
        let jwk = match self {
            OpProvider::Mock(op) => op
                .jwks()
                .find(kid)
                .cloned()
                .ok_or_else(|| AuthError::UnknownKid(kid.to_string()))?,
            OpProvider::Standard(_) | OpProvider::GithubActions(_) => {
                Jwk::Rsa(oidc::fetch_op_key(self.issuer(), kid).await?)
            }
        };
        match jwk {
            Jwk::Rsa(rsa) => rsa.to_public_key(),
            _ => Err(AuthError::Malformed(format!("kid {kid} is not an RSA key"))),
        }
    }
}

/// Interactive OIDC issuer.
pub struct StandardOp {
    pub config: ProviderConfig,
    pub open_browser: bool,
}

/// GitHub Actions machine identity.
pub struct GithubActionsOp {
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
struct ActionsTokenResponse {
    value: String,
}

impl GithubActionsOp {
    async fn authorize(&self, cic: &Cic) -> Result<String, AuthError> {
        let url = std::env::var(ACTIONS_URL_ENV).map_err(|_| {
            AuthError::Configuration(format!("{ACTIONS_URL_ENV} not set; not a runner?"))
        })?;
        let bearer = std::env::var(ACTIONS_TOKEN_ENV).map_err(|_| {
            AuthError::Configuration(format!("{ACTIONS_TOKEN_ENV} not set; not a runner?"))
        })?;

        // The runner binds the commitment through `aud`.
        let request_url = format!("{url}&audience={}", cic.commitment());
        debug!("requesting workflow identity token");
        let response = reqwest::Client::new()
            .get(&request_url)
            .bearer_auth(bearer)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AuthError::Io(format!("identity token request: {e}")))?;
        if !response.status().is_success() {
            return Err(AuthError::Io(format!(
                "identity token request returned {}",
                response.status()
            )));
        }
        let token: ActionsTokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Malformed(format!("identity token response: {e}")))?;
        Ok(token.value)
    }
}

/// In-process OP with a generated signing key.
pub struct MockOp {
    pub issuer: String,
    pub client_id: String,
    kid: String,
    key: RsaPrivateKey,
}

impl MockOp {
    pub fn new(issuer: &str, client_id: &str) -> Result<Self, AuthError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
            .map_err(|e| AuthError::Configuration(format!("mock OP key generation: {e}")))?;
        // Deterministic short key ID derived from the key itself.
        let thumbprint = Jwk::Rsa(RsaJwk::from_public_key(None, &key.to_public_key())).thumbprint();
        Ok(Self {
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            kid: thumbprint[..12].to_string(),
            key,
        })
    }

    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: vec![Jwk::Rsa(RsaJwk::from_public_key(
                Some(self.kid.clone()),
                &self.key.to_public_key(),
            ))],
        }
    }

    /// Sign an RS256 ID token over arbitrary claims.
    pub fn issue_id_token(&self, claims: &serde_json::Value) -> Result<String, AuthError> {
        let mut header = ProtectedHeader::new(ALG_RS256);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.kid.clone());
        let protected = header.encode()?;
        let payload = b64::encode(
            serde_json::to_vec(claims)
                .map_err(|e| AuthError::Malformed(format!("claims serialization: {e}")))?,
        );
        let digest = Sha256::digest(jws::signing_input(&protected, &payload));
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| AuthError::SigInvalid(format!("mock OP signing: {e}")))?;
        Ok(format!("{protected}.{payload}.{}", b64::encode(signature)))
    }

    fn authorize(&self, cic: &Cic) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        self.issue_id_token(&serde_json::json!({
            "iss": self.issuer,
            "sub": "mock-user",
            "aud": self.client_id,
            "exp": now + 3600,
            "iat": now,
            "nonce": cic.commitment(),
            "email": "mock-user@example.com",
        }))
    }
}

/// The mock OP can stand in for the verify side's key resolver in tests.
#[async_trait]
impl OpKeyResolver for MockOp {
    async fn resolve(&self, issuer: &str, kid: &str) -> Result<RsaJwk, AuthError> {
        if issuer.trim_end_matches('/') != self.issuer.trim_end_matches('/') {
            return Err(AuthError::UnknownIssuer(issuer.to_string()));
        }
        match self.jwks().find(kid) {
            Some(Jwk::Rsa(jwk)) => Ok(jwk.clone()),
            _ => Err(AuthError::UnknownKid(kid.to_string())),
        }
    }
}
