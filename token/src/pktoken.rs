//! The PK Token: three JWS legs over one shared payload.
//!
//! - `op`: the OP's RS256 signature over the ID token, or its GQ256
//!   transform.
//! - `cic`: the client's proof-of-possession under the ephemeral key.
//! - `cos`: an optional cosigner leg, parsed and re-serialized but not
//!   required by the verify path.
//!
//! Tokens are immutable once built and expire with the ID token's `exp`.

use async_trait::async_trait;
use chrono::Utc;
use rsa::Pkcs1v15Sign;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use opkssh_common::{
    b64,
    config::Config,
    error::AuthError,
    jwk::{Jwk, RsaJwk},
    jws::{self, CompactJws, ProtectedHeader, ALG_GQ256, ALG_RS256},
};

use crate::{
    cic::{self, Cic},
    gq::{self, GqSignerVerifier, SECURITY_BITS_256},
    signer::{self, ClientSigner},
};

/// Issuer whose tokens bind the CIC commitment through `aud` instead of
/// `nonce` (GitHub's runner does not let a workflow choose a nonce).
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, wanted: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == wanted,
            Audience::Many(auds) => auds.iter().any(|aud| aud == wanted),
        }
    }
}

/// The ID token claims the verify path consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Resolves `(issuer, kid)` to the OP's current RSA key.
///
/// The server backs this with a cached JWKS fetch; tests back it with a
/// fixed key set.
#[async_trait]
pub trait OpKeyResolver: Send + Sync {
    async fn resolve(&self, issuer: &str, kid: &str) -> Result<RsaJwk, AuthError>;
}

/// Output of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub claims: IdClaims,
    /// The ephemeral public key proven by the CIC leg.
    pub client_jwk: Jwk,
}

/// A PK Token in its serialized field layout.
///
/// All fields are base64url-no-pad segments. Field order is fixed so that
/// `serialize(parse(x)) == x` for tokens in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkToken {
    pub payload: String,
    pub op_protected: String,
    pub op_signature: String,
    pub cic_protected: String,
    pub cic_signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cos_protected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cos_signature: Option<String>,
}

impl PkToken {
    /// Assemble a PK Token from a (possibly GQ-signed) ID token, the
    /// ephemeral signer, and the CIC header used at authorization time.
    pub fn build(id_token: &str, signer: &ClientSigner, cic: &Cic) -> Result<Self, AuthError> {
        let op = CompactJws::parse(id_token)?;
        let cic_signature =
            signer.sign(&jws::signing_input(cic.protected_b64(), &op.payload));
        Ok(Self {
            payload: op.payload,
            op_protected: op.protected,
            op_signature: op.signature,
            cic_protected: cic.protected_b64().to_string(),
            cic_signature: b64::encode(cic_signature),
            cos_protected: None,
            cos_signature: None,
        })
    }

    /// Compact wire form: base64url of the JSON serialization.
    pub fn to_compact(&self) -> Result<String, AuthError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| AuthError::Malformed(format!("PK token serialization: {e}")))?;
        Ok(b64::encode(json))
    }

    pub fn from_compact(compact: &str) -> Result<Self, AuthError> {
        let json = b64::decode(compact)?;
        let token: Self = serde_json::from_slice(&json)
            .map_err(|e| AuthError::Malformed(format!("PK token parse: {e}")))?;
        token.check_framing()?;
        Ok(token)
    }

    fn check_framing(&self) -> Result<(), AuthError> {
        let required = [
            &self.payload,
            &self.op_protected,
            &self.op_signature,
            &self.cic_protected,
            &self.cic_signature,
        ];
        if required.iter().any(|segment| segment.is_empty()) {
            return Err(AuthError::Malformed("empty PK token segment".into()));
        }
        Ok(())
    }

    pub fn claims(&self) -> Result<IdClaims, AuthError> {
        let raw = b64::decode(&self.payload)?;
        serde_json::from_slice(&raw)
            .map_err(|e| AuthError::Malformed(format!("ID token claims: {e}")))
    }

    pub fn op_header(&self) -> Result<ProtectedHeader, AuthError> {
        ProtectedHeader::decode(&self.op_protected)
    }

    pub fn cic_header(&self) -> Result<ProtectedHeader, AuthError> {
        ProtectedHeader::decode(&self.cic_protected)
    }

    /// Verify the token now. See [`Self::verify_at`].
    pub async fn verify(
        &self,
        resolver: &dyn OpKeyResolver,
        config: &Config,
    ) -> Result<VerifiedToken, AuthError> {
        self.verify_at(resolver, config, Utc::now().timestamp()).await
    }

    /// Full verification against a fixed `now`: framing, issuer, OP
    /// signature, CIC commitment, CIC signature, freshness.
    pub async fn verify_at(
        &self,
        resolver: &dyn OpKeyResolver,
        config: &Config,
        now: i64,
    ) -> Result<VerifiedToken, AuthError> {
        self.check_framing()?;
        let claims = self.claims()?;
        if !config.issuer_allowed(&claims.iss) {
            return Err(AuthError::UnknownIssuer(claims.iss.clone()));
        }

        // Resolve the OP key. A GQ256 leg embeds the original protected
        // header; the RSA-signed identity is reconstructed from it.
        let op_header = self.op_header()?;
        let (kid, identity) = match op_header.alg.as_str() {
            ALG_GQ256 => {
                let orig = gq::original_header(&op_header)?;
                let orig_segment = op_header.kid.as_deref().unwrap_or_default();
                (
                    orig.kid.clone(),
                    jws::signing_input(orig_segment, &self.payload),
                )
            }
            ALG_RS256 => (
                op_header.kid.clone(),
                jws::signing_input(&self.op_protected, &self.payload),
            ),
            other => {
                return Err(AuthError::Malformed(format!(
                    "unsupported OP algorithm {other}"
                )))
            }
        };
        let kid = kid.ok_or_else(|| AuthError::Malformed("OP header missing kid".into()))?;
        let op_jwk = resolver.resolve(&claims.iss, &kid).await?;
        let op_key = op_jwk.to_public_key()?;

        let op_signature = b64::decode(&self.op_signature)?;
        match op_header.alg.as_str() {
            ALG_GQ256 => {
                GqSignerVerifier::new(&op_key, SECURITY_BITS_256)?
                    .verify(&identity, &op_signature)?;
            }
            _ => {
                op_key
                    .verify(
                        Pkcs1v15Sign::new::<Sha256>(),
                        &Sha256::digest(&identity),
                        &op_signature,
                    )
                    .map_err(|e| AuthError::SigInvalid(format!("OP signature: {e}")))?;
            }
        }

        // The ID token must commit to the CIC header: through `nonce` for
        // interactive providers, through `aud` for GitHub Actions.
        let commitment = cic::commitment_of(&self.cic_protected);
        let committed = if claims.iss.trim_end_matches('/')
            == GITHUB_ACTIONS_ISSUER.trim_end_matches('/')
        {
            claims.aud.contains(&commitment)
        } else {
            claims.nonce.as_deref() == Some(commitment.as_str())
        };
        if !committed {
            return Err(AuthError::NonceMismatch);
        }

        let cic_header = self.cic_header()?;
        let client_jwk = cic_header
            .jwk
            .clone()
            .ok_or_else(|| AuthError::Malformed("CIC header missing jwk".into()))?;
        signer::verify_with_jwk(
            &client_jwk,
            &cic_header.alg,
            &jws::signing_input(&self.cic_protected, &self.payload),
            &b64::decode(&self.cic_signature)?,
        )?;

        if claims.exp <= now {
            return Err(AuthError::Expired);
        }
        if (claims.iat - now).abs() > config.clock_skew_secs {
            return Err(AuthError::ClockSkew);
        }

        Ok(VerifiedToken { claims, client_jwk })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::KeyAlg;
    use opkssh_common::config::ProviderConfig;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::sync::OnceLock;

    const ISSUER: &str = "https://op.test/";
    const KID: &str = "k1";
    const CLIENT_ID: &str = "cid";

    fn op_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate RSA key")
        })
    }

    struct FixedResolver {
        jwk: RsaJwk,
    }

    impl FixedResolver {
        fn new(key: &RsaPublicKey) -> Self {
            Self {
                jwk: RsaJwk::from_public_key(Some(KID.to_string()), key),
            }
        }
    }

    #[async_trait]
    impl OpKeyResolver for FixedResolver {
        async fn resolve(&self, _issuer: &str, kid: &str) -> Result<RsaJwk, AuthError> {
            if kid == self.jwk.kid.as_deref().unwrap_or_default() {
                Ok(self.jwk.clone())
            } else {
                Err(AuthError::UnknownKid(kid.to_string()))
            }
        }
    }

    fn config() -> Config {
        Config::from_providers(vec![
            ProviderConfig::parse(&format!("op,{ISSUER},{CLIENT_ID},,"), true).unwrap(),
        ])
    }

    /// Sign an RS256 ID token the way a real OP would.
    fn issue_id_token(claims: &serde_json::Value) -> String {
        let mut header = ProtectedHeader::new(ALG_RS256);
        header.typ = Some("JWT".into());
        header.kid = Some(KID.into());
        let protected = header.encode().unwrap();
        let payload = b64::encode(serde_json::to_vec(claims).unwrap());
        let digest = Sha256::digest(jws::signing_input(&protected, &payload));
        let signature = op_key()
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        format!("{protected}.{payload}.{}", b64::encode(signature))
    }

    struct Session {
        token: PkToken,
        now: i64,
    }

    fn login(gq: bool) -> Session {
        let now = 1_700_000_000;
        let signer = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let cic = Cic::new(signer.public_jwk(), signer.jws_alg()).unwrap();
        let id_token = issue_id_token(&serde_json::json!({
            "iss": ISSUER,
            "sub": "u@test",
            "aud": CLIENT_ID,
            "exp": now + 3600,
            "iat": now,
            "nonce": cic.commitment(),
            "email": "u@test",
        }));
        let id_token = if gq {
            GqSignerVerifier::new(&op_key().to_public_key(), SECURITY_BITS_256)
                .unwrap()
                .sign_jwt(&id_token)
                .unwrap()
        } else {
            id_token
        };
        Session {
            token: PkToken::build(&id_token, &signer, &cic).unwrap(),
            now,
        }
    }

    #[tokio::test]
    async fn test_verify_accepts_rs256_token() {
        let session = login(false);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let verified = session
            .token
            .verify_at(&resolver, &config(), session.now)
            .await
            .expect("valid token must verify");
        assert_eq!(verified.claims.sub, "u@test");
        assert_eq!(verified.claims.email.as_deref(), Some("u@test"));
    }

    #[tokio::test]
    async fn test_verify_accepts_gq_token_without_rsa_signature() {
        let session = login(true);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        session
            .token
            .verify_at(&resolver, &config(), session.now)
            .await
            .expect("GQ token must verify");
        assert_eq!(session.token.op_header().unwrap().alg, ALG_GQ256);
    }

    #[tokio::test]
    async fn test_compact_roundtrip_is_byte_exact() {
        let session = login(false);
        let compact = session.token.to_compact().unwrap();
        let reparsed = PkToken::from_compact(&compact).unwrap();
        assert_eq!(reparsed, session.token);
        assert_eq!(reparsed.to_compact().unwrap(), compact);
    }

    #[tokio::test]
    async fn test_bit_flips_are_fatal() {
        let session = login(false);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let config = config();

        // Tamper each segment in turn; every mutation must fail closed.
        let mutations: [(&str, Box<dyn Fn(&mut PkToken)>); 4] = [
            ("payload", Box::new(|t| t.payload = flip(&t.payload))),
            (
                "op signature",
                Box::new(|t| t.op_signature = flip(&t.op_signature)),
            ),
            (
                "cic signature",
                Box::new(|t| t.cic_signature = flip(&t.cic_signature)),
            ),
            (
                "cic header",
                Box::new(|t| t.cic_protected = flip(&t.cic_protected)),
            ),
        ];
        for (what, mutate) in mutations {
            let mut tampered = session.token.clone();
            mutate(&mut tampered);
            let result = tampered.verify_at(&resolver, &config, session.now).await;
            assert!(result.is_err(), "tampered {what} must not verify");
        }
    }

    fn flip(segment: &str) -> String {
        let mut raw = b64::decode(segment).expect("segment decodes");
        raw[0] ^= 0x01;
        b64::encode(raw)
    }

    #[tokio::test]
    async fn test_tampered_payload_is_sig_invalid() {
        let session = login(false);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let mut tampered = session.token.clone();
        // Re-point sub without re-signing; claims still parse, issuer still
        // matches, so the failure must come from the OP signature.
        let mut claims: serde_json::Value =
            serde_json::from_slice(&b64::decode(&tampered.payload).unwrap()).unwrap();
        claims["sub"] = "attacker".into();
        tampered.payload = b64::encode(serde_json::to_vec(&claims).unwrap());
        let err = tampered
            .verify_at(&resolver, &config(), session.now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "sig-invalid");
    }

    #[tokio::test]
    async fn test_unknown_issuer_rejected() {
        let session = login(false);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let other = Config::from_providers(vec![
            ProviderConfig::parse("op,https://other.test/,cid,,", true).unwrap(),
        ]);
        let err = session
            .token
            .verify_at(&resolver, &other, session.now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown-issuer");
    }

    #[tokio::test]
    async fn test_nonce_mismatch_rejected() {
        let now = 1_700_000_000;
        let signer = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let cic = Cic::new(signer.public_jwk(), signer.jws_alg()).unwrap();
        // The OP signs a nonce that is not this session's commitment.
        let id_token = issue_id_token(&serde_json::json!({
            "iss": ISSUER,
            "sub": "u@test",
            "aud": CLIENT_ID,
            "exp": now + 3600,
            "iat": now,
            "nonce": "somebody-elses-commitment",
        }));
        let token = PkToken::build(&id_token, &signer, &cic).unwrap();
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let err = token
            .verify_at(&resolver, &config(), now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "nonce-mismatch");
    }

    #[tokio::test]
    async fn test_exp_boundary() {
        let session = login(false);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let config = config();
        let exp = session.now + 3600;

        // exp == now rejects, exp == now + 1 accepts.
        let err = session
            .token
            .verify_at(&resolver, &config, exp)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "expired");
        // iat is far behind `exp - 1`, so widen the skew to isolate exp.
        let mut wide = config.clone();
        wide.clock_skew_secs = i64::MAX;
        session
            .token
            .verify_at(&resolver, &wide, exp - 1)
            .await
            .expect("one second before exp must verify");
    }

    #[tokio::test]
    async fn test_iat_skew_boundary() {
        let session = login(false);
        let resolver = FixedResolver::new(&op_key().to_public_key());
        let config = config();
        let skew = config.clock_skew_secs;

        // Verifier clock behind the OP: iat == now + skew accepts.
        session
            .token
            .verify_at(&resolver, &config, session.now - skew)
            .await
            .expect("iat at the skew edge must verify");
        let err = session
            .token
            .verify_at(&resolver, &config, session.now - skew - 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "clock-skew");
    }

    #[tokio::test]
    async fn test_unknown_kid_surfaces() {
        let session = login(false);
        // Resolver knows a different kid only.
        let resolver = FixedResolver {
            jwk: RsaJwk::from_public_key(Some("k2".into()), &op_key().to_public_key()),
        };
        let err = session
            .token
            .verify_at(&resolver, &config(), session.now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown-kid");
    }
}
