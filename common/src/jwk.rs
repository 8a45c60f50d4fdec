//! JWK / JWKS types per [RFC 7517](https://www.rfc-editor.org/rfc/rfc7517).
//!
//! The OP side only ever serves RSA keys (RS256 ID tokens); OKP and EC keys
//! represent the client's ephemeral Ed25519 / P-256 keys inside the CIC
//! header.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{b64, error::AuthError};

/// A JSON Web Key, tagged by `kty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    #[serde(rename = "OKP")]
    Okp(OkpJwk),
    #[serde(rename = "EC")]
    Ec(EcJwk),
}

impl Jwk {
    pub fn kid(&self) -> Option<&str> {
        match self {
            Jwk::Rsa(k) => k.kid.as_deref(),
            Jwk::Okp(k) => k.kid.as_deref(),
            Jwk::Ec(k) => k.kid.as_deref(),
        }
    }

    /// RFC 7638 thumbprint: SHA-256 of the canonical JSON containing only the
    /// required members in lexicographic order, base64url-no-pad.
    pub fn thumbprint(&self) -> String {
        let canonical = match self {
            Jwk::Rsa(k) => format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, k.e, k.n),
            Jwk::Okp(k) => format!(r#"{{"crv":"{}","kty":"OKP","x":"{}"}}"#, k.crv, k.x),
            Jwk::Ec(k) => format!(
                r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                k.crv, k.x, k.y
            ),
        };
        b64::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// An RSA public key as served by OP JWKS endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
}

impl RsaJwk {
    pub fn from_public_key(kid: Option<String>, key: &rsa::RsaPublicKey) -> Self {
        use rsa::traits::PublicKeyParts;
        Self {
            kid,
            alg: Some(crate::jws::ALG_RS256.to_string()),
            n: b64::encode(key.n().to_bytes_be()),
            e: b64::encode(key.e().to_bytes_be()),
        }
    }

    pub fn to_public_key(&self) -> Result<rsa::RsaPublicKey, AuthError> {
        let n = rsa::BigUint::from_bytes_be(&b64::decode(&self.n)?);
        let e = rsa::BigUint::from_bytes_be(&b64::decode(&self.e)?);
        rsa::RsaPublicKey::new(n, e)
            .map_err(|e| AuthError::Malformed(format!("invalid RSA JWK: {e}")))
    }
}

/// An Ed25519 public key (RFC 8037 OKP form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkpJwk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub crv: String,
    pub x: String,
}

impl OkpJwk {
    pub fn from_verifying_key(key: &ed25519_dalek::VerifyingKey) -> Self {
        Self {
            kid: None,
            alg: Some(crate::jws::ALG_EDDSA.to_string()),
            crv: "Ed25519".to_string(),
            x: b64::encode(key.as_bytes()),
        }
    }

    pub fn to_verifying_key(&self) -> Result<ed25519_dalek::VerifyingKey, AuthError> {
        if self.crv != "Ed25519" {
            return Err(AuthError::Malformed(format!(
                "unsupported OKP curve {}",
                self.crv
            )));
        }
        let x = b64::decode(&self.x)?;
        let bytes: [u8; 32] = x
            .try_into()
            .map_err(|_| AuthError::Malformed("Ed25519 JWK x must be 32 bytes".into()))?;
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AuthError::Malformed(format!("invalid Ed25519 JWK: {e}")))
    }
}

/// A P-256 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl EcJwk {
    pub fn from_verifying_key(key: &p256::ecdsa::VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        Self {
            kid: None,
            alg: Some(crate::jws::ALG_ES256.to_string()),
            crv: "P-256".to_string(),
            x: b64::encode(point.x().expect("uncompressed point has x")),
            y: b64::encode(point.y().expect("uncompressed point has y")),
        }
    }

    pub fn to_verifying_key(&self) -> Result<p256::ecdsa::VerifyingKey, AuthError> {
        if self.crv != "P-256" {
            return Err(AuthError::Malformed(format!(
                "unsupported EC curve {}",
                self.crv
            )));
        }
        let x = b64::decode(&self.x)?;
        let y = b64::decode(&self.y)?;
        if x.len() != 32 || y.len() != 32 {
            return Err(AuthError::Malformed(
                "P-256 JWK coordinates must be 32 bytes".into(),
            ));
        }
        let point = p256::EncodedPoint::from_affine_coordinates(
            p256::FieldBytes::from_slice(&x),
            p256::FieldBytes::from_slice(&y),
            false,
        );
        p256::ecdsa::VerifyingKey::from_encoded_point(&point)
            .map_err(|e| AuthError::Malformed(format!("invalid P-256 JWK: {e}")))
    }
}

/// A JSON Web Key Set as fetched from an OP's `jwks_uri`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid() == Some(kid))
    }
}
