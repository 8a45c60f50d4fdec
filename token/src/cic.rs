//! Client-instance claims.
//!
//! The CIC protected header commits the login session to an ephemeral public
//! key before the OP is ever contacted: its SHA-256 hash travels to the OP as
//! the `nonce` of the authorization request, so the ID token the OP signs
//! binds the key without the OP knowing it. Build order breaks the apparent
//! cycle: header → commitment → authorization → payload → CIC signature.

use rand::RngCore;
use sha2::{Digest, Sha256};

use opkssh_common::{b64, error::AuthError, jwk::Jwk, jws::ProtectedHeader};

/// Length of the `rz` randomizer, bytes.
pub const RZ_LEN: usize = 32;

/// An immutable CIC protected header, held in its encoded form so the
/// commitment is computed over the exact segment later transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cic {
    protected_b64: String,
}

impl Cic {
    /// Build a CIC header for an ephemeral public key, with a fresh 256-bit
    /// randomizer.
    pub fn new(jwk: Jwk, alg: &str) -> Result<Self, AuthError> {
        let mut rz = [0u8; RZ_LEN];
        rand::thread_rng().fill_bytes(&mut rz);
        Self::with_rz(jwk, alg, &rz)
    }

    pub fn with_rz(jwk: Jwk, alg: &str, rz: &[u8; RZ_LEN]) -> Result<Self, AuthError> {
        let mut header = ProtectedHeader::new(alg);
        header.jwk = Some(jwk);
        header.rz = Some(b64::encode(rz));
        Ok(Self {
            protected_b64: header.encode()?,
        })
    }

    /// Rehydrate from a received segment.
    pub fn from_segment(protected_b64: impl Into<String>) -> Self {
        Self {
            protected_b64: protected_b64.into(),
        }
    }

    pub fn protected_b64(&self) -> &str {
        &self.protected_b64
    }

    /// The value placed into the authorization request's `nonce`.
    pub fn commitment(&self) -> String {
        commitment_of(&self.protected_b64)
    }
}

/// SHA-256 of the ASCII bytes of the encoded header, base64url-no-pad.
pub fn commitment_of(protected_b64: &str) -> String {
    b64::encode(Sha256::digest(protected_b64.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opkssh_common::jwk::OkpJwk;

    fn client_jwk() -> Jwk {
        let key = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
        Jwk::Okp(OkpJwk::from_verifying_key(&key.verifying_key()))
    }

    #[test]
    fn test_commitment_is_hash_of_encoded_header() {
        let cic = Cic::with_rz(client_jwk(), "EdDSA", &[1u8; RZ_LEN]).unwrap();
        let expected = b64::encode(Sha256::digest(cic.protected_b64().as_bytes()));
        assert_eq!(cic.commitment(), expected);
    }

    #[test]
    fn test_commitment_is_deterministic_for_fixed_rz() {
        let a = Cic::with_rz(client_jwk(), "EdDSA", &[9u8; RZ_LEN]).unwrap();
        let b = Cic::with_rz(client_jwk(), "EdDSA", &[9u8; RZ_LEN]).unwrap();
        assert_eq!(a.commitment(), b.commitment());
    }

    #[test]
    fn test_fresh_rz_changes_commitment() {
        let a = Cic::new(client_jwk(), "EdDSA").unwrap();
        let b = Cic::new(client_jwk(), "EdDSA").unwrap();
        assert_ne!(
            a.commitment(),
            b.commitment(),
            "rz must randomize the commitment"
        );
    }

    #[test]
    fn test_header_carries_jwk_and_rz() {
        let cic = Cic::new(client_jwk(), "EdDSA").unwrap();
        let header = ProtectedHeader::decode(cic.protected_b64()).unwrap();
        assert_eq!(header.alg, "EdDSA");
        assert_eq!(header.jwk, Some(client_jwk()));
        let rz = b64::decode(header.rz.unwrap()).unwrap();
        assert_eq!(rz.len(), RZ_LEN);
    }
}
