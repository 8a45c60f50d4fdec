//! Ephemeral client keys.
//!
//! One keypair exists per login session. It signs the CIC leg of the PK
//! Token as a JWS (EdDSA or ES256) and self-signs the SSH certificate that
//! carries the token, so the same key material needs both a JOSE and an
//! OpenSSH face.

use ed25519_dalek::Signer as _;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use ssh_key::{
    private::{Ed25519Keypair, KeypairData},
    public::KeyData,
    Algorithm, EcdsaCurve, PrivateKey,
};

use opkssh_common::{
    b64,
    error::AuthError,
    jwk::{EcJwk, Jwk, OkpJwk},
    jws::{ALG_EDDSA, ALG_ES256},
};

/// Client key algorithms supported for the ephemeral key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlg {
    Ed25519,
    EcdsaP256,
}

impl KeyAlg {
    pub fn jws_alg(&self) -> &'static str {
        match self {
            KeyAlg::Ed25519 => ALG_EDDSA,
            KeyAlg::EcdsaP256 => ALG_ES256,
        }
    }

    /// Stem for `~/.ssh/id_<alg>` and the paired `-cert.pub`.
    pub fn file_stem(&self) -> &'static str {
        match self {
            KeyAlg::Ed25519 => "id_ed25519",
            KeyAlg::EcdsaP256 => "id_ecdsa",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AuthError> {
        match s {
            "ed25519" => Ok(KeyAlg::Ed25519),
            "ecdsa" => Ok(KeyAlg::EcdsaP256),
            _ => Err(AuthError::Configuration(format!(
                "unsupported key algorithm {s:?}"
            ))),
        }
    }
}

enum SigningInner {
    Ed25519(ed25519_dalek::SigningKey),
    EcdsaP256(p256::ecdsa::SigningKey),
}

/// The ephemeral client signer: JOSE signing key plus its OpenSSH twin.
pub struct ClientSigner {
    inner: SigningInner,
    ssh: PrivateKey,
}

impl ClientSigner {
    pub fn generate(alg: KeyAlg) -> Result<Self, AuthError> {
        match alg {
            KeyAlg::Ed25519 => {
                let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
                let keypair = Ed25519Keypair::from_seed(&signing.to_bytes());
                let ssh = PrivateKey::new(KeypairData::Ed25519(keypair), "opkssh")
                    .map_err(|e| AuthError::Malformed(format!("SSH key assembly: {e}")))?;
                Ok(Self {
                    inner: SigningInner::Ed25519(signing),
                    ssh,
                })
            }
            KeyAlg::EcdsaP256 => {
                let ssh = PrivateKey::random(
                    &mut OsRng,
                    Algorithm::Ecdsa {
                        curve: EcdsaCurve::NistP256,
                    },
                )
                .map_err(|e| AuthError::Malformed(format!("SSH key generation: {e}")))?;
                let signing = match ssh.key_data() {
                    KeypairData::Ecdsa(ssh_key::private::EcdsaKeypair::NistP256 {
                        private,
                        ..
                    }) => p256::ecdsa::SigningKey::from_slice(private.as_slice())
                        .map_err(|e| AuthError::Malformed(format!("P-256 scalar: {e}")))?,
                    _ => {
                        return Err(AuthError::Malformed(
                            "generated key has unexpected algorithm".into(),
                        ))
                    }
                };
                Ok(Self {
                    inner: SigningInner::EcdsaP256(signing),
                    ssh,
                })
            }
        }
    }

    pub fn alg(&self) -> KeyAlg {
        match self.inner {
            SigningInner::Ed25519(_) => KeyAlg::Ed25519,
            SigningInner::EcdsaP256(_) => KeyAlg::EcdsaP256,
        }
    }

    pub fn jws_alg(&self) -> &'static str {
        self.alg().jws_alg()
    }

    /// The ephemeral public key as a JWK, for the CIC header.
    pub fn public_jwk(&self) -> Jwk {
        match &self.inner {
            SigningInner::Ed25519(key) => {
                Jwk::Okp(OkpJwk::from_verifying_key(&key.verifying_key()))
            }
            SigningInner::EcdsaP256(key) => {
                Jwk::Ec(EcJwk::from_verifying_key(key.verifying_key()))
            }
        }
    }

    pub fn ssh_private(&self) -> &PrivateKey {
        &self.ssh
    }

    pub fn ssh_public(&self) -> ssh_key::PublicKey {
        self.ssh.public_key().clone()
    }

    /// Raw JWS signature bytes over `data` (64 bytes for both algorithms).
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        match &self.inner {
            SigningInner::Ed25519(key) => key.sign(data).to_bytes().to_vec(),
            SigningInner::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key.sign(data);
                signature.to_bytes().to_vec()
            }
        }
    }
}

/// Verify a raw JWS signature against the public key inside a CIC header.
pub fn verify_with_jwk(jwk: &Jwk, alg: &str, data: &[u8], sig: &[u8]) -> Result<(), AuthError> {
    match (jwk, alg) {
        (Jwk::Okp(okp), ALG_EDDSA) => {
            let key = okp.to_verifying_key()?;
            let signature = ed25519_dalek::Signature::from_slice(sig)
                .map_err(|e| AuthError::SigInvalid(format!("Ed25519 signature: {e}")))?;
            key.verify_strict(data, &signature)
                .map_err(|e| AuthError::SigInvalid(format!("client signature: {e}")))
        }
        (Jwk::Ec(ec), ALG_ES256) => {
            let key = ec.to_verifying_key()?;
            let signature = p256::ecdsa::Signature::from_slice(sig)
                .map_err(|e| AuthError::SigInvalid(format!("ECDSA signature: {e}")))?;
            key.verify(data, &signature)
                .map_err(|e| AuthError::SigInvalid(format!("client signature: {e}")))
        }
        _ => Err(AuthError::SigInvalid(format!(
            "client key type does not match alg {alg}"
        ))),
    }
}

/// Convert a client JWK to its OpenSSH form, for comparison against the
/// certificate's subject key.
pub fn jwk_to_key_data(jwk: &Jwk) -> Result<KeyData, AuthError> {
    match jwk {
        Jwk::Okp(okp) => {
            let key = okp.to_verifying_key()?;
            Ok(KeyData::Ed25519(ssh_key::public::Ed25519PublicKey(
                key.to_bytes(),
            )))
        }
        Jwk::Ec(ec) => {
            let key = ec.to_verifying_key()?;
            Ok(KeyData::Ecdsa(ssh_key::public::EcdsaPublicKey::NistP256(
                key.to_encoded_point(false),
            )))
        }
        Jwk::Rsa(_) => Err(AuthError::Malformed(
            "RSA is not a supported client key type".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_verify_roundtrip() {
        let signer = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let data = b"cic-header.payload";
        let sig = signer.sign(data);
        assert_eq!(sig.len(), 64);
        verify_with_jwk(&signer.public_jwk(), signer.jws_alg(), data, &sig)
            .expect("own signature must verify");
    }

    #[test]
    fn test_ecdsa_sign_verify_roundtrip() {
        let signer = ClientSigner::generate(KeyAlg::EcdsaP256).unwrap();
        let data = b"cic-header.payload";
        let sig = signer.sign(data);
        assert_eq!(sig.len(), 64, "ES256 is fixed-width r||s");
        verify_with_jwk(&signer.public_jwk(), signer.jws_alg(), data, &sig)
            .expect("own signature must verify");
    }

    #[test]
    fn test_tampered_payload_fails() {
        let signer = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let sig = signer.sign(b"original");
        let err = verify_with_jwk(&signer.public_jwk(), signer.jws_alg(), b"tampered", &sig)
            .unwrap_err();
        assert_eq!(err.code(), "sig-invalid");
    }

    #[test]
    fn test_alg_key_mismatch_fails() {
        let signer = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let sig = signer.sign(b"data");
        let err = verify_with_jwk(&signer.public_jwk(), ALG_ES256, b"data", &sig).unwrap_err();
        assert_eq!(err.code(), "sig-invalid");
    }

    #[test]
    fn test_jwk_matches_ssh_key_data() {
        for alg in [KeyAlg::Ed25519, KeyAlg::EcdsaP256] {
            let signer = ClientSigner::generate(alg).unwrap();
            let key_data = jwk_to_key_data(&signer.public_jwk()).unwrap();
            assert_eq!(
                &key_data,
                signer.ssh_public().key_data(),
                "JWK and SSH views must agree for {alg:?}"
            );
        }
    }
}
