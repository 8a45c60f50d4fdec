//! Guillou-Quisquater signature transform.
//!
//! Replaces an OP's RS256 signature over an ID token with a non-interactive
//! zero-knowledge proof that the signature existed. The verification relation
//! is the RSA one, `σ^e ≡ ŷ (mod n)`, so the GQ exponent is the RSA public
//! exponent `e` itself; the security parameter ν only sizes the challenge.
//! Challenges are chunked to `bits(e) - 1` bits, so every chunk is
//! strictly below `e`, and the proof runs `ceil(ν / chunk_bits)` parallel
//! rounds (16 for GQ256 with e = 65537).
//!
//! Proof wire format, fixed widths: `C ‖ Z` where `C` is the
//! `rounds · chunk_bytes` challenge string and `Z` is `rounds` responses of
//! modulus length each.

use num_bigint_dig::{BigUint, ModInverse, RandBigInt};
use rsa::{pkcs1::EncodeRsaPublicKey, traits::PublicKeyParts, RsaPublicKey};
use sha2::{Digest, Sha256};

use opkssh_common::{
    b64,
    error::AuthError,
    jwk::{Jwk, RsaJwk},
    jws::{self, CompactJws, ProtectedHeader, ALG_GQ256, ALG_RS256},
};

/// Security parameter for the `GQ256` JWS algorithm, bits.
pub const SECURITY_BITS_256: usize = 256;
/// Reduced-strength parameter, bits.
pub const SECURITY_BITS_128: usize = 128;

/// ASN.1 DigestInfo prefix for SHA-256 under EMSA-PKCS1-v1_5.
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

const CHALLENGE_DOMAIN_TAG: &[u8] = b"opkssh-gq-challenge-v1";

pub struct GqSignerVerifier {
    n: BigUint,
    e: BigUint,
    n_be: Vec<u8>,
    e_be: Vec<u8>,
    pubkey_der: Vec<u8>,
    jkt: String,
    n_bytes: usize,
    chunk_bytes: usize,
    rounds: usize,
}

impl GqSignerVerifier {
    /// Derive GQ parameters from the OP's RSA public key and ν ∈ {128, 256}.
    pub fn new(key: &RsaPublicKey, security_bits: usize) -> Result<Self, AuthError> {
        if security_bits != SECURITY_BITS_128 && security_bits != SECURITY_BITS_256 {
            return Err(AuthError::Configuration(format!(
                "unsupported GQ security parameter {security_bits}"
            )));
        }
        let n = key.n().clone();
        let e = key.e().clone();
        let e_be = e.to_bytes_be();
        if e < BigUint::from(3u8) || e_be.last().is_none_or(|b| b & 1 == 0) {
            return Err(AuthError::Configuration(
                "GQ requires an odd RSA public exponent >= 3".into(),
            ));
        }

        let chunk_bytes = ((e.bits() - 1) / 8).max(1);
        let chunk_bits = chunk_bytes * 8;
        let rounds = security_bits.div_ceil(chunk_bits);

        let pubkey_der = key
            .to_pkcs1_der()
            .map_err(|err| AuthError::Malformed(format!("RSA key encoding: {err}")))?
            .as_bytes()
            .to_vec();
        let jkt = Jwk::Rsa(RsaJwk::from_public_key(None, key)).thumbprint();

        Ok(Self {
            n_be: n.to_bytes_be(),
            n_bytes: n.bits().div_ceil(8),
            n,
            e,
            e_be,
            pubkey_der,
            jkt,
            chunk_bytes,
            rounds,
        })
    }

    /// RFC 7638 thumbprint of the OP key these parameters were derived from.
    pub fn jkt(&self) -> &str {
        &self.jkt
    }

    pub fn proof_len(&self) -> usize {
        self.rounds * (self.chunk_bytes + self.n_bytes)
    }

    /// EMSA-PKCS1-v1_5 message representative the OP signed.
    fn padded_hash(&self, identity: &[u8]) -> Result<BigUint, AuthError> {
        let t_len = SHA256_DIGEST_INFO.len() + 32;
        if self.n_bytes < t_len + 11 {
            return Err(AuthError::Configuration("RSA modulus too small".into()));
        }
        let mut em = vec![0xff; self.n_bytes];
        em[0] = 0x00;
        em[1] = 0x01;
        em[self.n_bytes - t_len - 1] = 0x00;
        em[self.n_bytes - t_len..self.n_bytes - 32].copy_from_slice(&SHA256_DIGEST_INFO);
        em[self.n_bytes - 32..].copy_from_slice(&Sha256::digest(identity));
        Ok(BigUint::from_bytes_be(&em))
    }

    /// SHA-256 counter-mode expansion over the public parameters, the signed
    /// identity, and the commitment string, truncated to the challenge width.
    fn challenge(&self, identity: &[u8], commitments: &[u8]) -> Vec<u8> {
        let len = self.rounds * self.chunk_bytes;
        let parts: [&[u8]; 5] = [&self.n_be, &self.e_be, &self.pubkey_der, identity, commitments];
        let mut out = Vec::with_capacity(len + 32);
        let mut counter = 0u32;
        while out.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(CHALLENGE_DOMAIN_TAG);
            hasher.update(counter.to_be_bytes());
            for part in parts {
                hasher.update((part.len() as u64).to_be_bytes());
                hasher.update(part);
            }
            out.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        out.truncate(len);
        out
    }

    fn to_fixed_be(&self, value: &BigUint) -> Vec<u8> {
        let raw = value.to_bytes_be();
        let mut out = vec![0u8; self.n_bytes - raw.len()];
        out.extend_from_slice(&raw);
        out
    }

    /// Produce a GQ proof for `rsa_signature`, a PKCS#1 v1.5 / SHA-256
    /// signature over `identity` under the configured public key.
    pub fn prove(&self, rsa_signature: &[u8], identity: &[u8]) -> Result<Vec<u8>, AuthError> {
        if rsa_signature.len() != self.n_bytes {
            return Err(AuthError::Malformed(format!(
                "RSA signature is {} bytes, modulus is {}",
                rsa_signature.len(),
                self.n_bytes
            )));
        }
        let sigma = BigUint::from_bytes_be(rsa_signature);
        if sigma >= self.n {
            return Err(AuthError::Malformed("RSA signature out of range".into()));
        }
        // The proof is only sound for a signature that actually verifies;
        // catch a mismatched key before emitting garbage.
        let y = self.padded_hash(identity)?;
        if sigma.modpow(&self.e, &self.n) != y {
            return Err(AuthError::SigInvalid(
                "RSA signature does not verify under the GQ public key".into(),
            ));
        }

        let mut rng = rand::thread_rng();
        let zero = BigUint::from(0u8);
        let mut nonces = Vec::with_capacity(self.rounds);
        let mut commitments = Vec::with_capacity(self.rounds * self.n_bytes);
        for _ in 0..self.rounds {
            let r = loop {
                let candidate = rng.gen_biguint_below(&self.n);
                if candidate != zero {
                    break candidate;
                }
            };
            commitments.extend_from_slice(&self.to_fixed_be(&r.modpow(&self.e, &self.n)));
            nonces.push(r);
        }

        let challenge = self.challenge(identity, &commitments);
        let mut proof = challenge.clone();
        for (i, r) in nonces.iter().enumerate() {
            let c_i = BigUint::from_bytes_be(
                &challenge[i * self.chunk_bytes..(i + 1) * self.chunk_bytes],
            );
            let z_i = (r * sigma.modpow(&c_i, &self.n)) % &self.n;
            proof.extend_from_slice(&self.to_fixed_be(&z_i));
        }
        Ok(proof)
    }

    /// Verify a GQ proof over `identity`.
    pub fn verify(&self, identity: &[u8], proof: &[u8]) -> Result<(), AuthError> {
        if proof.len() != self.proof_len() {
            return Err(AuthError::Malformed(format!(
                "GQ proof is {} bytes, expected {}",
                proof.len(),
                self.proof_len()
            )));
        }
        let (challenge, responses) = proof.split_at(self.rounds * self.chunk_bytes);

        let y = self.padded_hash(identity)?;
        let y_inv = (&y)
            .mod_inverse(&self.n)
            .and_then(|inv| inv.to_biguint())
            .ok_or_else(|| {
                AuthError::SigInvalid("message representative not invertible".into())
            })?;

        let zero = BigUint::from(0u8);
        let mut commitments = Vec::with_capacity(self.rounds * self.n_bytes);
        for i in 0..self.rounds {
            let c_i = BigUint::from_bytes_be(
                &challenge[i * self.chunk_bytes..(i + 1) * self.chunk_bytes],
            );
            let z_i =
                BigUint::from_bytes_be(&responses[i * self.n_bytes..(i + 1) * self.n_bytes]);
            if z_i == zero || z_i >= self.n {
                return Err(AuthError::SigInvalid("GQ response out of range".into()));
            }
            let w_i = (z_i.modpow(&self.e, &self.n) * y_inv.modpow(&c_i, &self.n)) % &self.n;
            commitments.extend_from_slice(&self.to_fixed_be(&w_i));
        }

        if self.challenge(identity, &commitments) != challenge {
            return Err(AuthError::SigInvalid("GQ challenge mismatch".into()));
        }
        Ok(())
    }

    /// Transform an RS256 compact JWS into its GQ256 form.
    ///
    /// The new protected header carries the *entire* original protected
    /// segment in `kid` (the verifier needs it to reconstruct the signing
    /// input the OP's RSA signature covered) plus the OP key thumbprint in
    /// `jkt`. The payload segment is untouched.
    pub fn sign_jwt(&self, id_token: &str) -> Result<String, AuthError> {
        let jws = CompactJws::parse(id_token)?;
        let orig_header = ProtectedHeader::decode(&jws.protected)?;
        if orig_header.alg != ALG_RS256 {
            return Err(AuthError::Malformed(format!(
                "cannot GQ-sign a token with alg {}",
                orig_header.alg
            )));
        }

        let proof = self.prove(&jws.decoded_signature()?, &jws.signing_input())?;

        let mut header = ProtectedHeader::new(ALG_GQ256);
        header.typ = Some("JWT".to_string());
        header.kid = Some(jws.protected.clone());
        header.jkt = Some(self.jkt.clone());

        Ok(CompactJws {
            protected: header.encode()?,
            payload: jws.payload,
            signature: b64::encode(proof),
        }
        .to_compact())
    }

    /// Verify a GQ256 compact JWS produced by [`Self::sign_jwt`].
    pub fn verify_jwt(&self, gq_token: &str) -> Result<(), AuthError> {
        let jws = CompactJws::parse(gq_token)?;
        let header = ProtectedHeader::decode(&jws.protected)?;
        if header.alg != ALG_GQ256 {
            return Err(AuthError::Malformed(format!(
                "expected alg GQ256, got {}",
                header.alg
            )));
        }
        let orig_protected = header
            .kid
            .ok_or_else(|| AuthError::Malformed("GQ header missing embedded original".into()))?;
        let identity = jws::signing_input(&orig_protected, &jws.payload);
        self.verify(&identity, &jws.decoded_signature()?)
    }
}

/// Recover the original OP protected header embedded in a GQ256 header.
pub fn original_header(gq_header: &ProtectedHeader) -> Result<ProtectedHeader, AuthError> {
    let segment = gq_header
        .kid
        .as_deref()
        .ok_or_else(|| AuthError::Malformed("GQ header missing embedded original".into()))?;
    ProtectedHeader::decode(segment)
}
