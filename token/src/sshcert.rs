//! OpenSSH certificates as the PK Token's transport to `sshd`.
//!
//! The login side wraps the ephemeral public key in a user certificate,
//! stores the compact PK Token under the `openpubkey-pkt` extension, and
//! self-signs with the ephemeral key. The verify side re-derives everything
//! from the base64 blob `sshd` hands to its `AuthorizedKeysCommand`.

use rand::Rng;
use ssh_key::{
    certificate::{Builder as CertBuilder, CertType},
    Certificate, HashAlg,
};

use opkssh_common::error::AuthError;

use crate::{
    pktoken::{IdClaims, PkToken},
    signer::{self, ClientSigner},
};

/// Extension key carrying the compact PK Token.
pub const PKT_EXTENSION: &str = "openpubkey-pkt";

/// Certificates are backdated this far to absorb clock skew, seconds.
const BACKDATE_SECS: u64 = 60;

/// Certificate key types accepted from `sshd`.
pub const SUPPORTED_CERT_TYPES: &[&str] = &[
    "ssh-ed25519-cert-v01@openssh.com",
    "ecdsa-sha2-nistp256-cert-v01@openssh.com",
];

/// Issue the session certificate for a verified PK Token.
///
/// `valid_before` tracks the ID token's `exp`; the serial is random; the
/// key-id is the subject claim.
pub fn issue(
    pk_token: &PkToken,
    claims: &IdClaims,
    signer: &ClientSigner,
    principals: &[String],
    now: i64,
) -> Result<Certificate, AuthError> {
    let valid_after = (now as u64).saturating_sub(BACKDATE_SECS);
    let valid_before = claims.exp.max(0) as u64;

    let mut rng = rand::thread_rng();
    let mut builder = CertBuilder::new_with_random_nonce(
        &mut rng,
        signer.ssh_public().key_data().clone(),
        valid_after,
        valid_before,
    )
    .map_err(cert_err)?;
    builder.serial(rng.gen::<u64>()).map_err(cert_err)?;
    builder.cert_type(CertType::User).map_err(cert_err)?;
    builder.key_id(&claims.sub).map_err(cert_err)?;
    for principal in principals {
        builder.valid_principal(principal).map_err(cert_err)?;
    }
    builder
        .extension(PKT_EXTENSION, pk_token.to_compact()?)
        .map_err(cert_err)?;
    builder.comment(&claims.sub).map_err(cert_err)?;

    builder
        .sign(signer.ssh_private())
        .map_err(|e| AuthError::SigInvalid(format!("certificate signing: {e}")))
}

fn cert_err(err: ssh_key::Error) -> AuthError {
    AuthError::Malformed(format!("certificate build: {err}"))
}

/// Parse the authorized-key blob `sshd` passed us and recover the embedded
/// PK Token.
///
/// Accepts only user certificates of a supported type whose subject key
/// equals the CIC's ephemeral key, whose validity window contains `now`, and
/// whose signature verifies under the certificate's own key (the ephemeral
/// key acts as its own CA).
pub fn parse_and_extract(
    key_type: &str,
    blob_b64: &str,
    now: i64,
) -> Result<(Certificate, PkToken), AuthError> {
    if !SUPPORTED_CERT_TYPES.contains(&key_type) {
        return Err(AuthError::Malformed(format!(
            "unsupported key type {key_type}"
        )));
    }

    let cert = Certificate::from_openssh(&format!("{key_type} {blob_b64}"))
        .map_err(|e| AuthError::Malformed(format!("certificate parse: {e}")))?;
    if cert.cert_type() != CertType::User {
        return Err(AuthError::Malformed("not a user certificate".into()));
    }

    let compact = cert
        .extensions()
        .get(PKT_EXTENSION)
        .ok_or_else(|| AuthError::Malformed(format!("missing {PKT_EXTENSION} extension")))?;
    let pk_token = PkToken::from_compact(compact)?;

    let cic_header = pk_token.cic_header()?;
    let client_jwk = cic_header
        .jwk
        .ok_or_else(|| AuthError::Malformed("CIC header missing jwk".into()))?;
    if &signer::jwk_to_key_data(&client_jwk)? != cert.public_key() {
        return Err(AuthError::SigInvalid(
            "certificate key does not match the PK token client key".into(),
        ));
    }

    if cert.valid_before() as i64 <= now || cert.valid_after() as i64 > now {
        return Err(AuthError::Expired);
    }

    if cert.signature_key() != cert.public_key() {
        return Err(AuthError::SigInvalid(
            "certificate is not self-signed by its subject key".into(),
        ));
    }
    let ca_fingerprint = cert.signature_key().fingerprint(HashAlg::Sha256);
    cert.validate_at(now as u64, [&ca_fingerprint])
        .map_err(|e| AuthError::SigInvalid(format!("certificate signature: {e}")))?;

    Ok((cert, pk_token))
}

/// The `<type> <base64>` column pair of an OpenSSH line, as `sshd` splits it.
pub fn openssh_columns(cert: &Certificate) -> Result<(String, String), AuthError> {
    let line = cert
        .to_openssh()
        .map_err(|e| AuthError::Malformed(format!("certificate encoding: {e}")))?;
    let mut columns = line.split_whitespace();
    match (columns.next(), columns.next()) {
        (Some(key_type), Some(blob)) => Ok((key_type.to_string(), blob.to_string())),
        _ => Err(AuthError::Malformed("certificate line too short".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cic::Cic;
    use crate::signer::KeyAlg;
    use opkssh_common::{b64, jws};
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};
    use std::sync::OnceLock;

    const NOW: i64 = 1_700_000_000;

    fn op_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate RSA key")
        })
    }

    fn session(alg: KeyAlg) -> (PkToken, IdClaims, ClientSigner) {
        let signer = ClientSigner::generate(alg).unwrap();
        let cic = Cic::new(signer.public_jwk(), signer.jws_alg()).unwrap();

        let mut header = jws::ProtectedHeader::new(jws::ALG_RS256);
        header.kid = Some("k1".into());
        let protected = header.encode().unwrap();
        let payload = b64::encode(
            serde_json::to_vec(&serde_json::json!({
                "iss": "https://op.test/",
                "sub": "u@test",
                "aud": "cid",
                "exp": NOW + 3600,
                "iat": NOW,
                "nonce": cic.commitment(),
            }))
            .unwrap(),
        );
        let digest = Sha256::digest(jws::signing_input(&protected, &payload));
        let sig = op_key()
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        let id_token = format!("{protected}.{payload}.{}", b64::encode(sig));

        let pk_token = PkToken::build(&id_token, &signer, &cic).unwrap();
        let claims = pk_token.claims().unwrap();
        (pk_token, claims, signer)
    }

    #[test]
    fn test_issue_then_parse_roundtrip() {
        let (pk_token, claims, signer) = session(KeyAlg::Ed25519);
        let principals = vec!["alice".to_string()];
        let cert = issue(&pk_token, &claims, &signer, &principals, NOW).unwrap();

        assert_eq!(cert.key_id(), "u@test");
        assert_eq!(cert.valid_principals(), &principals[..]);
        assert_eq!(cert.valid_before(), (NOW + 3600) as u64);

        let (key_type, blob) = openssh_columns(&cert).unwrap();
        assert_eq!(key_type, "ssh-ed25519-cert-v01@openssh.com");
        let (parsed, recovered) = parse_and_extract(&key_type, &blob, NOW).unwrap();
        assert_eq!(recovered, pk_token, "PK token must survive the roundtrip");
        assert_eq!(parsed.public_key(), signer.ssh_public().key_data());
    }

    #[test]
    fn test_ecdsa_certificate_roundtrip() {
        let (pk_token, claims, signer) = session(KeyAlg::EcdsaP256);
        let cert = issue(&pk_token, &claims, &signer, &["bob".to_string()], NOW).unwrap();
        let (key_type, blob) = openssh_columns(&cert).unwrap();
        assert_eq!(key_type, "ecdsa-sha2-nistp256-cert-v01@openssh.com");
        parse_and_extract(&key_type, &blob, NOW).expect("ECDSA cert must parse");
    }

    #[test]
    fn test_rejects_unknown_key_type() {
        let err = parse_and_extract("ssh-rsa-cert-v01@openssh.com", "AAAA", NOW).unwrap_err();
        assert_eq!(err.code(), "malformed-input");
    }

    #[test]
    fn test_rejects_expired_window() {
        let (pk_token, claims, signer) = session(KeyAlg::Ed25519);
        let cert = issue(&pk_token, &claims, &signer, &["alice".to_string()], NOW).unwrap();
        let (key_type, blob) = openssh_columns(&cert).unwrap();

        let err = parse_and_extract(&key_type, &blob, claims.exp).unwrap_err();
        assert_eq!(err.code(), "expired", "valid_before <= now must reject");

        let err = parse_and_extract(&key_type, &blob, NOW - 3600).unwrap_err();
        assert_eq!(err.code(), "expired", "valid_after > now must reject");
    }

    #[test]
    fn test_rejects_foreign_key_certificate() {
        // Certificate signed by (and naming) a different key than the CIC's.
        let (pk_token, claims, _signer) = session(KeyAlg::Ed25519);
        let other = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let cert = issue(&pk_token, &claims, &other, &["alice".to_string()], NOW).unwrap();
        let (key_type, blob) = openssh_columns(&cert).unwrap();
        let err = parse_and_extract(&key_type, &blob, NOW).unwrap_err();
        assert_eq!(err.code(), "sig-invalid");
    }

    #[test]
    fn test_missing_extension_rejected() {
        // A plain user certificate without the PK token extension.
        let signer = ClientSigner::generate(KeyAlg::Ed25519).unwrap();
        let mut rng = rand::thread_rng();
        let mut builder = CertBuilder::new_with_random_nonce(
            &mut rng,
            signer.ssh_public().key_data().clone(),
            (NOW - 60) as u64,
            (NOW + 3600) as u64,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.key_id("bare").unwrap();
        builder.valid_principal("alice").unwrap();
        let cert = builder.sign(signer.ssh_private()).unwrap();

        let (key_type, blob) = openssh_columns(&cert).unwrap();
        let err = parse_and_extract(&key_type, &blob, NOW).unwrap_err();
        assert_eq!(err.code(), "malformed-input");
    }
}
