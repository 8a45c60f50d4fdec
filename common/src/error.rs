//! Error kinds shared across the workspace.
//!
//! Each variant carries one of the stable codes surfaced in the verify log;
//! `sshd` only ever sees an empty stdout, so the code is the operator's
//! primary debugging handle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad JWS, bad base64, certificate parse failure.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Token issuer is not in the configured provider list.
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    /// JWKS has no matching key, even after a refresh.
    #[error("unknown kid: {0}")]
    UnknownKid(String),

    /// RS256, GQ, CIC, or certificate signature verification failed.
    #[error("signature invalid: {0}")]
    SigInvalid(String),

    /// The CIC commitment does not match the token's commitment claim.
    #[error("client-instance commitment does not match token nonce")]
    NonceMismatch,

    /// `exp` is in the past, or the certificate's validity window closed.
    #[error("token or certificate expired")]
    Expired,

    /// `iat` is outside the configured tolerance window.
    #[error("issued-at outside clock-skew tolerance")]
    ClockSkew,

    /// No policy entry authorizes the requested principal.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Network or subprocess deadline exceeded.
    #[error("i/o timeout: {0}")]
    IoTimeout(String),

    /// Network or filesystem failure after retries.
    #[error("i/o error: {0}")]
    Io(String),

    /// Malformed provider list or policy entry.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    /// Stable code written to the verify log.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Malformed(_) => "malformed-input",
            AuthError::UnknownIssuer(_) => "unknown-issuer",
            AuthError::UnknownKid(_) => "unknown-kid",
            AuthError::SigInvalid(_) => "sig-invalid",
            AuthError::NonceMismatch => "nonce-mismatch",
            AuthError::Expired => "expired",
            AuthError::ClockSkew => "clock-skew",
            AuthError::PolicyDenied(_) => "policy-denied",
            AuthError::IoTimeout(_) => "io-timeout",
            AuthError::Io(_) => "io-error",
            AuthError::Configuration(_) => "configuration-error",
        }
    }

    pub fn io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            AuthError::IoTimeout(err.to_string())
        } else {
            AuthError::Io(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AuthError::Malformed("x".into()).code(), "malformed-input");
        assert_eq!(AuthError::NonceMismatch.code(), "nonce-mismatch");
        assert_eq!(AuthError::ClockSkew.code(), "clock-skew");
        assert_eq!(
            AuthError::PolicyDenied("no entry".into()).code(),
            "policy-denied"
        );
    }

    #[test]
    fn test_timeout_kind_maps_to_io_timeout() {
        let err = AuthError::io(std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline"));
        assert_eq!(err.code(), "io-timeout");

        let err = AuthError::io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.code(), "io-error");
    }
}
