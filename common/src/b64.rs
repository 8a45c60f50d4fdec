//! base64url (no padding) helpers.
//!
//! Every JOSE segment in this workspace (JWS headers, payloads, signatures,
//! JWK coordinates, the compact PK Token) uses base64url without padding
//! per [RFC 7515](https://www.rfc-editor.org/rfc/rfc7515#section-2).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::AuthError;

pub fn encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn decode(data: impl AsRef<[u8]>) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| AuthError::Malformed(format!("invalid base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_unpadded() {
        // 1 byte encodes to 2 chars; padded base64 would append "==".
        assert_eq!(encode([0xfb]), "-w");
    }

    #[test]
    fn test_decode_rejects_padding() {
        assert!(decode("AAA=").is_err(), "padded input must be rejected");
    }

    #[test]
    fn test_roundtrip() {
        let data = b"opkssh roundtrip \x00\xff";
        assert_eq!(decode(encode(data)).unwrap(), data);
    }
}
