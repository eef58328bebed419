//! Wire and storage encodings.
//!
//! - The versioned token format `vault:v{version}:{base64}` shared by
//!   ciphertexts, signatures, HMACs and CMACs.
//! - Base64 helpers and serde adapters for binary fields of persisted JSON.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use base64::engine::general_purpose::URL_SAFE;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::constants::TOKEN_PREFIX;
use crate::error::Result;
use crate::error::TransitError;

/// A decoded `vault:v{version}:{payload}` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedToken {
    /// Key version that produced the payload.
    pub version: u32,
    /// Decoded payload bytes.
    pub payload: Vec<u8>,
}

/// Format a token from a version and raw payload.
pub fn format_token(version: u32, payload: &[u8]) -> String {
    format!("{}{}:{}", TOKEN_PREFIX, version, STANDARD.encode(payload))
}

/// Format a token whose payload is already encoded.
pub fn format_token_encoded(version: u32, encoded: &str) -> String {
    format!("{}{}:{}", TOKEN_PREFIX, version, encoded)
}

/// Split a token into its version and still-encoded payload.
///
/// Parsing is strict: exactly two `:`-separated fields must follow the
/// literal prefix and the version must be a positive decimal integer.
pub fn split_token(token: &str) -> Result<(u32, &str)> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| TransitError::InvalidToken {
        reason: format!("must start with '{TOKEN_PREFIX}'"),
    })?;

    let mut fields = rest.split(':');
    let (version_str, payload) = match (fields.next(), fields.next(), fields.next()) {
        (Some(v), Some(p), None) => (v, p),
        _ => {
            return Err(TransitError::InvalidToken {
                reason: "expected exactly one version/payload separator".into(),
            });
        }
    };

    if version_str.is_empty() || !version_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TransitError::InvalidToken {
            reason: format!("invalid version number '{version_str}'"),
        });
    }
    let version: u32 = version_str.parse().map_err(|_| TransitError::InvalidToken {
        reason: format!("invalid version number '{version_str}'"),
    })?;
    if version == 0 {
        return Err(TransitError::InvalidToken {
            reason: "version must be positive".into(),
        });
    }

    Ok((version, payload))
}

/// Parse and base64-decode a token.
pub fn parse_token(token: &str) -> Result<VersionedToken> {
    let (version, encoded) = split_token(token)?;
    let payload = STANDARD.decode(encoded).map_err(|e| TransitError::InvalidToken {
        reason: format!("invalid base64: {e}"),
    })?;
    Ok(VersionedToken { version, payload })
}

/// Standard base64 encoding.
pub fn encode_b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard base64, naming the field on failure.
pub fn decode_b64(field: &str, data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|_| TransitError::invalid(format!("failed to base64-decode {field}")))
}

/// Decode standard base64, falling back to the URL-safe alphabet.
pub fn decode_b64_lenient(field: &str, data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .map_err(|_| TransitError::invalid(format!("failed to base64-decode {field}")))
}

/// URL-safe base64 without padding, as used by JWS signatures.
pub fn encode_b64_url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode URL-safe base64 with or without padding.
pub fn decode_b64_url(field: &str, data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|_| TransitError::invalid(format!("failed to base64url-decode {field}")))
}

/// Serde adapter storing `Vec<u8>` as standard base64.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter storing `Vec<Vec<u8>>` as a list of base64 strings.
pub mod base64_list {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use serde::ser::SerializeSeq;

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded.into_iter().map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom)).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_format_and_parse() {
        let token = format_token(3, b"hello");
        assert_eq!(token, "vault:v3:aGVsbG8=");

        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "vault:",
            "vault:v",
            "vault:v1",
            "vault:v:aGVsbG8=",
            "vault:v0:aGVsbG8=",
            "vault:v-1:aGVsbG8=",
            "vault:v+1:aGVsbG8=",
            "vault:vx:aGVsbG8=",
            "vault:v1:aGVs:bG8=",
            "other:v1:aGVsbG8=",
            "vault:v1:!!!",
        ] {
            assert!(parse_token(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_lenient_decode_accepts_url_alphabet() {
        let data = [0xfbu8, 0xff, 0xbf];
        assert_eq!(STANDARD.encode(data), "+/+/");
        assert_eq!(decode_b64_lenient("blob", "+/+/").unwrap(), data);
        assert_eq!(decode_b64_lenient("blob", "-_-_").unwrap(), data);
        assert!(decode_b64("blob", "-_-_").is_err());
    }

    proptest! {
        #[test]
        fn prop_token_roundtrip(version in 1u32.., payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let parsed = parse_token(&format_token(version, &payload)).unwrap();
            prop_assert_eq!(parsed.version, version);
            prop_assert_eq!(parsed.payload, payload);
        }

        #[test]
        fn prop_parse_never_panics(input in ".*") {
            let _ = parse_token(&input);
        }
    }
}
