//! HMAC over any key type and AES-CMAC over the CMAC types.

use aes::Aes128;
use aes::Aes256;
use cmac::Cmac;
use cmac::Mac;
use subtle::ConstantTimeEq;

use super::hash::HashAlgorithm;
use super::hmac_digest;
use crate::codec::format_token;
use crate::codec::parse_token;
use crate::constants::CMAC_BLOCK_SIZE;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::AesBits;
use crate::key_type::KeyKind;
use crate::policy::Policy;

/// Validate a requested CMAC length; zero selects the full block.
pub fn effective_mac_length(mac_length: usize) -> Result<usize> {
    match mac_length {
        0 => Ok(CMAC_BLOCK_SIZE),
        n if n <= CMAC_BLOCK_SIZE => Ok(n),
        n => Err(TransitError::invalid(format!(
            "mac_length {n} is invalid, must be between 0 and {CMAC_BLOCK_SIZE}"
        ))),
    }
}

impl Policy {
    /// HMAC key of a version.
    fn hmac_key(&self, version: u32) -> Result<&[u8]> {
        if self.kind.supports_cmac() {
            return Err(TransitError::Unsupported {
                operation: "hmac".into(),
                key_type: self.kind,
            });
        }
        let entry = self.entry(version)?;
        let key = if self.kind == KeyKind::Hmac { &entry.key } else { &entry.hmac_key };
        if key.is_empty() {
            return Err(TransitError::Internal {
                reason: format!("no hmac key exists for version {version}"),
            });
        }
        Ok(key.as_slice())
    }

    /// HMAC `input` with `version` (0 for latest).
    pub fn hmac(&self, version: u32, input: &[u8], algorithm: HashAlgorithm) -> Result<String> {
        let version = self.resolve_write_version("hmac", version)?;
        let mac = hmac_digest(algorithm, self.hmac_key(version)?, input)?;
        Ok(format_token(version, &mac))
    }

    /// Check an HMAC token in constant time.
    pub fn verify_hmac(&self, token: &str, input: &[u8], algorithm: HashAlgorithm) -> Result<bool> {
        let token = parse_token(token)?;
        self.check_read_version(token.version)?;
        let expected = hmac_digest(algorithm, self.hmac_key(token.version)?, input)?;
        Ok(bool::from(expected.ct_eq(&token.payload)))
    }

    fn cmac_tag(&self, version: u32, input: &[u8], mac_length: usize) -> Result<Vec<u8>> {
        let mac_length = effective_mac_length(mac_length)?;
        let key = &self.entry(version)?.key;
        let invalid_key = |e: cmac::digest::InvalidLength| TransitError::Crypto {
            reason: format!("invalid cmac key: {e}"),
        };
        let mut tag = match self.kind {
            KeyKind::AesCmac(AesBits::B128) => {
                let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(input);
                mac.finalize().into_bytes().to_vec()
            }
            KeyKind::AesCmac(AesBits::B256) => {
                let mut mac = <Cmac<Aes256> as Mac>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(input);
                mac.finalize().into_bytes().to_vec()
            }
            other => {
                return Err(TransitError::Unsupported {
                    operation: "cmac".into(),
                    key_type: other,
                });
            }
        };
        tag.truncate(mac_length);
        Ok(tag)
    }

    /// CMAC `input` with `version` (0 for latest), truncated to `mac_length`.
    pub fn cmac(&self, version: u32, input: &[u8], mac_length: usize) -> Result<String> {
        if !self.kind.supports_cmac() {
            return Err(TransitError::Unsupported {
                operation: "cmac".into(),
                key_type: self.kind,
            });
        }
        let version = self.resolve_write_version("cmac", version)?;
        let tag = self.cmac_tag(version, input, mac_length)?;
        Ok(format_token(version, &tag))
    }

    /// Check a CMAC token in constant time.
    pub fn verify_cmac(&self, token: &str, input: &[u8], mac_length: usize) -> Result<bool> {
        if !self.kind.supports_cmac() {
            return Err(TransitError::Unsupported {
                operation: "cmac verification".into(),
                key_type: self.kind,
            });
        }
        let token = parse_token(token)?;
        self.check_read_version(token.version)?;
        let expected = self.cmac_tag(token.version, input, mac_length)?;
        Ok(bool::from(expected.ct_eq(&token.payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_type::Curve;
    use crate::policy::tests::make_ctx;
    use crate::policy::tests::make_policy;

    #[tokio::test]
    async fn test_hmac_round_trip_and_version_floor() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "h", KeyKind::Ecdsa(Curve::P256)).await;
        let token = policy.hmac(0, b"data", HashAlgorithm::Sha3_256).unwrap();
        assert!(policy.verify_hmac(&token, b"data", HashAlgorithm::Sha3_256).unwrap());
        assert!(!policy.verify_hmac(&token, b"data", HashAlgorithm::Sha2_256).unwrap());
        assert!(!policy.verify_hmac(&token, b"tampered", HashAlgorithm::Sha3_256).unwrap());

        policy.rotate(&ctx).await.unwrap();
        policy.min_decryption_version = 2;
        let err = policy.verify_hmac(&token, b"data", HashAlgorithm::Sha3_256).unwrap_err();
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_hmac_type_uses_its_key() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "h", KeyKind::Hmac).await;
        let token = policy.hmac(1, b"data", HashAlgorithm::Sha2_512).unwrap();
        let expected = hmac_digest(HashAlgorithm::Sha2_512, &policy.entry(1).unwrap().key, b"data").unwrap();
        assert_eq!(parse_token(&token).unwrap().payload, expected);
    }

    #[tokio::test]
    async fn test_cmac_lengths() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "c", KeyKind::AesCmac(AesBits::B128)).await;

        let full = policy.cmac(0, b"data", 0).unwrap();
        assert_eq!(parse_token(&full).unwrap().payload.len(), 16);
        assert!(policy.verify_cmac(&full, b"data", 16).unwrap());

        let short = policy.cmac(0, b"data", 8).unwrap();
        assert_eq!(parse_token(&short).unwrap().payload.len(), 8);
        assert!(policy.verify_cmac(&short, b"data", 8).unwrap());
        assert!(!policy.verify_cmac(&short, b"data", 16).unwrap());

        assert!(policy.cmac(0, b"data", 17).is_err());
        assert!(policy.hmac(0, b"data", HashAlgorithm::Sha2_256).is_err());
    }

    #[tokio::test]
    async fn test_cmac_rejected_on_other_types() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "a", KeyKind::Aes(AesBits::B256)).await;
        assert!(matches!(policy.cmac(0, b"d", 0), Err(TransitError::Unsupported { .. })));
    }
}
