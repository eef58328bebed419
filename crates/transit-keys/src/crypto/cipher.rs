//! Encryption and decryption: AEAD for symmetric types, RSA for the RSA family.

use std::str::FromStr;

use aes_gcm::Aes128Gcm;
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::Nonce;
use aes_gcm::aead::Payload;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rsa::Oaep;
use rsa::Pkcs1v15Encrypt;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::asymmetric;
use super::hash::HashAlgorithm;
use super::hmac_digest;
use super::random_bytes;
use crate::codec::format_token;
use crate::codec::parse_token;
use crate::constants::AEAD_NONCE_SIZE;
use crate::entry::ConvergentVersion;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::AesBits;
use crate::key_type::KeyKind;
use crate::policy::Policy;

/// Length of the nonce HMAC key derived alongside the AEAD key by convergent V3.
const CONVERGENT_HMAC_KEY_SIZE: usize = 32;

/// RSA encryption padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingScheme {
    /// OAEP with SHA-256.
    #[default]
    Oaep,
    /// PKCS#1 v1.5.
    Pkcs1v15,
}

impl FromStr for PaddingScheme {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oaep" => Ok(PaddingScheme::Oaep),
            "pkcs1v15" => Ok(PaddingScheme::Pkcs1v15),
            other => Err(TransitError::invalid(format!("unsupported padding scheme {other}"))),
        }
    }
}

/// Per-request inputs to encrypt and decrypt besides the data itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct CipherParams<'a> {
    /// Derivation context; required for derived policies.
    pub context: &'a [u8],
    /// Caller nonce; only for convergent version 1.
    pub nonce: &'a [u8],
    /// Additional authenticated data; AEAD types only.
    pub associated_data: &'a [u8],
    /// RSA padding; RSA types only.
    pub padding: Option<PaddingScheme>,
}

impl Policy {
    /// Encrypt `plaintext` under `version` (0 for latest) into a versioned token.
    pub fn encrypt(&self, version: u32, plaintext: &[u8], params: &CipherParams<'_>) -> Result<String> {
        if !self.kind.supports_encryption() {
            return Err(TransitError::Unsupported {
                operation: "encryption".into(),
                key_type: self.kind,
            });
        }
        self.check_padding_allowed(params)?;
        let version = self.resolve_write_version("encryption", version)?;

        let ciphertext = match self.kind {
            KeyKind::Rsa(_) => {
                let key = asymmetric::rsa_public(self.entry(version)?)?;
                let result = match params.padding.unwrap_or_default() {
                    PaddingScheme::Oaep => key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext),
                    PaddingScheme::Pkcs1v15 => key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext),
                };
                result.map_err(|e| match e {
                    rsa::Error::MessageTooLong => TransitError::invalid("plaintext is too long for the RSA key"),
                    other => TransitError::Crypto {
                        reason: format!("rsa encryption failed: {other}"),
                    },
                })?
            }
            _ => self.seal(version, plaintext, params)?,
        };

        Ok(format_token(version, &ciphertext))
    }

    /// Decrypt a versioned token.
    pub fn decrypt(&self, ciphertext: &str, params: &CipherParams<'_>) -> Result<Zeroizing<Vec<u8>>> {
        if !self.kind.supports_encryption() {
            return Err(TransitError::Unsupported {
                operation: "decryption".into(),
                key_type: self.kind,
            });
        }
        self.check_padding_allowed(params)?;
        let token = parse_token(ciphertext)?;
        self.check_read_version(token.version)?;

        match self.kind {
            KeyKind::Rsa(_) => {
                let entry = self.entry(token.version)?;
                if entry.rsa_key.is_empty() {
                    return Err(TransitError::invalid(
                        "cannot decrypt ciphertext, key version does not have a private counterpart",
                    ));
                }
                let key = asymmetric::rsa_private(entry)?;
                let result = match params.padding.unwrap_or_default() {
                    PaddingScheme::Oaep => key.decrypt(Oaep::new::<Sha256>(), &token.payload),
                    PaddingScheme::Pkcs1v15 => key.decrypt(Pkcs1v15Encrypt, &token.payload),
                };
                result.map(Zeroizing::new).map_err(|e| TransitError::Crypto {
                    reason: format!("rsa decryption failed: {e}"),
                })
            }
            _ => self.open(token.version, &token.payload, params),
        }
    }

    fn check_padding_allowed(&self, params: &CipherParams<'_>) -> Result<()> {
        if params.padding.is_some() && !self.kind.supports_padding() {
            return Err(TransitError::invalid(format!(
                "padding_scheme is not supported for key type {}",
                self.kind
            )));
        }
        Ok(())
    }

    /// Encryption key for a version, plus the nonce HMAC key under convergent V3.
    fn aead_keys(
        &self,
        version: u32,
        context: &[u8],
        convergent: Option<ConvergentVersion>,
    ) -> Result<(Zeroizing<Vec<u8>>, Option<Zeroizing<Vec<u8>>>)> {
        let enc_len = self.kind.symmetric_key_len().ok_or_else(|| TransitError::Internal {
            reason: format!("no key length for {}", self.kind),
        })?;
        let hmac_len = match convergent {
            Some(ConvergentVersion::V3) => CONVERGENT_HMAC_KEY_SIZE,
            _ => 0,
        };

        let material = self.derive_key(context, version, enc_len + hmac_len)?;
        if material.len() < enc_len + hmac_len {
            return Err(TransitError::Internal {
                reason: "could not derive key, length too small".into(),
            });
        }
        let enc_key = Zeroizing::new(material[..enc_len].to_vec());
        let nonce_key = (hmac_len > 0).then(|| Zeroizing::new(material[enc_len..enc_len + hmac_len].to_vec()));
        Ok((enc_key, nonce_key))
    }

    fn seal(&self, version: u32, plaintext: &[u8], params: &CipherParams<'_>) -> Result<Vec<u8>> {
        let convergent = self.convergent_version_for(version);
        if !params.nonce.is_empty() && convergent != Some(ConvergentVersion::V1) {
            return Err(TransitError::invalid("provided nonce not allowed for this key"));
        }
        let (key, nonce_key) = self.aead_keys(version, params.context, convergent)?;

        let (nonce, prefix_nonce) = match convergent {
            None => (random_bytes(AEAD_NONCE_SIZE).to_vec(), true),
            Some(ConvergentVersion::V1) => {
                if params.nonce.len() != AEAD_NONCE_SIZE {
                    return Err(TransitError::invalid("invalid convergent nonce supplied"));
                }
                (params.nonce.to_vec(), false)
            }
            Some(ConvergentVersion::V2) => {
                let mut mac = hmac_digest(HashAlgorithm::Sha2_256, params.context, plaintext)?;
                mac.truncate(AEAD_NONCE_SIZE);
                (mac, true)
            }
            Some(ConvergentVersion::V3) => {
                let nonce_key = nonce_key.ok_or_else(|| TransitError::Internal {
                    reason: "missing convergent nonce key".into(),
                })?;
                let mut mac = hmac_digest(HashAlgorithm::Sha2_256, &nonce_key, plaintext)?;
                mac.truncate(AEAD_NONCE_SIZE);
                (mac, true)
            }
        };

        let sealed = aead_seal(self.kind, &key, &nonce, plaintext, params.associated_data)?;
        if !prefix_nonce {
            return Ok(sealed);
        }
        let mut out = Vec::with_capacity(nonce.len() + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, version: u32, payload: &[u8], params: &CipherParams<'_>) -> Result<Zeroizing<Vec<u8>>> {
        let convergent = self.convergent_version_for(version);
        let (nonce, body) = if convergent == Some(ConvergentVersion::V1) {
            if params.nonce.len() != AEAD_NONCE_SIZE {
                return Err(TransitError::invalid("invalid convergent nonce supplied"));
            }
            (params.nonce, payload)
        } else {
            if payload.len() < AEAD_NONCE_SIZE {
                return Err(TransitError::invalid("invalid ciphertext length"));
            }
            payload.split_at(AEAD_NONCE_SIZE)
        };

        let (key, _) = self.aead_keys(version, params.context, convergent)?;
        aead_open(self.kind, &key, nonce, body, params.associated_data)
    }
}

fn seal_with<C: KeyInit + Aead>(key: &[u8], nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(|e| TransitError::Crypto {
        reason: format!("invalid aead key: {e}"),
    })?;
    cipher
        .encrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| TransitError::Crypto {
            reason: "aead encryption failed".into(),
        })
}

fn open_with<C: KeyInit + Aead>(key: &[u8], nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = C::new_from_slice(key).map_err(|e| TransitError::Crypto {
        reason: format!("invalid aead key: {e}"),
    })?;
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map(Zeroizing::new)
        .map_err(|_| TransitError::AuthenticationFailed)
}

fn aead_seal(kind: KeyKind, key: &[u8], nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    match kind {
        KeyKind::Aes(AesBits::B128) => seal_with::<Aes128Gcm>(key, nonce, msg, aad),
        KeyKind::Aes(AesBits::B256) => seal_with::<Aes256Gcm>(key, nonce, msg, aad),
        KeyKind::ChaCha20Poly1305 => seal_with::<ChaCha20Poly1305>(key, nonce, msg, aad),
        other => Err(TransitError::Internal {
            reason: format!("{other} is not an aead key type"),
        }),
    }
}

fn aead_open(kind: KeyKind, key: &[u8], nonce: &[u8], msg: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    match kind {
        KeyKind::Aes(AesBits::B128) => open_with::<Aes128Gcm>(key, nonce, msg, aad),
        KeyKind::Aes(AesBits::B256) => open_with::<Aes256Gcm>(key, nonce, msg, aad),
        KeyKind::ChaCha20Poly1305 => open_with::<ChaCha20Poly1305>(key, nonce, msg, aad),
        other => Err(TransitError::Internal {
            reason: format!("{other} is not an aead key type"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_type::RsaBits;
    use crate::policy::tests::make_ctx;
    use crate::policy::tests::make_policy;

    #[tokio::test]
    async fn test_aead_round_trip_every_type() {
        let (_storage, ctx) = make_ctx();
        for kind in [
            KeyKind::Aes(AesBits::B128),
            KeyKind::Aes(AesBits::B256),
            KeyKind::ChaCha20Poly1305,
        ] {
            let policy = make_policy(&ctx, kind.as_str(), kind).await;
            let token = policy.encrypt(0, b"the quick brown fox", &CipherParams::default()).unwrap();
            assert!(token.starts_with("vault:v1:"));
            let plaintext = policy.decrypt(&token, &CipherParams::default()).unwrap();
            assert_eq!(plaintext.as_slice(), b"the quick brown fox");
        }
    }

    #[tokio::test]
    async fn test_associated_data_is_authenticated() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        let with_aad = CipherParams {
            associated_data: b"header",
            ..Default::default()
        };
        let token = policy.encrypt(0, b"secret", &with_aad).unwrap();

        assert_eq!(policy.decrypt(&token, &with_aad).unwrap().as_slice(), b"secret");
        let err = policy.decrypt(&token, &CipherParams::default()).unwrap_err();
        assert!(matches!(err, TransitError::AuthenticationFailed));
        assert!(err.is_user_error());
    }

    #[tokio::test]
    async fn test_nonce_rejected_without_convergent_v1() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        let params = CipherParams {
            nonce: &[0u8; 12],
            ..Default::default()
        };
        assert!(policy.encrypt(0, b"x", &params).is_err());
    }

    async fn convergent_policy(ctx: &crate::storage::RequestContext) -> Policy {
        let mut policy = Policy::new("conv", KeyKind::Aes(AesBits::B256));
        policy.derived = true;
        policy.convergent_encryption = true;
        policy.rotate(ctx).await.unwrap();
        policy
    }

    #[tokio::test]
    async fn test_convergent_v3_is_deterministic() {
        let (_storage, ctx) = make_ctx();
        let policy = convergent_policy(&ctx).await;
        assert_eq!(policy.convergent_version_for(1), Some(ConvergentVersion::V3));

        let a = CipherParams {
            context: b"ctx-a",
            ..Default::default()
        };
        let b = CipherParams {
            context: b"ctx-b",
            ..Default::default()
        };
        let first = policy.encrypt(0, b"same", &a).unwrap();
        let second = policy.encrypt(0, b"same", &a).unwrap();
        let other = policy.encrypt(0, b"same", &b).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(policy.decrypt(&first, &a).unwrap().as_slice(), b"same");
        assert!(policy.decrypt(&first, &b).is_err());
    }

    #[tokio::test]
    async fn test_convergent_v1_uses_caller_nonce() {
        let (_storage, ctx) = make_ctx();
        let mut policy = convergent_policy(&ctx).await;
        policy.convergent_version = Some(ConvergentVersion::V1);

        let params = CipherParams {
            context: b"ctx",
            nonce: &[7u8; 12],
            ..Default::default()
        };
        let token = policy.encrypt(0, b"data", &params).unwrap();
        let payload = parse_token(&token).unwrap().payload;
        assert_eq!(payload.len(), b"data".len() + 16, "nonce is not embedded");
        assert_eq!(policy.decrypt(&token, &params).unwrap().as_slice(), b"data");

        let missing = CipherParams {
            context: b"ctx",
            ..Default::default()
        };
        assert!(policy.encrypt(0, b"data", &missing).is_err());
    }

    #[tokio::test]
    async fn test_rsa_padding_must_match() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "rsa", KeyKind::Rsa(RsaBits::B2048)).await;
        let oaep = CipherParams {
            padding: Some("oaep".parse().unwrap()),
            ..Default::default()
        };
        let pkcs = CipherParams {
            padding: Some("pkcs1v15".parse().unwrap()),
            ..Default::default()
        };

        let token = policy.encrypt(0, b"hello", &oaep).unwrap();
        assert_eq!(policy.decrypt(&token, &oaep).unwrap().as_slice(), b"hello");
        assert!(policy.decrypt(&token, &pkcs).is_err());

        let token = policy.encrypt(0, b"hello", &pkcs).unwrap();
        assert_eq!(policy.decrypt(&token, &pkcs).unwrap().as_slice(), b"hello");

        assert!("OAEP".parse::<PaddingScheme>().is_err());
    }

    #[tokio::test]
    async fn test_padding_rejected_for_aead() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "k", KeyKind::ChaCha20Poly1305).await;
        let params = CipherParams {
            padding: Some(PaddingScheme::Oaep),
            ..Default::default()
        };
        assert!(policy.encrypt(0, b"x", &params).unwrap_err().is_user_error());
    }

    #[tokio::test]
    async fn test_signing_types_cannot_encrypt() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "ed", KeyKind::Ed25519).await;
        let err = policy.encrypt(0, b"x", &CipherParams::default()).unwrap_err();
        assert!(matches!(err, TransitError::Unsupported { .. }));
    }
}
