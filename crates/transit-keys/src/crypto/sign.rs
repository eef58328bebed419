//! Signing and signature verification for RSA, ECDSA and Ed25519.

use std::str::FromStr;

use ed25519_dalek::Signature as Ed25519Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::Verifier;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rand::rngs::OsRng;
use rsa::Pkcs1v15Sign;
use rsa::Pss;
use rsa::traits::PublicKeyParts;
use zeroize::Zeroizing;

use super::asymmetric;
use super::asymmetric::with_curve;
use super::hash::HashAlgorithm;
use super::hash::with_digest;
use crate::codec::decode_b64;
use crate::codec::decode_b64_url;
use crate::codec::encode_b64;
use crate::codec::encode_b64_url;
use crate::codec::format_token_encoded;
use crate::codec::split_token;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::Curve;
use crate::key_type::KeyKind;
use crate::policy::Policy;

/// RSA signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureAlgorithm {
    /// RSASSA-PSS.
    #[default]
    Pss,
    /// RSASSA-PKCS1-v1_5.
    Pkcs1v15,
}

impl FromStr for SignatureAlgorithm {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pss" => Ok(SignatureAlgorithm::Pss),
            "pkcs1v15" => Ok(SignatureAlgorithm::Pkcs1v15),
            other => Err(TransitError::invalid(format!("unsupported signature algorithm {other}"))),
        }
    }
}

/// Encoding of the signature bytes inside the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarshalingAlgorithm {
    /// DER for ECDSA, standard base64.
    #[default]
    Asn1,
    /// Fixed-width `r || s` for ECDSA, URL-safe base64 without padding.
    Jws,
}

impl FromStr for MarshalingAlgorithm {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asn1" => Ok(MarshalingAlgorithm::Asn1),
            "jws" => Ok(MarshalingAlgorithm::Jws),
            other => Err(TransitError::invalid(format!("unsupported marshaling algorithm {other}"))),
        }
    }
}

/// PSS salt length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaltLength {
    /// Largest salt the key allows when signing; either bound when verifying.
    #[default]
    Auto,
    /// Same length as the digest.
    Hash,
    /// Explicit length in bytes.
    Bytes(usize),
}

impl FromStr for SaltLength {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(SaltLength::Auto),
            "hash" => Ok(SaltLength::Hash),
            other => match other.parse::<usize>() {
                Ok(0) => Ok(SaltLength::Auto),
                Ok(n) => Ok(SaltLength::Bytes(n)),
                Err(_) => Err(TransitError::invalid(format!("invalid salt length {other}"))),
            },
        }
    }
}

/// Per-request signing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignParams<'a> {
    /// Derivation context for derived Ed25519 keys.
    pub context: &'a [u8],
    /// Digest applied to the input. `None` selects the default.
    pub hash_algorithm: Option<HashAlgorithm>,
    /// The input is already a digest.
    pub prehashed: bool,
    /// RSA scheme.
    pub signature_algorithm: SignatureAlgorithm,
    /// Signature encoding.
    pub marshaling_algorithm: MarshalingAlgorithm,
    /// PSS salt length.
    pub salt_length: SaltLength,
}

/// A produced signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutput {
    /// `vault:v{version}:{signature}` token.
    pub signature: String,
    /// Version used.
    pub key_version: u32,
    /// Public key of the context-derived key, for derived Ed25519 policies.
    pub public_key: Option<String>,
}

impl Policy {
    /// Sign `input` with `version` (0 for latest).
    pub fn sign(&self, version: u32, input: &[u8], params: &SignParams<'_>) -> Result<SignatureOutput> {
        self.check_signing_type("signing")?;
        let version = self.resolve_write_version("signing", version)?;
        let entry = self.entry(version)?;
        if entry.is_private_key_missing(self.kind) {
            return Err(TransitError::invalid(
                "requested version for signing does not contain a private part",
            ));
        }

        let mut public_key = None;
        let raw = match self.kind {
            KeyKind::Ed25519 => {
                check_ed25519_params(params)?;
                let seed = if self.derived {
                    self.derive_key(params.context, version, 32)?
                } else {
                    Zeroizing::new(entry.key.clone())
                };
                let key = asymmetric::ed25519_signing(&seed)?;
                if self.derived {
                    public_key = Some(encode_b64(key.verifying_key().as_bytes()));
                }
                key.sign(input).to_bytes().to_vec()
            }
            KeyKind::Ecdsa(curve) => {
                let digest = signing_digest(self.kind, input, params)?;
                ecdsa_sign(curve, &entry.ec_d, &digest, params.marshaling_algorithm)?
            }
            KeyKind::Rsa(_) => {
                let digest = signing_digest(self.kind, input, params)?;
                let key = asymmetric::rsa_private(entry)?;
                let hash = params.hash_algorithm.unwrap_or_default();
                let result = match params.signature_algorithm {
                    SignatureAlgorithm::Pss => {
                        let salt = pss_sign_salt(key.size() * 8, hash, params.salt_length)?;
                        with_digest!(hash, D => key.sign_with_rng(&mut OsRng, Pss::new_with_salt::<D>(salt), &digest),
                            none => return Err(TransitError::invalid("hash algorithm none requires pkcs1v15 signatures")))
                    }
                    SignatureAlgorithm::Pkcs1v15 => with_digest!(hash, D => key.sign(Pkcs1v15Sign::new::<D>(), &digest),
                        none => key.sign(Pkcs1v15Sign::new_unprefixed(), &digest)),
                };
                result.map_err(|e| TransitError::Crypto {
                    reason: format!("rsa signing failed: {e}"),
                })?
            }
            _ => unreachable_signing_type(self.kind)?,
        };

        let encoded = match params.marshaling_algorithm {
            MarshalingAlgorithm::Asn1 => encode_b64(&raw),
            MarshalingAlgorithm::Jws => encode_b64_url(&raw),
        };
        Ok(SignatureOutput {
            signature: format_token_encoded(version, &encoded),
            key_version: version,
            public_key,
        })
    }

    /// Verify a signature token over `input`.
    ///
    /// A well-formed signature that does not match yields `Ok(false)`.
    pub fn verify(&self, signature: &str, input: &[u8], params: &SignParams<'_>) -> Result<bool> {
        self.check_signing_type("verification")?;
        let (version, encoded) = split_token(signature)?;
        self.check_read_version(version)?;
        let entry = self.entry(version)?;

        let raw = match params.marshaling_algorithm {
            MarshalingAlgorithm::Asn1 => decode_b64("signature", encoded)?,
            MarshalingAlgorithm::Jws => decode_b64_url("signature", encoded)?,
        };

        match self.kind {
            KeyKind::Ed25519 => {
                check_ed25519_params(params)?;
                let key = if self.derived {
                    let seed = self.derive_key(params.context, version, 32)?;
                    asymmetric::ed25519_signing(&seed)?.verifying_key()
                } else {
                    asymmetric::ed25519_verifying(entry)?
                };
                let Ok(sig) = Ed25519Signature::from_slice(&raw) else {
                    return Ok(false);
                };
                Ok(key.verify(input, &sig).is_ok())
            }
            KeyKind::Ecdsa(curve) => {
                let digest = signing_digest(self.kind, input, params)?;
                ecdsa_verify(curve, &asymmetric::ec_sec1_point(entry), &digest, &raw, params.marshaling_algorithm)
            }
            KeyKind::Rsa(_) => {
                let digest = signing_digest(self.kind, input, params)?;
                let key = asymmetric::rsa_public(entry)?;
                let hash = params.hash_algorithm.unwrap_or_default();
                let verified = match params.signature_algorithm {
                    SignatureAlgorithm::Pss => {
                        let candidates = pss_verify_salts(key.size() * 8, hash, params.salt_length)?;
                        with_digest!(hash, D => candidates.into_iter().any(|salt| {
                            key.verify(Pss::new_with_salt::<D>(salt), &digest, &raw).is_ok()
                        }), none => return Err(TransitError::invalid("hash algorithm none requires pkcs1v15 signatures")))
                    }
                    SignatureAlgorithm::Pkcs1v15 => with_digest!(hash, D => key.verify(Pkcs1v15Sign::new::<D>(), &digest, &raw).is_ok(),
                        none => key.verify(Pkcs1v15Sign::new_unprefixed(), &digest, &raw).is_ok()),
                };
                Ok(verified)
            }
            _ => unreachable_signing_type(self.kind),
        }
    }

    fn check_signing_type(&self, operation: &str) -> Result<()> {
        if !self.kind.supports_signing() {
            return Err(TransitError::Unsupported {
                operation: operation.into(),
                key_type: self.kind,
            });
        }
        Ok(())
    }
}

fn unreachable_signing_type<T>(kind: KeyKind) -> Result<T> {
    Err(TransitError::Internal {
        reason: format!("{kind} is not a signing key type"),
    })
}

fn check_ed25519_params(params: &SignParams<'_>) -> Result<()> {
    if params.prehashed {
        return Err(TransitError::invalid("prehashed input is not supported for ed25519 keys"));
    }
    if params.hash_algorithm.is_some() {
        return Err(TransitError::invalid("hash algorithm may not be specified for ed25519 keys"));
    }
    Ok(())
}

/// Digest that RSA and ECDSA sign, honoring `prehashed` and `none`.
fn signing_digest(kind: KeyKind, input: &[u8], params: &SignParams<'_>) -> Result<Vec<u8>> {
    let hash = params.hash_algorithm.unwrap_or_default();
    if hash == HashAlgorithm::None {
        let allowed = matches!(kind, KeyKind::Rsa(_))
            && params.prehashed
            && params.signature_algorithm == SignatureAlgorithm::Pkcs1v15;
        if !allowed {
            return Err(TransitError::invalid(
                "hash algorithm none requires prehashed input and pkcs1v15 signatures on rsa keys",
            ));
        }
        return Ok(input.to_vec());
    }
    if params.prehashed {
        return Ok(input.to_vec());
    }
    Ok(hash.digest(input))
}

fn pss_max_salt(modulus_bits: usize, hash: HashAlgorithm) -> Result<usize> {
    let em_len = (modulus_bits - 1 + 7) / 8;
    em_len
        .checked_sub(2 + hash.output_len())
        .ok_or_else(|| TransitError::invalid("digest is too large for the rsa key"))
}

fn pss_sign_salt(modulus_bits: usize, hash: HashAlgorithm, salt: SaltLength) -> Result<usize> {
    let max = pss_max_salt(modulus_bits, hash)?;
    match salt {
        SaltLength::Auto => Ok(max),
        SaltLength::Hash => Ok(hash.output_len()),
        SaltLength::Bytes(n) if n <= max => Ok(n),
        SaltLength::Bytes(n) => Err(TransitError::invalid(format!(
            "salt length {n} is invalid, must be at most {max}"
        ))),
    }
}

fn pss_verify_salts(modulus_bits: usize, hash: HashAlgorithm, salt: SaltLength) -> Result<Vec<usize>> {
    match salt {
        SaltLength::Auto => Ok(vec![pss_max_salt(modulus_bits, hash)?, hash.output_len()]),
        other => Ok(vec![pss_sign_salt(modulus_bits, hash, other)?]),
    }
}

/// Left-pad a digest shorter than half the field, which the prehash API refuses.
fn ecdsa_prehash(curve: Curve, digest: &[u8]) -> Vec<u8> {
    let min = curve.field_len().div_ceil(2);
    if digest.len() >= min {
        return digest.to_vec();
    }
    let mut padded = vec![0u8; min - digest.len()];
    padded.extend_from_slice(digest);
    padded
}

fn ecdsa_sign(curve: Curve, scalar: &[u8], digest: &[u8], marshaling: MarshalingAlgorithm) -> Result<Vec<u8>> {
    let prehash = ecdsa_prehash(curve, digest);
    with_curve!(curve, c => {
        let key = c::ecdsa::SigningKey::from_slice(scalar).map_err(|e| TransitError::Crypto {
            reason: format!("corrupted ec key: {e}"),
        })?;
        let sig: c::ecdsa::Signature = key.sign_prehash(&prehash).map_err(|e| TransitError::Crypto {
            reason: format!("ecdsa signing failed: {e}"),
        })?;
        Ok(match marshaling {
            MarshalingAlgorithm::Asn1 => sig.to_der().as_bytes().to_vec(),
            MarshalingAlgorithm::Jws => sig.to_bytes().to_vec(),
        })
    })
}

fn ecdsa_verify(
    curve: Curve,
    point: &[u8],
    digest: &[u8],
    raw: &[u8],
    marshaling: MarshalingAlgorithm,
) -> Result<bool> {
    let prehash = ecdsa_prehash(curve, digest);
    with_curve!(curve, c => {
        let key = c::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| TransitError::Crypto {
            reason: format!("corrupted ec public key: {e}"),
        })?;
        let parsed = match marshaling {
            MarshalingAlgorithm::Asn1 => c::ecdsa::Signature::from_der(raw),
            MarshalingAlgorithm::Jws => c::ecdsa::Signature::from_slice(raw),
        };
        let Ok(sig) = parsed else {
            return Ok(false);
        };
        Ok(key.verify_prehash(&prehash, &sig).is_ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_type::RsaBits;
    use crate::policy::tests::make_ctx;
    use crate::policy::tests::make_policy;

    #[tokio::test]
    async fn test_sign_verify_every_signing_type() {
        let (_storage, ctx) = make_ctx();
        for kind in [
            KeyKind::Ecdsa(Curve::P256),
            KeyKind::Ecdsa(Curve::P384),
            KeyKind::Ecdsa(Curve::P521),
            KeyKind::Ed25519,
            KeyKind::Rsa(RsaBits::B2048),
        ] {
            let policy = make_policy(&ctx, kind.as_str(), kind).await;
            let params = SignParams::default();
            let out = policy.sign(0, b"message", &params).unwrap();
            assert!(out.signature.starts_with("vault:v1:"), "{kind}");
            assert!(policy.verify(&out.signature, b"message", &params).unwrap(), "{kind}");
            assert!(!policy.verify(&out.signature, b"other", &params).unwrap(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_ecdsa_jws_marshaling() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "ec", KeyKind::Ecdsa(Curve::P384)).await;
        let params = SignParams {
            marshaling_algorithm: MarshalingAlgorithm::Jws,
            hash_algorithm: Some(HashAlgorithm::Sha2_384),
            ..Default::default()
        };
        let out = policy.sign(0, b"payload", &params).unwrap();
        let (_, encoded) = split_token(&out.signature).unwrap();
        assert_eq!(decode_b64_url("sig", encoded).unwrap().len(), 96);
        assert!(policy.verify(&out.signature, b"payload", &params).unwrap());
    }

    #[tokio::test]
    async fn test_p521_with_short_digest() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "p521", KeyKind::Ecdsa(Curve::P521)).await;
        let params = SignParams {
            hash_algorithm: Some(HashAlgorithm::Sha2_224),
            ..Default::default()
        };
        let out = policy.sign(0, b"payload", &params).unwrap();
        assert!(policy.verify(&out.signature, b"payload", &params).unwrap());
    }

    #[tokio::test]
    async fn test_rsa_pss_salt_options() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "rsa", KeyKind::Rsa(RsaBits::B2048)).await;

        let auto = SignParams::default();
        let hash = SignParams {
            salt_length: SaltLength::Hash,
            ..Default::default()
        };
        let signed_auto = policy.sign(0, b"m", &auto).unwrap();
        let signed_hash = policy.sign(0, b"m", &hash).unwrap();

        assert!(policy.verify(&signed_auto.signature, b"m", &auto).unwrap());
        assert!(policy.verify(&signed_hash.signature, b"m", &auto).unwrap());
        assert!(policy.verify(&signed_hash.signature, b"m", &hash).unwrap());

        let too_big = SignParams {
            salt_length: SaltLength::Bytes(1000),
            ..Default::default()
        };
        assert!(policy.sign(0, b"m", &too_big).is_err());
    }

    #[tokio::test]
    async fn test_rsa_prehashed_none_requires_pkcs1v15() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "rsa", KeyKind::Rsa(RsaBits::B2048)).await;
        let digest = HashAlgorithm::Sha2_256.digest(b"m");

        let pss_none = SignParams {
            hash_algorithm: Some(HashAlgorithm::None),
            prehashed: true,
            ..Default::default()
        };
        assert!(policy.sign(0, &digest, &pss_none).is_err());

        let pkcs_none = SignParams {
            signature_algorithm: SignatureAlgorithm::Pkcs1v15,
            ..pss_none
        };
        let out = policy.sign(0, &digest, &pkcs_none).unwrap();
        assert!(policy.verify(&out.signature, &digest, &pkcs_none).unwrap());
    }

    #[tokio::test]
    async fn test_ed25519_rejects_hash_options() {
        let (_storage, ctx) = make_ctx();
        let policy = make_policy(&ctx, "ed", KeyKind::Ed25519).await;
        let prehashed = SignParams {
            prehashed: true,
            ..Default::default()
        };
        assert!(policy.sign(0, b"m", &prehashed).is_err());
        let hashed = SignParams {
            hash_algorithm: Some(HashAlgorithm::Sha2_512),
            ..Default::default()
        };
        assert!(policy.sign(0, b"m", &hashed).is_err());
    }

    #[tokio::test]
    async fn test_derived_ed25519_returns_public_key() {
        let (_storage, ctx) = make_ctx();
        let mut policy = Policy::new("ed", KeyKind::Ed25519);
        policy.derived = true;
        policy.rotate(&ctx).await.unwrap();

        let params = SignParams {
            context: b"tenant",
            ..Default::default()
        };
        let out = policy.sign(0, b"m", &params).unwrap();
        assert!(out.public_key.is_some());
        assert_ne!(out.public_key.as_deref(), Some(policy.entry(1).unwrap().public_key.as_str()));
        assert!(policy.verify(&out.signature, b"m", &params).unwrap());

        let other = SignParams {
            context: b"someone-else",
            ..Default::default()
        };
        assert!(!policy.verify(&out.signature, b"m", &other).unwrap());
    }

    #[tokio::test]
    async fn test_verify_honors_min_decryption_version() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "ed", KeyKind::Ed25519).await;
        let old = policy.sign(0, b"m", &SignParams::default()).unwrap();
        policy.rotate(&ctx).await.unwrap();
        policy.min_decryption_version = 2;

        let err = policy.verify(&old.signature, b"m", &SignParams::default()).unwrap_err();
        assert!(matches!(err, TransitError::VersionTooOld));
    }

    #[test]
    fn test_option_parsing() {
        assert_eq!("pkcs1v15".parse::<SignatureAlgorithm>().unwrap(), SignatureAlgorithm::Pkcs1v15);
        assert!("PSS".parse::<SignatureAlgorithm>().is_err());
        assert_eq!("jws".parse::<MarshalingAlgorithm>().unwrap(), MarshalingAlgorithm::Jws);
        assert_eq!("32".parse::<SaltLength>().unwrap(), SaltLength::Bytes(32));
        assert!("-1".parse::<SaltLength>().is_err());
    }
}
