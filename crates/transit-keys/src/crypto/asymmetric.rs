//! Generation, parsing and encoding of asymmetric key material.
//!
//! RSA keys are stored as PKCS#8 DER, EC keys as raw scalar and affine
//! coordinates, Ed25519 keys as their 32-byte seed.

use ed25519_dalek::SigningKey as Ed25519SigningKey;
use ed25519_dalek::VerifyingKey as Ed25519VerifyingKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::pkcs8::LineEnding;
use rsa::traits::PublicKeyParts;
use zeroize::Zeroizing;

use crate::codec::encode_b64;
use crate::entry::KeyEntry;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::Curve;
use crate::key_type::KeyKind;
use crate::key_type::RsaBits;

/// Run `$body` with `$c` aliased to the curve crate selected by `$curve`.
macro_rules! with_curve {
    ($curve:expr, $c:ident => $body:expr) => {
        match $curve {
            $crate::key_type::Curve::P256 => {
                use ::p256 as $c;
                $body
            }
            $crate::key_type::Curve::P384 => {
                use ::p384 as $c;
                $body
            }
            $crate::key_type::Curve::P521 => {
                use ::p521 as $c;
                $body
            }
        }
    };
}

pub(crate) use with_curve;

fn crypto_err(what: &str, e: impl std::fmt::Display) -> TransitError {
    TransitError::Crypto {
        reason: format!("{what}: {e}"),
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Fill `entry` with freshly generated material for an asymmetric type.
pub(crate) fn generate(kind: KeyKind, entry: &mut KeyEntry) -> Result<()> {
    match kind {
        KeyKind::Rsa(bits) => {
            let key = RsaPrivateKey::new(&mut OsRng, bits.bits())
                .map_err(|e| crypto_err("rsa key generation failed", e))?;
            set_rsa_private(&key, entry)
        }
        KeyKind::Ecdsa(curve) => with_curve!(curve, c => {
            let secret = c::SecretKey::random(&mut OsRng);
            set_ec_private(curve, &secret.to_bytes(), entry)
        }),
        KeyKind::Ed25519 => {
            let mut seed = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(&mut seed[..]);
            set_ed25519_seed(&seed, entry);
            Ok(())
        }
        other => Err(TransitError::Internal {
            reason: format!("{other} is not an asymmetric key type"),
        }),
    }
}

fn set_rsa_private(key: &RsaPrivateKey, entry: &mut KeyEntry) -> Result<()> {
    let der = key.to_pkcs8_der().map_err(|e| crypto_err("rsa pkcs8 encoding failed", e))?;
    entry.rsa_key = der.as_bytes().to_vec();
    entry.rsa_public_key.clear();
    Ok(())
}

fn set_ec_private(curve: Curve, scalar: &[u8], entry: &mut KeyEntry) -> Result<()> {
    with_curve!(curve, c => {
        let secret = c::SecretKey::from_slice(scalar).map_err(|e| crypto_err("invalid ec scalar", e))?;
        let public = secret.public_key();
        entry.ec_d = secret.to_bytes().to_vec();
        let point = public.to_encoded_point(false);
        set_ec_coordinates(point.x().map(|x| x.to_vec()), point.y().map(|y| y.to_vec()), entry)?;
        entry.public_key = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| crypto_err("ec public key encoding failed", e))?;
        Ok(())
    })
}

fn set_ec_coordinates(x: Option<Vec<u8>>, y: Option<Vec<u8>>, entry: &mut KeyEntry) -> Result<()> {
    match (x, y) {
        (Some(x), Some(y)) => {
            entry.ec_x = x;
            entry.ec_y = y;
            Ok(())
        }
        _ => Err(TransitError::Crypto {
            reason: "ec public key is the identity point".into(),
        }),
    }
}

fn set_ed25519_seed(seed: &[u8; 32], entry: &mut KeyEntry) {
    let signing = Ed25519SigningKey::from_bytes(seed);
    entry.key = seed.to_vec();
    entry.public_key = encode_b64(signing.verifying_key().as_bytes());
}

// ============================================================================
// Loading
// ============================================================================

/// RSA private key of an entry.
pub(crate) fn rsa_private(entry: &KeyEntry) -> Result<RsaPrivateKey> {
    if entry.rsa_key.is_empty() {
        return Err(TransitError::invalid("key version does not contain a private part"));
    }
    RsaPrivateKey::from_pkcs8_der(&entry.rsa_key).map_err(|e| crypto_err("corrupted rsa key", e))
}

/// RSA public key of an entry, from the private key when present.
pub(crate) fn rsa_public(entry: &KeyEntry) -> Result<RsaPublicKey> {
    if !entry.rsa_key.is_empty() {
        return Ok(rsa_private(entry)?.to_public_key());
    }
    if entry.rsa_public_key.is_empty() {
        return Err(TransitError::Internal {
            reason: "rsa key entry has neither private nor public key".into(),
        });
    }
    RsaPublicKey::from_public_key_der(&entry.rsa_public_key)
        .map_err(|e| crypto_err("corrupted rsa public key", e))
}

/// Uncompressed SEC1 encoding of an EC entry's public point.
pub(crate) fn ec_sec1_point(entry: &KeyEntry) -> Vec<u8> {
    let mut point = Vec::with_capacity(1 + entry.ec_x.len() + entry.ec_y.len());
    point.push(0x04);
    point.extend_from_slice(&entry.ec_x);
    point.extend_from_slice(&entry.ec_y);
    point
}

/// Ed25519 signing key of an entry.
pub(crate) fn ed25519_signing(seed: &[u8]) -> Result<Ed25519SigningKey> {
    let seed: &[u8; 32] = seed.try_into().map_err(|_| TransitError::Crypto {
        reason: "invalid ed25519 seed length".into(),
    })?;
    Ok(Ed25519SigningKey::from_bytes(seed))
}

/// Ed25519 verifying key of an entry.
pub(crate) fn ed25519_verifying(entry: &KeyEntry) -> Result<Ed25519VerifyingKey> {
    if !entry.key.is_empty() {
        return Ok(ed25519_signing(&entry.key)?.verifying_key());
    }
    let raw = crate::codec::decode_b64("public key", &entry.public_key)?;
    let raw: [u8; 32] = raw.as_slice().try_into().map_err(|_| TransitError::Crypto {
        reason: "invalid ed25519 public key length".into(),
    })?;
    Ed25519VerifyingKey::from_bytes(&raw).map_err(|e| crypto_err("invalid ed25519 public key", e))
}

// ============================================================================
// Import
// ============================================================================

/// Fill `entry` from a PKCS#8 DER private key of the policy's type.
pub(crate) fn import_private(kind: KeyKind, der: &[u8], entry: &mut KeyEntry) -> Result<()> {
    let parse_err = |e: String| TransitError::invalid(format!("failed to parse PKCS#8 key for {kind}: {e}"));
    match kind {
        KeyKind::Rsa(bits) => {
            let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| parse_err(e.to_string()))?;
            check_rsa_size(bits, key.size() * 8)?;
            set_rsa_private(&key, entry)
        }
        KeyKind::Ecdsa(curve) => with_curve!(curve, c => {
            let secret = c::SecretKey::from_pkcs8_der(der).map_err(|e| parse_err(e.to_string()))?;
            set_ec_private(curve, &secret.to_bytes(), entry)
        }),
        KeyKind::Ed25519 => {
            let key = Ed25519SigningKey::from_pkcs8_der(der).map_err(|e| parse_err(e.to_string()))?;
            set_ed25519_seed(&key.to_bytes(), entry);
            Ok(())
        }
        other => Err(TransitError::Internal {
            reason: format!("{other} is not an asymmetric key type"),
        }),
    }
}

/// Fill `entry` with only the public half, from a PEM SubjectPublicKeyInfo.
pub(crate) fn import_public(kind: KeyKind, pem: &str, entry: &mut KeyEntry) -> Result<()> {
    let parse_err = |e: String| TransitError::invalid(format!("failed to parse public key for {kind}: {e}"));
    match kind {
        KeyKind::Rsa(bits) => {
            let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| parse_err(e.to_string()))?;
            check_rsa_size(bits, key.size() * 8)?;
            entry.rsa_public_key = key
                .to_public_key_der()
                .map_err(|e| crypto_err("rsa public key encoding failed", e))?
                .as_bytes()
                .to_vec();
            Ok(())
        }
        KeyKind::Ecdsa(curve) => with_curve!(curve, c => {
            let public = c::PublicKey::from_public_key_pem(pem).map_err(|e| parse_err(e.to_string()))?;
            let point = public.to_encoded_point(false);
            set_ec_coordinates(point.x().map(|x| x.to_vec()), point.y().map(|y| y.to_vec()), entry)?;
            entry.public_key = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| crypto_err("ec public key encoding failed", e))?;
            Ok(())
        }),
        KeyKind::Ed25519 => {
            let key = Ed25519VerifyingKey::from_public_key_pem(pem).map_err(|e| parse_err(e.to_string()))?;
            entry.public_key = encode_b64(key.as_bytes());
            Ok(())
        }
        other => Err(TransitError::invalid(format!("public key import is not supported for key type {other}"))),
    }
}

fn check_rsa_size(expected: RsaBits, actual: usize) -> Result<()> {
    if expected.bits() != actual {
        return Err(TransitError::invalid(format!(
            "invalid RSA key size: expected {} bits, got {actual}",
            expected.bits()
        )));
    }
    Ok(())
}

// ============================================================================
// Encoding
// ============================================================================

/// SubjectPublicKeyInfo DER of an entry's public key.
pub(crate) fn public_key_spki_der(kind: KeyKind, entry: &KeyEntry) -> Result<Vec<u8>> {
    let der = match kind {
        KeyKind::Rsa(_) => rsa_public(entry)?.to_public_key_der(),
        KeyKind::Ecdsa(curve) => with_curve!(curve, c => {
            c::PublicKey::from_sec1_bytes(&ec_sec1_point(entry))
                .map_err(|e| crypto_err("corrupted ec public key", e))?
                .to_public_key_der()
        }),
        KeyKind::Ed25519 => ed25519_verifying(entry)?.to_public_key_der(),
        other => {
            return Err(TransitError::Unsupported {
                operation: "public key".into(),
                key_type: other,
            });
        }
    };
    Ok(der.map_err(|e| crypto_err("public key encoding failed", e))?.as_bytes().to_vec())
}

/// Public key as returned by key reads and `public-key` export.
///
/// PEM SubjectPublicKeyInfo for RSA and ECDSA, base64 raw key for Ed25519.
pub(crate) fn public_key_display(kind: KeyKind, entry: &KeyEntry) -> Result<String> {
    match kind {
        KeyKind::Rsa(_) => rsa_public(entry)?
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| crypto_err("rsa public key encoding failed", e)),
        KeyKind::Ecdsa(_) | KeyKind::Ed25519 if !entry.public_key.is_empty() => Ok(entry.public_key.clone()),
        KeyKind::Ed25519 => Ok(encode_b64(ed25519_verifying(entry)?.as_bytes())),
        other => Err(TransitError::Unsupported {
            operation: "public key".into(),
            key_type: other,
        }),
    }
}

/// PKCS#8 DER of an entry's private key, as wrapped by BYOK export.
pub(crate) fn private_key_pkcs8_der(kind: KeyKind, entry: &KeyEntry) -> Result<Zeroizing<Vec<u8>>> {
    if entry.is_private_key_missing(kind) {
        return Err(TransitError::invalid("key version does not contain a private part"));
    }
    let doc = match kind {
        KeyKind::Rsa(_) => return Ok(Zeroizing::new(entry.rsa_key.clone())),
        KeyKind::Ecdsa(curve) => with_curve!(curve, c => {
            c::SecretKey::from_slice(&entry.ec_d)
                .map_err(|e| crypto_err("corrupted ec key", e))?
                .to_pkcs8_der()
        }),
        KeyKind::Ed25519 => ed25519_signing(&entry.key)?.to_pkcs8_der(),
        other => {
            return Err(TransitError::Internal {
                reason: format!("{other} is not an asymmetric key type"),
            });
        }
    };
    let doc = doc.map_err(|e| crypto_err("pkcs8 encoding failed", e))?;
    Ok(Zeroizing::new(doc.as_bytes().to_vec()))
}

/// Private key as returned by plain export.
///
/// PKCS#1 PEM for RSA, SEC1 PEM for ECDSA, base64 `seed || public` for Ed25519.
pub(crate) fn private_key_export(kind: KeyKind, entry: &KeyEntry) -> Result<Zeroizing<String>> {
    if entry.is_private_key_missing(kind) {
        return Err(TransitError::invalid("key version does not contain a private part"));
    }
    match kind {
        KeyKind::Rsa(_) => rsa_private(entry)?
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| crypto_err("rsa pem encoding failed", e)),
        KeyKind::Ecdsa(curve) => with_curve!(curve, c => {
            c::SecretKey::from_slice(&entry.ec_d)
                .map_err(|e| crypto_err("corrupted ec key", e))?
                .to_sec1_pem(LineEnding::LF)
                .map_err(|e| crypto_err("ec pem encoding failed", e))
        }),
        KeyKind::Ed25519 => {
            let signing = ed25519_signing(&entry.key)?;
            let mut full = Zeroizing::new(Vec::with_capacity(64));
            full.extend_from_slice(&signing.to_bytes());
            full.extend_from_slice(signing.verifying_key().as_bytes());
            Ok(Zeroizing::new(encode_b64(&full)))
        }
        other => Err(TransitError::Internal {
            reason: format!("{other} is not an asymmetric key type"),
        }),
    }
}

/// Check that a private key parsed into `candidate` belongs to `existing`'s public key.
pub(crate) fn ensure_same_public_key(kind: KeyKind, existing: &KeyEntry, candidate: &KeyEntry) -> Result<()> {
    if public_key_spki_der(kind, existing)? != public_key_spki_der(kind, candidate)? {
        return Err(TransitError::invalid(
            "cannot import key, key pair does not match the existing public key",
        ));
    }
    Ok(())
}
