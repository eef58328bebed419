//! Key families supported by the transit engine.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::TransitError;

/// AES key strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AesBits {
    /// 128-bit key.
    B128,
    /// 256-bit key.
    B256,
}

impl AesBits {
    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            AesBits::B128 => 16,
            AesBits::B256 => 32,
        }
    }
}

/// RSA modulus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RsaBits {
    /// 2048-bit modulus.
    B2048,
    /// 3072-bit modulus.
    B3072,
    /// 4096-bit modulus.
    B4096,
}

impl RsaBits {
    /// Modulus size in bits.
    pub fn bits(self) -> usize {
        match self {
            RsaBits::B2048 => 2048,
            RsaBits::B3072 => 3072,
            RsaBits::B4096 => 4096,
        }
    }

    /// Map a modulus size back to a variant.
    pub fn from_bits(bits: usize) -> Option<Self> {
        match bits {
            2048 => Some(RsaBits::B2048),
            3072 => Some(RsaBits::B3072),
            4096 => Some(RsaBits::B4096),
            _ => None,
        }
    }
}

/// NIST curve used by an ECDSA key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    /// secp256r1.
    P256,
    /// secp384r1.
    P384,
    /// secp521r1.
    P521,
}

impl Curve {
    /// Size of a field element in bytes, also the width of `r` and `s`.
    pub fn field_len(self) -> usize {
        match self {
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }
}

/// Key family tag of a policy.
///
/// Serialized with the names used on the API: `aes256-gcm96`, `rsa-2048`,
/// `ecdsa-p256` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum KeyKind {
    /// AES-GCM with a 96-bit nonce.
    Aes(AesBits),
    /// ChaCha20-Poly1305.
    ChaCha20Poly1305,
    /// RSA encryption and signing.
    Rsa(RsaBits),
    /// ECDSA signing.
    Ecdsa(Curve),
    /// Ed25519 signing.
    Ed25519,
    /// Raw HMAC key.
    Hmac,
    /// AES-CMAC.
    AesCmac(AesBits),
}

impl KeyKind {
    /// Every supported key type, for exhaustive tests and listings.
    pub const ALL: [KeyKind; 13] = [
        KeyKind::Aes(AesBits::B128),
        KeyKind::Aes(AesBits::B256),
        KeyKind::ChaCha20Poly1305,
        KeyKind::Ed25519,
        KeyKind::Ecdsa(Curve::P256),
        KeyKind::Ecdsa(Curve::P384),
        KeyKind::Ecdsa(Curve::P521),
        KeyKind::Rsa(RsaBits::B2048),
        KeyKind::Rsa(RsaBits::B3072),
        KeyKind::Rsa(RsaBits::B4096),
        KeyKind::Hmac,
        KeyKind::AesCmac(AesBits::B128),
        KeyKind::AesCmac(AesBits::B256),
    ];

    /// API name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::Aes(AesBits::B128) => "aes128-gcm96",
            KeyKind::Aes(AesBits::B256) => "aes256-gcm96",
            KeyKind::ChaCha20Poly1305 => "chacha20-poly1305",
            KeyKind::Rsa(RsaBits::B2048) => "rsa-2048",
            KeyKind::Rsa(RsaBits::B3072) => "rsa-3072",
            KeyKind::Rsa(RsaBits::B4096) => "rsa-4096",
            KeyKind::Ecdsa(Curve::P256) => "ecdsa-p256",
            KeyKind::Ecdsa(Curve::P384) => "ecdsa-p384",
            KeyKind::Ecdsa(Curve::P521) => "ecdsa-p521",
            KeyKind::Ed25519 => "ed25519",
            KeyKind::Hmac => "hmac",
            KeyKind::AesCmac(AesBits::B128) => "aes128-cmac",
            KeyKind::AesCmac(AesBits::B256) => "aes256-cmac",
        }
    }

    /// Encrypt and decrypt.
    pub fn supports_encryption(self) -> bool {
        matches!(self, KeyKind::Aes(_) | KeyKind::ChaCha20Poly1305 | KeyKind::Rsa(_))
    }

    /// Sign and verify.
    pub fn supports_signing(self) -> bool {
        matches!(self, KeyKind::Rsa(_) | KeyKind::Ecdsa(_) | KeyKind::Ed25519)
    }

    /// Per-request key derivation from a context.
    pub fn supports_derivation(self) -> bool {
        matches!(self, KeyKind::Aes(_) | KeyKind::ChaCha20Poly1305 | KeyKind::Ed25519)
    }

    /// Convergent (deterministic) encryption.
    pub fn supports_convergent(self) -> bool {
        matches!(self, KeyKind::Aes(_) | KeyKind::ChaCha20Poly1305)
    }

    /// Selectable padding scheme on encrypt and decrypt.
    pub fn supports_padding(self) -> bool {
        matches!(self, KeyKind::Rsa(_))
    }

    /// HMAC generation and verification.
    pub fn supports_hmac(self) -> bool {
        !matches!(self, KeyKind::AesCmac(_))
    }

    /// CMAC generation and verification.
    pub fn supports_cmac(self) -> bool {
        matches!(self, KeyKind::AesCmac(_))
    }

    /// Key material has a public half.
    pub fn is_asymmetric(self) -> bool {
        matches!(self, KeyKind::Rsa(_) | KeyKind::Ecdsa(_) | KeyKind::Ed25519)
    }

    /// Fixed length of a symmetric key, if the type has one.
    pub fn symmetric_key_len(self) -> Option<usize> {
        match self {
            KeyKind::Aes(bits) | KeyKind::AesCmac(bits) => Some(bits.key_len()),
            KeyKind::ChaCha20Poly1305 => Some(32),
            _ => None,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TransitError::invalid(format!("unknown key type {s}")))
    }
}

impl From<KeyKind> for String {
    fn from(kind: KeyKind) -> Self {
        kind.as_str().to_string()
    }
}

impl TryFrom<String> for KeyKind {
    type Error = TransitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Default for KeyKind {
    fn default() -> Self {
        KeyKind::Aes(AesBits::B256)
    }
}
