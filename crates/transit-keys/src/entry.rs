//! One version of key material within a policy.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use zeroize::Zeroize;

use crate::codec::base64_bytes;
use crate::codec::base64_list;
use crate::error::TransitError;
use crate::key_type::KeyKind;

/// Rules for deriving the nonce of convergent encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ConvergentVersion {
    /// Caller supplies the nonce; it is not embedded in the ciphertext.
    V1,
    /// Nonce is HMAC-SHA256 keyed by the context over the plaintext.
    V2,
    /// Nonce is HMAC-SHA256 keyed by derived material over the plaintext.
    V3,
}

impl ConvergentVersion {
    /// Version given to new entries of convergent policies.
    pub const CURRENT: ConvergentVersion = ConvergentVersion::V3;
}

impl From<ConvergentVersion> for u8 {
    fn from(v: ConvergentVersion) -> Self {
        match v {
            ConvergentVersion::V1 => 1,
            ConvergentVersion::V2 => 2,
            ConvergentVersion::V3 => 3,
        }
    }
}

impl TryFrom<u8> for ConvergentVersion {
    type Error = TransitError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConvergentVersion::V1),
            2 => Ok(ConvergentVersion::V2),
            3 => Ok(ConvergentVersion::V3),
            other => Err(TransitError::Serialization {
                reason: format!("unknown convergent version {other}"),
            }),
        }
    }
}

/// Key material for a single version.
///
/// Which fields are populated depends on the policy's [`KeyKind`]. Binary
/// fields are persisted as base64; empty fields are omitted.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct KeyEntry {
    /// Raw key for AEAD, HMAC, CMAC and Ed25519 (32-byte seed) types, or the
    /// derivation root when the policy is derived.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,

    /// Key used for HMAC operations on every non-HMAC type.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub hmac_key: Vec<u8>,

    /// RSA private key, PKCS#8 DER.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub rsa_key: Vec<u8>,

    /// RSA public key, SPKI DER. Only set for public-only imports.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub rsa_public_key: Vec<u8>,

    /// EC point X coordinate, big-endian.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub ec_x: Vec<u8>,

    /// EC point Y coordinate, big-endian.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub ec_y: Vec<u8>,

    /// EC private scalar, big-endian.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub ec_d: Vec<u8>,

    /// Public key as presented to callers: base64 for Ed25519, PEM for ECDSA.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,

    /// Attached X.509 chain, leaf first, each certificate DER.
    #[serde(default, with = "base64_list", skip_serializing_if = "Vec::is_empty")]
    pub certificate_chain: Vec<Vec<u8>>,

    /// When this version was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    pub creation_time: Option<DateTime<Utc>>,

    /// Convergent nonce rules recorded when the version was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    pub convergent_version: Option<ConvergentVersion>,
}

impl KeyEntry {
    /// True when an asymmetric entry only carries its public half.
    pub fn is_private_key_missing(&self, kind: KeyKind) -> bool {
        match kind {
            KeyKind::Rsa(_) => self.rsa_key.is_empty(),
            KeyKind::Ecdsa(_) => self.ec_d.is_empty(),
            KeyKind::Ed25519 => self.key.is_empty(),
            _ => false,
        }
    }

    /// True for the unused slot at index 0 of an untrimmed archive.
    pub fn is_placeholder(&self) -> bool {
        self.key.is_empty()
            && self.hmac_key.is_empty()
            && self.rsa_key.is_empty()
            && self.rsa_public_key.is_empty()
            && self.ec_d.is_empty()
            && self.ec_x.is_empty()
            && self.public_key.is_empty()
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("has_key", &!self.key.is_empty())
            .field("has_hmac_key", &!self.hmac_key.is_empty())
            .field("has_rsa_key", &!self.rsa_key.is_empty())
            .field("has_ec_d", &!self.ec_d.is_empty())
            .field("public_key", &self.public_key)
            .field("certificates", &self.certificate_chain.len())
            .field("creation_time", &self.creation_time)
            .field("convergent_version", &self.convergent_version)
            .finish()
    }
}
