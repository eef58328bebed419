//! Creating versions from caller-supplied key material.

use chrono::Utc;
use tracing::info;
use zeroize::Zeroizing;

use super::Policy;
use crate::constants::HMAC_KEY_SIZE;
use crate::constants::MAX_HMAC_TYPE_KEY_SIZE;
use crate::constants::MIN_HMAC_TYPE_KEY_SIZE;
use crate::crypto::asymmetric;
use crate::crypto::random_bytes;
use crate::entry::KeyEntry;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::KeyKind;

/// Key material handed to an import.
#[derive(Clone)]
pub enum ImportMaterial {
    /// Raw bytes for symmetric types, PKCS#8 DER for asymmetric types.
    Private(Zeroizing<Vec<u8>>),
    /// PEM SubjectPublicKeyInfo of an asymmetric key.
    Public(String),
}

impl std::fmt::Debug for ImportMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportMaterial::Private(_) => f.write_str("Private(..)"),
            ImportMaterial::Public(pem) => f.debug_tuple("Public").field(pem).finish(),
        }
    }
}

impl Policy {
    /// Add a new version from imported material without persisting.
    ///
    /// When the latest version is public-only and a matching private key is
    /// supplied, that version is completed instead of adding a new one.
    pub fn import_in_memory(&mut self, material: &ImportMaterial) -> Result<()> {
        if let ImportMaterial::Private(der) = material {
            let latest_is_public_only = self.kind.is_asymmetric()
                && self
                    .keys
                    .get(&self.latest_version)
                    .is_some_and(|e| e.is_private_key_missing(self.kind));
            if latest_is_public_only && self.import_private_for_version(self.latest_version, der).is_ok() {
                return Ok(());
            }
        }

        let mut entry = KeyEntry {
            creation_time: Some(Utc::now()),
            ..KeyEntry::default()
        };
        if !matches!(self.kind, KeyKind::AesCmac(_) | KeyKind::Hmac) {
            entry.hmac_key = random_bytes(HMAC_KEY_SIZE).to_vec();
        }

        match (self.kind, material) {
            (KeyKind::Hmac, ImportMaterial::Private(raw)) => {
                if !(MIN_HMAC_TYPE_KEY_SIZE..=MAX_HMAC_TYPE_KEY_SIZE).contains(&raw.len()) {
                    return Err(TransitError::invalid(format!(
                        "invalid key size {} bytes for hmac key, must be between {MIN_HMAC_TYPE_KEY_SIZE} and {MAX_HMAC_TYPE_KEY_SIZE} bytes",
                        raw.len()
                    )));
                }
                self.key_size = raw.len();
                entry.key = raw.to_vec();
                entry.hmac_key = raw.to_vec();
            }
            (kind, ImportMaterial::Private(der)) if kind.is_asymmetric() => {
                asymmetric::import_private(kind, der, &mut entry)?;
            }
            (kind, ImportMaterial::Private(raw)) => {
                let expected = kind.symmetric_key_len().ok_or_else(|| TransitError::Internal {
                    reason: format!("no key length for {kind}"),
                })?;
                if raw.len() != expected {
                    return Err(TransitError::invalid(format!(
                        "invalid key size {} bytes for key type {kind}, expected {expected} bytes",
                        raw.len()
                    )));
                }
                entry.key = raw.to_vec();
            }
            (KeyKind::Ed25519, ImportMaterial::Public(_)) if self.derived => {
                return Err(TransitError::invalid("import of public keys is not supported for derived ed25519 keys"));
            }
            (kind, ImportMaterial::Public(pem)) if kind.is_asymmetric() => {
                asymmetric::import_public(kind, pem, &mut entry)?;
            }
            (kind, ImportMaterial::Public(_)) => {
                return Err(TransitError::invalid(format!(
                    "public key import is only supported for asymmetric key types, not {kind}"
                )));
            }
        }

        self.insert_new_version(entry);
        Ok(())
    }

    /// Complete a public-only version with its private key.
    pub fn import_private_for_version(&mut self, version: u32, der: &[u8]) -> Result<()> {
        let kind = self.kind;
        let existing = self.entry(version)?;
        if !existing.is_private_key_missing(kind) {
            return Err(TransitError::invalid(format!(
                "private key for version {version} of key {} already exists",
                self.name
            )));
        }

        let mut candidate = KeyEntry::default();
        asymmetric::import_private(kind, der, &mut candidate)?;
        asymmetric::ensure_same_public_key(kind, existing, &candidate)?;

        let entry = self.keys.get_mut(&version).ok_or_else(|| TransitError::Internal {
            reason: format!("key version {version} disappeared"),
        })?;
        match kind {
            KeyKind::Rsa(_) => {
                entry.rsa_key = std::mem::take(&mut candidate.rsa_key);
                entry.rsa_public_key.clear();
            }
            KeyKind::Ecdsa(_) => entry.ec_d = std::mem::take(&mut candidate.ec_d),
            _ => entry.key = std::mem::take(&mut candidate.key),
        }
        info!(name = %self.name, version, "imported private half of key version");
        Ok(())
    }
}
