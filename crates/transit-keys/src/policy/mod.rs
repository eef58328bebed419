//! The named key ring.
//!
//! A [`Policy`] owns every live version of a key plus the settings that
//! govern which versions may be used. Superseded versions are kept in a
//! separately persisted archive (see [`archive`]).

mod archive;
mod backup;
mod config;
mod import;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use zeroize::Zeroizing;

pub use self::archive::ArchivedKeys;
pub use self::backup::BackupInfo;
pub use self::backup::KeyData;
pub use self::backup::RestoreInfo;
pub use self::config::ConfigOutcome;
pub use self::config::PolicyConfigUpdate;
pub use self::config::validate_auto_rotate_period;
pub use self::import::ImportMaterial;
use crate::codec::base64_bytes;
use crate::constants::ARCHIVE_PATH;
use crate::constants::DEFAULT_HMAC_TYPE_KEY_SIZE;
use crate::constants::HMAC_KEY_SIZE;
use crate::constants::MAX_HMAC_TYPE_KEY_SIZE;
use crate::constants::MIN_HMAC_TYPE_KEY_SIZE;
use crate::constants::POLICY_PATH;
use crate::crypto::asymmetric;
use crate::crypto::kdf::Kdf;
use crate::crypto::random_bytes;
use crate::entry::ConvergentVersion;
use crate::entry::KeyEntry;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::KeyKind;
use crate::storage::RequestContext;

/// A named, versioned key ring and its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique name within its storage prefix.
    pub name: String,

    /// Key family.
    #[serde(rename = "type")]
    pub kind: KeyKind,

    /// Working set of versions, `[min_decryption_version, latest_version]`.
    #[serde(default)]
    pub keys: BTreeMap<u32, KeyEntry>,

    /// Single key of the legacy layout. Migrated into `keys[1]` on load.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,

    /// Highest version ever created.
    #[serde(default)]
    pub latest_version: u32,

    /// Highest version copied into the archive.
    #[serde(default)]
    pub archive_version: u32,

    /// Lowest version still held by the archive.
    #[serde(default)]
    pub archive_min_version: u32,

    /// Versions below this were trimmed and are gone for good.
    #[serde(default)]
    pub min_available_version: u32,

    /// Lowest version usable to decrypt and verify.
    #[serde(default)]
    pub min_decryption_version: u32,

    /// Lowest version usable to encrypt and sign. Zero means latest only.
    #[serde(default)]
    pub min_encryption_version: u32,

    /// Every operation needs a context from which a subkey is derived.
    #[serde(default)]
    pub derived: bool,

    /// Derivation mode for derived policies.
    #[serde(default)]
    pub kdf: Kdf,

    /// Nonces are deterministic in the context and plaintext.
    #[serde(default)]
    pub convergent_encryption: bool,

    /// Fixed convergent rules of older policies. `None` means the rules are
    /// recorded per key entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergent_version: Option<ConvergentVersion>,

    /// Private material may be exported.
    #[serde(default)]
    pub exportable: bool,

    /// Plaintext backups may be taken.
    #[serde(default)]
    pub allow_plaintext_backup: bool,

    /// The policy may be deleted.
    #[serde(default)]
    pub deletion_allowed: bool,

    /// Automatic rotation period in seconds. Zero disables.
    #[serde(default)]
    pub auto_rotate_period: u64,

    /// Created by import rather than local generation.
    #[serde(default)]
    pub imported: bool,

    /// Imported keys may still be rotated.
    #[serde(default)]
    pub allow_imported_key_rotation: bool,

    /// Key size in bytes of `hmac` keys.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub key_size: usize,

    /// Last plaintext backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_info: Option<BackupInfo>,

    /// Last restore from a backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_info: Option<RestoreInfo>,

    /// Prefix of this policy's storage paths.
    #[serde(default)]
    pub storage_prefix: String,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

/// Storage path of a policy blob.
pub fn policy_path(prefix: &str, name: &str) -> String {
    format!("{prefix}{POLICY_PATH}{name}")
}

/// Storage path of an archive blob.
pub fn archive_path(prefix: &str, name: &str) -> String {
    format!("{prefix}{ARCHIVE_PATH}{name}")
}

impl Policy {
    /// A policy with no versions yet.
    pub fn new(name: impl Into<String>, kind: KeyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            keys: BTreeMap::new(),
            key: Vec::new(),
            latest_version: 0,
            archive_version: 0,
            archive_min_version: 0,
            min_available_version: 0,
            min_decryption_version: 0,
            min_encryption_version: 0,
            derived: false,
            kdf: Kdf::HkdfSha256,
            convergent_encryption: false,
            convergent_version: None,
            exportable: false,
            allow_plaintext_backup: false,
            deletion_allowed: false,
            auto_rotate_period: 0,
            imported: false,
            allow_imported_key_rotation: false,
            key_size: 0,
            backup_info: None,
            restore_info: None,
            storage_prefix: String::new(),
        }
    }

    /// Storage path of this policy.
    pub fn policy_path(&self) -> String {
        policy_path(&self.storage_prefix, &self.name)
    }

    /// Storage path of this policy's archive.
    pub fn archive_path(&self) -> String {
        archive_path(&self.storage_prefix, &self.name)
    }

    /// Automatic rotation period, if enabled.
    pub fn auto_rotate_interval(&self) -> Option<Duration> {
        (self.auto_rotate_period > 0).then(|| Duration::from_secs(self.auto_rotate_period))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load a policy from storage without upgrading it.
    pub async fn load(ctx: &RequestContext, prefix: &str, name: &str) -> Result<Option<Policy>> {
        ctx.get_json(&policy_path(prefix, name)).await
    }

    /// Persist the archive, then the policy.
    ///
    /// Archive bookkeeping fields of `self` are updated as part of the call,
    /// so callers persist a draft and only publish it once this succeeds.
    pub async fn persist(&mut self, ctx: &RequestContext) -> Result<()> {
        self.handle_archiving(ctx).await?;
        ctx.put_json(&self.policy_path(), self, true).await?;
        debug!(name = %self.name, latest_version = self.latest_version, "persisted policy");
        Ok(())
    }

    /// Canonical serialized form.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TransitError::Serialization { reason: e.to_string() })
    }

    /// Whether a freshly loaded policy must be migrated before use.
    pub fn needs_upgrade(&self) -> bool {
        if !self.key.is_empty() {
            return true;
        }
        if self.latest_version == 0 && !self.keys.is_empty() {
            return true;
        }
        if self.min_decryption_version == 0 || self.archive_version == 0 {
            return true;
        }
        self.kind.supports_hmac() && self.keys.get(&self.latest_version).is_some_and(|e| e.hmac_key.is_empty())
    }

    /// Migrate legacy layouts and persist. Requires the exclusive lock.
    pub async fn upgrade(&mut self, ctx: &RequestContext) -> Result<()> {
        let mut persist_needed = false;

        if !self.key.is_empty() {
            let entry = KeyEntry {
                key: std::mem::take(&mut self.key),
                creation_time: Some(Utc::now()),
                ..KeyEntry::default()
            };
            self.keys = BTreeMap::from([(1, entry)]);
            persist_needed = true;
        }

        if self.latest_version == 0 && !self.keys.is_empty() {
            self.latest_version = self.keys.len() as u32;
            persist_needed = true;
        }

        if self.min_decryption_version == 0 {
            self.min_decryption_version = 1;
            persist_needed = true;
        }

        if self.archive_version == 0 {
            persist_needed = true;
        }

        if self.kind.supports_hmac() {
            if let Some(entry) = self.keys.get_mut(&self.latest_version) {
                if entry.hmac_key.is_empty() {
                    entry.hmac_key = random_bytes(HMAC_KEY_SIZE).to_vec();
                    persist_needed = true;
                }
            }
        }

        if persist_needed {
            self.persist(ctx).await?;
            debug!(name = %self.name, "upgraded policy layout");
        }
        Ok(())
    }

    // ========================================================================
    // Rotation
    // ========================================================================

    /// Key size of `hmac` keys, defaulted.
    pub fn hmac_type_key_size(&self) -> usize {
        if self.key_size == 0 {
            DEFAULT_HMAC_TYPE_KEY_SIZE
        } else {
            self.key_size
        }
    }

    /// Add a freshly generated version without persisting.
    pub fn rotate_in_memory(&mut self) -> Result<()> {
        let mut entry = KeyEntry {
            creation_time: Some(Utc::now()),
            ..KeyEntry::default()
        };

        if !matches!(self.kind, KeyKind::AesCmac(_) | KeyKind::Hmac) {
            entry.hmac_key = random_bytes(HMAC_KEY_SIZE).to_vec();
        }

        match self.kind {
            KeyKind::Hmac => {
                let size = self.hmac_type_key_size();
                if !(MIN_HMAC_TYPE_KEY_SIZE..=MAX_HMAC_TYPE_KEY_SIZE).contains(&size) {
                    return Err(TransitError::invalid(format!(
                        "invalid key size for HMAC key, must be between {MIN_HMAC_TYPE_KEY_SIZE} and {MAX_HMAC_TYPE_KEY_SIZE} bytes"
                    )));
                }
                entry.key = random_bytes(size).to_vec();
                entry.hmac_key = entry.key.clone();
            }
            kind if kind.is_asymmetric() => asymmetric::generate(kind, &mut entry)?,
            kind => {
                let len = kind.symmetric_key_len().ok_or_else(|| TransitError::Internal {
                    reason: format!("no key length for {kind}"),
                })?;
                entry.key = random_bytes(len).to_vec();
            }
        }

        self.insert_new_version(entry);
        Ok(())
    }

    /// Rotate and persist. Requires the exclusive lock.
    pub async fn rotate(&mut self, ctx: &RequestContext) -> Result<()> {
        if self.imported && !self.allow_imported_key_rotation {
            return Err(TransitError::invalid(format!(
                "imported key {} does not allow rotation",
                self.name
            )));
        }
        self.rotate_in_memory()?;
        self.imported = false;
        self.persist(ctx).await
    }

    fn insert_new_version(&mut self, mut entry: KeyEntry) {
        if self.convergent_encryption && !matches!(self.convergent_version, Some(ConvergentVersion::V1)) {
            entry.convergent_version = Some(ConvergentVersion::CURRENT);
        }
        self.latest_version += 1;
        self.keys.insert(self.latest_version, entry);
        if self.min_decryption_version == 0 {
            self.min_decryption_version = 1;
        }
    }

    /// Whether automatic rotation is due at `now`.
    pub fn auto_rotate_due(&self, now: DateTime<Utc>) -> bool {
        let Some(period) = self.auto_rotate_interval() else {
            return false;
        };
        if self.imported && !self.allow_imported_key_rotation {
            return false;
        }
        let Ok(period) = chrono::Duration::from_std(period) else {
            return false;
        };
        match self.keys.get(&self.latest_version).and_then(|e| e.creation_time) {
            Some(created) => created + period <= now,
            None => true,
        }
    }

    // ========================================================================
    // Version selection
    // ========================================================================

    /// Resolve the version used to encrypt, sign or MAC. Zero means latest.
    pub fn resolve_write_version(&self, operation: &str, requested: u32) -> Result<u32> {
        if requested == 0 || requested == self.latest_version {
            return Ok(self.latest_version);
        }
        if requested > self.latest_version {
            return Err(TransitError::InvalidVersion {
                version: requested,
                reason: format!("requested version for {operation} is higher than the latest key version"),
            });
        }
        if requested < self.min_encryption_version {
            return Err(TransitError::InvalidVersion {
                version: requested,
                reason: format!("requested version for {operation} is less than the minimum encryption key version"),
            });
        }
        if requested < self.min_decryption_version {
            return Err(TransitError::InvalidVersion {
                version: requested,
                reason: format!("requested version for {operation} is no longer available"),
            });
        }
        Ok(requested)
    }

    /// Check a version embedded in a ciphertext or signature.
    pub fn check_read_version(&self, version: u32) -> Result<()> {
        if version > self.latest_version {
            return Err(TransitError::InvalidVersion {
                version,
                reason: "version is too new".into(),
            });
        }
        if version < self.min_decryption_version {
            return Err(TransitError::VersionTooOld);
        }
        Ok(())
    }

    /// Entry for a version in the working set.
    pub fn entry(&self, version: u32) -> Result<&KeyEntry> {
        self.keys.get(&version).ok_or_else(|| TransitError::InvalidVersion {
            version,
            reason: "key version not found".into(),
        })
    }

    /// Convergent rules in force for a version.
    pub fn convergent_version_for(&self, version: u32) -> Option<ConvergentVersion> {
        if !self.convergent_encryption {
            return None;
        }
        let per_entry = self.keys.get(&version).and_then(|e| e.convergent_version);
        Some(self.convergent_version.or(per_entry).unwrap_or(ConvergentVersion::V1))
    }

    /// Key bytes for a version, derived from `context` when the policy is derived.
    pub fn derive_key(&self, context: &[u8], version: u32, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        if !self.kind.supports_derivation() {
            return Err(TransitError::Unsupported {
                operation: "key derivation".into(),
                key_type: self.kind,
            });
        }
        let entry = self.entry(version)?;
        if !self.derived {
            return Ok(Zeroizing::new(entry.key.clone()));
        }
        if context.is_empty() {
            return Err(TransitError::invalid(
                "missing 'context' for key derivation; the key was created using a derived key, \
                 which means additional, per-request information must be included in order to \
                 perform operations with the key",
            ));
        }
        self.kdf.derive(&entry.key, context, len)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::key_type::AesBits;
    use crate::storage::InMemoryStorage;
    use crate::storage::Storage;

    pub(crate) fn make_ctx() -> (Arc<InMemoryStorage>, RequestContext) {
        let storage = Arc::new(InMemoryStorage::new());
        let dyn_storage: Arc<dyn Storage> = storage.clone();
        (storage, RequestContext::new(dyn_storage, CancellationToken::new()))
    }

    pub(crate) async fn make_policy(ctx: &RequestContext, name: &str, kind: KeyKind) -> Policy {
        let mut policy = Policy::new(name, kind);
        policy.rotate(ctx).await.unwrap();
        policy
    }

    #[tokio::test]
    async fn test_rotate_persists_policy_and_archive() {
        let (storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;

        assert_eq!(policy.latest_version, 1);
        assert_eq!(policy.min_decryption_version, 1);
        assert_eq!(policy.archive_version, 1);
        assert_eq!(storage.is_sealed("policy/k").await, Some(true));
        assert_eq!(storage.is_sealed("archive/k").await, Some(true));

        for _ in 0..3 {
            policy.rotate(&ctx).await.unwrap();
        }
        assert_eq!(policy.latest_version, 4);
        assert_eq!(policy.keys.len(), 4);

        let loaded = Policy::load(&ctx, "", "k").await.unwrap().unwrap();
        assert_eq!(loaded, policy);
        assert!(!loaded.needs_upgrade());
    }

    #[tokio::test]
    async fn test_hmac_key_rules_by_type() {
        let (_storage, ctx) = make_ctx();

        let aes = make_policy(&ctx, "aes", KeyKind::Aes(AesBits::B128)).await;
        let entry = aes.entry(1).unwrap();
        assert_eq!(entry.key.len(), 16);
        assert_eq!(entry.hmac_key.len(), 32);

        let hmac = make_policy(&ctx, "hmac", KeyKind::Hmac).await;
        let entry = hmac.entry(1).unwrap();
        assert_eq!(entry.key, entry.hmac_key);

        let cmac = make_policy(&ctx, "cmac", KeyKind::AesCmac(AesBits::B256)).await;
        assert!(cmac.entry(1).unwrap().hmac_key.is_empty());
        assert!(!cmac.needs_upgrade());
    }

    #[tokio::test]
    async fn test_legacy_layout_upgrade() {
        let (_storage, ctx) = make_ctx();
        let legacy = serde_json::json!({
            "name": "old",
            "type": "aes256-gcm96",
            "key": crate::codec::encode_b64(&[7u8; 32]),
        });
        ctx.put_json("policy/old", &legacy, true).await.unwrap();

        let mut policy = Policy::load(&ctx, "", "old").await.unwrap().unwrap();
        assert!(policy.needs_upgrade());
        policy.upgrade(&ctx).await.unwrap();

        assert!(policy.key.is_empty());
        assert_eq!(policy.latest_version, 1);
        assert_eq!(policy.min_decryption_version, 1);
        assert_eq!(policy.archive_version, 1);
        assert_eq!(policy.entry(1).unwrap().key, vec![7u8; 32]);
        assert_eq!(policy.entry(1).unwrap().hmac_key.len(), 32);

        // The re-persisted form needs no further migration and is byte-stable.
        let reloaded = Policy::load(&ctx, "", "old").await.unwrap().unwrap();
        assert!(!reloaded.needs_upgrade());
        let again = Policy::load(&ctx, "", "old").await.unwrap().unwrap();
        assert_eq!(reloaded.to_canonical_json().unwrap(), again.to_canonical_json().unwrap());
    }

    #[tokio::test]
    async fn test_version_selection() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        for _ in 0..4 {
            policy.rotate(&ctx).await.unwrap();
        }
        policy.min_encryption_version = 3;
        policy.min_decryption_version = 2;

        assert_eq!(policy.resolve_write_version("encryption", 0).unwrap(), 5);
        assert_eq!(policy.resolve_write_version("encryption", 5).unwrap(), 5);
        assert_eq!(policy.resolve_write_version("encryption", 3).unwrap(), 3);
        assert!(policy.resolve_write_version("encryption", 2).is_err());
        assert!(policy.resolve_write_version("encryption", 6).is_err());

        assert!(policy.check_read_version(2).is_ok());
        assert!(matches!(policy.check_read_version(1), Err(TransitError::VersionTooOld)));
        assert!(policy.check_read_version(6).is_err());
    }

    #[tokio::test]
    async fn test_derived_key_requires_context() {
        let (_storage, ctx) = make_ctx();
        let mut policy = Policy::new("d", KeyKind::Aes(AesBits::B256));
        policy.derived = true;
        policy.rotate(&ctx).await.unwrap();

        let err = policy.derive_key(b"", 1, 32).unwrap_err();
        assert!(err.is_user_error());

        let a = policy.derive_key(b"tenant-a", 1, 32).unwrap();
        let b = policy.derive_key(b"tenant-b", 1, 32).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.as_slice(), policy.entry(1).unwrap().key.as_slice());
    }

    #[tokio::test]
    async fn test_stored_policy_without_kdf_uses_counter_mode() {
        let (_storage, ctx) = make_ctx();
        let mut policy = Policy::new("d", KeyKind::Aes(AesBits::B256));
        policy.derived = true;
        policy.rotate(&ctx).await.unwrap();
        assert_eq!(policy.kdf, Kdf::HkdfSha256);

        let mut stored: serde_json::Value = ctx.get_json("policy/d").await.unwrap().unwrap();
        stored.as_object_mut().unwrap().remove("kdf");
        ctx.put_json("policy/d", &stored, true).await.unwrap();

        let loaded = Policy::load(&ctx, "", "d").await.unwrap().unwrap();
        assert_eq!(loaded.kdf, Kdf::HmacSha256Counter);
        let root = loaded.entry(1).unwrap().key.clone();
        let expected = Kdf::HmacSha256Counter.derive(&root, b"tenant", 32).unwrap();
        assert_eq!(loaded.derive_key(b"tenant", 1, 32).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_imported_rotation_guard() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "imp", KeyKind::Aes(AesBits::B256)).await;
        policy.imported = true;
        assert!(policy.rotate(&ctx).await.is_err());

        policy.allow_imported_key_rotation = true;
        policy.rotate(&ctx).await.unwrap();
        assert!(!policy.imported);
        assert_eq!(policy.latest_version, 2);
    }

    #[tokio::test]
    async fn test_auto_rotate_due() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "auto", KeyKind::ChaCha20Poly1305).await;
        let now = Utc::now();
        assert!(!policy.auto_rotate_due(now));

        policy.auto_rotate_period = 3600;
        assert!(!policy.auto_rotate_due(now));
        assert!(policy.auto_rotate_due(now + chrono::Duration::hours(2)));
    }
}
