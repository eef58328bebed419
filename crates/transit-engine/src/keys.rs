//! Key lifecycle: create, read, list, delete, rotate, configure, trim.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use transit_keys::AesBits;
use transit_keys::BackupInfo;
use transit_keys::Kdf;
use transit_keys::KeyKind;
use transit_keys::Policy;
use transit_keys::PolicyConfigUpdate;
use transit_keys::PolicyRequest;
use transit_keys::RestoreInfo;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::constants::POLICY_PATH;

use crate::backend::TransitBackend;
use crate::backend::validate_key_name;
use crate::certificate::encode_pem_chain;
use crate::response::Response;

/// Parameters of `keys/<name>` create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateKeyRequest {
    /// Key type. Defaults to `aes256-gcm96`.
    #[serde(rename = "type", default = "default_key_type")]
    pub key_type: KeyKind,

    /// Require a derivation context on every operation.
    #[serde(default)]
    pub derived: bool,

    /// Deterministic encryption. Requires `derived`.
    #[serde(default)]
    pub convergent_encryption: bool,

    /// Allow export of private material.
    #[serde(default)]
    pub exportable: bool,

    /// Allow plaintext backups.
    #[serde(default)]
    pub allow_plaintext_backup: bool,

    /// Automatic rotation period in seconds. Zero disables.
    #[serde(default)]
    pub auto_rotate_period: u64,

    /// Key size in bytes, `hmac` keys only.
    #[serde(default)]
    pub key_size: usize,
}

fn default_key_type() -> KeyKind {
    KeyKind::Aes(AesBits::B256)
}

impl Default for CreateKeyRequest {
    fn default() -> Self {
        Self::new(default_key_type())
    }
}

impl CreateKeyRequest {
    /// A request for a plain key of `key_type`.
    pub fn new(key_type: KeyKind) -> Self {
        Self {
            key_type,
            derived: false,
            convergent_encryption: false,
            exportable: false,
            allow_plaintext_backup: false,
            auto_rotate_period: 0,
            key_size: 0,
        }
    }
}

/// Parameters of `keys/<name>/config`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyConfigRequest {
    /// Lowest version usable to decrypt and verify.
    #[serde(default)]
    pub min_decryption_version: Option<u32>,

    /// Lowest version usable to encrypt and sign. Zero means latest.
    #[serde(default)]
    pub min_encryption_version: Option<u32>,

    /// Allow deletion.
    #[serde(default)]
    pub deletion_allowed: Option<bool>,

    /// Allow export. Cannot be turned off again.
    #[serde(default)]
    pub exportable: Option<bool>,

    /// Allow plaintext backups. Cannot be turned off again.
    #[serde(default)]
    pub allow_plaintext_backup: Option<bool>,

    /// Automatic rotation period in seconds.
    #[serde(default)]
    pub auto_rotate_period: Option<u64>,
}

impl From<&KeyConfigRequest> for PolicyConfigUpdate {
    fn from(request: &KeyConfigRequest) -> Self {
        PolicyConfigUpdate {
            min_decryption_version: request.min_decryption_version,
            min_encryption_version: request.min_encryption_version,
            deletion_allowed: request.deletion_allowed,
            exportable: request.exportable,
            allow_plaintext_backup: request.allow_plaintext_backup,
            auto_rotate_period: request.auto_rotate_period.map(Duration::from_secs),
        }
    }
}

/// Per-version details of a key read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyVersionInfo {
    /// When the version was created.
    pub creation_time: Option<DateTime<Utc>>,

    /// Public key of asymmetric versions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Attached certificate chain as concatenated PEM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_chain: Option<String>,
}

/// Result of a key read. Never contains private material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyInfo {
    /// Key name.
    pub name: String,
    /// Key type.
    #[serde(rename = "type")]
    pub key_type: KeyKind,
    /// Versions in the working set.
    pub keys: BTreeMap<u32, KeyVersionInfo>,
    /// Operations require a derivation context.
    pub derived: bool,
    /// Derivation function of derived keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kdf: Option<Kdf>,
    /// Deterministic encryption.
    pub convergent_encryption: bool,
    /// Convergent nonce rules of the latest version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergent_encryption_version: Option<u8>,
    /// Private material may be exported.
    pub exportable: bool,
    /// Plaintext backups may be taken.
    pub allow_plaintext_backup: bool,
    /// The key may be deleted.
    pub deletion_allowed: bool,
    /// Lowest version usable to decrypt and verify.
    pub min_decryption_version: u32,
    /// Lowest version usable to encrypt and sign.
    pub min_encryption_version: u32,
    /// Highest version.
    pub latest_version: u32,
    /// Versions below this were trimmed.
    pub min_available_version: u32,
    /// Encrypt is available.
    pub supports_encryption: bool,
    /// Decrypt is available.
    pub supports_decryption: bool,
    /// Per-context derivation is available.
    pub supports_derivation: bool,
    /// Sign and verify are available.
    pub supports_signing: bool,
    /// Automatic rotation period in seconds.
    pub auto_rotate_period: u64,
    /// The key was created by import.
    pub imported_key: bool,
    /// An imported key may be rotated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported_key_allow_rotation: Option<bool>,
    /// Key size of `hmac` keys in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_size: Option<usize>,
    /// Last plaintext backup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_info: Option<BackupInfo>,
    /// Last restore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_info: Option<RestoreInfo>,
}

impl KeyInfo {
    /// Describe `policy`.
    pub fn from_policy(policy: &Policy) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for (&version, entry) in &policy.keys {
            let public_key = if policy.kind.is_asymmetric() {
                Some(policy.public_key(version)?)
            } else {
                None
            };
            let certificate_chain =
                (!entry.certificate_chain.is_empty()).then(|| encode_pem_chain(&entry.certificate_chain));
            keys.insert(version, KeyVersionInfo {
                creation_time: entry.creation_time,
                public_key,
                certificate_chain,
            });
        }

        Ok(Self {
            name: policy.name.clone(),
            key_type: policy.kind,
            keys,
            derived: policy.derived,
            kdf: policy.derived.then_some(policy.kdf),
            convergent_encryption: policy.convergent_encryption,
            convergent_encryption_version: policy.convergent_version_for(policy.latest_version).map(u8::from),
            exportable: policy.exportable,
            allow_plaintext_backup: policy.allow_plaintext_backup,
            deletion_allowed: policy.deletion_allowed,
            min_decryption_version: policy.min_decryption_version,
            min_encryption_version: policy.min_encryption_version,
            latest_version: policy.latest_version,
            min_available_version: policy.min_available_version,
            supports_encryption: policy.kind.supports_encryption(),
            supports_decryption: policy.kind.supports_encryption(),
            supports_derivation: policy.kind.supports_derivation(),
            supports_signing: policy.kind.supports_signing(),
            auto_rotate_period: policy.auto_rotate_period,
            imported_key: policy.imported,
            imported_key_allow_rotation: policy.imported.then_some(policy.allow_imported_key_rotation),
            key_size: (policy.kind == KeyKind::Hmac).then(|| policy.hmac_type_key_size()),
            backup_info: policy.backup_info.clone(),
            restore_info: policy.restore_info.clone(),
        })
    }
}

impl TransitBackend {
    /// Create a key. Creating an existing key succeeds with a warning.
    pub async fn create_key(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: CreateKeyRequest,
    ) -> Result<Response<KeyInfo>> {
        validate_key_name(name)?;
        let policy_request = PolicyRequest {
            derived: request.derived,
            convergent: request.convergent_encryption,
            exportable: request.exportable,
            allow_plaintext_backup: request.allow_plaintext_backup,
            auto_rotate_period: Duration::from_secs(request.auto_rotate_period),
            key_size: request.key_size,
            upsert: true,
            ..PolicyRequest::new(name, request.key_type)
        };
        policy_request.validate()?;

        let ctx = self.context(cancel);
        let (guard, created) =
            self.locks().get_policy_upsert(&ctx, &policy_request).await?.ok_or_else(|| TransitError::Internal {
                reason: format!("upsert of key {name} returned no policy"),
            })?;

        let mut response = Response::new(KeyInfo::from_policy(&guard.read())?);
        if !created {
            response.warn(format!("key {name} already existed"));
        }
        Ok(response)
    }

    /// Describe a key, or `None` if it does not exist.
    pub async fn read_key(&self, cancel: &CancellationToken, name: &str) -> Result<Option<KeyInfo>> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        match self.locks().get_policy_shared(&ctx, "", name).await? {
            Some(guard) => Ok(Some(KeyInfo::from_policy(&guard.read())?)),
            None => Ok(None),
        }
    }

    /// Names of every key.
    pub async fn list_keys(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let ctx = self.context(cancel);
        let mut names = ctx.list(POLICY_PATH).await?;
        names.retain(|name| !name.ends_with('/'));
        Ok(names)
    }

    /// Delete a key and its archive. Requires `deletion_allowed`.
    pub async fn delete_key(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        self.locks().delete_policy(&ctx, "", name).await
    }

    /// Add a new version and make it the latest.
    pub async fn rotate_key(&self, cancel: &CancellationToken, name: &str) -> Result<KeyInfo> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        let guard = self.exclusive_policy(&ctx, name).await?;
        let mut draft = guard.snapshot();
        draft.rotate(&ctx).await?;
        let info = KeyInfo::from_policy(&draft)?;
        guard.commit(draft)?;
        info!(name = %name, version = info.latest_version, "rotated key");
        Ok(info)
    }

    /// Update key settings.
    pub async fn configure_key(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: KeyConfigRequest,
    ) -> Result<Response<KeyInfo>> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        let guard = self.exclusive_policy(&ctx, name).await?;
        let mut draft = guard.snapshot();
        let outcome = draft.apply_config(&PolicyConfigUpdate::from(&request))?;
        if outcome.changed {
            draft.persist(&ctx).await?;
            debug!(name = %name, "updated key configuration");
        }
        let info = KeyInfo::from_policy(&draft)?;
        if outcome.changed {
            guard.commit(draft)?;
        }
        Ok(Response::with_warnings(info, outcome.warnings))
    }

    /// Permanently drop versions below `min_available_version`.
    pub async fn trim_key(&self, cancel: &CancellationToken, name: &str, min_available_version: u32) -> Result<KeyInfo> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        let guard = self.exclusive_policy(&ctx, name).await?;
        let mut draft = guard.snapshot();
        if draft.trim(min_available_version)? {
            draft.persist(&ctx).await?;
            info!(name = %name, min_available_version, "trimmed key versions");
        }
        let info = KeyInfo::from_policy(&draft)?;
        guard.commit(draft)?;
        Ok(info)
    }
}
