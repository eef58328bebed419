//! Export, BYOK export, backup and restore.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use transit_keys::ExportType;
use transit_keys::HashAlgorithm;
use transit_keys::KeyData;
use transit_keys::KeyKind;
use transit_keys::Policy;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::codec::encode_b64;

use crate::backend::TransitBackend;
use crate::backend::validate_key_name;
use crate::constants::DEFAULT_WRAPPING_HASH;

/// Which versions an export covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// Every version from the minimum decryption version up.
    #[default]
    All,
    /// The latest version.
    Latest,
    /// One version.
    Version(u32),
}

impl FromStr for VersionSelector {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(VersionSelector::All),
            "latest" => Ok(VersionSelector::Latest),
            other => other
                .parse::<u32>()
                .map(VersionSelector::Version)
                .map_err(|_| TransitError::invalid(format!("invalid key version {other}"))),
        }
    }
}

impl VersionSelector {
    fn resolve(self, policy: &Policy) -> Result<Vec<u32>> {
        match self {
            VersionSelector::All => Ok(policy
                .keys
                .keys()
                .copied()
                .filter(|v| *v >= policy.min_decryption_version)
                .collect()),
            VersionSelector::Latest => Ok(vec![policy.latest_version]),
            VersionSelector::Version(0) => Err(TransitError::invalid("key version numbering starts at 1")),
            VersionSelector::Version(v) if v > policy.latest_version => Err(TransitError::InvalidVersion {
                version: v,
                reason: "version does not exist".into(),
            }),
            VersionSelector::Version(v) if v < policy.min_decryption_version => Err(TransitError::InvalidVersion {
                version: v,
                reason: "version for export is below minimum decryption version".into(),
            }),
            VersionSelector::Version(v) => Ok(vec![v]),
        }
    }
}

/// Exported material keyed by version.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResponse {
    /// Key name.
    pub name: String,
    /// Key type.
    #[serde(rename = "type")]
    pub key_type: KeyKind,
    /// Material per version.
    pub keys: BTreeMap<u32, String>,
}

impl fmt::Debug for ExportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportResponse")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A plaintext backup blob.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResponse {
    /// Base64 JSON of the policy and its archive.
    pub backup: String,
}

impl fmt::Debug for BackupResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupResponse").field("backup", &"<redacted>").finish()
    }
}

/// Parameters of `restore[/<name>]`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Blob produced by backup.
    pub backup: String,
    /// Restore under this name instead of the one in the backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Replace an existing key of the same name.
    #[serde(default)]
    pub force: bool,
}

impl fmt::Debug for RestoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreRequest")
            .field("name", &self.name)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl TransitBackend {
    /// Export key material, or public keys, of the selected versions.
    pub async fn export_key(
        &self,
        cancel: &CancellationToken,
        export_type: ExportType,
        name: &str,
        version: VersionSelector,
    ) -> Result<ExportResponse> {
        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        policy.check_exportable(export_type)?;

        let mut keys = BTreeMap::new();
        for v in version.resolve(&policy)? {
            let exported = policy.export_version(export_type, v)?;
            keys.insert(v, exported.to_string());
        }
        debug!(name = %name, export_type = %export_type, versions = keys.len(), "exported key");
        Ok(ExportResponse {
            name: policy.name.clone(),
            key_type: policy.kind,
            keys,
        })
    }

    /// Export `source`'s material wrapped for import under `destination`'s
    /// RSA public key.
    pub async fn byok_export(
        &self,
        cancel: &CancellationToken,
        destination: &str,
        source: &str,
        version: VersionSelector,
        hash_function: Option<&str>,
    ) -> Result<ExportResponse> {
        let hash = HashAlgorithm::from_wrapping_name(hash_function.unwrap_or(DEFAULT_WRAPPING_HASH))?;
        let ctx = self.context(cancel);

        // The destination lock is released before the source lock is taken.
        let wrapping = self.shared_policy(&ctx, destination).await?.snapshot();
        if !matches!(wrapping.kind, KeyKind::Rsa(_)) {
            return Err(TransitError::invalid(format!(
                "byok destination key must be an RSA key, got {}",
                wrapping.kind
            )));
        }

        let guard = self.shared_policy(&ctx, source).await?;
        let policy = guard.read();
        if !policy.exportable {
            return Err(TransitError::NotExportable { name: policy.name.clone() });
        }

        let mut keys = BTreeMap::new();
        for v in version.resolve(&policy)? {
            let material = policy.key_material_for_wrapping(v)?;
            let wrapped = wrapping.wrap_key_material(&material, hash)?;
            keys.insert(v, encode_b64(&wrapped));
        }
        debug!(source = %source, destination = %destination, versions = keys.len(), "byok exported key");
        Ok(ExportResponse {
            name: policy.name.clone(),
            key_type: policy.kind,
            keys,
        })
    }

    /// Produce a plaintext backup. Requires `exportable` and
    /// `allow_plaintext_backup`.
    pub async fn backup_key(&self, cancel: &CancellationToken, name: &str) -> Result<BackupResponse> {
        let ctx = self.context(cancel);
        let guard = self.exclusive_policy(&ctx, name).await?;
        let mut draft = guard.snapshot();
        let backup = draft.backup(&ctx).await?;
        guard.commit(draft)?;
        info!(name = %name, "backed up key");
        Ok(BackupResponse { backup })
    }

    /// Restore a backup.
    pub async fn restore_key(&self, cancel: &CancellationToken, request: RestoreRequest) -> Result<()> {
        let data = KeyData::decode(&request.backup)?;
        let name = request.name.as_deref().filter(|n| !n.is_empty());
        validate_key_name(name.unwrap_or(&data.policy.name))?;

        let ctx = self.context(cancel);
        self.locks().restore_policy(&ctx, "", name, data, request.force).await
    }
}
