//! Plaintext backup and restore of a policy with its archive.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::ArchivedKeys;
use super::Policy;
use crate::codec::decode_b64;
use crate::codec::encode_b64;
use crate::error::Result;
use crate::error::TransitError;
use crate::storage::RequestContext;

/// When a backup was taken and the latest version it contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup time.
    pub time: DateTime<Utc>,
    /// Latest version at backup time.
    pub version: u32,
}

/// When a backup was restored and the latest version it contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInfo {
    /// Restore time.
    pub time: DateTime<Utc>,
    /// Latest version of the restored policy.
    pub version: u32,
}

/// Contents of a backup blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyData {
    /// The policy, including its working set.
    pub policy: Policy,
    /// The full archive.
    pub archived_keys: ArchivedKeys,
}

impl Policy {
    /// Produce a base64 backup blob. Requires the exclusive lock.
    ///
    /// Records `backup_info` and persists it before encoding.
    pub async fn backup(&mut self, ctx: &RequestContext) -> Result<String> {
        if !self.exportable {
            return Err(TransitError::NotExportable { name: self.name.clone() });
        }
        if !self.allow_plaintext_backup {
            return Err(TransitError::BackupNotAllowed { name: self.name.clone() });
        }

        self.backup_info = Some(BackupInfo {
            time: Utc::now(),
            version: self.latest_version,
        });
        self.persist(ctx).await?;

        let archived_keys = self.load_archive(ctx).await?.ok_or_else(|| TransitError::Internal {
            reason: format!("archive of key {} is missing", self.name),
        })?;

        let data = KeyData {
            policy: self.clone(),
            archived_keys,
        };
        let json = serde_json::to_vec(&data).map_err(|e| TransitError::Serialization { reason: e.to_string() })?;
        Ok(encode_b64(&json))
    }
}

impl KeyData {
    /// Decode a backup blob.
    pub fn decode(backup: &str) -> Result<KeyData> {
        let json = decode_b64("backup", backup)?;
        serde_json::from_slice(&json).map_err(|e| TransitError::invalid(format!("failed to decode backup: {e}")))
    }

    /// Write the archive and then the policy under `name`.
    ///
    /// Returns the policy as stored. Callers hold the exclusive lock for the
    /// target name and check for an existing policy first.
    pub async fn restore(self, ctx: &RequestContext, name: Option<&str>) -> Result<Policy> {
        let KeyData {
            mut policy,
            archived_keys,
        } = self;

        if let Some(name) = name {
            policy.name = name.to_string();
        }
        if policy.name.is_empty() {
            return Err(TransitError::invalid("backup does not contain a key name"));
        }
        policy.restore_info = Some(RestoreInfo {
            time: Utc::now(),
            version: policy.latest_version,
        });

        policy.check_archive_bounds()?;
        let archive = policy.sync_archive(archived_keys)?;
        ctx.put_json(&policy.archive_path(), &archive, true).await?;
        ctx.put_json(&policy.policy_path(), &policy, true).await?;

        info!(name = %policy.name, latest_version = policy.latest_version, "restored key from backup");
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_type::AesBits;
    use crate::key_type::KeyKind;
    use crate::policy::tests::make_ctx;
    use crate::policy::tests::make_policy;

    #[tokio::test]
    async fn test_backup_requires_both_flags() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;

        assert!(matches!(policy.backup(&ctx).await, Err(TransitError::NotExportable { .. })));
        policy.exportable = true;
        assert!(matches!(policy.backup(&ctx).await, Err(TransitError::BackupNotAllowed { .. })));
        policy.allow_plaintext_backup = true;
        policy.backup(&ctx).await.unwrap();
        assert!(policy.backup_info.is_some());
    }

    #[tokio::test]
    async fn test_backup_restore_under_new_name() {
        let (_storage, ctx) = make_ctx();
        let mut policy = Policy::new("src", KeyKind::Aes(AesBits::B256));
        policy.exportable = true;
        policy.allow_plaintext_backup = true;
        policy.rotate(&ctx).await.unwrap();
        policy.rotate(&ctx).await.unwrap();

        let blob = policy.backup(&ctx).await.unwrap();
        let restored = KeyData::decode(&blob).unwrap().restore(&ctx, Some("dst")).await.unwrap();

        assert_eq!(restored.name, "dst");
        assert_eq!(restored.keys, policy.keys);
        assert_eq!(restored.restore_info.as_ref().map(|r| r.version), Some(2));

        let loaded = Policy::load(&ctx, "", "dst").await.unwrap().unwrap();
        assert_eq!(loaded, restored);
        let archive = loaded.load_archive(&ctx).await.unwrap().unwrap();
        assert_eq!(archive.version_count(), 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(KeyData::decode("not base64!").unwrap_err().is_user_error());
        assert!(KeyData::decode(&encode_b64(b"{}")).unwrap_err().is_user_error());
    }
}
