//! Archive of every key version ever issued.
//!
//! The archive is a dense list where version `v` lives at index
//! `v - archive_min_version`. While nothing has been trimmed, index 0 holds an
//! empty placeholder so that version `n` sits at index `n`.

use serde::Deserialize;
use serde::Serialize;
use zeroize::Zeroize;

use super::Policy;
use crate::entry::KeyEntry;
use crate::error::Result;
use crate::error::TransitError;
use crate::storage::RequestContext;

/// Persisted archive blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedKeys {
    /// Archived entries, indexed relative to the policy's archive floor.
    pub keys: Vec<KeyEntry>,
}

impl ArchivedKeys {
    /// Number of real versions held, not counting the placeholder.
    pub fn version_count(&self) -> usize {
        self.keys.iter().filter(|e| !e.is_placeholder()).count()
    }
}

fn internal(reason: impl Into<String>) -> TransitError {
    TransitError::Internal { reason: reason.into() }
}

impl Policy {
    /// Load this policy's archive, if one was written.
    pub async fn load_archive(&self, ctx: &RequestContext) -> Result<Option<ArchivedKeys>> {
        ctx.get_json(&self.archive_path()).await
    }

    /// Bring the archive up to date with the working set and store it.
    pub(crate) async fn handle_archiving(&mut self, ctx: &RequestContext) -> Result<()> {
        self.check_archive_bounds()?;

        let archive = match self.load_archive(ctx).await? {
            Some(archive) => archive,
            None => {
                // Rebuild from the working set.
                self.archive_version = self.archive_min_version.saturating_sub(1);
                ArchivedKeys::default()
            }
        };

        let archive = self.sync_archive(archive)?;
        ctx.put_json(&self.archive_path(), &archive, true).await
    }

    pub(crate) fn check_archive_bounds(&self) -> Result<()> {
        if self.min_available_version > self.latest_version {
            return Err(internal("minimum available version is greater than the latest version"));
        }
        if self.min_decryption_version < self.min_available_version {
            return Err(internal("minimum decryption version is below the minimum available version"));
        }
        if self.min_decryption_version > self.latest_version {
            return Err(internal("minimum decryption version is greater than the latest version"));
        }
        if self.archive_version > self.latest_version {
            return Err(internal("archive version is greater than the latest version"));
        }
        if self.min_encryption_version > 0 && self.min_encryption_version < self.min_decryption_version {
            return Err(internal("minimum encryption version is below the minimum decryption version"));
        }
        Ok(())
    }

    /// Copy new versions in, trim below the floor and refill the working set.
    pub(crate) fn sync_archive(&mut self, mut archive: ArchivedKeys) -> Result<ArchivedKeys> {
        let base = self.archive_min_version;
        let needed = (self.latest_version - base + 1) as usize;
        if archive.keys.len() < needed {
            archive.keys.resize_with(needed, KeyEntry::default);
        }

        for version in (self.archive_version + 1).max(base)..=self.latest_version {
            let entry = self
                .keys
                .get(&version)
                .ok_or_else(|| internal(format!("key version {version} is missing from the working set")))?;
            archive.keys[(version - base) as usize] = entry.clone();
            self.archive_version = version;
        }

        if self.archive_min_version < self.min_available_version {
            let drop = ((self.min_available_version - self.archive_min_version) as usize).min(archive.keys.len());
            for mut trimmed in archive.keys.drain(..drop) {
                trimmed.zeroize();
            }
            self.archive_min_version = self.min_available_version;
        }

        let min_decryption = self.min_decryption_version;
        self.keys.retain(|version, _| *version >= min_decryption);

        for version in min_decryption..=self.latest_version {
            if self.keys.contains_key(&version) {
                continue;
            }
            let entry = archive
                .keys
                .get((version - self.archive_min_version) as usize)
                .filter(|e| !e.is_placeholder())
                .ok_or_else(|| internal(format!("key version {version} is missing from the archive")))?;
            self.keys.insert(version, entry.clone());
        }

        Ok(archive)
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
    async fn test_archive_tracks_every_version() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        for _ in 0..4 {
            policy.rotate(&ctx).await.unwrap();
        }

        let archive = policy.load_archive(&ctx).await.unwrap().unwrap();
        // Placeholder plus five versions.
        assert_eq!(archive.keys.len(), 6);
        assert_eq!(archive.version_count(), 5);
        assert!(archive.keys[0].is_placeholder());
        for version in 1..=5u32 {
            assert_eq!(&archive.keys[version as usize], policy.entry(version).unwrap());
        }
    }

    #[tokio::test]
    async fn test_min_decryption_moves_versions_out_and_back() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        for _ in 0..3 {
            policy.rotate(&ctx).await.unwrap();
        }
        let v1 = policy.entry(1).unwrap().clone();

        policy.min_decryption_version = 3;
        policy.persist(&ctx).await.unwrap();
        assert_eq!(policy.keys.keys().copied().collect::<Vec<_>>(), vec![3, 4]);

        let archive = policy.load_archive(&ctx).await.unwrap().unwrap();
        assert_eq!(archive.version_count(), 4);

        policy.min_decryption_version = 1;
        policy.persist(&ctx).await.unwrap();
        assert_eq!(policy.keys.len(), 4);
        assert_eq!(policy.entry(1).unwrap(), &v1);
    }

    #[tokio::test]
    async fn test_trim_drops_front_of_archive() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        for _ in 0..4 {
            policy.rotate(&ctx).await.unwrap();
        }
        let v3 = policy.entry(3).unwrap().clone();

        policy.min_encryption_version = 3;
        policy.min_decryption_version = 3;
        policy.min_available_version = 3;
        policy.persist(&ctx).await.unwrap();

        let archive = policy.load_archive(&ctx).await.unwrap().unwrap();
        assert_eq!(archive.keys.len(), 3);
        assert_eq!(archive.keys[0], v3);
        assert_eq!(policy.archive_min_version, 3);

        // New versions land after the trimmed floor.
        policy.rotate(&ctx).await.unwrap();
        let archive = policy.load_archive(&ctx).await.unwrap().unwrap();
        assert_eq!(archive.keys.len(), 4);
        assert_eq!(&archive.keys[3], policy.entry(6).unwrap());
    }

    #[tokio::test]
    async fn test_missing_archive_is_rebuilt() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::ChaCha20Poly1305).await;
        policy.rotate(&ctx).await.unwrap();

        ctx.delete(&policy.archive_path()).await.unwrap();
        policy.persist(&ctx).await.unwrap();

        let archive = policy.load_archive(&ctx).await.unwrap().unwrap();
        assert_eq!(archive.version_count(), 2);
        assert_eq!(&archive.keys[2], policy.entry(2).unwrap());
    }

    #[tokio::test]
    async fn test_inconsistent_bounds_rejected() {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::ChaCha20Poly1305).await;
        policy.min_decryption_version = 5;
        assert!(policy.persist(&ctx).await.is_err());
    }
}
