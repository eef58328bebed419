//! Per-name locking and cached access to policies.
//!
//! Every policy name (scoped by its storage prefix) has one async
//! reader/writer lock. Readers share it; rotation, configuration, import,
//! restore and deletion take it exclusively. A loaded policy that needs a
//! layout migration is upgraded by releasing the shared lock, taking the
//! exclusive one, re-checking, upgrading and downgrading again.
//!
//! Storage is always written before the cached copy changes, so a failed
//! write leaves the cache describing what storage holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;
use tracing::info;

use crate::cache::PolicyCache;
use crate::constants::HMAC_KEY_SIZE;
use crate::constants::MAX_HMAC_TYPE_KEY_SIZE;
use crate::constants::MIN_HMAC_TYPE_KEY_SIZE;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::KeyKind;
use crate::policy::ImportMaterial;
use crate::policy::KeyData;
use crate::policy::Policy;
use crate::policy::validate_auto_rotate_period;
use crate::storage::RequestContext;

/// Lock table size above which idle entries are pruned.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 4096;

/// Shared, internally locked policy.
///
/// The inner lock only guards memory; callers must also hold the name's
/// lock through a [`PolicyGuard`].
pub struct PolicyCell {
    policy: RwLock<Policy>,
}

impl PolicyCell {
    /// Wrap a policy.
    pub fn new(policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            policy: RwLock::new(policy),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Policy> {
        self.policy.read()
    }

    fn replace(&self, policy: Policy) {
        *self.policy.write() = policy;
    }
}

enum NameLock {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// A policy together with the name lock under which it may be used.
///
/// Dropping the guard releases the lock.
pub struct PolicyGuard {
    cell: Arc<PolicyCell>,
    lock: NameLock,
}

impl PolicyGuard {
    /// Borrow the policy. Do not hold the borrow across an `.await`.
    pub fn read(&self) -> RwLockReadGuard<'_, Policy> {
        self.cell.read()
    }

    /// Clone the policy, typically to mutate and persist a draft.
    pub fn snapshot(&self) -> Policy {
        self.cell.read().clone()
    }

    /// Whether this guard holds the exclusive lock.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.lock, NameLock::Exclusive(_))
    }

    /// Publish a draft that has already been persisted.
    pub fn commit(&self, policy: Policy) -> Result<()> {
        if !self.is_exclusive() {
            return Err(TransitError::Internal {
                reason: "policy changes require the exclusive lock".into(),
            });
        }
        self.cell.replace(policy);
        Ok(())
    }
}

/// Parameters for creating a policy on demand.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    /// Storage prefix, empty for user keys.
    pub storage_prefix: String,
    /// Policy name.
    pub name: String,
    /// Key type of a new policy.
    pub kind: KeyKind,
    /// Key size in bytes for `hmac` keys, 0 for the default.
    pub key_size: usize,
    /// Require a derivation context.
    pub derived: bool,
    /// Deterministic nonces; requires `derived`.
    pub convergent: bool,
    /// Allow export.
    pub exportable: bool,
    /// Allow plaintext backup.
    pub allow_plaintext_backup: bool,
    /// Automatic rotation period, zero to disable.
    pub auto_rotate_period: Duration,
    /// Create the policy if it is missing.
    pub upsert: bool,
    /// Allow rotating an imported key.
    pub allow_imported_key_rotation: bool,
}

impl PolicyRequest {
    /// A request for `name` of type `kind` with default settings.
    pub fn new(name: impl Into<String>, kind: KeyKind) -> Self {
        Self {
            storage_prefix: String::new(),
            name: name.into(),
            kind,
            key_size: 0,
            derived: false,
            convergent: false,
            exportable: false,
            allow_plaintext_backup: false,
            auto_rotate_period: Duration::ZERO,
            upsert: false,
            allow_imported_key_rotation: false,
        }
    }

    /// Check the creation parameters against the key type.
    pub fn validate(&self) -> Result<()> {
        if self.convergent && !self.derived {
            return Err(TransitError::invalid("convergent encryption requires derivation to be enabled"));
        }
        if self.derived && !self.kind.supports_derivation() {
            return Err(TransitError::invalid(format!(
                "key derivation and convergent encryption not supported for keys of type {}",
                self.kind
            )));
        }
        if self.convergent && !self.kind.supports_convergent() {
            return Err(TransitError::invalid(format!(
                "convergent encryption not supported for keys of type {}",
                self.kind
            )));
        }
        if self.key_size != 0 {
            if self.kind != KeyKind::Hmac {
                return Err(TransitError::invalid(format!("key_size is not valid for key type {}", self.kind)));
            }
            if !(MIN_HMAC_TYPE_KEY_SIZE..=MAX_HMAC_TYPE_KEY_SIZE).contains(&self.key_size) {
                return Err(TransitError::invalid(format!(
                    "invalid key_size {}, must be between {MIN_HMAC_TYPE_KEY_SIZE} and {MAX_HMAC_TYPE_KEY_SIZE} bytes",
                    self.key_size
                )));
            }
        }
        validate_auto_rotate_period(self.auto_rotate_period)
    }

    fn build(&self) -> Policy {
        let mut policy = Policy::new(self.name.clone(), self.kind);
        policy.storage_prefix = self.storage_prefix.clone();
        policy.derived = self.derived;
        policy.convergent_encryption = self.convergent;
        policy.exportable = self.exportable;
        policy.allow_plaintext_backup = self.allow_plaintext_backup;
        policy.auto_rotate_period = self.auto_rotate_period.as_secs();
        policy.allow_imported_key_rotation = self.allow_imported_key_rotation;
        if self.kind == KeyKind::Hmac {
            policy.key_size = if self.key_size == 0 { HMAC_KEY_SIZE } else { self.key_size };
        }
        policy
    }
}

/// Lock table plus optional policy cache.
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::RwLock<()>>>>,
    cache: Option<PolicyCache>,
}

fn cache_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

impl LockManager {
    /// Create a manager caching up to `cache_size` policies (0 = unbounded),
    /// or none at all when `caching_disabled`.
    pub fn new(cache_size: usize, caching_disabled: bool) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            cache: (!caching_disabled).then(|| PolicyCache::new(cache_size)),
        }
    }

    /// Whether loaded policies are cached.
    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Bound of the running cache, if caching.
    pub fn cache_size(&self) -> Option<usize> {
        self.cache.as_ref().map(PolicyCache::size)
    }

    /// Number of cached policies.
    pub fn cached_len(&self) -> usize {
        self.cache.as_ref().map_or(0, PolicyCache::len)
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::RwLock<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= LOCK_TABLE_PRUNE_THRESHOLD {
            // Only the table holds an idle lock, so nobody can be using it.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(key.to_string()).or_default().clone()
    }

    async fn lock_shared(&self, ctx: &RequestContext, key: &str) -> Result<OwnedRwLockReadGuard<()>> {
        let lock = self.lock_for(key);
        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(TransitError::Cancelled),
            guard = lock.read_owned() => Ok(guard),
        }
    }

    async fn lock_exclusive(&self, ctx: &RequestContext, key: &str) -> Result<OwnedRwLockWriteGuard<()>> {
        let lock = self.lock_for(key);
        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(TransitError::Cancelled),
            guard = lock.write_owned() => Ok(guard),
        }
    }

    fn cached(&self, key: &str) -> Option<Arc<PolicyCell>> {
        self.cache.as_ref().and_then(|cache| cache.get(key))
    }

    fn publish(&self, key: String, policy: Policy) -> Arc<PolicyCell> {
        let cell = PolicyCell::new(policy);
        if let Some(cache) = &self.cache {
            cache.insert(key, cell.clone());
        }
        cell
    }

    async fn load(ctx: &RequestContext, prefix: &str, name: &str) -> Result<Option<Policy>> {
        let Some(mut policy) = Policy::load(ctx, prefix, name).await? else {
            return Ok(None);
        };
        policy.storage_prefix = prefix.to_string();
        Ok(Some(policy))
    }

    /// Load with the exclusive lock held, migrating the layout when needed.
    async fn load_exclusive(&self, ctx: &RequestContext, key: &str, prefix: &str, name: &str) -> Result<Option<Arc<PolicyCell>>> {
        if let Some(cell) = self.cached(key) {
            return Ok(Some(cell));
        }
        let Some(mut policy) = Self::load(ctx, prefix, name).await? else {
            return Ok(None);
        };
        if policy.needs_upgrade() {
            policy.upgrade(ctx).await?;
        }
        Ok(Some(self.publish(key.to_string(), policy)))
    }

    /// Get a policy under the shared lock, or `None` if it does not exist.
    pub async fn get_policy_shared(&self, ctx: &RequestContext, prefix: &str, name: &str) -> Result<Option<PolicyGuard>> {
        let key = cache_key(prefix, name);
        let read = self.lock_shared(ctx, &key).await?;

        if let Some(cell) = self.cached(&key) {
            return Ok(Some(PolicyGuard {
                cell,
                lock: NameLock::Shared(read),
            }));
        }
        let Some(policy) = Self::load(ctx, prefix, name).await? else {
            return Ok(None);
        };
        if !policy.needs_upgrade() {
            return Ok(Some(PolicyGuard {
                cell: self.publish(key, policy),
                lock: NameLock::Shared(read),
            }));
        }

        // Upgrade path: release, take exclusive, re-check, downgrade.
        drop(read);
        let write = self.lock_exclusive(ctx, &key).await?;
        let Some(cell) = self.load_exclusive(ctx, &key, prefix, name).await? else {
            return Ok(None);
        };
        debug!(name = %name, "downgrading after policy upgrade");
        Ok(Some(PolicyGuard {
            cell,
            lock: NameLock::Shared(write.downgrade()),
        }))
    }

    /// Get a policy under the exclusive lock, or `None` if it does not exist.
    pub async fn get_policy_exclusive(&self, ctx: &RequestContext, prefix: &str, name: &str) -> Result<Option<PolicyGuard>> {
        let key = cache_key(prefix, name);
        let write = self.lock_exclusive(ctx, &key).await?;
        let Some(cell) = self.load_exclusive(ctx, &key, prefix, name).await? else {
            return Ok(None);
        };
        Ok(Some(PolicyGuard {
            cell,
            lock: NameLock::Exclusive(write),
        }))
    }

    /// Get a policy under the shared lock, creating it first when missing and
    /// `request.upsert` is set. The flag reports whether it was created.
    pub async fn get_policy_upsert(&self, ctx: &RequestContext, request: &PolicyRequest) -> Result<Option<(PolicyGuard, bool)>> {
        let prefix = request.storage_prefix.as_str();
        let name = request.name.as_str();
        if let Some(guard) = self.get_policy_shared(ctx, prefix, name).await? {
            return Ok(Some((guard, false)));
        }
        if !request.upsert {
            return Ok(None);
        }
        request.validate()?;

        let key = cache_key(prefix, name);
        let write = self.lock_exclusive(ctx, &key).await?;
        if let Some(cell) = self.load_exclusive(ctx, &key, prefix, name).await? {
            return Ok(Some((
                PolicyGuard {
                    cell,
                    lock: NameLock::Shared(write.downgrade()),
                },
                false,
            )));
        }

        let mut policy = request.build();
        policy.rotate(ctx).await?;
        info!(name = %name, key_type = %policy.kind, derived = policy.derived, "created key");

        let cell = self.publish(key, policy);
        Ok(Some((
            PolicyGuard {
                cell,
                lock: NameLock::Shared(write.downgrade()),
            },
            true,
        )))
    }

    /// Create a policy whose first version is imported material.
    ///
    /// Fails if a policy with the name exists.
    pub async fn import_policy(&self, ctx: &RequestContext, request: &PolicyRequest, material: &ImportMaterial) -> Result<()> {
        request.validate()?;
        let prefix = request.storage_prefix.as_str();
        let name = request.name.as_str();
        let key = cache_key(prefix, name);
        let _write = self.lock_exclusive(ctx, &key).await?;

        if self.cached(&key).is_some() || Self::load(ctx, prefix, name).await?.is_some() {
            return Err(TransitError::KeyExists { name: name.to_string() });
        }

        let mut policy = request.build();
        policy.imported = true;
        policy.import_in_memory(material)?;
        policy.persist(ctx).await?;
        info!(name = %name, key_type = %policy.kind, "imported key");

        self.publish(key, policy);
        Ok(())
    }

    /// Restore a backup under `name`, or the name recorded in the backup.
    ///
    /// An existing policy is only replaced when `force` is set.
    pub async fn restore_policy(
        &self,
        ctx: &RequestContext,
        prefix: &str,
        name: Option<&str>,
        mut data: KeyData,
        force: bool,
    ) -> Result<()> {
        let target = match name {
            Some(name) => name.to_string(),
            None => data.policy.name.clone(),
        };
        if target.is_empty() {
            return Err(TransitError::invalid("backup does not contain a key name"));
        }
        let key = cache_key(prefix, &target);
        let _write = self.lock_exclusive(ctx, &key).await?;

        if !force && (self.cached(&key).is_some() || Self::load(ctx, prefix, &target).await?.is_some()) {
            return Err(TransitError::KeyExists { name: target });
        }

        data.policy.storage_prefix = prefix.to_string();
        let policy = data.restore(ctx, Some(&target)).await?;
        if let Some(cache) = &self.cache {
            cache.insert(key, PolicyCell::new(policy));
        }
        Ok(())
    }

    /// Delete a policy and its archive.
    pub async fn delete_policy(&self, ctx: &RequestContext, prefix: &str, name: &str) -> Result<()> {
        let key = cache_key(prefix, name);
        let _write = self.lock_exclusive(ctx, &key).await?;

        let policy = match self.cached(&key) {
            Some(cell) => cell.read().clone(),
            None => Self::load(ctx, prefix, name)
                .await?
                .ok_or_else(|| TransitError::KeyNotFound { name: name.to_string() })?,
        };
        if !policy.deletion_allowed {
            return Err(TransitError::DeletionNotAllowed { name: name.to_string() });
        }

        if let Some(cache) = &self.cache {
            cache.remove(&key);
        }
        ctx.delete(&policy.policy_path()).await?;
        ctx.delete(&policy.archive_path()).await?;
        info!(name = %name, "deleted key");
        Ok(())
    }

    /// Drop a cached policy so the next access reloads it.
    pub fn invalidate(&self, prefix: &str, name: &str) {
        if let Some(cache) = &self.cache {
            cache.remove(&cache_key(prefix, name));
            debug!(name = %name, "invalidated cached policy");
        }
    }
}
