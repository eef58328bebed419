//! The transit backend: shared state and helpers used by every operation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use transit_keys::LockManager;
use transit_keys::PolicyGuard;
use transit_keys::RequestContext;
use transit_keys::Result;
use transit_keys::Storage;
use transit_keys::TransitError;
use transit_keys::codec::decode_b64;
use transit_keys::constants::ARCHIVE_PATH;
use transit_keys::constants::MAX_KEY_NAME_LENGTH;
use transit_keys::constants::POLICY_PATH;
use transit_keys::constants::WRAPPING_KEY_PREFIX;

use crate::config::CacheConfig;
use crate::config::TransitConfig;
use crate::constants::CONFIG_CACHE_PATH;

/// Dispatcher for every transit operation.
///
/// Each operation takes a [`CancellationToken`] for the request. Lock waits
/// and storage calls fail with a cancelled error once it fires.
pub struct TransitBackend {
    storage: Arc<dyn Storage>,
    locks: LockManager,
    config: TransitConfig,
}

impl TransitBackend {
    /// Construct a backend over `storage`.
    ///
    /// The policy cache is sized from the persisted `config/cache` entry.
    pub async fn new(storage: Arc<dyn Storage>, config: TransitConfig) -> Result<Self> {
        config.validate()?;
        let ctx = RequestContext::new(storage.clone(), CancellationToken::new());
        let cache = ctx.get_json::<CacheConfig>(CONFIG_CACHE_PATH).await?.unwrap_or_default();
        if cache.size != 0 && cache.size < config.min_cache_size {
            return Err(TransitError::invalid(format!(
                "persisted cache size {} is below the minimum of {}",
                cache.size, config.min_cache_size
            )));
        }

        let locks = LockManager::new(cache.size, config.cache_disabled);
        info!(
            cache_size = cache.size,
            cache_disabled = config.cache_disabled,
            wrapping_key_type = %config.wrapping_key_type,
            "transit backend initialized"
        );
        Ok(Self { storage, locks, config })
    }

    /// Static configuration.
    pub fn config(&self) -> &TransitConfig {
        &self.config
    }

    /// Lock manager and policy cache.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn context(&self, cancel: &CancellationToken) -> RequestContext {
        RequestContext::new(self.storage.clone(), cancel.clone())
    }

    /// Drop cached state for a storage path changed outside this backend.
    ///
    /// Recognizes `policy/<name>` and `archive/<name>`, with or without the
    /// wrapping key prefix. Other paths are ignored.
    pub fn invalidate(&self, path: &str) {
        let (prefix, rest) = match path.strip_prefix(WRAPPING_KEY_PREFIX) {
            Some(rest) => (WRAPPING_KEY_PREFIX, rest),
            None => ("", path),
        };
        let name = rest.strip_prefix(POLICY_PATH).or_else(|| rest.strip_prefix(ARCHIVE_PATH));
        match name {
            Some(name) if !name.is_empty() => self.locks.invalidate(prefix, name),
            _ => debug!(path, "ignoring invalidation of unrelated path"),
        }
    }

    /// Shared-locked policy; a missing policy is an error.
    pub(crate) async fn shared_policy(&self, ctx: &RequestContext, name: &str) -> Result<PolicyGuard> {
        validate_key_name(name)?;
        self.locks
            .get_policy_shared(ctx, "", name)
            .await?
            .ok_or_else(|| TransitError::KeyNotFound { name: name.to_string() })
    }

    /// Exclusively locked policy; a missing policy is an error.
    pub(crate) async fn exclusive_policy(&self, ctx: &RequestContext, name: &str) -> Result<PolicyGuard> {
        validate_key_name(name)?;
        self.locks
            .get_policy_exclusive(ctx, "", name)
            .await?
            .ok_or_else(|| TransitError::KeyNotFound { name: name.to_string() })
    }

    /// Decode a base64 plaintext and enforce the size limit.
    pub(crate) fn decode_plaintext(&self, plaintext: &str) -> Result<Vec<u8>> {
        let decoded = decode_b64("plaintext", plaintext)?;
        if decoded.len() > self.config.max_plaintext_size {
            return Err(TransitError::invalid(format!(
                "plaintext of {} bytes exceeds the maximum of {}",
                decoded.len(),
                self.config.max_plaintext_size
            )));
        }
        Ok(decoded)
    }
}

/// Decode an optional base64 field; absent means empty.
pub(crate) fn decode_optional(field: &str, value: Option<&str>) -> Result<Vec<u8>> {
    match value {
        Some(value) if !value.is_empty() => decode_b64(field, value),
        _ => Ok(Vec::new()),
    }
}

/// Check that `name` is usable as a key name.
///
/// Names are 1 to 256 characters of ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_key_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransitError::invalid("missing key name"));
    }
    if name.len() > MAX_KEY_NAME_LENGTH {
        return Err(TransitError::invalid(format!(
            "key name exceeds the maximum length of {MAX_KEY_NAME_LENGTH}"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(TransitError::invalid(format!("invalid key name '{name}'")));
    }
    if name == "." || name == ".." {
        return Err(TransitError::invalid(format!("invalid key name '{name}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use transit_keys::InMemoryStorage;

    use super::*;

    #[test]
    fn test_validate_key_name() {
        validate_key_name("orders-2024_v1.key").unwrap();
        assert!(validate_key_name("").is_err());
        assert!(validate_key_name("a/b").is_err());
        assert!(validate_key_name("..").is_err());
        assert!(validate_key_name("spaced name").is_err());
        assert!(validate_key_name(&"k".repeat(MAX_KEY_NAME_LENGTH + 1)).is_err());
        validate_key_name(&"k".repeat(MAX_KEY_NAME_LENGTH)).unwrap();
    }

    #[test]
    fn test_decode_optional() {
        assert!(decode_optional("context", None).unwrap().is_empty());
        assert!(decode_optional("context", Some("")).unwrap().is_empty());
        assert_eq!(decode_optional("context", Some("YWJj")).unwrap(), b"abc");
        assert!(decode_optional("context", Some("not base64!")).is_err());
    }

    #[tokio::test]
    async fn test_new_rejects_small_persisted_cache() {
        let storage = Arc::new(InMemoryStorage::new());
        let ctx = RequestContext::new(storage.clone(), CancellationToken::new());
        ctx.put_json(CONFIG_CACHE_PATH, &CacheConfig { size: 3 }, false).await.unwrap();
        assert!(TransitBackend::new(storage.clone(), TransitConfig::default()).await.is_err());

        ctx.put_json(CONFIG_CACHE_PATH, &CacheConfig { size: 50 }, false).await.unwrap();
        let backend = TransitBackend::new(storage, TransitConfig::default()).await.unwrap();
        assert_eq!(backend.locks().cache_size(), Some(50));
    }
}
