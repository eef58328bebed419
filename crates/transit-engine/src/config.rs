//! Engine configuration.
//!
//! [`TransitConfig`] is fixed at construction. The cache and key settings
//! under `config/` are persisted through storage and may change at runtime.
//!
//! # Example TOML
//!
//! ```toml
//! cache_disabled = false
//! wrapping_key_type = "rsa-4096"
//! max_batch_size = 1024
//! ```

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use transit_keys::KeyKind;
use transit_keys::RequestContext;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::constants::MIN_CACHE_SIZE;

use crate::backend::TransitBackend;
use crate::constants::CONFIG_CACHE_PATH;
use crate::constants::CONFIG_KEYS_PATH;
use crate::constants::DEFAULT_MAX_BATCH_SIZE;
use crate::constants::DEFAULT_MAX_PLAINTEXT_SIZE;
use crate::constants::DEFAULT_WRAPPING_KEY_TYPE;
use crate::response::Response;

/// Static configuration of a [`TransitBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitConfig {
    /// Disable the policy cache entirely; every request loads from storage.
    #[serde(default)]
    pub cache_disabled: bool,

    /// Key type generated for the import wrapping key.
    #[serde(default = "default_wrapping_key_type")]
    pub wrapping_key_type: KeyKind,

    /// Maximum number of items in one `batch_input`.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum decoded plaintext size in bytes.
    #[serde(default = "default_max_plaintext_size")]
    pub max_plaintext_size: usize,

    /// Smallest accepted non-zero cache size.
    #[serde(default = "default_min_cache_size")]
    pub min_cache_size: usize,
}

fn default_wrapping_key_type() -> KeyKind {
    DEFAULT_WRAPPING_KEY_TYPE
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_max_plaintext_size() -> usize {
    DEFAULT_MAX_PLAINTEXT_SIZE
}

fn default_min_cache_size() -> usize {
    MIN_CACHE_SIZE
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            cache_disabled: false,
            wrapping_key_type: default_wrapping_key_type(),
            max_batch_size: default_max_batch_size(),
            max_plaintext_size: default_max_plaintext_size(),
            min_cache_size: default_min_cache_size(),
        }
    }
}

impl TransitConfig {
    /// Disable or enable the policy cache.
    pub fn with_cache_disabled(mut self, disabled: bool) -> Self {
        self.cache_disabled = disabled;
        self
    }

    /// Set the key type of the import wrapping key.
    pub fn with_wrapping_key_type(mut self, kind: KeyKind) -> Self {
        self.wrapping_key_type = kind;
        self
    }

    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.wrapping_key_type, KeyKind::Rsa(_)) {
            return Err(TransitError::invalid(format!(
                "wrapping key type must be an RSA type, got {}",
                self.wrapping_key_type
            )));
        }
        if self.max_batch_size == 0 {
            return Err(TransitError::invalid("max_batch_size must be greater than zero"));
        }
        if self.max_plaintext_size == 0 {
            return Err(TransitError::invalid("max_plaintext_size must be greater than zero"));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TransitConfig = toml::from_str(contents)
            .map_err(|e| TransitError::invalid(format!("failed to parse transit config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransitError::invalid(format!("failed to read transit config {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "loaded transit config");
        Self::from_toml_str(&contents)
    }
}

/// Persisted policy cache settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache capacity. Zero means unbounded.
    #[serde(default)]
    pub size: usize,
}

/// Persisted key settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Refuse to create keys implicitly on encrypt.
    #[serde(default)]
    pub disable_upsert: bool,
}

impl TransitBackend {
    pub(crate) async fn load_cache_config(&self, ctx: &RequestContext) -> Result<CacheConfig> {
        Ok(ctx.get_json::<CacheConfig>(CONFIG_CACHE_PATH).await?.unwrap_or_default())
    }

    pub(crate) async fn load_keys_config(&self, ctx: &RequestContext) -> Result<KeysConfig> {
        Ok(ctx.get_json::<KeysConfig>(CONFIG_KEYS_PATH).await?.unwrap_or_default())
    }

    /// Read the persisted cache size.
    ///
    /// Warns when it differs from the size of the running cache, since the
    /// cache is only resized when the backend is constructed.
    pub async fn read_cache_config(&self, cancel: &CancellationToken) -> Result<Response<CacheConfig>> {
        let ctx = self.context(cancel);
        let stored = self.load_cache_config(&ctx).await?;
        let mut response = Response::new(stored);
        if self.locks().is_caching() && self.locks().cache_size() != Some(stored.size) {
            response.warn("cache configurations will be applied when this backend is restarted");
        }
        Ok(response)
    }

    /// Persist a new cache size. Takes effect on the next construction.
    pub async fn write_cache_config(
        &self,
        cancel: &CancellationToken,
        size: usize,
    ) -> Result<Response<CacheConfig>> {
        if size != 0 && size < self.config().min_cache_size {
            return Err(TransitError::invalid(format!(
                "size must be 0 or a value greater or equal to {}",
                self.config().min_cache_size
            )));
        }
        let ctx = self.context(cancel);
        let config = CacheConfig { size };
        ctx.put_json(CONFIG_CACHE_PATH, &config, false).await?;
        warn!(size, "cache size updated; applies after restart");

        let mut response = Response::new(config);
        response.warn("cache configurations will be applied when this backend is restarted");
        Ok(response)
    }

    /// Read the persisted key settings.
    pub async fn read_keys_config(&self, cancel: &CancellationToken) -> Result<KeysConfig> {
        let ctx = self.context(cancel);
        self.load_keys_config(&ctx).await
    }

    /// Persist new key settings.
    pub async fn write_keys_config(
        &self,
        cancel: &CancellationToken,
        config: KeysConfig,
    ) -> Result<KeysConfig> {
        let ctx = self.context(cancel);
        ctx.put_json(CONFIG_KEYS_PATH, &config, false).await?;
        info!(disable_upsert = config.disable_upsert, "key configuration updated");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use transit_keys::RsaBits;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransitConfig::default();
        assert!(!config.cache_disabled);
        assert_eq!(config.wrapping_key_type, KeyKind::Rsa(RsaBits::B4096));
        assert_eq!(config.min_cache_size, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_str_partial() {
        let config = TransitConfig::from_toml_str("wrapping_key_type = \"rsa-2048\"\nmax_batch_size = 8\n").unwrap();
        assert_eq!(config.wrapping_key_type, KeyKind::Rsa(RsaBits::B2048));
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.max_plaintext_size, DEFAULT_MAX_PLAINTEXT_SIZE);
    }

    #[test]
    fn test_from_toml_str_rejects_non_rsa_wrapping_key() {
        assert!(TransitConfig::from_toml_str("wrapping_key_type = \"aes256-gcm96\"").is_err());
        assert!(TransitConfig::from_toml_str("wrapping_key_type = \"rsa-1024\"").is_err());
        assert!(TransitConfig::from_toml_str("max_batch_size = 0").is_err());
    }
}
