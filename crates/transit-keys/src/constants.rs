//! Constants for the transit key store.
//!
//! Tiger Style: All constants are explicitly typed with fixed limits
//! to prevent unbounded resource allocation.

use std::time::Duration;

// ============================================================================
// Storage Layout
// ============================================================================

/// Path segment under which policies are persisted: `{prefix}policy/{name}`.
pub const POLICY_PATH: &str = "policy/";

/// Path segment under which archives are persisted: `{prefix}archive/{name}`.
pub const ARCHIVE_PATH: &str = "archive/";

/// Storage prefix of the import wrapping key.
pub const WRAPPING_KEY_PREFIX: &str = "import/";

/// Name of the import wrapping key policy.
pub const WRAPPING_KEY_NAME: &str = "wrapping-key";

// ============================================================================
// Token Format
// ============================================================================

/// Prefix of every ciphertext, signature, HMAC and CMAC token.
///
/// Tokens have the form `vault:v{version}:{base64}`.
pub const TOKEN_PREFIX: &str = "vault:v";

// ============================================================================
// Key Material Sizes
// ============================================================================

/// Size of the per-version HMAC key in bytes.
pub const HMAC_KEY_SIZE: usize = 32;

/// Default size of an `hmac` key type in bytes.
pub const DEFAULT_HMAC_TYPE_KEY_SIZE: usize = 32;

/// Minimum size of an `hmac` key type in bytes.
pub const MIN_HMAC_TYPE_KEY_SIZE: usize = 32;

/// Maximum size of an `hmac` key type in bytes.
///
/// Tiger Style: bounded so a key entry cannot grow without limit.
pub const MAX_HMAC_TYPE_KEY_SIZE: usize = 512;

/// Nonce size of every supported AEAD (96 bits).
pub const AEAD_NONCE_SIZE: usize = 12;

/// Size of the ephemeral AES key used for key wrapping.
pub const EPHEMERAL_KEY_SIZE: usize = 32;

/// AES block size, also the largest CMAC tag.
pub const CMAC_BLOCK_SIZE: usize = 16;

// ============================================================================
// Policy Limits
// ============================================================================

/// Maximum key name length in bytes.
pub const MAX_KEY_NAME_LENGTH: usize = 256;

/// Smallest non-zero automatic rotation period.
pub const MIN_AUTO_ROTATE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Smallest bounded policy cache size. Zero means unbounded.
pub const MIN_CACHE_SIZE: usize = 10;
