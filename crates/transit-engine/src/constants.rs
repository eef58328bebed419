//! Constants for the transit operation dispatcher.
//!
//! Tiger Style: All limits are explicitly typed and bounded.

use std::time::Duration;

use transit_keys::KeyKind;
use transit_keys::RsaBits;

// ============================================================================
// Storage Layout
// ============================================================================

/// Storage path of the persisted cache configuration.
pub const CONFIG_CACHE_PATH: &str = "config/cache";

/// Storage path of the persisted key configuration.
pub const CONFIG_KEYS_PATH: &str = "config/keys";

// ============================================================================
// Request Limits
// ============================================================================

/// Default maximum number of items in one `batch_input`.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1024;

/// Default maximum decoded plaintext size in bytes.
pub const DEFAULT_MAX_PLAINTEXT_SIZE: usize = 32 * 1024 * 1024;

/// Default number of random bytes returned by `random`.
pub const DEFAULT_RANDOM_BYTES: usize = 32;

/// Maximum number of random bytes returned by one `random` call.
pub const MAX_RANDOM_BYTES: usize = 128 * 1024;

/// Default data key size in bits.
pub const DEFAULT_DATA_KEY_BITS: usize = 256;

/// Data key sizes accepted by `datakey`.
pub const DATA_KEY_BITS: [usize; 3] = [128, 256, 512];

// ============================================================================
// Defaults
// ============================================================================

/// Key type of the import wrapping key.
pub const DEFAULT_WRAPPING_KEY_TYPE: KeyKind = KeyKind::Rsa(RsaBits::B4096);

/// Hash function used by import and BYOK export when none is given.
pub const DEFAULT_WRAPPING_HASH: &str = "SHA256";

/// Default interval of the auto-rotation driver.
pub const DEFAULT_AUTO_ROTATE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
