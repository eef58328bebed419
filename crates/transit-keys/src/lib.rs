//! Named, versioned key rings and the cryptography performed with them.
//!
//! This crate holds everything below the request dispatcher:
//!
//! - [`Storage`] - async key/value contract plus an in-memory implementation
//! - [`Policy`] - a named key ring with its versions, archive and settings
//! - [`LockManager`] - per-name locking and the policy cache
//! - `crypto` - AEAD, RSA, ECDSA, Ed25519, HMAC, CMAC, key wrapping and
//!   certificate chains, as methods on [`Policy`]
//!
//! ## Example
//!
//! ```ignore
//! use transit_keys::{CipherParams, KeyKind, LockManager, PolicyRequest, RequestContext};
//!
//! let manager = LockManager::new(0, false);
//! let request = PolicyRequest { upsert: true, ..PolicyRequest::new("orders", KeyKind::default()) };
//! let (guard, _created) = manager.get_policy_upsert(&ctx, &request).await?.unwrap();
//!
//! let ciphertext = guard.read().encrypt(0, b"secret", &CipherParams::default())?;
//! assert!(ciphertext.starts_with("vault:v1:"));
//! ```

pub mod cache;
pub mod codec;
pub mod constants;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod key_type;
pub mod lock_manager;
pub mod policy;
pub mod storage;

pub use cache::PolicyCache;
pub use codec::VersionedToken;
pub use crypto::cipher::CipherParams;
pub use crypto::cipher::PaddingScheme;
pub use crypto::export::ExportType;
pub use crypto::hash::HashAlgorithm;
pub use crypto::kdf::Kdf;
pub use crypto::random_bytes;
pub use crypto::sign::MarshalingAlgorithm;
pub use crypto::sign::SaltLength;
pub use crypto::sign::SignParams;
pub use crypto::sign::SignatureAlgorithm;
pub use crypto::sign::SignatureOutput;
pub use entry::ConvergentVersion;
pub use entry::KeyEntry;
pub use error::ErrorKind;
pub use error::Result;
pub use error::TransitError;
pub use key_type::AesBits;
pub use key_type::Curve;
pub use key_type::KeyKind;
pub use key_type::RsaBits;
pub use lock_manager::LockManager;
pub use lock_manager::PolicyCell;
pub use lock_manager::PolicyGuard;
pub use lock_manager::PolicyRequest;
pub use policy::ArchivedKeys;
pub use policy::BackupInfo;
pub use policy::ConfigOutcome;
pub use policy::ImportMaterial;
pub use policy::KeyData;
pub use policy::Policy;
pub use policy::PolicyConfigUpdate;
pub use policy::RestoreInfo;
pub use storage::InMemoryStorage;
pub use storage::RequestContext;
pub use storage::Storage;
pub use storage::StorageEntry;
