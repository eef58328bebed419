//! Request-level operations of the transit cryptography service.
//!
//! [`TransitBackend`] owns the storage handle, the lock manager and the
//! static configuration. Every operation is an async method on it that takes
//! a [`CancellationToken`](tokio_util::sync::CancellationToken) for the request.
//!
//! ## Operation groups
//!
//! - `keys` - create, read, list, delete, rotate, configure and trim
//! - `encrypt` - encrypt, decrypt, rewrap and data keys, single or batched
//! - `sign` - sign, verify, HMAC and CMAC
//! - `import` - wrapping key and BYOK import
//! - `export` - export, BYOK export, backup and restore
//! - `certificate` - certificate chains for asymmetric keys
//! - `utility` - random bytes and hashing
//! - `rotation` - scheduled auto-rotation
//! - `config` - static config plus the persisted cache and upsert settings
//!
//! ## Example
//!
//! ```ignore
//! use transit_engine::{EncryptItem, EncryptRequest, TransitBackend, TransitConfig};
//! use transit_keys::InMemoryStorage;
//!
//! let backend = TransitBackend::new(Arc::new(InMemoryStorage::new()), TransitConfig::default()).await?;
//! let cancel = CancellationToken::new();
//!
//! let response = backend.encrypt(&cancel, "orders", EncryptRequest::single(EncryptItem::new("aGVsbG8="))).await?;
//! let ciphertext = &response.single().unwrap().ciphertext;
//! assert!(ciphertext.starts_with("vault:v1:"));
//! ```

pub mod backend;
pub mod batch;
pub mod certificate;
pub mod config;
pub mod constants;
pub mod encrypt;
pub mod export;
pub mod import;
pub mod keys;
pub mod response;
pub mod rotation;
pub mod sign;
pub mod utility;

pub use backend::TransitBackend;
pub use backend::validate_key_name;
pub use batch::BatchInput;
pub use batch::BatchItem;
pub use batch::BatchResponse;
pub use batch::BatchResultItem;
pub use certificate::CsrRequest;
pub use certificate::SetCertificateRequest;
pub use config::CacheConfig;
pub use config::KeysConfig;
pub use config::TransitConfig;
pub use encrypt::DataKeyItem;
pub use encrypt::DataKeyKind;
pub use encrypt::DataKeyResult;
pub use encrypt::DecryptItem;
pub use encrypt::DecryptResult;
pub use encrypt::EncryptItem;
pub use encrypt::EncryptRequest;
pub use encrypt::EncryptResult;
pub use encrypt::RewrapItem;
pub use export::BackupResponse;
pub use export::ExportResponse;
pub use export::RestoreRequest;
pub use export::VersionSelector;
pub use import::ImportRequest;
pub use import::ImportVersionRequest;
pub use import::WrappingKeyResponse;
pub use keys::CreateKeyRequest;
pub use keys::KeyConfigRequest;
pub use keys::KeyInfo;
pub use keys::KeyVersionInfo;
pub use response::Response;
pub use rotation::AutoRotateReport;
pub use sign::CmacItem;
pub use sign::CmacRequest;
pub use sign::CmacResult;
pub use sign::HmacItem;
pub use sign::HmacRequest;
pub use sign::HmacResult;
pub use sign::SignItem;
pub use sign::SignRequest;
pub use sign::SignResult;
pub use sign::SignatureOptions;
pub use sign::VerifyItem;
pub use sign::VerifyRequest;
pub use sign::VerifyResult;
pub use utility::HashRequest;
pub use utility::HashResponse;
pub use utility::OutputFormat;
pub use utility::RandomRequest;
pub use utility::RandomResponse;
