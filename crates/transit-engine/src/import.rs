//! Import wrapping key and key import.
//!
//! Private material travels wrapped: an ephemeral AES-256 key wraps the
//! target with KWP, and the wrapping key's RSA-OAEP encrypts the ephemeral
//! key. The wrapping key is a singleton policy under `import/`, generated
//! the first time it is read.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use transit_keys::AesBits;
use transit_keys::HashAlgorithm;
use transit_keys::ImportMaterial;
use transit_keys::KeyKind;
use transit_keys::PolicyGuard;
use transit_keys::PolicyRequest;
use transit_keys::RequestContext;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::codec::decode_b64_lenient;
use transit_keys::constants::WRAPPING_KEY_NAME;
use transit_keys::constants::WRAPPING_KEY_PREFIX;

use crate::backend::TransitBackend;
use crate::backend::validate_key_name;
use crate::constants::DEFAULT_WRAPPING_HASH;

/// Public half of the import wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappingKeyResponse {
    /// PEM SubjectPublicKeyInfo.
    pub public_key: String,
}

fn default_hash_function() -> String {
    DEFAULT_WRAPPING_HASH.to_string()
}

fn default_key_type() -> KeyKind {
    KeyKind::Aes(AesBits::B256)
}

/// Parameters of `keys/<name>/import`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Wrapped private material, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    /// PEM public key, for public-only imports of asymmetric types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// OAEP hash of the wrapped ephemeral key: `SHA224` to `SHA512`.
    #[serde(default = "default_hash_function")]
    pub hash_function: String,
    /// Key type of the new key.
    #[serde(rename = "type", default = "default_key_type")]
    pub key_type: KeyKind,
    /// Require a derivation context on every operation.
    #[serde(default)]
    pub derived: bool,
    /// Allow export of private material.
    #[serde(default)]
    pub exportable: bool,
    /// Allow plaintext backups.
    #[serde(default)]
    pub allow_plaintext_backup: bool,
    /// Automatic rotation period in seconds.
    #[serde(default)]
    pub auto_rotate_period: u64,
    /// Allow the imported key to be rotated.
    #[serde(default)]
    pub allow_rotation: bool,
}

impl ImportRequest {
    /// Import wrapped private material as a key of `key_type`.
    pub fn wrapped(key_type: KeyKind, ciphertext: impl Into<String>) -> Self {
        Self {
            ciphertext: Some(ciphertext.into()),
            ..Self::blank(key_type)
        }
    }

    /// Import a PEM public key as a key of `key_type`.
    pub fn public(key_type: KeyKind, public_key: impl Into<String>) -> Self {
        Self {
            public_key: Some(public_key.into()),
            ..Self::blank(key_type)
        }
    }

    fn blank(key_type: KeyKind) -> Self {
        Self {
            ciphertext: None,
            public_key: None,
            hash_function: default_hash_function(),
            key_type,
            derived: false,
            exportable: false,
            allow_plaintext_backup: false,
            auto_rotate_period: 0,
            allow_rotation: false,
        }
    }
}

/// Parameters of `keys/<name>/import_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportVersionRequest {
    /// Wrapped private material, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    /// PEM public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// OAEP hash of the wrapped ephemeral key.
    #[serde(default = "default_hash_function")]
    pub hash_function: String,
    /// Existing public-only version to complete with its private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl ImportVersionRequest {
    /// Add a version from wrapped private material.
    pub fn wrapped(ciphertext: impl Into<String>) -> Self {
        Self {
            ciphertext: Some(ciphertext.into()),
            public_key: None,
            hash_function: default_hash_function(),
            version: None,
        }
    }

    /// Add a public-only version.
    pub fn public(public_key: impl Into<String>) -> Self {
        Self {
            ciphertext: None,
            public_key: Some(public_key.into()),
            hash_function: default_hash_function(),
            version: None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

impl TransitBackend {
    /// The wrapping key under the shared lock, generating it when `create`.
    async fn wrapping_key_guard(&self, ctx: &RequestContext, create: bool) -> Result<Option<PolicyGuard>> {
        let request = PolicyRequest {
            storage_prefix: WRAPPING_KEY_PREFIX.to_string(),
            upsert: create,
            ..PolicyRequest::new(WRAPPING_KEY_NAME, self.config().wrapping_key_type)
        };
        let Some((guard, created)) = self.locks().get_policy_upsert(ctx, &request).await? else {
            return Ok(None);
        };
        if created {
            info!(key_type = %self.config().wrapping_key_type, "generated import wrapping key");
        }
        Ok(Some(guard))
    }

    /// Public key used to wrap material for import, generated on first use.
    pub async fn wrapping_key(&self, cancel: &CancellationToken) -> Result<WrappingKeyResponse> {
        let ctx = self.context(cancel);
        let guard = self.wrapping_key_guard(&ctx, true).await?.ok_or_else(|| TransitError::Internal {
            reason: "wrapping key upsert returned no policy".into(),
        })?;
        let policy = guard.read();
        Ok(WrappingKeyResponse {
            public_key: policy.public_key(policy.latest_version)?,
        })
    }

    /// Resolve the material of an import request.
    ///
    /// Wrapped material is unwrapped under the wrapping key's shared lock,
    /// which is released before the target key is locked.
    async fn import_material(
        &self,
        ctx: &RequestContext,
        ciphertext: Option<&str>,
        public_key: Option<&str>,
        hash_function: &str,
    ) -> Result<ImportMaterial> {
        match (non_empty(ciphertext), non_empty(public_key)) {
            (Some(_), Some(_)) => Err(TransitError::invalid("only one of ciphertext or public_key may be provided")),
            (None, None) => Err(TransitError::invalid("one of ciphertext or public_key must be provided")),
            (None, Some(pem)) => Ok(ImportMaterial::Public(pem.to_string())),
            (Some(ciphertext), None) => {
                let hash = HashAlgorithm::from_wrapping_name(hash_function)?;
                let blob = decode_b64_lenient("ciphertext", ciphertext)?;
                let guard = self.wrapping_key_guard(ctx, false).await?.ok_or(TransitError::WrappingKeyMissing)?;
                let material = guard.read().unwrap_key_material(&blob, hash)?;
                Ok(ImportMaterial::Private(material))
            }
        }
    }

    /// Create a key from imported material. Fails if the key exists.
    pub async fn import_key(&self, cancel: &CancellationToken, name: &str, request: ImportRequest) -> Result<()> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        let policy_request = PolicyRequest {
            derived: request.derived,
            exportable: request.exportable,
            allow_plaintext_backup: request.allow_plaintext_backup,
            auto_rotate_period: Duration::from_secs(request.auto_rotate_period),
            allow_imported_key_rotation: request.allow_rotation,
            ..PolicyRequest::new(name, request.key_type)
        };
        policy_request.validate()?;

        let material = self
            .import_material(&ctx, request.ciphertext.as_deref(), request.public_key.as_deref(), &request.hash_function)
            .await?;
        match self.locks().import_policy(&ctx, &policy_request, &material).await {
            Err(TransitError::KeyExists { .. }) => Err(TransitError::invalid(
                "the import path cannot be used with an existing key; use import_version to add a version to an existing imported key",
            )),
            other => other,
        }
    }

    /// Add a version to an imported key, or complete a public-only version.
    pub async fn import_key_version(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: ImportVersionRequest,
    ) -> Result<()> {
        validate_key_name(name)?;
        let ctx = self.context(cancel);
        let material = self
            .import_material(&ctx, request.ciphertext.as_deref(), request.public_key.as_deref(), &request.hash_function)
            .await?;

        let guard = self.exclusive_policy(&ctx, name).await?;
        let mut draft = guard.snapshot();
        if !draft.imported {
            return Err(TransitError::invalid(
                "the import_version endpoint can only be used with an imported key",
            ));
        }
        if draft.convergent_encryption {
            return Err(TransitError::invalid(
                "import_version cannot be used on keys with convergent encryption enabled",
            ));
        }

        match (request.version, &material) {
            (Some(version), ImportMaterial::Private(der)) => draft.import_private_for_version(version, der)?,
            (Some(_), ImportMaterial::Public(_)) => {
                return Err(TransitError::invalid(
                    "a version may only be given when importing private key material",
                ));
            }
            (None, material) => draft.import_in_memory(material)?,
        }
        draft.persist(&ctx).await?;
        let latest_version = draft.latest_version;
        guard.commit(draft)?;
        info!(name = %name, latest_version, "imported key version");
        Ok(())
    }
}
