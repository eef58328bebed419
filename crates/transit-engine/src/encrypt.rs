//! Encrypt, decrypt, rewrap and data key generation.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transit_keys::AesBits;
use transit_keys::CipherParams;
use transit_keys::KeyKind;
use transit_keys::PaddingScheme;
use transit_keys::Policy;
use transit_keys::PolicyGuard;
use transit_keys::PolicyRequest;
use transit_keys::RequestContext;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::codec::encode_b64;
use transit_keys::codec::split_token;
use transit_keys::random_bytes;
use zeroize::Zeroize;
use zeroize::ZeroizeOnDrop;

use crate::backend::TransitBackend;
use crate::backend::decode_optional;
use crate::backend::validate_key_name;
use crate::batch::BatchInput;
use crate::batch::BatchItem;
use crate::batch::BatchResponse;
use crate::constants::DATA_KEY_BITS;
use crate::constants::DEFAULT_DATA_KEY_BITS;

/// One plaintext to encrypt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptItem {
    /// Base64 plaintext.
    #[serde(default)]
    pub plaintext: String,
    /// Base64 derivation context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Base64 96-bit nonce, convergent version 1 keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 additional authenticated data, AEAD types only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_data: Option<String>,
    /// Version to encrypt with. Zero means latest.
    #[serde(default)]
    pub key_version: u32,
    /// RSA padding, `oaep` or `pkcs1v15`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding_scheme: Option<String>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl EncryptItem {
    /// Encrypt `plaintext` (base64) with the latest version.
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self {
            plaintext: plaintext.into(),
            ..Self::default()
        }
    }

    /// Set the base64 context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl BatchItem for EncryptItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// Parameters of `encrypt/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptRequest {
    /// Items to encrypt.
    #[serde(flatten)]
    pub input: BatchInput<EncryptItem>,
    /// Key type used if the key is created on the fly.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyKind>,
    /// Create the key with convergent encryption if it is created on the fly.
    #[serde(default)]
    pub convergent_encryption: bool,
}

impl EncryptRequest {
    /// Encrypt one item.
    pub fn single(item: EncryptItem) -> Self {
        Self {
            input: BatchInput::single(item),
            ..Self::default()
        }
    }

    /// Encrypt a batch.
    pub fn batch(items: Vec<EncryptItem>) -> Self {
        Self {
            input: BatchInput::batch(items),
            ..Self::default()
        }
    }
}

/// A ciphertext and the version that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptResult {
    /// `vault:v<version>:<base64>` token.
    pub ciphertext: String,
    /// Version used.
    pub key_version: u32,
}

/// One ciphertext to decrypt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecryptItem {
    /// Ciphertext token.
    #[serde(default)]
    pub ciphertext: String,
    /// Base64 derivation context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Base64 nonce, convergent version 1 keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 additional authenticated data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_data: Option<String>,
    /// RSA padding, `oaep` or `pkcs1v15`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding_scheme: Option<String>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl DecryptItem {
    /// Decrypt `ciphertext`.
    pub fn new(ciphertext: impl Into<String>) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            ..Self::default()
        }
    }

    /// Set the base64 context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl BatchItem for DecryptItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// A recovered plaintext. Cleared on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DecryptResult {
    /// Base64 plaintext.
    pub plaintext: String,
}

impl fmt::Debug for DecryptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptResult").field("plaintext", &"<redacted>").finish()
    }
}

/// One ciphertext to move to another version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewrapItem {
    /// Ciphertext token.
    #[serde(default)]
    pub ciphertext: String,
    /// Base64 derivation context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Base64 nonce, convergent version 1 keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Target version. Zero means latest.
    #[serde(default)]
    pub key_version: u32,
    /// RSA padding used for both directions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding_scheme: Option<String>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl BatchItem for RewrapItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// Whether a data key response includes the plaintext key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKeyKind {
    /// Plaintext and ciphertext.
    Plaintext,
    /// Ciphertext only.
    Wrapped,
}

impl FromStr for DataKeyKind {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plaintext" => Ok(DataKeyKind::Plaintext),
            "wrapped" => Ok(DataKeyKind::Wrapped),
            other => Err(TransitError::invalid(format!("invalid data key type {other}"))),
        }
    }
}

/// One data key to generate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataKeyItem {
    /// Key size in bits: 128, 256 or 512. Defaults to 256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<usize>,
    /// Base64 derivation context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Base64 nonce, convergent version 1 keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 additional authenticated data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_data: Option<String>,
    /// Version to encrypt with. Zero means latest.
    #[serde(default)]
    pub key_version: u32,
    /// RSA padding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding_scheme: Option<String>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl BatchItem for DataKeyItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// A generated data key. Cleared on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DataKeyResult {
    /// Base64 key, only for [`DataKeyKind::Plaintext`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plaintext: Option<String>,
    /// The key encrypted under the named key.
    pub ciphertext: String,
    /// Version used.
    pub key_version: u32,
}

impl fmt::Debug for DataKeyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKeyResult")
            .field("plaintext", &self.plaintext.as_ref().map(|_| "<redacted>"))
            .field("ciphertext", &self.ciphertext)
            .field("key_version", &self.key_version)
            .finish()
    }
}

fn parse_padding(padding: Option<&str>) -> Result<Option<PaddingScheme>> {
    padding.filter(|p| !p.is_empty()).map(|p| p.parse::<PaddingScheme>()).transpose()
}

fn require_encryption(policy: &Policy) -> Result<()> {
    if policy.kind.supports_encryption() {
        Ok(())
    } else {
        Err(TransitError::Unsupported {
            operation: "encryption".into(),
            key_type: policy.kind,
        })
    }
}

/// Decoded per-item cipher inputs.
struct Decoded {
    context: Vec<u8>,
    nonce: Vec<u8>,
    associated_data: Vec<u8>,
    padding: Option<PaddingScheme>,
}

impl Decoded {
    fn new(context: Option<&str>, nonce: Option<&str>, associated_data: Option<&str>, padding: Option<&str>) -> Result<Self> {
        Ok(Self {
            context: decode_optional("context", context)?,
            nonce: decode_optional("nonce", nonce)?,
            associated_data: decode_optional("associated_data", associated_data)?,
            padding: parse_padding(padding)?,
        })
    }

    fn params(&self) -> CipherParams<'_> {
        CipherParams {
            context: &self.context,
            nonce: &self.nonce,
            associated_data: &self.associated_data,
            padding: self.padding,
        }
    }
}

fn encrypt_with(policy: &Policy, version: u32, plaintext: &[u8], params: &CipherParams<'_>) -> Result<EncryptResult> {
    let ciphertext = policy.encrypt(version, plaintext, params)?;
    let (key_version, _) = split_token(&ciphertext)?;
    Ok(EncryptResult {
        ciphertext,
        key_version,
    })
}

impl TransitBackend {
    /// Resolve the key for an encrypt, creating it when allowed.
    async fn encryption_policy(&self, ctx: &RequestContext, name: &str, request: &EncryptRequest) -> Result<PolicyGuard> {
        let keys_config = self.load_keys_config(ctx).await?;
        let policy_request = PolicyRequest {
            derived: request.input.context_set(),
            convergent: request.convergent_encryption,
            upsert: !keys_config.disable_upsert,
            ..PolicyRequest::new(name, request.key_type.unwrap_or(KeyKind::Aes(AesBits::B256)))
        };
        match self.locks().get_policy_upsert(ctx, &policy_request).await? {
            Some((guard, _)) => Ok(guard),
            None => Err(TransitError::KeyNotFound { name: name.to_string() }),
        }
    }

    /// Encrypt one plaintext or a batch.
    ///
    /// A missing key is created with the request's `type` unless upsert is
    /// disabled in `config/keys`.
    pub async fn encrypt(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: EncryptRequest,
    ) -> Result<BatchResponse<EncryptResult>> {
        validate_key_name(name)?;
        request.input.validate(self.config().max_batch_size)?;
        request.input.check_context_consistency()?;

        let ctx = self.context(cancel);
        let guard = self.encryption_policy(&ctx, name, &request).await?;
        let policy = guard.read();
        require_encryption(&policy)?;

        let response = request.input.run(|item| {
            let plaintext = self.decode_plaintext(&item.plaintext)?;
            let decoded = Decoded::new(
                item.context.as_deref(),
                item.nonce.as_deref(),
                item.associated_data.as_deref(),
                item.padding_scheme.as_deref(),
            )?;
            encrypt_with(&policy, item.key_version, &plaintext, &decoded.params())
        })?;
        debug!(name = %name, items = request.input.items().len(), "encrypted");
        Ok(response)
    }

    /// Decrypt one ciphertext or a batch.
    pub async fn decrypt(
        &self,
        cancel: &CancellationToken,
        name: &str,
        input: BatchInput<DecryptItem>,
    ) -> Result<BatchResponse<DecryptResult>> {
        input.validate(self.config().max_batch_size)?;
        input.check_context_consistency()?;

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        require_encryption(&policy)?;

        let response = input.run(|item| {
            let decoded = Decoded::new(
                item.context.as_deref(),
                item.nonce.as_deref(),
                item.associated_data.as_deref(),
                item.padding_scheme.as_deref(),
            )?;
            let plaintext = policy.decrypt(&item.ciphertext, &decoded.params())?;
            Ok(DecryptResult {
                plaintext: encode_b64(&plaintext),
            })
        })?;
        debug!(name = %name, items = input.items().len(), "decrypted");
        Ok(response)
    }

    /// Decrypt and re-encrypt under the requested (default latest) version.
    pub async fn rewrap(
        &self,
        cancel: &CancellationToken,
        name: &str,
        input: BatchInput<RewrapItem>,
    ) -> Result<BatchResponse<EncryptResult>> {
        input.validate(self.config().max_batch_size)?;
        input.check_context_consistency()?;

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        require_encryption(&policy)?;

        let response = input.run(|item| {
            let decoded = Decoded::new(
                item.context.as_deref(),
                item.nonce.as_deref(),
                None,
                item.padding_scheme.as_deref(),
            )?;
            let plaintext = policy.decrypt(&item.ciphertext, &decoded.params())?;
            encrypt_with(&policy, item.key_version, &plaintext, &decoded.params())
        })?;
        debug!(name = %name, items = input.items().len(), "rewrapped");
        Ok(response)
    }

    /// Generate random data keys and return them encrypted under `name`.
    pub async fn generate_data_key(
        &self,
        cancel: &CancellationToken,
        name: &str,
        kind: DataKeyKind,
        input: BatchInput<DataKeyItem>,
    ) -> Result<BatchResponse<DataKeyResult>> {
        input.validate(self.config().max_batch_size)?;
        input.check_context_consistency()?;

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        require_encryption(&policy)?;

        let response = input.run(|item| {
            let bits = item.bits.unwrap_or(DEFAULT_DATA_KEY_BITS);
            if !DATA_KEY_BITS.contains(&bits) {
                return Err(TransitError::invalid(format!(
                    "invalid bit length {bits}, must be 128, 256 or 512"
                )));
            }
            let decoded = Decoded::new(
                item.context.as_deref(),
                item.nonce.as_deref(),
                item.associated_data.as_deref(),
                item.padding_scheme.as_deref(),
            )?;
            let data_key = random_bytes(bits / 8);
            let encrypted = encrypt_with(&policy, item.key_version, &data_key, &decoded.params())?;
            Ok(DataKeyResult {
                plaintext: (kind == DataKeyKind::Plaintext).then(|| encode_b64(&data_key)),
                ciphertext: encrypted.ciphertext,
                key_version: encrypted.key_version,
            })
        })?;
        debug!(name = %name, items = input.items().len(), "generated data keys");
        Ok(response)
    }
}
