//! Sign, verify, HMAC and CMAC.

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use transit_keys::HashAlgorithm;
use transit_keys::MarshalingAlgorithm;
use transit_keys::Policy;
use transit_keys::Result;
use transit_keys::SaltLength;
use transit_keys::SignParams;
use transit_keys::SignatureAlgorithm;
use transit_keys::TransitError;
use transit_keys::codec::decode_b64;
use transit_keys::codec::split_token;

use crate::backend::TransitBackend;
use crate::backend::decode_optional;
use crate::batch::BatchInput;
use crate::batch::BatchItem;
use crate::batch::BatchResponse;
use crate::response::Response;

/// Signature options shared by every item of a sign or verify request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureOptions {
    /// Digest applied to the input; also the HMAC digest on verify.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<HashAlgorithm>,
    /// `pss` (default) or `pkcs1v15`, RSA only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<String>,
    /// `asn1` (default) or `jws`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marshaling_algorithm: Option<String>,
    /// `auto` (default), `hash`, or a byte count. RSA-PSS only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt_length: Option<String>,
    /// The input is already a digest.
    #[serde(default)]
    pub prehashed: bool,
}

/// Parsed form of [`SignatureOptions`] without the per-item context.
#[derive(Clone, Copy)]
struct ParsedOptions {
    hash_algorithm: Option<HashAlgorithm>,
    signature_algorithm: SignatureAlgorithm,
    marshaling_algorithm: MarshalingAlgorithm,
    salt_length: SaltLength,
    prehashed: bool,
}

impl ParsedOptions {
    fn params<'a>(&self, context: &'a [u8]) -> SignParams<'a> {
        SignParams {
            context,
            hash_algorithm: self.hash_algorithm,
            prehashed: self.prehashed,
            signature_algorithm: self.signature_algorithm,
            marshaling_algorithm: self.marshaling_algorithm,
            salt_length: self.salt_length,
        }
    }
}

fn parse_or_default<T: std::str::FromStr<Err = TransitError> + Default>(value: Option<&str>) -> Result<T> {
    match value {
        Some(value) if !value.is_empty() => value.parse(),
        _ => Ok(T::default()),
    }
}

impl SignatureOptions {
    fn parse(&self) -> Result<ParsedOptions> {
        Ok(ParsedOptions {
            hash_algorithm: self.hash_algorithm,
            signature_algorithm: parse_or_default(self.signature_algorithm.as_deref())?,
            marshaling_algorithm: parse_or_default(self.marshaling_algorithm.as_deref())?,
            salt_length: parse_or_default(self.salt_length.as_deref())?,
            prehashed: self.prehashed,
        })
    }
}

/// One input to sign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignItem {
    /// Base64 input.
    #[serde(default)]
    pub input: String,
    /// Base64 derivation context, derived Ed25519 keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl SignItem {
    /// Sign `input` (base64).
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }
}

impl BatchItem for SignItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// Parameters of `sign/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Inputs to sign.
    #[serde(flatten)]
    pub input: BatchInput<SignItem>,
    /// Signature options.
    #[serde(flatten)]
    pub options: SignatureOptions,
    /// Version to sign with. Zero means latest.
    #[serde(default)]
    pub key_version: u32,
}

impl SignRequest {
    /// Sign one input with default options.
    pub fn single(item: SignItem) -> Self {
        Self {
            input: BatchInput::single(item),
            ..Self::default()
        }
    }
}

/// A produced signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResult {
    /// `vault:v<version>:<signature>` token.
    pub signature: String,
    /// Version used.
    pub key_version: u32,
    /// Public key of the context-derived key, derived Ed25519 keys only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// One item to verify. Exactly one of `signature`, `hmac` and `cmac` is set,
/// and every item of a batch sets the same one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyItem {
    /// Base64 input.
    #[serde(default)]
    pub input: String,
    /// Signature token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// HMAC token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
    /// CMAC token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmac: Option<String>,
    /// CMAC length; see [`CmacItem::mac_length`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_length: Option<usize>,
    /// Base64 derivation context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl BatchItem for VerifyItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// Parameters of `verify/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Items to verify.
    #[serde(flatten)]
    pub input: BatchInput<VerifyItem>,
    /// Signature options. `hash_algorithm` also selects the HMAC digest.
    #[serde(flatten)]
    pub options: SignatureOptions,
    /// CMAC length taken from the path; overrides item values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_mac_length: Option<usize>,
}

/// Outcome of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    /// Whether the signature or MAC matched.
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyKind {
    Signature,
    Hmac,
    Cmac,
}

fn verify_kind(items: &[VerifyItem]) -> Result<VerifyKind> {
    let signature = items.iter().any(|i| i.signature.is_some());
    let hmac = items.iter().any(|i| i.hmac.is_some());
    let cmac = items.iter().any(|i| i.cmac.is_some());
    match (signature, hmac, cmac) {
        (true, false, false) => Ok(VerifyKind::Signature),
        (false, true, false) => Ok(VerifyKind::Hmac),
        (false, false, true) => Ok(VerifyKind::Cmac),
        (false, false, false) => Err(TransitError::invalid("signature, hmac or cmac must be provided")),
        _ => Err(TransitError::invalid("only one of signature, hmac or cmac may be provided per request")),
    }
}

fn missing(field: &str) -> TransitError {
    TransitError::invalid(format!("missing {field} to verify"))
}

/// One input to HMAC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HmacItem {
    /// Base64 input.
    #[serde(default)]
    pub input: String,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl BatchItem for HmacItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}

/// Parameters of `hmac/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HmacRequest {
    /// Inputs.
    #[serde(flatten)]
    pub input: BatchInput<HmacItem>,
    /// Digest. Defaults to `sha2-256`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<HashAlgorithm>,
    /// Version to use. Zero means latest.
    #[serde(default)]
    pub key_version: u32,
}

/// A produced HMAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HmacResult {
    /// `vault:v<version>:<base64>` token.
    pub hmac: String,
    /// Version used.
    pub key_version: u32,
}

/// One input to CMAC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmacItem {
    /// Base64 input.
    #[serde(default)]
    pub input: String,
    /// Tag length in bytes, 0 to 16. Zero or absent means 16.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_length: Option<usize>,
    /// Echoed on the batch result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl BatchItem for CmacItem {
    fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }
}

/// Parameters of `cmac/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CmacRequest {
    /// Inputs.
    #[serde(flatten)]
    pub input: BatchInput<CmacItem>,
    /// Version to use. Zero means latest.
    #[serde(default)]
    pub key_version: u32,
    /// Tag length taken from the path; overrides item values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_mac_length: Option<usize>,
}

/// A produced CMAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmacResult {
    /// `vault:v<version>:<base64>` token.
    pub cmac: String,
    /// Version used.
    pub key_version: u32,
}

const MAC_LENGTH_OVERRIDE_WARNING: &str = "url_mac_length overrides the mac_length given in the request body";

/// Resolve the CMAC length of an item, reporting whether the path value
/// replaced a body value.
fn resolve_mac_length(url_mac_length: Option<usize>, item_mac_length: Option<usize>) -> (usize, bool) {
    match (url_mac_length, item_mac_length) {
        (Some(url), Some(_)) => (url, true),
        (Some(url), None) => (url, false),
        (None, item) => (item.unwrap_or(0), false),
    }
}

fn require(policy: &Policy, supported: bool, operation: &str) -> Result<()> {
    if supported {
        Ok(())
    } else {
        Err(TransitError::Unsupported {
            operation: operation.into(),
            key_type: policy.kind,
        })
    }
}

impl TransitBackend {
    /// Sign one input or a batch.
    pub async fn sign(&self, cancel: &CancellationToken, name: &str, request: SignRequest) -> Result<BatchResponse<SignResult>> {
        request.input.validate(self.config().max_batch_size)?;
        request.input.check_context_consistency()?;
        let options = request.options.parse()?;

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        require(&policy, policy.kind.supports_signing(), "signing")?;

        let response = request.input.run(|item| {
            let input = decode_b64("input", &item.input)?;
            let context = decode_optional("context", item.context.as_deref())?;
            let output = policy.sign(request.key_version, &input, &options.params(&context))?;
            Ok(SignResult {
                signature: output.signature,
                key_version: output.key_version,
                public_key: output.public_key,
            })
        })?;
        debug!(name = %name, items = request.input.items().len(), "signed");
        Ok(response)
    }

    /// Verify signatures, HMACs or CMACs.
    pub async fn verify(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: VerifyRequest,
    ) -> Result<Response<BatchResponse<VerifyResult>>> {
        request.input.validate(self.config().max_batch_size)?;
        request.input.check_context_consistency()?;
        let kind = verify_kind(request.input.items())?;
        let options = request.options.parse()?;

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        match kind {
            VerifyKind::Signature => require(&policy, policy.kind.supports_signing(), "verification")?,
            VerifyKind::Hmac => require(&policy, policy.kind.supports_hmac(), "hmac verification")?,
            VerifyKind::Cmac => require(&policy, policy.kind.supports_cmac(), "cmac verification")?,
        }

        let mut overridden = false;
        let response = request.input.run(|item| {
            let input = decode_b64("input", &item.input)?;
            let valid = match kind {
                VerifyKind::Signature => {
                    let signature = item.signature.as_deref().ok_or_else(|| missing("signature"))?;
                    let context = decode_optional("context", item.context.as_deref())?;
                    policy.verify(signature, &input, &options.params(&context))?
                }
                VerifyKind::Hmac => {
                    let hmac = item.hmac.as_deref().ok_or_else(|| missing("hmac"))?;
                    policy.verify_hmac(hmac, &input, options.hash_algorithm.unwrap_or_default())?
                }
                VerifyKind::Cmac => {
                    let cmac = item.cmac.as_deref().ok_or_else(|| missing("cmac"))?;
                    let (mac_length, replaced) = resolve_mac_length(request.url_mac_length, item.mac_length);
                    overridden |= replaced;
                    policy.verify_cmac(cmac, &input, mac_length)?
                }
            };
            Ok(VerifyResult { valid })
        })?;

        let mut response = Response::new(response);
        if overridden {
            warn!(name = %name, "url_mac_length overrode request mac_length");
            response.warn(MAC_LENGTH_OVERRIDE_WARNING);
        }
        Ok(response)
    }

    /// HMAC one input or a batch.
    pub async fn hmac(&self, cancel: &CancellationToken, name: &str, request: HmacRequest) -> Result<BatchResponse<HmacResult>> {
        request.input.validate(self.config().max_batch_size)?;
        let algorithm = request.algorithm.unwrap_or_default();

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        require(&policy, policy.kind.supports_hmac(), "hmac")?;

        let response = request.input.run(|item| {
            let input = decode_b64("input", &item.input)?;
            let hmac = policy.hmac(request.key_version, &input, algorithm)?;
            let (key_version, _) = split_token(&hmac)?;
            Ok(HmacResult { hmac, key_version })
        })?;
        debug!(name = %name, items = request.input.items().len(), "computed hmac");
        Ok(response)
    }

    /// CMAC one input or a batch.
    pub async fn cmac(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: CmacRequest,
    ) -> Result<Response<BatchResponse<CmacResult>>> {
        request.input.validate(self.config().max_batch_size)?;

        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let policy = guard.read();
        require(&policy, policy.kind.supports_cmac(), "cmac")?;

        let mut overridden = false;
        let response = request.input.run(|item| {
            let input = decode_b64("input", &item.input)?;
            let (mac_length, replaced) = resolve_mac_length(request.url_mac_length, item.mac_length);
            overridden |= replaced;
            let cmac = policy.cmac(request.key_version, &input, mac_length)?;
            let (key_version, _) = split_token(&cmac)?;
            Ok(CmacResult { cmac, key_version })
        })?;

        let mut response = Response::new(response);
        if overridden {
            warn!(name = %name, "url_mac_length overrode request mac_length");
            response.warn(MAC_LENGTH_OVERRIDE_WARNING);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use transit_keys::AesBits;
    use transit_keys::Curve;
    use transit_keys::InMemoryStorage;
    use transit_keys::KeyKind;

    use super::*;
    use crate::config::TransitConfig;
    use crate::keys::CreateKeyRequest;

    const INPUT: &str = "dGhlIHF1aWNrIGJyb3duIGZveA==";

    async fn backend_with(name: &str, kind: KeyKind) -> TransitBackend {
        let backend = TransitBackend::new(Arc::new(InMemoryStorage::new()), TransitConfig::default()).await.unwrap();
        backend.create_key(&CancellationToken::new(), name, CreateKeyRequest::new(kind)).await.unwrap();
        backend
    }

    fn verify_signature(signature: &str, input: &str) -> VerifyRequest {
        VerifyRequest {
            input: BatchInput::single(VerifyItem {
                input: input.to_string(),
                signature: Some(signature.to_string()),
                ..VerifyItem::default()
            }),
            ..VerifyRequest::default()
        }
    }

    #[tokio::test]
    async fn test_sign_and_verify_ecdsa_jws() {
        let backend = backend_with("ec", KeyKind::Ecdsa(Curve::P256)).await;
        let cancel = CancellationToken::new();
        let options = SignatureOptions {
            marshaling_algorithm: Some("jws".into()),
            ..SignatureOptions::default()
        };
        let signed = backend
            .sign(&cancel, "ec", SignRequest {
                options: options.clone(),
                ..SignRequest::single(SignItem::new(INPUT))
            })
            .await
            .unwrap()
            .into_single()
            .unwrap();

        let mut request = verify_signature(&signed.signature, INPUT);
        request.options = options;
        let verified = backend.verify(&cancel, "ec", request.clone()).await.unwrap();
        assert_eq!(verified.data.single(), Some(&VerifyResult { valid: true }));

        request.input.item.input = "b3RoZXI=".into();
        let verified = backend.verify(&cancel, "ec", request).await.unwrap();
        assert_eq!(verified.data.single(), Some(&VerifyResult { valid: false }));
    }

    #[tokio::test]
    async fn test_verify_rejects_mixed_kinds() {
        let backend = backend_with("k", KeyKind::Aes(AesBits::B256)).await;
        let request = VerifyRequest {
            input: BatchInput::batch(vec![
                VerifyItem {
                    input: INPUT.into(),
                    hmac: Some("vault:v1:AAAA".into()),
                    ..VerifyItem::default()
                },
                VerifyItem {
                    input: INPUT.into(),
                    signature: Some("vault:v1:AAAA".into()),
                    ..VerifyItem::default()
                },
            ]),
            ..VerifyRequest::default()
        };
        assert!(backend.verify(&CancellationToken::new(), "k", request).await.is_err());
    }

    #[tokio::test]
    async fn test_hmac_roundtrip_and_min_decryption() {
        let backend = backend_with("k", KeyKind::Aes(AesBits::B256)).await;
        let cancel = CancellationToken::new();
        let hmac = backend
            .hmac(&cancel, "k", HmacRequest {
                input: BatchInput::single(HmacItem {
                    input: INPUT.into(),
                    reference: None,
                }),
                ..HmacRequest::default()
            })
            .await
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(hmac.key_version, 1);

        let request = VerifyRequest {
            input: BatchInput::single(VerifyItem {
                input: INPUT.into(),
                hmac: Some(hmac.hmac.clone()),
                ..VerifyItem::default()
            }),
            ..VerifyRequest::default()
        };
        let verified = backend.verify(&cancel, "k", request.clone()).await.unwrap();
        assert_eq!(verified.data.single(), Some(&VerifyResult { valid: true }));

        backend.rotate_key(&cancel, "k").await.unwrap();
        backend
            .configure_key(&cancel, "k", crate::keys::KeyConfigRequest {
                min_decryption_version: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let result = backend.verify(&cancel, "k", request).await;
        assert!(matches!(result, Err(TransitError::VersionTooOld)));
    }

    #[tokio::test]
    async fn test_cmac_url_length_override_warns() {
        let backend = backend_with("c", KeyKind::AesCmac(AesBits::B128)).await;
        let cancel = CancellationToken::new();
        let response = backend
            .cmac(&cancel, "c", CmacRequest {
                input: BatchInput::single(CmacItem {
                    input: INPUT.into(),
                    mac_length: Some(16),
                    reference: None,
                }),
                url_mac_length: Some(8),
                ..CmacRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.warnings.len(), 1);
        let cmac = response.data.into_single().unwrap();
        let (_, encoded) = split_token(&cmac.cmac).unwrap();
        assert_eq!(decode_b64("cmac", encoded).unwrap().len(), 8);

        let verified = backend
            .verify(&cancel, "c", VerifyRequest {
                input: BatchInput::single(VerifyItem {
                    input: INPUT.into(),
                    cmac: Some(cmac.cmac),
                    mac_length: Some(8),
                    ..VerifyItem::default()
                }),
                ..VerifyRequest::default()
            })
            .await
            .unwrap();
        assert!(verified.warnings.is_empty());
        assert_eq!(verified.data.single(), Some(&VerifyResult { valid: true }));
    }

    #[tokio::test]
    async fn test_cmac_on_aes_gcm_rejected() {
        let backend = backend_with("k", KeyKind::Aes(AesBits::B128)).await;
        let result = backend
            .cmac(&CancellationToken::new(), "k", CmacRequest {
                input: BatchInput::single(CmacItem {
                    input: INPUT.into(),
                    ..CmacItem::default()
                }),
                ..CmacRequest::default()
            })
            .await;
        assert!(matches!(result, Err(TransitError::Unsupported { .. })));
    }

    #[test]
    fn test_resolve_mac_length() {
        assert_eq!(resolve_mac_length(None, None), (0, false));
        assert_eq!(resolve_mac_length(None, Some(4)), (4, false));
        assert_eq!(resolve_mac_length(Some(8), None), (8, false));
        assert_eq!(resolve_mac_length(Some(8), Some(4)), (8, true));
    }
}
