//! Certificate chains on signing keys.

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::codec::encode_b64;

use crate::backend::TransitBackend;

const PEM_LINE_WIDTH: usize = 64;

/// Parameters of `keys/<name>/set-certificate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCertificateRequest {
    /// PEM bundle, leaf first.
    pub certificate_chain: String,
    /// Version to attach to. Zero means latest.
    #[serde(default)]
    pub version: u32,
}

/// Parameters of `keys/<name>/csr`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrRequest {
    /// PEM template CSR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csr: Option<String>,
    /// Version to sign with. Zero means latest.
    #[serde(default)]
    pub version: u32,
}

/// Render DER certificates as one PEM bundle.
pub(crate) fn encode_pem_chain(chain: &[Vec<u8>]) -> String {
    let mut out = String::new();
    for der in chain {
        out.push_str("-----BEGIN CERTIFICATE-----\n");
        let encoded = encode_b64(der);
        for (i, c) in encoded.chars().enumerate() {
            if i > 0 && i % PEM_LINE_WIDTH == 0 {
                out.push('\n');
            }
            out.push(c);
        }
        out.push_str("\n-----END CERTIFICATE-----\n");
    }
    out
}

impl TransitBackend {
    /// Validate a certificate chain against a key version and attach it.
    pub async fn set_certificate(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: SetCertificateRequest,
    ) -> Result<()> {
        let ctx = self.context(cancel);
        let guard = self.exclusive_policy(&ctx, name).await?;
        let mut draft = guard.snapshot();
        draft.set_certificate_chain(request.version, &request.certificate_chain)?;
        draft.persist(&ctx).await?;
        guard.commit(draft)?;
        info!(name = %name, version = request.version, "attached certificate chain");
        Ok(())
    }

    /// CSR signing is not available; always fails once the key is found.
    pub async fn sign_csr(&self, cancel: &CancellationToken, name: &str, _request: CsrRequest) -> Result<String> {
        let ctx = self.context(cancel);
        let guard = self.shared_policy(&ctx, name).await?;
        let key_type = guard.read().kind;
        Err(TransitError::Unsupported {
            operation: "csr signing".into(),
            key_type,
        })
    }
}
