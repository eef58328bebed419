//! Attaching X.509 certificate chains to signing key versions.

use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;

use super::asymmetric;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::KeyKind;
use crate::policy::Policy;

/// Split a PEM bundle into the DER of each `CERTIFICATE` block, in order.
pub fn parse_pem_chain(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut chain = Vec::new();
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| TransitError::invalid(format!("failed to parse PEM: {e}")))?;
        if block.label != "CERTIFICATE" {
            return Err(TransitError::invalid(format!(
                "unexpected PEM block {} in certificate chain",
                block.label
            )));
        }
        chain.push(block.contents);
    }
    if chain.is_empty() {
        return Err(TransitError::invalid("certificate chain is empty"));
    }
    Ok(chain)
}

fn is_ca(cert: &X509Certificate<'_>) -> Result<Option<bool>> {
    let constraints = cert
        .basic_constraints()
        .map_err(|e| TransitError::invalid(format!("invalid basic constraints: {e}")))?;
    Ok(constraints.map(|ext| ext.value.ca))
}

impl Policy {
    /// Validate a PEM chain against a version's key and attach it.
    ///
    /// The first certificate must be the leaf for the version's public key;
    /// later ones must not be marked as end-entity certificates. The chain is
    /// not verified up to a root. Callers persist afterwards.
    pub fn set_certificate_chain(&mut self, version: u32, pem_chain: &str) -> Result<()> {
        if !self.kind.supports_signing() {
            return Err(TransitError::Unsupported {
                operation: "set certificate".into(),
                key_type: self.kind,
            });
        }
        if self.derived && self.kind == KeyKind::Ed25519 {
            return Err(TransitError::invalid("certificates cannot be attached to derived ed25519 keys"));
        }

        let version = if version == 0 { self.latest_version } else { version };
        self.check_read_version(version)?;
        let entry = self.entry(version)?;
        if entry.is_private_key_missing(self.kind) {
            return Err(TransitError::invalid(format!(
                "key version {version} has no private key, a certificate cannot be attached"
            )));
        }
        let key_spki = asymmetric::public_key_spki_der(self.kind, entry)?;

        let chain = parse_pem_chain(pem_chain)?;
        for (index, der) in chain.iter().enumerate() {
            let (_, cert) = X509Certificate::from_der(der)
                .map_err(|e| TransitError::invalid(format!("failed to parse certificate {index}: {e}")))?;
            let ca = is_ca(&cert)?;
            if index == 0 {
                if ca == Some(true) {
                    return Err(TransitError::invalid("the first certificate in the chain must be a leaf"));
                }
                if cert.public_key().raw != key_spki.as_slice() {
                    return Err(TransitError::invalid(format!(
                        "the leaf certificate's public key does not match key version {version}"
                    )));
                }
            } else if ca == Some(false) {
                return Err(TransitError::invalid(format!(
                    "certificate {index} in the chain is a leaf, only the first may be"
                )));
            }
        }

        let entry = self.keys.get_mut(&version).ok_or_else(|| TransitError::Internal {
            reason: format!("key version {version} disappeared"),
        })?;
        entry.certificate_chain = chain;
        Ok(())
    }
}
