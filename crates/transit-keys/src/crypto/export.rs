//! Key material as handed out by export, BYOK export and key reads.

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroizing;

use super::asymmetric;
use crate::codec::encode_b64;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::KeyKind;
use crate::policy::Policy;

/// Which material an export returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportType {
    /// Raw AEAD key, or the RSA private key.
    EncryptionKey,
    /// Private key of a signing type.
    SigningKey,
    /// HMAC key of the version.
    HmacKey,
    /// Public key of an asymmetric type. Does not require `exportable`.
    PublicKey,
}

impl ExportType {
    /// Path segment naming the export type.
    pub fn as_str(self) -> &'static str {
        match self {
            ExportType::EncryptionKey => "encryption-key",
            ExportType::SigningKey => "signing-key",
            ExportType::HmacKey => "hmac-key",
            ExportType::PublicKey => "public-key",
        }
    }
}

impl fmt::Display for ExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportType {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "encryption-key" => Ok(ExportType::EncryptionKey),
            "signing-key" => Ok(ExportType::SigningKey),
            "hmac-key" => Ok(ExportType::HmacKey),
            "public-key" => Ok(ExportType::PublicKey),
            other => Err(TransitError::invalid(format!("invalid export type: {other}"))),
        }
    }
}

impl Policy {
    /// Public key of a version in the form shown by key reads.
    pub fn public_key(&self, version: u32) -> Result<String> {
        asymmetric::public_key_display(self.kind, self.entry(version)?)
    }

    /// Check that `export_type` applies to this policy.
    pub fn check_exportable(&self, export_type: ExportType) -> Result<()> {
        let applies = match export_type {
            ExportType::EncryptionKey => self.kind.supports_encryption(),
            ExportType::SigningKey => self.kind.supports_signing(),
            ExportType::HmacKey => self.kind.supports_hmac(),
            ExportType::PublicKey => self.kind.is_asymmetric(),
        };
        if !applies {
            return Err(TransitError::Unsupported {
                operation: format!("{export_type} export"),
                key_type: self.kind,
            });
        }
        if export_type != ExportType::PublicKey && !self.exportable {
            return Err(TransitError::NotExportable { name: self.name.clone() });
        }
        Ok(())
    }

    /// Exported material of one version.
    pub fn export_version(&self, export_type: ExportType, version: u32) -> Result<Zeroizing<String>> {
        self.check_exportable(export_type)?;
        let entry = self.entry(version)?;
        match export_type {
            ExportType::PublicKey => Ok(Zeroizing::new(self.public_key(version)?)),
            ExportType::HmacKey => {
                let key = if self.kind == KeyKind::Hmac { &entry.key } else { &entry.hmac_key };
                Ok(Zeroizing::new(encode_b64(key)))
            }
            ExportType::EncryptionKey | ExportType::SigningKey => {
                if self.kind.is_asymmetric() {
                    asymmetric::private_key_export(self.kind, entry)
                } else {
                    Ok(Zeroizing::new(encode_b64(&entry.key)))
                }
            }
        }
    }

    /// Material of one version in the form wrapped by BYOK export: raw bytes
    /// for symmetric types, PKCS#8 DER for asymmetric types.
    pub fn key_material_for_wrapping(&self, version: u32) -> Result<Zeroizing<Vec<u8>>> {
        let entry = self.entry(version)?;
        if self.kind.is_asymmetric() {
            asymmetric::private_key_pkcs8_der(self.kind, entry)
        } else {
            Ok(Zeroizing::new(entry.key.clone()))
        }
    }

    /// Attached certificate chain of a version, leaf first, as DER.
    pub fn certificate_chain(&self, version: u32) -> Result<&[Vec<u8>]> {
        Ok(&self.entry(version)?.certificate_chain)
    }
}
