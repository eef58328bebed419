//! RSA-OAEP + AES-KWP key wrapping, as used by import and BYOK export.
//!
//! A wrapped blob is `RSA-OAEP(ephemeral AES-256 key) || AES-KWP(target)`,
//! where the RSA block is exactly the modulus size.

use aes_kw::KekAes256;
use rand::rngs::OsRng;
use rsa::Oaep;
use rsa::traits::PublicKeyParts;
use zeroize::Zeroizing;

use super::asymmetric;
use super::hash::HashAlgorithm;
use super::hash::with_digest;
use super::random_bytes;
use crate::constants::EPHEMERAL_KEY_SIZE;
use crate::error::Result;
use crate::error::TransitError;
use crate::key_type::KeyKind;
use crate::policy::Policy;

fn kek(ephemeral: &[u8]) -> Result<KekAes256> {
    let bytes: [u8; EPHEMERAL_KEY_SIZE] = ephemeral
        .try_into()
        .map_err(|_| TransitError::invalid("ephemeral key has an invalid length"))?;
    Ok(KekAes256::from(bytes))
}

fn unsupported_hash() -> TransitError {
    TransitError::invalid("hash algorithm none cannot be used for key wrapping")
}

impl Policy {
    fn check_wrapping_type(&self) -> Result<()> {
        if !matches!(self.kind, KeyKind::Rsa(_)) {
            return Err(TransitError::Unsupported {
                operation: "key wrapping".into(),
                key_type: self.kind,
            });
        }
        Ok(())
    }

    /// Wrap `target` for the holder of this RSA policy's latest private key.
    pub fn wrap_key_material(&self, target: &[u8], hash: HashAlgorithm) -> Result<Vec<u8>> {
        self.check_wrapping_type()?;
        let public = asymmetric::rsa_public(self.entry(self.latest_version)?)?;
        let ephemeral = random_bytes(EPHEMERAL_KEY_SIZE);

        let wrapped_target = kek(&ephemeral)?
            .wrap_with_padding_vec(target)
            .map_err(|e| TransitError::Crypto {
                reason: format!("failed to wrap target key: {e}"),
            })?;
        let wrapped_ephemeral = with_digest!(hash, D => public.encrypt(&mut OsRng, Oaep::new::<D>(), &ephemeral),
            none => return Err(unsupported_hash()))
        .map_err(|e| TransitError::Crypto {
            reason: format!("failed to encrypt ephemeral key: {e}"),
        })?;

        let mut out = wrapped_ephemeral;
        out.extend_from_slice(&wrapped_target);
        Ok(out)
    }

    /// Recover the target key from a blob wrapped for this RSA policy.
    pub fn unwrap_key_material(&self, blob: &[u8], hash: HashAlgorithm) -> Result<Zeroizing<Vec<u8>>> {
        self.check_wrapping_type()?;
        let private = asymmetric::rsa_private(self.entry(self.latest_version)?)?;
        let rsa_len = private.size();
        if blob.len() <= rsa_len {
            return Err(TransitError::invalid(format!(
                "wrapped key material is too short, expected more than {rsa_len} bytes"
            )));
        }
        let (rsa_block, kwp_block) = blob.split_at(rsa_len);

        let ephemeral = with_digest!(hash, D => private.decrypt(Oaep::new::<D>(), rsa_block),
            none => return Err(unsupported_hash()))
        .map(Zeroizing::new)
        .map_err(|_| TransitError::invalid("failed to decrypt the ephemeral key"))?;

        kek(&ephemeral)?
            .unwrap_with_padding_vec(kwp_block)
            .map(Zeroizing::new)
            .map_err(|_| TransitError::invalid("failed to unwrap the target key"))
    }
}
