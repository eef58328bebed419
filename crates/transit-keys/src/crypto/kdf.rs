//! Per-context key derivation.

use hkdf::Hkdf;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::Result;
use crate::error::TransitError;

/// Derivation mode of a derived policy.
///
/// Policies persisted before HKDF existed carry no mode and read back as
/// counter mode. New policies use HKDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Kdf {
    /// NIST SP 800-108 counter mode with HMAC-SHA256 as the PRF.
    #[default]
    #[serde(rename = "hmac-sha256-counter")]
    HmacSha256Counter,
    /// HKDF-SHA256 (RFC 5869), no salt, context as info.
    #[serde(rename = "hkdf_sha256")]
    HkdfSha256,
}

impl Kdf {
    /// Derive `len` bytes from `root` bound to `context`.
    pub fn derive(self, root: &[u8], context: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Kdf::HmacSha256Counter => counter_mode(root, context, len),
            Kdf::HkdfSha256 => {
                let mut out = Zeroizing::new(vec![0u8; len]);
                Hkdf::<Sha256>::new(None, root).expand(context, &mut out).map_err(|e| TransitError::Crypto {
                    reason: format!("hkdf expansion failed: {e}"),
                })?;
                Ok(out)
            }
        }
    }
}

/// Counter-mode KDF: `PRF(root, BE32(i) || context || BE32(bits))` for each block.
fn counter_mode(root: &[u8], context: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    const PRF_LEN: usize = 32;

    let bits = u32::try_from(len * 8).map_err(|_| TransitError::invalid("derived key too long"))?;
    let rounds = len.div_ceil(PRF_LEN);

    let mut input = Vec::with_capacity(4 + context.len() + 4);
    input.extend_from_slice(&[0u8; 4]);
    input.extend_from_slice(context);
    input.extend_from_slice(&bits.to_be_bytes());

    let mut out = Zeroizing::new(Vec::with_capacity(rounds * PRF_LEN));
    for i in 0..rounds as u32 {
        input[..4].copy_from_slice(&i.to_be_bytes());
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(root).map_err(|e| TransitError::Crypto {
            reason: format!("invalid prf key: {e}"),
        })?;
        mac.update(&input);
        out.extend_from_slice(&mac.finalize().into_bytes());
    }
    out.truncate(len);
    Ok(out)
}
