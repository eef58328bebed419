//! Cryptographic primitives behind the policy operations.
//!
//! Each submodule adds an `impl Policy` block for one family of operations;
//! the helpers here are shared between them.

pub(crate) mod asymmetric;
pub mod certificate;
pub mod cipher;
pub mod export;
pub mod hash;
pub mod kdf;
pub mod mac;
pub mod sign;
pub mod wrap;

use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use self::hash::HashAlgorithm;
use self::hash::with_digest;
use crate::error::Result;
use crate::error::TransitError;

/// `n` bytes from the operating system's CSPRNG.
pub fn random_bytes(n: usize) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(vec![0u8; n]);
    OsRng.fill_bytes(&mut buf[..]);
    buf
}

/// HMAC of `data` keyed by `key` with the digest `alg`.
pub(crate) fn hmac_digest(alg: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    with_digest!(alg, D => {
        let mut mac = <Hmac<D> as Mac>::new_from_slice(key).map_err(|e| TransitError::Crypto {
            reason: format!("invalid hmac key: {e}"),
        })?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }, none => Err(TransitError::invalid("hash algorithm none is not valid for hmac")))
}
