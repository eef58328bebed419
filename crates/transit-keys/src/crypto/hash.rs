//! Hash algorithm selection.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;

use crate::error::TransitError;

/// Digest used for signing, HMAC, key wrapping and the hash utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum HashAlgorithm {
    /// SHA-224.
    Sha2_224,
    /// SHA-256.
    #[default]
    Sha2_256,
    /// SHA-384.
    Sha2_384,
    /// SHA-512.
    Sha2_512,
    /// SHA3-224.
    Sha3_224,
    /// SHA3-256.
    Sha3_256,
    /// SHA3-384.
    Sha3_384,
    /// SHA3-512.
    Sha3_512,
    /// Input is already a digest. Only valid for prehashed PKCS#1 v1.5 signing.
    None,
}

/// Run `$body` with `$d` bound to the digest type selected by `$alg`.
///
/// `HashAlgorithm::None` evaluates `$none` instead.
macro_rules! with_digest {
    ($alg:expr, $d:ident => $body:expr, none => $none:expr) => {
        match $alg {
            $crate::crypto::hash::HashAlgorithm::Sha2_224 => {
                type $d = sha2::Sha224;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha2_256 => {
                type $d = sha2::Sha256;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha2_384 => {
                type $d = sha2::Sha384;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha2_512 => {
                type $d = sha2::Sha512;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha3_224 => {
                type $d = sha3::Sha3_224;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha3_256 => {
                type $d = sha3::Sha3_256;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha3_384 => {
                type $d = sha3::Sha3_384;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::Sha3_512 => {
                type $d = sha3::Sha3_512;
                $body
            }
            $crate::crypto::hash::HashAlgorithm::None => $none,
        }
    };
}

pub(crate) use with_digest;

impl HashAlgorithm {
    /// API name of the algorithm.
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha2_224 => "sha2-224",
            HashAlgorithm::Sha2_256 => "sha2-256",
            HashAlgorithm::Sha2_384 => "sha2-384",
            HashAlgorithm::Sha2_512 => "sha2-512",
            HashAlgorithm::Sha3_224 => "sha3-224",
            HashAlgorithm::Sha3_256 => "sha3-256",
            HashAlgorithm::Sha3_384 => "sha3-384",
            HashAlgorithm::Sha3_512 => "sha3-512",
            HashAlgorithm::None => "none",
        }
    }

    /// Digest length in bytes; zero for `none`.
    pub fn output_len(self) -> usize {
        with_digest!(self, D => <D as Digest>::output_size(), none => 0)
    }

    /// Hash `data`. `none` returns the input unchanged.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        with_digest!(self, D => D::digest(data).to_vec(), none => data.to_vec())
    }

    /// Parse the `SHA256`-style names used to pick the OAEP hash of key wrapping.
    pub fn from_wrapping_name(name: &str) -> Result<Self, TransitError> {
        match name {
            "SHA224" => Ok(HashAlgorithm::Sha2_224),
            "SHA256" => Ok(HashAlgorithm::Sha2_256),
            "SHA384" => Ok(HashAlgorithm::Sha2_384),
            "SHA512" => Ok(HashAlgorithm::Sha2_512),
            other => Err(TransitError::invalid(format!("unsupported hash function {other}"))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha2-224" => Ok(HashAlgorithm::Sha2_224),
            "sha2-256" => Ok(HashAlgorithm::Sha2_256),
            "sha2-384" => Ok(HashAlgorithm::Sha2_384),
            "sha2-512" => Ok(HashAlgorithm::Sha2_512),
            "sha3-224" => Ok(HashAlgorithm::Sha3_224),
            "sha3-256" => Ok(HashAlgorithm::Sha3_256),
            "sha3-384" => Ok(HashAlgorithm::Sha3_384),
            "sha3-512" => Ok(HashAlgorithm::Sha3_512),
            "none" => Ok(HashAlgorithm::None),
            other => Err(TransitError::invalid(format!("unsupported hash algorithm {other}"))),
        }
    }
}

impl From<HashAlgorithm> for String {
    fn from(alg: HashAlgorithm) -> Self {
        alg.as_str().to_string()
    }
}

impl TryFrom<String> for HashAlgorithm {
    type Error = TransitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha2_256_known_answer() {
        let digest = HashAlgorithm::Sha2_256.digest(b"the quick brown fox");
        assert_eq!(
            hex_string(&digest),
            "9ecb36561341d18eb65484e833efea61edc74b84cf5e6ae1b81c63533e25fc8f"
        );
    }

    #[test]
    fn test_output_lengths() {
        assert_eq!(HashAlgorithm::Sha2_224.output_len(), 28);
        assert_eq!(HashAlgorithm::Sha2_512.output_len(), 64);
        assert_eq!(HashAlgorithm::Sha3_384.output_len(), 48);
        assert_eq!(HashAlgorithm::None.output_len(), 0);
        assert_eq!(HashAlgorithm::None.digest(b"abc"), b"abc");
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("sha3-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha3_256);
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::from_wrapping_name("SHA384").unwrap(), HashAlgorithm::Sha2_384);
        assert!(HashAlgorithm::from_wrapping_name("sha256").is_err());
    }

    fn hex_string(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
