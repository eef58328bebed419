//! Random bytes and hashing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::Serialize;
use transit_keys::HashAlgorithm;
use transit_keys::Result;
use transit_keys::TransitError;
use transit_keys::random_bytes;

use crate::backend::TransitBackend;
use crate::constants::DEFAULT_RANDOM_BYTES;
use crate::constants::MAX_RANDOM_BYTES;

/// Text encoding of binary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Standard base64.
    Base64,
    /// Lowercase hex.
    Hex,
}

impl OutputFormat {
    fn encode(self, data: &[u8]) -> String {
        match self {
            OutputFormat::Base64 => STANDARD.encode(data),
            OutputFormat::Hex => hex::encode(data),
        }
    }
}

fn default_random_bytes() -> usize {
    DEFAULT_RANDOM_BYTES
}

/// Parameters of `random[/<n>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomRequest {
    /// Number of bytes.
    #[serde(default = "default_random_bytes")]
    pub bytes: usize,
    /// Output encoding. Defaults to base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
}

impl Default for RandomRequest {
    fn default() -> Self {
        Self {
            bytes: default_random_bytes(),
            format: None,
        }
    }
}

/// Random output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomResponse {
    /// Encoded bytes.
    pub random_bytes: String,
}

/// Parameters of `hash[/<alg>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRequest {
    /// Base64 input.
    pub input: String,
    /// Digest. Defaults to `sha2-256`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<HashAlgorithm>,
    /// Output encoding. Defaults to hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
}

/// Hash output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashResponse {
    /// Encoded digest.
    pub sum: String,
}

impl TransitBackend {
    /// Bytes from the operating system's random source.
    pub fn random(&self, request: RandomRequest) -> Result<RandomResponse> {
        if request.bytes == 0 || request.bytes > MAX_RANDOM_BYTES {
            return Err(TransitError::invalid(format!(
                "bytes must be between 1 and {MAX_RANDOM_BYTES}, got {}",
                request.bytes
            )));
        }
        let bytes = random_bytes(request.bytes);
        Ok(RandomResponse {
            random_bytes: request.format.unwrap_or(OutputFormat::Base64).encode(&bytes),
        })
    }

    /// Digest of a base64 input.
    pub fn hash(&self, request: HashRequest) -> Result<HashResponse> {
        let algorithm = request.algorithm.unwrap_or_default();
        if algorithm == HashAlgorithm::None {
            return Err(TransitError::invalid("unsupported hash algorithm none"));
        }
        let input = STANDARD
            .decode(request.input.as_bytes())
            .map_err(|e| TransitError::invalid(format!("unable to decode input as base64: {e}")))?;
        Ok(HashResponse {
            sum: request.format.unwrap_or(OutputFormat::Hex).encode(&algorithm.digest(&input)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use transit_keys::InMemoryStorage;

    use super::*;
    use crate::config::TransitConfig;

    async fn backend() -> TransitBackend {
        TransitBackend::new(Arc::new(InMemoryStorage::new()), TransitConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_hash_sha256_known_answer() {
        let backend = backend().await;
        let response = backend
            .hash(HashRequest {
                input: "dGhlIHF1aWNrIGJyb3duIGZveA==".into(),
                algorithm: Some(HashAlgorithm::Sha2_256),
                format: None,
            })
            .unwrap();
        assert_eq!(response.sum, "9ecb36561341d18eb65484e833efea61edc74b84cf5e6ae1b81c63533e25fc8f");
    }

    #[tokio::test]
    async fn test_hash_base64_format_and_none_rejected() {
        let backend = backend().await;
        let response = backend
            .hash(HashRequest {
                input: "".into(),
                algorithm: Some(HashAlgorithm::Sha3_256),
                format: Some(OutputFormat::Base64),
            })
            .unwrap();
        assert_eq!(STANDARD.decode(response.sum).unwrap().len(), 32);

        let none = backend.hash(HashRequest {
            input: "".into(),
            algorithm: Some(HashAlgorithm::None),
            format: None,
        });
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn test_random_hex() {
        let backend = backend().await;
        let request = RandomRequest {
            bytes: 24,
            format: Some(OutputFormat::Hex),
        };
        let first = backend.random(request).unwrap();
        let second = backend.random(request).unwrap();
        assert_eq!(first.random_bytes.len(), 48);
        assert!(first.random_bytes.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_random_bounds() {
        let backend = backend().await;
        assert!(backend.random(RandomRequest { bytes: 0, format: None }).is_err());
        assert!(backend
            .random(RandomRequest {
                bytes: MAX_RANDOM_BYTES + 1,
                format: None,
            })
            .is_err());
        let default = backend.random(RandomRequest::default()).unwrap();
        assert_eq!(STANDARD.decode(default.random_bytes).unwrap().len(), DEFAULT_RANDOM_BYTES);
    }
}
