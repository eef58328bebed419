//! Test support for transit engine integration tests.
//!
//! - Backend construction over in-memory storage
//! - Log capture through the test writer
//! - Wrapping raw key material the way an external BYOK client would

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use transit_engine::TransitBackend;
use transit_engine::TransitConfig;
use transit_keys::HashAlgorithm;
use transit_keys::InMemoryStorage;
use transit_keys::KeyKind;
use transit_keys::Policy;
use transit_keys::RequestContext;
use transit_keys::RsaBits;
use transit_keys::codec::encode_b64;
use transit_keys::constants::WRAPPING_KEY_NAME;
use transit_keys::constants::WRAPPING_KEY_PREFIX;

/// "the quick brown fox", base64.
pub const QUICK_BROWN_FOX: &str = "dGhlIHF1aWNrIGJyb3duIGZveA==";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("transit_engine=debug,transit_keys=debug")
        .with_test_writer()
        .try_init();
}

/// Config with a small wrapping key so import tests stay fast.
pub fn test_config() -> TransitConfig {
    TransitConfig::default().with_wrapping_key_type(KeyKind::Rsa(RsaBits::B2048))
}

/// A backend and a handle on its storage.
pub async fn setup_backend() -> anyhow::Result<(Arc<InMemoryStorage>, TransitBackend)> {
    setup_backend_with(test_config()).await
}

pub async fn setup_backend_with(config: TransitConfig) -> anyhow::Result<(Arc<InMemoryStorage>, TransitBackend)> {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let backend = TransitBackend::new(storage.clone(), config).await?;
    Ok((storage, backend))
}

/// Wrap `material` for import into `backend`, creating its wrapping key if
/// needed.
pub async fn wrap_for_import(
    storage: &Arc<InMemoryStorage>,
    backend: &TransitBackend,
    material: &[u8],
) -> anyhow::Result<String> {
    let cancel = CancellationToken::new();
    backend.wrapping_key(&cancel).await?;

    let ctx = RequestContext::new(storage.clone(), cancel);
    let wrapping = Policy::load(&ctx, WRAPPING_KEY_PREFIX, WRAPPING_KEY_NAME)
        .await?
        .context("wrapping key was not persisted")?;
    let blob = wrapping.wrap_key_material(material, HashAlgorithm::Sha2_256)?;
    Ok(encode_b64(&blob))
}
