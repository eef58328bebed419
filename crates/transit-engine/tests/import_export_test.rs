//! Tests for moving key material in and out of the backend: BYOK import,
//! BYOK export, plain export, backup and restore, and certificate chains.

mod support;

use rcgen::CertificateParams;
use rcgen::KeyPair;
use tokio_util::sync::CancellationToken;
use transit_engine::BatchInput;
use transit_engine::CreateKeyRequest;
use transit_engine::CsrRequest;
use transit_engine::DecryptItem;
use transit_engine::EncryptItem;
use transit_engine::EncryptRequest;
use transit_engine::ImportRequest;
use transit_engine::ImportVersionRequest;
use transit_engine::KeyConfigRequest;
use transit_engine::RestoreRequest;
use transit_engine::SetCertificateRequest;
use transit_engine::SignItem;
use transit_engine::SignRequest;
use transit_engine::TransitBackend;
use transit_engine::VerifyItem;
use transit_engine::VerifyRequest;
use transit_engine::VersionSelector;
use transit_keys::AesBits;
use transit_keys::Curve;
use transit_keys::ExportType;
use transit_keys::KeyKind;
use transit_keys::RsaBits;
use transit_keys::TransitError;
use transit_keys::random_bytes;

use support::QUICK_BROWN_FOX;
use support::setup_backend;
use support::wrap_for_import;

async fn encrypt_one(backend: &TransitBackend, name: &str) -> anyhow::Result<String> {
    let response = backend
        .encrypt(&CancellationToken::new(), name, EncryptRequest::single(EncryptItem::new(QUICK_BROWN_FOX)))
        .await?;
    Ok(response.into_single().expect("inline result").ciphertext)
}

async fn decrypt_one(backend: &TransitBackend, name: &str, ciphertext: &str) -> anyhow::Result<String> {
    let response = backend
        .decrypt(&CancellationToken::new(), name, BatchInput::single(DecryptItem::new(ciphertext)))
        .await?;
    Ok(response.single().expect("inline result").plaintext.clone())
}

fn exportable(kind: KeyKind) -> CreateKeyRequest {
    CreateKeyRequest {
        exportable: true,
        allow_plaintext_backup: true,
        ..CreateKeyRequest::new(kind)
    }
}

#[tokio::test]
async fn test_import_raw_aes_key_and_add_version() -> anyhow::Result<()> {
    let (storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();

    let material = random_bytes(32);
    let wrapped = wrap_for_import(&storage, &backend, &material).await?;
    backend.import_key(&cancel, "imported", ImportRequest::wrapped(KeyKind::Aes(AesBits::B256), wrapped)).await?;

    let info = backend.read_key(&cancel, "imported").await?.expect("key imported");
    assert!(info.imported_key);
    assert_eq!(info.latest_version, 1);
    let ciphertext = encrypt_one(&backend, "imported").await?;

    // Rotation is refused unless the import allowed it.
    assert!(backend.rotate_key(&cancel, "imported").await.is_err());

    let next = wrap_for_import(&storage, &backend, &random_bytes(32)).await?;
    backend.import_key_version(&cancel, "imported", ImportVersionRequest::wrapped(next)).await?;
    let info = backend.read_key(&cancel, "imported").await?.expect("key imported");
    assert_eq!(info.latest_version, 2);
    assert!(encrypt_one(&backend, "imported").await?.starts_with("vault:v2:"));
    assert_eq!(decrypt_one(&backend, "imported", &ciphertext).await?, QUICK_BROWN_FOX);
    Ok(())
}

#[tokio::test]
async fn test_import_onto_existing_key_rejected() -> anyhow::Result<()> {
    let (storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();
    backend.create_key(&cancel, "taken", CreateKeyRequest::default()).await?;

    let wrapped = wrap_for_import(&storage, &backend, &random_bytes(32)).await?;
    let err = backend
        .import_key(&cancel, "taken", ImportRequest::wrapped(KeyKind::Aes(AesBits::B256), wrapped.clone()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("existing key"));

    // Only imported keys take new imported versions.
    assert!(backend.import_key_version(&cancel, "taken", ImportVersionRequest::wrapped(wrapped)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_import_without_wrapping_key_fails() -> anyhow::Result<()> {
    let (_storage, backend) = setup_backend().await?;
    let request = ImportRequest::wrapped(KeyKind::Aes(AesBits::B256), "AAAA");
    let err = backend.import_key(&CancellationToken::new(), "k", request).await.unwrap_err();
    assert!(matches!(err, TransitError::WrappingKeyMissing));
    Ok(())
}

#[tokio::test]
async fn test_byok_round_trip_between_backends() -> anyhow::Result<()> {
    let (_source_storage, source) = setup_backend().await?;
    let (_dest_storage, destination) = setup_backend().await?;
    let cancel = CancellationToken::new();

    // The destination's wrapping key becomes a public-only key on the source.
    let wrapping = destination.wrapping_key(&cancel).await?.public_key;
    source
        .import_key(&cancel, "remote-wrapping", ImportRequest::public(KeyKind::Rsa(RsaBits::B2048), wrapping))
        .await?;

    source.create_key(&cancel, "payments", exportable(KeyKind::Aes(AesBits::B256))).await?;
    let ciphertext = encrypt_one(&source, "payments").await?;

    let exported = source
        .byok_export(&cancel, "remote-wrapping", "payments", VersionSelector::Latest, None)
        .await?;
    assert_eq!(exported.keys.len(), 1);
    let blob = exported.keys.get(&1).expect("version 1 exported").clone();

    destination
        .import_key(&cancel, "payments", ImportRequest::wrapped(KeyKind::Aes(AesBits::B256), blob))
        .await?;
    assert_eq!(decrypt_one(&destination, "payments", &ciphertext).await?, QUICK_BROWN_FOX);
    Ok(())
}

#[tokio::test]
async fn test_byok_export_requires_exportable_source() -> anyhow::Result<()> {
    let (_storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();
    backend.create_key(&cancel, "dest", CreateKeyRequest::new(KeyKind::Rsa(RsaBits::B2048))).await?;
    backend.create_key(&cancel, "locked", CreateKeyRequest::default()).await?;

    let err = backend
        .byok_export(&cancel, "dest", "locked", VersionSelector::All, Some("SHA256"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransitError::NotExportable { .. }));

    backend.create_key(&cancel, "aes-dest", CreateKeyRequest::default()).await?;
    assert!(backend.byok_export(&cancel, "aes-dest", "locked", VersionSelector::All, None).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_export_types_and_version_selection() -> anyhow::Result<()> {
    let (_storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();
    backend.create_key(&cancel, "signer", exportable(KeyKind::Ed25519)).await?;
    backend.rotate_key(&cancel, "signer").await?;

    let all = backend.export_key(&cancel, ExportType::SigningKey, "signer", VersionSelector::All).await?;
    assert_eq!(all.keys.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    let one = backend.export_key(&cancel, ExportType::SigningKey, "signer", VersionSelector::Version(2)).await?;
    assert_eq!(one.keys.len(), 1);
    assert!(backend
        .export_key(&cancel, ExportType::SigningKey, "signer", VersionSelector::Version(3))
        .await
        .is_err());
    assert!(backend
        .export_key(&cancel, ExportType::EncryptionKey, "signer", VersionSelector::All)
        .await
        .is_err());

    // Public keys export without the exportable flag.
    backend.create_key(&cancel, "ec", CreateKeyRequest::new(KeyKind::Ecdsa(Curve::P384))).await?;
    let public = backend.export_key(&cancel, ExportType::PublicKey, "ec", VersionSelector::Latest).await?;
    assert!(public.keys[&1].contains("PUBLIC KEY"));
    assert!(backend.export_key(&cancel, ExportType::SigningKey, "ec", VersionSelector::Latest).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_backup_and_restore() -> anyhow::Result<()> {
    let (_storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();
    backend.create_key(&cancel, "vaulted", exportable(KeyKind::Aes(AesBits::B256))).await?;
    let ciphertext = encrypt_one(&backend, "vaulted").await?;

    let backup = backend.backup_key(&cancel, "vaulted").await?.backup;
    let info = backend.read_key(&cancel, "vaulted").await?.expect("key exists");
    assert!(info.backup_info.is_some());

    let restore = RestoreRequest {
        backup: backup.clone(),
        name: None,
        force: false,
    };
    assert!(backend.restore_key(&cancel, restore).await.is_err());

    let renamed = RestoreRequest {
        backup: backup.clone(),
        name: Some("vaulted-copy".into()),
        force: false,
    };
    backend.restore_key(&cancel, renamed).await?;
    assert_eq!(decrypt_one(&backend, "vaulted-copy", &ciphertext).await?, QUICK_BROWN_FOX);

    let allow_delete = KeyConfigRequest {
        deletion_allowed: Some(true),
        ..KeyConfigRequest::default()
    };
    backend.configure_key(&cancel, "vaulted", allow_delete).await?;
    backend.delete_key(&cancel, "vaulted").await?;
    backend
        .restore_key(&cancel, RestoreRequest {
            backup,
            name: None,
            force: false,
        })
        .await?;
    assert_eq!(decrypt_one(&backend, "vaulted", &ciphertext).await?, QUICK_BROWN_FOX);
    Ok(())
}

#[tokio::test]
async fn test_backup_requires_plaintext_backup_flag() -> anyhow::Result<()> {
    let (_storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();
    backend.create_key(&cancel, "k", CreateKeyRequest::default()).await?;
    assert!(backend.backup_key(&cancel, "k").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_imported_ecdsa_key_takes_certificate() -> anyhow::Result<()> {
    let (storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();

    let key_pair = KeyPair::generate()?;
    let wrapped = wrap_for_import(&storage, &backend, &key_pair.serialize_der()).await?;
    backend.import_key(&cancel, "ec", ImportRequest::wrapped(KeyKind::Ecdsa(Curve::P256), wrapped)).await?;

    let cert = CertificateParams::new(vec!["transit.example".to_string()])?.self_signed(&key_pair)?;
    backend
        .set_certificate(&cancel, "ec", SetCertificateRequest {
            certificate_chain: cert.pem(),
            version: 0,
        })
        .await?;
    let info = backend.read_key(&cancel, "ec").await?.expect("key imported");
    let chain = info.keys[&1].certificate_chain.clone().expect("chain attached");
    assert!(chain.starts_with("-----BEGIN CERTIFICATE-----"));

    // A certificate for another key is refused.
    let other = CertificateParams::new(vec!["other.example".to_string()])?.self_signed(&KeyPair::generate()?)?;
    let mismatched = SetCertificateRequest {
        certificate_chain: other.pem(),
        version: 1,
    };
    assert!(backend.set_certificate(&cancel, "ec", mismatched).await.is_err());

    // The imported key still signs.
    let signed = backend
        .sign(&cancel, "ec", SignRequest::single(SignItem::new(QUICK_BROWN_FOX)))
        .await?
        .into_single()
        .expect("inline result");
    let verify = VerifyRequest {
        input: BatchInput::single(VerifyItem {
            input: QUICK_BROWN_FOX.into(),
            signature: Some(signed.signature),
            ..VerifyItem::default()
        }),
        ..VerifyRequest::default()
    };
    assert!(backend.verify(&cancel, "ec", verify).await?.data.single().expect("inline result").valid);
    Ok(())
}

#[tokio::test]
async fn test_csr_signing_unsupported() -> anyhow::Result<()> {
    let (_storage, backend) = setup_backend().await?;
    let cancel = CancellationToken::new();
    backend.create_key(&cancel, "ec", CreateKeyRequest::new(KeyKind::Ecdsa(Curve::P256))).await?;

    let err = backend.sign_csr(&cancel, "ec", CsrRequest::default()).await.unwrap_err();
    assert!(matches!(err, TransitError::Unsupported { .. }));
    let missing = backend.sign_csr(&cancel, "absent", CsrRequest::default()).await.unwrap_err();
    assert!(matches!(missing, TransitError::KeyNotFound { .. }));
    Ok(())
}
