//! Periodic automatic rotation.
//!
//! Keys with a non-zero `auto_rotate_period` get a new version once the
//! latest version is older than the period. A background task checks every
//! key on a fixed interval.
//!
//! # Tiger Style
//!
//! - One key at a time, each under its own exclusive lock
//! - A failing key is logged and skipped, the sweep continues
//! - Uses CancellationToken for graceful shutdown

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use transit_keys::Result;
use transit_keys::TransitError;

use crate::backend::TransitBackend;

/// Outcome of one rotation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoRotateReport {
    /// Keys that got a new version.
    pub rotated: Vec<String>,
    /// Keys whose check or rotation failed, with the error.
    pub failed: Vec<(String, String)>,
}

impl TransitBackend {
    /// Rotate every key whose auto-rotation period has elapsed.
    pub async fn auto_rotate_tick(&self, cancel: &CancellationToken) -> Result<AutoRotateReport> {
        self.auto_rotate_at(cancel, Utc::now()).await
    }

    pub(crate) async fn auto_rotate_at(&self, cancel: &CancellationToken, now: DateTime<Utc>) -> Result<AutoRotateReport> {
        let mut report = AutoRotateReport::default();
        for name in self.list_keys(cancel).await? {
            if cancel.is_cancelled() {
                return Err(TransitError::Cancelled);
            }
            match self.rotate_if_due(cancel, &name, now).await {
                Ok(true) => report.rotated.push(name),
                Ok(false) => {}
                Err(TransitError::Cancelled) => return Err(TransitError::Cancelled),
                Err(e) => {
                    warn!(name = %name, error = %e, "automatic rotation failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn rotate_if_due(&self, cancel: &CancellationToken, name: &str, now: DateTime<Utc>) -> Result<bool> {
        let ctx = self.context(cancel);
        let guard = match self.exclusive_policy(&ctx, name).await {
            Ok(guard) => guard,
            // Deleted between listing and locking.
            Err(TransitError::KeyNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !guard.read().auto_rotate_due(now) {
            return Ok(false);
        }
        let mut draft = guard.snapshot();
        draft.rotate(&ctx).await?;
        let version = draft.latest_version;
        guard.commit(draft)?;
        info!(name = %name, version, "automatically rotated key");
        Ok(true)
    }

    /// Run [`auto_rotate_tick`](Self::auto_rotate_tick) every `period` until
    /// `cancel` fires.
    pub fn spawn_auto_rotation(self: Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "auto-rotation task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("auto-rotation task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.auto_rotate_tick(&cancel).await {
                            Ok(report) if report.rotated.is_empty() && report.failed.is_empty() => {}
                            Ok(report) => debug!(
                                rotated = report.rotated.len(),
                                failed = report.failed.len(),
                                "auto-rotation sweep finished"
                            ),
                            Err(e) => warn!(error = %e, "auto-rotation sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use transit_keys::InMemoryStorage;
    use transit_keys::KeyKind;

    use super::*;
    use crate::config::TransitConfig;
    use crate::keys::CreateKeyRequest;

    async fn backend() -> Arc<TransitBackend> {
        Arc::new(TransitBackend::new(Arc::new(InMemoryStorage::new()), TransitConfig::default()).await.unwrap())
    }

    #[tokio::test]
    async fn test_only_due_keys_rotate() {
        let backend = backend().await;
        let cancel = CancellationToken::new();
        let rotating = CreateKeyRequest {
            auto_rotate_period: 3600,
            ..CreateKeyRequest::new(KeyKind::default())
        };
        backend.create_key(&cancel, "hourly", rotating).await.unwrap();
        backend.create_key(&cancel, "manual", CreateKeyRequest::default()).await.unwrap();

        let report = backend.auto_rotate_tick(&cancel).await.unwrap();
        assert!(report.rotated.is_empty());

        let later = Utc::now() + chrono::Duration::hours(2);
        let report = backend.auto_rotate_at(&cancel, later).await.unwrap();
        assert_eq!(report.rotated, vec!["hourly".to_string()]);
        assert!(report.failed.is_empty());

        let hourly = backend.read_key(&cancel, "hourly").await.unwrap().unwrap();
        assert_eq!(hourly.latest_version, 2);
        let manual = backend.read_key(&cancel, "manual").await.unwrap().unwrap();
        assert_eq!(manual.latest_version, 1);
    }

    #[tokio::test]
    async fn test_cancelled_sweep() {
        let backend = backend().await;
        let cancel = CancellationToken::new();
        backend.create_key(&cancel, "k", CreateKeyRequest::default()).await.unwrap();
        cancel.cancel();
        assert!(backend.auto_rotate_tick(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_spawned_task_stops_on_cancel() {
        let backend = backend().await;
        let cancel = CancellationToken::new();
        let handle = backend.clone().spawn_auto_rotation(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
