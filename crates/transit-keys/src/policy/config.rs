//! Policy settings updates and archive trimming.

use std::time::Duration;

use super::Policy;
use crate::constants::MIN_AUTO_ROTATE_PERIOD;
use crate::error::Result;
use crate::error::TransitError;

/// Requested changes to a policy's settings. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfigUpdate {
    /// New minimum decryption version. Zero is coerced to 1.
    pub min_decryption_version: Option<u32>,
    /// New minimum encryption version. Zero means latest only.
    pub min_encryption_version: Option<u32>,
    /// Allow or forbid deletion.
    pub deletion_allowed: Option<bool>,
    /// Enable export. Cannot be turned off again.
    pub exportable: Option<bool>,
    /// Enable plaintext backup. Cannot be turned off again.
    pub allow_plaintext_backup: Option<bool>,
    /// Automatic rotation period. Zero disables.
    pub auto_rotate_period: Option<Duration>,
}

/// Result of applying a [`PolicyConfigUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOutcome {
    /// Whether anything changed and the policy must be persisted.
    pub changed: bool,
    /// Non-fatal notes for the caller.
    pub warnings: Vec<String>,
}

impl Policy {
    /// Validate and apply a settings update in memory.
    pub fn apply_config(&mut self, update: &PolicyConfigUpdate) -> Result<ConfigOutcome> {
        let mut outcome = ConfigOutcome::default();

        if let Some(mut min_decryption) = update.min_decryption_version {
            if min_decryption == 0 {
                min_decryption = 1;
                outcome
                    .warnings
                    .push("key version numbering starts at 1; forcing minimum decryption version to 1".into());
            }
            if min_decryption != self.min_decryption_version {
                if min_decryption > self.latest_version {
                    return Err(TransitError::invalid(format!(
                        "cannot set min decryption version of {min_decryption}, latest key version is {}",
                        self.latest_version
                    )));
                }
                if min_decryption < self.min_available_version {
                    return Err(TransitError::invalid(format!(
                        "cannot set min decryption version of {min_decryption}, minimum available version is {}",
                        self.min_available_version
                    )));
                }
                self.min_decryption_version = min_decryption;
                outcome.changed = true;
            }
        }

        if let Some(min_encryption) = update.min_encryption_version {
            if min_encryption != self.min_encryption_version {
                if min_encryption > self.latest_version {
                    return Err(TransitError::invalid(format!(
                        "cannot set min encryption version of {min_encryption}, latest key version is {}",
                        self.latest_version
                    )));
                }
                self.min_encryption_version = min_encryption;
                outcome.changed = true;
            }
        }

        if self.min_encryption_version > 0 && self.min_encryption_version < self.min_decryption_version {
            return Err(TransitError::invalid(format!(
                "cannot set min encryption/decryption values; min encryption version of {} must be greater than or equal to min decryption version of {}",
                self.min_encryption_version, self.min_decryption_version
            )));
        }

        if let Some(deletion_allowed) = update.deletion_allowed {
            if deletion_allowed != self.deletion_allowed {
                self.deletion_allowed = deletion_allowed;
                outcome.changed = true;
            }
        }

        if let Some(exportable) = update.exportable {
            if self.exportable && !exportable {
                return Err(TransitError::invalid("export cannot be disabled on a key that already has it enabled"));
            }
            if exportable && !self.exportable {
                self.exportable = true;
                outcome.changed = true;
            }
        }

        if let Some(allow_backup) = update.allow_plaintext_backup {
            if self.allow_plaintext_backup && !allow_backup {
                return Err(TransitError::invalid(
                    "backup cannot be disabled on a key that already has it enabled",
                ));
            }
            if allow_backup && !self.allow_plaintext_backup {
                self.allow_plaintext_backup = true;
                outcome.changed = true;
            }
        }

        if let Some(period) = update.auto_rotate_period {
            validate_auto_rotate_period(period)?;
            if period.as_secs() != self.auto_rotate_period {
                self.auto_rotate_period = period.as_secs();
                outcome.changed = true;
            }
        }

        Ok(outcome)
    }

    /// Raise the floor of available versions. Returns `false` when unchanged.
    ///
    /// Versions below the new floor are dropped from the archive on the next
    /// persist.
    pub fn trim(&mut self, min_available: u32) -> Result<bool> {
        if min_available == 0 {
            return Err(TransitError::invalid("minimum available version should be positive"));
        }
        if self.min_encryption_version == 0 {
            return Err(TransitError::invalid("minimum encryption version should not be zero"));
        }
        if self.min_decryption_version == 0 {
            return Err(TransitError::invalid("minimum decryption version should not be zero"));
        }
        if min_available > self.min_encryption_version {
            return Err(TransitError::invalid(
                "minimum available version should not be greater than minimum encryption version",
            ));
        }
        if min_available > self.min_decryption_version {
            return Err(TransitError::invalid(
                "minimum available version should not be greater than minimum decryption version",
            ));
        }
        if min_available < self.min_available_version {
            return Err(TransitError::invalid(
                "minimum available version should not be less than the current minimum available version",
            ));
        }
        if min_available == self.min_available_version {
            return Ok(false);
        }
        self.min_available_version = min_available;
        Ok(true)
    }
}

/// An automatic rotation period must be zero or at least an hour.
pub fn validate_auto_rotate_period(period: Duration) -> Result<()> {
    if !period.is_zero() && period < MIN_AUTO_ROTATE_PERIOD {
        return Err(TransitError::invalid("auto rotate period must be 0 to disable or at least an hour"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_type::AesBits;
    use crate::key_type::KeyKind;
    use crate::policy::tests::make_ctx;
    use crate::policy::tests::make_policy;

    async fn rotated(times: usize) -> Policy {
        let (_storage, ctx) = make_ctx();
        let mut policy = make_policy(&ctx, "k", KeyKind::Aes(AesBits::B256)).await;
        for _ in 0..times {
            policy.rotate(&ctx).await.unwrap();
        }
        policy
    }

    #[tokio::test]
    async fn test_zero_min_decryption_coerced_with_warning() {
        let mut policy = rotated(1).await;
        let outcome = policy
            .apply_config(&PolicyConfigUpdate {
                min_decryption_version: Some(0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(policy.min_decryption_version, 1);
        assert!(!outcome.changed);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_min_version_bounds() {
        let mut policy = rotated(2).await;
        let err = policy
            .apply_config(&PolicyConfigUpdate {
                min_decryption_version: Some(4),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("latest key version is 3"));

        let err = policy
            .apply_config(&PolicyConfigUpdate {
                min_decryption_version: Some(3),
                min_encryption_version: Some(2),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("must be greater than or equal to"));
    }

    #[tokio::test]
    async fn test_one_way_switches() {
        let mut policy = rotated(0).await;
        let enable = PolicyConfigUpdate {
            exportable: Some(true),
            allow_plaintext_backup: Some(true),
            ..Default::default()
        };
        assert!(policy.apply_config(&enable).unwrap().changed);

        let disable_export = PolicyConfigUpdate {
            exportable: Some(false),
            ..Default::default()
        };
        assert!(policy.apply_config(&disable_export).is_err());

        let disable_backup = PolicyConfigUpdate {
            allow_plaintext_backup: Some(false),
            ..Default::default()
        };
        assert!(policy.apply_config(&disable_backup).is_err());
    }

    #[tokio::test]
    async fn test_auto_rotate_period_bounds() {
        let mut policy = rotated(0).await;
        let short = PolicyConfigUpdate {
            auto_rotate_period: Some(Duration::from_secs(59 * 60)),
            ..Default::default()
        };
        assert!(policy.apply_config(&short).is_err());

        let hourly = PolicyConfigUpdate {
            auto_rotate_period: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        assert!(policy.apply_config(&hourly).unwrap().changed);
        assert_eq!(policy.auto_rotate_period, 3600);
    }

    #[tokio::test]
    async fn test_trim_rules() {
        let mut policy = rotated(4).await;
        assert!(policy.trim(1).is_err(), "min encryption version is still zero");

        policy.min_encryption_version = 3;
        policy.min_decryption_version = 2;
        assert!(policy.trim(0).is_err());
        assert!(policy.trim(3).is_err());
        assert!(policy.trim(2).unwrap());
        assert!(!policy.trim(2).unwrap());
        assert!(policy.trim(1).is_err());
    }
}
