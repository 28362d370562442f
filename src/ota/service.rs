// OTA service - owns the platform and lets one transfer at a time through

use std::sync::{Mutex, MutexGuard, TryLockError};

use log::{error, info, warn};
use serde_json::{Map, Value};

use super::error::OtaError;
use super::partition::{OtaFlash, PartitionTable};
use super::transaction::{ImageSource, UpdatePolicy, UpdateReport, UpdateTransaction};

pub struct OtaService<P> {
    platform: Mutex<P>,
    policy: UpdatePolicy,
}

impl<P> OtaService<P> {
    pub fn new(platform: P, policy: UpdatePolicy) -> Self {
        Self { platform: Mutex::new(platform), policy }
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Runs `f` with exclusive access to the platform, waiting for any transfer to finish.
    pub fn with_platform<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut guard = self.platform.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn into_platform(self) -> P {
        self.platform.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_platform(&self) -> Result<MutexGuard<'_, P>, OtaError> {
        match self.platform.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => {
                warn!("Rejecting update: another transfer is in progress");
                Err(OtaError::UpdateInProgress)
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Previous transfer panicked, reusing platform");
                Ok(poisoned.into_inner())
            }
        }
    }
}

impl<P: PartitionTable + OtaFlash> OtaService<P> {
    /// Streams one firmware image from `source` and records the outcome in `response`.
    pub fn handle_update<S: ImageSource + ?Sized>(
        &self,
        source: &mut S,
        response: &mut Map<String, Value>,
    ) -> Result<UpdateReport, OtaError> {
        let result = self.try_platform().and_then(|mut platform| {
            let declared = source.content_len();
            info!("OTA Update started, size: {} bytes", declared);
            let tx = UpdateTransaction::begin(&mut *platform, declared, self.policy)?;
            tx.run(source)
        });

        match &result {
            Ok(report) => {
                if report.is_committed() {
                    info!("OTA update of {} complete ({} bytes)", report.version, report.bytes);
                } else {
                    warn!("Image {} written but boot partition unchanged", report.version);
                }
                report.write_into(response);
            }
            Err(e) => {
                error!("OTA update failed: {}", e);
                e.write_into(response);
            }
        }
        result
    }
}
