//! Post-boot self test.
//!
//! When the bootloader starts a freshly written image it marks it
//! pending-verify. The first run of that image must either confirm it or hand
//! control back to the previous one. The verifier only decides; performing the
//! rollback reboot is a separate step ([`apply_verdict`]) so the decision can be
//! exercised without a restart.

use log::{debug, error, info};

use super::error::{OtaError, PlatformError};
use super::partition::{ImageState, Partition, PartitionTable};

/// Rollback bookkeeping kept by the bootloader.
pub trait RollbackControl {
    fn image_state(&self, partition: &Partition) -> Result<ImageState, PlatformError>;

    /// Confirms the running image and cancels the pending rollback.
    fn mark_valid(&mut self) -> Result<(), PlatformError>;

    /// Marks the running image invalid and reboots into the previous one.
    /// On hardware this only returns if the rollback could not be started.
    fn rollback_and_reboot(&mut self) -> Result<(), PlatformError>;
}

/// Blocking probe deciding whether the new image works.
pub trait HealthCheck {
    fn run(&mut self) -> bool;
}

impl<F: FnMut() -> bool> HealthCheck for F {
    fn run(&mut self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootVerdict {
    /// Nothing to verify; `None` when the state could not be read (e.g. factory app)
    NotPending(Option<ImageState>),
    Confirmed,
    RollbackRequested,
}

/// Runs once per boot, consumed by [`PostBootVerifier::run`].
pub struct PostBootVerifier<'p, P> {
    platform: &'p mut P,
}

impl<'p, P: PartitionTable + RollbackControl> PostBootVerifier<'p, P> {
    pub fn new(platform: &'p mut P) -> Self {
        Self { platform }
    }

    pub fn run<H: HealthCheck + ?Sized>(self, health: &mut H) -> Result<BootVerdict, OtaError> {
        let running = self.platform.running();
        let state = match self.platform.image_state(&running) {
            Ok(state) => state,
            Err(e) => {
                debug!("No image state for {} ({}), skipping diagnostics", running, e);
                return Ok(BootVerdict::NotPending(None));
            }
        };

        if state != ImageState::PendingVerify {
            debug!("Running image state {:?}, nothing to verify", state);
            return Ok(BootVerdict::NotPending(Some(state)));
        }

        info!("Image in {} is pending verification, running diagnostics", running.label);
        if health.run() {
            info!("Diagnostics completed successfully! Continuing execution ...");
            self.platform.mark_valid().map_err(OtaError::BootState)?;
            Ok(BootVerdict::Confirmed)
        } else {
            error!("Diagnostics failed! Start rollback to the previous version ...");
            Ok(BootVerdict::RollbackRequested)
        }
    }
}

/// Carries out a verdict. For `RollbackRequested` this issues the single
/// rollback-and-reboot call; on hardware it does not come back unless that failed.
pub fn apply_verdict<P: RollbackControl + ?Sized>(platform: &mut P, verdict: BootVerdict) -> Result<(), OtaError> {
    match verdict {
        BootVerdict::RollbackRequested => platform.rollback_and_reboot().map_err(|e| {
            error!("Rollback failed ({})", e);
            OtaError::BootState(e)
        }),
        _ => Ok(()),
    }
}
