use std::time::Duration;

use crate::ota::sim::{firmware_image, ScriptedSource, SimDevice};
use crate::ota::{
    apply_verdict, BootVerdict, ImageSource, ImageState, OtaError, PartitionKind, PartitionTable,
    PlatformError, PostBootVerifier, RollbackControl, UpdatePolicy, UpdateTransaction,
};
use crate::system::reset_device;

/// Device that has just rebooted into a freshly written "2.0.0".
fn booted_into_update() -> SimDevice {
    let mut dev = SimDevice::new("1.0.0");
    let image = firmware_image("2.0.0", 2048);
    let mut source = ScriptedSource::chunked(&image, 1024);
    let tx = UpdateTransaction::begin(&mut dev, source.content_len(), UpdatePolicy::default()).unwrap();
    assert!(tx.run(&mut source).unwrap().is_committed());

    reset_device(&mut dev, Duration::ZERO);
    dev
}

#[test]
fn test_verified_image_needs_nothing() {
    let mut dev = SimDevice::new("1.0.0");
    let mut calls = 0;
    let mut health = || {
        calls += 1;
        true
    };

    let verdict = PostBootVerifier::new(&mut dev).run(&mut health).unwrap();
    assert_eq!(verdict, BootVerdict::NotPending(Some(ImageState::Valid)));
    assert_eq!(calls, 0);
}

#[test]
fn test_healthy_pending_image_is_confirmed() {
    let mut dev = booted_into_update();
    let running = dev.running();
    assert_eq!(running.kind, PartitionKind::Ota(1));
    assert_eq!(dev.image_state(&running), Ok(ImageState::PendingVerify));

    let verdict = PostBootVerifier::new(&mut dev).run(&mut || true).unwrap();
    assert_eq!(verdict, BootVerdict::Confirmed);
    assert_eq!(dev.image_state(&running), Ok(ImageState::Valid));

    apply_verdict(&mut dev, verdict).unwrap();
    assert_eq!(dev.stats.restarts, 1);
    assert_eq!(dev.stats.rollbacks, 0);
    assert_eq!(dev.running_version().as_deref(), Some("2.0.0"));
}

#[test]
fn test_unhealthy_image_is_rolled_back_once() {
    let mut dev = booted_into_update();
    let updated = dev.running();
    let mut calls = 0;
    let mut health = || {
        calls += 1;
        false
    };

    let verdict = PostBootVerifier::new(&mut dev).run(&mut health).unwrap();
    assert_eq!(verdict, BootVerdict::RollbackRequested);
    assert_eq!(calls, 1);
    // Deciding has no side effects
    assert_eq!(dev.stats.rollbacks, 0);
    assert_eq!(dev.image_state(&updated), Ok(ImageState::PendingVerify));

    apply_verdict(&mut dev, verdict).unwrap();
    assert_eq!(dev.stats.rollbacks, 1);
    assert_eq!(dev.stats.restarts, 2);
    assert_eq!(dev.running_version().as_deref(), Some("1.0.0"));
    assert_eq!(dev.last_invalid(), Some(updated.clone()));
    assert_eq!(dev.image_state(&updated), Ok(ImageState::Invalid));
}

#[test]
fn test_rolled_back_version_is_refused_next_time() {
    let mut dev = booted_into_update();
    let verdict = PostBootVerifier::new(&mut dev).run(&mut || false).unwrap();
    apply_verdict(&mut dev, verdict).unwrap();

    let mut source = ScriptedSource::chunked(&firmware_image("2.0.0", 2048), 1024);
    let tx = UpdateTransaction::begin(&mut dev, source.content_len(), UpdatePolicy::default()).unwrap();
    let err = tx.run(&mut source).unwrap_err();
    assert_eq!(err, OtaError::DuplicateInvalidVersion("2.0.0".into()));

    let mut source = ScriptedSource::chunked(&firmware_image("2.0.1", 2048), 1024);
    let tx = UpdateTransaction::begin(&mut dev, source.content_len(), UpdatePolicy::default()).unwrap();
    assert!(tx.run(&mut source).unwrap().is_committed());
}

#[test]
fn test_factory_app_has_no_state() {
    let mut dev = SimDevice::new("1.0.0");
    dev.set_configured_boot(PartitionKind::Factory);
    reset_device(&mut dev, Duration::ZERO);
    assert_eq!(dev.running().kind, PartitionKind::Factory);

    let verdict = PostBootVerifier::new(&mut dev).run(&mut || false).unwrap();
    assert_eq!(verdict, BootVerdict::NotPending(None));
    apply_verdict(&mut dev, verdict).unwrap();
    assert_eq!(dev.stats.rollbacks, 0);
}

#[test]
fn test_mark_valid_failure_is_reported() {
    let mut dev = booted_into_update();
    dev.faults.mark_valid = Some(PlatformError::FAIL);

    let err = PostBootVerifier::new(&mut dev).run(&mut || true).unwrap_err();
    assert_eq!(err, OtaError::BootState(PlatformError::FAIL));
}

#[test]
fn test_rollback_failure_is_reported() {
    let mut dev = booted_into_update();
    dev.faults.rollback = Some(PlatformError::FAIL);

    let verdict = PostBootVerifier::new(&mut dev).run(&mut || false).unwrap();
    let err = apply_verdict(&mut dev, verdict).unwrap_err();
    assert_eq!(err, OtaError::BootState(PlatformError::FAIL));
    assert_eq!(dev.running_version().as_deref(), Some("2.0.0"));
}

#[test]
fn test_update_still_accepted_after_mark_valid_failure() {
    let mut dev = booted_into_update();
    dev.faults.mark_valid = Some(PlatformError::FAIL);
    assert!(PostBootVerifier::new(&mut dev).run(&mut || true).is_err());

    let mut source = ScriptedSource::chunked(&firmware_image("2.0.1", 2048), 1024);
    let tx = UpdateTransaction::begin(&mut dev, source.content_len(), UpdatePolicy::default()).unwrap();
    assert_eq!(tx.target().kind, PartitionKind::Ota(0));
    assert!(tx.run(&mut source).unwrap().is_committed());
}
