use serde_json::{Map, Value};

use crate::ota::sim::{firmware_image, ScriptedSource, SimDevice, Step};
use crate::ota::{OtaError, OtaService, PartitionKind, PartitionTable, PlatformError, UpdatePolicy};

fn service() -> OtaService<SimDevice> {
    let mut dev = SimDevice::new("1.0.0");
    dev.set_last_invalid("1.9.0");
    OtaService::new(dev, UpdatePolicy::default())
}

#[test]
fn test_successful_update_response() {
    let service = service();
    let mut source = ScriptedSource::chunked(&firmware_image("2.0.0", 2048), 1024);
    let mut response = Map::new();

    service.handle_update(&mut source, &mut response).unwrap();

    assert_eq!(response["status"], "ok");
    assert_eq!(response["state"], "committed");
    assert_eq!(response["version"], "2.0.0");
    assert_eq!(response["partition"], "ota_1");
    assert_eq!(response["bytes"], 2048);
    assert_eq!(response["sha256"].as_str().map(str::len), Some(64));
    assert!(!response.contains_key("error"));
    assert!(!response.contains_key("boot_error"));
}

#[test]
fn test_rejection_sets_error_message() {
    let service = service();
    let mut source = ScriptedSource::chunked(&firmware_image("1.9.0", 2048), 1024);
    let mut response = Map::new();

    let err = service.handle_update(&mut source, &mut response).unwrap_err();
    assert!(matches!(err, OtaError::DuplicateInvalidVersion(_)));
    assert_eq!(
        response.get("error"),
        Some(&Value::from("New version is invalid, fw has been rolled back to last version"))
    );
    assert!(!response.contains_key("status"));
}

#[test]
fn test_short_transfer_response() {
    let service = service();
    let image = firmware_image("2.0.0", 2048);
    let mut source = ScriptedSource::new(image.len(), vec![Step::Data(image[..512].to_vec())]);
    let mut response = Map::new();

    assert!(service.handle_update(&mut source, &mut response).is_err());
    assert_eq!(response["error"], "Error in receiving complete file");
}

#[test]
fn test_boot_switch_failure_response() {
    let service = service();
    service.with_platform(|dev| dev.faults.set_boot = Some(PlatformError::FAIL));
    let mut source = ScriptedSource::chunked(&firmware_image("2.0.0", 2048), 1024);
    let mut response = Map::new();

    let report = service.handle_update(&mut source, &mut response).unwrap();
    assert!(!report.is_committed());
    assert_eq!(response["status"], "written");
    assert_eq!(response["state"], "written");
    assert_eq!(response["error"], "esp_ota_set_boot_partition failed");
}

#[test]
fn test_concurrent_update_is_refused() {
    let service = service();
    let mut source = ScriptedSource::chunked(&firmware_image("2.0.0", 2048), 1024);
    let mut response = Map::new();

    let result = service.with_platform(|_| service.handle_update(&mut source, &mut response));
    assert_eq!(result.unwrap_err(), OtaError::UpdateInProgress);
    assert_eq!(response["error"], "Another update is in progress");
    assert_eq!(source.reads, 0);

    let dev = service.into_platform();
    assert_eq!(dev.stats.sessions_opened, 0);
}

#[test]
fn test_failed_transfer_does_not_block_the_next_one() {
    let service = service();
    let image = firmware_image("2.0.0", 2048);

    let mut broken = ScriptedSource::new(image.len(), vec![Step::Data(image[..1024].to_vec()), Step::Fail(-1)]);
    assert!(service.handle_update(&mut broken, &mut Map::new()).is_err());

    let mut source = ScriptedSource::chunked(&image, 1024);
    let report = service.handle_update(&mut source, &mut Map::new()).unwrap();
    assert!(report.is_committed());

    let dev = service.into_platform();
    assert_eq!(dev.configured_boot().kind, PartitionKind::Ota(1));
    assert_eq!(dev.stats.sessions_aborted, 1);
    assert!(!dev.session_open());
}
