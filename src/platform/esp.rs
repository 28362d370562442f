// ESP-IDF backend - binds the OTA traits to esp_ota_* / esp_partition_* and GPIO

use core::ffi::c_void;
use core::ptr;

use esp_idf_hal::delay::FreeRtos;
use esp_idf_sys::{
    esp_app_desc_t, esp_err_t, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition,
    esp_ota_get_last_invalid_partition, esp_ota_get_next_update_partition,
    esp_ota_get_partition_description, esp_ota_get_running_partition, esp_ota_get_state_partition,
    esp_ota_handle_t, esp_ota_img_states_t, esp_ota_mark_app_invalid_rollback_and_reboot,
    esp_ota_mark_app_valid_cancel_rollback, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_find_first, esp_partition_t, esp_partition_type_t_ESP_PARTITION_TYPE_APP,
    gpio_config, gpio_config_t, gpio_get_level, gpio_int_type_t_GPIO_INTR_DISABLE,
    gpio_mode_t_GPIO_MODE_INPUT, gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
    gpio_pullup_t_GPIO_PULLUP_ENABLE, gpio_reset_pin,
};
use log::{info, warn};

use crate::ota::{
    AppDescriptor, HealthCheck, ImageState, OtaFlash, Partition, PartitionKind, PartitionTable,
    PlatformError, RollbackControl,
};
use crate::system::reset::Restart;

fn check(code: esp_err_t) -> Result<(), PlatformError> {
    if code == 0 {
        Ok(())
    } else {
        Err(PlatformError(code))
    }
}

fn to_partition(raw: *const esp_partition_t) -> Option<Partition> {
    if raw.is_null() {
        return None;
    }
    // Partition table entries live for the whole program
    let raw = unsafe { &*raw };
    let label_bytes: Vec<u8> = raw
        .label
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    let label = core::str::from_utf8(&label_bytes).unwrap_or("?");
    let kind = PartitionKind::from_subtype(raw.subtype as u8)?;
    Some(Partition::new(kind, raw.address, raw.size, label))
}

/// Looks the entry back up by subtype and checks it is the same region.
fn to_raw(partition: &Partition) -> Result<*const esp_partition_t, PlatformError> {
    let raw = unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            partition.kind.subtype() as _,
            ptr::null(),
        )
    };
    if raw.is_null() || unsafe { (*raw).address } != partition.offset {
        return Err(PlatformError::FAIL);
    }
    Ok(raw)
}

fn unknown_partition() -> Partition {
    Partition::new(PartitionKind::Factory, 0, 0, "unknown")
}

/// OTA partition and rollback access on the running chip.
#[derive(Debug, Default)]
pub struct EspOtaPlatform {
    _private: (),
}

impl EspOtaPlatform {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl PartitionTable for EspOtaPlatform {
    fn running(&self) -> Partition {
        to_partition(unsafe { esp_ota_get_running_partition() }).unwrap_or_else(unknown_partition)
    }

    fn configured_boot(&self) -> Partition {
        to_partition(unsafe { esp_ota_get_boot_partition() }).unwrap_or_else(unknown_partition)
    }

    fn next_update_target(&self) -> Option<Partition> {
        to_partition(unsafe { esp_ota_get_next_update_partition(ptr::null()) })
    }

    fn last_invalid(&self) -> Option<Partition> {
        to_partition(unsafe { esp_ota_get_last_invalid_partition() })
    }

    fn description(&self, partition: &Partition) -> Option<AppDescriptor> {
        let raw = to_raw(partition).ok()?;
        let mut desc: esp_app_desc_t = unsafe { core::mem::zeroed() };
        check(unsafe { esp_ota_get_partition_description(raw, &mut desc) }).ok()?;

        let version: Vec<u8> = desc.version.iter().map(|&c| c as u8).collect();
        let project: Vec<u8> = desc.project_name.iter().map(|&c| c as u8).collect();
        Some(AppDescriptor::from_raw_fields(desc.secure_version, &version, &project))
    }
}

impl OtaFlash for EspOtaPlatform {
    type Handle = esp_ota_handle_t;

    fn begin(&mut self, target: &Partition, image_len: usize) -> Result<esp_ota_handle_t, PlatformError> {
        let raw = to_raw(target)?;
        let mut handle: esp_ota_handle_t = 0;
        check(unsafe { esp_ota_begin(raw, image_len as _, &mut handle as *mut _) })?;
        Ok(handle)
    }

    fn write(&mut self, handle: &mut esp_ota_handle_t, data: &[u8]) -> Result<(), PlatformError> {
        check(unsafe { esp_ota_write(*handle, data.as_ptr() as *const c_void, data.len() as _) })
    }

    fn end(&mut self, handle: esp_ota_handle_t) -> Result<(), PlatformError> {
        check(unsafe { esp_ota_end(handle) })
    }

    fn abort(&mut self, handle: esp_ota_handle_t) {
        if let Err(e) = check(unsafe { esp_ota_abort(handle) }) {
            warn!("esp_ota_abort failed ({})", e);
        }
    }

    fn set_boot_partition(&mut self, target: &Partition) -> Result<(), PlatformError> {
        let raw = to_raw(target)?;
        check(unsafe { esp_ota_set_boot_partition(raw) })
    }
}

impl RollbackControl for EspOtaPlatform {
    fn image_state(&self, partition: &Partition) -> Result<ImageState, PlatformError> {
        let raw = to_raw(partition)?;
        let mut state: esp_ota_img_states_t = 0;
        check(unsafe { esp_ota_get_state_partition(raw, &mut state) })?;

        Ok(match state {
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_NEW => ImageState::New,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY => ImageState::PendingVerify,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_VALID => ImageState::Valid,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_INVALID => ImageState::Invalid,
            esp_idf_sys::esp_ota_img_states_t_ESP_OTA_IMG_ABORTED => ImageState::Aborted,
            _ => ImageState::Undefined,
        })
    }

    fn mark_valid(&mut self) -> Result<(), PlatformError> {
        check(unsafe { esp_ota_mark_app_valid_cancel_rollback() })
    }

    fn rollback_and_reboot(&mut self) -> Result<(), PlatformError> {
        // Only returns if no other app is available to roll back to
        check(unsafe { esp_ota_mark_app_invalid_rollback_and_reboot() })
    }
}

impl Restart for EspOtaPlatform {
    fn restart(&mut self) {
        unsafe { esp_idf_sys::esp_restart() }
    }
}

/// Health check reading a pulled-up input pin after a settling period.
/// A high level means the new firmware is healthy.
#[derive(Debug, Clone, Copy)]
pub struct GpioDiagnostic {
    pub pin: i32,
    pub duration_ms: u32,
}

impl HealthCheck for GpioDiagnostic {
    fn run(&mut self) -> bool {
        let io_conf = gpio_config_t {
            intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
            mode: gpio_mode_t_GPIO_MODE_INPUT,
            pin_bit_mask: 1u64 << self.pin,
            pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
            pull_up_en: gpio_pullup_t_GPIO_PULLUP_ENABLE,
            ..Default::default()
        };
        if let Err(e) = check(unsafe { gpio_config(&io_conf) }) {
            warn!("Diagnostic pin {} config failed ({})", self.pin, e);
            return false;
        }

        info!("Diagnostics ({} ms)...", self.duration_ms);
        FreeRtos::delay_ms(self.duration_ms);

        let healthy = unsafe { gpio_get_level(self.pin) } != 0;
        unsafe { gpio_reset_pin(self.pin) };
        healthy
    }
}
