// Device reset - a short grace period, then an unconditional restart

use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;

/// Something that can restart the device.
pub trait Restart {
    fn restart(&mut self);
}

/// Default grace period before restarting, long enough to flush a response
pub const RESET_DELAY: Duration = Duration::from_millis(1000);

/// Waits `delay`, then restarts. Not gated on any update outcome.
pub fn reset_device<R: Restart + ?Sized>(device: &mut R, delay: Duration) {
    thread::sleep(delay);
    info!("Prepare to restart system!");

    // Ensure log is flushed
    log::logger().flush();

    device.restart();
}

/// Same as [`reset_device`] but on a background thread, so an HTTP handler can
/// finish its response first.
pub fn schedule_reset<R: Restart + Send + 'static>(mut device: R, delay: Duration) -> JoinHandle<()> {
    thread::spawn(move || reset_device(&mut device, delay))
}

/// `esp_restart()`
#[cfg(target_os = "espidf")]
#[derive(Debug, Default, Clone, Copy)]
pub struct EspRestart;

#[cfg(target_os = "espidf")]
impl Restart for EspRestart {
    fn restart(&mut self) {
        unsafe { esp_idf_sys::esp_restart() }
    }
}

/// Get the last reset reason as a string
#[cfg(target_os = "espidf")]
pub fn get_reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_UNKNOWN => "Unknown",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => "SDIO",
        _ => "Unknown reason code",
    }
}
