// Over-the-air firmware update for dual-slot ESP32 devices

pub mod config;
pub mod logging;
pub mod ota;
pub mod system;
pub mod version;

#[cfg(target_os = "espidf")]
pub mod network;
#[cfg(target_os = "espidf")]
pub mod platform;

#[cfg(test)]
mod tests;
