pub mod reset;

pub use reset::{reset_device, schedule_reset, Restart};
