// Hardware backends for the OTA traits

pub mod esp;

pub use esp::{EspOtaPlatform, GpioDiagnostic};
