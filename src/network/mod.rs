pub mod ota_routes;

pub use ota_routes::{HttpBodySource, OtaHttpServer};
