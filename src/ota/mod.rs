// OTA (Over-The-Air) update module

pub mod descriptor;
pub mod error;
pub mod partition;
pub mod service;
#[cfg(any(test, not(target_os = "espidf")))]
pub mod sim;
pub mod transaction;
pub mod verifier;
pub mod writer;

pub use descriptor::{AppDescriptor, DESCRIPTOR_PREFIX_LEN};
pub use error::{OtaError, PlatformError};
pub use partition::{ImageState, OtaFlash, Partition, PartitionKind, PartitionTable};
pub use service::OtaService;
pub use transaction::{ImageSource, RecvError, TxState, UpdatePolicy, UpdateReport, UpdateTransaction};
pub use verifier::{apply_verdict, BootVerdict, HealthCheck, PostBootVerifier, RollbackControl};
pub use writer::HeaderMode;

// OTA update flow:
// 1. Receive the image body in chunks
// 2. Check the embedded version against the last invalid image
// 3. Stream to the inactive OTA partition
// 4. Validate and set boot partition
// 5. Restart; the new image verifies itself or rolls back
