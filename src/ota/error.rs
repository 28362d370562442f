// OTA error taxonomy - every failure a transfer or boot check can end with

use core::fmt;

/// Raw status code returned by the partition / rollback subsystem (an `esp_err_t` on device)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformError(pub i32);

impl PlatformError {
    /// `ESP_ERR_OTA_VALIDATE_FAILED`
    pub const VALIDATE_FAILED: PlatformError = PlatformError(0x1503);
    /// `ESP_ERR_NOT_SUPPORTED`
    pub const NOT_SUPPORTED: PlatformError = PlatformError(0x106);
    /// `ESP_ERR_INVALID_SIZE`
    pub const INVALID_SIZE: PlatformError = PlatformError(0x104);
    /// `ESP_FAIL`
    pub const FAIL: PlatformError = PlatformError(-1);

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn is_validate_failed(&self) -> bool {
        *self == Self::VALIDATE_FAILED
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform error 0x{:x}", self.0)
    }
}

impl std::error::Error for PlatformError {}

/// Terminal failure of an update transaction or of the post-boot check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    /// The transport returned an error while reading the body
    Transport(i32),
    /// First chunk (or whole stream) too short to hold the descriptor prefix
    Framing { received: usize, required: usize },
    /// Image or descriptor magic did not match
    MalformedHeader(&'static str),
    /// Candidate version equals the version that last failed its health check
    DuplicateInvalidVersion(String),
    /// Candidate version equals the running version (only when configured to reject it)
    AlreadyRunning(String),
    /// Partition table has no slot to update into
    NoUpdatePartition,
    /// Another transfer currently owns the flash session
    UpdateInProgress,
    FlashSession(PlatformError),
    FlashWrite(PlatformError),
    ShortTransfer { received: usize, expected: usize },
    ImageCorrupted,
    FlashClose(PlatformError),
    /// Image was written and validated but the boot slot could not be switched
    BootPartition(PlatformError),
    /// Rollback subsystem refused a state query or transition
    BootState(PlatformError),
}

impl OtaError {
    /// Human-readable message placed in the response accumulator.
    pub fn message(&self) -> &'static str {
        match self {
            OtaError::Transport(_) => "Could not receive image",
            OtaError::Framing { .. } => "received package does not fit len",
            OtaError::MalformedHeader(_) => "Image header is malformed",
            OtaError::DuplicateInvalidVersion(_) => {
                "New version is invalid, fw has been rolled back to last version"
            }
            OtaError::AlreadyRunning(_) => "New version is already running",
            OtaError::NoUpdatePartition => "No OTA partition available",
            OtaError::UpdateInProgress => "Another update is in progress",
            OtaError::FlashSession(_) => "OTA begin failed",
            OtaError::FlashWrite(_) => "Unable to write chunk to flash",
            OtaError::ShortTransfer { .. } => "Error in receiving complete file",
            OtaError::ImageCorrupted => "Image validation failed, image is corrupted",
            OtaError::FlashClose(_) => "esp_ota_end failed",
            OtaError::BootPartition(_) => "esp_ota_set_boot_partition failed",
            OtaError::BootState(_) => "Unable to access image state",
        }
    }

    /// Write the `"error"` entry of a structured response.
    pub fn write_into(&self, response: &mut serde_json::Map<String, serde_json::Value>) {
        response.insert("error".into(), self.message().into());
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::Transport(code) => write!(f, "{} (recv returned {})", self.message(), code),
            OtaError::Framing { received, required } => {
                write!(f, "{} ({} of {} header bytes)", self.message(), received, required)
            }
            OtaError::MalformedHeader(what) => write!(f, "{}: {}", self.message(), what),
            OtaError::DuplicateInvalidVersion(v) | OtaError::AlreadyRunning(v) => {
                write!(f, "{} ({})", self.message(), v)
            }
            OtaError::ShortTransfer { received, expected } => {
                write!(f, "{} ({} of {} bytes)", self.message(), received, expected)
            }
            OtaError::FlashSession(e)
            | OtaError::FlashWrite(e)
            | OtaError::FlashClose(e)
            | OtaError::BootPartition(e)
            | OtaError::BootState(e) => write!(f, "{} ({})", self.message(), e),
            _ => f.write_str(self.message()),
        }
    }
}

impl std::error::Error for OtaError {}
