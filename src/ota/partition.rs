// Partition roles and the platform seams behind them

use core::fmt;

use log::{info, warn};

use super::descriptor::AppDescriptor;
use super::error::PlatformError;

pub type Label = heapless::String<16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    Factory,
    /// OTA slot by index (`ota_0`, `ota_1`, ...)
    Ota(u8),
    Test,
}

impl PartitionKind {
    /// ESP-IDF app subtype value
    pub fn subtype(&self) -> u8 {
        match self {
            PartitionKind::Factory => 0x00,
            PartitionKind::Ota(slot) => 0x10 + slot,
            PartitionKind::Test => 0x20,
        }
    }

    pub fn from_subtype(subtype: u8) -> Option<Self> {
        match subtype {
            0x00 => Some(PartitionKind::Factory),
            0x10..=0x1F => Some(PartitionKind::Ota(subtype - 0x10)),
            0x20 => Some(PartitionKind::Test),
            _ => None,
        }
    }
}

/// A fixed app region of flash. Identity is its kind plus offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub kind: PartitionKind,
    pub offset: u32,
    pub size: u32,
    pub label: Label,
}

impl Partition {
    pub fn new(kind: PartitionKind, offset: u32, size: u32, label: &str) -> Self {
        let mut l = Label::new();
        for c in label.chars() {
            if l.push(c).is_err() {
                break;
            }
        }
        Self { kind, offset, size, label: l }
    }

    pub fn same_region(&self, other: &Partition) -> bool {
        self.kind == other.kind && self.offset == other.offset
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (subtype {} at offset 0x{:08x})", self.label, self.kind.subtype(), self.offset)
    }
}

/// Per-boot verification state of an app image, as tracked by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Freshly written, never booted
    New,
    PendingVerify,
    Valid,
    Invalid,
    /// Booted while pending and never confirmed
    Aborted,
    Undefined,
}

/// Resolves partitions to their current roles. Read-only.
pub trait PartitionTable {
    fn running(&self) -> Partition;

    fn configured_boot(&self) -> Partition;

    /// Next slot to write an update into; never the running partition.
    fn next_update_target(&self) -> Option<Partition>;

    fn last_invalid(&self) -> Option<Partition>;

    fn description(&self, partition: &Partition) -> Option<AppDescriptor>;
}

/// Write session on an update slot plus the persisted boot selection.
pub trait OtaFlash {
    type Handle;

    fn begin(&mut self, target: &Partition, image_len: usize) -> Result<Self::Handle, PlatformError>;

    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<(), PlatformError>;

    /// Closes the session and validates the written image.
    fn end(&mut self, handle: Self::Handle) -> Result<(), PlatformError>;

    fn abort(&mut self, handle: Self::Handle);

    fn set_boot_partition(&mut self, target: &Partition) -> Result<(), PlatformError>;
}

/// Logs the running/boot partition pair. A mismatch is informational only.
pub fn log_boot_state<T: PartitionTable + ?Sized>(table: &T) -> Partition {
    let configured = table.configured_boot();
    let running = table.running();

    if !configured.same_region(&running) {
        warn!(
            "Configured boot partition at offset 0x{:08x}, is running from offset 0x{:08x}",
            configured.offset, running.offset
        );
        warn!("(This happens if either the ota data or boot image become corrupted.)");
    }
    info!(
        "Running partition {} subtype {} (offset 0x{:08x})",
        running.label,
        running.kind.subtype(),
        running.offset
    );
    running
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_roundtrip_for_ota_slots() {
        assert_eq!(PartitionKind::Ota(1).subtype(), 0x11);
        assert_eq!(PartitionKind::from_subtype(0x11), Some(PartitionKind::Ota(1)));
        assert_eq!(PartitionKind::from_subtype(0x00), Some(PartitionKind::Factory));
        assert_eq!(PartitionKind::from_subtype(0x30), None);
    }

    #[test]
    fn test_label_is_truncated_to_sixteen_chars() {
        let p = Partition::new(PartitionKind::Ota(0), 0x110000, 0x170000, "an_unusually_long_label");
        assert_eq!(p.label.len(), 16);
    }

    #[test]
    fn test_identity_is_kind_and_offset() {
        let a = Partition::new(PartitionKind::Ota(0), 0x110000, 0x170000, "ota_0");
        let b = Partition::new(PartitionKind::Ota(0), 0x110000, 0x100000, "renamed");
        let c = Partition::new(PartitionKind::Ota(1), 0x110000, 0x170000, "ota_0");
        assert!(a.same_region(&b));
        assert!(!a.same_region(&c));
    }
}
