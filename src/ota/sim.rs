//! Host-side stand-ins for the flash, the bootloader's rollback bookkeeping and
//! the HTTP body stream. Used by the test suite and by the host binary.

use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use super::descriptor::{encode_prefix, extract_descriptor, AppDescriptor, DESCRIPTOR_PREFIX_LEN};
use super::error::PlatformError;
use super::partition::{ImageState, OtaFlash, Partition, PartitionKind, PartitionTable};
use super::transaction::{ImageSource, RecvError};
use super::verifier::RollbackControl;
use crate::system::reset::Restart;

/// Builds a well-formed image of `total_len` bytes carrying `version`.
pub fn firmware_image(version: &str, total_len: usize) -> Vec<u8> {
    let desc = AppDescriptor::from_raw_fields(1, version.as_bytes(), b"esp-ota-updater");
    let segment_len = total_len.saturating_sub(DESCRIPTOR_PREFIX_LEN) as u32;
    let mut image = encode_prefix(&desc, segment_len).to_vec();
    image.extend((0..segment_len as usize).map(|i| (i % 251) as u8));
    image.truncate(total_len);
    image
}

/// Faults the next matching call will report.
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub begin: Option<PlatformError>,
    /// Fail the n-th write of a session (0-based)
    pub write_at: Option<usize>,
    pub end: Option<PlatformError>,
    pub set_boot: Option<PlatformError>,
    pub mark_valid: Option<PlatformError>,
    pub rollback: Option<PlatformError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub sessions_opened: usize,
    pub sessions_aborted: usize,
    pub sessions_closed: usize,
    pub writes: usize,
    pub boot_switches: usize,
    pub rollbacks: usize,
    pub restarts: usize,
}

#[derive(Debug)]
pub struct SimSession {
    slot: usize,
    data: Vec<u8>,
    writes: usize,
}

/// Factory app plus two OTA slots with bootloader-style rollback.
#[derive(Debug)]
pub struct SimDevice {
    partitions: Vec<Partition>,
    images: HashMap<usize, Vec<u8>>,
    states: HashMap<usize, ImageState>,
    running: usize,
    boot: usize,
    previous: Option<usize>,
    last_invalid: Option<usize>,
    session_open: bool,
    pub faults: Faults,
    pub stats: SimStats,
}

const FACTORY: usize = 0;
const OTA_0: usize = 1;
const OTA_1: usize = 2;

impl SimDevice {
    /// Device running `version` from `ota_0`, already verified.
    pub fn new(running_version: &str) -> Self {
        let partitions = vec![
            Partition::new(PartitionKind::Factory, 0x10000, 0x100000, "factory"),
            Partition::new(PartitionKind::Ota(0), 0x110000, 0x170000, "ota_0"),
            Partition::new(PartitionKind::Ota(1), 0x280000, 0x170000, "ota_1"),
        ];
        let mut dev = Self {
            partitions,
            images: HashMap::new(),
            states: HashMap::new(),
            running: OTA_0,
            boot: OTA_0,
            previous: None,
            last_invalid: None,
            session_open: false,
            faults: Faults::default(),
            stats: SimStats::default(),
        };
        dev.images.insert(FACTORY, firmware_image("0.1.0", 4096));
        dev.images.insert(OTA_0, firmware_image(running_version, 4096));
        dev.states.insert(OTA_0, ImageState::Valid);
        dev
    }

    /// Records `version` as the last image that failed its health check.
    pub fn set_last_invalid(&mut self, version: &str) {
        let slot = self.other_ota(self.running);
        self.images.insert(slot, firmware_image(version, 4096));
        self.states.insert(slot, ImageState::Invalid);
        self.last_invalid = Some(slot);
    }

    /// Points the persisted boot selection somewhere other than the running slot.
    pub fn set_configured_boot(&mut self, kind: PartitionKind) {
        if let Some(i) = self.partitions.iter().position(|p| p.kind == kind) {
            self.boot = i;
        }
    }

    pub fn running_version(&self) -> Option<String> {
        self.description(&self.running()).map(|d| d.version().to_string())
    }

    pub fn image(&self, partition: &Partition) -> Option<&[u8]> {
        self.index_of(partition).and_then(|i| self.images.get(&i)).map(Vec::as_slice)
    }

    pub fn session_open(&self) -> bool {
        self.session_open
    }

    /// Bootloader side of a restart: start the selected image, pending if new.
    fn reboot(&mut self) {
        if self.boot != self.running {
            self.previous = Some(self.running);
        }
        self.running = self.boot;
        if self.states.get(&self.running) == Some(&ImageState::New) {
            self.states.insert(self.running, ImageState::PendingVerify);
        }
        info!("Simulated boot from {}", self.partitions[self.running]);
    }

    fn index_of(&self, partition: &Partition) -> Option<usize> {
        self.partitions.iter().position(|p| p.same_region(partition))
    }

    fn other_ota(&self, slot: usize) -> usize {
        if slot == OTA_0 {
            OTA_1
        } else {
            OTA_0
        }
    }
}

impl PartitionTable for SimDevice {
    fn running(&self) -> Partition {
        self.partitions[self.running].clone()
    }

    fn configured_boot(&self) -> Partition {
        self.partitions[self.boot].clone()
    }

    fn next_update_target(&self) -> Option<Partition> {
        let next = match self.partitions[self.running].kind {
            PartitionKind::Ota(_) => self.other_ota(self.running),
            _ => OTA_0,
        };
        self.partitions.get(next).cloned()
    }

    fn last_invalid(&self) -> Option<Partition> {
        self.last_invalid.map(|i| self.partitions[i].clone())
    }

    fn description(&self, partition: &Partition) -> Option<AppDescriptor> {
        let image = self.image(partition)?;
        extract_descriptor(image).ok()
    }
}

impl OtaFlash for SimDevice {
    type Handle = SimSession;

    fn begin(&mut self, target: &Partition, image_len: usize) -> Result<SimSession, PlatformError> {
        if let Some(e) = self.faults.begin.take() {
            return Err(e);
        }
        let slot = self.index_of(target).ok_or(PlatformError::FAIL)?;
        if slot == self.running || self.session_open {
            return Err(PlatformError::FAIL);
        }
        if image_len > target.size as usize {
            return Err(PlatformError::INVALID_SIZE);
        }
        self.session_open = true;
        self.stats.sessions_opened += 1;
        debug!("Erasing {} for {} bytes", target.label, image_len);
        Ok(SimSession { slot, data: Vec::with_capacity(image_len), writes: 0 })
    }

    fn write(&mut self, handle: &mut SimSession, data: &[u8]) -> Result<(), PlatformError> {
        if self.faults.write_at == Some(handle.writes) {
            self.faults.write_at = None;
            return Err(PlatformError::FAIL);
        }
        handle.writes += 1;
        self.stats.writes += 1;
        handle.data.extend_from_slice(data);
        Ok(())
    }

    fn end(&mut self, handle: SimSession) -> Result<(), PlatformError> {
        self.session_open = false;
        self.stats.sessions_closed += 1;
        if let Some(e) = self.faults.end.take() {
            return Err(e);
        }
        if extract_descriptor(&handle.data).is_err() {
            return Err(PlatformError::VALIDATE_FAILED);
        }
        self.images.insert(handle.slot, handle.data);
        self.states.insert(handle.slot, ImageState::New);
        Ok(())
    }

    fn abort(&mut self, handle: SimSession) {
        debug!("Dropping {} buffered bytes for {}", handle.data.len(), self.partitions[handle.slot].label);
        self.session_open = false;
        self.stats.sessions_aborted += 1;
    }

    fn set_boot_partition(&mut self, target: &Partition) -> Result<(), PlatformError> {
        if let Some(e) = self.faults.set_boot.take() {
            return Err(e);
        }
        let slot = self.index_of(target).ok_or(PlatformError::FAIL)?;
        if !self.images.contains_key(&slot) {
            return Err(PlatformError::FAIL);
        }
        self.boot = slot;
        self.stats.boot_switches += 1;
        Ok(())
    }
}

impl RollbackControl for SimDevice {
    fn image_state(&self, partition: &Partition) -> Result<ImageState, PlatformError> {
        if partition.kind == PartitionKind::Factory {
            return Err(PlatformError::NOT_SUPPORTED);
        }
        let slot = self.index_of(partition).ok_or(PlatformError::FAIL)?;
        Ok(self.states.get(&slot).copied().unwrap_or(ImageState::Undefined))
    }

    fn mark_valid(&mut self) -> Result<(), PlatformError> {
        if let Some(e) = self.faults.mark_valid.take() {
            return Err(e);
        }
        self.states.insert(self.running, ImageState::Valid);
        Ok(())
    }

    fn rollback_and_reboot(&mut self) -> Result<(), PlatformError> {
        if let Some(e) = self.faults.rollback.take() {
            return Err(e);
        }
        let previous = self.previous.ok_or(PlatformError::FAIL)?;
        self.states.insert(self.running, ImageState::Invalid);
        self.last_invalid = Some(self.running);
        self.boot = previous;
        self.stats.rollbacks += 1;
        self.restart();
        Ok(())
    }
}

impl Restart for SimDevice {
    fn restart(&mut self) {
        self.stats.restarts += 1;
        self.reboot();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Data(Vec<u8>),
    /// A zero-length read
    Empty,
    Disconnect,
    Fail(i32),
}

/// Replays a fixed sequence of reads; once exhausted it reports a disconnect.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    content_len: usize,
    steps: VecDeque<Step>,
    pub reads: usize,
}

impl ScriptedSource {
    pub fn new(content_len: usize, steps: impl IntoIterator<Item = Step>) -> Self {
        Self { content_len, steps: steps.into_iter().collect(), reads: 0 }
    }

    /// Delivers `image` in reads of at most `chunk` bytes.
    pub fn chunked(image: &[u8], chunk: usize) -> Self {
        Self::new(image.len(), image.chunks(chunk.max(1)).map(|c| Step::Data(c.to_vec())))
    }

    /// Delivers `image` split at the given sizes; leftover bytes form a final read.
    pub fn split(image: &[u8], sizes: &[usize]) -> Self {
        let mut steps = Vec::new();
        let mut rest = image;
        for &size in sizes {
            let (head, tail) = rest.split_at(size.min(rest.len()));
            if !head.is_empty() {
                steps.push(Step::Data(head.to_vec()));
            }
            rest = tail;
        }
        if !rest.is_empty() {
            steps.push(Step::Data(rest.to_vec()));
        }
        Self::new(image.len(), steps)
    }
}

impl ImageSource for ScriptedSource {
    fn content_len(&self) -> usize {
        self.content_len
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError> {
        self.reads += 1;
        match self.steps.pop_front() {
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(Step::Empty) => Ok(0),
            Some(Step::Fail(code)) => Err(RecvError::Failed(code)),
            Some(Step::Disconnect) | None => Err(RecvError::Disconnected),
        }
    }
}
