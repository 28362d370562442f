// Update transaction - one firmware transfer from first byte to boot switch
//
// Idle -> AwaitingHeader -> Writing -> Finalizing -> Committed | Written | Aborted

use log::{debug, error, info, warn};
use serde::Serialize;

use super::descriptor::{is_duplicate_of_invalid, AppDescriptor, DESCRIPTOR_PREFIX_LEN};
use super::error::{OtaError, PlatformError};
use super::partition::{log_boot_state, OtaFlash, Partition, PartitionTable};
use super::writer::{hex, HeaderMode, ImageWriter, WriteOutcome};

/// Default transport scratch buffer size
pub const RECV_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Idle,
    AwaitingHeader,
    Writing,
    Finalizing,
    /// Image validated and selected for next boot
    Committed,
    /// Image validated but the boot selection could not be changed
    Written,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// Peer reset or closed the connection
    Disconnected,
    /// Transport-level failure, carries the raw return code
    Failed(i32),
}

/// Incoming firmware body. `recv` blocks until bytes, an error or a close are available.
pub trait ImageSource {
    /// Total length declared for the transfer
    fn content_len(&self) -> usize;

    /// `Ok(0)` means nothing arrived this time; the caller keeps polling.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, RecvError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub header_mode: HeaderMode,
    pub reject_running_version: bool,
    pub recv_buffer_size: usize,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            header_mode: HeaderMode::FirstChunk,
            reject_running_version: false,
            recv_buffer_size: RECV_BUFFER_SIZE,
        }
    }
}

/// Result of a transfer that reached flash validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub state: TxState,
    pub partition: String,
    pub offset: u32,
    pub version: String,
    pub project: String,
    pub bytes: usize,
    pub sha256: String,
    #[serde(skip)]
    pub boot_error: Option<OtaError>,
}

impl UpdateReport {
    pub fn is_committed(&self) -> bool {
        self.state == TxState::Committed
    }

    pub fn write_into(&self, response: &mut serde_json::Map<String, serde_json::Value>) {
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) {
            response.extend(fields);
        }
        let status = if self.is_committed() { "ok" } else { "written" };
        response.insert("status".into(), status.into());
        if let Some(e) = &self.boot_error {
            e.write_into(response);
        }
    }
}

pub struct UpdateTransaction<'p, P: PartitionTable + OtaFlash> {
    platform: &'p mut P,
    policy: UpdatePolicy,
    state: TxState,
    target: Partition,
    declared_len: usize,
    writer: ImageWriter,
    session: Option<P::Handle>,
    candidate: Option<AppDescriptor>,
}

impl<'p, P: PartitionTable + OtaFlash> UpdateTransaction<'p, P> {
    /// Resolves the update slot for a transfer of `declared_len` bytes.
    pub fn begin(platform: &'p mut P, declared_len: usize, policy: UpdatePolicy) -> Result<Self, OtaError> {
        let running = log_boot_state(&*platform);

        let target = match platform.next_update_target() {
            Some(t) if !t.same_region(&running) => t,
            Some(t) => {
                error!("Update target {} is the running partition", t);
                return Err(OtaError::NoUpdatePartition);
            }
            None => {
                error!("No OTA partition available, check the partition table");
                return Err(OtaError::NoUpdatePartition);
            }
        };
        info!(
            "Writing to partition subtype {} at offset 0x{:x}",
            target.kind.subtype(),
            target.offset
        );

        let mut tx = Self {
            platform,
            policy,
            state: TxState::Idle,
            target,
            declared_len,
            writer: ImageWriter::new(policy.header_mode),
            session: None,
            candidate: None,
        };
        tx.state = TxState::AwaitingHeader;
        Ok(tx)
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn target(&self) -> &Partition {
        &self.target
    }

    /// Drives the receive loop until the declared length arrived, the peer
    /// went away or something failed, then finalizes.
    pub fn run<S: ImageSource + ?Sized>(mut self, source: &mut S) -> Result<UpdateReport, OtaError> {
        let mut buf = vec![0u8; self.policy.recv_buffer_size.max(1)];

        while self.writer.received() < self.declared_len {
            match source.recv(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.push_chunk(&buf[..n])?,
                Err(RecvError::Disconnected) => {
                    error!("Connection closed after {} bytes", self.writer.received());
                    break;
                }
                Err(RecvError::Failed(code)) => {
                    error!("Could not receive image (recv returned {})", code);
                    return Err(self.abort(OtaError::Transport(code)));
                }
            }
        }

        self.finish()
    }

    fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        match self.step(chunk) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(e)),
        }
    }

    fn step(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        match self.writer.write_chunk(chunk)? {
            WriteOutcome::Buffered => Ok(()),
            WriteOutcome::HeaderReady(desc) => {
                self.check_version(&desc)?;
                let mut handle = self.open_session()?;
                let forwarded = self.writer.forward_pending(&mut *self.platform, &mut handle);
                self.session = Some(handle);
                forwarded?;
                self.candidate = Some(desc);
                self.state = TxState::Writing;
                Ok(())
            }
            WriteOutcome::Forward => {
                let Some(handle) = self.session.as_mut() else {
                    return Err(OtaError::FlashWrite(PlatformError::FAIL));
                };
                self.writer.forward(&mut *self.platform, handle, chunk)
            }
        }
    }

    fn check_version(&self, candidate: &AppDescriptor) -> Result<(), OtaError> {
        info!("New fw version: {}", candidate.version());

        let running = self.platform.running();
        if let Some(running_desc) = self.platform.description(&running) {
            info!("Running fw version: {}", running_desc.version());
            if self.policy.reject_running_version && running_desc.same_version(candidate) {
                warn!("New version is the same as the running version.");
                return Err(OtaError::AlreadyRunning(candidate.version().into()));
            }
        }

        let invalid = self
            .platform
            .last_invalid()
            .and_then(|p| self.platform.description(&p));
        if let Some(invalid) = &invalid {
            info!("Last invalid fw version: {}", invalid.version());
        }

        if is_duplicate_of_invalid(candidate, invalid.as_ref()) {
            warn!("New version is the same as invalid version.");
            warn!(
                "Tried to launch the fw with {} version, but it failed.",
                candidate.version()
            );
            warn!("The fw has been rolled back to the last version.");
            return Err(OtaError::DuplicateInvalidVersion(candidate.version().into()));
        }
        Ok(())
    }

    fn open_session(&mut self) -> Result<P::Handle, OtaError> {
        match self.platform.begin(&self.target, self.declared_len) {
            Ok(handle) => {
                info!("esp_ota_begin succeeded");
                Ok(handle)
            }
            Err(e) => {
                error!("esp_ota_begin failed ({})", e);
                Err(OtaError::FlashSession(e))
            }
        }
    }

    fn finish(mut self) -> Result<UpdateReport, OtaError> {
        self.state = TxState::Finalizing;
        let received = self.writer.received();
        info!("Total image size received: {} bytes", received);

        if received != self.declared_len {
            error!("Error in receiving complete file");
            return Err(self.abort(OtaError::ShortTransfer { received, expected: self.declared_len }));
        }

        let (Some(handle), Some(candidate)) = (self.session.take(), self.candidate.take()) else {
            return Err(self.abort(OtaError::Framing {
                received: self.writer.pending_len(),
                required: DESCRIPTOR_PREFIX_LEN,
            }));
        };

        if let Err(e) = self.platform.end(handle) {
            self.state = TxState::Aborted;
            if e.is_validate_failed() {
                error!("Image validation failed, image is corrupted");
                return Err(OtaError::ImageCorrupted);
            }
            error!("esp_ota_end failed ({})!", e);
            return Err(OtaError::FlashClose(e));
        }

        let mut report = UpdateReport {
            state: TxState::Written,
            partition: self.target.label.as_str().into(),
            offset: self.target.offset,
            version: candidate.version().into(),
            project: candidate.project_name().into(),
            bytes: self.writer.written(),
            sha256: hex(&self.writer.digest()),
            boot_error: None,
        };
        debug!("Image sha256 {}", report.sha256);

        match self.platform.set_boot_partition(&self.target) {
            Ok(()) => {
                info!("Boot partition set to {}", self.target);
                self.state = TxState::Committed;
            }
            Err(e) => {
                error!("esp_ota_set_boot_partition failed ({})!", e);
                self.state = TxState::Written;
                report.boot_error = Some(OtaError::BootPartition(e));
            }
        }
        report.state = self.state;
        Ok(report)
    }

    /// Releases any open write session and returns the terminal error.
    fn abort(&mut self, err: OtaError) -> OtaError {
        if let Some(handle) = self.session.take() {
            self.platform.abort(handle);
            debug!("Flash session released");
        }
        self.state = TxState::Aborted;
        err
    }
}

impl<P: PartitionTable + OtaFlash> Drop for UpdateTransaction<'_, P> {
    fn drop(&mut self) {
        // Clean up a session left open by an unwinding caller
        if let Some(handle) = self.session.take() {
            self.platform.abort(handle);
        }
    }
}
