// Streaming image writer - holds back the header until the accept/reject decision,
// then forwards every byte to the open flash session

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::descriptor::{extract_descriptor, AppDescriptor, DescriptorError, DESCRIPTOR_PREFIX_LEN};
use super::error::OtaError;
use super::partition::OtaFlash;

/// How the header prefix may arrive before the version check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMode {
    /// The first chunk must contain the whole prefix
    #[default]
    FirstChunk,
    /// Chunks are buffered until the prefix is complete
    Accumulate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Header not complete yet, nothing forwarded
    Buffered,
    /// Enough bytes for the decision; they stay buffered until forwarded
    HeaderReady(AppDescriptor),
    /// Header already accepted, chunk goes straight to flash
    Forward,
}

pub struct ImageWriter {
    mode: HeaderMode,
    pending: Vec<u8>,
    decided: bool,
    received: usize,
    written: usize,
    hasher: Sha256,
}

impl ImageWriter {
    pub fn new(mode: HeaderMode) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            decided: false,
            received: 0,
            written: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn header_decided(&self) -> bool {
        self.decided
    }

    /// Bytes handed in so far, forwarded or not
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Bytes held back waiting for the header decision
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Classifies one chunk from the transport.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<WriteOutcome, OtaError> {
        self.received += chunk.len();

        if self.decided {
            return Ok(WriteOutcome::Forward);
        }

        if self.mode == HeaderMode::FirstChunk && chunk.len() < DESCRIPTOR_PREFIX_LEN {
            return Err(OtaError::Framing { received: chunk.len(), required: DESCRIPTOR_PREFIX_LEN });
        }

        self.pending.extend_from_slice(chunk);
        match extract_descriptor(&self.pending) {
            Ok(desc) => Ok(WriteOutcome::HeaderReady(desc)),
            Err(DescriptorError::InsufficientData { available, required }) => {
                debug!("Header incomplete: {}/{} bytes buffered", available, required);
                Ok(WriteOutcome::Buffered)
            }
            Err(DescriptorError::BadImageMagic(_)) => Err(OtaError::MalformedHeader("bad image magic")),
            Err(DescriptorError::BadDescriptorMagic(_)) => {
                Err(OtaError::MalformedHeader("bad app descriptor magic"))
            }
        }
    }

    /// Marks the header accepted and writes every held-back byte.
    pub fn forward_pending<F: OtaFlash>(&mut self, flash: &mut F, handle: &mut F::Handle) -> Result<(), OtaError> {
        self.decided = true;
        let pending = std::mem::take(&mut self.pending);
        self.forward(flash, handle, &pending)
    }

    pub fn forward<F: OtaFlash>(&mut self, flash: &mut F, handle: &mut F::Handle, data: &[u8]) -> Result<(), OtaError> {
        flash.write(handle, data).map_err(OtaError::FlashWrite)?;
        self.hasher.update(data);
        self.written += data.len();
        debug!("Written image length {}", self.written);
        Ok(())
    }

    /// SHA-256 over everything forwarded to flash.
    pub fn digest(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::error::PlatformError;
    use crate::ota::partition::Partition;
    use crate::ota::sim::firmware_image;

    #[derive(Default)]
    struct RecordingFlash {
        data: Vec<u8>,
        fail: bool,
    }

    impl OtaFlash for RecordingFlash {
        type Handle = ();

        fn begin(&mut self, _: &Partition, _: usize) -> Result<(), PlatformError> {
            Ok(())
        }

        fn write(&mut self, _: &mut (), data: &[u8]) -> Result<(), PlatformError> {
            if self.fail {
                return Err(PlatformError::FAIL);
            }
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn end(&mut self, _: ()) -> Result<(), PlatformError> {
            Ok(())
        }

        fn abort(&mut self, _: ()) {}

        fn set_boot_partition(&mut self, _: &Partition) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    #[test]
    fn test_short_first_chunk_is_framing_error() {
        let image = firmware_image("2.0.0", 1024);
        let mut writer = ImageWriter::new(HeaderMode::FirstChunk);
        let err = writer.write_chunk(&image[..100]).unwrap_err();
        assert_eq!(err, OtaError::Framing { received: 100, required: DESCRIPTOR_PREFIX_LEN });
    }

    #[test]
    fn test_exact_prefix_is_enough() {
        let image = firmware_image("2.0.0", 1024);
        let mut writer = ImageWriter::new(HeaderMode::FirstChunk);
        let outcome = writer.write_chunk(&image[..DESCRIPTOR_PREFIX_LEN]).unwrap();
        assert!(matches!(outcome, WriteOutcome::HeaderReady(d) if d.version() == "2.0.0"));
    }

    #[test]
    fn test_whole_first_chunk_is_forwarded_after_accept() {
        let image = firmware_image("2.0.0", 2048);
        let mut writer = ImageWriter::new(HeaderMode::FirstChunk);
        let mut flash = RecordingFlash::default();

        assert!(matches!(writer.write_chunk(&image[..1024]).unwrap(), WriteOutcome::HeaderReady(_)));
        assert!(flash.data.is_empty());
        writer.forward_pending(&mut flash, &mut ()).unwrap();
        assert_eq!(writer.write_chunk(&image[1024..]).unwrap(), WriteOutcome::Forward);
        writer.forward(&mut flash, &mut (), &image[1024..]).unwrap();

        assert_eq!(flash.data, image);
        assert_eq!(writer.written(), 2048);
        let expected: [u8; 32] = Sha256::digest(&image).into();
        assert_eq!(writer.digest(), expected);
    }

    #[test]
    fn test_accumulate_mode_buffers_small_chunks() {
        let image = firmware_image("2.0.0", 1024);
        let mut writer = ImageWriter::new(HeaderMode::Accumulate);

        assert_eq!(writer.write_chunk(&image[..100]).unwrap(), WriteOutcome::Buffered);
        assert_eq!(writer.write_chunk(&image[100..200]).unwrap(), WriteOutcome::Buffered);
        assert!(matches!(writer.write_chunk(&image[200..300]).unwrap(), WriteOutcome::HeaderReady(_)));
        assert_eq!(writer.pending_len(), 300);
        assert_eq!(writer.received(), 300);
    }

    #[test]
    fn test_bad_magic_is_malformed() {
        let mut image = firmware_image("2.0.0", 1024);
        image[0] = 0x7F;
        let mut writer = ImageWriter::new(HeaderMode::FirstChunk);
        assert!(matches!(writer.write_chunk(&image), Err(OtaError::MalformedHeader(_))));
    }

    #[test]
    fn test_write_failure_maps_to_flash_write_error() {
        let image = firmware_image("2.0.0", 1024);
        let mut writer = ImageWriter::new(HeaderMode::FirstChunk);
        let mut flash = RecordingFlash { fail: true, ..Default::default() };
        writer.write_chunk(&image).unwrap();
        assert_eq!(
            writer.forward_pending(&mut flash, &mut ()),
            Err(OtaError::FlashWrite(PlatformError::FAIL))
        );
        assert_eq!(writer.written(), 0);
    }

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
