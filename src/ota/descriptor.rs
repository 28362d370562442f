//! Application descriptor decoding.
//!
//! An ESP application image starts with a fixed image header, followed by the
//! header of its first segment, whose payload begins with the application
//! descriptor. Every field is read at a declared offset; nothing is read past
//! the slice handed in.

use core::fmt;

pub const IMAGE_HEADER_LEN: usize = 24;
pub const SEGMENT_HEADER_LEN: usize = 8;
pub const APP_DESC_LEN: usize = 256;

/// Bytes that must be available before an image can be accepted or rejected
pub const DESCRIPTOR_PREFIX_LEN: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN + APP_DESC_LEN;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

pub const VERSION_LEN: usize = 32;

// Image header (esp_image_header_t)
const HDR_MAGIC: usize = 0;
const HDR_SEGMENT_COUNT: usize = 1;
const HDR_ENTRY_ADDR: usize = 4;
const HDR_CHIP_ID: usize = 12;
const HDR_HASH_APPENDED: usize = 23;

// First segment header (esp_image_segment_header_t)
const SEG_LOAD_ADDR: usize = IMAGE_HEADER_LEN;
const SEG_DATA_LEN: usize = IMAGE_HEADER_LEN + 4;

// Application descriptor (esp_app_desc_t), relative to its start
const DESC_MAGIC: usize = 0;
const DESC_SECURE_VERSION: usize = 4;
const DESC_VERSION: usize = 16;
const DESC_PROJECT_NAME: usize = 48;
const DESC_TIME: usize = 80;
const DESC_DATE: usize = 96;
const DESC_IDF_VER: usize = 112;
const DESC_ELF_SHA256: usize = 144;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    InsufficientData { available: usize, required: usize },
    BadImageMagic(u8),
    BadDescriptorMagic(u32),
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorError::InsufficientData { available, required } => {
                write!(f, "need {} header bytes, have {}", required, available)
            }
            DescriptorError::BadImageMagic(m) => write!(f, "bad image magic 0x{:02x}", m),
            DescriptorError::BadDescriptorMagic(m) => write!(f, "bad app descriptor magic 0x{:08x}", m),
        }
    }
}

impl std::error::Error for DescriptorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub segment_count: u8,
    pub entry_addr: u32,
    pub chip_id: u16,
    pub hash_appended: bool,
    pub first_segment_load_addr: u32,
    pub first_segment_len: u32,
}

/// Build metadata embedded in a firmware image.
#[derive(Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub secure_version: u32,
    version: [u8; VERSION_LEN],
    project_name: [u8; 32],
    time: [u8; 16],
    date: [u8; 16],
    idf_ver: [u8; 32],
    pub elf_sha256: [u8; 32],
}

impl AppDescriptor {
    /// Descriptor carrying only a version, for partitions whose metadata comes
    /// from the platform rather than from image bytes.
    pub fn with_version(version: &str) -> Self {
        let mut desc = Self {
            secure_version: 0,
            version: [0; VERSION_LEN],
            project_name: [0; 32],
            time: [0; 16],
            date: [0; 16],
            idf_ver: [0; 32],
            elf_sha256: [0; 32],
        };
        copy_str(&mut desc.version, version);
        desc
    }

    /// Builds a descriptor from the raw fixed-width fields of the platform's own struct.
    /// The version field is kept verbatim so it compares equal to the same field read from image bytes.
    pub fn from_raw_fields(secure_version: u32, version: &[u8], project_name: &[u8]) -> Self {
        let mut desc = Self::with_version("");
        desc.secure_version = secure_version;
        let n = version.len().min(VERSION_LEN);
        desc.version[..n].copy_from_slice(&version[..n]);
        copy_bytes(&mut desc.project_name, project_name);
        desc
    }

    /// Full fixed-width version field, NUL padding included
    pub fn version_bytes(&self) -> &[u8; VERSION_LEN] {
        &self.version
    }

    pub fn version(&self) -> &str {
        field_str(&self.version)
    }

    pub fn project_name(&self) -> &str {
        field_str(&self.project_name)
    }

    pub fn build_time(&self) -> &str {
        field_str(&self.time)
    }

    pub fn build_date(&self) -> &str {
        field_str(&self.date)
    }

    pub fn idf_version(&self) -> &str {
        field_str(&self.idf_ver)
    }

    /// True iff both version fields match byte-for-byte over their full width.
    pub fn same_version(&self, other: &AppDescriptor) -> bool {
        self.version == other.version
    }
}

impl fmt::Debug for AppDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppDescriptor")
            .field("version", &self.version())
            .field("project", &self.project_name())
            .field("secure_version", &self.secure_version)
            .field("built", &format_args!("{} {}", self.build_date(), self.build_time()))
            .field("idf", &self.idf_version())
            .finish()
    }
}

/// A candidate that matches the last image to fail its health check must not be flashed again.
pub fn is_duplicate_of_invalid(candidate: &AppDescriptor, last_invalid: Option<&AppDescriptor>) -> bool {
    last_invalid.is_some_and(|invalid| invalid.same_version(candidate))
}

pub fn parse_image_header(bytes: &[u8]) -> Result<ImageHeader, DescriptorError> {
    require(bytes, IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN)?;
    if bytes[HDR_MAGIC] != IMAGE_MAGIC {
        return Err(DescriptorError::BadImageMagic(bytes[HDR_MAGIC]));
    }

    Ok(ImageHeader {
        segment_count: bytes[HDR_SEGMENT_COUNT],
        entry_addr: read_u32(bytes, HDR_ENTRY_ADDR),
        chip_id: u16::from_le_bytes([bytes[HDR_CHIP_ID], bytes[HDR_CHIP_ID + 1]]),
        hash_appended: bytes[HDR_HASH_APPENDED] == 1,
        first_segment_load_addr: read_u32(bytes, SEG_LOAD_ADDR),
        first_segment_len: read_u32(bytes, SEG_DATA_LEN),
    })
}

/// Extracts the application descriptor from the start of an image.
pub fn extract_descriptor(bytes: &[u8]) -> Result<AppDescriptor, DescriptorError> {
    require(bytes, DESCRIPTOR_PREFIX_LEN)?;
    parse_image_header(bytes)?;

    let desc = &bytes[IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN..DESCRIPTOR_PREFIX_LEN];
    let magic = read_u32(desc, DESC_MAGIC);
    if magic != APP_DESC_MAGIC {
        return Err(DescriptorError::BadDescriptorMagic(magic));
    }

    let mut out = AppDescriptor::with_version("");
    out.secure_version = read_u32(desc, DESC_SECURE_VERSION);
    out.version.copy_from_slice(&desc[DESC_VERSION..DESC_VERSION + VERSION_LEN]);
    out.project_name.copy_from_slice(&desc[DESC_PROJECT_NAME..DESC_PROJECT_NAME + 32]);
    out.time.copy_from_slice(&desc[DESC_TIME..DESC_TIME + 16]);
    out.date.copy_from_slice(&desc[DESC_DATE..DESC_DATE + 16]);
    out.idf_ver.copy_from_slice(&desc[DESC_IDF_VER..DESC_IDF_VER + 32]);
    out.elf_sha256.copy_from_slice(&desc[DESC_ELF_SHA256..DESC_ELF_SHA256 + 32]);
    Ok(out)
}

/// Serializes the header prefix of an image; the inverse of [`extract_descriptor`].
pub fn encode_prefix(desc: &AppDescriptor, segment_len: u32) -> [u8; DESCRIPTOR_PREFIX_LEN] {
    let mut out = [0u8; DESCRIPTOR_PREFIX_LEN];
    out[HDR_MAGIC] = IMAGE_MAGIC;
    out[HDR_SEGMENT_COUNT] = 1;
    out[HDR_ENTRY_ADDR..HDR_ENTRY_ADDR + 4].copy_from_slice(&0x4037_5000u32.to_le_bytes());
    out[SEG_LOAD_ADDR..SEG_LOAD_ADDR + 4].copy_from_slice(&0x3C02_0020u32.to_le_bytes());
    out[SEG_DATA_LEN..SEG_DATA_LEN + 4].copy_from_slice(&segment_len.to_le_bytes());

    let d = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;
    out[d + DESC_MAGIC..d + DESC_MAGIC + 4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
    out[d + DESC_SECURE_VERSION..d + DESC_SECURE_VERSION + 4]
        .copy_from_slice(&desc.secure_version.to_le_bytes());
    out[d + DESC_VERSION..d + DESC_VERSION + VERSION_LEN].copy_from_slice(&desc.version);
    out[d + DESC_PROJECT_NAME..d + DESC_PROJECT_NAME + 32].copy_from_slice(&desc.project_name);
    out[d + DESC_TIME..d + DESC_TIME + 16].copy_from_slice(&desc.time);
    out[d + DESC_DATE..d + DESC_DATE + 16].copy_from_slice(&desc.date);
    out[d + DESC_IDF_VER..d + DESC_IDF_VER + 32].copy_from_slice(&desc.idf_ver);
    out[d + DESC_ELF_SHA256..d + DESC_ELF_SHA256 + 32].copy_from_slice(&desc.elf_sha256);
    out
}

fn require(bytes: &[u8], required: usize) -> Result<(), DescriptorError> {
    if bytes.len() < required {
        return Err(DescriptorError::InsufficientData { available: bytes.len(), required });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

// NUL-terminated C field; invalid UTF-8 is cut at the first bad byte
fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    match core::str::from_utf8(&field[..end]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&field[..e.valid_up_to()]).unwrap_or_default(),
    }
}

fn copy_str(dst: &mut [u8], src: &str) {
    copy_bytes(dst, src.as_bytes());
}

// Always leaves room for a terminating NUL
fn copy_bytes(dst: &mut [u8], src: &[u8]) {
    let src = &src[..src.iter().position(|&b| b == 0).unwrap_or(src.len())];
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0);
}
