//! Table image codec boundary
//!
//! A table image file is a standard file header, a table header and a
//! payload. This module defines the two headers, their on-disk layout, and
//! the [`TableCodec`] trait through which every file read and write passes.
//! Two back-ends implement the trait:
//!
//! - [`PassthruCodec`] copies payload bytes unchanged and stores header
//!   fields in network byte order
//! - `EdsCodec` (feature `eds`) packs and unpacks payloads of tables that
//!   have an Electronic Data Sheet layout, falling back to pass-through for
//!   tables without one
//!
//! All multi-byte header fields are big-endian on disk.

pub mod passthru;
#[cfg(feature = "eds")]
pub mod eds;

use std::sync::Arc;

use crate::config::TblConfig;
use crate::error::Result;

pub use passthru::PassthruCodec;
#[cfg(feature = "eds")]
pub use eds::{EdsCodec, EdsDerivedInfo, EdsLayout, EdsScalar};

/// Content type of every standard file ("cFE1")
pub const CONTENT_TYPE_CFE1: u32 = 0x6346_4531;

/// Standard header sub-type of a table image
pub const SUBTYPE_TBL_IMAGE: u32 = 8;

/// Standard header sub-type of a table registry dump
pub const SUBTYPE_TBL_REGISTRY: u32 = 9;

/// Fixed-width field sizes of the two headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    /// Bytes of the standard header description field
    pub description_len: usize,
    /// Bytes of the table header name field
    pub table_name_len: usize,
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            description_len: 32,
            table_name_len: 40,
        }
    }
}

impl From<&TblConfig> for FileLayout {
    fn from(config: &TblConfig) -> Self {
        Self {
            description_len: config.file_description_len,
            table_name_len: config.max_full_name_len,
        }
    }
}

impl FileLayout {
    /// Bytes of the standard file header
    pub fn std_header_size(&self) -> usize {
        8 * 4 + self.description_len
    }

    /// Bytes of the table header
    pub fn tbl_header_size(&self) -> usize {
        3 * 4 + self.table_name_len
    }

    /// Bytes of both headers
    pub fn headers_size(&self) -> usize {
        self.std_header_size() + self.tbl_header_size()
    }
}

/// Standard file header common to all framework files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdFileHeader {
    /// Magic identifying a framework file
    pub content_type: u32,
    /// Kind of framework file
    pub sub_type: u32,
    /// Length of this header in bytes
    pub length: u32,
    /// Spacecraft the file was built for
    pub spacecraft_id: u32,
    /// Processor the file was built for
    pub processor_id: u32,
    /// Application that created the file
    pub application_id: u32,
    /// Creation time, seconds
    pub time_seconds: u32,
    /// Creation time, subseconds
    pub time_subseconds: u32,
    /// Free text description
    pub description: String,
}

impl StdFileHeader {
    /// Header for a file of `sub_type` described by `description`
    pub fn new(sub_type: u32, layout: &FileLayout, description: &str) -> Self {
        Self {
            content_type: CONTENT_TYPE_CFE1,
            sub_type,
            length: layout.std_header_size() as u32,
            spacecraft_id: 0,
            processor_id: 0,
            application_id: 0,
            time_seconds: 0,
            time_subseconds: 0,
            description: description.to_string(),
        }
    }
}

/// Header describing the table payload that follows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHeader {
    /// Unused, written as zero
    pub reserved: u32,
    /// Byte offset into the table where the payload lands
    pub offset: u32,
    /// Payload length declared by the file
    pub num_bytes: u32,
    /// Full name of the destination table
    pub table_name: String,
}

/// Where a decoded payload lands and how many file bytes carry it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadExtent {
    /// Destination offset in the table
    pub offset: usize,
    /// Destination length in the table
    pub len: usize,
    /// Bytes of encoded payload in the file
    pub encoded_len: usize,
}

/// Encode and decode table image files
pub trait TableCodec: Send + Sync {
    /// Short name of the back-end
    fn name(&self) -> &'static str;

    /// Serialize both headers
    fn encode_headers(&self, layout: &FileLayout, std_hdr: &StdFileHeader, tbl_hdr: &TableHeader) -> Vec<u8> {
        passthru::encode_headers(layout, std_hdr, tbl_hdr)
    }

    /// Parse both headers from the start of `bytes`
    fn decode_headers(&self, layout: &FileLayout, bytes: &[u8]) -> Result<(StdFileHeader, TableHeader)> {
        passthru::decode_headers(layout, bytes)
    }

    /// Destination range and encoded size of the payload described by `tbl_hdr`
    fn input_extent(&self, tbl_hdr: &TableHeader) -> Result<PayloadExtent>;

    /// Decode `encoded` payload bytes into `dest`
    fn decode_input_data(&self, table_name: &str, encoded: &[u8], dest: &mut [u8]) -> Result<()>;

    /// Encode a table image for a file
    fn encode_output_data(&self, table_name: &str, native: &[u8]) -> Result<Vec<u8>>;
}

/// Codec used when the platform does not choose one
pub fn default_codec() -> Arc<dyn TableCodec> {
    Arc::new(PassthruCodec)
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(raw)
}

/// Write `text` into a NUL-padded field of `width` bytes, keeping a terminator
pub(crate) fn put_fixed_str(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(width.saturating_sub(1));
    out.extend_from_slice(&bytes[..len]);
    out.resize(out.len() + (width - len), 0);
}

/// Read a NUL-padded field
pub(crate) fn get_fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        let layout = FileLayout::default();
        assert_eq!(layout.std_header_size(), 64);
        assert_eq!(layout.tbl_header_size(), 52);
        assert_eq!(layout.headers_size(), 116);
    }

    #[test]
    fn test_fixed_strings() {
        let mut out = Vec::new();
        put_fixed_str(&mut out, "SAMPLE.Table", 8);
        assert_eq!(out.len(), 8);
        assert_eq!(out[7], 0);
        assert_eq!(get_fixed_str(&out), "SAMPLE.");

        out.clear();
        put_fixed_str(&mut out, "A.T", 8);
        assert_eq!(get_fixed_str(&out), "A.T");
    }
}
