//! Pass-through codec
//!
//! Payload bytes go to and from the file unchanged; only the header fields
//! are converted between host and network byte order.

use crate::codec::{
    get_fixed_str, get_u32, put_fixed_str, put_u32, FileLayout, PayloadExtent, StdFileHeader, TableCodec,
    TableHeader,
};
use crate::error::{Result, TblError};

/// Codec that stores payloads as raw table bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthruCodec;

impl TableCodec for PassthruCodec {
    fn name(&self) -> &'static str {
        "passthru"
    }

    fn input_extent(&self, tbl_hdr: &TableHeader) -> Result<PayloadExtent> {
        Ok(PayloadExtent {
            offset: tbl_hdr.offset as usize,
            len: tbl_hdr.num_bytes as usize,
            encoded_len: tbl_hdr.num_bytes as usize,
        })
    }

    fn decode_input_data(&self, _table_name: &str, encoded: &[u8], dest: &mut [u8]) -> Result<()> {
        if encoded.len() != dest.len() {
            return Err(TblError::LoadIncomplete);
        }
        dest.copy_from_slice(encoded);
        Ok(())
    }

    fn encode_output_data(&self, _table_name: &str, native: &[u8]) -> Result<Vec<u8>> {
        Ok(native.to_vec())
    }
}

/// Serialize both headers in network byte order
pub fn encode_headers(layout: &FileLayout, std_hdr: &StdFileHeader, tbl_hdr: &TableHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(layout.headers_size());
    encode_std_header(&mut out, layout, std_hdr);

    put_u32(&mut out, tbl_hdr.reserved);
    put_u32(&mut out, tbl_hdr.offset);
    put_u32(&mut out, tbl_hdr.num_bytes);
    put_fixed_str(&mut out, &tbl_hdr.table_name, layout.table_name_len);
    out
}

/// Append the standard header in network byte order
pub fn encode_std_header(out: &mut Vec<u8>, layout: &FileLayout, std_hdr: &StdFileHeader) {
    put_u32(out, std_hdr.content_type);
    put_u32(out, std_hdr.sub_type);
    put_u32(out, std_hdr.length);
    put_u32(out, std_hdr.spacecraft_id);
    put_u32(out, std_hdr.processor_id);
    put_u32(out, std_hdr.application_id);
    put_u32(out, std_hdr.time_seconds);
    put_u32(out, std_hdr.time_subseconds);
    put_fixed_str(out, &std_hdr.description, layout.description_len);
}

/// Parse both headers, converting from network byte order
pub fn decode_headers(layout: &FileLayout, bytes: &[u8]) -> Result<(StdFileHeader, TableHeader)> {
    let std_size = layout.std_header_size();
    if bytes.len() < std_size {
        return Err(TblError::NoStdHeader);
    }
    let std_hdr = StdFileHeader {
        content_type: get_u32(bytes, 0),
        sub_type: get_u32(bytes, 4),
        length: get_u32(bytes, 8),
        spacecraft_id: get_u32(bytes, 12),
        processor_id: get_u32(bytes, 16),
        application_id: get_u32(bytes, 20),
        time_seconds: get_u32(bytes, 24),
        time_subseconds: get_u32(bytes, 28),
        description: get_fixed_str(&bytes[32..std_size]),
    };

    if bytes.len() < layout.headers_size() {
        return Err(TblError::NoTblHeader);
    }
    let tbl = &bytes[std_size..layout.headers_size()];
    let tbl_hdr = TableHeader {
        reserved: get_u32(tbl, 0),
        offset: get_u32(tbl, 4),
        num_bytes: get_u32(tbl, 8),
        table_name: get_fixed_str(&tbl[12..]),
    };
    Ok((std_hdr, tbl_hdr))
}
