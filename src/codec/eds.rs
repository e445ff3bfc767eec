//! Electronic Data Sheet codec
//!
//! Tables described by an [`EdsLayout`] are stored in files as packed
//! objects: fields in declaration order, big-endian, with no padding. In
//! memory the same table uses the host's natural layout, where each field is
//! aligned to its size and the object is padded to its widest member.
//!
//! Packed images are always complete objects. Tables without a layout are
//! handled exactly like the pass-through codec.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec::{PassthruCodec, PayloadExtent, TableCodec, TableHeader};
use crate::error::{Result, TblError};

/// Scalar field types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdsScalar {
    /// Unsigned 8-bit
    U8,
    /// Signed 8-bit
    I8,
    /// Unsigned 16-bit
    U16,
    /// Signed 16-bit
    I16,
    /// Unsigned 32-bit
    U32,
    /// Signed 32-bit
    I32,
    /// Unsigned 64-bit
    U64,
    /// Signed 64-bit
    I64,
    /// IEEE single
    F32,
    /// IEEE double
    F64,
}

impl EdsScalar {
    /// Size in bytes, which is also the native alignment
    pub fn size(self) -> usize {
        match self {
            EdsScalar::U8 | EdsScalar::I8 => 1,
            EdsScalar::U16 | EdsScalar::I16 => 2,
            EdsScalar::U32 | EdsScalar::I32 | EdsScalar::F32 => 4,
            EdsScalar::U64 | EdsScalar::I64 | EdsScalar::F64 => 8,
        }
    }
}

#[derive(Debug, Clone)]
struct EdsField {
    name: String,
    scalar: EdsScalar,
    count: usize,
}

/// Sizes derived from a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdsDerivedInfo {
    /// Bytes of the in-memory object
    pub native_size: usize,
    /// Bytes of the packed object
    pub packed_size: usize,
}

/// Structure of one table type
#[derive(Debug, Clone, Default)]
pub struct EdsLayout {
    fields: Vec<EdsField>,
}

impl EdsLayout {
    /// Empty layout
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scalar field
    pub fn field(self, name: &str, scalar: EdsScalar) -> Self {
        self.array(name, scalar, 1)
    }

    /// Append a fixed-length array field
    pub fn array(mut self, name: &str, scalar: EdsScalar, count: usize) -> Self {
        self.fields.push(EdsField {
            name: name.to_string(),
            scalar,
            count,
        });
        self
    }

    /// Native byte offset of every element, with its scalar type
    fn native_offsets(&self) -> (Vec<(usize, EdsScalar)>, usize) {
        let mut offsets = Vec::new();
        let mut at: usize = 0;
        let mut widest: usize = 1;
        for field in &self.fields {
            let size = field.scalar.size();
            widest = widest.max(size);
            for _ in 0..field.count {
                at = at.next_multiple_of(size);
                offsets.push((at, field.scalar));
                at += size;
            }
        }
        (offsets, at.next_multiple_of(widest))
    }

    /// Native and packed sizes
    pub fn derived_info(&self) -> EdsDerivedInfo {
        let (_, native_size) = self.native_offsets();
        let packed_size = self
            .fields
            .iter()
            .map(|field| field.scalar.size() * field.count)
            .sum();
        EdsDerivedInfo {
            native_size,
            packed_size,
        }
    }

    /// Pack a native object
    pub fn pack_complete_object(&self, native: &[u8]) -> Result<Vec<u8>> {
        let (offsets, native_size) = self.native_offsets();
        if native.len() < native_size {
            return Err(TblError::Codec(format!(
                "native object is {} bytes, layout needs {}",
                native.len(),
                native_size
            )));
        }
        let mut packed = Vec::with_capacity(self.derived_info().packed_size);
        for (at, scalar) in offsets {
            let mut element = native[at..at + scalar.size()].to_vec();
            to_network_order(&mut element);
            packed.extend_from_slice(&element);
        }
        Ok(packed)
    }

    /// Unpack a packed object into `native`
    pub fn unpack_complete_object(&self, packed: &[u8], native: &mut [u8]) -> Result<()> {
        let info = self.derived_info();
        if packed.len() != info.packed_size || native.len() < info.native_size {
            return Err(TblError::Codec(format!(
                "packed object is {} bytes, layout needs {}",
                packed.len(),
                info.packed_size
            )));
        }
        let (offsets, _) = self.native_offsets();
        native[..info.native_size].fill(0);
        let mut from = 0;
        for (at, scalar) in offsets {
            let size = scalar.size();
            let element = &mut native[at..at + size];
            element.copy_from_slice(&packed[from..from + size]);
            to_network_order(element);
            from += size;
        }
        Ok(())
    }

    /// Field names in declaration order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

/// Reverse an element between host and network order (an involution)
fn to_network_order(element: &mut [u8]) {
    if cfg!(target_endian = "little") {
        element.reverse();
    }
}

/// Codec that packs tables with a registered layout
#[derive(Debug, Default)]
pub struct EdsCodec {
    layouts: RwLock<HashMap<String, EdsLayout>>,
}

impl EdsCodec {
    /// Codec with no layouts
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a layout to the table with full name `table_name`
    pub fn register_layout(&self, table_name: &str, layout: EdsLayout) {
        self.layouts.write().insert(table_name.to_string(), layout);
    }

    /// Sizes of the table's layout, if it has one
    pub fn derived_info(&self, table_name: &str) -> Option<EdsDerivedInfo> {
        self.layouts.read().get(table_name).map(EdsLayout::derived_info)
    }
}

impl TableCodec for EdsCodec {
    fn name(&self) -> &'static str {
        "eds"
    }

    fn input_extent(&self, tbl_hdr: &TableHeader) -> Result<PayloadExtent> {
        let Some(info) = self.derived_info(&tbl_hdr.table_name) else {
            return PassthruCodec.input_extent(tbl_hdr);
        };
        if tbl_hdr.offset != 0 || tbl_hdr.num_bytes as usize != info.packed_size {
            return Err(TblError::Codec(format!(
                "{} images must be complete packed objects of {} bytes",
                tbl_hdr.table_name, info.packed_size
            )));
        }
        Ok(PayloadExtent {
            offset: 0,
            len: info.native_size,
            encoded_len: info.packed_size,
        })
    }

    fn decode_input_data(&self, table_name: &str, encoded: &[u8], dest: &mut [u8]) -> Result<()> {
        match self.layouts.read().get(table_name) {
            Some(layout) => layout.unpack_complete_object(encoded, dest),
            None => PassthruCodec.decode_input_data(table_name, encoded, dest),
        }
    }

    fn encode_output_data(&self, table_name: &str, native: &[u8]) -> Result<Vec<u8>> {
        match self.layouts.read().get(table_name) {
            Some(layout) => layout.pack_complete_object(native),
            None => PassthruCodec.encode_output_data(table_name, native),
        }
    }
}
