//! Table image and registry dump files
//!
//! Reading pulls the whole file into memory, decodes the headers through the
//! codec and hands the remaining bytes back as the encoded payload. Writing
//! truncates or creates the destination and reports whether an existing file
//! was replaced.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::codec::{
    passthru, put_fixed_str, put_u32, FileLayout, StdFileHeader, TableCodec, TableHeader, CONTENT_TYPE_CFE1,
    SUBTYPE_TBL_IMAGE,
};
use crate::config::TblConfig;
use crate::error::{Result, TblError};
use crate::registry::TableInfo;

/// A table image file read from disk
#[derive(Debug, Clone)]
pub struct TableImage {
    /// Standard file header
    pub std_hdr: StdFileHeader,
    /// Table header
    pub tbl_hdr: TableHeader,
    /// Every byte after the headers
    pub payload: Vec<u8>,
}

impl TableImage {
    /// Check the image was built for this spacecraft and processor
    pub fn check_origin(&self, config: &TblConfig) -> Result<()> {
        let spacecraft = self.std_hdr.spacecraft_id;
        if !config.valid_spacecraft_ids.is_empty() && !config.valid_spacecraft_ids.contains(&spacecraft) {
            return Err(TblError::BadSpacecraftId(spacecraft));
        }
        let processor = self.std_hdr.processor_id;
        if !config.valid_processor_ids.is_empty() && !config.valid_processor_ids.contains(&processor) {
            return Err(TblError::BadProcessorId(processor));
        }
        Ok(())
    }
}

/// Read and decode a table image file
pub fn read_table_image(path: &Path, codec: &dyn TableCodec, layout: &FileLayout) -> Result<TableImage> {
    let bytes = fs::read(path)?;
    let (std_hdr, tbl_hdr) = codec.decode_headers(layout, &bytes)?;
    if std_hdr.content_type != CONTENT_TYPE_CFE1 {
        return Err(TblError::BadContentId(std_hdr.content_type));
    }
    if std_hdr.sub_type != SUBTYPE_TBL_IMAGE {
        return Err(TblError::BadSubtypeId(std_hdr.sub_type));
    }
    let payload = bytes[layout.headers_size()..].to_vec();
    Ok(TableImage {
        std_hdr,
        tbl_hdr,
        payload,
    })
}

/// Write a table image file; returns `true` if an existing file was replaced
pub fn write_table_image(
    path: &Path,
    codec: &dyn TableCodec,
    layout: &FileLayout,
    std_hdr: &StdFileHeader,
    tbl_hdr: &TableHeader,
    payload: &[u8],
) -> Result<bool> {
    let existed = path.exists();
    let mut file = File::create(path)?;
    file.write_all(&codec.encode_headers(layout, std_hdr, tbl_hdr))?;
    file.write_all(payload)?;
    file.sync_all()?;
    Ok(existed)
}

/// Bytes of one encoded registry entry
pub fn registry_entry_size(layout: &FileLayout, max_path_len: usize) -> usize {
    // size, crc, file time, update time, flags, users
    4 * 6 + 8 + 4 + layout.table_name_len * 2 + max_path_len
}

/// Encode one registry entry
pub fn encode_registry_entry(out: &mut Vec<u8>, info: &TableInfo, layout: &FileLayout, max_path_len: usize) {
    put_u32(out, info.size as u32);
    put_u32(out, info.crc);
    put_u32(out, info.file_time.seconds);
    put_u32(out, info.file_time.subseconds);
    put_u32(out, info.last_update_time.seconds);
    put_u32(out, info.last_update_time.subseconds);
    out.push(info.loaded_once as u8);
    out.push(info.load_pending as u8);
    out.push(info.critical as u8);
    out.push(0);
    out.extend_from_slice(&info.options.bits().to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    put_u32(out, info.num_users as u32);
    put_fixed_str(out, &info.name, layout.table_name_len);
    let owner = info.owner.map(|app| app.to_string()).unwrap_or_else(|| "--UNOWNED--".to_string());
    put_fixed_str(out, &owner, layout.table_name_len);
    put_fixed_str(out, &info.last_file_loaded, max_path_len);
}

/// Write a registry dump file; returns `true` if an existing file was replaced
pub fn write_registry_dump(
    path: &Path,
    layout: &FileLayout,
    std_hdr: &StdFileHeader,
    entries: &[TableInfo],
    max_path_len: usize,
) -> Result<bool> {
    let existed = path.exists();
    let mut out = Vec::with_capacity(layout.std_header_size() + entries.len() * registry_entry_size(layout, max_path_len));
    passthru::encode_std_header(&mut out, layout, std_hdr);
    for info in entries {
        encode_registry_entry(&mut out, info, layout, max_path_len);
    }
    let mut file = File::create(path)?;
    file.write_all(&out)?;
    file.sync_all()?;
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PassthruCodec, SUBTYPE_TBL_REGISTRY};
    use crate::platform::{AppId, SpacecraftTime};
    use crate::registry::TableOptions;
    use tempfile::tempdir;

    fn image_headers(layout: &FileLayout) -> (StdFileHeader, TableHeader) {
        let mut std_hdr = StdFileHeader::new(SUBTYPE_TBL_IMAGE, layout, "test image");
        std_hdr.spacecraft_id = 0x42;
        std_hdr.processor_id = 1;
        let tbl_hdr = TableHeader {
            reserved: 0,
            offset: 0,
            num_bytes: 4,
            table_name: "A.T".to_string(),
        };
        (std_hdr, tbl_hdr)
    }

    #[test]
    fn test_write_then_read_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.tbl");
        let layout = FileLayout::default();
        let (std_hdr, tbl_hdr) = image_headers(&layout);

        let replaced = write_table_image(&path, &PassthruCodec, &layout, &std_hdr, &tbl_hdr, &[9, 8, 7, 6]).unwrap();
        assert!(!replaced);
        let replaced = write_table_image(&path, &PassthruCodec, &layout, &std_hdr, &tbl_hdr, &[9, 8, 7, 6]).unwrap();
        assert!(replaced);

        let image = read_table_image(&path, &PassthruCodec, &layout).unwrap();
        assert_eq!(image.tbl_hdr.table_name, "A.T");
        assert_eq!(image.payload, vec![9, 8, 7, 6]);
        assert!(image.check_origin(&TblConfig::default()).is_ok());
    }

    #[test]
    fn test_wrong_origin() {
        let layout = FileLayout::default();
        let (mut std_hdr, tbl_hdr) = image_headers(&layout);
        std_hdr.spacecraft_id = 0x99;
        let image = TableImage {
            std_hdr,
            tbl_hdr,
            payload: Vec::new(),
        };
        assert!(matches!(
            image.check_origin(&TblConfig::default()),
            Err(TblError::BadSpacecraftId(0x99))
        ));
    }

    #[test]
    fn test_bad_content_and_subtype() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.tbl");
        let layout = FileLayout::default();
        let (mut std_hdr, tbl_hdr) = image_headers(&layout);

        std_hdr.sub_type = SUBTYPE_TBL_REGISTRY;
        write_table_image(&path, &PassthruCodec, &layout, &std_hdr, &tbl_hdr, &[]).unwrap();
        assert!(matches!(
            read_table_image(&path, &PassthruCodec, &layout),
            Err(TblError::BadSubtypeId(SUBTYPE_TBL_REGISTRY))
        ));

        std_hdr.content_type = 0x1234_5678;
        write_table_image(&path, &PassthruCodec, &layout, &std_hdr, &tbl_hdr, &[]).unwrap();
        assert!(matches!(
            read_table_image(&path, &PassthruCodec, &layout),
            Err(TblError::BadContentId(0x1234_5678))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = read_table_image(&dir.path().join("none.tbl"), &PassthruCodec, &FileLayout::default());
        assert!(matches!(result, Err(TblError::Access(_))));
    }

    #[test]
    fn test_registry_dump_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reg.dat");
        let layout = FileLayout::default();
        let std_hdr = StdFileHeader::new(SUBTYPE_TBL_REGISTRY, &layout, "Table Registry");
        let info = TableInfo {
            name: "A.T".to_string(),
            owner: Some(AppId(1)),
            size: 16,
            num_users: 1,
            crc: 0,
            file_time: SpacecraftTime::default(),
            last_update_time: SpacecraftTime::new(5, 0),
            loaded_once: true,
            load_pending: false,
            options: TableOptions::empty(),
            critical: false,
            last_file_loaded: "/cf/a.tbl".to_string(),
        };
        write_registry_dump(&path, &layout, &std_hdr, &[info.clone(), info], 64).unwrap();
        let len = fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, layout.std_header_size() + 2 * registry_entry_size(&layout, 64));
    }
}
