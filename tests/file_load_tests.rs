//! Tests for loading table images from files and dumping them back

use std::path::PathBuf;
use std::sync::Arc;

use table_services::codec::{
    default_codec, FileLayout, StdFileHeader, TableCodec, TableHeader, SUBTYPE_TBL_IMAGE, SUBTYPE_TBL_REGISTRY,
};
use table_services::file::{read_table_image, write_table_image};
use table_services::platform::{AppRegistry, EventId, RecordingEventSink};
use table_services::{
    AppId, BufferSelect, LoadSource, Platform, TableOptions, TableServices, TblConfig, TblError, TblStatus,
};
use tempfile::{tempdir, TempDir};

const APP: AppId = AppId(1);

struct TestContext {
    temp_dir: TempDir,
    events: Arc<RecordingEventSink>,
    tbl: TableServices,
}

impl TestContext {
    fn new() -> Self {
        Self::with_codec(default_codec())
    }

    fn with_codec(codec: Arc<dyn TableCodec>) -> Self {
        let temp_dir = tempdir().unwrap();
        let apps = Arc::new(AppRegistry::new());
        apps.insert(APP, "App");
        let events = Arc::new(RecordingEventSink::new());
        let platform = Platform::new(apps).with_events(events.clone()).with_codec(codec);
        let tbl = TableServices::new(TblConfig::default(), platform).unwrap();

        Self {
            temp_dir,
            events,
            tbl,
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.temp_dir.path().join(file)
    }

    fn std_header(&self) -> StdFileHeader {
        let config = self.tbl.config();
        let mut std_hdr = StdFileHeader::new(SUBTYPE_TBL_IMAGE, self.tbl.layout(), "Test image");
        std_hdr.spacecraft_id = config.spacecraft_id;
        std_hdr.processor_id = config.processor_id;
        std_hdr.time_seconds = 1000;
        std_hdr
    }

    fn write_raw(&self, file: &str, std_hdr: &StdFileHeader, tbl_hdr: &TableHeader, payload: &[u8]) -> PathBuf {
        let path = self.path(file);
        let codec = self.tbl.platform().codec.clone();
        write_table_image(&path, codec.as_ref(), self.tbl.layout(), std_hdr, tbl_hdr, payload).unwrap();
        path
    }

    fn write_image(&self, file: &str, table: &str, offset: u32, payload: &[u8]) -> PathBuf {
        let tbl_hdr = TableHeader {
            reserved: 0,
            offset,
            num_bytes: payload.len() as u32,
            table_name: table.to_string(),
        };
        self.write_raw(file, &self.std_header(), &tbl_hdr, payload)
    }

    fn active(&self, handle: table_services::TblHandle, size: usize) -> Vec<u8> {
        let (data, _) = self.tbl.get_address(APP, handle).unwrap();
        self.tbl.release_address(APP, handle).unwrap();
        data.to_vec(size)
    }
}

/// A partial image needs a complete first load and overlays only its range
#[test]
fn test_partial_load_rules() {
    let context = TestContext::new();
    let (h, _) = context.tbl.register(APP, "P", 32, TableOptions::empty(), None).unwrap();

    let partial = context.write_image("partial.tbl", "App.P", 4, &[0xEE; 8]);
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&partial)),
        Err(TblError::PartialLoad)
    ));
    assert!(context.events.contains(EventId::LoadErr));

    let full: Vec<u8> = (0..32).collect();
    let full_path = context.write_image("full.tbl", "App.P", 0, &full);
    assert_eq!(context.tbl.load(APP, h, LoadSource::File(&full_path)).unwrap(), TblStatus::Success);
    assert!(context.events.contains(EventId::FileLoadedInf));
    assert_eq!(context.tbl.update(APP, h).unwrap(), TblStatus::Success);

    assert_eq!(
        context.tbl.load(APP, h, LoadSource::File(&partial)).unwrap(),
        TblStatus::WarnPartialLoad
    );
    context.tbl.update(APP, h).unwrap();

    let mut expected = full.clone();
    expected[4..12].fill(0xEE);
    assert_eq!(context.active(h, 32), expected);

    let info = context.tbl.get_info("App.P").unwrap();
    assert!(info.loaded_once);
    assert_eq!(info.last_file_loaded, partial.display().to_string());
    assert_eq!(info.file_time.seconds, 1000);
}

/// A short image starting at offset zero is accepted with a warning
#[test]
fn test_short_file_warning() {
    let context = TestContext::new();
    let (h, _) = context.tbl.register(APP, "S", 32, TableOptions::empty(), None).unwrap();
    context.tbl.load(APP, h, LoadSource::Address(&[1; 32])).unwrap();
    context.tbl.update(APP, h).unwrap();

    let short = context.write_image("short.tbl", "App.S", 0, &[2; 16]);
    assert_eq!(
        context.tbl.load(APP, h, LoadSource::File(&short)).unwrap(),
        TblStatus::WarnShortFile
    );
    context.tbl.update(APP, h).unwrap();

    let active = context.active(h, 32);
    assert_eq!(&active[..16], &[2; 16]);
    assert_eq!(&active[16..], &[1; 16]);
}

/// Every header problem maps to its own error and leaves no load staged
#[test]
fn test_file_header_checks() {
    let context = TestContext::new();
    let (h, _) = context.tbl.register(APP, "H", 16, TableOptions::empty(), None).unwrap();
    let good = TableHeader {
        reserved: 0,
        offset: 0,
        num_bytes: 16,
        table_name: "App.H".to_string(),
    };

    let mut foreign = context.std_header();
    foreign.spacecraft_id = 0x99;
    let path = context.write_raw("foreign.tbl", &foreign, &good, &[0; 16]);
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&path)),
        Err(TblError::BadSpacecraftId(0x99))
    ));

    let mut registry_file = context.std_header();
    registry_file.sub_type = SUBTYPE_TBL_REGISTRY;
    let path = context.write_raw("registry.tbl", &registry_file, &good, &[0; 16]);
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&path)),
        Err(TblError::BadSubtypeId(SUBTYPE_TBL_REGISTRY))
    ));

    let path = context.write_image("other.tbl", "App.Other", 0, &[0; 16]);
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&path)),
        Err(TblError::FileForWrongTable(name)) if name == "App.Other"
    ));

    let path = context.write_image("large.tbl", "App.H", 8, &[0; 16]);
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&path)),
        Err(TblError::FileTooLarge)
    ));

    // Header promises 16 bytes, file carries 10
    let path = context.write_raw("truncated.tbl", &context.std_header(), &good, &[0; 10]);
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&path)),
        Err(TblError::LoadIncomplete)
    ));

    let missing = context.path("missing.tbl");
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&missing)),
        Err(TblError::Access(_))
    ));

    let long = context.path(&"x".repeat(80));
    assert!(matches!(
        context.tbl.load(APP, h, LoadSource::File(&long)),
        Err(TblError::FilenameTooLong)
    ));

    // None of the failures left a load behind
    assert!(!context.tbl.get_info("App.H").unwrap().load_pending);
    let good_path = context.write_raw("good.tbl", &context.std_header(), &good, &[5; 16]);
    assert_eq!(context.tbl.load(APP, h, LoadSource::File(&good_path)).unwrap(), TblStatus::Success);
}

/// A ground load stays staged until an activation request
#[test]
fn test_ground_load_waits_for_activation() {
    let context = TestContext::new();
    let (h, _) = context.tbl.register(APP, "G", 8, TableOptions::empty(), None).unwrap();
    let path = context.write_image("ground.tbl", "App.G", 0, &[7; 8]);

    assert_eq!(context.tbl.load_table_file(&path).unwrap(), TblStatus::Success);
    assert!(context.tbl.get_info("App.G").unwrap().load_pending);
    assert_eq!(context.tbl.manage(APP, h).unwrap(), TblStatus::Success);
    assert!(matches!(context.tbl.get_address(APP, h), Err(TblError::NeverLoaded)));

    assert_eq!(context.tbl.activate_table("App.G").unwrap(), TblStatus::Success);
    assert!(context.events.contains(EventId::LoadPendReqInf));
    assert_eq!(context.tbl.manage(APP, h).unwrap(), TblStatus::InfoUpdated);
    assert_eq!(context.active(h, 8), vec![7; 8]);
    assert!(context.events.contains(EventId::UpdateSuccessInf));
}

/// LOAD of a file naming an unregistered table fails by name
#[test]
fn test_ground_load_unknown_table() {
    let context = TestContext::new();
    let path = context.write_image("nobody.tbl", "App.Nobody", 0, &[0; 4]);
    assert!(matches!(context.tbl.load_table_file(&path), Err(TblError::InvalidName)));
    assert!(context.events.contains(EventId::LoadErr));
}

/// A dump file is a loadable image of the dumped buffer
#[test]
fn test_dump_file_contents() {
    let context = TestContext::new();
    let (h, _) = context.tbl.register(APP, "D", 12, TableOptions::empty(), None).unwrap();
    let image: Vec<u8> = (100..112).collect();
    context.tbl.load(APP, h, LoadSource::Address(&image)).unwrap();
    context.tbl.update(APP, h).unwrap();

    let path = context.path("d.dmp");
    assert_eq!(
        context.tbl.dump_table("App.D", BufferSelect::Active, &path).unwrap(),
        TblStatus::Success
    );
    assert!(!path.exists());
    assert_eq!(context.tbl.write_pending_dumps(), 1);
    assert!(context.events.contains(EventId::WriteDumpInf));

    let codec = context.tbl.platform().codec.clone();
    let dumped = read_table_image(&path, codec.as_ref(), &FileLayout::from(context.tbl.config())).unwrap();
    assert_eq!(dumped.tbl_hdr.table_name, "App.D");
    assert_eq!(dumped.tbl_hdr.offset, 0);
    assert_eq!(dumped.payload, image);
    assert_eq!(dumped.std_hdr.spacecraft_id, context.tbl.config().spacecraft_id);

    // A second dump to the same file replaces it
    context.tbl.dump_table("App.D", BufferSelect::Active, &path).unwrap();
    context.tbl.write_pending_dumps();
    assert!(context.events.contains(EventId::OverwriteDumpInf));

    // The dump loads back as a complete image
    context.tbl.load(APP, h, LoadSource::Address(&[0; 12])).unwrap();
    context.tbl.update(APP, h).unwrap();
    context.tbl.load(APP, h, LoadSource::File(&path)).unwrap();
    context.tbl.update(APP, h).unwrap();
    assert_eq!(context.active(h, 12), image);
}

#[cfg(feature = "eds")]
mod eds {
    use super::*;
    use table_services::codec::{EdsCodec, EdsLayout, EdsScalar};

    fn layout() -> EdsLayout {
        EdsLayout::new()
            .field("mode", EdsScalar::U8)
            .field("limit", EdsScalar::U32)
    }

    /// Packed images are unpacked into the native layout and packed again on dump
    #[test]
    fn test_eds_image_load_and_dump() {
        let codec = Arc::new(EdsCodec::new());
        codec.register_layout("App.E", layout());
        let context = TestContext::with_codec(codec);
        let (h, _) = context.tbl.register(APP, "E", 8, TableOptions::empty(), None).unwrap();

        // mode = 3, limit = 0x01020304, packed big-endian with no padding
        let packed = [3, 1, 2, 3, 4];
        let path = context.write_image("e.tbl", "App.E", 0, &packed);
        context.tbl.load(APP, h, LoadSource::File(&path)).unwrap();
        context.tbl.update(APP, h).unwrap();

        let native = context.active(h, 8);
        assert_eq!(native[0], 3);
        assert_eq!(&native[4..8], &0x0102_0304u32.to_ne_bytes());

        let dump = context.path("e.dmp");
        context.tbl.dump_table("App.E", BufferSelect::Active, &dump).unwrap();
        context.tbl.write_pending_dumps();
        let codec = context.tbl.platform().codec.clone();
        let dumped = read_table_image(&dump, codec.as_ref(), context.tbl.layout()).unwrap();
        assert_eq!(dumped.payload, packed);
        assert_eq!(dumped.tbl_hdr.num_bytes, 5);
    }

    /// Packed images must be complete objects
    #[test]
    fn test_eds_rejects_partial_image() {
        let codec = Arc::new(EdsCodec::new());
        codec.register_layout("App.E", layout());
        let context = TestContext::with_codec(codec);
        let (h, _) = context.tbl.register(APP, "E", 8, TableOptions::empty(), None).unwrap();

        let path = context.write_image("short.tbl", "App.E", 0, &[3, 1, 2]);
        assert!(matches!(
            context.tbl.load(APP, h, LoadSource::File(&path)),
            Err(TblError::Codec(_))
        ));
    }
}
