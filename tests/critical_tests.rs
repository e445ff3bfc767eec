//! Critical tables across restarts of table services backed by a file CDS

use std::path::PathBuf;
use std::sync::Arc;

use table_services::cds::{CdsError, MappedCds};
use table_services::platform::{AppRegistry, EventId, ManualClock, RecordingEventSink, SpacecraftTime};
use table_services::{AppId, LoadSource, Platform, TableOptions, TableServices, TblConfig, TblError, TblStatus};
use tempfile::{tempdir, TempDir};

const APP: AppId = AppId(1);

struct TestContext {
    _temp_dir: TempDir,
    cds_path: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = tempdir().unwrap();
        let cds_path = temp_dir.path().join("cds.dat");

        Self {
            _temp_dir: temp_dir,
            cds_path,
        }
    }

    /// Bring up table services as after a processor reset
    fn boot(&self, seconds: u32) -> (TableServices, Arc<RecordingEventSink>) {
        let cds = Arc::new(MappedCds::open(&self.cds_path, 16, 64 * 1024).unwrap());
        let apps = Arc::new(AppRegistry::new());
        apps.insert(APP, "App");
        let events = Arc::new(RecordingEventSink::new());
        let platform = Platform::new(apps)
            .with_events(events.clone())
            .with_clock(Arc::new(ManualClock::new(seconds)))
            .with_cds(cds);
        (TableServices::new(TblConfig::default(), platform).unwrap(), events)
    }
}

/// The last activated image of a critical table survives a restart
#[test]
fn test_warm_restart_recovers_image() {
    let context = TestContext::new();
    let image: Vec<u8> = (10..18).collect();
    {
        let (tbl, _) = context.boot(100);
        let (h, status) = tbl.register(APP, "C", 8, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::Success);
        tbl.load(APP, h, LoadSource::Address(&image)).unwrap();
        tbl.update(APP, h).unwrap();
        assert!(tbl.get_info("App.C").unwrap().critical);
    }

    let (tbl, events) = context.boot(200);
    let (h, status) = tbl.register(APP, "C", 8, TableOptions::CRITICAL, None).unwrap();
    assert_eq!(status, TblStatus::InfoRecoveredTbl);
    assert!(events.contains(EventId::CdsRecoveredInf));

    let (data, status) = tbl.get_address(APP, h).unwrap();
    assert_eq!(status, TblStatus::InfoUpdated);
    assert_eq!(data.to_vec(8), image);
    let info = tbl.get_info("App.C").unwrap();
    assert!(info.loaded_once);
    assert_eq!(info.last_update_time, SpacecraftTime::new(100, 0));
}

/// Changes made in place are mirrored too
#[test]
fn test_modified_image_is_mirrored() {
    let context = TestContext::new();
    {
        let (tbl, _) = context.boot(100);
        let (h, _) = tbl.register(APP, "M", 4, TableOptions::CRITICAL, None).unwrap();
        tbl.load(APP, h, LoadSource::Address(&[1; 4])).unwrap();
        tbl.update(APP, h).unwrap();
        let (data, _) = tbl.get_address(APP, h).unwrap();
        data.write()[..4].copy_from_slice(&[5, 6, 7, 8]);
        tbl.release_address(APP, h).unwrap();
        tbl.modified(APP, h).unwrap();
    }

    let (tbl, _) = context.boot(200);
    let (h, status) = tbl.register(APP, "M", 4, TableOptions::CRITICAL, None).unwrap();
    assert_eq!(status, TblStatus::InfoRecoveredTbl);
    assert_eq!(tbl.get_address(APP, h).unwrap().0.to_vec(4), vec![5, 6, 7, 8]);
    assert!(tbl.get_info("App.M").unwrap().last_file_loaded.ends_with("(*)"));
}

/// A table that was never activated starts empty after a restart
#[test]
fn test_unloaded_table_not_recovered() {
    let context = TestContext::new();
    {
        let (tbl, _) = context.boot(100);
        tbl.register(APP, "E", 4, TableOptions::CRITICAL, None).unwrap();
    }

    let (tbl, _) = context.boot(200);
    let (h, status) = tbl.register(APP, "E", 4, TableOptions::CRITICAL, None).unwrap();
    assert_eq!(status, TblStatus::Success);
    assert!(matches!(tbl.get_address(APP, h), Err(TblError::NeverLoaded)));
}

/// Deleting the block of a table nobody registered stops its recovery
#[test]
fn test_delete_cds_between_restarts() {
    let context = TestContext::new();
    {
        let (tbl, _) = context.boot(100);
        let (h, _) = tbl.register(APP, "D", 4, TableOptions::CRITICAL, None).unwrap();
        tbl.load(APP, h, LoadSource::Address(&[9; 4])).unwrap();
        tbl.update(APP, h).unwrap();
        assert!(matches!(tbl.delete_cds("App.D"), Err(TblError::StillRegistered)));
    }

    {
        let (tbl, events) = context.boot(200);
        assert_eq!(tbl.delete_cds("App.D").unwrap(), TblStatus::Success);
        assert!(events.contains(EventId::CdsDeletedInf));
        assert!(matches!(tbl.delete_cds("App.D"), Err(TblError::NotCritical)));
        assert!(events.contains(EventId::CdsDeleteErr));
    }

    let (tbl, _) = context.boot(300);
    let (_, status) = tbl.register(APP, "D", 4, TableOptions::CRITICAL, None).unwrap();
    assert_eq!(status, TblStatus::Success);
}

/// A directory entry pointing outside the store is dropped instead of recovered
#[test]
fn test_out_of_bounds_entry_not_recovered() {
    let context = TestContext::new();
    {
        let (tbl, _) = context.boot(100);
        let (h, _) = tbl.register(APP, "C", 8, TableOptions::CRITICAL, None).unwrap();
        tbl.load(APP, h, LoadSource::Address(&[3; 8])).unwrap();
        tbl.update(APP, h).unwrap();
    }

    // Directory entries hold a 40 byte name followed by the block offset
    let mut bytes = std::fs::read(&context.cds_path).unwrap();
    let name_at = bytes
        .windows(6)
        .position(|window| window == b"App.C\0")
        .unwrap();
    let offset_at = name_at + 40;
    bytes[offset_at..offset_at + 8].copy_from_slice(&(1u64 << 40).to_le_bytes());
    std::fs::write(&context.cds_path, &bytes).unwrap();

    {
        let (tbl, events) = context.boot(200);
        let (h, status) = tbl.register(APP, "C", 8, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::Success);
        assert!(!events.contains(EventId::CdsRecoveredInf));
        assert!(matches!(tbl.get_address(APP, h), Err(TblError::NeverLoaded)));

        tbl.load(APP, h, LoadSource::Address(&[4; 8])).unwrap();
        tbl.update(APP, h).unwrap();
    }

    let (tbl, _) = context.boot(300);
    let (h, status) = tbl.register(APP, "C", 8, TableOptions::CRITICAL, None).unwrap();
    assert_eq!(status, TblStatus::InfoRecoveredTbl);
    assert_eq!(tbl.get_address(APP, h).unwrap().0.to_vec(8), vec![4; 8]);
}

#[test]
fn test_corrupt_store_file_rejected() {
    let context = TestContext::new();
    std::fs::write(&context.cds_path, [0xA5u8; 16]).unwrap();
    assert!(matches!(
        MappedCds::open(&context.cds_path, 16, 64 * 1024),
        Err(CdsError::Corrupted(_))
    ));
}
