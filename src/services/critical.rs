//! Critical tables
//!
//! A critical table mirrors its active image into a CDS block named after the
//! table. The critical-table registry shadow, itself a CDS block, remembers
//! which tables have been activated so a warm restart can restore them at
//! registration.

use tracing::{debug, info, warn};

use crate::buffer::BufferId;
use crate::cds::{CdsHandle, CriticalDataStore, CriticalEntry, CriticalRegistry, CRITICAL_REGISTRY_NAME};
use crate::error::{Result, TblError, TblStatus};
use crate::platform::EventId;
use crate::registry::{LastFileLoaded, RegistryRecord};
use crate::services::{report, TableServices};
use crate::transaction::{Transaction, TxnLog};

/// Register the shadow block, reading it back when it already existed
pub(crate) fn open_critical_registry(cds: &dyn CriticalDataStore, critical: &mut CriticalRegistry) -> Option<CdsHandle> {
    match cds.register(CRITICAL_REGISTRY_NAME, critical.encoded_size()) {
        Ok((handle, true)) => {
            let mut bytes = vec![0u8; critical.encoded_size()];
            match cds.restore(handle, &mut bytes) {
                Ok(()) => {
                    critical.decode(&bytes);
                    info!(entries = critical.iter().count(), "critical table registry recovered");
                }
                Err(err) => warn!(error = %err, "critical table registry unreadable, starting empty"),
            }
            Some(handle)
        }
        Ok((handle, false)) => {
            if let Err(err) = cds.store(handle, &critical.encode()) {
                warn!(error = %err, "failed to initialize critical table registry");
            }
            Some(handle)
        }
        Err(err) => {
            warn!(error = %err, "critical table registry unavailable");
            None
        }
    }
}

impl TableServices {
    /// Attach a newly registered critical table to its CDS block
    ///
    /// Restores the last activated image when the block survived a restart.
    /// Any failure leaves the table registered as an ordinary table and
    /// returns `WarnNotCritical`.
    pub(crate) fn attach_critical(
        &self,
        critical: &mut CriticalRegistry,
        log: &mut TxnLog,
        record: &mut RegistryRecord,
    ) -> TblStatus {
        let Some(cds) = self.platform().cds.as_deref() else {
            debug!(table = %record.name, "no critical data store, table registered as normal");
            return TblStatus::WarnNotCritical;
        };
        if critical.find(&record.name).is_none() && critical.is_full() {
            warn!(table = %record.name, "critical table registry full");
            return TblStatus::WarnNotCritical;
        }
        let (handle, existed) = match cds.register(&record.name, record.size) {
            Ok(registered) => registered,
            Err(err) => {
                warn!(table = %record.name, error = %err, "failed to register CDS block");
                return TblStatus::WarnNotCritical;
            }
        };
        record.cds_handle = Some(handle);

        let mut status = TblStatus::Success;
        let saved = critical.find(&record.name).filter(|entry| entry.loaded_once).cloned();
        if let (true, Some(entry)) = (existed, saved) {
            match restore_critical(cds, handle, record, &entry) {
                Ok(()) => {
                    status = TblStatus::InfoRecoveredTbl;
                    log.add_event(
                        EventId::CdsRecoveredInf,
                        format!("Recovered '{}' from CDS, loaded from '{}'", record.name, entry.last_file),
                    );
                }
                Err(err) => warn!(table = %record.name, error = %err, "failed to recover table from CDS"),
            }
        }

        if status == TblStatus::InfoRecoveredTbl {
            if let Some(entry) = critical.find_mut(&record.name) {
                entry.cds_handle = handle;
            }
        } else {
            critical.insert(CriticalEntry {
                cds_handle: handle,
                name: record.name.clone(),
                loaded_once: false,
                time: Default::default(),
                last_file: String::new(),
            });
        }
        self.store_critical_registry(critical);
        status
    }

    /// Copy the active image of a critical table into its CDS block and
    /// refresh the shadow entry
    ///
    /// A failed store is reported but never undoes the activation.
    pub(crate) fn mirror_critical(&self, critical: &mut CriticalRegistry, log: &mut TxnLog, record: &RegistryRecord) {
        let (Some(cds), Some(handle), Some(active)) =
            (self.platform().cds.as_deref(), record.cds_handle, record.active_local())
        else {
            return;
        };
        let stored = {
            let data = active.data.read();
            cds.store(handle, &data[..record.size.min(data.len())])
        };
        if let Err(err) = stored {
            warn!(table = %record.name, error = %err, "failed to mirror table into CDS");
            log.add_event(
                EventId::CdsMirrorErr,
                format!("Failed to copy '{}' to CDS: {}", record.name, err),
            );
            return;
        }
        if let Some(entry) = critical.find_mut(&record.name) {
            entry.loaded_once = record.loaded_once;
            entry.time = record.last_update_time;
            entry.last_file = record.last_file_loaded.render(self.config().max_path_len);
        }
        self.store_critical_registry(critical);
    }

    /// Write the shadow registry to its CDS block
    pub(crate) fn store_critical_registry(&self, critical: &CriticalRegistry) {
        let (Some(cds), Some(handle)) = (self.platform().cds.as_deref(), self.crit_reg_handle) else {
            return;
        };
        if let Err(err) = cds.store(handle, &critical.encode()) {
            warn!(error = %err, "failed to store critical table registry");
        }
    }

    /// Delete the CDS block of a critical table that is no longer registered
    pub fn delete_cds(&self, full_name: &str) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let result = self.delete_critical_block(&mut txn, full_name);
        report(&mut txn, EventId::CdsDeleteErr, &format!("Delete CDS '{}'", full_name), result)
    }

    fn delete_critical_block(&self, txn: &mut Transaction<'_>, full_name: &str) -> Result<TblStatus> {
        let (state, log) = txn.state_and_log();
        if state.registry.find_by_name(full_name).is_some() {
            return Err(TblError::StillRegistered);
        }
        let cds = self.platform().cds.as_deref().ok_or(TblError::NotCritical)?;
        if state.critical.find(full_name).is_none() {
            return Err(TblError::NotCritical);
        }
        cds.delete(full_name)?;
        state.critical.remove(full_name);
        self.store_critical_registry(&state.critical);
        log.add_event(EventId::CdsDeletedInf, format!("CDS block '{}' deleted", full_name));
        Ok(TblStatus::Success)
    }
}

/// Restore a saved image into the record's first local buffer and make it active
fn restore_critical(
    cds: &dyn CriticalDataStore,
    handle: CdsHandle,
    record: &mut RegistryRecord,
    entry: &CriticalEntry,
) -> Result<()> {
    let size = record.size;
    let buffer = record.local_mut(0).ok_or(TblError::NoBufferAvailable)?;
    {
        let mut data = buffer.data.write();
        let len = size.min(data.len());
        cds.restore(handle, &mut data[..len])?;
    }
    buffer.content_size = size;
    buffer.file_time = entry.time;
    buffer.source = entry.last_file.clone();
    buffer.validated = true;
    buffer.update_crc();

    record.active = Some(BufferId::Local(0));
    record.loaded_once = true;
    record.last_update_time = entry.time;
    record.last_file_loaded = LastFileLoaded {
        name: entry.last_file.clone(),
        modified: false,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cds::MemoryCds;
    use crate::config::TblConfig;
    use crate::platform::{AppId, AppRegistry, Platform, RecordingEventSink};
    use crate::registry::TableOptions;
    use crate::services::LoadSource;
    use std::sync::Arc;

    fn services(cds: Arc<MemoryCds>, config: TblConfig) -> (TableServices, Arc<RecordingEventSink>) {
        let apps = Arc::new(AppRegistry::new());
        apps.insert(AppId(1), "App");
        let events = Arc::new(RecordingEventSink::new());
        let platform = Platform::new(apps).with_events(events.clone()).with_cds(cds);
        (TableServices::new(config, platform).unwrap(), events)
    }

    #[test]
    fn test_critical_registry_full_falls_back() {
        let cds = Arc::new(MemoryCds::new(8));
        let config = TblConfig {
            max_critical_tables: 1,
            ..TblConfig::default()
        };
        let (tbl, _) = services(cds, config);
        let (_, status) = tbl.register(AppId(1), "C1", 4, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::Success);
        let (h, status) = tbl.register(AppId(1), "C2", 4, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::WarnNotCritical);

        // Still usable as an ordinary table
        tbl.load(AppId(1), h, LoadSource::Address(&[1, 2, 3, 4])).unwrap();
        tbl.manage(AppId(1), h).unwrap();
        let info = tbl.get_info("App.C2").unwrap();
        assert!(!info.critical);
        assert!(info.loaded_once);
    }

    #[test]
    fn test_unloaded_critical_table_not_recovered() {
        let cds = Arc::new(MemoryCds::new(8));
        {
            let (tbl, _) = services(cds.clone(), TblConfig::default());
            tbl.register(AppId(1), "C", 4, TableOptions::CRITICAL, None).unwrap();
        }
        let (tbl, _) = services(cds, TblConfig::default());
        let (h, status) = tbl.register(AppId(1), "C", 4, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::Success);
        assert!(matches!(tbl.get_address(AppId(1), h), Err(TblError::NeverLoaded)));
    }

    #[test]
    fn test_corrupt_block_registers_empty() {
        let cds = Arc::new(MemoryCds::new(8));
        {
            let (tbl, _) = services(cds.clone(), TblConfig::default());
            let (h, _) = tbl.register(AppId(1), "C", 4, TableOptions::CRITICAL, None).unwrap();
            tbl.load(AppId(1), h, LoadSource::Address(&[9, 9, 9, 9])).unwrap();
            tbl.manage(AppId(1), h).unwrap();
        }
        assert!(cds.corrupt("App.C"));
        let (tbl, events) = services(cds, TblConfig::default());
        let (h, status) = tbl.register(AppId(1), "C", 4, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::Success);
        assert!(matches!(tbl.get_address(AppId(1), h), Err(TblError::NeverLoaded)));
        assert!(!events.contains(EventId::CdsRecoveredInf));
    }

    #[test]
    fn test_delete_cds() {
        let cds = Arc::new(MemoryCds::new(8));
        let (tbl, events) = services(cds.clone(), TblConfig::default());
        let (h, _) = tbl.register(AppId(1), "C", 4, TableOptions::CRITICAL, None).unwrap();
        assert!(matches!(tbl.delete_cds("App.C"), Err(TblError::StillRegistered)));

        tbl.unregister(AppId(1), h).unwrap();
        assert_eq!(tbl.delete_cds("App.C").unwrap(), TblStatus::Success);
        assert!(!cds.contains("App.C"));
        assert!(matches!(tbl.delete_cds("App.C"), Err(TblError::NotCritical)));
        assert!(events.contains(EventId::CdsDeletedInf));
        assert!(events.contains(EventId::CdsDeleteErr));
    }
}
