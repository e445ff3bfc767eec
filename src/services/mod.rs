//! Table services API
//!
//! [`TableServices`] owns every table services structure behind one registry
//! mutex and exposes the operations applications and the table services task
//! call. Each operation runs inside a [`Transaction`], which resolves the
//! target table, checks the caller's role, and delivers events after the
//! mutex is released.
//!
//! The operations are split by concern:
//!
//! - this module: construction, registration, sharing, ownership, queries
//! - `load`: loading, validation, activation and `manage`
//! - `address`: `get_address` and `release_address`
//! - `dump`: dump requests and the dump file writer
//! - `critical`: CDS mirroring, recovery and deletion

mod address;
mod critical;
mod dump;
mod load;

use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::access::AccessTable;
use crate::buffer::{BufferId, BufferPool, LoadBuffer, MemPool, TableData};
use crate::cds::{CdsHandle, CriticalRegistry};
use crate::codec::FileLayout;
use crate::config::{MsgId, TblConfig};
use crate::dump::{DumpQueue, DumpState};
use crate::error::{Result, TblError, TblStatus};
use crate::platform::{AppId, EventId, OutboundMessage, Platform, SpacecraftTime, TableNotification};
use crate::registry::{
    LastFileLoaded, Owner, Registry, RegistryRecord, TableInfo, TableOptions, ValidationFn,
};
use crate::resource_id::{RegId, TblHandle};
use crate::transaction::{CallContext, Transaction, TxnLog};
use crate::validation::{ValidationQueue, ValidationRequest};

/// Where a load takes its image from
#[derive(Debug, Clone, Copy)]
pub enum LoadSource<'s> {
    /// A table image file
    File(&'s Path),
    /// Raw table bytes in memory, at least the table size
    Address(&'s [u8]),
}

/// Most recent activation of any table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastUpdate {
    /// Record that was activated
    pub reg_id: RegId,
    /// Its full name
    pub table_name: String,
    /// Activation time
    pub time: SpacecraftTime,
}

/// Counts reported in housekeeping telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    /// Registered tables
    pub num_tables: usize,
    /// Tables with a staged image waiting for activation
    pub num_load_pending: usize,
    /// Free shared load buffers
    pub free_shared_buffers: usize,
    /// Validation requests not yet performed
    pub pending_validations: usize,
    /// Dump requests in the queue
    pub pending_dumps: usize,
    /// Most recent activation
    pub last_update: Option<LastUpdate>,
}

/// Everything guarded by the registry mutex
#[derive(Debug)]
pub(crate) struct TblState {
    pub(crate) registry: Registry,
    pub(crate) handles: AccessTable,
    pub(crate) pool: BufferPool,
    pub(crate) validations: ValidationQueue,
    pub(crate) dumps: DumpQueue,
    pub(crate) critical: CriticalRegistry,
    pub(crate) last_update: Option<LastUpdate>,
}

/// Buffer `id` as seen from `record`
pub(crate) fn buffer_of<'s>(pool: &'s BufferPool, record: &'s RegistryRecord, id: BufferId) -> Option<&'s LoadBuffer> {
    match id {
        BufferId::Shared(shared) if pool.owner(shared) == Some(record.reg_id) => pool.get(shared),
        BufferId::Shared(_) => None,
        BufferId::Local(slot) => record.local(slot),
    }
}

/// Mutable buffer `id` as seen from `record`
pub(crate) fn buffer_of_mut<'s>(
    pool: &'s mut BufferPool,
    record: &'s mut RegistryRecord,
    id: BufferId,
) -> Option<&'s mut LoadBuffer> {
    match id {
        BufferId::Shared(shared) if pool.owner(shared) == Some(record.reg_id) => pool.get_mut(shared),
        BufferId::Shared(_) => None,
        BufferId::Local(slot) => record.local_mut(slot),
    }
}

/// Give a working buffer back: shared buffers return to the pool, local ones are emptied
pub(crate) fn release_buffer(pool: &mut BufferPool, record: &mut RegistryRecord, id: BufferId) {
    match id {
        BufferId::Shared(shared) => pool.release(shared),
        BufferId::Local(slot) => {
            if let Some(buffer) = record.local_mut(slot) {
                buffer.reset();
            }
        }
    }
}

/// Queue the owner's notification message, if one is configured
pub(crate) fn notify_owner(log: &mut TxnLog, record: &RegistryRecord) {
    if let Some(notification) = &record.notification {
        log.queue_message(notification.msg_id, OutboundMessage::Notification(notification.clone()));
    }
}

/// Add a failure event for `result`, naming the operation
pub(crate) fn report<T>(txn: &mut Transaction<'_>, id: EventId, what: &str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        let id = match err {
            TblError::NoAccess => EventId::HandleAccessErr,
            _ => id,
        };
        txn.add_event(id, format!("{} failed: {}", what, err));
    }
    result
}

/// The table services core
pub struct TableServices {
    config: TblConfig,
    layout: FileLayout,
    platform: Platform,
    pub(crate) state: Mutex<TblState>,
    mem_pool: MemPool,
    crit_reg_handle: Option<CdsHandle>,
}

impl std::fmt::Debug for TableServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableServices")
            .field("config", &self.config)
            .field("platform", &self.platform)
            .finish()
    }
}

impl TableServices {
    /// Create the registry, buffer pools and queues, and recover the
    /// critical-table shadow from the CDS if there is one
    ///
    /// An unusable configuration is an `ExternalResourceFail`. CDS read
    /// errors are logged and leave the shadow empty.
    pub fn new(config: TblConfig, platform: Platform) -> Result<Self> {
        config.check().map_err(TblError::ExternalResourceFail)?;

        let layout = FileLayout::from(&config);
        let mut critical =
            CriticalRegistry::new(config.max_critical_tables, config.max_full_name_len, config.max_path_len);
        let crit_reg_handle = platform
            .cds
            .as_deref()
            .and_then(|cds| critical::open_critical_registry(cds, &mut critical));

        let state = TblState {
            registry: Registry::new(config.max_tables),
            handles: AccessTable::new(config.max_handles),
            pool: BufferPool::new(config.max_simultaneous_loads, config.max_table_size()),
            validations: ValidationQueue::new(config.max_validations),
            dumps: DumpQueue::new(config.max_dumps),
            critical,
            last_update: None,
        };

        info!(
            max_tables = config.max_tables,
            shared_buffers = config.max_simultaneous_loads,
            codec = platform.codec.name(),
            cds = platform.cds.is_some(),
            "table services initialized"
        );

        Ok(Self {
            mem_pool: MemPool::new(config.buffer_memory_bytes),
            config,
            layout,
            platform,
            state: Mutex::new(state),
            crit_reg_handle,
        })
    }

    /// Configuration the instance was built with
    pub fn config(&self) -> &TblConfig {
        &self.config
    }

    /// Collaborators the instance was built with
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Header layout of table image files
    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Bytes left in the local buffer memory pool
    pub fn memory_available(&self) -> usize {
        self.mem_pool.available()
    }

    /// Register a table owned by `app_id`
    ///
    /// `name` is the table name without the application prefix. Returns the
    /// owner's handle with `Success`, `WarnDuplicate` when the caller already
    /// registered the table, `InfoRecoveredTbl` when a critical table was
    /// restored from the CDS, or `WarnNotCritical` when a critical table could
    /// not be mirrored.
    pub fn register(
        &self,
        app_id: AppId,
        name: &str,
        size: usize,
        options: TableOptions,
        validation_fn: Option<ValidationFn>,
    ) -> Result<(TblHandle, TblStatus)> {
        let mut txn = Transaction::new(self, app_id);
        let result = self.register_table(&mut txn, name, size, options, validation_fn);
        report(&mut txn, EventId::RegisterErr, &format!("Register '{}'", name), result)
    }

    fn register_table(
        &self,
        txn: &mut Transaction<'_>,
        name: &str,
        size: usize,
        options: TableOptions,
        validation_fn: Option<ValidationFn>,
    ) -> Result<(TblHandle, TblStatus)> {
        if name.is_empty() || name.len() > self.config.max_table_name_len {
            return Err(TblError::InvalidName);
        }
        let max_size = if options.contains(TableOptions::DOUBLE_BUFFER) {
            self.config.max_double_table_size
        } else {
            self.config.max_single_table_size
        };
        if size == 0 || size > max_size {
            return Err(TblError::InvalidSize(size));
        }
        options.check()?;

        // Resolve the application name before the registry is locked
        let app_id = txn.app_id();
        let full_name = format!("{}.{}", txn.app_name(app_id), name);
        if full_name.len() > self.config.max_full_name_len {
            return Err(TblError::InvalidName);
        }

        let (state, log) = txn.state_and_log();
        if let Some(reg_id) = state.registry.find_by_name(&full_name) {
            return register_existing(state, reg_id, app_id, size, options, validation_fn);
        }

        let reg_id = state.registry.next_id()?;
        let handle = state.handles.allocate(app_id, reg_id, false)?;
        let mut record = RegistryRecord::new(reg_id, full_name, app_id, size, options);
        record.validation_fn = validation_fn;

        if !options.contains(TableOptions::USER_DEF_ADDR) {
            let count = if options.contains(TableOptions::DOUBLE_BUFFER) { 2 } else { 1 };
            for _ in 0..count {
                match self.mem_pool.allocate(size) {
                    Ok(data) => record.buffers.push(LoadBuffer::new(data)),
                    Err(err) => {
                        self.mem_pool.free(record.local_bytes());
                        state.handles.free(handle);
                        return Err(err);
                    }
                }
            }
        }

        if options.contains(TableOptions::DUMP_ONLY) && !options.contains(TableOptions::USER_DEF_ADDR) {
            // The owner produces dump-only contents in place
            record.active = Some(BufferId::Local(0));
            record.loaded_once = true;
            if let Some(buffer) = record.local_mut(0) {
                buffer.content_size = size;
                buffer.update_crc();
            }
        }

        let status = if options.contains(TableOptions::CRITICAL) {
            self.attach_critical(&mut state.critical, log, &mut record)
        } else {
            TblStatus::Success
        };

        if let Some(desc) = state.handles.get_mut(handle) {
            desc.updated = status == TblStatus::InfoRecoveredTbl;
        }
        record.access_list.push(handle);
        debug!(table = %record.name, reg = ?reg_id, ?handle, size, ?options, ?status, "table registered");
        state.registry.insert(record);
        Ok((handle, status))
    }

    /// Open another view of the table `full_name` for `app_id`
    pub fn share(&self, app_id: AppId, full_name: &str) -> Result<(TblHandle, TblStatus)> {
        let mut txn = Transaction::new(self, app_id);
        let result = share_table(&mut txn, app_id, full_name);
        report(&mut txn, EventId::ShareErr, &format!("Share '{}'", full_name), result)
    }

    /// Release a handle
    ///
    /// When the owner releases its handle the table becomes unowned; it is
    /// reclaimed once every shared handle and pending dump has gone.
    pub fn unregister(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let result = self.unregister_handle(&mut txn, handle);
        report(&mut txn, EventId::UnregisterErr, "Unregister", result)
    }

    fn unregister_handle(&self, txn: &mut Transaction<'_>, handle: TblHandle) -> Result<TblStatus> {
        let reg_id = txn.start_from_handle(handle, CallContext::ACCESSOR_APP)?;
        let state = txn.lock();
        let Some(desc) = state.handles.free(handle) else {
            return Err(TblError::InvalidHandle);
        };
        let Some(record) = state.registry.get_mut(reg_id) else {
            return Err(TblError::Unregistered);
        };
        record.access_list.retain(|held| *held != handle);
        if record.is_owned_by(desc.app_id) {
            disown(state, reg_id);
        }
        self.try_reclaim(state, reg_id);
        Ok(TblStatus::Success)
    }

    /// Release everything held by an application that is exiting
    ///
    /// Returns the number of handles released.
    pub fn clean_up_app(&self, app_id: AppId) -> usize {
        let mut txn = Transaction::new(self, app_id);
        let state = txn.lock();
        let handles = state.handles.held_by(app_id);
        let mut touched: Vec<RegId> = Vec::new();
        for handle in &handles {
            if let Some(desc) = state.handles.free(*handle) {
                if let Some(record) = state.registry.get_mut(desc.reg_id) {
                    record.access_list.retain(|held| held != handle);
                }
                touched.push(desc.reg_id);
            }
        }
        let owned: Vec<RegId> = state
            .registry
            .iter()
            .filter(|record| record.is_owned_by(app_id))
            .map(|record| record.reg_id)
            .collect();
        for reg_id in owned {
            disown(state, reg_id);
            touched.push(reg_id);
        }
        touched.sort();
        touched.dedup();
        for reg_id in touched {
            self.try_reclaim(state, reg_id);
        }
        debug!(app = %app_id, released = handles.len(), "application cleaned up");
        handles.len()
    }

    /// Free an unowned record nobody uses any more
    pub(crate) fn try_reclaim(&self, state: &mut TblState, reg_id: RegId) -> bool {
        let reclaimable = state
            .registry
            .get(reg_id)
            .map(|record| record.owner == Owner::NotOwned && record.access_list.is_empty() && record.dump_control.is_none())
            .unwrap_or(false);
        if !reclaimable {
            return false;
        }
        let Some(record) = state.registry.remove(reg_id) else {
            return false;
        };
        self.mem_pool.free(record.local_bytes());
        state.pool.release_owned_by(reg_id);
        state.validations.cancel_for(reg_id);
        debug!(table = %record.name, reg = ?reg_id, "table record reclaimed");
        true
    }

    /// Configure the message sent to the owner when ground asks it to
    /// validate, activate or dump the table
    pub fn notify_by_message(
        &self,
        app_id: AppId,
        handle: TblHandle,
        msg_id: MsgId,
        command_code: u16,
        parameter: u32,
    ) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let reg_id = txn.start_from_handle(handle, CallContext::OWNER_APP)?;
        let state = txn.lock();
        let record = state.registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
        record.notification = Some(TableNotification {
            msg_id,
            command_code,
            parameter,
        });
        Ok(TblStatus::Success)
    }

    /// Bind owner-supplied storage to a user-defined-address table
    pub fn set_user_buffer(&self, app_id: AppId, handle: TblHandle, data: TableData) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let reg_id = txn.start_from_handle(handle, CallContext::OWNER_APP)?;
        let now = self.platform.clock.now();
        let state = txn.lock();
        let record = state.registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
        if !record.options.contains(TableOptions::USER_DEF_ADDR) {
            return Err(TblError::InvalidOptions);
        }
        if !record.buffers.is_empty() {
            return Err(TblError::UserBufferBound);
        }
        if data.len() < record.size {
            return Err(TblError::InvalidSize(data.len()));
        }
        let mut buffer = LoadBuffer::new(data);
        buffer.content_size = record.size;
        buffer.file_time = now;
        buffer.source = "user address".to_string();
        buffer.validated = true;
        buffer.update_crc();
        record.buffers.push(buffer);
        record.active = Some(BufferId::Local(0));
        record.loaded_once = true;
        record.last_update_time = now;
        record.last_file_loaded = LastFileLoaded {
            name: "user address".to_string(),
            modified: false,
        };
        let list = record.access_list.clone();
        state.handles.mark_updated(&list);
        Ok(TblStatus::Success)
    }

    /// Snapshot of the table `full_name`
    pub fn get_info(&self, full_name: &str) -> Result<TableInfo> {
        let state = self.state.lock();
        let reg_id = state.registry.find_by_name(full_name).ok_or(TblError::InvalidName)?;
        let record = state.registry.get(reg_id).ok_or(TblError::InvalidName)?;
        Ok(TableInfo::from_record(record, record.access_list.len(), self.config.max_path_len))
    }

    /// Snapshot of every registered table
    pub fn registry_snapshot(&self) -> Vec<TableInfo> {
        let state = self.state.lock();
        state
            .registry
            .iter()
            .map(|record| TableInfo::from_record(record, record.access_list.len(), self.config.max_path_len))
            .collect()
    }

    /// Counts reported in housekeeping
    pub fn counts(&self) -> RegistryCounts {
        let state = self.state.lock();
        RegistryCounts {
            num_tables: state.registry.len(),
            num_load_pending: state.registry.iter().filter(|record| record.has_update_pending()).count(),
            free_shared_buffers: state.pool.free_count(),
            pending_validations: state.validations.pending_count(),
            pending_dumps: state.dumps.in_use(),
            last_update: state.last_update.clone(),
        }
    }

    /// Remove and return every performed validation, oldest first
    pub fn take_validation_results(&self) -> Vec<ValidationRequest> {
        self.state.lock().validations.take_performed()
    }
}

fn register_existing(
    state: &mut TblState,
    reg_id: RegId,
    app_id: AppId,
    size: usize,
    options: TableOptions,
    validation_fn: Option<ValidationFn>,
) -> Result<(TblHandle, TblStatus)> {
    let TblState { registry, handles, .. } = state;
    let record = registry.get_mut(reg_id).ok_or(TblError::InvalidName)?;
    match record.owner {
        Owner::App(owner) if owner != app_id => Err(TblError::DuplicateNotOwned),
        Owner::App(_) => {
            if record.size != size {
                return Err(TblError::DuplicateDiffSize);
            }
            let existing = handles
                .in_list(&record.access_list)
                .find(|desc| desc.app_id == app_id)
                .map(|desc| desc.handle);
            let handle = match existing {
                Some(handle) => handle,
                None => {
                    let handle = handles.allocate(app_id, reg_id, record.loaded_once)?;
                    record.access_list.push(handle);
                    handle
                }
            };
            Ok((handle, TblStatus::WarnDuplicate))
        }
        Owner::NotOwned => {
            // A restarted application takes its table back
            if record.size != size {
                return Err(TblError::DuplicateDiffSize);
            }
            if record.options != options {
                return Err(TblError::InvalidOptions);
            }
            let handle = handles.allocate(app_id, reg_id, record.loaded_once)?;
            record.access_list.push(handle);
            record.owner = Owner::App(app_id);
            record.validation_fn = validation_fn;
            debug!(table = %record.name, app = %app_id, "unowned table adopted");
            Ok((handle, TblStatus::Success))
        }
    }
}

fn share_table(txn: &mut Transaction<'_>, app_id: AppId, full_name: &str) -> Result<(TblHandle, TblStatus)> {
    let reg_id = txn.start_from_name(full_name, CallContext::empty())?;
    let state = txn.lock();
    let TblState { registry, handles, .. } = state;
    let record = registry.get_mut(reg_id).ok_or(TblError::InvalidName)?;
    let handle = handles.allocate(app_id, reg_id, record.loaded_once)?;
    record.access_list.push(handle);
    Ok((handle, TblStatus::Success))
}

/// Mark a record unowned and drop the work only its owner could finish
fn disown(state: &mut TblState, reg_id: RegId) {
    let TblState {
        registry,
        pool,
        validations,
        dumps,
        ..
    } = state;
    let Some(record) = registry.get_mut(reg_id) else {
        return;
    };
    record.owner = Owner::NotOwned;
    record.notification = None;

    if let Some(next) = record.next.take() {
        release_buffer(pool, record, next);
        record.update_pending = false;
    }
    for pending in [record.validate_active.take(), record.validate_inactive.take()].into_iter().flatten() {
        validations.free(pending);
    }
    if let Some(ctrl_id) = record.dump_control {
        if dumps.get(ctrl_id).map(|control| control.state) == Some(DumpState::Pending) {
            if let Some(control) = dumps.free(ctrl_id) {
                pool.release(control.staging);
            }
            record.dump_control = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferSelect;
    use crate::cds::MemoryCds;
    use crate::platform::{AppRegistry, ManualClock, RecordingBus, RecordingEventSink};
    use std::sync::Arc;

    const APP1: AppId = AppId(1);
    const APP2: AppId = AppId(2);

    struct Fixture {
        tbl: TableServices,
        events: Arc<RecordingEventSink>,
        bus: Arc<RecordingBus>,
    }

    fn fixture_with(config: TblConfig, cds: Option<Arc<MemoryCds>>) -> Fixture {
        let apps = Arc::new(AppRegistry::new());
        apps.insert(APP1, "App");
        apps.insert(APP2, "Other");
        let events = Arc::new(RecordingEventSink::new());
        let bus = Arc::new(RecordingBus::new());
        let mut platform = Platform::new(apps)
            .with_clock(Arc::new(ManualClock::new(1000)))
            .with_events(events.clone())
            .with_bus(bus.clone());
        if let Some(cds) = cds {
            platform = platform.with_cds(cds);
        }
        Fixture {
            tbl: TableServices::new(config, platform).unwrap(),
            events,
            bus,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TblConfig::default(), None)
    }

    fn bytes(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_register_load_activate_read() {
        let fx = fixture();
        let (h, status) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        assert_eq!(status, TblStatus::Success);

        let image = bytes(1, 16);
        assert_eq!(fx.tbl.load(APP1, h, LoadSource::Address(&image)).unwrap(), TblStatus::Success);
        assert_eq!(fx.tbl.manage(APP1, h).unwrap(), TblStatus::InfoUpdated);

        let (data, status) = fx.tbl.get_address(APP1, h).unwrap();
        assert_eq!(status, TblStatus::InfoUpdated);
        assert_eq!(data.to_vec(16), image);
        fx.tbl.release_address(APP1, h).unwrap();

        let (data, status) = fx.tbl.get_address(APP1, h).unwrap();
        assert_eq!(status, TblStatus::Success);
        assert_eq!(data.to_vec(16), image);
        assert!(fx.events.contains(EventId::UpdateSuccessInf));
    }

    #[test]
    fn test_double_load_rejected() {
        let fx = fixture();
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        fx.tbl.load(APP1, h, LoadSource::Address(&bytes(1, 16))).unwrap();
        assert!(matches!(
            fx.tbl.load(APP1, h, LoadSource::Address(&bytes(2, 16))),
            Err(TblError::LoadInProgress)
        ));
        fx.tbl.abort_load(APP1, h).unwrap();
        assert_eq!(
            fx.tbl.load(APP1, h, LoadSource::Address(&bytes(2, 16))).unwrap(),
            TblStatus::Success
        );
        assert!(fx.events.contains(EventId::LoadAbortInf));
    }

    #[test]
    fn test_shared_lock_blocks_update() {
        let fx = fixture();
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        fx.tbl.load(APP1, h, LoadSource::Address(&bytes(1, 16))).unwrap();
        fx.tbl.manage(APP1, h).unwrap();

        let (h2, _) = fx.tbl.share(APP2, "App.T").unwrap();
        let (_, status) = fx.tbl.get_address(APP2, h2).unwrap();
        assert_eq!(status, TblStatus::InfoUpdated);

        fx.tbl.load(APP1, h, LoadSource::Address(&bytes(3, 16))).unwrap();
        assert_eq!(fx.tbl.manage(APP1, h).unwrap(), TblStatus::InfoTableLocked);

        fx.tbl.release_address(APP2, h2).unwrap();
        assert_eq!(fx.tbl.manage(APP1, h).unwrap(), TblStatus::InfoUpdated);
        let (data, status) = fx.tbl.get_address(APP2, h2).unwrap();
        assert_eq!(status, TblStatus::InfoUpdated);
        assert_eq!(data.to_vec(16), bytes(3, 16));
    }

    #[test]
    fn test_critical_recovery() {
        let cds = Arc::new(MemoryCds::new(8));
        let image = bytes(0x40, 8);
        {
            let fx = fixture_with(TblConfig::default(), Some(cds.clone()));
            let (h, status) = fx.tbl.register(APP1, "C", 8, TableOptions::CRITICAL, None).unwrap();
            assert_eq!(status, TblStatus::Success);
            fx.tbl.load(APP1, h, LoadSource::Address(&image)).unwrap();
            fx.tbl.manage(APP1, h).unwrap();
        }

        let fx = fixture_with(TblConfig::default(), Some(cds));
        let (h, status) = fx.tbl.register(APP1, "C", 8, TableOptions::CRITICAL, None).unwrap();
        assert_eq!(status, TblStatus::InfoRecoveredTbl);
        let (data, _) = fx.tbl.get_address(APP1, h).unwrap();
        assert_eq!(data.to_vec(8), image);
        assert!(fx.events.contains(EventId::CdsRecoveredInf));
    }

    #[test]
    fn test_stale_handle() {
        let fx = fixture();
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        let before = fx.tbl.memory_available();
        fx.tbl.unregister(APP1, h).unwrap();
        assert!(matches!(fx.tbl.get_address(APP1, h), Err(TblError::InvalidHandle)));
        assert_eq!(fx.tbl.counts().num_tables, 0);
        assert_eq!(fx.tbl.memory_available(), before + 16);
    }

    #[test]
    fn test_register_checks() {
        let fx = fixture();
        let max_name = "N".repeat(fx.tbl.config().max_table_name_len);
        assert!(fx.tbl.register(APP1, &max_name, 4, TableOptions::empty(), None).is_ok());
        let too_long = format!("{}X", max_name);
        assert!(matches!(
            fx.tbl.register(APP1, &too_long, 4, TableOptions::empty(), None),
            Err(TblError::InvalidName)
        ));
        assert!(matches!(
            fx.tbl.register(APP1, "Z", 0, TableOptions::empty(), None),
            Err(TblError::InvalidSize(0))
        ));
        let max = fx.tbl.config().max_single_table_size;
        assert!(fx.tbl.register(APP1, "Max", max, TableOptions::empty(), None).is_ok());
        assert!(matches!(
            fx.tbl.register(APP1, "Big", max + 1, TableOptions::empty(), None),
            Err(TblError::InvalidSize(_))
        ));
        assert!(matches!(
            fx.tbl.register(APP1, "Bad", 4, TableOptions::DUMP_ONLY | TableOptions::CRITICAL, None),
            Err(TblError::InvalidOptions)
        ));
        assert!(fx.events.contains(EventId::RegisterErr));
    }

    #[test]
    fn test_duplicate_registration() {
        let fx = fixture();
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        let (again, status) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        assert_eq!(again, h);
        assert_eq!(status, TblStatus::WarnDuplicate);
        assert!(matches!(
            fx.tbl.register(APP1, "T", 8, TableOptions::empty(), None),
            Err(TblError::DuplicateDiffSize)
        ));
    }

    #[test]
    fn test_unowned_table_survives_shares() {
        let fx = fixture();
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        fx.tbl.load(APP1, h, LoadSource::Address(&bytes(1, 16))).unwrap();
        fx.tbl.manage(APP1, h).unwrap();
        let (h2, _) = fx.tbl.share(APP2, "App.T").unwrap();

        fx.tbl.unregister(APP1, h).unwrap();
        assert_eq!(fx.tbl.counts().num_tables, 1);
        assert!(fx.tbl.get_info("App.T").unwrap().owner.is_none());
        assert!(matches!(fx.tbl.get_address(APP2, h2), Err(TblError::Unregistered)));

        // The owner restarts and takes the table back
        let (h3, status) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        assert_eq!(status, TblStatus::Success);
        let (data, _) = fx.tbl.get_address(APP1, h3).unwrap();
        assert_eq!(data.to_vec(16), bytes(1, 16));

        fx.tbl.unregister(APP1, h3).unwrap();
        fx.tbl.unregister(APP2, h2).unwrap();
        assert_eq!(fx.tbl.counts().num_tables, 0);
    }

    #[test]
    fn test_clean_up_app() {
        let fx = fixture();
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), None).unwrap();
        fx.tbl.load(APP1, h, LoadSource::Address(&bytes(1, 16))).unwrap();
        let free_before = fx.tbl.counts().free_shared_buffers;
        fx.tbl.share(APP1, "App.T").unwrap();

        assert_eq!(fx.tbl.clean_up_app(APP1), 2);
        let counts = fx.tbl.counts();
        assert_eq!(counts.num_tables, 0);
        assert_eq!(counts.free_shared_buffers, free_before + 1);
    }

    #[test]
    fn test_notification_on_activate_request() {
        let fx = fixture();
        let check: ValidationFn = Arc::new(|_: &[u8]| Ok(()));
        let (h, _) = fx.tbl.register(APP1, "T", 16, TableOptions::empty(), Some(check)).unwrap();
        fx.tbl.notify_by_message(APP1, h, 0x1899, 7, 42).unwrap();
        assert!(matches!(
            fx.tbl.notify_by_message(APP2, h, 0x1899, 7, 42),
            Err(TblError::NoAccess)
        ));
        fx.tbl.validate_table("App.T", BufferSelect::Active).unwrap_err();
        fx.tbl.load(APP1, h, LoadSource::Address(&bytes(1, 16))).unwrap();
        fx.tbl.manage(APP1, h).unwrap();
        fx.tbl.validate_table("App.T", BufferSelect::Active).unwrap();
        let sent = fx.bus.take();
        assert_eq!(sent.len(), 1);
        assert!(fx.events.contains(EventId::ValReqMadeInf));
        assert_eq!(
            sent[0],
            (
                0x1899,
                OutboundMessage::Notification(TableNotification {
                    msg_id: 0x1899,
                    command_code: 7,
                    parameter: 42,
                })
            )
        );
    }

    #[test]
    fn test_user_buffer() {
        let fx = fixture();
        let options = TableOptions::DUMP_ONLY | TableOptions::USER_DEF_ADDR;
        let (h, _) = fx.tbl.register(APP1, "U", 8, options, None).unwrap();
        assert!(matches!(fx.tbl.get_address(APP1, h), Err(TblError::NeverLoaded)));

        let storage = TableData::from_vec(bytes(9, 8));
        fx.tbl.set_user_buffer(APP1, h, storage.clone()).unwrap();
        assert!(matches!(
            fx.tbl.set_user_buffer(APP1, h, storage.clone()),
            Err(TblError::UserBufferBound)
        ));
        let (data, _) = fx.tbl.get_address(APP1, h).unwrap();
        assert!(data.same_storage(&storage));
    }
}
