//! Table registry
//!
//! A fixed-capacity array of registry records keyed by full `App.Tbl` name. A
//! slot is free when it holds no record; a record is only reachable through
//! the [`RegId`] it was created with, so a stale ID never resolves to a newer
//! table that reuses the slot.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::{BufferId, LoadBuffer};
use crate::cds::CdsHandle;
use crate::error::{Result, TblError};
use crate::platform::{AppId, SpacecraftTime, TableNotification};
use crate::resource_id::{DumpCtrlId, IdSerial, RegId, ResourceId, TblHandle, ValResultId};

bitflags! {
    /// Table registration options
    ///
    /// The empty set is a single-buffered, loadable, non-critical table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TableOptions: u16 {
        /// Keep two buffers and swap them on activation
        const DOUBLE_BUFFER = 1 << 0;
        /// Owner produces the contents; images are never loaded
        const DUMP_ONLY = 1 << 1;
        /// Owner supplies the storage (requires `DUMP_ONLY`)
        const USER_DEF_ADDR = 1 << 2;
        /// Mirror the active image into the critical data store
        const CRITICAL = 1 << 3;
    }
}

impl TableOptions {
    /// Reject illegal option combinations
    pub fn check(self) -> Result<()> {
        let illegal = (self.contains(Self::USER_DEF_ADDR)
            && (self.contains(Self::DOUBLE_BUFFER)
                || self.contains(Self::CRITICAL)
                || !self.contains(Self::DUMP_ONLY)))
            || (self.contains(Self::DUMP_ONLY)
                && (self.contains(Self::CRITICAL) || self.contains(Self::DOUBLE_BUFFER)));
        if illegal {
            Err(TblError::InvalidOptions)
        } else {
            Ok(())
        }
    }
}

/// Application-supplied image check; `Err(code)` rejects the image
pub type ValidationFn = Arc<dyn Fn(&[u8]) -> std::result::Result<(), i32> + Send + Sync>;

/// Ownership of a registry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Owned by a registered application
    App(AppId),
    /// Owner unregistered; the record is reclaimed once unused
    NotOwned,
}

/// Name of the source of the active image plus the in-place modification flag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastFileLoaded {
    /// Source file name or address description
    pub name: String,
    /// True when the owner modified the active image in place
    pub modified: bool,
}

impl LastFileLoaded {
    /// Marker appended to modified sources
    pub const MODIFIED_MARKER: &'static str = "(*)";

    /// Render within `max_len` bytes, truncating the name but never the marker
    pub fn render(&self, max_len: usize) -> String {
        if !self.modified {
            return truncate(&self.name, max_len).to_string();
        }
        let room = max_len.saturating_sub(Self::MODIFIED_MARKER.len());
        format!("{}{}", truncate(&self.name, room), Self::MODIFIED_MARKER)
    }
}

fn truncate(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// One registered table
pub struct RegistryRecord {
    pub(crate) reg_id: RegId,
    pub(crate) name: String,
    pub(crate) owner: Owner,
    pub(crate) size: usize,
    pub(crate) options: TableOptions,
    pub(crate) buffers: Vec<LoadBuffer>,
    pub(crate) active: Option<BufferId>,
    pub(crate) prev: Option<BufferId>,
    pub(crate) next: Option<BufferId>,
    pub(crate) update_pending: bool,
    pub(crate) validate_active: Option<ValResultId>,
    pub(crate) validate_inactive: Option<ValResultId>,
    pub(crate) dump_control: Option<DumpCtrlId>,
    pub(crate) validation_fn: Option<ValidationFn>,
    pub(crate) last_update_time: SpacecraftTime,
    pub(crate) last_file_loaded: LastFileLoaded,
    pub(crate) loaded_once: bool,
    pub(crate) access_list: Vec<TblHandle>,
    pub(crate) cds_handle: Option<CdsHandle>,
    pub(crate) notification: Option<TableNotification>,
}

impl RegistryRecord {
    pub(crate) fn new(reg_id: RegId, name: String, owner: AppId, size: usize, options: TableOptions) -> Self {
        Self {
            reg_id,
            name,
            owner: Owner::App(owner),
            size,
            options,
            buffers: Vec::new(),
            active: None,
            prev: None,
            next: None,
            update_pending: false,
            validate_active: None,
            validate_inactive: None,
            dump_control: None,
            validation_fn: None,
            last_update_time: SpacecraftTime::default(),
            last_file_loaded: LastFileLoaded::default(),
            loaded_once: false,
            access_list: Vec::new(),
            cds_handle: None,
            notification: None,
        }
    }

    /// Identifier of the record
    pub fn reg_id(&self) -> RegId {
        self.reg_id
    }

    /// Full `App.Tbl` name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Registration options
    pub fn options(&self) -> TableOptions {
        self.options
    }

    /// Current owner
    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub(crate) fn is_double_buffered(&self) -> bool {
        self.options.contains(TableOptions::DOUBLE_BUFFER)
    }

    pub(crate) fn is_dump_only(&self) -> bool {
        self.options.contains(TableOptions::DUMP_ONLY)
    }

    pub(crate) fn is_critical(&self) -> bool {
        self.options.contains(TableOptions::CRITICAL) && self.cds_handle.is_some()
    }

    pub(crate) fn is_owned_by(&self, app_id: AppId) -> bool {
        self.owner == Owner::App(app_id)
    }

    /// Local buffer that is not active, for double-buffered tables
    pub(crate) fn inactive_slot(&self) -> u8 {
        match self.active {
            Some(BufferId::Local(0)) => 1,
            _ => 0,
        }
    }

    /// Local buffer named by `slot`
    pub(crate) fn local(&self, slot: u8) -> Option<&LoadBuffer> {
        self.buffers.get(slot as usize)
    }

    pub(crate) fn local_mut(&mut self, slot: u8) -> Option<&mut LoadBuffer> {
        self.buffers.get_mut(slot as usize)
    }

    /// Local buffer currently active, if any
    pub(crate) fn active_local(&self) -> Option<&LoadBuffer> {
        match self.active {
            Some(BufferId::Local(slot)) => self.local(slot),
            _ => None,
        }
    }

    /// True when a load is staged or in progress
    pub(crate) fn load_in_progress(&self) -> bool {
        self.next.is_some()
    }

    /// True when a staged image is waiting for the owner to activate it
    pub(crate) fn has_update_pending(&self) -> bool {
        self.next.is_some() && self.update_pending
    }

    /// Bytes of local storage held by the record
    pub(crate) fn local_bytes(&self) -> usize {
        if self.options.contains(TableOptions::USER_DEF_ADDR) {
            0
        } else {
            self.buffers.iter().map(|buffer| buffer.data.len()).sum()
        }
    }
}

impl fmt::Debug for RegistryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryRecord")
            .field("reg_id", &self.reg_id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("size", &self.size)
            .field("options", &self.options)
            .field("active", &self.active)
            .field("next", &self.next)
            .field("update_pending", &self.update_pending)
            .field("loaded_once", &self.loaded_once)
            .field("access_list", &self.access_list)
            .finish()
    }
}

/// Snapshot of a registered table, as reported to callers and telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Full `App.Tbl` name
    pub name: String,
    /// Owning application, `None` once the owner unregistered
    pub owner: Option<AppId>,
    /// Table size in bytes
    pub size: usize,
    /// Number of open handles
    pub num_users: usize,
    /// CRC32 of the active image
    pub crc: u32,
    /// Creation time of the active image's source
    pub file_time: SpacecraftTime,
    /// Time of the last activation
    pub last_update_time: SpacecraftTime,
    /// True once an image has been activated
    pub loaded_once: bool,
    /// True while a load is staged
    pub load_pending: bool,
    /// Registration options
    pub options: TableOptions,
    /// True if the table is mirrored in the critical data store
    pub critical: bool,
    /// Source of the active image, with the modified marker when applicable
    pub last_file_loaded: String,
}

impl TableInfo {
    pub(crate) fn from_record(record: &RegistryRecord, num_users: usize, max_path_len: usize) -> Self {
        let active = record.active_local();
        Self {
            name: record.name.clone(),
            owner: match record.owner {
                Owner::App(app_id) => Some(app_id),
                Owner::NotOwned => None,
            },
            size: record.size,
            num_users,
            crc: active.map(|buffer| buffer.crc).unwrap_or(0),
            file_time: active.map(|buffer| buffer.file_time).unwrap_or_default(),
            last_update_time: record.last_update_time,
            loaded_once: record.loaded_once,
            load_pending: record.load_in_progress(),
            options: record.options,
            critical: record.is_critical(),
            last_file_loaded: record.last_file_loaded.render(max_path_len),
        }
    }
}

/// Fixed-capacity table of registry records
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Option<RegistryRecord>>,
    serial: IdSerial<RegId>,
}

impl Registry {
    /// Create an empty registry of `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            serial: IdSerial::new(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve an identifier for a new record
    pub fn next_id(&mut self) -> Result<RegId> {
        let slots = &self.slots;
        self.serial
            .next(slots.len(), |index| slots[index].is_some())
            .ok_or(TblError::RegistryFull)
    }

    /// Store a record under its identifier
    pub(crate) fn insert(&mut self, record: RegistryRecord) {
        let index = record.reg_id.to_index(self.slots.len());
        self.slots[index] = Some(record);
    }

    /// Remove and return the record named by `id`
    pub(crate) fn remove(&mut self, id: RegId) -> Option<RegistryRecord> {
        let index = id.to_index(self.slots.len());
        match &self.slots[index] {
            Some(record) if record.reg_id == id => self.slots[index].take(),
            _ => None,
        }
    }

    /// Record named by `id`
    pub fn get(&self, id: RegId) -> Option<&RegistryRecord> {
        self.slots[id.to_index(self.slots.len())]
            .as_ref()
            .filter(|record| record.reg_id == id)
    }

    /// Mutable record named by `id`
    pub fn get_mut(&mut self, id: RegId) -> Option<&mut RegistryRecord> {
        let index = id.to_index(self.slots.len());
        self.slots[index].as_mut().filter(|record| record.reg_id == id)
    }

    /// Linear search by full name
    pub fn find_by_name(&self, name: &str) -> Option<RegId> {
        self.iter().find(|record| record.name == name).map(|record| record.reg_id)
    }

    /// All registered records
    pub fn iter(&self) -> impl Iterator<Item = &RegistryRecord> {
        self.slots.iter().flatten()
    }

    /// All registered records, mutably
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegistryRecord> {
        self.slots.iter_mut().flatten()
    }

    /// Number of registered tables
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when no table is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
