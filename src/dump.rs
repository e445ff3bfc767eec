//! Dump control queue
//!
//! A dump request snapshots a table image into a staging buffer from the
//! shared pool. Active images of ordinary tables are copied at request time;
//! dump-only tables are copied when their owner next calls `manage` or
//! `dump_to_buffer`. Either way the file itself is written later by the table
//! services task, outside the registry lock.

use std::path::PathBuf;

use crate::buffer::BufferSelect;
use crate::error::{Result, TblError};
use crate::resource_id::{DumpCtrlId, IdSerial, LoadBufferId, RegId, ResourceId};

/// Progress of a dump request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    /// Waiting for the owner to produce the image
    Pending,
    /// Image captured in the staging buffer, file not yet written
    Performed,
}

/// A queued dump request
#[derive(Debug, Clone)]
pub struct DumpControl {
    pub(crate) id: DumpCtrlId,
    pub(crate) reg_id: RegId,
    pub(crate) table_name: String,
    pub(crate) state: DumpState,
    pub(crate) source: BufferSelect,
    pub(crate) staging: LoadBufferId,
    pub(crate) size: usize,
    pub(crate) path: PathBuf,
}

impl DumpControl {
    /// Name of the table being dumped
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Destination file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current state
    pub fn state(&self) -> DumpState {
        self.state
    }
}

/// Everything the writer needs once a performed dump leaves the queue
#[derive(Debug, Clone)]
pub struct DumpJob {
    /// Table name written into the table header
    pub table_name: String,
    /// Destination file
    pub path: PathBuf,
    /// Image captured at snapshot time
    pub image: Vec<u8>,
    /// Which image was captured
    pub source: BufferSelect,
}

/// Fixed-capacity ring of dump requests
#[derive(Debug)]
pub struct DumpQueue {
    slots: Vec<Option<DumpControl>>,
    serial: IdSerial<DumpCtrlId>,
}

impl DumpQueue {
    /// Create an empty queue of `capacity` requests
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            serial: IdSerial::new(),
        }
    }

    /// Reserve a slot; the caller fills it in with [`DumpQueue::insert`]
    pub fn next_id(&mut self) -> Result<DumpCtrlId> {
        let slots = &self.slots;
        self.serial
            .next(slots.len(), |index| slots[index].is_some())
            .ok_or(TblError::DumpQueueFull)
    }

    /// Store a request under its identifier
    pub(crate) fn insert(&mut self, control: DumpControl) {
        let index = control.id.to_index(self.slots.len());
        self.slots[index] = Some(control);
    }

    /// Request named by `id`
    pub fn get(&self, id: DumpCtrlId) -> Option<&DumpControl> {
        self.slots[id.to_index(self.slots.len())]
            .as_ref()
            .filter(|control| control.id == id)
    }

    /// Mutable request named by `id`
    pub fn get_mut(&mut self, id: DumpCtrlId) -> Option<&mut DumpControl> {
        let index = id.to_index(self.slots.len());
        self.slots[index].as_mut().filter(|control| control.id == id)
    }

    /// Free the slot of `id`
    pub fn free(&mut self, id: DumpCtrlId) -> Option<DumpControl> {
        let index = id.to_index(self.slots.len());
        match &self.slots[index] {
            Some(control) if control.id == id => self.slots[index].take(),
            _ => None,
        }
    }

    /// Identifiers of performed requests, oldest first
    pub fn performed(&self) -> Vec<DumpCtrlId> {
        let mut ids: Vec<DumpCtrlId> = self
            .slots
            .iter()
            .flatten()
            .filter(|control| control.state == DumpState::Performed)
            .map(|control| control.id)
            .collect();
        ids.sort_by_key(|id| id.serial());
        ids
    }

    /// Number of requests in the queue
    pub fn in_use(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}
