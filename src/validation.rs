//! Validation request queue
//!
//! Ground asks for an image to be validated; the owning application performs
//! the validation the next time it calls `manage`, and the table services task
//! reports the result in housekeeping before the slot is reused.

use crate::buffer::BufferSelect;
use crate::error::{Result, TblError};
use crate::resource_id::{IdSerial, RegId, ResourceId, ValResultId};

/// Progress of a validation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    /// Waiting for the owner to run the validation function
    Pending,
    /// Validation ran; `result` is zero on success
    Performed {
        /// Code returned by the validation function
        result: i32,
        /// CRC of the image that was validated
        crc: u32,
    },
}

/// A queued validation request
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub(crate) id: ValResultId,
    pub(crate) reg_id: RegId,
    pub(crate) table_name: String,
    pub(crate) target: BufferSelect,
    pub(crate) state: ValidationState,
}

impl ValidationRequest {
    /// Name of the table being validated
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Image being validated
    pub fn target(&self) -> BufferSelect {
        self.target
    }

    /// Current state
    pub fn state(&self) -> ValidationState {
        self.state
    }
}

/// Fixed-capacity ring of validation requests
#[derive(Debug)]
pub struct ValidationQueue {
    slots: Vec<Option<ValidationRequest>>,
    serial: IdSerial<ValResultId>,
}

impl ValidationQueue {
    /// Create an empty queue of `capacity` requests
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            serial: IdSerial::new(),
        }
    }

    /// Queue a pending request
    pub fn allocate(&mut self, reg_id: RegId, table_name: &str, target: BufferSelect) -> Result<ValResultId> {
        let slots = &self.slots;
        let id = self
            .serial
            .next(slots.len(), |index| slots[index].is_some())
            .ok_or(TblError::NoBufferAvailable)?;
        let index = id.to_index(self.slots.len());
        self.slots[index] = Some(ValidationRequest {
            id,
            reg_id,
            table_name: table_name.to_string(),
            target,
            state: ValidationState::Pending,
        });
        Ok(id)
    }

    /// Request named by `id`
    pub fn get(&self, id: ValResultId) -> Option<&ValidationRequest> {
        self.slots[id.to_index(self.slots.len())]
            .as_ref()
            .filter(|request| request.id == id)
    }

    /// Mutable request named by `id`
    pub fn get_mut(&mut self, id: ValResultId) -> Option<&mut ValidationRequest> {
        let index = id.to_index(self.slots.len());
        self.slots[index].as_mut().filter(|request| request.id == id)
    }

    /// Free the slot of `id`
    pub fn free(&mut self, id: ValResultId) -> Option<ValidationRequest> {
        let index = id.to_index(self.slots.len());
        match &self.slots[index] {
            Some(request) if request.id == id => self.slots[index].take(),
            _ => None,
        }
    }

    /// Remove and return every performed request, oldest first
    pub fn take_performed(&mut self) -> Vec<ValidationRequest> {
        let mut performed: Vec<ValidationRequest> = Vec::new();
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(request) if matches!(request.state, ValidationState::Performed { .. })) {
                performed.extend(slot.take());
            }
        }
        performed.sort_by_key(|request| request.id.serial());
        performed
    }

    /// Drop every request for `reg_id`
    pub fn cancel_for(&mut self, reg_id: RegId) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(request) if request.reg_id == reg_id) {
                *slot = None;
            }
        }
    }

    /// Number of requests not yet performed
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|request| request.state == ValidationState::Pending)
            .count()
    }
}
