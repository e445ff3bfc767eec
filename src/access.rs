//! Access descriptors
//!
//! Each open view of a table (the owner's registration, every share, and the
//! table services task's own views) is an access descriptor. The descriptor
//! is reached through its [`TblHandle`] and refers back to its registry record
//! by [`RegId`], so a descriptor whose record has been reclaimed is detected
//! instead of followed.

use crate::buffer::BufferId;
use crate::error::{Result, TblError};
use crate::platform::AppId;
use crate::resource_id::{IdSerial, RegId, ResourceId, TblHandle};

/// One open view of a table
#[derive(Debug, Clone)]
pub struct AccessDescriptor {
    pub(crate) handle: TblHandle,
    pub(crate) app_id: AppId,
    pub(crate) reg_id: RegId,
    /// New image activated since this accessor last read
    pub(crate) updated: bool,
    /// Buffer the accessor holds through `get_address`
    pub(crate) locked: Option<BufferId>,
}

impl AccessDescriptor {
    /// Handle of the descriptor
    pub fn handle(&self) -> TblHandle {
        self.handle
    }

    /// Application holding the descriptor
    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// Registry record the descriptor views
    pub fn reg_id(&self) -> RegId {
        self.reg_id
    }

    /// True while the accessor holds the table address
    pub fn is_locked(&self) -> bool {
        self.locked.is_some()
    }
}

/// Fixed-capacity table of access descriptors
#[derive(Debug)]
pub struct AccessTable {
    slots: Vec<Option<AccessDescriptor>>,
    serial: IdSerial<TblHandle>,
}

impl AccessTable {
    /// Create an empty table of `capacity` descriptors
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            serial: IdSerial::new(),
        }
    }

    /// Allocate a descriptor for `app_id` viewing `reg_id`
    pub fn allocate(&mut self, app_id: AppId, reg_id: RegId, updated: bool) -> Result<TblHandle> {
        let slots = &self.slots;
        let handle = self
            .serial
            .next(slots.len(), |index| slots[index].is_some())
            .ok_or(TblError::HandlesFull)?;
        let index = handle.to_index(self.slots.len());
        self.slots[index] = Some(AccessDescriptor {
            handle,
            app_id,
            reg_id,
            updated,
            locked: None,
        });
        Ok(handle)
    }

    /// Free a descriptor, returning it if the handle was live
    pub fn free(&mut self, handle: TblHandle) -> Option<AccessDescriptor> {
        let index = handle.to_index(self.slots.len());
        match &self.slots[index] {
            Some(desc) if desc.handle == handle => self.slots[index].take(),
            _ => None,
        }
    }

    /// Descriptor named by `handle`
    pub fn get(&self, handle: TblHandle) -> Option<&AccessDescriptor> {
        self.slots[handle.to_index(self.slots.len())]
            .as_ref()
            .filter(|desc| desc.handle == handle)
    }

    /// Mutable descriptor named by `handle`
    pub fn get_mut(&mut self, handle: TblHandle) -> Option<&mut AccessDescriptor> {
        let index = handle.to_index(self.slots.len());
        self.slots[index].as_mut().filter(|desc| desc.handle == handle)
    }

    /// Descriptors in `list` that are live
    pub fn in_list<'a>(&'a self, list: &'a [TblHandle]) -> impl Iterator<Item = &'a AccessDescriptor> + 'a {
        list.iter().filter_map(move |handle| self.get(*handle))
    }

    /// True if any descriptor in `list` holds `buffer`
    pub fn any_locked(&self, list: &[TblHandle], buffer: BufferId) -> bool {
        self.in_list(list).any(|desc| desc.locked == Some(buffer))
    }

    /// True if any descriptor in `list` holds any buffer
    pub fn any_locked_at_all(&self, list: &[TblHandle]) -> bool {
        self.in_list(list).any(|desc| desc.locked.is_some())
    }

    /// Mark every descriptor in `list` as having a new image to read
    pub fn mark_updated(&mut self, list: &[TblHandle]) {
        for handle in list {
            if let Some(desc) = self.get_mut(*handle) {
                desc.updated = true;
            }
        }
    }

    /// Handles held by `app_id`
    pub fn held_by(&self, app_id: AppId) -> Vec<TblHandle> {
        self.slots
            .iter()
            .flatten()
            .filter(|desc| desc.app_id == app_id)
            .map(|desc| desc.handle)
            .collect()
    }

    /// Number of descriptors in use
    pub fn in_use(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut table = AccessTable::new(2);
        let reg = RegId::from_serial(1);
        let a = table.allocate(AppId(1), reg, false).unwrap();
        let b = table.allocate(AppId(2), reg, true).unwrap();
        assert!(matches!(table.allocate(AppId(3), reg, false), Err(TblError::HandlesFull)));

        assert!(table.free(a).is_some());
        assert!(table.free(a).is_none());
        assert!(table.get(a).is_none());
        assert!(table.get(b).unwrap().updated);
        assert_eq!(table.in_use(), 1);
    }

    #[test]
    fn test_lock_queries() {
        let mut table = AccessTable::new(4);
        let reg = RegId::from_serial(1);
        let a = table.allocate(AppId(1), reg, false).unwrap();
        let b = table.allocate(AppId(2), reg, false).unwrap();
        let list = vec![a, b];
        assert!(!table.any_locked_at_all(&list));

        table.get_mut(b).unwrap().locked = Some(BufferId::Local(1));
        assert!(table.any_locked(&list, BufferId::Local(1)));
        assert!(!table.any_locked(&list, BufferId::Local(0)));

        table.mark_updated(&list);
        assert!(table.in_list(&list).all(|desc| desc.updated));
        assert_eq!(table.held_by(AppId(2)), vec![b]);
    }
}
