//! Table addresses
//!
//! `get_address` hands the accessor the active image and marks its descriptor
//! as holding it. While any accessor holds a single-buffered table, or the
//! buffer a double-buffered update would overwrite, activation is deferred.

use tracing::warn;

use crate::buffer::{BufferId, TableData};
use crate::error::{Result, TblError, TblStatus};
use crate::platform::{AppId, EventId};
use crate::registry::Owner;
use crate::resource_id::TblHandle;
use crate::services::{TableServices, TblState};
use crate::transaction::{CallContext, Transaction};

impl TableServices {
    /// Lock and return the active image of the table
    ///
    /// Returns `InfoUpdated` the first time after a new image was activated.
    pub fn get_address(&self, app_id: AppId, handle: TblHandle) -> Result<(TableData, TblStatus)> {
        let mut txn = Transaction::new(self, app_id);
        let result = lock_address(&mut txn, handle);
        if let Err(TblError::NoAccess) = &result {
            txn.add_event(EventId::HandleAccessErr, format!("{} has no access to {}", app_id, handle));
        }
        result
    }

    /// Stop holding the table
    ///
    /// Returns `InfoUpdated` when an activation completed while it was held.
    pub fn release_address(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let result = unlock_address(&mut txn, handle);
        if let Err(TblError::NoAccess) = &result {
            txn.add_event(EventId::HandleAccessErr, format!("{} has no access to {}", app_id, handle));
        }
        result
    }

    /// `get_address` for several tables
    ///
    /// Stops at the first error, releasing the tables already locked.
    pub fn get_addresses(&self, app_id: AppId, handles: &[TblHandle]) -> Result<(Vec<TableData>, TblStatus)> {
        let mut addresses = Vec::with_capacity(handles.len());
        let mut status = TblStatus::Success;
        for (index, handle) in handles.iter().enumerate() {
            match self.get_address(app_id, *handle) {
                Ok((data, got)) => {
                    if got != TblStatus::Success {
                        status = got;
                    }
                    addresses.push(data);
                }
                Err(err) => {
                    for locked in &handles[..index] {
                        if let Err(release_err) = self.release_address(app_id, *locked) {
                            warn!(
                                handle = %locked,
                                error = %release_err,
                                "failed to release table after get_addresses error"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok((addresses, status))
    }

    /// `release_address` for several tables
    ///
    /// Every handle is released; the first error is returned.
    pub fn release_addresses(&self, app_id: AppId, handles: &[TblHandle]) -> Result<TblStatus> {
        let mut status = TblStatus::Success;
        let mut first_err = None;
        for handle in handles {
            match self.release_address(app_id, *handle) {
                Ok(TblStatus::Success) => {}
                Ok(other) => status = other,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }
}

fn lock_address(txn: &mut Transaction<'_>, handle: TblHandle) -> Result<(TableData, TblStatus)> {
    let reg_id = txn.start_from_handle(handle, CallContext::ACCESSOR_APP)?;
    let TblState { registry, handles, .. } = txn.lock();
    let record = registry.get(reg_id).ok_or(TblError::Unregistered)?;
    if record.owner == Owner::NotOwned {
        return Err(TblError::Unregistered);
    }
    let active = record.active.ok_or(TblError::NeverLoaded)?;
    let data = match active {
        BufferId::Local(slot) => record.local(slot).map(|buffer| buffer.data().clone()),
        BufferId::Shared(_) => None,
    }
    .ok_or(TblError::NeverLoaded)?;

    let desc = handles.get_mut(handle).ok_or(TblError::InvalidHandle)?;
    desc.locked = Some(active);
    let status = if std::mem::take(&mut desc.updated) {
        TblStatus::InfoUpdated
    } else {
        TblStatus::Success
    };
    Ok((data, status))
}

fn unlock_address(txn: &mut Transaction<'_>, handle: TblHandle) -> Result<TblStatus> {
    let reg_id = txn.start_from_handle(handle, CallContext::ACCESSOR_APP)?;
    let TblState { registry, handles, .. } = txn.lock();
    let desc = handles.get_mut(handle).ok_or(TblError::InvalidHandle)?;
    desc.locked = None;
    let updated = desc.updated;
    let record = registry.get(reg_id).ok_or(TblError::Unregistered)?;
    if record.owner == Owner::NotOwned {
        return Err(TblError::Unregistered);
    }
    Ok(if updated {
        TblStatus::InfoUpdated
    } else {
        TblStatus::Success
    })
}
