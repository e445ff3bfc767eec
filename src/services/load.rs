//! Loading, validation and activation
//!
//! A load stages an image in a working buffer and records it as the table's
//! next buffer. The owner activates it through `update` or `manage`; loads
//! commanded from the ground wait for an explicit activation request before
//! `manage` picks them up.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::buffer::{BufferId, BufferSelect, LoadBuffer};
use crate::dump::DumpState;
use crate::error::{Result, TblError, TblStatus};
use crate::file::{read_table_image, TableImage};
use crate::platform::{AppId, EventId, SpacecraftTime};
use crate::registry::{LastFileLoaded, RegistryRecord};
use crate::resource_id::{RegId, TblHandle};
use crate::services::dump::snapshot_pending_dump;
use crate::services::{
    buffer_of, buffer_of_mut, notify_owner, release_buffer, report, LastUpdate, LoadSource, TableServices, TblState,
};
use crate::transaction::{CallContext, Transaction, TxnLog};
use crate::validation::ValidationState;

/// Result of trying to activate a staged image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateOutcome {
    /// The staged image is now active
    Updated,
    /// An accessor holds a buffer the activation would overwrite
    Locked,
    /// Nothing staged, or not yet released for activation
    NothingPending,
}

/// Image source resolved before the registry is locked
enum Incoming<'s> {
    File { path: &'s Path, image: Result<TableImage> },
    Address(&'s [u8]),
}

/// Image ready to be written into a working buffer
struct Staged {
    offset: usize,
    bytes: Vec<u8>,
    source: String,
    file_time: SpacecraftTime,
    status: TblStatus,
}

impl TableServices {
    /// Stage a new image for the table owned by the caller
    ///
    /// The validation function, if any, runs before the call returns; a
    /// rejected image is discarded and the active image is untouched. The
    /// staged image becomes active at the next `update` or `manage`.
    pub fn load(&self, app_id: AppId, handle: TblHandle, source: LoadSource<'_>) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let result = self.load_owned(&mut txn, handle, source);
        report(&mut txn, EventId::LoadErr, "Load", result)
    }

    fn load_owned(&self, txn: &mut Transaction<'_>, handle: TblHandle, source: LoadSource<'_>) -> Result<TblStatus> {
        // File I/O happens before the registry is locked
        let incoming = match source {
            LoadSource::File(path) => {
                self.check_path(path)?;
                Incoming::File {
                    path,
                    image: read_table_image(path, self.platform().codec.as_ref(), self.layout()),
                }
            }
            LoadSource::Address(bytes) => Incoming::Address(bytes),
        };
        let reg_id = txn.start_from_handle(handle, CallContext::OWNER_APP)?;
        self.stage_load(txn, reg_id, incoming, true)
    }

    /// Stage the image in `path` into the table named in its header
    ///
    /// Used by the LOAD command. The image is validated only when ground asks
    /// for it, and becomes active only after an activation request.
    pub fn load_table_file(&self, path: &Path) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let result = self.load_file_by_name(&mut txn, path);
        report(&mut txn, EventId::LoadErr, &format!("Load from '{}'", path.display()), result)
    }

    fn load_file_by_name(&self, txn: &mut Transaction<'_>, path: &Path) -> Result<TblStatus> {
        self.check_path(path)?;
        let image = read_table_image(path, self.platform().codec.as_ref(), self.layout())?;
        let reg_id = txn.start_from_name(&image.tbl_hdr.table_name, CallContext::empty())?;
        self.stage_load(
            txn,
            reg_id,
            Incoming::File {
                path,
                image: Ok(image),
            },
            false,
        )
    }

    pub(crate) fn check_path(&self, path: &Path) -> Result<()> {
        if path.as_os_str().len() > self.config().max_path_len {
            return Err(TblError::FilenameTooLong);
        }
        Ok(())
    }

    fn stage_load(
        &self,
        txn: &mut Transaction<'_>,
        reg_id: RegId,
        incoming: Incoming<'_>,
        by_owner: bool,
    ) -> Result<TblStatus> {
        let now = self.platform().clock.now();
        let (state, log) = txn.state_and_log();
        let TblState {
            registry, handles, pool, ..
        } = state;
        let record = registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
        if record.is_dump_only() {
            return Err(TblError::DumpOnly);
        }
        if record.load_in_progress() {
            return Err(TblError::LoadInProgress);
        }

        let from_file = matches!(incoming, Incoming::File { .. });
        let staged = self.resolve_image(record, incoming, now)?;

        let working = if record.is_double_buffered() {
            let working = BufferId::Local(record.inactive_slot());
            if handles.any_locked(&record.access_list, working) {
                return Err(TblError::NoBufferAvailable);
            }
            working
        } else {
            BufferId::Shared(pool.acquire(reg_id)?)
        };

        let base = record.active_local().cloned();
        let validation_fn = record.validation_fn.clone();
        let size = record.size;
        let Some(target) = buffer_of_mut(pool, record, working) else {
            return Err(TblError::NoBufferAvailable);
        };
        write_image(target, base.as_ref(), size, &staged);

        let verdict = match (&validation_fn, by_owner) {
            (Some(check), true) => {
                let data = target.data.read();
                check(&data[..size])
            }
            _ => Ok(()),
        };
        if let Err(code) = verdict {
            release_buffer(pool, record, working);
            return Err(TblError::ValidationFailed(code));
        }
        target.validated = by_owner || validation_fn.is_none();

        record.next = Some(working);
        record.update_pending = by_owner;
        if from_file {
            log.add_event(
                EventId::FileLoadedInf,
                format!("Successfully loaded '{}' from '{}'", record.name, staged.source),
            );
        }
        debug!(table = %record.name, buffer = ?working, offset = staged.offset, len = staged.bytes.len(), "image staged");
        Ok(staged.status)
    }

    fn resolve_image(&self, record: &RegistryRecord, incoming: Incoming<'_>, now: SpacecraftTime) -> Result<Staged> {
        match incoming {
            Incoming::File { path, image } => {
                let image = image?;
                image.check_origin(self.config())?;
                if image.tbl_hdr.table_name != record.name {
                    return Err(TblError::FileForWrongTable(image.tbl_hdr.table_name));
                }
                let codec = self.platform().codec.as_ref();
                let extent = codec.input_extent(&image.tbl_hdr)?;
                let fits = extent.offset.checked_add(extent.len).map_or(false, |end| end <= record.size);
                if !fits {
                    return Err(TblError::FileTooLarge);
                }
                if !record.loaded_once && (extent.offset != 0 || extent.len != record.size) {
                    return Err(TblError::PartialLoad);
                }
                if extent.len == 0 {
                    return Err(TblError::ZeroLengthLoad);
                }
                if image.payload.len() != extent.encoded_len {
                    return Err(TblError::LoadIncomplete);
                }
                let mut bytes = vec![0u8; extent.len];
                codec.decode_input_data(&record.name, &image.payload, &mut bytes)?;
                let status = if extent.offset > 0 {
                    TblStatus::WarnPartialLoad
                } else if extent.len < record.size {
                    TblStatus::WarnShortFile
                } else {
                    TblStatus::Success
                };
                Ok(Staged {
                    offset: extent.offset,
                    bytes,
                    source: path.display().to_string(),
                    file_time: SpacecraftTime::new(image.std_hdr.time_seconds, image.std_hdr.time_subseconds),
                    status,
                })
            }
            Incoming::Address(data) => {
                if data.len() < record.size {
                    return Err(TblError::InvalidSize(data.len()));
                }
                Ok(Staged {
                    offset: 0,
                    bytes: data[..record.size].to_vec(),
                    source: format!("Addr {:p}", data.as_ptr()),
                    file_time: now,
                    status: TblStatus::Success,
                })
            }
        }
    }

    /// Discard the image staged for the caller's table
    pub fn abort_load(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let result = txn
            .start_from_handle(handle, CallContext::OWNER_APP)
            .and_then(|reg_id| abort_staged(&mut txn, reg_id));
        report(&mut txn, EventId::LoadAbortErr, "Abort load", result)
    }

    /// Discard the image staged for the table `full_name` (ABORT_LOAD command)
    pub fn abort_table_load(&self, full_name: &str) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let result = txn
            .start_from_name(full_name, CallContext::empty())
            .and_then(|reg_id| abort_staged(&mut txn, reg_id));
        report(&mut txn, EventId::LoadAbortErr, &format!("Abort load of '{}'", full_name), result)
    }

    /// Ask for an image of the table to be validated
    ///
    /// The owner performs the validation at its next `manage`. Tables without
    /// a validation function pass immediately.
    pub fn validate(&self, app_id: AppId, handle: TblHandle, select: BufferSelect) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let result = txn
            .start_from_handle(handle, CallContext::ACCESSOR_APP)
            .and_then(|reg_id| queue_validation(&mut txn, reg_id, select));
        report(&mut txn, EventId::ValidateErr, "Validate", result)
    }

    /// Ask for an image of the table `full_name` to be validated (VALIDATE command)
    pub fn validate_table(&self, full_name: &str, select: BufferSelect) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let result = txn
            .start_from_name(full_name, CallContext::empty())
            .and_then(|reg_id| queue_validation(&mut txn, reg_id, select));
        report(&mut txn, EventId::ValidateErr, &format!("Validate '{}'", full_name), result)
    }

    /// Release a staged image for activation by its owner (ACTIVATE command)
    pub fn activate_table(&self, full_name: &str) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let result = txn
            .start_from_name(full_name, CallContext::empty())
            .and_then(|reg_id| request_activation(&mut txn, reg_id));
        report(&mut txn, EventId::ActivateErr, &format!("Activate '{}'", full_name), result)
    }

    /// Activate the staged image now
    ///
    /// Returns `Success` when the image was activated, `InfoTableLocked` when
    /// an accessor holds the table, or `InfoNoUpdatePending`.
    pub fn update(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let started = txn.start_from_handle(handle, CallContext::OWNER_APP);
        let reg_id = report(&mut txn, EventId::UpdateErr, "Update", started)?;
        let (state, log) = txn.state_and_log();
        Ok(match self.apply_update(state, log, reg_id) {
            UpdateOutcome::Updated => TblStatus::Success,
            UpdateOutcome::Locked => TblStatus::InfoTableLocked,
            UpdateOutcome::NothingPending => TblStatus::InfoNoUpdatePending,
        })
    }

    /// Do everything pending for the table, in order: validations, a pending
    /// dump, then activation
    ///
    /// Owners call this periodically. Returns `InfoUpdated` when a new image
    /// was activated.
    pub fn manage(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let reg_id = txn.start_from_handle(handle, CallContext::OWNER_APP)?;
        let (state, log) = txn.state_and_log();
        perform_validation(state, log, reg_id, BufferSelect::Active);
        perform_validation(state, log, reg_id, BufferSelect::Inactive);
        snapshot_pending_dump(state, reg_id);
        Ok(match self.apply_update(state, log, reg_id) {
            UpdateOutcome::Updated => TblStatus::InfoUpdated,
            UpdateOutcome::Locked => TblStatus::InfoTableLocked,
            UpdateOutcome::NothingPending => TblStatus::Success,
        })
    }

    /// Record that the owner changed the active image in place
    pub fn modified(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let reg_id = txn.start_from_handle(handle, CallContext::OWNER_APP)?;
        let (state, log) = txn.state_and_log();
        let TblState {
            registry,
            handles,
            critical,
            ..
        } = state;
        let record = registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
        let Some(BufferId::Local(slot)) = record.active.filter(|_| record.loaded_once) else {
            return Ok(TblStatus::Success);
        };
        if let Some(active) = record.local_mut(slot) {
            active.update_crc();
        }
        record.last_file_loaded.modified = true;
        handles.mark_updated(&record.access_list);
        if record.is_critical() {
            self.mirror_critical(critical, log, record);
        }
        Ok(TblStatus::Success)
    }

    /// Report pending work for the table without acting on it
    ///
    /// When nothing is pending the accessor's updated flag is reported and
    /// cleared, as `get_address` would.
    pub fn get_status(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let reg_id = txn.start_from_handle(handle, CallContext::ACCESSOR_APP)?;
        let TblState {
            registry, handles, dumps, ..
        } = txn.lock();
        let record = registry.get(reg_id).ok_or(TblError::Unregistered)?;
        if record.validate_active.is_some() || record.validate_inactive.is_some() {
            return Ok(TblStatus::InfoValidationPending);
        }
        if record.has_update_pending() {
            return Ok(TblStatus::InfoUpdatePending);
        }
        let dump_pending = record
            .dump_control
            .and_then(|id| dumps.get(id))
            .map_or(false, |control| control.state() == DumpState::Pending);
        if dump_pending {
            return Ok(TblStatus::InfoDumpPending);
        }
        let desc = handles.get_mut(handle).ok_or(TblError::InvalidHandle)?;
        Ok(if std::mem::take(&mut desc.updated) {
            TblStatus::InfoUpdated
        } else {
            TblStatus::Success
        })
    }

    /// Activate the staged image of `reg_id` if it was released for
    /// activation and no accessor is in the way
    pub(crate) fn apply_update(&self, state: &mut TblState, log: &mut TxnLog, reg_id: RegId) -> UpdateOutcome {
        let now = self.platform().clock.now();
        let TblState {
            registry,
            handles,
            pool,
            validations,
            critical,
            last_update,
            ..
        } = state;
        let Some(record) = registry.get_mut(reg_id) else {
            return UpdateOutcome::NothingPending;
        };
        let Some(next) = record.next.filter(|_| record.update_pending) else {
            return UpdateOutcome::NothingPending;
        };
        let locked = if record.is_double_buffered() {
            handles.any_locked(&record.access_list, next)
        } else {
            handles.any_locked_at_all(&record.access_list)
        };
        if locked {
            debug!(table = %record.name, "update deferred, table locked by an accessor");
            return UpdateOutcome::Locked;
        }

        match next {
            BufferId::Shared(shared) => {
                let Some(staged) = buffer_of(pool, record, next).cloned() else {
                    warn!(table = %record.name, buffer = ?shared, "staged buffer lost, update dropped");
                    record.next = None;
                    record.update_pending = false;
                    return UpdateOutcome::NothingPending;
                };
                if let Some(local) = record.local_mut(0) {
                    local.copy_image_from(&staged);
                }
                pool.release(shared);
                record.active = Some(BufferId::Local(0));
            }
            BufferId::Local(_) => {
                record.prev = record.active;
                record.active = Some(next);
            }
        }
        record.next = None;
        record.update_pending = false;
        record.loaded_once = true;
        record.last_update_time = now;
        record.last_file_loaded = LastFileLoaded {
            name: record.active_local().map(|active| active.source.clone()).unwrap_or_default(),
            modified: false,
        };
        handles.mark_updated(&record.access_list);

        if record.is_critical() {
            self.mirror_critical(critical, log, record);
        }
        if let Some(stale) = record.validate_inactive.take() {
            validations.free(stale);
        }
        *last_update = Some(LastUpdate {
            reg_id,
            table_name: record.name.clone(),
            time: now,
        });
        info!(table = %record.name, source = %record.last_file_loaded.name, "table updated");
        log.add_event(
            EventId::UpdateSuccessInf,
            format!("'{}' updated from '{}'", record.name, record.last_file_loaded.name),
        );
        UpdateOutcome::Updated
    }
}

/// Copy a resolved image into the working buffer
fn write_image(target: &mut LoadBuffer, base: Option<&LoadBuffer>, size: usize, staged: &Staged) {
    target.reset();
    let partial = staged.offset != 0 || staged.bytes.len() != size;
    if let (true, Some(base)) = (partial, base) {
        target.copy_image_from(base);
    }
    {
        let mut data = target.data.write();
        data[staged.offset..staged.offset + staged.bytes.len()].copy_from_slice(&staged.bytes);
    }
    target.content_size = size;
    target.source = staged.source.clone();
    target.file_time = staged.file_time;
    target.validated = false;
    target.update_crc();
}

fn abort_staged(txn: &mut Transaction<'_>, reg_id: RegId) -> Result<TblStatus> {
    let (state, log) = txn.state_and_log();
    let TblState {
        registry,
        pool,
        validations,
        ..
    } = state;
    let record = registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
    if record.is_dump_only() {
        return Err(TblError::DumpOnly);
    }
    let next = record.next.take().ok_or(TblError::NoLoadPending)?;
    release_buffer(pool, record, next);
    record.update_pending = false;
    if let Some(pending) = record.validate_inactive.take() {
        validations.free(pending);
    }
    log.add_event(EventId::LoadAbortInf, format!("Load of '{}' aborted", record.name));
    Ok(TblStatus::Success)
}

fn queue_validation(txn: &mut Transaction<'_>, reg_id: RegId, select: BufferSelect) -> Result<TblStatus> {
    let (state, log) = txn.state_and_log();
    let TblState {
        registry,
        pool,
        validations,
        ..
    } = state;
    let record = registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
    let target = match select {
        BufferSelect::Inactive if record.is_dump_only() => return Err(TblError::NoInactiveBuffer),
        BufferSelect::Inactive => record.next.ok_or(TblError::NoInactiveBuffer)?,
        BufferSelect::Active => record.active.ok_or(TblError::NeverLoaded)?,
    };
    let pending = match select {
        BufferSelect::Active => record.validate_active,
        BufferSelect::Inactive => record.validate_inactive,
    };
    if pending.is_some() {
        return Ok(TblStatus::InfoValidationPending);
    }

    let id = validations.allocate(reg_id, &record.name, select)?;
    if record.validation_fn.is_none() {
        let crc = match buffer_of_mut(pool, record, target) {
            Some(buffer) => {
                buffer.validated |= select == BufferSelect::Inactive;
                buffer.crc
            }
            None => 0,
        };
        if let Some(request) = validations.get_mut(id) {
            request.state = ValidationState::Performed { result: 0, crc };
        }
        log.add_event(
            EventId::ValidationInf,
            format!("{:?} table '{}' validated, CRC {:#010x}", select, record.name, crc),
        );
        return Ok(TblStatus::Success);
    }

    match select {
        BufferSelect::Active => record.validate_active = Some(id),
        BufferSelect::Inactive => record.validate_inactive = Some(id),
    }
    notify_owner(log, record);
    log.add_event(
        EventId::ValReqMadeInf,
        format!("Validation of {:?} '{}' requested", select, record.name),
    );
    Ok(TblStatus::Success)
}

fn request_activation(txn: &mut Transaction<'_>, reg_id: RegId) -> Result<TblStatus> {
    let (state, log) = txn.state_and_log();
    let TblState { registry, pool, .. } = state;
    let record = registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
    if record.is_dump_only() {
        return Err(TblError::DumpOnly);
    }
    let next = record.next.ok_or(TblError::NoLoadPending)?;
    let validated = buffer_of(pool, record, next).map_or(false, |buffer| buffer.validated);
    if record.validation_fn.is_some() && !validated {
        return Err(TblError::NotValidated);
    }
    record.update_pending = true;
    notify_owner(log, record);
    log.add_event(
        EventId::LoadPendReqInf,
        format!("Activation of '{}' requested of owner", record.name),
    );
    Ok(TblStatus::Success)
}

/// Run a queued validation request for one image of the table
///
/// Requests that no longer match the record, or whose image went away, are
/// dropped without a result.
pub(crate) fn perform_validation(state: &mut TblState, log: &mut TxnLog, reg_id: RegId, select: BufferSelect) {
    let TblState {
        registry,
        pool,
        validations,
        ..
    } = state;
    let Some(record) = registry.get_mut(reg_id) else {
        return;
    };
    let pending = match select {
        BufferSelect::Active => record.validate_active.take(),
        BufferSelect::Inactive => record.validate_inactive.take(),
    };
    let Some(id) = pending else {
        return;
    };
    if validations.get(id).map_or(true, |request| request.reg_id != reg_id) {
        debug!(table = %record.name, request = ?id, "stale validation request dropped");
        return;
    }
    let target = match select {
        BufferSelect::Active => record.active,
        BufferSelect::Inactive => record.next,
    };
    let validation_fn = record.validation_fn.clone();
    let size = record.size;
    let buffer = match target {
        Some(target) => buffer_of_mut(pool, record, target),
        None => None,
    };
    let Some(buffer) = buffer else {
        validations.free(id);
        debug!(request = ?id, "validation target gone, request dropped");
        return;
    };

    let verdict = match &validation_fn {
        Some(check) => {
            let data = buffer.data.read();
            check(&data[..size.min(data.len())])
        }
        None => Ok(()),
    };
    let result = verdict.err().unwrap_or(0);
    let crc = buffer.crc;
    if select == BufferSelect::Inactive && result == 0 {
        buffer.validated = true;
    }
    if let Some(request) = validations.get_mut(id) {
        request.state = ValidationState::Performed { result, crc };
    }
    if result == 0 {
        log.add_event(
            EventId::ValidationInf,
            format!("{:?} table '{}' validated, CRC {:#010x}", select, record.name, crc),
        );
    } else {
        log.add_event(
            EventId::ValidationErr,
            format!("{:?} table '{}' failed validation, code {}", select, record.name, result),
        );
    }
}
