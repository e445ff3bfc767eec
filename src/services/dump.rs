//! Dump requests and the dump file writer

use std::path::Path;

use tracing::{debug, warn};

use crate::buffer::{BufferId, BufferPool, BufferSelect};
use crate::codec::{StdFileHeader, TableHeader, SUBTYPE_TBL_IMAGE};
use crate::dump::{DumpControl, DumpJob, DumpQueue, DumpState};
use crate::error::{Result, TblError, TblStatus};
use crate::file::write_table_image;
use crate::platform::{AppId, EventId};
use crate::registry::RegistryRecord;
use crate::resource_id::{DumpCtrlId, RegId, TblHandle};
use crate::services::{buffer_of, notify_owner, report, TableServices, TblState};
use crate::transaction::{CallContext, Transaction};

impl TableServices {
    /// Request a dump of one image of the table to `path`
    ///
    /// Active images of ordinary tables are captured immediately. A dump-only
    /// table is captured when its owner next calls `manage` or
    /// `dump_to_buffer`, and `InfoDumpPending` is returned. The file is written
    /// at the next housekeeping cycle.
    pub fn dump(&self, app_id: AppId, handle: TblHandle, select: BufferSelect, path: &Path) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let result = self
            .check_path(path)
            .and_then(|()| txn.start_from_handle(handle, CallContext::ACCESSOR_APP))
            .and_then(|reg_id| self.request_dump(&mut txn, reg_id, select, path));
        report(&mut txn, EventId::DumpErr, "Dump", result)
    }

    /// Request a dump of the table `full_name` (DUMP command)
    pub fn dump_table(&self, full_name: &str, select: BufferSelect, path: &Path) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let result = self
            .check_path(path)
            .and_then(|()| txn.start_from_name(full_name, CallContext::empty()))
            .and_then(|reg_id| self.request_dump(&mut txn, reg_id, select, path));
        report(&mut txn, EventId::DumpErr, &format!("Dump '{}'", full_name), result)
    }

    fn request_dump(
        &self,
        txn: &mut Transaction<'_>,
        reg_id: RegId,
        select: BufferSelect,
        path: &Path,
    ) -> Result<TblStatus> {
        let (state, log) = txn.state_and_log();
        let TblState {
            registry, pool, dumps, ..
        } = state;
        let record = registry.get_mut(reg_id).ok_or(TblError::Unregistered)?;
        if record.dump_control.is_some() {
            return Err(TblError::DumpAlreadyPending);
        }
        let source = match select {
            BufferSelect::Active => record.active.ok_or(TblError::NeverLoaded)?,
            BufferSelect::Inactive if record.is_dump_only() => return Err(TblError::NoInactiveBuffer),
            BufferSelect::Inactive => record.next.ok_or(TblError::NoInactiveBuffer)?,
        };

        let id = dumps.next_id()?;
        let staging = pool.acquire(reg_id)?;
        dumps.insert(DumpControl {
            id,
            reg_id,
            table_name: record.name.clone(),
            state: DumpState::Pending,
            source: select,
            staging,
            size: record.size,
            path: path.to_path_buf(),
        });
        record.dump_control = Some(id);

        if select == BufferSelect::Active && record.is_dump_only() {
            notify_owner(log, record);
            log.add_event(
                EventId::DumpPendingInf,
                format!("Dump of '{}' waiting for its owner", record.name),
            );
            return Ok(TblStatus::InfoDumpPending);
        }
        snapshot(pool, dumps, record, id, source);
        debug!(table = %record.name, ?select, path = %path.display(), "dump captured");
        Ok(TblStatus::Success)
    }

    /// Capture the image of a dump-only table for a pending dump request
    pub fn dump_to_buffer(&self, app_id: AppId, handle: TblHandle) -> Result<TblStatus> {
        let mut txn = Transaction::new(self, app_id);
        let reg_id = txn.start_from_handle(handle, CallContext::OWNER_APP)?;
        snapshot_pending_dump(txn.lock(), reg_id);
        Ok(TblStatus::Success)
    }

    /// Write every captured dump to its file
    ///
    /// Captured images leave the queue under the registry lock; the files are
    /// written after it is released. Returns the number of files written.
    pub fn write_pending_dumps(&self) -> usize {
        let mut txn = Transaction::new(self, self.config().task_app_id);
        let jobs = {
            let state = txn.lock();
            let mut jobs = Vec::new();
            for id in state.dumps.performed() {
                let Some(control) = state.dumps.free(id) else {
                    continue;
                };
                let image = state
                    .pool
                    .get(control.staging)
                    .map(|staging| staging.data().to_vec(control.size))
                    .unwrap_or_default();
                state.pool.release(control.staging);
                if let Some(record) = state.registry.get_mut(control.reg_id) {
                    if record.dump_control == Some(id) {
                        record.dump_control = None;
                    }
                }
                self.try_reclaim(state, control.reg_id);
                jobs.push(DumpJob {
                    table_name: control.table_name,
                    path: control.path,
                    image,
                    source: control.source,
                });
            }
            jobs
        };
        txn.unlock();

        let mut written = 0;
        for job in jobs {
            match self.write_dump_file(&job) {
                Ok(replaced) => {
                    written += 1;
                    let (id, verb) = if replaced {
                        (EventId::OverwriteDumpInf, "Overwrote")
                    } else {
                        (EventId::WriteDumpInf, "Wrote")
                    };
                    txn.add_event(
                        id,
                        format!(
                            "{} dump file '{}' with {:?} image of '{}'",
                            verb,
                            job.path.display(),
                            job.source,
                            job.table_name
                        ),
                    );
                }
                Err(err) => {
                    warn!(table = %job.table_name, path = %job.path.display(), error = %err, "dump file write failed");
                    txn.add_event(
                        EventId::WriteDumpErr,
                        format!("Failed to write dump of '{}' to '{}': {}", job.table_name, job.path.display(), err),
                    );
                }
            }
        }
        written
    }

    fn write_dump_file(&self, job: &DumpJob) -> Result<bool> {
        let config = self.config();
        let now = self.platform().clock.now();
        let mut std_hdr = StdFileHeader::new(SUBTYPE_TBL_IMAGE, self.layout(), "Table Dump Image");
        std_hdr.spacecraft_id = config.spacecraft_id;
        std_hdr.processor_id = config.processor_id;
        std_hdr.application_id = config.task_app_id.0;
        std_hdr.time_seconds = now.seconds;
        std_hdr.time_subseconds = now.subseconds;

        let codec = self.platform().codec.as_ref();
        let payload = codec.encode_output_data(&job.table_name, &job.image)?;
        let tbl_hdr = TableHeader {
            reserved: 0,
            offset: 0,
            num_bytes: payload.len() as u32,
            table_name: job.table_name.clone(),
        };
        write_table_image(&job.path, codec, self.layout(), &std_hdr, &tbl_hdr, &payload)
    }
}

/// Copy the source image into the staging buffer of dump `id`
fn snapshot(pool: &mut BufferPool, dumps: &mut DumpQueue, record: &RegistryRecord, id: DumpCtrlId, source: BufferId) {
    let Some(control) = dumps.get_mut(id) else {
        return;
    };
    let Some(image) = buffer_of(pool, record, source).cloned() else {
        return;
    };
    if let Some(staging) = pool.get_mut(control.staging) {
        staging.copy_image_from(&image);
    }
    control.state = DumpState::Performed;
}

/// Capture the active image for a pending dump of `reg_id`; stale requests
/// are forgotten
pub(crate) fn snapshot_pending_dump(state: &mut TblState, reg_id: RegId) -> bool {
    let TblState {
        registry, pool, dumps, ..
    } = state;
    let Some(record) = registry.get_mut(reg_id) else {
        return false;
    };
    let Some(id) = record.dump_control else {
        return false;
    };
    let pending = match dumps.get(id) {
        Some(control) => control.reg_id == reg_id && control.state == DumpState::Pending,
        None => {
            record.dump_control = None;
            return false;
        }
    };
    let Some(active) = record.active.filter(|_| pending) else {
        return false;
    };
    snapshot(pool, dumps, record, id, active);
    debug!(table = %record.name, "pending dump captured");
    true
}
