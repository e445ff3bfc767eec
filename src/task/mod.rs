//! Table services task
//!
//! The task drains the command pipe on its own thread. Ground commands run
//! against the shared [`TableServices`]; a housekeeping request writes the
//! pending dump files, collects finished validations, and publishes
//! [`HousekeepingTlm`].

mod command;
mod pipe;
mod telemetry;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use command::{code, CommandError, CommandPacket, TblCommand};
pub use pipe::CommandPipe;
pub use telemetry::{HousekeepingTlm, LastValidation, RegistryTlm};

use crate::codec::{StdFileHeader, SUBTYPE_TBL_REGISTRY};
use crate::error::{TblError, TblStatus};
use crate::file::write_registry_dump;
use crate::platform::{EventId, OutboundMessage};
use crate::services::TableServices;
use crate::transaction::Transaction;
use crate::validation::ValidationState;

/// How long the task thread waits on an empty pipe before checking its running flag
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// The table services task
#[derive(Debug)]
pub struct TblTask {
    services: Arc<TableServices>,
    pipe: Arc<CommandPipe>,
    hk: Mutex<HousekeepingTlm>,
    running: AtomicBool,
}

impl TblTask {
    /// Create the task around `services`
    pub fn new(services: Arc<TableServices>) -> Self {
        let depth = services.config().command_pipe_depth;
        let task = Self {
            pipe: Arc::new(CommandPipe::new(depth)),
            hk: Mutex::new(HousekeepingTlm::default()),
            running: AtomicBool::new(false),
            services,
        };
        task.event(
            EventId::InitInf,
            format!("Table services initialized, command pipe depth {}", depth),
        );
        task
    }

    /// Table services the task runs against
    pub fn services(&self) -> &Arc<TableServices> {
        &self.services
    }

    /// Pipe that feeds the task
    pub fn pipe(&self) -> &Arc<CommandPipe> {
        &self.pipe
    }

    /// Copy of the housekeeping counters as they stand
    pub fn housekeeping(&self) -> HousekeepingTlm {
        self.hk.lock().clone()
    }

    /// Route one packet by message ID
    pub fn process_packet(&self, packet: &CommandPacket) -> Result<TblStatus, CommandError> {
        let config = self.services.config();
        if packet.msg_id == config.send_hk_msg_id {
            self.send_housekeeping();
            return Ok(TblStatus::Success);
        }
        if packet.msg_id != config.cmd_msg_id {
            self.reject(EventId::MidErr, format!("Invalid message ID {:#06x}", packet.msg_id));
            return Err(CommandError::UnknownMsgId(packet.msg_id));
        }

        let command = match TblCommand::decode(packet.command_code, &packet.payload, config) {
            Ok(command) => command,
            Err(err) => {
                let id = match err {
                    CommandError::WrongLength { .. } => EventId::LenErr,
                    CommandError::BadBufferSelect(_) if packet.command_code == code::DUMP => EventId::DumpErr,
                    CommandError::BadBufferSelect(_) => EventId::ValidateErr,
                    _ => EventId::CcErr,
                };
                self.reject(id, err.to_string());
                return Err(err);
            }
        };

        debug!(code = command.code(), "command received");
        match self.execute(&command) {
            Ok(status) => {
                if command.is_counted() {
                    let mut hk = self.hk.lock();
                    hk.command_counter = hk.command_counter.wrapping_add(1);
                }
                Ok(status)
            }
            Err(err) => {
                // Table services already reported the failure
                let mut hk = self.hk.lock();
                hk.command_error_counter = hk.command_error_counter.wrapping_add(1);
                Err(err)
            }
        }
    }

    /// Run a decoded command
    pub fn execute(&self, command: &TblCommand) -> Result<TblStatus, CommandError> {
        let services = &self.services;
        let status = match command {
            TblCommand::Noop => {
                self.event(
                    EventId::NoopInf,
                    format!("No-op command, version {}", env!("CARGO_PKG_VERSION")),
                );
                TblStatus::Success
            }
            TblCommand::ResetCounters => {
                let mut hk = self.hk.lock();
                hk.command_counter = 0;
                hk.command_error_counter = 0;
                hk.validation_success_counter = 0;
                hk.validation_failure_counter = 0;
                hk.validation_request_counter = 0;
                drop(hk);
                self.event(EventId::ResetInf, "Reset counters command");
                TblStatus::Success
            }
            TblCommand::Load { filename } => services.load_table_file(filename)?,
            TblCommand::Dump {
                table_name,
                select,
                filename,
            } => {
                let status = services.dump_table(table_name, *select, filename)?;
                self.hk.lock().last_file_dumped = filename.display().to_string();
                status
            }
            TblCommand::Validate { table_name, select } => {
                let status = services.validate_table(table_name, *select)?;
                let mut hk = self.hk.lock();
                hk.validation_request_counter = hk.validation_request_counter.wrapping_add(1);
                status
            }
            TblCommand::Activate { table_name } => services.activate_table(table_name)?,
            TblCommand::DumpRegistry { filename } => self.dump_registry(filename)?,
            TblCommand::SendRegistry { table_name } => self.send_registry(table_name)?,
            TblCommand::DeleteCds { table_name } => services.delete_cds(table_name)?,
            TblCommand::AbortLoad { table_name } => services.abort_table_load(table_name)?,
        };
        Ok(status)
    }

    /// Write pending dumps, collect validation results and publish housekeeping
    pub fn send_housekeeping(&self) -> HousekeepingTlm {
        let written = self.services.write_pending_dumps();
        let results = self.services.take_validation_results();
        let counts = self.services.counts();

        let mut hk = self.hk.lock();
        for request in &results {
            if let ValidationState::Performed { result, crc } = request.state() {
                if result == 0 {
                    hk.validation_success_counter = hk.validation_success_counter.wrapping_add(1);
                } else {
                    hk.validation_failure_counter = hk.validation_failure_counter.wrapping_add(1);
                }
                hk.last_validation = Some(LastValidation {
                    table_name: request.table_name().to_string(),
                    crc,
                    status: result,
                });
            }
        }
        hk.apply_counts(&counts);
        hk.memory_available = self.services.memory_available();
        let tlm = hk.clone();
        drop(hk);

        debug!(dumps = written, validations = results.len(), "housekeeping");
        let config = self.services.config();
        self.services
            .platform()
            .bus
            .transmit(config.hk_tlm_msg_id, OutboundMessage::Housekeeping(tlm.clone()));
        tlm
    }

    fn dump_registry(&self, path: &Path) -> Result<TblStatus, CommandError> {
        let services = &self.services;
        let config = services.config();
        if path.as_os_str().len() > config.max_path_len {
            self.event(
                EventId::WriteDumpErr,
                format!("Registry dump file name '{}' too long", path.display()),
            );
            return Err(TblError::FilenameTooLong.into());
        }

        let now = services.platform().clock.now();
        let mut std_hdr = StdFileHeader::new(SUBTYPE_TBL_REGISTRY, services.layout(), "Table Registry");
        std_hdr.spacecraft_id = config.spacecraft_id;
        std_hdr.processor_id = config.processor_id;
        std_hdr.application_id = config.task_app_id.0;
        std_hdr.time_seconds = now.seconds;
        std_hdr.time_subseconds = now.subseconds;

        let entries = services.registry_snapshot();
        match write_registry_dump(path, services.layout(), &std_hdr, &entries, config.max_path_len) {
            Ok(replaced) => {
                let (id, verb) = if replaced {
                    (EventId::OverwriteRegDumpInf, "Overwrote")
                } else {
                    (EventId::WriteRegDumpInf, "Wrote")
                };
                self.event(
                    id,
                    format!("{} registry dump '{}' with {} entries", verb, path.display(), entries.len()),
                );
                Ok(TblStatus::Success)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "registry dump failed");
                self.event(
                    EventId::WriteDumpErr,
                    format!("Failed to write registry dump '{}': {}", path.display(), err),
                );
                Err(err.into())
            }
        }
    }

    fn send_registry(&self, table_name: &str) -> Result<TblStatus, CommandError> {
        let info = match self.services.get_info(table_name) {
            Ok(info) => info,
            Err(err) => {
                self.event(
                    EventId::NoSuchTableErr,
                    format!("Unable to send registry entry of '{}': {}", table_name, err),
                );
                return Err(err.into());
            }
        };
        let config = self.services.config();
        self.services
            .platform()
            .bus
            .transmit(config.reg_tlm_msg_id, OutboundMessage::Registry(RegistryTlm { info }));
        self.event(
            EventId::TlmRegCmdInf,
            format!("Registry entry of '{}' sent", table_name),
        );
        Ok(TblStatus::Success)
    }

    /// Count a rejected packet and report it
    fn reject(&self, id: EventId, message: String) {
        {
            let mut hk = self.hk.lock();
            hk.command_error_counter = hk.command_error_counter.wrapping_add(1);
        }
        self.event(id, message);
    }

    fn event(&self, id: EventId, message: impl Into<String>) {
        let mut txn = Transaction::new(&self.services, self.services.config().task_app_id);
        txn.add_event(id, message);
    }

    /// Start the task thread
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "table services task already running",
            ));
        }
        let task = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("tbl-task".to_string())
            .spawn(move || {
                info!("table services task started");
                while task.running.load(Ordering::SeqCst) {
                    if let Some(packet) = task.pipe.receive(Some(RECEIVE_TIMEOUT)) {
                        if let Err(err) = task.process_packet(&packet) {
                            debug!(code = packet.command_code, error = %err, "command rejected");
                        }
                    }
                }
                info!("table services task stopped");
            });
        if spawned.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        spawned
    }

    /// Ask the task thread to exit
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pipe.wake();
    }

    /// True while the task thread runs
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
