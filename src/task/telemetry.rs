//! Telemetry published by the table services task

use crate::platform::SpacecraftTime;
use crate::registry::TableInfo;
use crate::resource_id::RegId;
use crate::services::RegistryCounts;

/// Outcome of the most recent validation reported in housekeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastValidation {
    /// Table that was validated
    pub table_name: String,
    /// CRC of the validated image
    pub crc: u32,
    /// Code returned by the validation function
    pub status: i32,
}

/// Housekeeping telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingTlm {
    /// Commands accepted
    pub command_counter: u16,
    /// Commands rejected
    pub command_error_counter: u16,
    /// Registered tables
    pub num_tables: u16,
    /// Tables with a staged image
    pub num_load_pending: u16,
    /// Free shared load buffers
    pub free_shared_buffers: u16,
    /// Validation requests waiting on their owners
    pub pending_validations: u16,
    /// Validations that passed
    pub validation_success_counter: u16,
    /// Validations that failed
    pub validation_failure_counter: u16,
    /// Validations requested by ground
    pub validation_request_counter: u16,
    /// Most recent validation
    pub last_validation: Option<LastValidation>,
    /// Table activated most recently
    pub last_updated_table: String,
    /// Its registry ID
    pub last_updated_reg: Option<RegId>,
    /// Time of that activation
    pub last_update_time: SpacecraftTime,
    /// Most recent file written by a dump command
    pub last_file_dumped: String,
    /// Bytes left in the table memory pool
    pub memory_available: usize,
}

impl HousekeepingTlm {
    pub(crate) fn apply_counts(&mut self, counts: &RegistryCounts) {
        let clamp = |n: usize| u16::try_from(n).unwrap_or(u16::MAX);
        self.num_tables = clamp(counts.num_tables);
        self.num_load_pending = clamp(counts.num_load_pending);
        self.free_shared_buffers = clamp(counts.free_shared_buffers);
        self.pending_validations = clamp(counts.pending_validations);
        if let Some(last) = &counts.last_update {
            self.last_updated_table = last.table_name.clone();
            self.last_updated_reg = Some(last.reg_id);
            self.last_update_time = last.time;
        }
    }
}

/// One registry entry sent in response to SEND_REGISTRY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTlm {
    /// The entry
    pub info: TableInfo,
}
