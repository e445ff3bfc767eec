//! Platform configuration for table services
//!
//! Every fixed-capacity structure in the crate (registry, handle table, shared
//! load buffers, validation and dump queues, critical-table shadow registry)
//! is sized from a [`TblConfig`]. The defaults match the classic platform
//! configuration used by most missions.

use crate::platform::AppId;

/// Software bus message identifier
pub type MsgId = u16;

/// Configuration for a table services instance
#[derive(Debug, Clone)]
pub struct TblConfig {
    /// Maximum number of registered tables
    pub max_tables: usize,
    /// Maximum number of simultaneously open table handles
    pub max_handles: usize,
    /// Number of shared load buffers for single-buffered loads and dump staging
    pub max_simultaneous_loads: usize,
    /// Capacity of the validation request queue
    pub max_validations: usize,
    /// Capacity of the dump control queue
    pub max_dumps: usize,
    /// Number of critical tables the CDS shadow registry can track
    pub max_critical_tables: usize,
    /// Deferred events a single transaction can hold
    pub max_events_per_transaction: usize,
    /// Largest permitted single-buffered table in bytes
    pub max_single_table_size: usize,
    /// Largest permitted double-buffered table in bytes
    pub max_double_table_size: usize,
    /// Byte budget of the pool that backs per-table local buffers
    pub buffer_memory_bytes: usize,
    /// Maximum length of a table name, without the application prefix
    pub max_table_name_len: usize,
    /// Maximum length of a full `App.Tbl` name
    pub max_full_name_len: usize,
    /// Maximum length of a file name
    pub max_path_len: usize,
    /// Length of the description field in the standard file header
    pub file_description_len: usize,
    /// Spacecraft ID written into dump files
    pub spacecraft_id: u32,
    /// Processor ID written into dump files
    pub processor_id: u32,
    /// Spacecraft IDs accepted in load files (empty accepts any)
    pub valid_spacecraft_ids: Vec<u32>,
    /// Processor IDs accepted in load files (empty accepts any)
    pub valid_processor_ids: Vec<u32>,
    /// Application ID of the table services task itself
    pub task_app_id: AppId,
    /// Depth of the task command pipe
    pub command_pipe_depth: usize,
    /// Message ID carrying table services commands
    pub cmd_msg_id: MsgId,
    /// Message ID requesting housekeeping
    pub send_hk_msg_id: MsgId,
    /// Message ID of housekeeping telemetry
    pub hk_tlm_msg_id: MsgId,
    /// Message ID of registry entry telemetry
    pub reg_tlm_msg_id: MsgId,
}

impl Default for TblConfig {
    fn default() -> Self {
        Self {
            max_tables: 128,
            max_handles: 256,
            max_simultaneous_loads: 4,
            max_validations: 10,
            max_dumps: 10,
            max_critical_tables: 32,
            max_events_per_transaction: 8,
            max_single_table_size: 16384,
            max_double_table_size: 16384,
            buffer_memory_bytes: 512 * 1024,
            max_table_name_len: 16,
            max_full_name_len: 40,
            max_path_len: 64,
            file_description_len: 32,
            spacecraft_id: 0x42,
            processor_id: 1,
            valid_spacecraft_ids: vec![0x42],
            valid_processor_ids: vec![1],
            task_app_id: AppId(0),
            command_pipe_depth: 12,
            cmd_msg_id: 0x1804,
            send_hk_msg_id: 0x180C,
            hk_tlm_msg_id: 0x0804,
            reg_tlm_msg_id: 0x080C,
        }
    }
}

impl TblConfig {
    /// Check that every capacity is usable
    ///
    /// Returns a description of the first unusable setting.
    pub fn check(&self) -> std::result::Result<(), String> {
        let capacities = [
            ("max_tables", self.max_tables),
            ("max_handles", self.max_handles),
            ("max_simultaneous_loads", self.max_simultaneous_loads),
            ("max_validations", self.max_validations),
            ("max_dumps", self.max_dumps),
            ("max_events_per_transaction", self.max_events_per_transaction),
            ("max_single_table_size", self.max_single_table_size),
            ("max_double_table_size", self.max_double_table_size),
            ("command_pipe_depth", self.command_pipe_depth),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(format!("{} must be non-zero", name));
            }
        }
        if self.max_handles < self.max_tables {
            return Err("max_handles must be at least max_tables".to_string());
        }
        if self.file_description_len % 4 != 0 {
            return Err("file_description_len must be a multiple of 4".to_string());
        }
        if self.max_full_name_len <= self.max_table_name_len {
            return Err("max_full_name_len must exceed max_table_name_len".to_string());
        }
        Ok(())
    }

    /// Largest table of either buffering mode, which sizes the shared buffers
    pub fn max_table_size(&self) -> usize {
        self.max_single_table_size.max(self.max_double_table_size)
    }
}
