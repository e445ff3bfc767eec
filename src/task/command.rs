//! Ground command packets
//!
//! Every command carries a function code and a fixed-length payload. Table
//! names and file names travel in NUL-padded fields sized by the platform
//! configuration; buffer selectors are a big-endian `u16` followed by two
//! spare bytes.

use std::path::PathBuf;

use crate::buffer::BufferSelect;
use crate::codec::{get_fixed_str, put_fixed_str};
use crate::config::{MsgId, TblConfig};
use crate::error::TblError;

/// Function codes understood on the command message ID
pub mod code {
    /// Do nothing but report the task is alive
    pub const NOOP: u16 = 0;
    /// Zero the command counters
    pub const RESET_COUNTERS: u16 = 1;
    /// Stage an image file
    pub const LOAD: u16 = 2;
    /// Dump a table image to a file
    pub const DUMP: u16 = 3;
    /// Validate a table image
    pub const VALIDATE: u16 = 4;
    /// Release a staged image for activation
    pub const ACTIVATE: u16 = 5;
    /// Write the registry to a file
    pub const DUMP_REGISTRY: u16 = 6;
    /// Send one registry entry as telemetry
    pub const SEND_REGISTRY: u16 = 7;
    /// Delete the CDS block of an unregistered critical table
    pub const DELETE_CDS: u16 = 8;
    /// Discard a staged image
    pub const ABORT_LOAD: u16 = 9;
}

/// Errors raised while dispatching a command packet
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Packet arrived on a message ID the task does not handle
    #[error("unknown message id {0:#06x}")]
    UnknownMsgId(MsgId),
    /// Function code not recognized
    #[error("bad command code {0}")]
    BadCommandCode(u16),
    /// Payload length does not match the function code
    #[error("command {code} expects {expected} bytes, got {actual}")]
    WrongLength {
        /// Function code
        code: u16,
        /// Payload bytes the code requires
        expected: usize,
        /// Payload bytes received
        actual: usize,
    },
    /// Buffer selector is neither active nor inactive
    #[error("illegal buffer selector {0}")]
    BadBufferSelect(u16),
    /// Command pipe has no room
    #[error("command pipe full")]
    PipeFull,
    /// Table services refused the command
    #[error(transparent)]
    Table(#[from] TblError),
}

/// A message read from the command pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Message ID the packet was sent on
    pub msg_id: MsgId,
    /// Function code
    pub command_code: u16,
    /// Command payload
    pub payload: Vec<u8>,
}

impl CommandPacket {
    /// Packet carrying `command` on the configured command message ID
    pub fn command(config: &TblConfig, command: &TblCommand) -> Self {
        Self {
            msg_id: config.cmd_msg_id,
            command_code: command.code(),
            payload: command.encode(config),
        }
    }

    /// Housekeeping request packet
    pub fn housekeeping_request(config: &TblConfig) -> Self {
        Self {
            msg_id: config.send_hk_msg_id,
            command_code: 0,
            payload: Vec::new(),
        }
    }
}

/// A decoded ground command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TblCommand {
    /// NOOP
    Noop,
    /// RESET_COUNTERS
    ResetCounters,
    /// LOAD
    Load {
        /// Image file
        filename: PathBuf,
    },
    /// DUMP
    Dump {
        /// Full table name
        table_name: String,
        /// Image to dump
        select: BufferSelect,
        /// Destination file
        filename: PathBuf,
    },
    /// VALIDATE
    Validate {
        /// Full table name
        table_name: String,
        /// Image to validate
        select: BufferSelect,
    },
    /// ACTIVATE
    Activate {
        /// Full table name
        table_name: String,
    },
    /// DUMP_REGISTRY
    DumpRegistry {
        /// Destination file
        filename: PathBuf,
    },
    /// SEND_REGISTRY
    SendRegistry {
        /// Full table name
        table_name: String,
    },
    /// DELETE_CDS
    DeleteCds {
        /// Full table name
        table_name: String,
    },
    /// ABORT_LOAD
    AbortLoad {
        /// Full table name
        table_name: String,
    },
}

/// Payload bytes required by `command_code`
fn expected_len(command_code: u16, config: &TblConfig) -> Option<usize> {
    let name = config.max_full_name_len;
    let path = config.max_path_len;
    Some(match command_code {
        code::NOOP | code::RESET_COUNTERS => 0,
        code::LOAD | code::DUMP_REGISTRY => path,
        code::DUMP => 4 + name + path,
        code::VALIDATE => 4 + name,
        code::ACTIVATE | code::SEND_REGISTRY | code::DELETE_CDS | code::ABORT_LOAD => name,
        _ => return None,
    })
}

fn get_select(payload: &[u8]) -> Result<BufferSelect, CommandError> {
    let raw = u16::from_be_bytes([payload[0], payload[1]]);
    BufferSelect::from_raw(raw).ok_or(CommandError::BadBufferSelect(raw))
}

impl TblCommand {
    /// Function code of the command
    pub fn code(&self) -> u16 {
        match self {
            TblCommand::Noop => code::NOOP,
            TblCommand::ResetCounters => code::RESET_COUNTERS,
            TblCommand::Load { .. } => code::LOAD,
            TblCommand::Dump { .. } => code::DUMP,
            TblCommand::Validate { .. } => code::VALIDATE,
            TblCommand::Activate { .. } => code::ACTIVATE,
            TblCommand::DumpRegistry { .. } => code::DUMP_REGISTRY,
            TblCommand::SendRegistry { .. } => code::SEND_REGISTRY,
            TblCommand::DeleteCds { .. } => code::DELETE_CDS,
            TblCommand::AbortLoad { .. } => code::ABORT_LOAD,
        }
    }

    /// True if success bumps the command counter
    pub fn is_counted(&self) -> bool {
        !matches!(self, TblCommand::ResetCounters)
    }

    /// Decode a payload, checking its length first
    pub fn decode(command_code: u16, payload: &[u8], config: &TblConfig) -> Result<Self, CommandError> {
        let expected = expected_len(command_code, config).ok_or(CommandError::BadCommandCode(command_code))?;
        if payload.len() != expected {
            return Err(CommandError::WrongLength {
                code: command_code,
                expected,
                actual: payload.len(),
            });
        }
        let name_len = config.max_full_name_len;
        let name = |at: usize| get_fixed_str(&payload[at..at + name_len]);
        let path = |at: usize| PathBuf::from(get_fixed_str(&payload[at..at + config.max_path_len]));

        Ok(match command_code {
            code::NOOP => TblCommand::Noop,
            code::RESET_COUNTERS => TblCommand::ResetCounters,
            code::LOAD => TblCommand::Load { filename: path(0) },
            code::DUMP => TblCommand::Dump {
                select: get_select(payload)?,
                table_name: name(4),
                filename: path(4 + name_len),
            },
            code::VALIDATE => TblCommand::Validate {
                select: get_select(payload)?,
                table_name: name(4),
            },
            code::ACTIVATE => TblCommand::Activate { table_name: name(0) },
            code::DUMP_REGISTRY => TblCommand::DumpRegistry { filename: path(0) },
            code::SEND_REGISTRY => TblCommand::SendRegistry { table_name: name(0) },
            code::DELETE_CDS => TblCommand::DeleteCds { table_name: name(0) },
            code::ABORT_LOAD => TblCommand::AbortLoad { table_name: name(0) },
            other => return Err(CommandError::BadCommandCode(other)),
        })
    }

    /// Encode the payload
    pub fn encode(&self, config: &TblConfig) -> Vec<u8> {
        let name_len = config.max_full_name_len;
        let path_len = config.max_path_len;
        let mut out = Vec::new();
        match self {
            TblCommand::Noop | TblCommand::ResetCounters => {}
            TblCommand::Load { filename } | TblCommand::DumpRegistry { filename } => {
                put_fixed_str(&mut out, &filename.to_string_lossy(), path_len);
            }
            TblCommand::Dump {
                table_name,
                select,
                filename,
            } => {
                out.extend_from_slice(&select.raw().to_be_bytes());
                out.extend_from_slice(&[0, 0]);
                put_fixed_str(&mut out, table_name, name_len);
                put_fixed_str(&mut out, &filename.to_string_lossy(), path_len);
            }
            TblCommand::Validate { table_name, select } => {
                out.extend_from_slice(&select.raw().to_be_bytes());
                out.extend_from_slice(&[0, 0]);
                put_fixed_str(&mut out, table_name, name_len);
            }
            TblCommand::Activate { table_name }
            | TblCommand::SendRegistry { table_name }
            | TblCommand::DeleteCds { table_name }
            | TblCommand::AbortLoad { table_name } => {
                put_fixed_str(&mut out, table_name, name_len);
            }
        }
        out
    }
}
