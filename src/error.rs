//! Status and error taxonomy
//!
//! Table services never signal failure through panics. Every operation
//! returns either a [`TblStatus`] describing a successful (possibly
//! informational or warning) outcome, or a [`TblError`] naming the failure.

use std::io;

use crate::cds::CdsError;

/// Successful outcomes, including informational and warning statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TblStatus {
    /// Operation completed
    Success,
    /// A new image was activated since the caller last looked
    InfoUpdated,
    /// A critical table was restored from the CDS during registration
    InfoRecoveredTbl,
    /// An update could not be applied because an accessor holds the table
    InfoTableLocked,
    /// No update was pending
    InfoNoUpdatePending,
    /// No validation was pending
    InfoNoValidationPending,
    /// An update is waiting to be applied
    InfoUpdatePending,
    /// A validation is waiting to be performed
    InfoValidationPending,
    /// A dump is waiting to be performed
    InfoDumpPending,
    /// Table already registered by the caller; the existing handle was returned
    WarnDuplicate,
    /// Table was requested critical but is registered as a normal table
    WarnNotCritical,
    /// Load image started at offset zero but covered less than the table
    WarnShortFile,
    /// Load image covered a sub-range starting past offset zero
    WarnPartialLoad,
}

impl TblStatus {
    /// True for the `Warn*` outcomes
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            TblStatus::WarnDuplicate
                | TblStatus::WarnNotCritical
                | TblStatus::WarnShortFile
                | TblStatus::WarnPartialLoad
        )
    }
}

/// Error kinds used to classify failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument from the caller
    Argument,
    /// Handle or name does not identify a usable table
    Identity,
    /// A fixed-size resource is exhausted
    Capacity,
    /// Caller lacks the required context
    Access,
    /// Table is not in a state that allows the operation
    State,
    /// Table image file problem
    File,
    /// Failure of an external collaborator
    External,
}

/// Errors returned by table services
#[derive(Debug, thiserror::Error)]
pub enum TblError {
    /// Table name is empty, too long, or unknown
    #[error("invalid table name")]
    InvalidName,
    /// Table size is zero or exceeds the platform maximum
    #[error("invalid table size {0}")]
    InvalidSize(usize),
    /// Option flags form an illegal combination
    #[error("illegal table option combination")]
    InvalidOptions,
    /// File name too long
    #[error("file name too long")]
    FilenameTooLong,

    /// Handle is malformed, stale, or released
    #[error("invalid table handle")]
    InvalidHandle,
    /// Handle refers to a table that is no longer registered
    #[error("table is unregistered")]
    Unregistered,
    /// Table already registered with a different size
    #[error("table already registered with a different size")]
    DuplicateDiffSize,
    /// Table already registered by another application
    #[error("table already registered by another application")]
    DuplicateNotOwned,

    /// Registry has no free slot
    #[error("table registry is full")]
    RegistryFull,
    /// Handle table has no free slot
    #[error("handle table is full")]
    HandlesFull,
    /// No working or staging buffer available
    #[error("no buffer available")]
    NoBufferAvailable,
    /// Dump control queue is full
    #[error("too many dump requests")]
    DumpQueueFull,
    /// Memory pool cannot supply a local table buffer
    #[error("table memory pool exhausted")]
    PoolExhausted,

    /// Caller does not hold the required context for this table
    #[error("caller has no access to table")]
    NoAccess,

    /// Another load is in progress for the table
    #[error("load already in progress")]
    LoadInProgress,
    /// No load is in progress for the table
    #[error("no load in progress")]
    NoLoadPending,
    /// Table has never been loaded
    #[error("table has never been loaded")]
    NeverLoaded,
    /// Table is dump-only and cannot be loaded
    #[error("table is dump only")]
    DumpOnly,
    /// Inactive buffer is not available for this table
    #[error("no inactive buffer")]
    NoInactiveBuffer,
    /// Staged image has not been validated
    #[error("staged image has not been validated")]
    NotValidated,
    /// A dump is already pending for the table
    #[error("dump already pending")]
    DumpAlreadyPending,
    /// Table is still registered, so its CDS block cannot be deleted
    #[error("table is still registered")]
    StillRegistered,
    /// Table is not critical
    #[error("table is not critical")]
    NotCritical,
    /// User-defined address has already been set
    #[error("user buffer already bound")]
    UserBufferBound,

    /// File could not be opened, read, or written
    #[error("file access failed: {0}")]
    Access(#[from] io::Error),
    /// File too short for a standard header
    #[error("missing standard file header")]
    NoStdHeader,
    /// File too short for a table header
    #[error("missing table header")]
    NoTblHeader,
    /// Standard header content type is not a table file
    #[error("bad content type {0:#010x}")]
    BadContentId(u32),
    /// Standard header sub-type is not a table image
    #[error("bad file sub-type {0}")]
    BadSubtypeId(u32),
    /// Image built for another spacecraft
    #[error("bad spacecraft id {0:#x}")]
    BadSpacecraftId(u32),
    /// Image built for another processor
    #[error("bad processor id {0}")]
    BadProcessorId(u32),
    /// Image names a different table
    #[error("file is for table {0}")]
    FileForWrongTable(String),
    /// Partial image offered before the first full load
    #[error("partial load before initial load")]
    PartialLoad,
    /// Image extends past the end of the table
    #[error("image exceeds table size")]
    FileTooLarge,
    /// Image carries no data
    #[error("zero length load")]
    ZeroLengthLoad,
    /// Payload length differs from the declared length
    #[error("load incomplete")]
    LoadIncomplete,

    /// Validation function rejected the image
    #[error("validation failed with code {0}")]
    ValidationFailed(i32),

    /// Startup resource could not be created
    #[error("external resource failure: {0}")]
    ExternalResourceFail(String),
    /// Critical data store failure
    #[error("critical data store: {0}")]
    Cds(#[from] CdsError),
    /// Codec back-end failure
    #[error("codec failure: {0}")]
    Codec(String),
}

impl TblError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        use TblError::*;
        match self {
            InvalidName | InvalidSize(_) | InvalidOptions | FilenameTooLong => ErrorKind::Argument,
            InvalidHandle | Unregistered | DuplicateDiffSize | DuplicateNotOwned => ErrorKind::Identity,
            RegistryFull | HandlesFull | NoBufferAvailable | DumpQueueFull => ErrorKind::Capacity,
            NoAccess => ErrorKind::Access,
            LoadInProgress | NoLoadPending | NeverLoaded | DumpOnly | NoInactiveBuffer
            | NotValidated | DumpAlreadyPending | StillRegistered | NotCritical
            | UserBufferBound | ValidationFailed(_) => ErrorKind::State,
            Access(_) | NoStdHeader | NoTblHeader | BadContentId(_) | BadSubtypeId(_)
            | BadSpacecraftId(_) | BadProcessorId(_) | FileForWrongTable(_) | PartialLoad
            | FileTooLarge | ZeroLengthLoad | LoadIncomplete => ErrorKind::File,
            PoolExhausted | ExternalResourceFail(_) | Cds(_) | Codec(_) => ErrorKind::External,
        }
    }
}

/// Result type for table services operations
pub type Result<T> = std::result::Result<T, TblError>;
