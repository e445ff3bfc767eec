//! Table Services - registration, loading, validation, activation and dumping
//! of application configuration tables for flight software.
//!
//! # Overview
//!
//! Applications register named, fixed-size tables and read them through
//! handles. New images are staged into a working buffer from a file or from
//! memory, optionally validated, and made active only when the owning
//! application calls `manage` or `update` at a point where no reader holds the
//! old image.
//!
//! The crate has two halves:
//!
//! 1. [`TableServices`], the API applications call. All table state lives
//!    behind one registry mutex; events and software bus messages produced by
//!    a call are delivered after the mutex is released.
//! 2. [`TblTask`], the table services task. It drains a bounded command pipe
//!    on its own thread, runs ground commands, writes dump files, and publishes
//!    housekeeping telemetry.
//!
//! # Key Features
//!
//! - Single- and double-buffered tables, with shared load buffers for the
//!   single-buffered ones
//! - Dump-only tables whose image lives in application memory
//! - Critical tables mirrored to a critical data store and restored on warm
//!   restart
//! - Table image files with a standard header, optionally encoded through an
//!   Electronic Data Sheet codec
//!
//! # Usage
//!
//! The library is typically used by:
//! 1. Building a [`Platform`] for the clock, events, bus, application
//!    directory and critical data store
//! 2. Initializing table services with [`init_table_services`]
//! 3. Starting the task with [`start_task`]
//! 4. Registering, loading and managing tables from applications

#![deny(missing_docs)]

mod access;
pub mod buffer;
pub mod cds;
pub mod codec;
pub mod config;
mod dump;
pub mod error;
pub mod file;
pub mod platform;
pub mod registry;
pub mod resource_id;
mod services;
pub mod task;
mod transaction;
mod validation;

pub use buffer::{BufferSelect, TableData};
pub use config::TblConfig;
pub use error::{Result, TblError, TblStatus};
pub use platform::{AppId, Platform};
pub use registry::{TableInfo, TableOptions, ValidationFn};
pub use resource_id::{RegId, TblHandle};
pub use services::{LastUpdate, LoadSource, RegistryCounts, TableServices};
pub use task::TblTask;
pub use validation::{ValidationRequest, ValidationState};

use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::thread;

/// Global table services instance
static TABLE_SERVICES: OnceCell<Arc<TableServices>> = OnceCell::new();

/// Initialize the global table services instance
///
/// The first successful call wins; later calls return the existing instance.
pub fn init_table_services(config: TblConfig, platform: Platform) -> Result<Arc<TableServices>> {
    TABLE_SERVICES
        .get_or_try_init(|| TableServices::new(config, platform).map(Arc::new))
        .cloned()
}

/// Get the global table services instance, if initialized
pub fn table_services() -> Option<Arc<TableServices>> {
    TABLE_SERVICES.get().cloned()
}

/// Create the table services task for `services` and start its thread
///
/// # Returns
///
/// The task, for sending commands and stopping it, and the join handle of its
/// thread
pub fn start_task(services: Arc<TableServices>) -> std::io::Result<(Arc<TblTask>, thread::JoinHandle<()>)> {
    let task = Arc::new(TblTask::new(services));
    let handle = task.spawn()?;
    Ok((task, handle))
}
