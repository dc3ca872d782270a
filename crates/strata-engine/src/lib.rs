//! Strata backup engine.
//!
//! A [`Controller`] drives backup, restore, purge, delete, list and repair
//! against one local catalog and one remote target:
//!
//! - source files are split into fixed-size blocks and deduplicated by
//!   BLAKE3 digest ([`strata_cas`]),
//! - new blocks are packed into volumes ([`strata_pack`]), encrypted
//!   ([`strata_crypto`]) and uploaded by a worker pool,
//! - versions, file entries and block reference counts live in an LMDB
//!   catalog ([`strata_catalog`]),
//! - user-visible events are fanned out by a [`LogRouter`].
//!
//! Running operations can be stopped cooperatively or aborted through a
//! [`TaskControl`].

pub mod backend;
mod backup;
pub mod control;
mod controller;
pub mod error;
pub mod filter;
mod lock;
pub mod log_router;
pub mod options;
mod purge;
pub mod remote;
mod repair;
mod restore;
pub mod results;
pub mod retention;
pub mod testing;
mod upload;

pub use control::{OperationState, TaskControl};
pub use controller::{message_ids, Controller, UnitObserver};
pub use error::{EngineError, Result};
pub use filter::PathFilter;
pub use log_router::{
    LogDestination, LogEntry, LogFilter, LogLevel, LogRouter, MemoryDestination,
    StreamDestination, TracingDestination,
};
pub use options::Options;
pub use remote::{RemoteFile, RemoteFileKind};
pub use restore::RestoreRequest;
pub use results::{
    BackupResults, DeleteResults, PurgeResults, RepairResults, Report, RestoreResults,
};

pub use strata_catalog::{FileRecord, FilesetRecord, FilesetStatus};
