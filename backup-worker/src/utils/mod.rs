//! Utility modules for the backup worker.

pub mod errors;
pub mod logger;

pub use errors::{Result, WorkerError};
