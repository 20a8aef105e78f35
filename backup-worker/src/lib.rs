//! Backup Worker Library
//!
//! Cluster-wide backup and restore coordination for a sharded, replicated
//! graph store: consistent multi-group backups into a manifest chain, and
//! restores replayed through each group's consensus log.

pub mod backup;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod destination;
pub mod manifest;
pub mod membership;
pub mod metrics;
pub mod restore;
pub mod tasks;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, WorkerError};
pub use worker::Worker;
