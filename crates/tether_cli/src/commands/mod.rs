//! CLI command implementations.

pub mod backups;
pub mod status;
