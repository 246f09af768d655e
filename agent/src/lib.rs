//! confdeploy library
//!
//! Queued deployment of configuration trees through external command
//! programs, with verified backups, a persisted catalog and rollback.

pub mod app;
pub mod backup;
pub mod command;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
