//! Shared data models

pub mod backup;
pub mod deployment;
