//! Remote operations executed through external command programs

pub mod coordinator;
pub mod executor;
pub mod memory;
pub mod operations;
pub mod workflow;
