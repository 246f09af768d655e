//! Background workers

pub mod deployer;
pub mod health;
pub mod retention;
