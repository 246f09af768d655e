//! Deployment queueing, state tracking and orchestration

pub mod fsm;
pub mod orchestrator;
pub mod queue;
pub mod store;
