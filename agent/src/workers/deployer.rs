//! Deployment worker draining the queue

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::orchestrator::Orchestrator;

/// Reason recorded on a task interrupted by shutdown
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Wake-up interval when no enqueue notification arrives
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Run the deployer worker.
///
/// Waits for an enqueue notification (or the interval), then drains the
/// queue. A shutdown during a drain abandons the in-flight task, which is
/// recorded as failed.
pub async fn run<S, F>(
    options: &Options,
    orchestrator: &Orchestrator,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Deployer worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker shutting down...");
                return;
            }
            _ = orchestrator.queue().notified() => {}
            _ = sleep_fn(options.interval) => {}
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                if let Some(id) = orchestrator.fail_in_flight(SHUTDOWN_REASON).await {
                    warn!("Deployment {} interrupted by shutdown", id);
                }
                info!("Deployer worker shutting down...");
                return;
            }
            executed = orchestrator.process_queue() => {
                if executed > 0 {
                    debug!("Processed {} queued tasks", executed);
                }
            }
        }
    }
}
