//! Connection health-check worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::coordinator::{CommandCoordinator, ConnectionState};

/// Health-check worker options
#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Run the health-check worker
pub async fn run<S, F>(
    options: &Options,
    coordinator: &CommandCoordinator,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Health-check worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Health-check worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        debug!("Checking command connections...");
        for connection in coordinator.health_check_pass().await {
            if connection.state != ConnectionState::Connected {
                warn!(
                    "Connection {} is {:?} (retries: {}, last error: {})",
                    connection.name,
                    connection.state,
                    connection.retry_count,
                    connection.last_error.as_deref().unwrap_or("none")
                );
            }
        }
    }
}
