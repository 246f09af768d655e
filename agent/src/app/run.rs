//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions, ServerOptions};
use crate::app::state::AppState;
use crate::backup::manager::BackupManager;
use crate::command::coordinator::CommandCoordinator;
use crate::command::executor::CommandExecutor;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::DeployError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{deployer, health, retention};

/// Run the service until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    executor: Arc<dyn CommandExecutor>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    info!("Initializing confdeploy...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, executor, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    executor: Arc<dyn CommandExecutor>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DeployError> {
    options.layout.setup().await?;

    let app_state = Arc::new(AppState::init(options, executor).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_deployer_worker(
        options.deployer.clone(),
        app_state.orchestrator.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if let Some(health_options) = &options.health {
        init_health_worker(
            health_options.clone(),
            app_state.coordinator.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if let (Some(retention_options), Some(backups)) = (&options.retention, &app_state.backups) {
        init_retention_worker(
            retention_options.clone(),
            backups.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if let Some(server_options) = &options.server {
        init_socket_server(
            server_options,
            app_state.as_ref(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(())
}

fn init_deployer_worker(
    options: deployer::Options,
    orchestrator: Arc<Orchestrator>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing deployer worker...");

    let handle = tokio::spawn(async move {
        deployer::run(
            &options,
            orchestrator.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(handle)
}

fn init_health_worker(
    options: health::Options,
    coordinator: Arc<CommandCoordinator>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing health-check worker...");

    let handle = tokio::spawn(async move {
        health::run(
            &options,
            coordinator.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_health_worker_handle(handle)
}

fn init_retention_worker(
    options: retention::Options,
    backups: Arc<BackupManager>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing retention worker...");

    let handle = tokio::spawn(async move {
        retention::run(
            &options,
            backups.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_retention_worker_handle(handle)
}

async fn init_socket_server(
    options: &ServerOptions,
    app_state: &AppState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::from(app_state);
    let handle = serve(options, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_socket_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), DeployError>>>,
    deployer_worker_handle: Option<JoinHandle<()>>,
    health_worker_handle: Option<JoinHandle<()>>,
    retention_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
            deployer_worker_handle: None,
            health_worker_handle: None,
            retention_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), DeployError> {
        if self.app_state.is_some() {
            return Err(DeployError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.deployer_worker_handle.is_some() {
            return Err(DeployError::ShutdownError("deployer_handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_health_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.health_worker_handle.is_some() {
            return Err(DeployError::ShutdownError("health_handle already set".to_string()));
        }
        self.health_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_retention_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.retention_worker_handle.is_some() {
            return Err(DeployError::ShutdownError("retention_handle already set".to_string()));
        }
        self.retention_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeployError>>,
    ) -> Result<(), DeployError> {
        if self.socket_server_handle.is_some() {
            return Err(DeployError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeployError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeployError> {
        info!("Shutting down confdeploy...");

        // 1. Socket server, so no new triggers arrive
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))??;
        }

        // 2. Deployer worker, marks the in-flight task failed
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 3. Background workers
        if let Some(handle) = self.health_worker_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }
        if let Some(handle) = self.retention_worker_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 4. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
