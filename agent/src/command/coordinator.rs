//! Command channel coordinator.
//!
//! Owns the `filesystem` and `repository` connections, tests them with a
//! no-op probe, health-checks them on an interval and runs time-boxed
//! operations through the configured [`CommandExecutor`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::command::executor::{CommandExecutor, Invocation};
use crate::command::operations::{
    Channel, ContentOutput, DirEntry, FileInfo, ListingOutput, Operation,
};
use crate::errors::DeployError;

/// One channel's process reference
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ConnectionOptions {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub filesystem: ConnectionOptions,
    pub repository: ConnectionOptions,

    /// Arguments appended to a connection's base args for the probe call
    pub probe_args: Vec<String>,

    /// Interval between health-check passes
    pub health_check_interval: Duration,

    /// Failed tests tolerated before a connection stays in error
    pub max_retries: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            filesystem: ConnectionOptions::new("network-fs"),
            repository: ConnectionOptions::new("repository"),
            probe_args: vec!["ping".to_string()],
            health_check_interval: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A named command channel and its health
#[derive(Debug, Clone, Serialize)]
pub struct CommandConnection {
    pub name: Channel,
    pub program: String,
    pub args: Vec<String>,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub state: ConnectionState,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl CommandConnection {
    fn new(name: Channel, options: &ConnectionOptions) -> Self {
        Self {
            name,
            program: options.program.clone(),
            args: options.args.clone(),
            timeout: options.timeout,
            state: ConnectionState::Disconnected,
            last_health_check: None,
            last_error: None,
            retry_count: 0,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected { connection: Channel },
    ConnectionLost { connection: Channel, reason: String },
    ConnectionRestored { connection: Channel },
    RetriesExhausted { connection: Channel },
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Override the connection timeout
    pub timeout: Option<Duration>,

    /// Run even when the connection is not known to be healthy
    pub skip_connection_test: bool,
}

/// Command coordinator
pub struct CommandCoordinator {
    executor: Arc<dyn CommandExecutor>,
    options: CoordinatorOptions,
    connections: RwLock<BTreeMap<Channel, CommandConnection>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl CommandCoordinator {
    pub fn new(executor: Arc<dyn CommandExecutor>, options: CoordinatorOptions) -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(
            Channel::Filesystem,
            CommandConnection::new(Channel::Filesystem, &options.filesystem),
        );
        connections.insert(
            Channel::Repository,
            CommandConnection::new(Channel::Repository, &options.repository),
        );
        let (events, _) = broadcast::channel(64);

        Self {
            executor,
            options,
            connections: RwLock::new(connections),
            events,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every connection
    pub fn connections(&self) -> Vec<CommandConnection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.values().cloned().collect()
    }

    pub fn connection(&self, channel: Channel) -> Option<CommandConnection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.get(&channel).cloned()
    }

    fn update<R>(&self, channel: Channel, f: impl FnOnce(&mut CommandConnection) -> R) -> Option<R> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.get_mut(&channel).map(f)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Initialize every connection, logging the ones that fail
    pub async fn initialize(&self) {
        for channel in Channel::ALL {
            if let Err(e) = self.initialize_connection(channel).await {
                warn!("Connection {} failed to initialize: {}", channel, e);
            }
        }
    }

    /// Check reachability and run the probe, ending CONNECTED or ERROR
    pub async fn initialize_connection(&self, channel: Channel) -> Result<(), DeployError> {
        let Some((program, args, timeout, previous)) = self.update(channel, |c| {
            let previous = c.state;
            c.state = ConnectionState::Connecting;
            (c.program.clone(), c.args.clone(), c.timeout, previous)
        }) else {
            return Err(DeployError::NotFound(format!("connection {}", channel)));
        };

        debug!("Testing connection {} ({})", channel, program);
        let result = self.probe(channel, &program, &args, timeout).await;
        let now = Utc::now();

        match result {
            Ok(()) => {
                self.update(channel, |c| {
                    c.state = ConnectionState::Connected;
                    c.last_health_check = Some(now);
                    c.last_error = None;
                    c.retry_count = 0;
                });
                if previous == ConnectionState::Error {
                    info!("Connection {} restored", channel);
                    self.emit(ConnectionEvent::ConnectionRestored { connection: channel });
                } else {
                    info!("Connection {} established", channel);
                    self.emit(ConnectionEvent::Connected { connection: channel });
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let (retry_count, exhausted) = self
                    .update(channel, |c| {
                        c.state = ConnectionState::Error;
                        c.last_health_check = Some(now);
                        c.last_error = Some(message.clone());
                        c.retry_count += 1;
                        (c.retry_count, c.retry_count >= self.options.max_retries)
                    })
                    .unwrap_or((0, false));

                warn!(
                    "Connection {} test failed ({}/{}): {}",
                    channel, retry_count, self.options.max_retries, message
                );
                if previous != ConnectionState::Error {
                    self.emit(ConnectionEvent::ConnectionLost {
                        connection: channel,
                        reason: message.clone(),
                    });
                }
                if exhausted {
                    error!("Connection {} exhausted its retries", channel);
                    self.emit(ConnectionEvent::RetriesExhausted { connection: channel });
                }
                Err(DeployError::Connection {
                    connection: channel.to_string(),
                    message,
                })
            }
        }
    }

    /// Reset the retry budget and test the connection again
    pub async fn reinitialize_connection(&self, channel: Channel) -> Result<(), DeployError> {
        self.update(channel, |c| {
            c.retry_count = 0;
            c.state = ConnectionState::Disconnected;
        });
        self.initialize_connection(channel).await
    }

    async fn probe(
        &self,
        channel: Channel,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<(), DeployError> {
        if !self.executor.is_reachable(program).await {
            return Err(DeployError::Connection {
                connection: channel.to_string(),
                message: format!("program '{}' is not reachable", program),
            });
        }

        let mut probe_args = args.to_vec();
        probe_args.extend(self.options.probe_args.iter().cloned());
        let invocation = Invocation {
            program: program.to_string(),
            args: probe_args,
            operation: "probe".to_string(),
            input: Value::Object(Default::default()),
        };

        let output = self.executor.execute(&invocation, timeout).await?;
        if !output.success() {
            return Err(DeployError::CommandExecution {
                operation: "probe".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Re-test connected channels and retry failed ones within their budget
    pub async fn health_check_pass(&self) -> Vec<CommandConnection> {
        for connection in self.connections() {
            match connection.state {
                ConnectionState::Connected | ConnectionState::Disconnected => {}
                ConnectionState::Error if connection.retry_count < self.options.max_retries => {}
                _ => {
                    debug!("Skipping health check for {}", connection.name);
                    continue;
                }
            }
            // failures are recorded on the connection
            let _ = self.initialize_connection(connection.name).await;
        }
        self.connections()
    }

    /// Run one operation on `channel`
    pub async fn execute_command(
        &self,
        channel: Channel,
        operation: &Operation,
        options: ExecuteOptions,
    ) -> Result<Value, DeployError> {
        if operation.channel() != channel {
            return Err(DeployError::ValidationError(format!(
                "{}: operation belongs to the {} channel, not {}",
                operation.name(),
                operation.channel(),
                channel
            )));
        }

        let connection = self
            .connection(channel)
            .ok_or_else(|| DeployError::NotFound(format!("connection {}", channel)))?;

        if connection.state != ConnectionState::Connected {
            if connection.retry_count >= self.options.max_retries {
                return Err(DeployError::Connection {
                    connection: channel.to_string(),
                    message: format!(
                        "{}: retries exhausted, last error: {}",
                        operation.name(),
                        connection.last_error.as_deref().unwrap_or("unknown")
                    ),
                });
            }
            if !options.skip_connection_test {
                self.initialize_connection(channel).await?;
            }
        }

        let mut args = connection.args.clone();
        args.push(operation.name().to_string());
        let invocation = Invocation {
            program: connection.program.clone(),
            args,
            operation: operation.name().to_string(),
            input: operation.params(),
        };
        let timeout = options.timeout.unwrap_or(connection.timeout);

        debug!("Executing {} on {} ({})", operation.name(), channel, operation.target());
        let output = match self.executor.execute(&invocation, timeout).await {
            Ok(output) => output,
            Err(e @ (DeployError::Timeout { .. } | DeployError::Connection { .. })) => {
                self.mark_lost(channel, &e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if !output.success() {
            return Err(DeployError::CommandExecution {
                operation: operation.name().to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout).map_err(|e| DeployError::CommandExecution {
            operation: operation.name().to_string(),
            exit_code: output.exit_code,
            stderr: format!("invalid JSON output: {}", e),
        })
    }

    /// Run an operation given by wire name
    pub async fn execute_named(
        &self,
        name: &str,
        params: Value,
        options: ExecuteOptions,
    ) -> Result<Value, DeployError> {
        let operation = Operation::from_name(name, params)?;
        self.execute_command(operation.channel(), &operation, options)
            .await
    }

    async fn run(&self, operation: Operation) -> Result<Value, DeployError> {
        self.execute_command(operation.channel(), &operation, ExecuteOptions::default())
            .await
    }

    fn mark_lost(&self, channel: Channel, err: &DeployError) {
        let reason = err.to_string();
        let was_connected = self
            .update(channel, |c| {
                let was_connected = c.state != ConnectionState::Error;
                c.state = ConnectionState::Error;
                c.last_error = Some(reason.clone());
                was_connected
            })
            .unwrap_or(false);

        error!("Connection {} lost: {}", channel, reason);
        if was_connected {
            self.emit(ConnectionEvent::ConnectionLost {
                connection: channel,
                reason,
            });
        }
    }

    /// Mark every connection disconnected
    pub fn shutdown(&self) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        for connection in connections.values_mut() {
            connection.state = ConnectionState::Disconnected;
        }
        info!("Command connections closed");
    }

    pub async fn list_directory(&self, path: &str, recursive: bool) -> Result<Vec<DirEntry>, DeployError> {
        let value = self
            .run(Operation::ListDirectory {
                path: path.to_string(),
                recursive,
            })
            .await?;
        Ok(parse_or_default::<ListingOutput>(value)?.entries)
    }

    pub async fn read_file(&self, path: &str) -> Result<String, DeployError> {
        let value = self
            .run(Operation::ReadFile {
                path: path.to_string(),
            })
            .await?;
        Ok(parse_or_default::<ContentOutput>(value)?.content)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), DeployError> {
        self.run(Operation::WriteFile {
            path: path.to_string(),
            content: content.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), DeployError> {
        self.run(Operation::DeleteFile {
            path: path.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), DeployError> {
        self.run(Operation::CreateDirectory {
            path: path.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn get_file_info(&self, path: &str) -> Result<FileInfo, DeployError> {
        let value = self
            .run(Operation::GetFileInfo {
                path: path.to_string(),
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_file_contents(
        &self,
        repository: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<String, DeployError> {
        let value = self
            .run(Operation::GetFileContents {
                repository: repository.to_string(),
                path: path.to_string(),
                reference: reference.map(str::to_string),
            })
            .await?;
        Ok(parse_or_default::<ContentOutput>(value)?.content)
    }

    pub async fn list_repository_directory(
        &self,
        repository: &str,
        path: &str,
        reference: Option<&str>,
    ) -> Result<Vec<DirEntry>, DeployError> {
        let value = self
            .run(Operation::ListRepositoryDirectory {
                repository: repository.to_string(),
                path: path.to_string(),
                reference: reference.map(str::to_string),
            })
            .await?;
        Ok(parse_or_default::<ListingOutput>(value)?.entries)
    }
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(value: Value) -> Result<T, DeployError> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value)?)
}
