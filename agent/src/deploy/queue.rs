//! Priority queue of deployment tasks.
//!
//! Pending tasks are kept sorted by priority rank (descending) and then by
//! queue time (ascending). A dequeued task moves into the processing set
//! until the orchestrator reports a terminal outcome or the processing
//! timeout evicts it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::models::deployment::{DeploymentTask, Priority};

/// Queue options
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Maximum number of pending tasks
    pub max_size: usize,

    /// Time a dequeued task may stay in processing before it is evicted
    pub processing_timeout: Duration,

    /// Priority given to tasks enqueued without one
    pub default_priority: Priority,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            processing_timeout: Duration::from_secs(5 * 60),
            default_priority: Priority::Normal,
        }
    }
}

/// Queue lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { id: String, priority: Priority },
    Dequeued { id: String },
    Completed { id: String },
    Failed { id: String, reason: String },
    Retried { id: String, retry_count: u32 },
    TimedOut { id: String },
    Removed { id: String },
    Cleared { count: usize },
}

/// Snapshot of the queue for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing_count: usize,
    pub processing: Vec<String>,
    pub by_priority: BTreeMap<Priority, usize>,
    /// Mean time pending tasks have been waiting, in milliseconds
    pub average_wait_ms: i64,
    pub max_size: usize,
}

struct InFlight {
    task: DeploymentTask,
    timeout: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<DeploymentTask>,
    processing: HashMap<String, InFlight>,
}

impl QueueState {
    /// Id of a queued or in-flight rollback of `original`
    fn rollback_of(&self, original: &str) -> Option<&str> {
        self.pending
            .iter()
            .chain(self.processing.values().map(|f| &f.task))
            .find(|t| t.rollback_of.as_deref() == Some(original))
            .map(|t| t.id.as_str())
    }
}

struct Shared {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    notify: Notify,
}

/// Deployment queue, cheap to clone
#[derive(Clone)]
pub struct DeploymentQueue {
    shared: Arc<Shared>,
    options: QueueOptions,
}

impl DeploymentQueue {
    pub fn new(options: QueueOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                events,
                notify: Notify::new(),
            }),
            options,
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until a task is enqueued
    pub async fn notified(&self) {
        self.shared.notify.notified().await;
    }

    /// Add a task, returning its position in the pending list
    pub fn enqueue(&self, mut task: DeploymentTask) -> Result<usize, DeployError> {
        if task.id.trim().is_empty() {
            return Err(DeployError::ValidationError(
                "enqueue: task id is required".to_string(),
            ));
        }
        if task.target().is_none() {
            return Err(DeployError::ValidationError(format!(
                "enqueue: task {} has no target",
                task.id
            )));
        }

        let priority = *task.priority.get_or_insert(self.options.default_priority);
        let id = task.id.clone();

        let position = {
            let mut state = self.lock();
            if state.processing.contains_key(&id) || state.pending.iter().any(|t| t.id == id) {
                return Err(DeployError::DuplicateTask(id));
            }
            if let Some(original) = &task.rollback_of {
                if let Some(existing) = state.rollback_of(original) {
                    return Err(DeployError::ValidationError(format!(
                        "enqueue: deployment {} is already being rolled back by {}",
                        original, existing
                    )));
                }
            }
            if state.pending.len() >= self.options.max_size {
                return Err(DeployError::Capacity {
                    max_size: self.options.max_size,
                });
            }
            insert_sorted(&mut state.pending, task)
        };

        info!("Enqueued task {} with priority {} at position {}", id, priority.as_str(), position);
        self.emit(QueueEvent::Enqueued { id, priority });
        self.shared.notify.notify_one();
        Ok(position)
    }

    /// Pop the head of the queue and arm its processing timeout
    pub fn dequeue(&self) -> Option<DeploymentTask> {
        let task = {
            let mut state = self.lock();
            if state.pending.is_empty() {
                return None;
            }
            let task = state.pending.remove(0);
            let timeout = self.arm_timeout(&task.id);
            state.processing.insert(
                task.id.clone(),
                InFlight {
                    task: task.clone(),
                    timeout,
                },
            );
            task
        };

        debug!("Dequeued task {}", task.id);
        self.emit(QueueEvent::Dequeued {
            id: task.id.clone(),
        });
        Some(task)
    }

    fn arm_timeout(&self, id: &str) -> JoinHandle<()> {
        let queue = self.clone();
        let id = id.to_string();
        let timeout = self.options.processing_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let evicted = queue.lock().processing.remove(&id).is_some();
            if evicted {
                warn!("Task {} exceeded processing timeout of {:?}, evicted", id, timeout);
                queue.emit(QueueEvent::TimedOut { id });
            }
        })
    }

    fn take_processing(&self, id: &str) -> Option<DeploymentTask> {
        let in_flight = self.lock().processing.remove(id)?;
        in_flight.timeout.abort();
        Some(in_flight.task)
    }

    /// Remove a task from processing after success. Idempotent.
    pub fn mark_completed(&self, id: &str) -> bool {
        let removed = self.take_processing(id).is_some();
        if removed {
            self.emit(QueueEvent::Completed { id: id.to_string() });
        }
        removed
    }

    /// Remove a task from processing after failure. Idempotent.
    pub fn mark_failed(&self, id: &str, reason: &str) -> bool {
        let removed = self.take_processing(id).is_some();
        if removed {
            self.emit(QueueEvent::Failed {
                id: id.to_string(),
                reason: reason.to_string(),
            });
        }
        removed
    }

    /// Move an in-flight task back into the queue with elevated priority
    pub fn retry(&self, id: &str) -> Result<DeploymentTask, DeployError> {
        let mut state = self.lock();
        let in_flight = state
            .processing
            .get(id)
            .ok_or_else(|| DeployError::NotFound(format!("retry: task {} is not in progress", id)))?;

        let task = &in_flight.task;
        if task.retry_count >= task.max_retries {
            return Err(DeployError::RetriesExhausted {
                id: id.to_string(),
                attempts: task.retry_count,
            });
        }
        if state.pending.len() >= self.options.max_size {
            return Err(DeployError::Capacity {
                max_size: self.options.max_size,
            });
        }

        let Some(in_flight) = state.processing.remove(id) else {
            return Err(DeployError::NotFound(format!("retry: task {} is not in progress", id)));
        };
        in_flight.timeout.abort();

        let mut task = in_flight.task;
        task.retry_count += 1;
        task.priority = Some(task.effective_priority().max(Priority::High));
        task.queued_at = Utc::now();
        let retried = task.clone();
        insert_sorted(&mut state.pending, task);
        drop(state);

        info!("Retrying task {} (attempt {}/{})", id, retried.retry_count, retried.max_retries);
        self.emit(QueueEvent::Retried {
            id: id.to_string(),
            retry_count: retried.retry_count,
        });
        self.shared.notify.notify_one();
        Ok(retried)
    }

    /// Drop a queued task. In-flight tasks are not affected.
    pub fn remove(&self, id: &str) -> Option<DeploymentTask> {
        let removed = {
            let mut state = self.lock();
            let index = state.pending.iter().position(|t| t.id == id)?;
            state.pending.remove(index)
        };
        self.emit(QueueEvent::Removed { id: id.to_string() });
        Some(removed)
    }

    /// Drop every queued task, returning how many were removed
    pub fn clear(&self) -> usize {
        let count = {
            let mut state = self.lock();
            let count = state.pending.len();
            state.pending.clear();
            count
        };
        info!("Cleared {} queued tasks", count);
        self.emit(QueueEvent::Cleared { count });
        count
    }

    /// Whether the id is queued or in flight
    pub fn contains(&self, id: &str) -> bool {
        let state = self.lock();
        state.processing.contains_key(id) || state.pending.iter().any(|t| t.id == id)
    }

    /// Id of a queued or in-flight rollback of `original_id`
    pub fn pending_rollback(&self, original_id: &str) -> Option<String> {
        self.lock().rollback_of(original_id).map(str::to_string)
    }

    pub fn is_processing(&self, id: &str) -> bool {
        self.lock().processing.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Pending tasks in dequeue order
    pub fn pending(&self) -> Vec<DeploymentTask> {
        self.lock().pending.clone()
    }

    pub fn status(&self) -> QueueStatus {
        self.status_at(Utc::now())
    }

    fn status_at(&self, now: DateTime<Utc>) -> QueueStatus {
        let state = self.lock();

        let mut by_priority = BTreeMap::new();
        for task in &state.pending {
            *by_priority.entry(task.effective_priority()).or_insert(0) += 1;
        }

        let average_wait_ms = if state.pending.is_empty() {
            0
        } else {
            let total: i64 = state
                .pending
                .iter()
                .map(|t| (now - t.queued_at).num_milliseconds().max(0))
                .sum();
            total / state.pending.len() as i64
        };

        let mut processing: Vec<String> = state.processing.keys().cloned().collect();
        processing.sort();

        QueueStatus {
            queue_length: state.pending.len(),
            processing_count: state.processing.len(),
            processing,
            by_priority,
            average_wait_ms,
            max_size: self.options.max_size,
        }
    }
}

/// Insert keeping (rank desc, queued_at asc). Equal keys keep insertion order.
fn insert_sorted(pending: &mut Vec<DeploymentTask>, task: DeploymentTask) -> usize {
    let rank = task.effective_priority().rank();
    let position = pending.partition_point(|t| {
        let r = t.effective_priority().rank();
        r > rank || (r == rank && t.queued_at <= task.queued_at)
    });
    pending.insert(position, task);
    position
}
