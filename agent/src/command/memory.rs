//! In-memory command executor.
//!
//! Serves the operation vocabulary from an in-memory remote tree and
//! in-memory repositories, with per-program and per-operation failure
//! injection and a log of every invocation it was asked to spawn.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::command::executor::{CommandExecutor, CommandOutput, Invocation};
use crate::command::operations::{DirEntry, EntryKind, Operation};
use crate::errors::DeployError;

/// Injected failure
#[derive(Debug, Clone)]
pub enum Failure {
    /// Exit with the given code and stderr
    Exit { code: i32, stderr: String },

    /// Behave like a process killed at its deadline
    Timeout,
}

#[derive(Debug, Clone)]
struct Injected {
    failure: Failure,
    /// `None` fails forever
    remaining: Option<u32>,
}

#[derive(Default)]
struct MemoryState {
    remote: BTreeMap<String, String>,
    repositories: HashMap<String, BTreeMap<String, String>>,
    unreachable: HashSet<String>,
    program_failures: HashMap<String, Injected>,
    operation_failures: HashMap<String, Injected>,
    invocations: Vec<Invocation>,
}

/// Executor backed by in-memory state
#[derive(Default)]
pub struct MemoryExecutor {
    state: Mutex<MemoryState>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_remote_file(&self, path: &str, content: &str) {
        self.lock()
            .remote
            .insert(normalize(path), content.to_string());
    }

    pub fn remote_file(&self, path: &str) -> Option<String> {
        self.lock().remote.get(&normalize(path)).cloned()
    }

    /// Every remote file, keyed by absolute path
    pub fn remote_files(&self) -> BTreeMap<String, String> {
        self.lock().remote.clone()
    }

    pub fn remove_remote_file(&self, path: &str) -> Option<String> {
        self.lock().remote.remove(&normalize(path))
    }

    pub fn put_repository_file(&self, repository: &str, path: &str, content: &str) {
        self.lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .insert(normalize(path), content.to_string());
    }

    pub fn set_unreachable(&self, program: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(program.to_string());
        } else {
            state.unreachable.remove(program);
        }
    }

    /// Fail every invocation of `program`, probes included
    pub fn fail_program(&self, program: &str, failure: Failure) {
        self.lock().program_failures.insert(
            program.to_string(),
            Injected {
                failure,
                remaining: None,
            },
        );
    }

    /// Fail invocations of `operation`, `times` times or forever
    pub fn fail_operation(&self, operation: &str, failure: Failure, times: Option<u32>) {
        self.lock().operation_failures.insert(
            operation.to_string(),
            Injected {
                failure,
                remaining: times,
            },
        );
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.program_failures.clear();
        state.operation_failures.clear();
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Number of processes that would have been spawned
    pub fn spawn_count(&self) -> usize {
        self.lock().invocations.len()
    }

    /// Invocations of one operation
    pub fn count_operation(&self, operation: &str) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|i| i.operation == operation)
            .count()
    }
}

fn take_failure(failures: &mut HashMap<String, Injected>, key: &str) -> Option<Failure> {
    let injected = failures.get_mut(key)?;
    let failure = injected.failure.clone();
    match injected.remaining.as_mut() {
        Some(0) => {
            failures.remove(key);
            return None;
        }
        Some(remaining) => {
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(key);
            }
        }
        None => {}
    }
    Some(failure)
}

#[async_trait]
impl CommandExecutor for MemoryExecutor {
    async fn is_reachable(&self, program: &str) -> bool {
        !self.lock().unreachable.contains(program)
    }

    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let mut state = self.lock();
        state.invocations.push(invocation.clone());

        if state.unreachable.contains(&invocation.program) {
            return Err(DeployError::Connection {
                connection: invocation.program.clone(),
                message: format!("failed to spawn for '{}': not found", invocation.operation),
            });
        }

        let failure = match take_failure(&mut state.program_failures, &invocation.program) {
            Some(failure) => Some(failure),
            None => take_failure(&mut state.operation_failures, &invocation.operation),
        };
        match failure {
            Some(Failure::Timeout) => {
                return Err(DeployError::Timeout {
                    operation: invocation.operation.clone(),
                    timeout,
                })
            }
            Some(Failure::Exit { code, stderr }) => return Ok(output(code, String::new(), stderr)),
            None => {}
        }

        if invocation.operation == "probe" {
            return Ok(output(0, json!({"ok": true}).to_string(), String::new()));
        }

        let operation = Operation::from_name(&invocation.operation, invocation.input.clone())?;
        match apply(&mut state, operation) {
            Ok(value) => Ok(output(0, value.to_string(), String::new())),
            Err(message) => Ok(output(1, String::new(), message)),
        }
    }
}

fn output(exit_code: i32, stdout: String, stderr: String) -> CommandOutput {
    CommandOutput {
        stdout,
        stderr,
        exit_code,
        duration: Duration::ZERO,
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Entries under `dir`, with paths relative to it
fn list(tree: &BTreeMap<String, String>, dir: &str, recursive: bool) -> Vec<DirEntry> {
    let dir = normalize(dir);
    let prefix = match dir.as_str() {
        "" | "." => String::new(),
        "/" => "/".to_string(),
        d => format!("{}/", d),
    };

    let mut files = BTreeMap::new();
    let mut dirs = BTreeSet::new();
    for (path, content) in tree.range(prefix.clone()..) {
        let Some(relative) = path.strip_prefix(&prefix) else {
            break;
        };
        let parts: Vec<&str> = relative.split('/').collect();
        if recursive {
            for depth in 1..parts.len() {
                dirs.insert(parts[..depth].join("/"));
            }
            files.insert(relative.to_string(), content.len() as u64);
        } else if parts.len() == 1 {
            files.insert(relative.to_string(), content.len() as u64);
        } else {
            dirs.insert(parts[0].to_string());
        }
    }

    let mut entries: Vec<DirEntry> = dirs
        .into_iter()
        .map(|path| DirEntry {
            path,
            kind: EntryKind::Directory,
            size: None,
        })
        .collect();
    entries.extend(files.into_iter().map(|(path, size)| DirEntry {
        path,
        kind: EntryKind::File,
        size: Some(size),
    }));
    entries
}

fn apply(state: &mut MemoryState, operation: Operation) -> Result<Value, String> {
    match operation {
        Operation::ListDirectory { path, recursive } => {
            let entries = list(&state.remote, &path, recursive);
            Ok(json!({ "entries": entries }))
        }
        Operation::ReadFile { path } => state
            .remote
            .get(&normalize(&path))
            .map(|content| json!({ "content": content }))
            .ok_or_else(|| format!("ENOENT: no such file: {}", path)),
        Operation::WriteFile { path, content } => {
            state.remote.insert(normalize(&path), content);
            Ok(json!({ "written": path }))
        }
        Operation::DeleteFile { path } => state
            .remote
            .remove(&normalize(&path))
            .map(|_| json!({ "deleted": path }))
            .ok_or_else(|| format!("ENOENT: no such file: {}", path)),
        // directories are implicit in the tree
        Operation::CreateDirectory { path } => Ok(json!({ "created": path })),
        Operation::GetFileInfo { path } => state
            .remote
            .get(&normalize(&path))
            .map(|content| json!({ "path": path, "type": "file", "size": content.len() }))
            .ok_or_else(|| format!("ENOENT: no such file: {}", path)),
        Operation::GetRepository { repository } => state
            .repositories
            .get(&repository)
            .map(|files| json!({ "name": repository, "files": files.len() }))
            .ok_or_else(|| format!("repository not found: {}", repository)),
        Operation::ListCommits { repository, .. } => state
            .repositories
            .get(&repository)
            .map(|_| json!({ "commits": [] }))
            .ok_or_else(|| format!("repository not found: {}", repository)),
        Operation::GetFileContents {
            repository, path, ..
        } => state
            .repositories
            .get(&repository)
            .and_then(|files| files.get(&normalize(&path)))
            .map(|content| json!({ "content": content }))
            .ok_or_else(|| format!("not found: {}/{}", repository, path)),
        Operation::ListRepositoryDirectory {
            repository, path, ..
        } => state
            .repositories
            .get(&repository)
            .map(|files| json!({ "entries": list(files, &path, false) }))
            .ok_or_else(|| format!("repository not found: {}", repository)),
        Operation::CreatePullRequest {
            repository, title, ..
        } => Ok(json!({ "repository": repository, "title": title, "number": 1 })),
    }
}
