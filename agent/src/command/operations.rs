//! Closed vocabulary of channel operations and their result shapes

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DeployError;

/// Named command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Remote configuration tree
    Filesystem,

    /// Source repository
    Repository,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Filesystem, Channel::Repository];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Filesystem => "filesystem",
            Channel::Repository => "repository",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum Operation {
    ListDirectory {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
    CreateDirectory {
        path: String,
    },
    GetFileInfo {
        path: String,
    },
    GetRepository {
        repository: String,
    },
    ListCommits {
        repository: String,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
    },
    GetFileContents {
        repository: String,
        path: String,
        #[serde(default)]
        reference: Option<String>,
    },
    ListRepositoryDirectory {
        repository: String,
        path: String,
        #[serde(default)]
        reference: Option<String>,
    },
    CreatePullRequest {
        repository: String,
        title: String,
        head: String,
        base: String,
        #[serde(default)]
        body: Option<String>,
    },
}

/// Every operation name with the channel it belongs to
pub const OPERATIONS: [(&str, Channel); 11] = [
    ("list_directory", Channel::Filesystem),
    ("read_file", Channel::Filesystem),
    ("write_file", Channel::Filesystem),
    ("delete_file", Channel::Filesystem),
    ("create_directory", Channel::Filesystem),
    ("get_file_info", Channel::Filesystem),
    ("get_repository", Channel::Repository),
    ("list_commits", Channel::Repository),
    ("get_file_contents", Channel::Repository),
    ("list_repository_directory", Channel::Repository),
    ("create_pull_request", Channel::Repository),
];

impl Operation {
    /// Parse an operation from its wire name and JSON parameters.
    ///
    /// Unknown names are rejected before anything is spawned.
    pub fn from_name(name: &str, params: Value) -> Result<Self, DeployError> {
        if !OPERATIONS.iter().any(|(n, _)| *n == name) {
            return Err(DeployError::UnknownOperation(name.to_string()));
        }
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        serde_json::from_value(serde_json::json!({ "operation": name, "params": params }))
            .map_err(|e| DeployError::ValidationError(format!("{}: invalid parameters: {}", name, e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::ListDirectory { .. } => "list_directory",
            Operation::ReadFile { .. } => "read_file",
            Operation::WriteFile { .. } => "write_file",
            Operation::DeleteFile { .. } => "delete_file",
            Operation::CreateDirectory { .. } => "create_directory",
            Operation::GetFileInfo { .. } => "get_file_info",
            Operation::GetRepository { .. } => "get_repository",
            Operation::ListCommits { .. } => "list_commits",
            Operation::GetFileContents { .. } => "get_file_contents",
            Operation::ListRepositoryDirectory { .. } => "list_repository_directory",
            Operation::CreatePullRequest { .. } => "create_pull_request",
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Operation::ListDirectory { .. }
            | Operation::ReadFile { .. }
            | Operation::WriteFile { .. }
            | Operation::DeleteFile { .. }
            | Operation::CreateDirectory { .. }
            | Operation::GetFileInfo { .. } => Channel::Filesystem,
            _ => Channel::Repository,
        }
    }

    /// Main path or repository the operation acts on, for reports
    pub fn target(&self) -> &str {
        match self {
            Operation::ListDirectory { path, .. }
            | Operation::ReadFile { path }
            | Operation::WriteFile { path, .. }
            | Operation::DeleteFile { path }
            | Operation::CreateDirectory { path }
            | Operation::GetFileInfo { path }
            | Operation::GetFileContents { path, .. }
            | Operation::ListRepositoryDirectory { path, .. } => path.as_str(),
            Operation::GetRepository { repository }
            | Operation::ListCommits { repository, .. }
            | Operation::CreatePullRequest { repository, .. } => repository.as_str(),
        }
    }

    /// Parameters as written to the process' stdin
    pub fn params(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("params").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Entry returned by `list_directory` and `list_repository_directory`.
///
/// `path` is relative to the listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
}

impl DirEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingOutput {
    #[serde(default)]
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentOutput {
    #[serde(default)]
    pub content: String,
}

/// Result of `get_file_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
}

/// Join a relative path onto a remote root
pub fn join_remote(root: &str, relative: &str) -> String {
    let absolute = root.starts_with('/');
    let root = root.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    match (root.is_empty(), relative.is_empty()) {
        (true, _) if absolute => format!("/{}", relative),
        (true, _) => relative.to_string(),
        (_, true) => root.to_string(),
        _ => format!("{}/{}", root, relative),
    }
}
