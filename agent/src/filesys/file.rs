//! File operations for catalog, settings and deployment records

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::DeployError;

/// Permission mode for files holding backup data or metadata
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Size of the file in bytes
    pub async fn size(&self) -> Result<u64, DeployError> {
        Ok(fs::metadata(&self.path).await?.len())
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, DeployError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, DeployError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Serialize `value` as pretty JSON and replace the file atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), DeployError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), DeployError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Set the Unix permission bits of the file.
    ///
    /// A no-op on non-Unix platforms.
    pub async fn set_mode(&self, mode: u32) -> Result<(), DeployError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    /// Atomic write using a sibling temporary file, restricted to the owner
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), DeployError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.sibling("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        File::new(&temp_path).set_mode(PRIVATE_FILE_MODE).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Copy the file to `destination` with owner-only permissions
    pub async fn copy_to(&self, destination: impl Into<PathBuf>) -> Result<File, DeployError> {
        let destination = File::new(destination);
        if let Some(parent) = destination.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&self.path, &destination.path).await?;
        destination.set_mode(PRIVATE_FILE_MODE).await?;
        Ok(destination)
    }

    /// Move the file out of the way as `<name>.<suffix>`, returning the new location
    pub async fn rename_aside(&self, suffix: &str) -> Result<File, DeployError> {
        let aside = self.sibling(suffix);
        fs::rename(&self.path, &aside).await?;
        Ok(File::new(aside))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }
}
