//! Backup validation.
//!
//! Stages run in order and stop at the first failing one:
//! existence, size, archive integrity, checksum, deep inspection.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::archive::{self, ArchiveEntry};
use crate::utils::sha256_file;

/// Smallest plausible archive in bytes
pub const MIN_ARCHIVE_SIZE: u64 = 100;

/// What a healthy configuration snapshot contains
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationProfile {
    /// Artifact whose absence makes a backup unusable
    pub primary: String,

    /// Artifacts whose absence is only worth a warning
    pub secondary: Vec<String>,

    /// Path fragments of build output, logs or VCS data
    pub suspicious: Vec<String>,

    pub min_file_count: usize,
}

impl Default for ValidationProfile {
    fn default() -> Self {
        Self {
            primary: "docker-compose.yml".to_string(),
            secondary: vec![".env".to_string()],
            suspicious: vec![
                ".git/".to_string(),
                "node_modules/".to_string(),
                "__pycache__/".to_string(),
                "target/".to_string(),
                "dist/".to_string(),
                ".log".to_string(),
            ],
            min_file_count: 1,
        }
    }
}

/// Validator options
#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    pub max_size: u64,
    pub profile: ValidationProfile,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            max_size: 1024 * 1024 * 1024,
            profile: ValidationProfile::default(),
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Compare the archive's sha256 against this value
    pub expected_checksum: Option<String>,

    /// Extract and inspect the contents
    pub deep: bool,
}

/// Outcome of each stage, `None` when it did not run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationChecks {
    pub exists: Option<bool>,
    pub size: Option<bool>,
    pub archive: Option<bool>,
    pub checksum: Option<bool>,
    pub deep: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationMetadata {
    pub path: PathBuf,
    pub size: Option<u64>,
    pub file_count: Option<usize>,
    pub checksum: Option<String>,
    pub essential_present: Vec<String>,
    pub essential_missing: Vec<String>,
    pub suspicious: Vec<String>,
    pub validated_at: Option<DateTime<Utc>>,
}

/// Result of validating one backup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub checks: ValidationChecks,
    pub metadata: ValidationMetadata,
}

impl ValidationReport {
    fn fail(mut self, error: String) -> Self {
        warn!("Backup {} invalid: {}", self.metadata.path.display(), error);
        self.errors.push(error);
        self.valid = false;
        self
    }
}

/// Options of `batch_validate`
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,

    /// Keep going after the first invalid backup
    pub continue_on_error: bool,

    pub validate: ValidateOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            continue_on_error: true,
            validate: ValidateOptions::default(),
        }
    }
}

/// Aggregate of a batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Not validated because the batch stopped early
    pub skipped: usize,
    pub results: Vec<ValidationReport>,
}

/// Backup validator
#[derive(Debug, Clone, Default)]
pub struct BackupValidator {
    options: ValidatorOptions,
}

impl BackupValidator {
    pub fn new(options: ValidatorOptions) -> Self {
        Self { options }
    }

    pub fn profile(&self) -> &ValidationProfile {
        &self.options.profile
    }

    /// Validate one archive. Failures are reported, never returned as errors.
    pub async fn validate(&self, path: &Path, options: &ValidateOptions) -> ValidationReport {
        let mut report = ValidationReport {
            metadata: ValidationMetadata {
                path: path.to_path_buf(),
                validated_at: Some(Utc::now()),
                ..Default::default()
            },
            ..Default::default()
        };

        // 1. existence
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                report.checks.exists = Some(false);
                return report.fail(format!("{} is not a regular file", path.display()));
            }
            Err(e) => {
                report.checks.exists = Some(false);
                return report.fail(format!("{} is not accessible: {}", path.display(), e));
            }
        };
        report.checks.exists = Some(true);

        // 2. size
        let size = metadata.len();
        report.metadata.size = Some(size);
        let size_error = if size == 0 {
            Some("backup file is empty".to_string())
        } else if size < MIN_ARCHIVE_SIZE {
            Some(format!(
                "backup file is too small ({} bytes, minimum {})",
                size, MIN_ARCHIVE_SIZE
            ))
        } else if size > self.options.max_size {
            Some(format!(
                "backup file is too large ({} bytes, maximum {})",
                size, self.options.max_size
            ))
        } else {
            None
        };
        report.checks.size = Some(size_error.is_none());
        if let Some(error) = size_error {
            return report.fail(error);
        }

        // 3. archive integrity
        let entries = match archive::list_archive(path).await {
            Ok(entries) if entries.is_empty() => {
                report.checks.archive = Some(false);
                return report.fail("archive has no contents".to_string());
            }
            Ok(entries) => entries,
            Err(e) => {
                report.checks.archive = Some(false);
                return report.fail(format!("archive integrity check failed: {}", e));
            }
        };
        report.checks.archive = Some(true);
        report.metadata.file_count = Some(entries.len());
        let (present, missing) = self.essential_files(&entries);
        report.metadata.essential_present = present;
        report.metadata.essential_missing = missing;

        // 4. checksum
        if let Some(expected) = &options.expected_checksum {
            let actual = match sha256_file(path).await {
                Ok(actual) => actual,
                Err(e) => {
                    report.checks.checksum = Some(false);
                    return report.fail(format!("checksum could not be computed: {}", e));
                }
            };
            let matches = actual.eq_ignore_ascii_case(expected);
            report.metadata.checksum = Some(actual.clone());
            report.checks.checksum = Some(matches);
            if !matches {
                return report.fail(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                ));
            }
        }

        // 5. deep inspection
        if options.deep {
            report = self.deep_validate(path, report).await;
            if !report.errors.is_empty() {
                report.valid = false;
                return report;
            }
        }

        debug!(
            "Backup {} valid ({} files, {} warnings)",
            path.display(),
            entries.len(),
            report.warnings.len()
        );
        report.valid = true;
        report
    }

    fn essential_files(&self, entries: &[ArchiveEntry]) -> (Vec<String>, Vec<String>) {
        let profile = &self.options.profile;
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for name in std::iter::once(&profile.primary).chain(profile.secondary.iter()) {
            if entries.iter().any(|e| matches_name(&e.path, name)) {
                present.push(name.clone());
            } else {
                missing.push(name.clone());
            }
        }
        (present, missing)
    }

    async fn deep_validate(&self, path: &Path, mut report: ValidationReport) -> ValidationReport {
        let profile = &self.options.profile;

        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                report.checks.deep = Some(false);
                report.errors.push(format!("could not create scratch directory: {}", e));
                return report;
            }
        };
        let files = match archive::extract_archive(path, scratch.path()).await {
            Ok(files) => files,
            Err(e) => {
                report.checks.deep = Some(false);
                report.errors.push(format!("extraction failed: {}", e));
                return report;
            }
        };

        if !files.iter().any(|f| matches_name(f, &profile.primary)) {
            report
                .errors
                .push(format!("primary configuration {} is missing", profile.primary));
        }
        for name in &profile.secondary {
            if !files.iter().any(|f| matches_name(f, name)) {
                report.warnings.push(format!("{} is missing", name));
            }
        }

        let suspicious: Vec<String> = files
            .iter()
            .filter(|f| profile.suspicious.iter().any(|s| is_suspicious(f, s)))
            .cloned()
            .collect();
        if !suspicious.is_empty() {
            report.warnings.push(format!(
                "{} suspicious build, log or VCS files included",
                suspicious.len()
            ));
        }
        report.metadata.suspicious = suspicious;

        if files.len() < profile.min_file_count {
            report.errors.push(format!(
                "only {} files, expected at least {}",
                files.len(),
                profile.min_file_count
            ));
        }

        for file in &files {
            if let Some(error) = config_parse_error(scratch.path(), file) {
                report.warnings.push(format!("{} does not parse: {}", file, error));
            }
        }

        report.checks.deep = Some(report.errors.is_empty());
        report
    }

    /// Validate many archives with bounded parallelism
    pub async fn batch_validate(&self, paths: &[PathBuf], options: &BatchOptions) -> BatchSummary {
        let mut summary = BatchSummary {
            total: paths.len(),
            ..Default::default()
        };

        let mut results = stream::iter(paths.iter())
            .map(|path| self.validate(path, &options.validate))
            .buffered(options.concurrency.max(1));

        while let Some(report) = results.next().await {
            let valid = report.valid;
            if valid {
                summary.valid += 1;
            } else {
                summary.invalid += 1;
            }
            summary.results.push(report);
            if !valid && !options.continue_on_error {
                break;
            }
        }

        summary.skipped = summary.total - summary.results.len();
        info!(
            "Validated {} backups: {} valid, {} invalid, {} skipped",
            summary.total, summary.valid, summary.invalid, summary.skipped
        );
        summary
    }
}

/// Whether a relative path names `name`, at any depth
pub fn matches_name(path: &str, name: &str) -> bool {
    path == name || path.ends_with(&format!("/{}", name))
}

fn is_suspicious(path: &str, fragment: &str) -> bool {
    if fragment.ends_with('/') {
        path.starts_with(fragment) || path.contains(&format!("/{}", fragment))
    } else {
        path.ends_with(fragment)
    }
}

/// Parse error of a JSON or YAML file, if it has one
pub fn config_parse_error(root: &Path, relative: &str) -> Option<String> {
    let is_json = relative.ends_with(".json");
    let is_yaml = relative.ends_with(".yml") || relative.ends_with(".yaml");
    if !is_json && !is_yaml {
        return None;
    }

    let content = match archive::read_text(root, relative) {
        Ok(content) => content,
        Err(e) => return Some(e.to_string()),
    };
    if is_json {
        serde_json::from_str::<serde_json::Value>(&content)
            .err()
            .map(|e| e.to_string())
    } else {
        serde_yaml::from_str::<serde_yaml::Value>(&content)
            .err()
            .map(|e| e.to_string())
    }
}
