//! Backup validator tests

use std::path::{Path, PathBuf};

use confdeploy::backup::archive::create_archive;
use confdeploy::backup::validator::{BackupValidator, BatchOptions, ValidateOptions};
use confdeploy::utils::sha256_file;
use tempfile::TempDir;

use crate::common::compose_file;

/// Settings file with enough distinct lines to survive compression
fn settings_file() -> String {
    (0..200)
        .map(|i| format!("setting_{}: {}\n", i, (i * 7919) % 10007))
        .collect()
}

/// Write `files` under a fresh source tree and archive it
async fn archive_of(dir: &TempDir, name: &str, files: &[(&str, String)]) -> PathBuf {
    let src = dir.path().join(format!("{}-src", name));
    for (relative, content) in files {
        let path = src.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    let dest = dir.path().join(format!("{}.tar.gz", name));
    create_archive(&src, &dest).await.unwrap();
    dest
}

fn healthy_files() -> Vec<(&'static str, String)> {
    vec![
        ("docker-compose.yml", compose_file("v1")),
        (".env", "RELEASE=v1\n".to_string()),
        ("config/settings.yml", settings_file()),
    ]
}

fn deep() -> ValidateOptions {
    ValidateOptions {
        expected_checksum: None,
        deep: true,
    }
}

fn truncate(path: &Path) {
    let bytes = std::fs::read(path).unwrap();
    std::fs::write(path, &bytes[..bytes.len() / 2]).unwrap();
}

#[tokio::test]
async fn test_healthy_archive_passes_every_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_of(&dir, "healthy", &healthy_files()).await;
    let checksum = sha256_file(&path).await.unwrap();

    let report = BackupValidator::default()
        .validate(
            &path,
            &ValidateOptions {
                expected_checksum: Some(checksum.clone()),
                deep: true,
            },
        )
        .await;

    assert!(report.valid, "errors: {:?}", report.errors);
    assert!(report.errors.is_empty());
    assert!(report.warnings.is_empty());
    assert_eq!(report.checks.exists, Some(true));
    assert_eq!(report.checks.size, Some(true));
    assert_eq!(report.checks.archive, Some(true));
    assert_eq!(report.checks.checksum, Some(true));
    assert_eq!(report.checks.deep, Some(true));
    assert_eq!(report.metadata.file_count, Some(3));
    assert_eq!(report.metadata.checksum, Some(checksum));
    assert_eq!(
        report.metadata.essential_present,
        vec!["docker-compose.yml".to_string(), ".env".to_string()]
    );
}

#[tokio::test]
async fn test_truncated_archive_fails_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_of(&dir, "truncated", &healthy_files()).await;
    truncate(&path);

    let report = BackupValidator::default().validate(&path, &deep()).await;
    assert!(!report.valid);
    assert_eq!(report.checks.size, Some(true));
    assert_eq!(report.checks.archive, Some(false));
    assert!(report.errors[0].contains("integrity"));
}

#[tokio::test]
async fn test_checksum_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_of(&dir, "mismatch", &healthy_files()).await;

    let report = BackupValidator::default()
        .validate(
            &path,
            &ValidateOptions {
                expected_checksum: Some("0".repeat(64)),
                deep: false,
            },
        )
        .await;
    assert!(!report.valid);
    assert_eq!(report.checks.checksum, Some(false));
    assert_eq!(report.checks.deep, None);
}

#[tokio::test]
async fn test_missing_primary_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_of(
        &dir,
        "no-primary",
        &[
            (".env", "RELEASE=v1\n".to_string()),
            ("config/settings.yml", settings_file()),
        ],
    )
    .await;

    let report = BackupValidator::default().validate(&path, &deep()).await;
    assert!(!report.valid);
    assert_eq!(report.checks.deep, Some(false));
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("docker-compose.yml is missing")));
    assert_eq!(
        report.metadata.essential_missing,
        vec!["docker-compose.yml".to_string()]
    );
}

#[tokio::test]
async fn test_missing_secondary_is_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_of(
        &dir,
        "no-env",
        &[
            ("docker-compose.yml", compose_file("v1")),
            ("config/settings.yml", settings_file()),
        ],
    )
    .await;

    let report = BackupValidator::default().validate(&path, &deep()).await;
    assert!(report.valid);
    assert_eq!(report.warnings, vec![".env is missing".to_string()]);
}

#[tokio::test]
async fn test_suspicious_and_unparsable_files_are_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = healthy_files();
    files.push((".git/HEAD", "ref: refs/heads/main\n".to_string()));
    files.push(("logs/deploy.log", "started\n".to_string()));
    files.push(("broken.json", "{\"replicas\": ".to_string()));
    let path = archive_of(&dir, "noisy", &files).await;

    let report = BackupValidator::default().validate(&path, &deep()).await;
    assert!(report.valid);
    assert_eq!(
        report.metadata.suspicious,
        vec![".git/HEAD".to_string(), "logs/deploy.log".to_string()]
    );
    assert!(report.warnings.iter().any(|w| w.contains("2 suspicious")));
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("broken.json does not parse")));
}

#[tokio::test]
async fn test_shallow_validation_skips_deep_inspection() {
    let dir = tempfile::tempdir().unwrap();
    let path = archive_of(
        &dir,
        "shallow",
        &[("config/settings.yml", settings_file())],
    )
    .await;

    let report = BackupValidator::default()
        .validate(&path, &ValidateOptions::default())
        .await;
    assert!(report.valid);
    assert_eq!(report.checks.deep, None);
    assert_eq!(
        report.metadata.essential_missing,
        vec!["docker-compose.yml".to_string(), ".env".to_string()]
    );
}

#[tokio::test]
async fn test_batch_validation_stops_on_first_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let first = archive_of(&dir, "first", &healthy_files()).await;
    let broken = archive_of(&dir, "broken", &healthy_files()).await;
    truncate(&broken);
    let last = archive_of(&dir, "last", &healthy_files()).await;
    let paths = vec![first, broken, last];
    let validator = BackupValidator::default();

    let summary = validator
        .batch_validate(
            &paths,
            &BatchOptions {
                concurrency: 1,
                continue_on_error: false,
                validate: deep(),
            },
        )
        .await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.valid, 1);
    assert_eq!(summary.invalid, 1);
    assert_eq!(summary.skipped, 1);

    let summary = validator
        .batch_validate(
            &paths,
            &BatchOptions {
                concurrency: 2,
                continue_on_error: true,
                validate: deep(),
            },
        )
        .await;
    assert_eq!(summary.valid, 2);
    assert_eq!(summary.invalid, 1);
    assert_eq!(summary.skipped, 0);
    assert!(!summary.results[1].valid);
}
