//! Output-file plumbing shared by the xlpg tools: atomic writes under an
//! output root, timestamped names, writability probes and a retry policy.

use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeZone};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;
use xlpg_core::sha256_hex;

pub const CRATE_NAME: &str = "xlpg-storage";

const WRITE_PROBE_NAME: &str = "write_test.tmp";

#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

/// Directory that owns every file a tool produces.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Write bytes through a temp file and rename it into place, replacing any
    /// previous file at that path. Readers never observe a half-written file.
    pub async fn write_bytes(
        &self,
        relative: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredOutput> {
        let absolute_path = self.root.join(relative);
        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredOutput {
            absolute_path,
            byte_size: bytes.len(),
            sha256: sha256_hex(bytes),
        })
    }
}

/// Atomic write to an absolute path, creating parent directories.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp output {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Create `dir` if needed and prove a file can be written and removed there.
pub async fn ensure_writable_dir(dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;
    let probe = dir.join(WRITE_PROBE_NAME);
    fs::write(&probe, b"test")
        .await
        .with_context(|| format!("cannot write to directory {}", dir.display()))?;
    fs::remove_file(&probe)
        .await
        .with_context(|| format!("removing write probe {}", probe.display()))?;
    Ok(())
}

/// `<prefix>_<stamp>.<ext>` using a chrono format string for the stamp.
pub fn timestamped_file_name<Tz>(
    prefix: &str,
    at: &DateTime<Tz>,
    stamp_format: &str,
    extension: &str,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let ext = extension.trim_start_matches('.').trim();
    let stamp = at.format(stamp_format);
    if ext.is_empty() {
        format!("{prefix}_{stamp}")
    } else {
        format!("{prefix}_{stamp}.{ext}")
    }
}

/// Attempt count and the pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("all {attempts} attempts failed for {label}: {last_error}")]
    Exhausted {
        label: String,
        attempts: usize,
        last_error: String,
    },
}

impl RetryError {
    pub fn last_error(&self) -> &str {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts. The closure
/// receives the one-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, RetryError>
where
    E: Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        info!(label, attempt, attempts, "attempt starting");
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = err.to_string();
                warn!(label, attempt, error = %last_error, "attempt failed");
                if attempt < attempts {
                    info!(label, delay_ms = policy.delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(RetryError::Exhausted {
        label: label.to_string(),
        attempts,
        last_error,
    })
}
