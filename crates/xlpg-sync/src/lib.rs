//! Spreadsheet to PostgreSQL synchronization.
//!
//! Each configured sheet is normalized, hashed row by row and upserted into a
//! table of the same name. Rows whose content hash is unchanged are left
//! alone; rows whose hash no longer appears in the sheet are deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sqlx::PgPool;
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use xlpg_core::SheetTable;
use xlpg_sources::{table_to_csv_bytes, SourceError, TableSource, WorkbookSource};
use xlpg_storage::{timestamped_file_name, OutputStore};

pub mod config;
pub mod export;
pub mod maintenance;
pub mod prepare;
pub mod writer;

pub use config::{ConflictKeyRegistry, MatviewConfig, SheetSpec, SyncConfig, SyncMode};
pub use export::{export_sheets_to_csv, write_tables, CsvExport, CsvExportConfig, CsvExportSummary};
pub use maintenance::{
    check_connection, list_materialized_views, mask_database_url, refresh_materialized_views,
    ConnectionReport, RefreshSummary,
};
pub use prepare::{prepare_sheet, PrepareStats, PreparedSheet};
pub use writer::{sync_sheet, LoadOptions, LoadStats};

pub const CRATE_NAME: &str = "xlpg-sync";

/// Minimum similarity for a "did you mean" sheet suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },
    #[error("excel file not found: {}", .0.display())]
    ExcelNotFound(PathBuf),
    #[error("no conflict keys defined for sheet '{0}'; add it to the conflict key registry")]
    NoConflictKeys(String),
    #[error("sheet '{sheet}' lacks conflict key columns {missing:?}; columns present: {available:?}")]
    MissingKeyColumns {
        sheet: String,
        missing: Vec<String>,
        available: Vec<String>,
    },
}

/// Closest available sheet name, compared case-insensitively.
pub fn closest_sheet_name(wanted: &str, available: &[String]) -> Option<String> {
    let wanted = wanted.to_lowercase();
    available
        .iter()
        .map(|name| (jaro_winkler(&wanted, &name.to_lowercase()), name))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, name)| name.clone())
}

/// The scheduler expects a seconds field; plain five-field crontab entries
/// fire at second zero.
pub fn cron_with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    Synced,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetOutcome {
    pub sheet: String,
    pub table: Option<String>,
    pub status: SheetStatus,
    pub message: Option<String>,
    pub prepare: Option<PrepareStats>,
    pub load: Option<LoadStats>,
    pub dropped_rows_file: Option<PathBuf>,
    pub elapsed_ms: u128,
}

impl SheetOutcome {
    fn skipped(sheet: &str, message: impl Into<String>) -> Self {
        Self {
            sheet: sheet.to_string(),
            table: None,
            status: SheetStatus::Skipped,
            message: Some(message.into()),
            prepare: None,
            load: None,
            dropped_rows_file: None,
            elapsed_ms: 0,
        }
    }

    fn failed(sheet: &str, message: impl Into<String>) -> Self {
        Self {
            status: SheetStatus::Failed,
            ..Self::skipped(sheet, message)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub excel_path: PathBuf,
    pub schema: String,
    pub parallel: bool,
    pub sheets: Vec<SheetOutcome>,
    pub reports_dir: PathBuf,
}

impl SyncRunSummary {
    fn count(&self, status: SheetStatus) -> usize {
        self.sheets.iter().filter(|s| s.status == status).count()
    }

    pub fn synced(&self) -> usize {
        self.count(SheetStatus::Synced)
    }

    pub fn skipped(&self) -> usize {
        self.count(SheetStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(SheetStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            "# Sync Summary".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Workbook: `{}`", self.excel_path.display()),
            format!("- Schema: `{}`", self.schema),
            format!(
                "- Mode: {}",
                if self.parallel { "parallel" } else { "sequential" }
            ),
            format!(
                "- Sheets: {} synced, {} skipped, {} failed",
                self.synced(),
                self.skipped(),
                self.failed()
            ),
            String::new(),
            "| Sheet | Table | Status | Read | Dropped | Written | Deleted | Seconds | Note |".to_string(),
            "|---|---|---|---:|---:|---:|---:|---:|---|".to_string(),
        ];
        for sheet in &self.sheets {
            let (read, dropped) = sheet
                .prepare
                .as_ref()
                .map(|p| (p.rows_read.to_string(), p.rows_dropped.to_string()))
                .unwrap_or_default();
            let (written, deleted) = sheet
                .load
                .as_ref()
                .map(|l| (l.rows_written.to_string(), l.rows_deleted.to_string()))
                .unwrap_or_default();
            lines.push(format!(
                "| {} | {} | {:?} | {} | {} | {} | {} | {:.2} | {} |",
                sheet.sheet,
                sheet.table.as_deref().unwrap_or(""),
                sheet.status,
                read,
                dropped,
                written,
                deleted,
                sheet.elapsed_ms as f64 / 1000.0,
                sheet.message.as_deref().unwrap_or("").replace('|', "/"),
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

enum SheetInput {
    Ready(SheetTable),
    Skip(String),
    Fail(String),
}

fn read_inputs(path: &Path, sheets: &[String]) -> Result<Vec<(String, SheetInput)>> {
    let mut workbook = WorkbookSource::open(path)
        .with_context(|| format!("cannot open Excel file {}", path.display()))?;
    let available = workbook.sheet_names();
    let inputs = sheets
        .iter()
        .map(|sheet| {
            let input = match workbook.read_table(sheet) {
                Ok(table) if table.is_empty() => {
                    warn!(sheet = %sheet, "sheet is empty; skipping");
                    SheetInput::Skip("sheet is empty".to_string())
                }
                Ok(table) => SheetInput::Ready(table),
                Err(SourceError::SheetNotFound { .. }) => {
                    let suggestion = closest_sheet_name(sheet, &available);
                    warn!(
                        sheet = %sheet,
                        available = ?available,
                        suggestion = ?suggestion,
                        "sheet not found in Excel file; skipping"
                    );
                    SheetInput::Skip(match suggestion {
                        Some(name) => format!("not found in workbook; did you mean '{name}'?"),
                        None => "not found in workbook".to_string(),
                    })
                }
                Err(err) => {
                    error!(sheet = %sheet, error = %err, "cannot read sheet");
                    SheetInput::Fail(err.to_string())
                }
            };
            (sheet.clone(), input)
        })
        .collect();
    Ok(inputs)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

#[derive(Clone)]
pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    registry: Arc<ConflictKeyRegistry>,
    pool: PgPool,
    store: OutputStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: ConflictKeyRegistry, pool: PgPool) -> Self {
        let store = OutputStore::new(config.output_dir.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            pool,
            store,
        }
    }

    /// Load the conflict-key registry and open a pool sized for the workers.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let registry = ConflictKeyRegistry::load(&config.conflict_keys_path)?;
        let pool = maintenance::connect_pool(&config.database_url, config.max_workers as u32 + 1).await?;
        info!("database connection successful");
        Ok(Self::new(config, registry, pool))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            excel = %self.config.excel_path.display(),
            sheets = ?self.config.sheet_names,
            schema = %self.config.schema,
            "sync run starting"
        );

        let path = self.config.excel_path.clone();
        let sheets = self.config.sheet_names.clone();
        let inputs = tokio::task::spawn_blocking(move || read_inputs(&path, &sheets))
            .await
            .context("workbook reader task panicked")??;

        let mut slots: Vec<Option<SheetOutcome>> = Vec::with_capacity(inputs.len());
        let mut names = Vec::with_capacity(inputs.len());
        let mut ready = Vec::new();
        for (idx, (sheet, input)) in inputs.into_iter().enumerate() {
            names.push(sheet.clone());
            match input {
                SheetInput::Ready(table) => {
                    slots.push(None);
                    ready.push((idx, table));
                }
                SheetInput::Skip(message) => slots.push(Some(SheetOutcome::skipped(&sheet, message))),
                SheetInput::Fail(message) => slots.push(Some(SheetOutcome::failed(&sheet, message))),
            }
        }

        let parallel = self.config.parallel && ready.len() > 1;
        if parallel {
            let workers = self.config.max_workers.max(1);
            info!(workers, sheets = ready.len(), "processing sheets in parallel");
            let semaphore = Arc::new(Semaphore::new(workers));
            let mut set = JoinSet::new();
            for (idx, table) in ready {
                let this = self.clone();
                let semaphore = semaphore.clone();
                set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (idx, this.process_sheet(run_id, table).await)
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, outcome)) => slots[idx] = Some(outcome),
                    Err(err) => error!(error = %err, "sheet worker task failed"),
                }
            }
        } else {
            for (idx, table) in ready {
                slots[idx] = Some(self.process_sheet(run_id, table).await);
            }
        }

        let sheets = slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| slot.unwrap_or_else(|| SheetOutcome::failed(&name, "worker task panicked")))
            .collect();

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            excel_path: self.config.excel_path.clone(),
            schema: self.config.schema.clone(),
            parallel,
            sheets,
            reports_dir: self.store.resolve(Path::new("reports").join(run_id.to_string())),
        };
        summary.reports_dir = self.write_reports(&summary).await?;
        info!(
            run_id = %run_id,
            synced = summary.synced(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "sync run complete"
        );
        Ok(summary)
    }

    async fn process_sheet(&self, run_id: Uuid, table: SheetTable) -> SheetOutcome {
        let sheet = table.name.clone();
        let span = info_span!("sheet", run_id = %run_id, sheet = %sheet);
        async move {
            let started = Instant::now();
            info!("processing sheet");
            let mut outcome = match self.sync_table(table).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "sheet failed");
                    SheetOutcome::failed(&sheet, format!("{err:#}"))
                }
            };
            outcome.elapsed_ms = started.elapsed().as_millis();
            if outcome.status == SheetStatus::Synced {
                info!(seconds = outcome.elapsed_ms as f64 / 1000.0, "finished sheet");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn sync_table(&self, table: SheetTable) -> Result<SheetOutcome> {
        let sheet = table.name.clone();
        let spec = self.registry.require(&sheet)?;
        let prepared = prepare_sheet(table, spec)?;

        let dropped_rows_file = match &prepared.dropped_sample {
            Some(sample) => Some(self.write_dropped_rows(&sheet, sample).await?),
            None => None,
        };

        let load = sync_sheet(
            &self.pool,
            &self.config.schema,
            &prepared,
            LoadOptions {
                batch_size: self.config.batch_size,
                copy_threshold: self.config.copy_threshold,
            },
        )
        .await?;

        Ok(SheetOutcome {
            sheet,
            table: Some(prepared.table.clone()),
            status: SheetStatus::Synced,
            message: None,
            prepare: Some(prepared.stats.clone()),
            load: Some(load),
            dropped_rows_file,
            elapsed_ms: 0,
        })
    }

    async fn write_dropped_rows(&self, sheet: &str, sample: &SheetTable) -> Result<PathBuf> {
        let name = timestamped_file_name(
            &format!("dropped_rows_{}", file_safe(sheet)),
            &Local::now(),
            "%Y%m%d_%H%M%S",
            "csv",
        );
        let bytes = table_to_csv_bytes(sample, None)?;
        let stored = self.store.write_bytes(&name, &bytes).await?;
        info!(
            path = %stored.absolute_path.display(),
            rows = sample.rows.len(),
            "saved dropped rows for inspection"
        );
        Ok(stored.absolute_path)
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let dir = Path::new("reports").join(summary.run_id.to_string());
        let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
        self.store
            .write_bytes(dir.join("sync_summary.json"), &json)
            .await
            .context("writing sync_summary.json")?;
        self.store
            .write_bytes(dir.join("sync_summary.md"), summary.render_markdown().as_bytes())
            .await
            .context("writing sync_summary.md")?;
        Ok(self.store.resolve(dir))
    }

    /// Cron-driven re-runs on `SYNC_CRON`; `None` unless enabled.
    pub async fn maybe_build_scheduler(&self, enabled: bool) -> Result<Option<JobScheduler>> {
        if !enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = cron_with_seconds(&self.config.sync_cron);
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Cron-driven materialized view refreshes.
pub async fn build_refresh_scheduler(
    pool: PgPool,
    schema: String,
    views: Vec<String>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = cron_with_seconds(cron);
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pool = pool.clone();
        let schema = schema.clone();
        let views = views.clone();
        Box::pin(async move {
            let summary = refresh_materialized_views(&pool, &schema, &views).await;
            info!(
                refreshed = summary.outcomes.len() - summary.failed(),
                failed = summary.failed(),
                "scheduled refresh finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Start `sched` and keep it running until Ctrl+C.
pub async fn run_scheduler_until_ctrl_c(mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("stopping scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::connect(config).await?;
    pipeline.run_once().await
}
