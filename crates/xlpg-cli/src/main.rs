use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use xlpg_reports::pdf::EXIT_CRITICAL;
use xlpg_reports::preview::DEFAULT_PREVIEW_ROWS;
use xlpg_reports::{export_schema_metadata, export_table_previews, ExportConfig, PdfExportConfig, SheetPdfExporter};
use xlpg_sources::fixed_width::{self, DEFAULT_PATTERN};
use xlpg_sync::config::database_url_from_env;
use xlpg_sync::maintenance::{connect_pool, CONNECT_TIMEOUT};
use xlpg_sync::{
    build_refresh_scheduler, check_connection, export_sheets_to_csv, list_materialized_views,
    refresh_materialized_views, run_scheduler_until_ctrl_c, CsvExportConfig, MatviewConfig, SyncConfig,
    SyncPipeline,
};

#[cfg_attr(not(feature = "mouse"), allow(dead_code))]
mod keep_awake;

const EXIT_NO_DATABASE_URL: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "xlpg")]
#[command(version, about = "Spreadsheet and PostgreSQL operations toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert configured workbook sheets into PostgreSQL
    Sync {
        /// Process sheets one at a time even when PARALLEL_PROCESSING is on
        #[arg(long)]
        sequential: bool,
        /// Keep running and repeat on SYNC_CRON after the first pass
        #[arg(long)]
        schedule: bool,
    },
    /// Refresh materialized views
    RefreshViews {
        /// View names; defaults to MATERIALIZED_VIEWS
        views: Vec<String>,
        /// Refresh every materialized view in the schema
        #[arg(long, conflicts_with = "views")]
        all: bool,
        /// Keep running and repeat on REFRESH_CRON
        #[arg(long)]
        schedule: bool,
    },
    /// Dump column metadata of SCHEMAS to a workbook
    SchemaDump {
        /// One worksheet per table instead of a single listing
        #[arg(long)]
        per_table: bool,
    },
    /// First rows of every table in a schema, one worksheet per table
    TablePreview {
        /// Defaults to SCHEMA_NAME
        #[arg(long)]
        schema: Option<String>,
        #[arg(long, default_value_t = DEFAULT_PREVIEW_ROWS)]
        limit: i64,
    },
    /// Export worksheets to PDF reports
    SheetPdf,
    /// Convert fixed-width spend reports to CSV
    FixedWidth {
        #[command(subcommand)]
        command: FixedWidthCommand,
    },
    /// Export worksheets to CLEANED_CSV/<sheet>.csv
    SheetsToCsv,
    /// Connect to DATABASE_URL and run SELECT 1
    CheckConnection,
    /// Nudge the mouse pointer now and then until Ctrl+C
    KeepAwake,
}

#[derive(Debug, Subcommand)]
enum FixedWidthCommand {
    /// Convert a single file
    File {
        input: PathBuf,
        /// Defaults to <stem>_converted.csv next to the input
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Convert every matching file in a folder
    Folder {
        input_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_PATTERN)]
        pattern: String,
        /// Defaults to the input folder
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync { sequential, schedule } => sync(sequential, schedule).await,
        Commands::RefreshViews { views, all, schedule } => refresh_views(views, all, schedule).await,
        Commands::SchemaDump { per_table } => schema_dump(per_table).await,
        Commands::TablePreview { schema, limit } => table_preview(schema, limit).await,
        Commands::SheetPdf => return sheet_pdf().await,
        Commands::FixedWidth { command } => fixed_width_convert(command).await,
        Commands::SheetsToCsv => sheets_to_csv().await,
        Commands::CheckConnection => return check_db_connection().await,
        Commands::KeepAwake => run_keep_awake().await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn sync(sequential: bool, schedule: bool) -> Result<ExitCode> {
    let mut config = SyncConfig::from_env()?;
    if sequential {
        config.parallel = false;
    }
    let pipeline = SyncPipeline::connect(config).await?;
    let summary = pipeline.run_once().await?;
    println!(
        "sync complete: run_id={} synced={} skipped={} failed={} reports={}",
        summary.run_id,
        summary.synced(),
        summary.skipped(),
        summary.failed(),
        summary.reports_dir.display()
    );

    if let Some(sched) = pipeline.maybe_build_scheduler(schedule).await? {
        info!(cron = %pipeline.config().sync_cron, "scheduled sync enabled");
        run_scheduler_until_ctrl_c(sched).await?;
    }

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn refresh_views(args: Vec<String>, all: bool, schedule: bool) -> Result<ExitCode> {
    let config = MatviewConfig::from_env()?;
    let pool = connect_pool(&config.database_url, 2).await?;
    let views = if all {
        list_materialized_views(&pool, &config.schema).await?
    } else if !args.is_empty() {
        args
    } else {
        config.views.clone()
    };
    if views.is_empty() {
        bail!("no materialized views to refresh; pass view names or --all, or set MATERIALIZED_VIEWS");
    }

    let summary = refresh_materialized_views(&pool, &config.schema, &views).await;
    for outcome in &summary.outcomes {
        match &outcome.error {
            None => println!("refreshed {}.{} in {} ms", summary.schema, outcome.view, outcome.elapsed_ms),
            Some(err) => println!("FAILED {}.{}: {err}", summary.schema, outcome.view),
        }
    }

    if schedule {
        let sched = build_refresh_scheduler(pool, config.schema.clone(), views, &config.refresh_cron).await?;
        info!(cron = %config.refresh_cron, "scheduled refresh enabled");
        run_scheduler_until_ctrl_c(sched).await?;
    }

    Ok(if summary.failed() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn schema_dump(per_table: bool) -> Result<ExitCode> {
    let config = ExportConfig::from_env();
    let url = database_url_from_env().context("DATABASE_URL (or DB_URL) must be set")?;
    let pool = connect_pool(&url, 2).await?;
    let path = export_schema_metadata(&pool, &config.schemas, &config.export_path, per_table).await?;
    println!("schema metadata written to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn table_preview(schema: Option<String>, limit: i64) -> Result<ExitCode> {
    let config = ExportConfig::from_env();
    let schema = schema.unwrap_or(config.preview_schema);
    let url = database_url_from_env().context("DATABASE_URL (or DB_URL) must be set")?;
    let pool = connect_pool(&url, 2).await?;
    let path = export_table_previews(&pool, &schema, &config.export_path, limit.max(1)).await?;
    println!("table preview written to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn sheet_pdf() -> ExitCode {
    let config = match PdfExportConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid PDF export configuration");
            return ExitCode::from(EXIT_CRITICAL);
        }
    };
    let exporter = SheetPdfExporter::new(config);
    let run = match exporter.run().await {
        Ok(run) => run,
        Err(err) => {
            error!(error = %format!("{err:#}"), "critical error during PDF export");
            return ExitCode::from(EXIT_CRITICAL);
        }
    };
    if let Err(err) = exporter.write_reports(&run).await {
        warn!(error = %format!("{err:#}"), "could not write conversion reports");
    }

    println!(
        "pdf export complete: {}/{} sheets converted ({:.1}%)",
        run.success_count(),
        run.results.len(),
        run.success_rate() * 100.0
    );
    ExitCode::from(run.exit_code())
}

async fn fixed_width_convert(command: FixedWidthCommand) -> Result<ExitCode> {
    match command {
        FixedWidthCommand::File { input, output } => {
            let stats = tokio::task::spawn_blocking(move || fixed_width::convert_file(&input, output.as_deref()))
                .await
                .context("conversion task panicked")??;
            println!(
                "converted {}: {}/{} lines -> {}",
                stats.input.display(),
                stats.processed_lines,
                stats.total_lines,
                stats.output.display()
            );
            Ok(if stats.processed_lines > 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        FixedWidthCommand::Folder {
            input_dir,
            pattern,
            output_dir,
        } => {
            let summary = tokio::task::spawn_blocking(move || {
                fixed_width::convert_folder(&input_dir, &pattern, output_dir.as_deref())
            })
            .await
            .context("conversion task panicked")??;
            for file in &summary.files {
                match &file.error {
                    None => println!(
                        "{}: {}/{} lines -> {}",
                        file.input.display(),
                        file.processed_lines,
                        file.total_lines,
                        file.output.display()
                    ),
                    Some(err) => println!("{}: FAILED {err}", file.input.display()),
                }
            }
            println!(
                "converted {}/{} files, {}/{} lines, output in {}",
                summary.files_converted(),
                summary.files.len(),
                summary.lines_processed(),
                summary.lines_total(),
                summary.output_dir.display()
            );
            Ok(if summary.files_converted() > 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn sheets_to_csv() -> Result<ExitCode> {
    let config = CsvExportConfig::from_env()?;
    let summary = export_sheets_to_csv(&config.excel_path, &config.sheet_names, &config.output_dir).await?;
    for export in &summary.exported {
        println!(
            "{}: {} rows -> {} (sha256 {})",
            export.sheet,
            export.rows,
            export.path.display(),
            export.sha256
        );
    }
    if !summary.skipped.is_empty() {
        println!("skipped (not in workbook): {}", summary.skipped.join(", "));
    }
    Ok(ExitCode::SUCCESS)
}

async fn check_db_connection() -> ExitCode {
    let Some(url) = database_url_from_env() else {
        error!("DATABASE_URL (or DB_URL) is not set");
        return ExitCode::from(EXIT_NO_DATABASE_URL);
    };
    match check_connection(&url, CONNECT_TIMEOUT).await {
        Ok(report) => {
            println!(
                "connection successful: {} (PostgreSQL {}) in {} ms",
                report.masked_url, report.server_version, report.elapsed_ms
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "connection failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "mouse")]
async fn run_keep_awake() -> Result<ExitCode> {
    let pointer = keep_awake::EnigoPointer::new()?;
    let nudges = keep_awake::run(pointer).await?;
    println!("keep-awake stopped after {nudges} nudges");
    Ok(ExitCode::SUCCESS)
}

#[cfg(not(feature = "mouse"))]
async fn run_keep_awake() -> Result<ExitCode> {
    bail!("this build has no pointer backend; rebuild with `--features mouse`")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn refresh_views_rejects_names_with_all() {
        let parsed = Cli::try_parse_from(["xlpg", "refresh-views", "--all", "mv_sales"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["xlpg", "refresh-views", "mv_sales", "mv_costs"]).expect("parse");
        match parsed.command {
            Commands::RefreshViews { views, all, schedule } => {
                assert_eq!(views, vec!["mv_sales", "mv_costs"]);
                assert!(!all && !schedule);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn fixed_width_folder_defaults_to_txt_files() {
        let parsed = Cli::try_parse_from(["xlpg", "fixed-width", "folder", "reports/"]).expect("parse");
        match parsed.command {
            Commands::FixedWidth {
                command: FixedWidthCommand::Folder { pattern, output_dir, .. },
            } => {
                assert_eq!(pattern, "*.txt");
                assert!(output_dir.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn table_preview_defaults_to_five_rows() {
        let parsed = Cli::try_parse_from(["xlpg", "table-preview"]).expect("parse");
        match parsed.command {
            Commands::TablePreview { schema, limit } => {
                assert!(schema.is_none());
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
