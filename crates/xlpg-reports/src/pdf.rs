//! Worksheet to PDF export: one landscape table report per sheet, written
//! into a folder named after the sheet, with a text and JSON run report.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use printpdf::{BuiltinFont, Color, IndirectFontRef, Mm, PdfDocument, PdfLayerReference, Rect, Rgb};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use xlpg_core::CellValue;
use xlpg_sources::{TableSource, WorkbookSource};
use xlpg_storage::{ensure_writable_dir, retry, timestamped_file_name, write_atomic, RetryPolicy};

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
pub const ROWS_PER_PAGE: usize = 40;

pub const EXIT_ALL_CONVERTED: u8 = 0;
pub const EXIT_PARTIAL: u8 = 1;
pub const EXIT_ALL_FAILED: u8 = 2;
pub const EXIT_CRITICAL: u8 = 3;

const PAGE_WIDTH_MM: f32 = 297.0;
const PAGE_HEIGHT_MM: f32 = 210.0;
const MARGIN_MM: f32 = 10.0;
const TITLE_BAND_MM: f32 = 12.0;
const ROW_HEIGHT_MM: f32 = 4.3;
const CELL_PADDING_MM: f32 = 1.0;
const TITLE_SIZE_PT: f32 = 14.0;
const PT_TO_MM: f32 = 0.3528;
/// Average Helvetica glyph width as a fraction of the font size.
const AVG_GLYPH_EM: f32 = 0.55;

const HEADER_FILL: (u8, u8, u8) = (0x40, 0x46, 0x6e);
const STRIPE_FILL: (u8, u8, u8) = (0xf0, 0xf0, 0xf0);
const WHITE: (u8, u8, u8) = (0xff, 0xff, 0xff);
const BLACK: (u8, u8, u8) = (0x00, 0x00, 0x00);

#[derive(Debug, Error)]
pub enum PdfExportError {
    #[error("configuration validation failed: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("no data found in sheet '{0}'")]
    EmptySheet(String),
    #[error("pdf rendering failed: {0}")]
    Render(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PdfExportConfig {
    pub excel_file_path: PathBuf,
    pub sheet_names: Vec<String>,
    pub base_pdf_path: PathBuf,
    pub max_retries: usize,
    pub timeout_seconds: u64,
    pub report_dir: PathBuf,
}

impl PdfExportConfig {
    pub fn from_env() -> Result<Self, PdfExportError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Collects every configuration problem before failing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PdfExportError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut errors = Vec::new();

        let excel = get("EXCEL_FILE_PATH_PDF").map(PathBuf::from);
        match &excel {
            None => errors.push("EXCEL_FILE_PATH_PDF environment variable not set".to_string()),
            Some(path) if !path.exists() => {
                errors.push(format!("Excel file not found: {}", path.display()))
            }
            Some(path) if !has_excel_extension(path) => {
                errors.push(format!("File is not a valid Excel file: {}", path.display()))
            }
            Some(_) => {}
        }

        let sheet_names: Vec<String> = match get("SHEET_NAMES_PDF") {
            None => {
                errors.push("SHEET_NAMES_PDF environment variable not set or empty".to_string());
                Vec::new()
            }
            Some(raw) => {
                let names: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if names.is_empty() {
                    errors.push("No valid sheet names found after cleaning".to_string());
                }
                names
            }
        };

        let base = get("SHEET_CONVERTED_PDF_PATH").map(PathBuf::from);
        match &base {
            None => errors.push("SHEET_CONVERTED_PDF_PATH environment variable not set".to_string()),
            Some(path) => {
                let parent = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                if !parent.exists() {
                    errors.push(format!(
                        "Parent directory of PDF path does not exist: {}",
                        parent.display()
                    ));
                }
            }
        }

        let max_retries = parse_positive(&get, "MAX_CONVERSION_RETRIES", DEFAULT_MAX_RETRIES, &mut errors);
        let timeout_seconds =
            parse_positive(&get, "CONVERSION_TIMEOUT_SECONDS", DEFAULT_TIMEOUT_SECONDS as usize, &mut errors);

        if !errors.is_empty() {
            for problem in &errors {
                error!(problem = %problem, "configuration error");
            }
            return Err(PdfExportError::InvalidConfig(errors));
        }
        let (Some(excel_file_path), Some(base_pdf_path)) = (excel, base) else {
            return Err(PdfExportError::InvalidConfig(vec!["incomplete configuration".to_string()]));
        };
        info!("configuration validated successfully");
        Ok(Self {
            excel_file_path,
            sheet_names,
            base_pdf_path,
            max_retries,
            timeout_seconds: timeout_seconds as u64,
            report_dir: PathBuf::from("reports"),
        })
    }
}

fn parse_positive(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
    errors: &mut Vec<String>,
) -> usize {
    match get(name) {
        None => default,
        Some(raw) => match raw.parse::<usize>() {
            Ok(v) if v > 0 => v,
            _ => {
                errors.push(format!("{name} must be a positive integer, got {raw:?}"));
                default
            }
        },
    }
}

fn has_excel_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xlsx") || e.eq_ignore_ascii_case("xls"))
        .unwrap_or(false)
}

/// Capitalize the first letter of every run of letters, lowercase the rest.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

/// `<sheet>_analysis_report_<mm.dd.YYYY_HHMM>.pdf` inside `dir`.
pub fn output_path(dir: &Path, sheet: &str, at: &DateTime<Local>) -> PathBuf {
    dir.join(timestamped_file_name(
        &format!("{sheet}_analysis_report"),
        at,
        "%m.%d.%Y_%H%M",
        "pdf",
    ))
}

/// The printable part of a sheet: header row plus non-blank data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetGrid {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Skip leading blank rows and columns; the first remaining row is the header.
pub fn used_grid(sheet: &str, grid: Vec<Vec<CellValue>>) -> Result<SheetGrid, PdfExportError> {
    let has_data = |row: &[CellValue]| row.iter().any(|c| !c.is_empty());
    let first_row = grid
        .iter()
        .position(|row| has_data(row))
        .ok_or_else(|| PdfExportError::EmptySheet(sheet.to_string()))?;
    let body = &grid[first_row..];
    let width = body.iter().map(Vec::len).max().unwrap_or(0);
    let first_col = (0..width)
        .find(|col| body.iter().any(|row| row.get(*col).is_some_and(|c| !c.is_empty())))
        .unwrap_or(0);

    let cells = |row: &Vec<CellValue>| -> Vec<String> {
        (first_col..width)
            .map(|col| row.get(col).map(CellValue::display_text).unwrap_or_default())
            .collect()
    };
    let headers = cells(&body[0]);
    let rows: Vec<Vec<String>> = body[1..]
        .iter()
        .filter(|row| has_data(&row[first_col.min(row.len())..]))
        .map(cells)
        .collect();
    if rows.is_empty() {
        return Err(PdfExportError::EmptySheet(sheet.to_string()));
    }
    Ok(SheetGrid { headers, rows })
}

pub fn page_count(rows: usize) -> usize {
    rows.div_ceil(ROWS_PER_PAGE).max(1)
}

pub fn page_title(title: &str, page: usize, pages: usize) -> String {
    if pages > 1 {
        format!("Analysis Report - {title} (Page {page} of {pages})")
    } else {
        format!("Analysis Report - {title}")
    }
}

/// Point size shrinking with column count, between 6 and 9.
pub fn font_size_for(columns: usize) -> f32 {
    (100 / columns.max(1)).clamp(6, 9) as f32
}

/// Cut `text` so it fits in `width_mm` at `font_pt`, marking the cut with `...`.
pub fn fit_text(text: &str, width_mm: f32, font_pt: f32) -> String {
    let glyph_mm = font_pt * PT_TO_MM * AVG_GLYPH_EM;
    let max_chars = ((width_mm - 2.0 * CELL_PADDING_MM) / glyph_mm).floor().max(1.0) as usize;
    let text = text.replace(['\n', '\r', '\t'], " ");
    if text.chars().count() <= max_chars {
        return text;
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let mut cut: String = text.chars().take(max_chars - 3).collect();
    cut.push_str("...");
    cut
}

fn color((r, g, b): (u8, u8, u8)) -> Color {
    Color::Rgb(Rgb::new(
        f32::from(r) / 255.0,
        f32::from(g) / 255.0,
        f32::from(b) / 255.0,
        None,
    ))
}

fn fill_band(layer: &PdfLayerReference, top_mm: f32, fill: (u8, u8, u8)) {
    layer.set_fill_color(color(fill));
    layer.add_rect(Rect::new(
        Mm(MARGIN_MM),
        Mm(top_mm - ROW_HEIGHT_MM),
        Mm(PAGE_WIDTH_MM - MARGIN_MM),
        Mm(top_mm),
    ));
}

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

fn draw_page(layer: &PdfLayerReference, fonts: &Fonts, title: &str, headers: &[String], rows: &[Vec<String>]) {
    let font_pt = font_size_for(headers.len());
    let col_width = (PAGE_WIDTH_MM - 2.0 * MARGIN_MM) / headers.len().max(1) as f32;
    let baseline = (ROW_HEIGHT_MM - font_pt * PT_TO_MM) / 2.0 + 0.3;

    layer.set_fill_color(color(BLACK));
    layer.use_text(
        title,
        TITLE_SIZE_PT,
        Mm(MARGIN_MM),
        Mm(PAGE_HEIGHT_MM - MARGIN_MM - 5.0),
        &fonts.bold,
    );

    let mut top = PAGE_HEIGHT_MM - MARGIN_MM - TITLE_BAND_MM;
    fill_band(layer, top, HEADER_FILL);
    layer.set_fill_color(color(WHITE));
    for (idx, header) in headers.iter().enumerate() {
        layer.use_text(
            fit_text(header, col_width, font_pt),
            font_pt,
            Mm(MARGIN_MM + idx as f32 * col_width + CELL_PADDING_MM),
            Mm(top - ROW_HEIGHT_MM + baseline),
            &fonts.bold,
        );
    }

    for (row_no, row) in rows.iter().enumerate() {
        top -= ROW_HEIGHT_MM;
        if (row_no + 1) % 2 == 0 {
            fill_band(layer, top, STRIPE_FILL);
        }
        layer.set_fill_color(color(BLACK));
        for (idx, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            layer.use_text(
                fit_text(value, col_width, font_pt),
                font_pt,
                Mm(MARGIN_MM + idx as f32 * col_width + CELL_PADDING_MM),
                Mm(top - ROW_HEIGHT_MM + baseline),
                &fonts.regular,
            );
        }
    }
}

/// A4 landscape table report, 40 data rows per page.
pub fn render_sheet_pdf(title: &str, grid: &SheetGrid) -> Result<Vec<u8>, PdfExportError> {
    let render_err = |e: printpdf::Error| PdfExportError::Render(e.to_string());
    let pages = page_count(grid.rows.len());
    let (doc, first_page, first_layer) = PdfDocument::new(
        format!("Analysis Report - {title}"),
        Mm(PAGE_WIDTH_MM),
        Mm(PAGE_HEIGHT_MM),
        "Layer 1",
    );
    let fonts = Fonts {
        regular: doc.add_builtin_font(BuiltinFont::Helvetica).map_err(render_err)?,
        bold: doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(render_err)?,
    };

    for (idx, chunk) in grid.rows.chunks(ROWS_PER_PAGE).enumerate() {
        let layer = if idx == 0 {
            doc.get_page(first_page).get_layer(first_layer)
        } else {
            let (page, layer) = doc.add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Layer 1");
            doc.get_page(page).get_layer(layer)
        };
        draw_page(&layer, &fonts, &page_title(title, idx + 1, pages), &grid.headers, chunk);
    }

    let mut writer = BufWriter::new(Vec::new());
    doc.save(&mut writer).map_err(render_err)?;
    writer
        .into_inner()
        .map_err(|e| PdfExportError::Render(e.to_string()))
}

fn render_sheet_file(excel: &Path, sheet: &str, title: &str) -> Result<Vec<u8>> {
    let mut workbook = WorkbookSource::open(excel)?;
    let grid = used_grid(sheet, workbook.read_grid(sheet)?)?;
    debug!(sheet, rows = grid.rows.len(), columns = grid.headers.len(), "sheet data loaded");
    Ok(render_sheet_pdf(title, &grid)?)
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub sheet_name: String,
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub duration_seconds: f64,
    pub file_size: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionRun {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub results: Vec<ConversionResult>,
    pub configuration: PdfExportConfig,
}

impl ConversionRun {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.success_count() as f64 / self.results.len() as f64
        }
    }

    pub fn exit_code(&self) -> u8 {
        let ok = self.success_count();
        if ok == self.results.len() && ok > 0 {
            EXIT_ALL_CONVERTED
        } else if ok > 0 {
            EXIT_PARTIAL
        } else {
            EXIT_ALL_FAILED
        }
    }

    fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn render_text_report(&self) -> String {
        let rule = "=".repeat(80);
        let thin = "-".repeat(40);
        let total = self.results.len();
        let ok = self.success_count();
        let mut out = vec![
            rule.clone(),
            "EXCEL TO PDF CONVERSION REPORT".to_string(),
            rule,
            format!("Generated: {}", self.finished_at.format("%Y-%m-%d %H:%M:%S")),
            format!("Duration: {:.2}s", self.duration_seconds()),
            format!("Source File: {}", self.configuration.excel_file_path.display()),
            format!("Output Base Path: {}", self.configuration.base_pdf_path.display()),
            format!(
                "Success Rate: {ok}/{total} ({:.1}%)",
                self.success_rate() * 100.0
            ),
            String::new(),
        ];
        if ok > 0 {
            out.push("SUCCESSFUL CONVERSIONS:".to_string());
            out.push(thin.clone());
            for result in self.results.iter().filter(|r| r.success) {
                out.push(format!("[ok] {}", result.sheet_name));
                if let Some(path) = &result.output_path {
                    out.push(format!("  Output: {}", path.display()));
                }
                out.push(format!("  Duration: {:.2}s", result.duration_seconds));
                if let Some(size) = result.file_size {
                    out.push(format!("  File Size: {size} bytes"));
                }
                out.push(String::new());
            }
        }
        if ok < total {
            out.push("FAILED CONVERSIONS:".to_string());
            out.push(thin.clone());
            for result in self.results.iter().filter(|r| !r.success) {
                out.push(format!("[failed] {}", result.sheet_name));
                out.push(format!("  Error: {}", result.error.as_deref().unwrap_or("unknown")));
                out.push(format!(
                    "  Attempted Output: {}",
                    result
                        .output_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "N/A".to_string())
                ));
                out.push(String::new());
            }
        }
        out.push("CONFIGURATION:".to_string());
        out.push(thin);
        out.push(format!("Max Retries: {}", self.configuration.max_retries));
        out.push(format!("Timeout: {} seconds", self.configuration.timeout_seconds));
        out.push(format!(
            "Requested Sheets: {}",
            self.configuration.sheet_names.join(", ")
        ));
        out.push(String::new());
        out.join("\n")
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "timestamp": self.finished_at.to_rfc3339(),
            "duration_seconds": self.duration_seconds(),
            "source_file": self.configuration.excel_file_path,
            "output_base_path": self.configuration.base_pdf_path,
            "total_sheets": self.results.len(),
            "successful_conversions": self.success_count(),
            "success_rate": self.success_rate(),
            "configuration": self.configuration,
            "results": self.results,
        })
    }
}

pub struct SheetPdfExporter {
    config: PdfExportConfig,
}

impl SheetPdfExporter {
    pub fn new(config: PdfExportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PdfExportConfig {
        &self.config
    }

    /// One writable folder per requested sheet, named in title case.
    pub async fn setup_directories(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut dirs = BTreeMap::new();
        for sheet in &self.config.sheet_names {
            let dir = self.config.base_pdf_path.join(title_case(sheet));
            ensure_writable_dir(&dir).await?;
            info!(dir = %dir.display(), "directory ready");
            dirs.insert(sheet.clone(), dir);
        }
        Ok(dirs)
    }

    async fn attempt_conversion(&self, sheet: &str, output: &Path) -> Result<u64> {
        let excel = self.config.excel_file_path.clone();
        let sheet_owned = sheet.to_string();
        let title = title_case(sheet);
        let limit = Duration::from_secs(self.config.timeout_seconds);
        let bytes = tokio::time::timeout(
            limit,
            tokio::task::spawn_blocking(move || render_sheet_file(&excel, &sheet_owned, &title)),
        )
        .await
        .map_err(|_| anyhow!("conversion timed out after {} seconds", limit.as_secs()))?
        .context("pdf render task panicked")??;

        write_atomic(output, &bytes).await?;
        let size = tokio::fs::metadata(output)
            .await
            .with_context(|| format!("reading {}", output.display()))?
            .len();
        anyhow::ensure!(size > 0, "PDF file was not created or is empty");
        Ok(size)
    }

    /// Up to `max_retries` attempts, two seconds apart. Returns the file size.
    pub async fn convert_sheet_with_retry(&self, sheet: &str, output: &Path) -> Result<u64, String> {
        let policy = RetryPolicy::new(self.config.max_retries, RETRY_DELAY);
        let max = policy.max_attempts;
        retry(&policy, sheet, |attempt| async move {
            info!(sheet, attempt, max, "converting sheet");
            self.attempt_conversion(sheet, output)
                .await
                .map_err(|e| format!("{e:#}"))
        })
        .await
        .map(|size| {
            info!(sheet, size, "conversion successful");
            size
        })
        .map_err(|err| {
            error!(sheet, error = %err, "all attempts failed");
            err.last_error().to_string()
        })
    }

    pub async fn run(&self) -> Result<ConversionRun> {
        let started_at = Local::now();
        info!(
            source = %self.config.excel_file_path.display(),
            sheets = ?self.config.sheet_names,
            output = %self.config.base_pdf_path.display(),
            "starting Excel to PDF conversion"
        );
        let dirs = self.setup_directories().await?;

        let excel = self.config.excel_file_path.clone();
        let available = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            Ok(WorkbookSource::open(&excel)?.sheet_names())
        })
        .await
        .context("workbook reader task panicked")??;
        info!(available = ?available, "available sheets");

        let mut results = Vec::with_capacity(self.config.sheet_names.len());
        for sheet in &self.config.sheet_names {
            let started = Instant::now();
            if !available.contains(sheet) {
                let message = format!("Sheet '{sheet}' not found in Excel file. Available: {available:?}");
                warn!(sheet = %sheet, "{message}");
                results.push(ConversionResult {
                    sheet_name: sheet.clone(),
                    success: false,
                    output_path: None,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    file_size: None,
                    error: Some(message),
                });
                continue;
            }
            let dir = dirs
                .get(sheet)
                .cloned()
                .unwrap_or_else(|| self.config.base_pdf_path.join(title_case(sheet)));
            let output = output_path(&dir, sheet, &Local::now());
            let outcome = self.convert_sheet_with_retry(sheet, &output).await;
            results.push(ConversionResult {
                sheet_name: sheet.clone(),
                success: outcome.is_ok(),
                output_path: Some(output),
                duration_seconds: started.elapsed().as_secs_f64(),
                file_size: outcome.as_ref().ok().copied(),
                error: outcome.err(),
            });
        }

        Ok(ConversionRun {
            started_at,
            finished_at: Local::now(),
            results,
            configuration: self.config.clone(),
        })
    }

    /// `conversion_report_<ts>.txt` and `.json` under the report directory.
    pub async fn write_reports(&self, run: &ConversionRun) -> Result<(PathBuf, PathBuf)> {
        let now = Local::now();
        let dir = &self.config.report_dir;
        let text_path = dir.join(timestamped_file_name("conversion_report", &now, "%Y%m%d_%H%M%S", "txt"));
        let json_path = dir.join(timestamped_file_name("conversion_report", &now, "%Y%m%d_%H%M%S", "json"));
        write_atomic(&text_path, run.render_text_report().as_bytes()).await?;
        let json = serde_json::to_vec_pretty(&run.to_json()).context("serializing conversion report")?;
        write_atomic(&json_path, &json).await?;
        info!(text = %text_path.display(), json = %json_path.display(), "reports generated");
        Ok((text_path, json_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn lookup(pairs: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&'static str, String> = pairs.into_iter().collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn validation_reports_every_problem() {
        let err = PdfExportConfig::from_lookup(lookup(vec![
            ("EXCEL_FILE_PATH_PDF", "/no/such/book.xlsx".to_string()),
            ("SHEET_NAMES_PDF", " , ,".to_string()),
            ("MAX_CONVERSION_RETRIES", "zero".to_string()),
        ]))
        .expect_err("invalid");
        let PdfExportError::InvalidConfig(problems) = err else {
            panic!("expected configuration error");
        };
        assert_eq!(problems.len(), 4);
        assert!(problems[0].starts_with("Excel file not found"));
        assert_eq!(problems[1], "No valid sheet names found after cleaning");
        assert_eq!(problems[2], "SHEET_CONVERTED_PDF_PATH environment variable not set");
        assert!(problems[3].starts_with("MAX_CONVERSION_RETRIES"));
    }

    #[test]
    fn valid_configuration_is_accepted() {
        let dir = tempdir().expect("tempdir");
        let book = dir.path().join("Analysts.XLSX");
        std::fs::write(&book, b"placeholder").expect("write");
        let not_excel = dir.path().join("notes.csv");
        std::fs::write(&not_excel, b"a,b").expect("write");

        let config = PdfExportConfig::from_lookup(lookup(vec![
            ("EXCEL_FILE_PATH_PDF", book.display().to_string()),
            ("SHEET_NAMES_PDF", "jane doe, mark".to_string()),
            ("SHEET_CONVERTED_PDF_PATH", dir.path().join("pdfs").display().to_string()),
        ]))
        .expect("valid");
        assert_eq!(config.sheet_names, vec!["jane doe", "mark"]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_seconds, 300);

        let err = PdfExportConfig::from_lookup(lookup(vec![
            ("EXCEL_FILE_PATH_PDF", not_excel.display().to_string()),
            ("SHEET_NAMES_PDF", "mark".to_string()),
            ("SHEET_CONVERTED_PDF_PATH", dir.path().join("pdfs").display().to_string()),
        ]))
        .expect_err("csv is not a workbook");
        assert!(err.to_string().contains("not a valid Excel file"));
    }

    #[test]
    fn title_case_matches_folder_convention() {
        assert_eq!(title_case("jane doe"), "Jane Doe");
        assert_eq!(title_case("MARK_o'neil 2nd"), "Mark_O'Neil 2Nd");
    }

    #[test]
    fn output_names_carry_the_timestamp() {
        let at = chrono::TimeZone::with_ymd_and_hms(&Local, 2025, 3, 7, 14, 5, 0)
            .single()
            .expect("local time");
        assert_eq!(
            output_path(Path::new("/pdf/Jane"), "jane", &at),
            PathBuf::from("/pdf/Jane/jane_analysis_report_03.07.2025_1405.pdf")
        );
    }

    #[test]
    fn used_grid_trims_leading_blanks_and_empty_rows() {
        let grid = vec![
            vec![CellValue::Empty, CellValue::Empty, CellValue::Empty],
            vec![CellValue::Empty, text("Vendor"), text("Amount")],
            vec![CellValue::Empty, text("Acme"), CellValue::Float(12.5)],
            vec![CellValue::Empty, CellValue::Empty, CellValue::Empty],
            vec![CellValue::Empty, text("Globex"), CellValue::Empty],
        ];
        let used = used_grid("s", grid).expect("grid");
        assert_eq!(used.headers, vec!["Vendor", "Amount"]);
        assert_eq!(
            used.rows,
            vec![
                vec!["Acme".to_string(), "12.5".to_string()],
                vec!["Globex".to_string(), String::new()],
            ]
        );

        let header_only = vec![vec![text("Vendor")]];
        assert!(matches!(used_grid("s", header_only), Err(PdfExportError::EmptySheet(_))));
        assert!(matches!(used_grid("s", Vec::new()), Err(PdfExportError::EmptySheet(_))));
    }

    #[test]
    fn layout_rules() {
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(40), 1);
        assert_eq!(page_count(41), 2);
        assert_eq!(page_title("Jane", 1, 1), "Analysis Report - Jane");
        assert_eq!(page_title("Jane", 2, 3), "Analysis Report - Jane (Page 2 of 3)");
        assert_eq!(font_size_for(3), 9.0);
        assert_eq!(font_size_for(12), 8.0);
        assert_eq!(font_size_for(40), 6.0);
        assert_eq!(fit_text("short", 50.0, 9.0), "short");
        let cut = fit_text(&"x".repeat(200), 20.0, 9.0);
        assert!(cut.ends_with("..."));
        assert!(cut.len() < 200);
    }

    #[test]
    fn rendered_pdf_is_a_pdf() {
        let grid = SheetGrid {
            headers: vec!["Vendor".to_string(), "Amount".to_string()],
            rows: (0..85).map(|i| vec![format!("Vendor {i}"), format!("{i}.00")]).collect(),
        };
        let bytes = render_sheet_pdf("Jane", &grid).expect("pdf");
        assert!(bytes.starts_with(b"%PDF"));
        assert!(bytes.len() > 500);
    }

    fn run_with(results: Vec<bool>) -> ConversionRun {
        let config = PdfExportConfig {
            excel_file_path: PathBuf::from("book.xlsx"),
            sheet_names: vec!["a".to_string(), "b".to_string()],
            base_pdf_path: PathBuf::from("pdfs"),
            max_retries: 3,
            timeout_seconds: 300,
            report_dir: PathBuf::from("reports"),
        };
        ConversionRun {
            started_at: Local::now(),
            finished_at: Local::now(),
            results: results
                .into_iter()
                .enumerate()
                .map(|(i, ok)| ConversionResult {
                    sheet_name: format!("sheet{i}"),
                    success: ok,
                    output_path: Some(PathBuf::from(format!("pdfs/sheet{i}.pdf"))),
                    duration_seconds: 0.5,
                    file_size: ok.then_some(1024),
                    error: (!ok).then(|| "boom".to_string()),
                })
                .collect(),
            configuration: config,
        }
    }

    #[test]
    fn exit_codes_follow_success_ratio() {
        assert_eq!(run_with(vec![true, true]).exit_code(), EXIT_ALL_CONVERTED);
        assert_eq!(run_with(vec![true, false]).exit_code(), EXIT_PARTIAL);
        assert_eq!(run_with(vec![false, false]).exit_code(), EXIT_ALL_FAILED);
        assert_eq!(run_with(Vec::new()).exit_code(), EXIT_ALL_FAILED);
    }

    #[test]
    fn reports_describe_successes_and_failures() {
        let run = run_with(vec![true, false]);
        let report = run.render_text_report();
        assert!(report.contains("Success Rate: 1/2 (50.0%)"));
        assert!(report.contains("SUCCESSFUL CONVERSIONS:"));
        assert!(report.contains("  Error: boom"));
        assert!(report.contains("Requested Sheets: a, b"));

        let json = run.to_json();
        assert_eq!(json["total_sheets"], 2);
        assert_eq!(json["successful_conversions"], 1);
        assert_eq!(json["results"][1]["error"], "boom");
    }

    #[tokio::test]
    async fn missing_workbook_fails_after_all_attempts() {
        let dir = tempdir().expect("tempdir");
        let config = PdfExportConfig {
            excel_file_path: dir.path().join("missing.xlsx"),
            sheet_names: vec!["jane".to_string()],
            base_pdf_path: dir.path().join("pdfs"),
            max_retries: 1,
            timeout_seconds: 5,
            report_dir: dir.path().join("reports"),
        };
        let exporter = SheetPdfExporter::new(config);
        let dirs = exporter.setup_directories().await.expect("dirs");
        assert!(dirs["jane"].ends_with("Jane"));

        let output = dirs["jane"].join("out.pdf");
        let err = exporter
            .convert_sheet_with_retry("jane", &output)
            .await
            .expect_err("no workbook");
        assert!(err.contains("missing.xlsx"));
        assert!(!output.exists());
    }
}
