//! Fixed-width vendor spend reports (one payment per line) to CSV.
//!
//! A line looks like
//! `1 1234ACME SUPPLY CO           123456789 AB   0001234.56   2024`:
//! report part, four-digit college number, firm name, nine-digit federal id,
//! two-letter sub-object, dollar amount and a trailing four-digit year.
//! Columns drift between report vintages, so fields after the college
//! number are located by pattern rather than by offset.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::SourceError;

pub const HEADERS: [&str; 8] = [
    "Report Part",
    "College Number",
    "Firm Name",
    "Firm Fed ID",
    "Sub-object",
    "Dollar Amount",
    "Fiscal Year",
    "Fiscal Month",
];

pub const DEFAULT_PATTERN: &str = "*.txt";

const FISCAL_MONTH: &str = "13";

static FED_ID_BEFORE_SUB_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{9})\s*[A-Z]{2}").expect("valid regex"));
static FED_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{9}").expect("valid regex"));
static LEADING_SUB_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Z]{2})").expect("valid regex"));
static SUB_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z]{2}").expect("valid regex"));
static DECIMAL_AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.\d{2}").expect("valid regex"));
static IMPLIED_CENTS_AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{5,}").expect("valid regex"));
static TRAILING_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpendRecord {
    pub report_part: String,
    pub college_number: String,
    pub firm_name: String,
    pub firm_fed_id: String,
    pub sub_object: String,
    pub dollar_amount: String,
    pub fiscal_year: String,
    pub fiscal_month: String,
}

impl SpendRecord {
    pub fn fields(&self) -> [&str; 8] {
        [
            &self.report_part,
            &self.college_number,
            &self.firm_name,
            &self.firm_fed_id,
            &self.sub_object,
            &self.dollar_amount,
            &self.fiscal_year,
            &self.fiscal_month,
        ]
    }
}

fn byte_offset_of_char(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

fn dollar_amount(after_fed_id: &str) -> Option<String> {
    if let Some(m) = DECIMAL_AMOUNT.find(after_fed_id) {
        return Some(m.as_str().to_string());
    }
    // No decimal point: the last two digits are cents.
    let digits = IMPLIED_CENTS_AMOUNT.find(after_fed_id)?.as_str();
    let split = digits.len() - 2;
    Some(format!("{}.{}", &digits[..split], &digits[split..]))
}

/// Parse one report line; `None` for blank or unrecognisable lines.
pub fn parse_line(line: &str) -> Option<SpendRecord> {
    let line = line.trim();
    let mut chars = line.chars();
    let report_part = chars.next()?.to_string();
    let college_number = if line.chars().count() > 4 {
        line.chars().skip(1).take(4).collect()
    } else {
        String::new()
    };

    let rest = &line[byte_offset_of_char(line, 5)..];
    let (fed_start, fed_end) = match FED_ID_BEFORE_SUB_OBJECT.captures(rest) {
        Some(caps) => {
            let m = caps.get(1)?;
            (m.start(), m.end())
        }
        None => {
            let m = FED_ID.find(rest)?;
            (m.start(), m.end())
        }
    };
    let firm_fed_id = rest[fed_start..fed_end].to_string();
    let firm_name = rest[..fed_start].trim().to_string();

    let after_fed_id = rest[fed_end..].trim();
    let sub_object = LEADING_SUB_OBJECT
        .captures(after_fed_id)
        .and_then(|caps| caps.get(1))
        .or_else(|| SUB_OBJECT.find(after_fed_id))?
        .as_str()
        .to_string();

    let dollar_amount = dollar_amount(after_fed_id)?;

    let fiscal_year = TRAILING_YEAR
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str()[..2].to_string())
        .unwrap_or_default();

    Some(SpendRecord {
        report_part,
        college_number,
        firm_name,
        firm_fed_id,
        sub_object,
        dollar_amount,
        fiscal_year,
        fiscal_month: FISCAL_MONTH.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionStats {
    pub input: PathBuf,
    pub output: PathBuf,
    pub processed_lines: usize,
    pub total_lines: usize,
    /// One-based numbers of non-blank lines that could not be parsed.
    pub unparsed_lines: Vec<usize>,
}

/// `<dir>/<stem>_converted.csv` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_converted.csv"))
}

pub fn convert_text(text: &str) -> (Vec<SpendRecord>, usize, Vec<usize>) {
    let mut records = Vec::new();
    let mut unparsed = Vec::new();
    let mut total = 0usize;
    for (idx, line) in text.lines().enumerate() {
        total += 1;
        match parse_line(line) {
            Some(record) => records.push(record),
            None if !line.trim().is_empty() => unparsed.push(idx + 1),
            None => {}
        }
    }
    (records, total, unparsed)
}

pub fn write_records_csv(records: &[SpendRecord], output: &Path) -> Result<(), SourceError> {
    let csv_err = |source| SourceError::Csv {
        path: output.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(output).map_err(csv_err)?;
    writer.write_record(HEADERS).map_err(csv_err)?;
    for record in records {
        writer.write_record(record.fields()).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| SourceError::Io {
        path: output.to_path_buf(),
        source,
    })
}

/// Convert one report file; output defaults to [`default_output_path`].
pub fn convert_file(input: &Path, output: Option<&Path>) -> Result<ConversionStats, SourceError> {
    let text = fs::read_to_string(input).map_err(|source| SourceError::Io {
        path: input.to_path_buf(),
        source,
    })?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_path(input));

    let (records, total_lines, unparsed_lines) = convert_text(&text);
    for line_no in &unparsed_lines {
        warn!(input = %input.display(), line = line_no, "could not parse line");
    }
    write_records_csv(&records, &output)?;

    info!(
        input = %input.display(),
        output = %output.display(),
        processed = records.len(),
        total = total_lines,
        "conversion complete"
    );
    Ok(ConversionStats {
        input: input.to_path_buf(),
        output,
        processed_lines: records.len(),
        total_lines,
        unparsed_lines,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub output: PathBuf,
    pub processed_lines: usize,
    pub total_lines: usize,
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.processed_lines > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderSummary {
    pub output_dir: PathBuf,
    pub files: Vec<FileOutcome>,
}

impl FolderSummary {
    pub fn files_converted(&self) -> usize {
        self.files.iter().filter(|f| f.succeeded()).count()
    }

    pub fn lines_processed(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.succeeded())
            .map(|f| f.processed_lines)
            .sum()
    }

    pub fn lines_total(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.succeeded())
            .map(|f| f.total_lines)
            .sum()
    }
}

/// Files in `input_dir` matching `pattern`, sorted by path.
pub fn matching_files(input_dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, SourceError> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&input_dir.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full).map_err(|e| SourceError::Pattern {
        pattern: full.clone(),
        message: e.to_string(),
    })?;
    let mut files = entries
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "could not read path from glob pattern");
                None
            }
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

/// Convert every matching file in `input_dir` into `output_dir` (defaults to
/// the input folder). A file counts as converted when at least one line parsed.
pub fn convert_folder(
    input_dir: &Path,
    pattern: &str,
    output_dir: Option<&Path>,
) -> Result<FolderSummary, SourceError> {
    if !input_dir.is_dir() {
        return Err(SourceError::Io {
            path: input_dir.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "input folder not found"),
        });
    }
    let output_dir = output_dir.unwrap_or(input_dir).to_path_buf();
    fs::create_dir_all(&output_dir).map_err(|source| SourceError::Io {
        path: output_dir.clone(),
        source,
    })?;

    let files = matching_files(input_dir, pattern)?;
    if files.is_empty() {
        warn!(pattern, dir = %input_dir.display(), "no files matched");
    } else {
        info!(count = files.len(), "found files to process");
    }

    let mut outcomes = Vec::with_capacity(files.len());
    for input in files {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let output = output_dir.join(format!("{stem}_converted.csv"));
        let outcome = match convert_file(&input, Some(&output)) {
            Ok(stats) => FileOutcome {
                input,
                output,
                processed_lines: stats.processed_lines,
                total_lines: stats.total_lines,
                error: None,
            },
            Err(err) => {
                warn!(input = %input.display(), error = %err, "failed to process file");
                FileOutcome {
                    input,
                    output,
                    processed_lines: 0,
                    total_lines: 0,
                    error: Some(err.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(FolderSummary {
        output_dir,
        files: outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LINE: &str = "11234ACME SUPPLY CO            123456789 AB   0001234.56   2024";

    #[test]
    fn parses_a_well_formed_line() {
        let record = parse_line(LINE).expect("parsed");
        assert_eq!(record.report_part, "1");
        assert_eq!(record.college_number, "1234");
        assert_eq!(record.firm_name, "ACME SUPPLY CO");
        assert_eq!(record.firm_fed_id, "123456789");
        assert_eq!(record.sub_object, "AB");
        assert_eq!(record.dollar_amount, "0001234.56");
        assert_eq!(record.fiscal_year, "20");
        assert_eq!(record.fiscal_month, "13");
    }

    #[test]
    fn implied_cents_when_no_decimal_point() {
        let record = parse_line("20345NORTHWIND LLC 987654321 JZ 0012345 2023").expect("parsed");
        assert_eq!(record.firm_name, "NORTHWIND LLC");
        assert_eq!(record.sub_object, "JZ");
        assert_eq!(record.dollar_amount, "00123.45");
        assert_eq!(record.fiscal_year, "20");
    }

    #[test]
    fn prefers_the_id_that_precedes_a_sub_object() {
        // The firm name itself contains nine digits not followed by letters.
        let record =
            parse_line("10001FIRM 111111111 22 LTD 222222222 CD 45.00 2024").expect("parsed");
        assert_eq!(record.firm_fed_id, "222222222");
        assert_eq!(record.firm_name, "FIRM 111111111 22 LTD");
    }

    #[test]
    fn rejects_lines_without_required_fields() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("11234 NO FEDERAL ID HERE AB 10.00").is_none());
        assert!(parse_line("11234ACME 123456789 ab 12").is_none());
    }

    #[test]
    fn missing_trailing_year_leaves_fiscal_year_blank() {
        let record = parse_line("11234ACME 123456789 AB 10.50").expect("parsed");
        assert_eq!(record.fiscal_year, "");
    }

    #[test]
    fn file_conversion_counts_lines_and_writes_header() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("WWU Spend.txt");
        std::fs::write(&input, format!("{LINE}\n\ngarbage line\n{LINE}\n")).expect("write");

        let stats = convert_file(&input, None).expect("convert");
        assert_eq!(stats.output, dir.path().join("WWU Spend_converted.csv"));
        assert_eq!(stats.processed_lines, 2);
        assert_eq!(stats.total_lines, 4);
        assert_eq!(stats.unparsed_lines, vec![3]);

        let csv = std::fs::read_to_string(&stats.output).expect("read");
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("Report Part,College Number,Firm Name,Firm Fed ID,Sub-object,Dollar Amount,Fiscal Year,Fiscal Month")
        );
        assert_eq!(
            lines.next(),
            Some("1,1234,ACME SUPPLY CO,123456789,AB,0001234.56,20,13")
        );
    }

    #[test]
    fn folder_conversion_only_touches_matching_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), LINE).expect("write");
        std::fs::write(dir.path().join("b.txt"), "nothing useful").expect("write");
        std::fs::write(dir.path().join("c.dat"), LINE).expect("write");
        let out = dir.path().join("Converted_Files");

        let summary = convert_folder(dir.path(), DEFAULT_PATTERN, Some(&out)).expect("folder");
        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.files_converted(), 1);
        assert_eq!(summary.lines_processed(), 1);
        assert!(out.join("a_converted.csv").exists());
        assert!(!out.join("c_converted.csv").exists());
    }
}
