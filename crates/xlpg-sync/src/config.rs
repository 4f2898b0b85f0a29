use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use xlpg_core::normalize_column_name;

use crate::SyncError;

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_CONFLICT_KEYS_PATH: &str = "./conflict_keys.yaml";
pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_COPY_THRESHOLD: usize = 100_000;
pub const DEFAULT_SYNC_CRON: &str = "0 6 * * *";
pub const DEFAULT_REFRESH_CRON: &str = "0 * * * *";

/// Reads one variable; empty values count as unset.
pub(crate) fn lookup_nonempty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Comma-separated list with blanks removed.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
) -> Result<usize, SyncError> {
    match lookup_nonempty(lookup, name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or(SyncError::InvalidEnv {
                name: name.to_string(),
                value: raw,
            }),
    }
}

/// `DATABASE_URL`, falling back to `DB_URL`.
pub fn database_url_from(lookup: &impl Fn(&str) -> Option<String>) -> Option<String> {
    lookup_nonempty(lookup, "DATABASE_URL").or_else(|| lookup_nonempty(lookup, "DB_URL"))
}

pub fn database_url_from_env() -> Option<String> {
    database_url_from(&process_env)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncConfig {
    #[serde(skip_serializing)]
    pub database_url: String,
    pub excel_path: PathBuf,
    pub sheet_names: Vec<String>,
    pub schema: String,
    pub conflict_keys_path: PathBuf,
    pub output_dir: PathBuf,
    pub parallel: bool,
    pub max_workers: usize,
    pub batch_size: usize,
    pub copy_threshold: usize,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        let config = Self::from_lookup(process_env)?;
        if !config.excel_path.is_file() {
            return Err(SyncError::ExcelNotFound(config.excel_path));
        }
        Ok(config)
    }

    /// Builds the configuration from any variable source. Every missing
    /// required variable is reported in one error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let excel_path = lookup_nonempty(&lookup, "EXCEL_FILE_PATH");
        let sheet_names = lookup_nonempty(&lookup, "SHEET_NAMES")
            .map(|raw| split_list(&raw))
            .filter(|list| !list.is_empty());
        let database_url = database_url_from(&lookup);

        let mut missing = Vec::new();
        if excel_path.is_none() {
            missing.push("EXCEL_FILE_PATH".to_string());
        }
        if sheet_names.is_none() {
            missing.push("SHEET_NAMES".to_string());
        }
        if database_url.is_none() {
            missing.push("DATABASE_URL".to_string());
        }
        let (Some(excel_path), Some(sheet_names), Some(database_url)) =
            (excel_path, sheet_names, database_url)
        else {
            return Err(SyncError::MissingEnv(missing));
        };

        Ok(Self {
            database_url,
            excel_path: PathBuf::from(excel_path),
            sheet_names,
            schema: lookup_nonempty(&lookup, "SCHEMA_NAME").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            conflict_keys_path: lookup_nonempty(&lookup, "CONFLICT_KEYS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFLICT_KEYS_PATH)),
            output_dir: lookup_nonempty(&lookup, "OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            parallel: lookup_nonempty(&lookup, "PARALLEL_PROCESSING")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            max_workers: parse_number(&lookup, "MAX_WORKERS", DEFAULT_MAX_WORKERS)?,
            batch_size: parse_number(&lookup, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            copy_threshold: parse_number(&lookup, "COPY_THRESHOLD", DEFAULT_COPY_THRESHOLD)?,
            sync_cron: lookup_nonempty(&lookup, "SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MatviewConfig {
    pub database_url: String,
    pub schema: String,
    pub views: Vec<String>,
    pub refresh_cron: String,
}

impl MatviewConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let database_url = database_url_from(&lookup)
            .ok_or_else(|| SyncError::MissingEnv(vec!["DATABASE_URL".to_string()]))?;
        Ok(Self {
            database_url,
            schema: lookup_nonempty(&lookup, "MATVIEW_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            views: lookup_nonempty(&lookup, "MATERIALIZED_VIEWS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            refresh_cron: lookup_nonempty(&lookup, "REFRESH_CRON")
                .unwrap_or_else(|| DEFAULT_REFRESH_CRON.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Rows are identified by their conflict-key columns.
    #[default]
    Keyed,
    /// No natural key; the row hash is the identity and rows are never updated.
    HashOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSpec {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub mode: SyncMode,
}

impl SheetSpec {
    pub fn keyed<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            table: None,
            mode: SyncMode::Keyed,
        }
    }

    pub fn hash_only() -> Self {
        Self {
            keys: Vec::new(),
            table: None,
            mode: SyncMode::HashOnly,
        }
    }

    /// Key column names in the same normalized form as sheet headers.
    pub fn normalized_keys(&self) -> Vec<String> {
        self.keys.iter().map(|k| normalize_column_name(k)).collect()
    }

    /// Target table: the override when given, else the normalized sheet name.
    pub fn table_name(&self, sheet: &str) -> String {
        self.table
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| normalize_column_name(sheet))
    }
}

/// Per-sheet conflict keys, loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConflictKeyRegistry {
    #[serde(default)]
    pub sheets: BTreeMap<String, SheetSpec>,
}

impl ConflictKeyRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading conflict key registry {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        Ok(registry)
    }

    /// Exact sheet name first, then a case-insensitive match.
    pub fn lookup(&self, sheet: &str) -> Option<&SheetSpec> {
        self.sheets.get(sheet).or_else(|| {
            self.sheets
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(sheet))
                .map(|(_, spec)| spec)
        })
    }

    /// The usable spec for a sheet: keyed specs need at least one key.
    pub fn require(&self, sheet: &str) -> Result<&SheetSpec, SyncError> {
        match self.lookup(sheet) {
            Some(spec) if spec.mode == SyncMode::HashOnly || !spec.keys.is_empty() => Ok(spec),
            _ => Err(SyncError::NoConflictKeys(sheet.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_required_variables_are_reported_together() {
        let err = SyncConfig::from_lookup(vars(&[("SHEET_NAMES", " , ")])).expect_err("missing");
        match err {
            SyncError::MissingEnv(names) => {
                assert_eq!(names, vec!["EXCEL_FILE_PATH", "SHEET_NAMES", "DATABASE_URL"])
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn defaults_apply_and_db_url_falls_back() {
        let config = SyncConfig::from_lookup(vars(&[
            ("EXCEL_FILE_PATH", "data.xlsx"),
            ("SHEET_NAMES", "Vendor Search Results, afers_ofm,"),
            ("DB_URL", "postgres://u:p@localhost/db"),
            ("PARALLEL_PROCESSING", "False"),
        ]))
        .expect("config");
        assert_eq!(config.sheet_names, vec!["Vendor Search Results", "afers_ofm"]);
        assert_eq!(config.database_url, "postgres://u:p@localhost/db");
        assert_eq!(config.schema, "public");
        assert!(!config.parallel);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.copy_threshold, 100_000);
        assert_eq!(config.sync_cron, "0 6 * * *");
    }

    #[test]
    fn non_numeric_tuning_values_are_rejected() {
        let err = SyncConfig::from_lookup(vars(&[
            ("EXCEL_FILE_PATH", "data.xlsx"),
            ("SHEET_NAMES", "a"),
            ("DATABASE_URL", "postgres://localhost/db"),
            ("BATCH_SIZE", "lots"),
        ]))
        .expect_err("invalid");
        assert!(matches!(err, SyncError::InvalidEnv { name, .. } if name == "BATCH_SIZE"));
    }

    #[test]
    fn matview_config_reads_view_list() {
        let config = MatviewConfig::from_lookup(vars(&[
            ("DATABASE_URL", "postgres://localhost/db"),
            ("MATERIALIZED_VIEWS", "dim_customers, fact_issues_mv"),
        ]))
        .expect("config");
        assert_eq!(config.views, vec!["dim_customers", "fact_issues_mv"]);
        assert_eq!(config.schema, "public");
        assert!(MatviewConfig::from_lookup(vars(&[])).is_err());
    }

    #[test]
    fn registry_parses_modes_and_overrides() {
        let registry = ConflictKeyRegistry::from_yaml(
            r#"
sheets:
  vendor_search_results:
    keys: [UniqueID, "B2GNow Vendor Number"]
  afers_ofm:
    keys: [index]
    table: afers_ofm_2025
  legacy_dump:
    mode: hash_only
  broken: {}
"#,
        )
        .expect("yaml");

        let vendors = registry.require("Vendor_Search_Results").expect("case-insensitive");
        assert_eq!(vendors.normalized_keys(), vec!["uniqueid", "b2gnow_vendor_number"]);
        assert_eq!(vendors.table_name("Vendor Search Results"), "vendor_search_results");

        let afers = registry.require("afers_ofm").expect("afers");
        assert_eq!(afers.table_name("afers_ofm"), "afers_ofm_2025");

        assert_eq!(registry.require("legacy_dump").expect("hash").mode, SyncMode::HashOnly);
        assert!(matches!(registry.require("broken"), Err(SyncError::NoConflictKeys(_))));
        assert!(matches!(registry.require("unknown"), Err(SyncError::NoConflictKeys(_))));
    }
}
