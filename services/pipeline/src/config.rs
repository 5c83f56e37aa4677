//! Pipeline configuration.
//!
//! Endpoint URLs, directory layout, fetch limits, the column-rename
//! tables, the expense keyword list, and the identifier check-digit
//! weights all live here so the stages stay free of magic values. Every
//! network- or filesystem-facing knob can be overridden from the
//! environment; the semantic tables keep their defaults.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::records::{COL_ACCOUNT, COL_AMOUNT, COL_DESCRIPTION, COL_ENTITY_ID, COL_PERIOD};

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_ARCHIVE_BASE_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis";
const DEFAULT_REGISTRY_BASE_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/operadoras_de_plano_de_saude_ativas/";
const DEFAULT_REGISTRY_FALLBACK_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/operadoras_de_plano_de_saude_ativas/Relatorio_cadop.csv";

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_FETCH_QUARTERS: &str = "3";
const DEFAULT_FETCH_MAX_ATTEMPTS: &str = "12";
const DEFAULT_HTTP_TIMEOUT_SECS: &str = "60";

/// Substrings that mark a row as a monitored expense category. Matched
/// case-insensitively against the row's description.
const EXPENSE_KEYWORDS: &[&str] = &["EVENTO", "SINISTRO", "DESPESA", "PROVIS"];

/// Source column -> canonical column for quarterly disclosure tables.
/// Lookup is case-insensitive on the trimmed source header.
const FINANCIAL_COLUMNS: &[(&str, &str)] = &[
    ("DATA", COL_PERIOD),
    ("DT_FIM_EXERCICIO", COL_PERIOD),
    ("REG_ANS", COL_ENTITY_ID),
    ("CD_CONTA_CONTABIL", COL_ACCOUNT),
    ("DESCRICAO", COL_DESCRIPTION),
    ("VL_SALDO_FINAL", COL_AMOUNT),
];

/// Canonical columns an entry must resolve to be kept at all.
const REQUIRED_COLUMNS: &[&str] = &[COL_ENTITY_ID, COL_ACCOUNT, COL_DESCRIPTION, COL_AMOUNT];

/// Source column -> canonical column for the operator registry. Headers
/// are trimmed, stripped of quotes, and space-to-underscore normalized
/// before the case-insensitive lookup.
const REGISTRY_COLUMNS: &[(&str, &str)] = &[
    ("REGISTRO_OPERADORA", "EntityId"),
    ("REGISTRO_ANS", "EntityId"),
    ("REG_ANS", "EntityId"),
    ("CNPJ", "TaxId"),
    ("RAZAO_SOCIAL", "Name"),
    ("RAZÃO_SOCIAL", "Name"),
    ("MODALIDADE", "Category"),
    ("UF", "Region"),
];

/// Quarter label -> month-end suffix used when a table carries no period
/// column and the date must come from the archive's directory layout.
const QUARTER_MONTH_END: &[(&str, &str)] = &[
    ("Q1", "03-31"),
    ("Q2", "06-30"),
    ("Q3", "09-30"),
    ("Q4", "12-31"),
];

/// Suffix used when the quarter label is not recognized.
pub const DEFAULT_MONTH_END: &str = "01-01";

/// Character encodings tried in order when decoding archive entries. The
/// first entries are attempted strictly; the last permissively, so a
/// non-empty chain always yields text.
const ENCODING_CHAIN: &[&str] = &["utf-8", "windows-1252"];

/// Field delimiters tried in order when parsing delimited entries.
const DELIMITER_CHAIN: &[u8] = &[b';', b','];

/// Positional weights for the two check digits of the national company
/// identifier (first pass over 12 digits, second over 13).
const DIGIT_WEIGHTS_FIRST: &[u32] = &[5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const DIGIT_WEIGHTS_SECOND: &[u32] = &[6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

/// User agent sent with every outbound request.
pub const USER_AGENT: &str = "SaudeTransparente/1.0 (dados-abertos-pipeline)";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the quarterly disclosure archive tree ({base}/{year}/{N}T{year}.zip).
    pub archive_base_url: String,
    /// Directory listing used to discover the current registry export.
    pub registry_base_url: String,
    /// Known-good registry URL used when discovery fails.
    pub registry_fallback_url: String,
    /// Root of the local data tree (raw/, staging/, output/).
    pub data_dir: PathBuf,
    /// How many quarterly archives a fetch run tries to end up with.
    pub fetch_quarters: usize,
    /// Upper bound on quarters probed before the scan gives up.
    pub fetch_max_attempts: usize,
    /// Per-request timeout for all outbound HTTP.
    pub http_timeout_secs: u64,
    /// Relational store DSN. Only the load stage needs it.
    pub db_url: Option<String>,

    pub expense_keywords: Vec<String>,
    pub financial_columns: Vec<(String, String)>,
    pub required_columns: Vec<String>,
    pub registry_columns: Vec<(String, String)>,
    pub quarter_month_end: Vec<(String, String)>,
    pub encodings: Vec<String>,
    pub delimiters: Vec<u8>,
    pub digit_weights_first: Vec<u32>,
    pub digit_weights_second: Vec<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            archive_base_url: DEFAULT_ARCHIVE_BASE_URL.to_string(),
            registry_base_url: DEFAULT_REGISTRY_BASE_URL.to_string(),
            registry_fallback_url: DEFAULT_REGISTRY_FALLBACK_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            fetch_quarters: 3,
            fetch_max_attempts: 12,
            http_timeout_secs: 60,
            db_url: None,
            expense_keywords: EXPENSE_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            financial_columns: owned_pairs(FINANCIAL_COLUMNS),
            required_columns: REQUIRED_COLUMNS.iter().map(|s| s.to_string()).collect(),
            registry_columns: owned_pairs(REGISTRY_COLUMNS),
            quarter_month_end: owned_pairs(QUARTER_MONTH_END),
            encodings: ENCODING_CHAIN.iter().map(|s| s.to_string()).collect(),
            delimiters: DELIMITER_CHAIN.to_vec(),
            digit_weights_first: DIGIT_WEIGHTS_FIRST.to_vec(),
            digit_weights_second: DIGIT_WEIGHTS_SECOND.to_vec(),
        }
    }
}

impl PipelineConfig {
    /// Builds the configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = env::var("ARCHIVE_BASE_URL") {
            config.archive_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = env::var("REGISTRY_BASE_URL") {
            config.registry_base_url = url;
        }
        if let Ok(url) = env::var("REGISTRY_FALLBACK_URL") {
            config.registry_fallback_url = url;
        }
        if let Ok(dir) = env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.fetch_quarters = env::var("FETCH_QUARTERS")
            .unwrap_or_else(|_| DEFAULT_FETCH_QUARTERS.to_string())
            .parse()
            .context("invalid FETCH_QUARTERS")?;
        config.fetch_max_attempts = env::var("FETCH_MAX_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_FETCH_MAX_ATTEMPTS.to_string())
            .parse()
            .context("invalid FETCH_MAX_ATTEMPTS")?;
        config.http_timeout_secs = env::var("HTTP_TIMEOUT_SECS")
            .unwrap_or_else(|_| DEFAULT_HTTP_TIMEOUT_SECS.to_string())
            .parse()
            .context("invalid HTTP_TIMEOUT_SECS")?;

        config.db_url = env::var("DB_URL").ok();

        Ok(config)
    }

    // ------------------------------------------------------------------
    // Directory layout
    // ------------------------------------------------------------------

    /// Downloaded archives, laid out as raw/{year}/{Q-label}/{name}.zip.
    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    /// Per-entry normalized tables. Rebuilt from scratch on every
    /// extraction run.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Consolidated, enriched, aggregated, and validated outputs.
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn consolidated_path(&self) -> PathBuf {
        self.output_dir().join("consolidated.csv")
    }

    pub fn enriched_path(&self) -> PathBuf {
        self.output_dir().join("enriched.csv")
    }

    pub fn aggregates_path(&self) -> PathBuf {
        self.output_dir().join("aggregates.csv")
    }

    pub fn aggregates_bundle_path(&self) -> PathBuf {
        self.output_dir().join("aggregates.zip")
    }

    pub fn validated_path(&self) -> PathBuf {
        self.output_dir().join("validated.csv")
    }

    /// Month-end suffix for a quarter directory label, or the January
    /// fallback when the label is not recognized.
    pub fn month_end_for_label(&self, label: &str) -> &str {
        self.quarter_month_end
            .iter()
            .find(|(l, _)| l.eq_ignore_ascii_case(label))
            .map(|(_, suffix)| suffix.as_str())
            .unwrap_or(DEFAULT_MONTH_END)
    }
}

fn owned_pairs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_tables() {
        let config = PipelineConfig::default();
        assert_eq!(config.fetch_quarters, 3);
        assert_eq!(config.fetch_max_attempts, 12);
        assert_eq!(config.expense_keywords.len(), 4);
        assert_eq!(config.delimiters, vec![b';', b',']);
        assert_eq!(config.encodings.first().map(String::as_str), Some("utf-8"));
        assert_eq!(config.digit_weights_first.len(), 12);
        assert_eq!(config.digit_weights_second.len(), 13);
    }

    #[test]
    fn test_month_end_lookup() {
        let config = PipelineConfig::default();
        assert_eq!(config.month_end_for_label("Q1"), "03-31");
        assert_eq!(config.month_end_for_label("q3"), "09-30");
        assert_eq!(config.month_end_for_label("Q4"), "12-31");
        assert_eq!(config.month_end_for_label("anything"), "01-01");
    }

    #[test]
    fn test_output_layout_under_data_dir() {
        let mut config = PipelineConfig::default();
        config.data_dir = PathBuf::from("/tmp/pipeline-data");
        assert_eq!(
            config.consolidated_path(),
            PathBuf::from("/tmp/pipeline-data/output/consolidated.csv")
        );
        assert_eq!(
            config.staging_dir(),
            PathBuf::from("/tmp/pipeline-data/staging")
        );
    }
}
