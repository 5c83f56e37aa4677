//! Consolidation stage.
//!
//! Merges every staged table into one deterministic consolidated CSV:
//! exact duplicates collapse, zero-amount rows drop, periods normalize
//! to ISO dates with a derived year, and the identity columns the
//! enrichment stage will fill are materialized empty.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use tracing::warn;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::records::{ConsolidatedRecord, NormalizedRecord};

/// Period formats the upstream publishes: ISO dates and day-first
/// slashed dates.
const PERIOD_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

// ============================================================================
// Consolidate stage
// ============================================================================

#[derive(Debug, Default)]
pub struct ConsolidateSummary {
    pub rows: usize,
    pub files_read: usize,
    pub files_skipped: usize,
    pub duplicates_dropped: usize,
    pub zero_amount_dropped: usize,
}

/// Outcome of a consolidation run. An empty staging area is not an
/// error here; downstream stages treat the absent output as fatal.
#[derive(Debug)]
pub enum ConsolidateOutcome {
    Written(ConsolidateSummary),
    NoData,
}

/// Merges all staged tables into the consolidated CSV. Files are visited
/// in name order and rows kept in first-seen order, so the same staging
/// area always produces byte-identical output.
pub fn consolidate_staging(config: &PipelineConfig) -> Result<ConsolidateOutcome> {
    let staging = config.staging_dir();
    if !staging.exists() {
        return Ok(ConsolidateOutcome::NoData);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(&staging)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Ok(ConsolidateOutcome::NoData);
    }

    let mut summary = ConsolidateSummary::default();
    let mut seen = HashSet::new();
    let mut consolidated = Vec::new();

    for path in &files {
        let records = match read_staged_file(path) {
            Ok(records) => records,
            Err(e) => {
                summary.files_skipped += 1;
                warn!(file = %path.display(), error = %e, "staged file skipped");
                continue;
            }
        };
        summary.files_read += 1;

        for record in records {
            if !seen.insert(record.dedup_key()) {
                summary.duplicates_dropped += 1;
                continue;
            }
            if record.amount == 0.0 {
                summary.zero_amount_dropped += 1;
                continue;
            }
            consolidated.push(to_consolidated(record));
        }
    }

    // Tables that were all unreadable count the same as no tables.
    if summary.files_read == 0 {
        return Ok(ConsolidateOutcome::NoData);
    }

    let output = config.consolidated_path();
    fs::create_dir_all(config.output_dir())?;
    let mut writer = csv::Writer::from_path(&output)?;
    for record in &consolidated {
        writer.serialize(record)?;
    }
    writer.flush()?;

    summary.rows = consolidated.len();
    Ok(ConsolidateOutcome::Written(summary))
}

/// Reads one staged table whole. Any malformed row disqualifies the
/// entire file rather than leaving a partially merged table behind.
fn read_staged_file(path: &Path) -> Result<Vec<NormalizedRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

fn to_consolidated(record: NormalizedRecord) -> ConsolidatedRecord {
    let (period, year) = match parse_period_date(&record.period) {
        Some(date) => (date.format("%Y-%m-%d").to_string(), Some(date.year())),
        None => (String::new(), None),
    };
    ConsolidatedRecord {
        entity_id: record.entity_id,
        entity_tax_id: String::new(),
        entity_name: String::new(),
        period,
        year,
        amount: record.amount,
        description: record.description,
        account: record.account,
    }
}

/// Parses a period value against the known formats. Unparseable values
/// become null dates, never errors.
pub fn parse_period_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    PERIOD_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config_at(dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.data_dir = dir.to_path_buf();
        config
    }

    fn stage_records(config: &PipelineConfig, name: &str, records: &[NormalizedRecord]) {
        fs::create_dir_all(config.staging_dir()).unwrap();
        let mut writer = csv::Writer::from_path(config.staging_dir().join(name)).unwrap();
        for record in records {
            writer.serialize(record).unwrap();
        }
        writer.flush().unwrap();
    }

    fn record(entity_id: &str, amount: f64, period: &str) -> NormalizedRecord {
        NormalizedRecord {
            entity_id: entity_id.to_string(),
            account: "411".to_string(),
            description: "EVENTOS".to_string(),
            amount,
            period: period.to_string(),
        }
    }

    fn read_output(config: &PipelineConfig) -> Vec<ConsolidatedRecord> {
        let mut reader = csv::Reader::from_path(config.consolidated_path()).unwrap();
        reader.deserialize().map(|r| r.unwrap()).collect()
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    #[test]
    fn test_consolidate_drops_duplicates_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        let shared = record("1", 10.0, "2024-03-31");
        stage_records(&config, "a_normalized.csv", &[shared.clone(), record("2", 5.0, "")]);
        stage_records(&config, "b_normalized.csv", &[shared.clone()]);

        let outcome = consolidate_staging(&config).unwrap();
        let summary = match outcome {
            ConsolidateOutcome::Written(summary) => summary,
            ConsolidateOutcome::NoData => panic!("expected output"),
        };
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.duplicates_dropped, 1);
        assert_eq!(summary.files_read, 2);
    }

    #[test]
    fn test_consolidate_drops_zero_amounts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        stage_records(
            &config,
            "a_normalized.csv",
            &[record("1", 0.0, "2024-03-31"), record("2", 3.5, "2024-03-31")],
        );

        consolidate_staging(&config).unwrap();
        let rows = read_output(&config);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "2");
    }

    #[test]
    fn test_consolidate_normalizes_periods() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        stage_records(
            &config,
            "a_normalized.csv",
            &[
                record("1", 1.0, "2024-03-31"),
                record("2", 2.0, "31/03/2024"),
                record("3", 3.0, "not-a-date"),
            ],
        );

        consolidate_staging(&config).unwrap();
        let rows = read_output(&config);
        assert_eq!(rows[0].period, "2024-03-31");
        assert_eq!(rows[0].year, Some(2024));
        assert_eq!(rows[1].period, "2024-03-31");
        assert_eq!(rows[1].year, Some(2024));
        assert_eq!(rows[2].period, "");
        assert_eq!(rows[2].year, None);
    }

    #[test]
    fn test_consolidate_materializes_empty_identity_columns() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        stage_records(&config, "a_normalized.csv", &[record("1", 1.0, "2024-03-31")]);

        consolidate_staging(&config).unwrap();
        let rows = read_output(&config);
        assert_eq!(rows[0].entity_tax_id, "");
        assert_eq!(rows[0].entity_name, "");
    }

    #[test]
    fn test_consolidate_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        stage_records(&config, "b_normalized.csv", &[record("2", 2.0, "2024-06-30")]);
        stage_records(&config, "a_normalized.csv", &[record("1", 1.0, "2024-03-31")]);

        consolidate_staging(&config).unwrap();
        let first = fs::read(config.consolidated_path()).unwrap();
        consolidate_staging(&config).unwrap();
        let second = fs::read(config.consolidated_path()).unwrap();
        assert_eq!(first, second);

        // Name order, not directory order: a_ before b_.
        let rows = read_output(&config);
        assert_eq!(rows[0].entity_id, "1");
        assert_eq!(rows[1].entity_id, "2");
    }

    // ------------------------------------------------------------------
    // Empty and damaged staging
    // ------------------------------------------------------------------

    #[test]
    fn test_consolidate_no_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        assert!(matches!(
            consolidate_staging(&config).unwrap(),
            ConsolidateOutcome::NoData
        ));
    }

    #[test]
    fn test_consolidate_empty_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        fs::create_dir_all(config.staging_dir()).unwrap();
        assert!(matches!(
            consolidate_staging(&config).unwrap(),
            ConsolidateOutcome::NoData
        ));
    }

    #[test]
    fn test_consolidate_all_files_unreadable_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        fs::create_dir_all(config.staging_dir()).unwrap();
        fs::write(
            config.staging_dir().join("bad_normalized.csv"),
            "EntityId,Account,Description,Amount,Period\n1,411,EVENTOS,nope,2024-03-31\n",
        )
        .unwrap();

        assert!(matches!(
            consolidate_staging(&config).unwrap(),
            ConsolidateOutcome::NoData
        ));
        assert!(!config.consolidated_path().exists());
    }

    #[test]
    fn test_consolidate_skips_damaged_file_whole() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_at(dir.path());
        stage_records(&config, "good_normalized.csv", &[record("1", 1.0, "2024-03-31")]);
        fs::write(
            config.staging_dir().join("bad_normalized.csv"),
            "EntityId,Account,Description,Amount,Period\n7,411,EVENTOS,not-a-number,2024-03-31\n",
        )
        .unwrap();

        let outcome = consolidate_staging(&config).unwrap();
        let summary = match outcome {
            ConsolidateOutcome::Written(summary) => summary,
            ConsolidateOutcome::NoData => panic!("expected output"),
        };
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.rows, 1);
        assert_eq!(read_output(&config)[0].entity_id, "1");
    }

    // ------------------------------------------------------------------
    // Period parsing
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_period_date_formats() {
        assert_eq!(
            parse_period_date("2024-03-31"),
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
        assert_eq!(
            parse_period_date("31/03/2024"),
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
        assert_eq!(parse_period_date(" 2024-12-31 "), NaiveDate::from_ymd_opt(2024, 12, 31));
        assert_eq!(parse_period_date(""), None);
        assert_eq!(parse_period_date("2024-13-01"), None);
        assert_eq!(parse_period_date("Q1 2024"), None);
    }
}
