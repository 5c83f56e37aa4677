//! Data-quality validation.
//!
//! Standalone check over the consolidated table: verifies the national
//! company identifier's check digits, the sign and parseability of the
//! amount, and the presence of the entity name. Every row is tagged and
//! written back out; nothing is ever dropped here.

use csv::StringRecord;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Status written when no issue applies.
pub const STATUS_VALID: &str = "VALID";

const ISSUE_TAX_ID: &str = "CNPJ_INVALID";
const ISSUE_VALUE_NOT_POSITIVE: &str = "VALUE_NOT_POSITIVE";
const ISSUE_VALUE_INVALID: &str = "VALUE_INVALID";
const ISSUE_NAME_EMPTY: &str = "NAME_EMPTY";

const STATUS_COLUMN: &str = "ValidationStatus";
const TAX_ID_COLUMN: &str = "EntityTaxId";
const NAME_COLUMN: &str = "EntityName";
const AMOUNT_COLUMN: &str = "Amount";

// ============================================================================
// Validate stage
// ============================================================================

#[derive(Debug, Default)]
pub struct ValidateSummary {
    pub rows: usize,
    pub valid: usize,
    pub flagged: usize,
}

/// Tags every consolidated row with its data-quality status and writes
/// the validated CSV: the input columns plus a status column. Columns
/// are located by name, so column order in the input is irrelevant.
pub fn validate_consolidated(config: &PipelineConfig) -> Result<ValidateSummary> {
    let input = config.consolidated_path();
    if !input.exists() {
        return Err(PipelineError::MissingUpstreamFile { path: input });
    }

    let mut reader = csv::Reader::from_path(&input)?;
    let headers = reader.headers()?.clone();
    let tax_idx = column_index(&headers, TAX_ID_COLUMN);
    let name_idx = column_index(&headers, NAME_COLUMN);
    let amount_idx = column_index(&headers, AMOUNT_COLUMN);

    std::fs::create_dir_all(config.output_dir())?;
    let mut writer = csv::Writer::from_path(config.validated_path())?;
    let mut out_headers = headers.clone();
    out_headers.push_field(STATUS_COLUMN);
    writer.write_record(&out_headers)?;

    let mut summary = ValidateSummary::default();
    for row in reader.records() {
        let row = row?;
        let issues = row_issues(
            field(&row, tax_idx),
            field(&row, name_idx),
            field(&row, amount_idx),
            config,
        );
        let status = if issues.is_empty() {
            summary.valid += 1;
            STATUS_VALID.to_string()
        } else {
            summary.flagged += 1;
            issues.join(";")
        };

        let mut out = row.clone();
        out.push_field(&status);
        writer.write_record(&out)?;
        summary.rows += 1;
    }
    writer.flush()?;

    debug!(
        rows = summary.rows,
        valid = summary.valid,
        flagged = summary.flagged,
        "validation written"
    );
    Ok(summary)
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn field<'a>(row: &'a StringRecord, idx: Option<usize>) -> &'a str {
    idx.and_then(|i| row.get(i)).unwrap_or("")
}

/// Issue codes for one row, in check order. Empty means valid.
fn row_issues(
    tax_id: &str,
    name: &str,
    amount: &str,
    config: &PipelineConfig,
) -> Vec<&'static str> {
    let mut issues = Vec::new();

    if !is_valid_tax_id(
        tax_id,
        &config.digit_weights_first,
        &config.digit_weights_second,
    ) {
        issues.push(ISSUE_TAX_ID);
    }

    match amount.trim().parse::<f64>() {
        Ok(value) if value > 0.0 => {}
        Ok(_) => issues.push(ISSUE_VALUE_NOT_POSITIVE),
        Err(_) => issues.push(ISSUE_VALUE_INVALID),
    }

    if name.trim().is_empty() {
        issues.push(ISSUE_NAME_EMPTY);
    }

    issues
}

// ============================================================================
// Check digits
// ============================================================================

/// Validates a national company identifier: exactly fourteen digits
/// after stripping punctuation, not all identical, and both mod-11 check
/// digits correct. The second digit is computed over the first computed
/// digit, so a wrong thirteenth digit can never launder the fourteenth.
pub fn is_valid_tax_id(raw: &str, weights_first: &[u32], weights_second: &[u32]) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 14 {
        return false;
    }
    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }

    let first = check_digit(&digits[..12], weights_first);
    let mut body = digits[..12].to_vec();
    body.push(first);
    let second = check_digit(&body, weights_second);

    digits[12] == first && digits[13] == second
}

/// Weighted mod-11 digit: 0 when the remainder is below two, otherwise
/// the complement to eleven.
fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let remainder = sum % 11;
    if remainder < 2 {
        0
    } else {
        11 - remainder
    }
}

// ============================================================================
// Tests
// ============================================================================
