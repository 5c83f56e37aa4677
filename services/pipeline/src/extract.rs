//! Extraction and normalization stage.
//!
//! Opens every downloaded archive, finds the tabular entries inside
//! (delimited text or spreadsheets), and normalizes each one into the
//! canonical staged form: mapped columns, filtered expense rows, numeric
//! amounts, and a period for every row. One staged CSV per usable entry;
//! entries that cannot be decoded, parsed, or mapped are skipped with a
//! warning and never poison the rest of the run.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use encoding_rs::Encoding;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::records::{
    NormalizedRecord, COL_ACCOUNT, COL_AMOUNT, COL_DESCRIPTION, COL_ENTITY_ID, COL_PERIOD,
};

// ============================================================================
// Extract stage
// ============================================================================

#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub archives: usize,
    pub archives_failed: usize,
    pub entries_seen: usize,
    pub entries_staged: usize,
    pub entries_skipped: usize,
    pub rows_staged: usize,
}

/// Rebuilds the staging area from every archive under the raw directory.
/// Previous staged output is removed first so the area always reflects
/// exactly the archives currently on disk.
pub fn extract_archives(config: &PipelineConfig) -> Result<ExtractSummary> {
    let staging = config.staging_dir();
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let raw = config.raw_dir();
    let mut archives = Vec::new();
    if raw.exists() {
        collect_zip_files(&raw, &mut archives)?;
    }
    archives.sort();

    let mut summary = ExtractSummary::default();
    for archive_path in &archives {
        match stage_archive(archive_path, &staging, config, &mut summary) {
            Ok(staged) => {
                summary.archives += 1;
                println!(
                    "  ✓ {} -> {} staged entries",
                    archive_path.display(),
                    staged
                );
            }
            Err(e) => {
                summary.archives_failed += 1;
                warn!(archive = %archive_path.display(), error = %e, "archive skipped");
                println!("  ✗ {} could not be read, skipping", archive_path.display());
            }
        }
    }

    Ok(summary)
}

/// Stages every tabular entry of one archive. Returns how many entries
/// were staged; fails only if the archive itself cannot be opened or the
/// staging area cannot be written.
fn stage_archive(
    archive_path: &Path,
    staging: &Path,
    config: &PipelineConfig,
    summary: &mut ExtractSummary,
) -> Result<usize> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut staged = 0;

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(archive = %archive_path.display(), index, error = %e, "unreadable entry");
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if !is_tabular_entry(&name) {
            continue;
        }
        summary.entries_seen += 1;

        let mut bytes = Vec::new();
        if let Err(e) = entry.read_to_end(&mut bytes) {
            summary.entries_skipped += 1;
            warn!(entry = %name, error = %e, "entry read failed");
            continue;
        }

        match normalize_entry(&name, &bytes, archive_path, config) {
            Ok(records) => {
                let staged_name = staged_file_name(archive_path, &name);
                write_staged(staging, &staged_name, &records)?;
                summary.entries_staged += 1;
                summary.rows_staged += records.len();
                staged += 1;
                debug!(entry = %name, rows = records.len(), file = %staged_name, "entry staged");
            }
            Err(e) if e.is_recoverable() => {
                summary.entries_skipped += 1;
                warn!(entry = %name, reason = %e, "entry skipped");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(staged)
}

fn collect_zip_files(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for child in fs::read_dir(dir)? {
        let path = child?.path();
        if path.is_dir() {
            collect_zip_files(&path, found)?;
        } else if path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// Entries worth attempting: delimited text or spreadsheets.
fn is_tabular_entry(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".csv") || lower.ends_with(".txt") || lower.ends_with(".xlsx")
}

fn is_spreadsheet_entry(name: &str) -> bool {
    name.to_lowercase().ends_with(".xlsx")
}

/// One staged file per (archive, entry) pair so same-named entries in
/// different archives never collide.
fn staged_file_name(archive_path: &Path, entry_name: &str) -> String {
    let archive_stem = archive_path
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("archive");
    let flat = entry_name.replace(['/', '\\'], "_");
    let entry_stem = match flat.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => flat,
    };
    format!("{}_{}_normalized.csv", archive_stem, entry_stem)
}

fn write_staged(staging: &Path, name: &str, records: &[NormalizedRecord]) -> Result<()> {
    let path = staging.join(name);
    let mut writer = csv::Writer::from_path(&path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Entry normalization
// ============================================================================

/// Turns one archive entry into normalized records: decode, parse, map
/// columns, keep expense rows, normalize amounts, assign periods.
fn normalize_entry(
    entry: &str,
    bytes: &[u8],
    archive_path: &Path,
    config: &PipelineConfig,
) -> Result<Vec<NormalizedRecord>> {
    let (headers, rows) = if is_spreadsheet_entry(entry) {
        read_spreadsheet(entry, bytes)?
    } else {
        let text = decode_with_fallback(entry, bytes, &config.encodings)?;
        parse_delimited(entry, &text, &config.delimiters)?
    };

    let columns = map_headers(&headers, &config.financial_columns);
    let missing: Vec<String> = config
        .required_columns
        .iter()
        .filter(|c| !columns.contains_key(c.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::SchemaMismatch {
            entry: entry.to_string(),
            missing,
        });
    }

    let id_idx = columns[COL_ENTITY_ID];
    let account_idx = columns[COL_ACCOUNT];
    let description_idx = columns[COL_DESCRIPTION];
    let amount_idx = columns[COL_AMOUNT];
    let period_idx = columns.get(COL_PERIOD).copied();

    // When the table has no period column every row gets the quarter-end
    // date implied by the archive's raw/{year}/{Q-label}/ location.
    let default_period = derive_default_period(archive_path, config);
    let keywords: Vec<String> = config
        .expense_keywords
        .iter()
        .map(|k| k.to_uppercase())
        .collect();

    let mut records = Vec::new();
    for row in &rows {
        let description = field(row, description_idx);
        let upper = description.to_uppercase();
        if !keywords.iter().any(|k| upper.contains(k.as_str())) {
            continue;
        }
        let period = match period_idx {
            Some(idx) => field(row, idx),
            None => default_period.clone(),
        };
        records.push(NormalizedRecord {
            entity_id: field(row, id_idx),
            account: field(row, account_idx),
            description,
            amount: normalize_currency(&field(row, amount_idx)),
            period,
        });
    }

    if records.is_empty() {
        return Err(PipelineError::NoRelevantRows {
            entry: entry.to_string(),
        });
    }
    Ok(records)
}

fn field(row: &[String], idx: usize) -> String {
    row.get(idx).map(|s| s.trim().to_string()).unwrap_or_default()
}

/// Case-insensitive source-header lookup against a rename table. The
/// leftmost source column wins when several map to the same canonical
/// name.
fn map_headers(headers: &[String], table: &[(String, String)]) -> HashMap<String, usize> {
    let mut mapped = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let key = header.trim().to_uppercase();
        if let Some((_, canonical)) = table
            .iter()
            .find(|(source, _)| source.to_uppercase() == key)
        {
            mapped.entry(canonical.clone()).or_insert(idx);
        }
    }
    mapped
}

/// Quarter-end date implied by the archive's directory layout
/// (raw/{year}/{Q-label}/{file}), or empty if the path has no such
/// segments.
fn derive_default_period(archive_path: &Path, config: &PipelineConfig) -> String {
    let quarter_label = archive_path
        .parent()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str);
    let year = archive_path
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .and_then(OsStr::to_str);
    match (year, quarter_label) {
        (Some(year), Some(label)) => format!("{}-{}", year, config.month_end_for_label(label)),
        _ => String::new(),
    }
}

// ============================================================================
// Decoding and parsing
// ============================================================================

/// Decodes entry bytes trying each configured encoding in order. All but
/// the last are strict; the last decodes permissively so a non-empty
/// chain always produces text. A leading byte-order mark is dropped.
pub(crate) fn decode_with_fallback(
    entry: &str,
    bytes: &[u8],
    encodings: &[String],
) -> Result<String> {
    let last = encodings.len().saturating_sub(1);
    for (position, label) in encodings.iter().enumerate() {
        let Some(encoding) = Encoding::for_label(label.as_bytes()) else {
            warn!(label = %label, "unknown encoding label in configuration");
            continue;
        };
        if position < last {
            if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes)
            {
                debug!(entry = %entry, encoding = encoding.name(), "decoded strictly");
                return Ok(strip_bom(&text));
            }
        } else {
            let (text, actual, _) = encoding.decode(bytes);
            debug!(entry = %entry, encoding = actual.name(), "decoded permissively");
            return Ok(strip_bom(&text));
        }
    }
    Err(PipelineError::DecodeFailure {
        entry: entry.to_string(),
    })
}

fn strip_bom(text: &str) -> String {
    text.strip_prefix('\u{feff}').unwrap_or(text).to_string()
}

/// Parses delimited text trying each configured delimiter in order; the
/// first that yields more than one column wins. Rows that fail the CSV
/// grammar under the winning delimiter are skipped individually.
fn parse_delimited(
    entry: &str,
    text: &str,
    delimiters: &[u8],
) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    for &delimiter in delimiters {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = match reader.headers() {
            Ok(headers) => headers.iter().map(|h| h.to_string()).collect(),
            Err(_) => continue,
        };
        if headers.len() <= 1 {
            continue;
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            match record {
                Ok(record) => rows.push(record.iter().map(|f| f.to_string()).collect()),
                Err(e) => debug!(entry = %entry, error = %e, "malformed row skipped"),
            }
        }
        return Ok((headers, rows));
    }
    Err(PipelineError::ParseFailure {
        entry: entry.to_string(),
    })
}

/// Reads the first worksheet of a spreadsheet entry as text cells. Any
/// structural problem counts as a parse failure for the entry.
fn read_spreadsheet(entry: &str, bytes: &[u8]) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let parse_failure = || PipelineError::ParseFailure {
        entry: entry.to_string(),
    };

    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|_| parse_failure())?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(parse_failure)?;
    let range = workbook.worksheet_range(&sheet).map_err(|_| parse_failure())?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(cell_to_string).collect())
        .unwrap_or_default();
    let body = rows
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok((headers, body))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

// ============================================================================
// Currency normalization
// ============================================================================

/// Normalizes a monetary string to a float. Unparseable values become
/// 0.0 so a stray cell never costs the whole entry.
pub fn normalize_currency(raw: &str) -> f64 {
    parse_currency(raw).unwrap_or(0.0)
}

/// The typed parse behind [`normalize_currency`]: strips the currency
/// symbol, passes values already in machine form through, and
/// reinterprets thousands-dot/decimal-comma notation.
fn parse_currency(raw: &str) -> Result<f64> {
    let cleaned = raw.trim().trim_start_matches("R$").trim();
    if !cleaned.is_empty() && !cleaned.contains(',') {
        if let Ok(value) = cleaned.parse::<f64>() {
            return Ok(value);
        }
    }
    cleaned
        .replace('.', "")
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| PipelineError::ValueParseFailure {
            value: raw.trim().to_string(),
        })
}

// ============================================================================
// Tests
// ============================================================================
