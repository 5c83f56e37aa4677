//! Registry enrichment stage.
//!
//! Downloads the current operator registry export, indexes it by the
//! numeric regulatory id, and left-joins the consolidated table against
//! it. Every consolidated row survives exactly once; matched rows gain
//! the registry's identity attributes, unmatched rows keep what they had
//! plus UNKNOWN placeholders, and each row records the join outcome.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::extract::decode_with_fallback;
use crate::records::{
    parse_entity_id, ConsolidatedRecord, EnrichedRecord, RegistryEntity, MATCH_FOUND,
    MATCH_NOT_FOUND, UNKNOWN,
};

/// Canonical registry column names, as used in the rename table.
const REG_ENTITY_ID: &str = "EntityId";
const REG_TAX_ID: &str = "TaxId";
const REG_NAME: &str = "Name";
const REG_CATEGORY: &str = "Category";
const REG_REGION: &str = "Region";

// ============================================================================
// Enrich stage
// ============================================================================

#[derive(Debug)]
pub struct EnrichSummary {
    pub rows: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub registry_entities: usize,
    pub registry_url: String,
}

/// Joins the consolidated table with the operator registry and writes
/// the enriched CSV. A missing consolidated table or an unusable
/// registry ends the run; everything else degrades row by row.
pub async fn enrich_consolidated(
    client: &Client,
    config: &PipelineConfig,
) -> Result<EnrichSummary> {
    let input = config.consolidated_path();
    if !input.exists() {
        return Err(PipelineError::MissingUpstreamFile { path: input });
    }

    let url = discover_registry_url(client, config).await;
    println!("  registry export: {}", url);
    let bytes = download_registry(client, &url).await?;
    let text = decode_with_fallback("registry export", &bytes, &config.encodings)
        .map_err(|e| PipelineError::RegistryUnavailable {
            reason: e.to_string(),
        })?;
    let index = build_registry_index(&text, config)?;
    println!("  registry entities indexed: {}", index.len());

    let rows = read_consolidated(&input)?;
    let total = rows.len();
    let (enriched, matched) = enrich_rows(rows, &index);

    let output = config.enriched_path();
    std::fs::create_dir_all(config.output_dir())?;
    let mut writer = csv::Writer::from_path(&output)?;
    for record in &enriched {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(EnrichSummary {
        rows: total,
        matched,
        unmatched: total - matched,
        registry_entities: index.len(),
        registry_url: url,
    })
}

fn read_consolidated(path: &Path) -> Result<Vec<ConsolidatedRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

// ============================================================================
// Registry discovery and download
// ============================================================================

/// Finds the current registry export by scraping the directory listing
/// for a CSV link. Any failure along the way falls back to the known
/// fixed URL; discovery never aborts the stage.
async fn discover_registry_url(client: &Client, config: &PipelineConfig) -> String {
    let listing = match client
        .get(&config.registry_base_url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
    {
        Ok(response) => match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "registry listing unreadable, using fallback URL");
                return config.registry_fallback_url.clone();
            }
        },
        Err(e) => {
            warn!(error = %e, "registry listing unavailable, using fallback URL");
            return config.registry_fallback_url.clone();
        }
    };

    if let Ok(pattern) = Regex::new(r#"(?i)href="([^"]+\.csv)""#) {
        if let Some(captures) = pattern.captures(&listing) {
            let url = resolve_registry_href(&config.registry_base_url, &captures[1]);
            debug!(url = %url, "registry export discovered");
            return url;
        }
    }

    warn!("no CSV link in registry listing, using fallback URL");
    config.registry_fallback_url.clone()
}

/// Absolute URL for a discovered export link. Relative hrefs join under
/// the listing URL with exactly one separating slash, whatever the
/// configured base ends with.
fn resolve_registry_href(base_url: &str, href: &str) -> String {
    if href.starts_with("http") {
        return href.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        href.trim_start_matches('/')
    )
}

async fn download_registry(client: &Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PipelineError::RegistryUnavailable {
            reason: format!("download failed: {e}"),
        })?;
    if !response.status().is_success() {
        return Err(PipelineError::RegistryUnavailable {
            reason: format!("{} answered {}", url, response.status()),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| PipelineError::RegistryUnavailable {
            reason: format!("download interrupted: {e}"),
        })?;
    if bytes.is_empty() {
        return Err(PipelineError::RegistryUnavailable {
            reason: format!("{} returned an empty body", url),
        });
    }
    Ok(bytes.to_vec())
}

// ============================================================================
// Registry index
// ============================================================================

/// Parses the semicolon-delimited registry export into an index keyed by
/// the numeric id. The first occurrence of an id wins so the later join
/// can never multiply rows.
pub(crate) fn build_registry_index(
    text: &str,
    config: &PipelineConfig,
) -> Result<HashMap<i64, RegistryEntity>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::RegistryUnavailable {
            reason: format!("registry header unreadable: {e}"),
        })?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let columns = map_registry_headers(&headers, &config.registry_columns);

    let Some(&id_idx) = columns.get(REG_ENTITY_ID) else {
        return Err(PipelineError::RegistryUnavailable {
            reason: "identifier column not found in registry export".to_string(),
        });
    };
    let field_at = |row: &csv::StringRecord, key: &str| -> String {
        columns
            .get(key)
            .and_then(|&idx| row.get(idx))
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    let mut index = HashMap::new();
    for row in reader.records() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                debug!(error = %e, "malformed registry row skipped");
                continue;
            }
        };
        let Some(entity_id) = row.get(id_idx).and_then(parse_entity_id) else {
            continue;
        };
        index.entry(entity_id).or_insert_with(|| RegistryEntity {
            entity_id,
            tax_id: field_at(&row, REG_TAX_ID),
            name: field_at(&row, REG_NAME),
            category: field_at(&row, REG_CATEGORY),
            region: field_at(&row, REG_REGION),
        });
    }

    if index.is_empty() {
        return Err(PipelineError::RegistryUnavailable {
            reason: "registry export has no usable rows".to_string(),
        });
    }
    Ok(index)
}

/// Registry headers arrive quoted, spaced, and accented in varying
/// case; lookups normalize both sides to upper snake form.
fn map_registry_headers(
    headers: &[String],
    table: &[(String, String)],
) -> HashMap<String, usize> {
    let mut mapped = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let key = normalize_registry_header(header);
        if let Some((_, canonical)) = table
            .iter()
            .find(|(source, _)| source.to_uppercase() == key)
        {
            mapped.entry(canonical.clone()).or_insert(idx);
        }
    }
    mapped
}

fn normalize_registry_header(header: &str) -> String {
    header
        .trim()
        .replace('"', "")
        .replace(' ', "_")
        .to_uppercase()
}

// ============================================================================
// Join
// ============================================================================

/// Left-joins consolidated rows against the registry index. Returns the
/// enriched rows (always exactly one per input row) and how many
/// matched.
pub(crate) fn enrich_rows(
    rows: Vec<ConsolidatedRecord>,
    index: &HashMap<i64, RegistryEntity>,
) -> (Vec<EnrichedRecord>, usize) {
    let mut matched = 0;
    let enriched = rows
        .into_iter()
        .map(|row| {
            let entity = parse_entity_id(&row.entity_id).and_then(|id| index.get(&id));
            match entity {
                Some(registry) => {
                    matched += 1;
                    EnrichedRecord {
                        entity_tax_id: pick(&registry.tax_id, &row.entity_tax_id),
                        entity_name: pick(&registry.name, &row.entity_name),
                        category: or_unknown(&registry.category),
                        region: or_unknown(&registry.region),
                        entity_id: row.entity_id,
                        period: row.period,
                        year: row.year,
                        amount: row.amount,
                        description: row.description,
                        account: row.account,
                        match_status: MATCH_FOUND.to_string(),
                    }
                }
                None => EnrichedRecord {
                    entity_tax_id: row.entity_tax_id,
                    entity_name: row.entity_name,
                    category: UNKNOWN.to_string(),
                    region: UNKNOWN.to_string(),
                    entity_id: row.entity_id,
                    period: row.period,
                    year: row.year,
                    amount: row.amount,
                    description: row.description,
                    account: row.account,
                    match_status: MATCH_NOT_FOUND.to_string(),
                },
            }
        })
        .collect();
    (enriched, matched)
}

/// Registry values only ever overwrite with substance; an empty registry
/// cell keeps the row's existing value.
fn pick(registry_value: &str, original: &str) -> String {
    if registry_value.trim().is_empty() {
        original.to_string()
    } else {
        registry_value.to_string()
    }
}

fn or_unknown(value: &str) -> String {
    if value.trim().is_empty() {
        UNKNOWN.to_string()
    } else {
        value.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
