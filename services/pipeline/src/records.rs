//! Record types shared across the pipeline stages.
//!
//! Each stage hands the next one a CSV file; the structs here define
//! those contracts. Field order is column order, and serde's PascalCase
//! renaming produces the exact on-disk headers.

use serde::{Deserialize, Serialize};

// ============================================================================
// Canonical column names
// ============================================================================

pub const COL_ENTITY_ID: &str = "EntityId";
pub const COL_ACCOUNT: &str = "Account";
pub const COL_DESCRIPTION: &str = "Description";
pub const COL_AMOUNT: &str = "Amount";
pub const COL_PERIOD: &str = "Period";

/// Join outcome markers carried on every enriched row.
pub const MATCH_FOUND: &str = "FOUND";
pub const MATCH_NOT_FOUND: &str = "NOT_FOUND";

/// Placeholder for registry attributes of unmatched entities.
pub const UNKNOWN: &str = "UNKNOWN";

// ============================================================================
// Stage records
// ============================================================================

/// One normalized row from a single archive entry, as staged by the
/// extraction stage. Identifier and period stay textual until the later
/// stages coerce them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NormalizedRecord {
    pub entity_id: String,
    pub account: String,
    pub description: String,
    pub amount: f64,
    pub period: String,
}

impl NormalizedRecord {
    /// Deduplication key. Exact duplicates only: every field must match,
    /// the amount bit-for-bit.
    pub fn dedup_key(&self) -> (String, String, String, u64, String) {
        (
            self.entity_id.clone(),
            self.account.clone(),
            self.description.clone(),
            self.amount.to_bits(),
            self.period.clone(),
        )
    }
}

/// One row of the consolidated table. Identity columns are materialized
/// empty here and filled by enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsolidatedRecord {
    pub entity_id: String,
    pub entity_tax_id: String,
    pub entity_name: String,
    pub period: String,
    pub year: Option<i32>,
    pub amount: f64,
    pub description: String,
    pub account: String,
}

/// One row of the enriched table: the consolidated row plus registry
/// attributes and the join outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrichedRecord {
    pub entity_id: String,
    pub entity_tax_id: String,
    pub entity_name: String,
    pub category: String,
    pub region: String,
    pub period: String,
    pub year: Option<i32>,
    pub amount: f64,
    pub description: String,
    pub account: String,
    pub match_status: String,
}

/// One registry entity, keyed by the numeric regulatory id.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntity {
    pub entity_id: i64,
    pub tax_id: String,
    pub name: String,
    pub category: String,
    pub region: String,
}

/// One aggregated group: totals per (entity name, region).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AggregateRecord {
    pub entity_name: String,
    pub region: String,
    pub total: f64,
    pub mean: f64,
    pub std_dev: Option<f64>,
}

// ============================================================================
// Shared coercions
// ============================================================================

/// Coerces a textual entity id to a number. Accepts plain integers and
/// float artifacts of earlier spreadsheet round-trips ("12345.0");
/// anything else is unusable as a join key.
pub fn parse_entity_id(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(id) = trimmed.parse::<i64>() {
        return Some(id);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value.abs() < 9.0e18 => Some(value as i64),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_id_forms() {
        assert_eq!(parse_entity_id("123456"), Some(123456));
        assert_eq!(parse_entity_id(" 123456 "), Some(123456));
        assert_eq!(parse_entity_id("123456.0"), Some(123456));
        assert_eq!(parse_entity_id("0"), Some(0));
        assert_eq!(parse_entity_id(""), None);
        assert_eq!(parse_entity_id("ABC123"), None);
        assert_eq!(parse_entity_id("12.5"), None);
    }

    #[test]
    fn test_normalized_record_headers() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(NormalizedRecord {
                entity_id: "1".into(),
                account: "411".into(),
                description: "EVENTOS".into(),
                amount: 10.0,
                period: "2024-03-31".into(),
            })
            .unwrap();
        let out = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(out.starts_with("EntityId,Account,Description,Amount,Period\n"));
    }

    #[test]
    fn test_enriched_record_headers() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(EnrichedRecord {
                entity_id: "1".into(),
                entity_tax_id: "".into(),
                entity_name: "".into(),
                category: UNKNOWN.into(),
                region: UNKNOWN.into(),
                period: "".into(),
                year: None,
                amount: 1.0,
                description: "d".into(),
                account: "a".into(),
                match_status: MATCH_NOT_FOUND.into(),
            })
            .unwrap();
        let out = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(out.starts_with(
            "EntityId,EntityTaxId,EntityName,Category,Region,Period,Year,Amount,Description,Account,MatchStatus\n"
        ));
    }

    #[test]
    fn test_dedup_key_distinguishes_amounts() {
        let base = NormalizedRecord {
            entity_id: "1".into(),
            account: "411".into(),
            description: "EVENTOS".into(),
            amount: 10.0,
            period: "2024-03-31".into(),
        };
        let mut other = base.clone();
        other.amount = 10.01;
        assert_ne!(base.dedup_key(), other.dedup_key());
        assert_eq!(base.dedup_key(), base.clone().dedup_key());
    }
}
