//! Relational load stage.
//!
//! Replaces the warehouse content with the current run's tables: the
//! entity dimension (one row per registry-backed entity), the fact table
//! (every enriched row whose entity made it into the dimension), and the
//! aggregate table when one is on disk. The store is truncated first, so
//! after a successful load it reflects exactly one pipeline run.

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::consolidate::parse_period_date;
use crate::error::{PipelineError, Result};
use crate::records::{parse_entity_id, AggregateRecord, EnrichedRecord};

// ============================================================================
// Rows bound for the store
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub id: i64,
    pub tax_id: String,
    pub name: String,
    pub category: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub entity_id: i64,
    pub period: Option<chrono::NaiveDate>,
    pub year: Option<i32>,
    pub account: String,
    pub description: String,
    pub amount: f64,
}

#[derive(Debug, Default)]
pub struct LoadSummary {
    pub entities: usize,
    pub facts: usize,
    pub facts_dropped: usize,
    pub aggregates: usize,
}

// ============================================================================
// Load stage
// ============================================================================

/// Loads the enriched table (and the aggregate table, if present) into
/// the relational store, replacing whatever a previous run left there.
pub async fn load_store(pool: &PgPool, config: &PipelineConfig) -> Result<LoadSummary> {
    let input = config.enriched_path();
    if !input.exists() {
        return Err(PipelineError::MissingUpstreamFile { path: input });
    }

    let mut reader = csv::Reader::from_path(&input)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<EnrichedRecord>() {
        rows.push(row?);
    }

    ensure_schema(pool).await?;
    purge_tables(pool).await?;

    let (entities, loaded_ids) = build_entities(&rows);
    for entity in &entities {
        sqlx::query(
            "INSERT INTO entities (id, tax_id, name, category, region) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entity.id)
        .bind(&entity.tax_id)
        .bind(&entity.name)
        .bind(&entity.category)
        .bind(&entity.region)
        .execute(pool)
        .await?;
    }
    println!("  ✓ entities loaded: {}", entities.len());

    let (facts, dropped) = build_facts(&rows, &loaded_ids);
    for fact in &facts {
        sqlx::query(
            "INSERT INTO fact_records (entity_id, period, year, account, description, amount) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(fact.entity_id)
        .bind(fact.period)
        .bind(fact.year)
        .bind(&fact.account)
        .bind(&fact.description)
        .bind(fact.amount)
        .execute(pool)
        .await?;
    }
    println!("  ✓ fact records loaded: {} ({} dropped)", facts.len(), dropped);

    let mut aggregates = 0;
    let aggregates_path = config.aggregates_path();
    if aggregates_path.exists() {
        let mut reader = csv::Reader::from_path(&aggregates_path)?;
        for row in reader.deserialize::<AggregateRecord>() {
            let record = row?;
            sqlx::query(
                "INSERT INTO aggregates (name, region, total, mean, stddev) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(clamp(&record.entity_name, 255))
            .bind(clamp(&record.region, 50))
            .bind(record.total)
            .bind(record.mean)
            .bind(record.std_dev)
            .execute(pool)
            .await?;
            aggregates += 1;
        }
        println!("  ✓ aggregates loaded: {}", aggregates);
    } else {
        debug!("no aggregate table on disk, skipping");
    }

    Ok(LoadSummary {
        entities: entities.len(),
        facts: facts.len(),
        facts_dropped: dropped,
        aggregates,
    })
}

/// Creates the warehouse tables when absent. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id BIGINT PRIMARY KEY,
            tax_id VARCHAR(20),
            name VARCHAR(255),
            category VARCHAR(100),
            region VARCHAR(50)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fact_records (
            id BIGSERIAL PRIMARY KEY,
            entity_id BIGINT NOT NULL REFERENCES entities(id),
            period DATE,
            year INT,
            account VARCHAR(50),
            description VARCHAR(255),
            amount DECIMAL(15, 2)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregates (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255),
            region VARCHAR(50),
            total DECIMAL(15, 2),
            mean DECIMAL(15, 2),
            stddev DECIMAL(15, 2)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Empties all three tables in one statement; CASCADE covers the
/// fact-to-entity reference and serial ids start over.
async fn purge_tables(pool: &PgPool) -> Result<()> {
    sqlx::query("TRUNCATE TABLE fact_records, aggregates, entities RESTART IDENTITY CASCADE")
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Row preparation
// ============================================================================

/// Builds the entity dimension from enriched rows. The first occurrence
/// of each positive numeric id decides the entity's attributes; ids
/// whose first occurrence has no usable tax id are left out entirely.
pub(crate) fn build_entities(rows: &[EnrichedRecord]) -> (Vec<EntityRow>, HashSet<i64>) {
    let mut seen = HashSet::new();
    let mut loaded = HashSet::new();
    let mut entities = Vec::new();

    for row in rows {
        let Some(id) = parse_entity_id(&row.entity_id) else {
            continue;
        };
        if id <= 0 || !seen.insert(id) {
            continue;
        }
        let Some(tax_id) = clean_tax_id(&row.entity_tax_id) else {
            continue;
        };
        entities.push(EntityRow {
            id,
            tax_id: clamp(&tax_id, 20),
            name: clamp(&row.entity_name, 255),
            category: clamp(&row.category, 100),
            region: clamp(&row.region, 50),
        });
        loaded.insert(id);
    }

    (entities, loaded)
}

/// Builds fact rows, keeping only rows whose entity exists in the
/// dimension. That filter is what upholds the store's referential
/// integrity.
pub(crate) fn build_facts(
    rows: &[EnrichedRecord],
    loaded_ids: &HashSet<i64>,
) -> (Vec<FactRow>, usize) {
    let mut facts = Vec::new();
    let mut dropped = 0;

    for row in rows {
        let entity_id = match parse_entity_id(&row.entity_id) {
            Some(id) if loaded_ids.contains(&id) => id,
            _ => {
                dropped += 1;
                continue;
            }
        };
        facts.push(FactRow {
            entity_id,
            period: parse_period_date(&row.period),
            year: row.year,
            account: clamp(&row.account, 50),
            description: clamp(&row.description, 255),
            amount: row.amount,
        });
    }

    (facts, dropped)
}

/// Normalizes a tax identifier to its digit string. All-digit values
/// pass through untouched so leading zeros survive; spreadsheet float
/// artifacts collapse to their integer digits; anything else is
/// unusable.
pub(crate) fn clean_tax_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(trimmed.to_string());
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value >= 0.0 && value < 9.0e18 => {
            Some(format!("{}", value as i64))
        }
        _ => None,
    }
}

/// Byte-length cap that never splits a character, matching the column
/// widths in the store.
fn clamp(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn enriched(entity_id: &str, tax_id: &str, name: &str) -> EnrichedRecord {
        EnrichedRecord {
            entity_id: entity_id.to_string(),
            entity_tax_id: tax_id.to_string(),
            entity_name: name.to_string(),
            category: "MEDICINA DE GRUPO".to_string(),
            region: "SP".to_string(),
            period: "2024-03-31".to_string(),
            year: Some(2024),
            amount: 10.0,
            description: "EVENTOS".to_string(),
            account: "411".to_string(),
            match_status: "FOUND".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Tax id normalization
    // ------------------------------------------------------------------

    #[test]
    fn test_clean_tax_id_preserves_leading_zeros() {
        assert_eq!(
            clean_tax_id("02685110000123"),
            Some("02685110000123".to_string())
        );
    }

    #[test]
    fn test_clean_tax_id_collapses_float_artifacts() {
        assert_eq!(
            clean_tax_id("11222333000181.0"),
            Some("11222333000181".to_string())
        );
        assert_eq!(clean_tax_id("12345.0"), Some("12345".to_string()));
        assert_eq!(clean_tax_id(" 9999.0 "), Some("9999".to_string()));
    }

    #[test]
    fn test_clean_tax_id_rejects_garbage() {
        assert_eq!(clean_tax_id(""), None);
        assert_eq!(clean_tax_id("   "), None);
        assert_eq!(clean_tax_id("12.34"), None);
        assert_eq!(clean_tax_id("N/A"), None);
    }

    // ------------------------------------------------------------------
    // Dimension building
    // ------------------------------------------------------------------

    #[test]
    fn test_build_entities_first_occurrence_wins() {
        let rows = vec![
            enriched("123456", "11222333000181", "PRIMEIRA"),
            enriched("123456", "99999999999999", "SEGUNDA"),
        ];
        let (entities, ids) = build_entities(&rows);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "PRIMEIRA");
        assert!(ids.contains(&123456));
    }

    #[test]
    fn test_build_entities_drops_unusable_rows() {
        let rows = vec![
            enriched("", "111", "SEM ID"),
            enriched("-5", "111", "ID NEGATIVO"),
            enriched("7", "", "SEM CNPJ"),
            enriched("8", "222", "VALIDA"),
        ];
        let (entities, ids) = build_entities(&rows);
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id, 8);
        assert!(!ids.contains(&7));
    }

    #[test]
    fn test_build_entities_bad_first_tax_id_consumes_the_id() {
        // The first occurrence decides; a later row with a good tax id
        // does not resurrect the entity.
        let rows = vec![
            enriched("9", "", "SEM CNPJ"),
            enriched("9", "333", "COM CNPJ"),
        ];
        let (entities, _) = build_entities(&rows);
        assert!(entities.is_empty());
    }

    // ------------------------------------------------------------------
    // Fact building
    // ------------------------------------------------------------------

    #[test]
    fn test_build_facts_filters_to_dimension() {
        let rows = vec![
            enriched("1", "111", "DENTRO"),
            enriched("2", "222", "FORA"),
        ];
        let mut loaded = HashSet::new();
        loaded.insert(1);

        let (facts, dropped) = build_facts(&rows, &loaded);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].entity_id, 1);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_build_facts_parses_period() {
        let mut row = enriched("1", "111", "ALFA");
        row.period = "2024-06-30".to_string();
        let mut loaded = HashSet::new();
        loaded.insert(1);

        let (facts, _) = build_facts(&[row], &loaded);
        assert_eq!(
            facts[0].period,
            chrono::NaiveDate::from_ymd_opt(2024, 6, 30)
        );

        let mut undateable = enriched("1", "111", "ALFA");
        undateable.period = String::new();
        let (facts, _) = build_facts(&[undateable], &loaded);
        assert_eq!(facts[0].period, None);
    }

    // ------------------------------------------------------------------
    // Column clamping
    // ------------------------------------------------------------------

    #[test]
    fn test_clamp_respects_char_boundaries() {
        assert_eq!(clamp("abc", 10), "abc");
        assert_eq!(clamp("abcdef", 3), "abc");
        // "ãã" is four bytes; a three-byte cap must not split the second
        // character.
        assert_eq!(clamp("ãã", 3), "ã");
    }
}
