//! Aggregation stage.
//!
//! Rolls the enriched table up to one row per (entity name, region)
//! group: total, mean, and sample standard deviation of the amounts,
//! ordered by total descending. The table is written as CSV and also
//! bundled into a zip for distribution.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::records::{AggregateRecord, EnrichedRecord};

// ============================================================================
// Aggregate stage
// ============================================================================

#[derive(Debug, Default)]
pub struct AggregateSummary {
    pub rows_read: usize,
    pub groups: usize,
}

/// Builds the aggregate table from the enriched CSV and writes both the
/// CSV and its zip bundle, replacing any previous bundle.
pub fn aggregate_enriched(config: &PipelineConfig) -> Result<AggregateSummary> {
    let input = config.enriched_path();
    if !input.exists() {
        return Err(PipelineError::MissingUpstreamFile { path: input });
    }

    let mut reader = csv::Reader::from_path(&input)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<EnrichedRecord>() {
        rows.push(row?);
    }

    let aggregates = aggregate_rows(&rows);

    let output = config.aggregates_path();
    std::fs::create_dir_all(config.output_dir())?;
    let mut writer = csv::Writer::from_path(&output)?;
    for record in &aggregates {
        writer.serialize(record)?;
    }
    writer.flush()?;

    let bundle = config.aggregates_bundle_path();
    bundle_file(&output, &bundle)?;
    debug!(bundle = %bundle.display(), "aggregate bundle written");

    Ok(AggregateSummary {
        rows_read: rows.len(),
        groups: aggregates.len(),
    })
}

/// Groups rows by (entity name, region) in first-appearance order, then
/// sorts the finished groups by total descending. The sort is stable so
/// equal totals keep their appearance order.
pub(crate) fn aggregate_rows(rows: &[EnrichedRecord]) -> Vec<AggregateRecord> {
    let mut order: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<((String, String), Vec<f64>)> = Vec::new();

    for row in rows {
        let key = (row.entity_name.clone(), row.region.clone());
        match order.get(&key) {
            Some(&idx) => groups[idx].1.push(row.amount),
            None => {
                order.insert(key.clone(), groups.len());
                groups.push((key, vec![row.amount]));
            }
        }
    }

    let mut aggregates: Vec<AggregateRecord> = groups
        .into_iter()
        .map(|((entity_name, region), amounts)| {
            let (total, mean, std_dev) = describe(&amounts);
            AggregateRecord {
                entity_name,
                region,
                total,
                mean,
                std_dev,
            }
        })
        .collect();

    aggregates.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    aggregates
}

/// Total, mean, and sample standard deviation. A single observation has
/// no spread, so its deviation is null rather than zero.
fn describe(amounts: &[f64]) -> (f64, f64, Option<f64>) {
    let count = amounts.len() as f64;
    let total: f64 = amounts.iter().sum();
    let mean = total / count;
    let std_dev = if amounts.len() < 2 {
        None
    } else {
        let variance = amounts
            .iter()
            .map(|amount| (amount - mean).powi(2))
            .sum::<f64>()
            / (count - 1.0);
        Some(variance.sqrt())
    };
    (total, mean, std_dev)
}

fn bundle_file(source: &Path, bundle: &Path) -> Result<()> {
    let entry_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("aggregates.csv");
    let file = File::create(bundle)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file(entry_name, options)?;
    writer.write_all(&std::fs::read(source)?)?;
    writer.finish()?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
