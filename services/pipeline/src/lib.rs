//! Quarterly disclosure ETL for the health-insurance open-data portal.
//!
//! The pipeline runs as ordered stages over a local data tree:
//! - fetch: download quarterly disclosure archives (raw/)
//! - extract: normalize every tabular archive entry (staging/)
//! - consolidate: merge staged tables into one expense table (output/)
//! - enrich: join the operator registry onto the consolidated table
//! - aggregate: per-entity, per-region statistics plus a zip bundle
//! - load: replace the relational store with the current outputs
//!
//! A standalone validation pass tags consolidated rows with
//! data-quality codes without dropping anything.

pub mod aggregate;
pub mod config;
pub mod consolidate;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod load;
pub mod records;
pub mod validate;
