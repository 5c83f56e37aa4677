//! Archive fetch stage.
//!
//! Walks backward from the most recent closed quarter, downloading each
//! quarter's disclosure archive until enough files are on disk or the
//! attempt budget runs out. Quarters that were never published and
//! transient network failures are both skipped, never fatal; archives
//! already on disk are counted without touching the network.

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

// ============================================================================
// Quarters
// ============================================================================

/// A calendar quarter, e.g. 2025/Q3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quarter {
    pub year: i32,
    pub quarter: u32,
}

impl Quarter {
    /// The most recent quarter that has fully elapsed as of `today`.
    /// During Q1 that is the previous year's Q4.
    pub fn latest_closed(today: NaiveDate) -> Self {
        let elapsed = (today.month() - 1) / 3;
        if elapsed == 0 {
            Self {
                year: today.year() - 1,
                quarter: 4,
            }
        } else {
            Self {
                year: today.year(),
                quarter: elapsed,
            }
        }
    }

    /// The quarter immediately before this one, wrapping across years.
    pub fn previous(self) -> Self {
        if self.quarter == 1 {
            Self {
                year: self.year - 1,
                quarter: 4,
            }
        } else {
            Self {
                year: self.year,
                quarter: self.quarter - 1,
            }
        }
    }

    /// Upstream file name, e.g. "3T2025.zip".
    pub fn archive_name(&self) -> String {
        format!("{}T{}.zip", self.quarter, self.year)
    }

    /// Upstream URL under the archive base, e.g. "{base}/2025/3T2025.zip".
    pub fn archive_url(&self, base_url: &str) -> String {
        format!("{}/{}/{}", base_url, self.year, self.archive_name())
    }

    /// Local directory for this quarter: raw/{year}/Q{n}. The extraction
    /// stage later reads the period back out of these two path segments.
    pub fn local_dir(&self, raw_dir: &Path) -> PathBuf {
        raw_dir
            .join(self.year.to_string())
            .join(format!("Q{}", self.quarter))
    }

    pub fn label(&self) -> String {
        format!("{}/Q{}", self.year, self.quarter)
    }
}

// ============================================================================
// Fetch stage
// ============================================================================

#[derive(Debug, Default)]
pub struct FetchSummary {
    /// Archives on disk at the end of the run, newest quarter first.
    pub obtained: Vec<PathBuf>,
    pub downloaded: usize,
    pub already_present: usize,
    pub attempts: usize,
}

/// Scans backward from `start` until `config.fetch_quarters` archives are
/// on disk or `config.fetch_max_attempts` quarters have been probed.
pub async fn fetch_archives(
    client: &Client,
    config: &PipelineConfig,
    start: Quarter,
) -> Result<FetchSummary> {
    let raw_dir = config.raw_dir();
    let mut summary = FetchSummary::default();
    let mut quarter = start;

    while summary.obtained.len() < config.fetch_quarters
        && summary.attempts < config.fetch_max_attempts
    {
        summary.attempts += 1;
        let target = quarter.local_dir(&raw_dir).join(quarter.archive_name());

        if target.exists() {
            println!("  ✓ {} already on disk, skipping download", quarter.label());
            summary.already_present += 1;
            summary.obtained.push(target);
            quarter = quarter.previous();
            continue;
        }

        let url = quarter.archive_url(&config.archive_base_url);
        match download_archive(client, &url).await {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                let fingerprint = format!("{:x}", hasher.finalize());

                std::fs::create_dir_all(quarter.local_dir(&raw_dir))?;
                std::fs::write(&target, &bytes)?;

                println!(
                    "  ✓ {} -> {} ({} bytes, sha256 {})",
                    quarter.label(),
                    target.display(),
                    bytes.len(),
                    &fingerprint[..12]
                );
                summary.downloaded += 1;
                summary.obtained.push(target);
            }
            Err(e) if e.is_recoverable() => {
                println!("  ✗ {} not available, trying previous quarter", quarter.label());
                debug!(quarter = %quarter.label(), error = %e, "quarter skipped");
            }
            Err(e) => return Err(e),
        }

        quarter = quarter.previous();
    }

    if summary.obtained.len() < config.fetch_quarters {
        warn!(
            obtained = summary.obtained.len(),
            wanted = config.fetch_quarters,
            attempts = summary.attempts,
            "fetch ended short of the requested quarter count"
        );
    }

    Ok(summary)
}

/// Downloads one quarter's archive. Non-200 means the quarter was never
/// published; transport errors are reported separately but handled the
/// same way by the scan.
async fn download_archive(client: &Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| PipelineError::FetchNetworkError {
            url: url.to_string(),
            source,
        })?;

    if response.status() != StatusCode::OK {
        return Err(PipelineError::FetchUnavailable {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|source| PipelineError::FetchNetworkError {
            url: url.to_string(),
            source,
        })?;

    Ok(bytes.to_vec())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // ------------------------------------------------------------------
    // Quarter arithmetic
    // ------------------------------------------------------------------

    #[test]
    fn test_latest_closed_mid_year() {
        assert_eq!(
            Quarter::latest_closed(date(2025, 8, 24)),
            Quarter { year: 2025, quarter: 2 }
        );
        assert_eq!(
            Quarter::latest_closed(date(2025, 4, 1)),
            Quarter { year: 2025, quarter: 1 }
        );
        assert_eq!(
            Quarter::latest_closed(date(2025, 12, 31)),
            Quarter { year: 2025, quarter: 3 }
        );
    }

    #[test]
    fn test_latest_closed_wraps_to_previous_year() {
        // January through March: the last closed quarter is Q4 of the
        // previous year.
        for month in 1..=3 {
            assert_eq!(
                Quarter::latest_closed(date(2025, month, 15)),
                Quarter { year: 2024, quarter: 4 }
            );
        }
    }

    #[test]
    fn test_previous_wraps_across_years() {
        let q1 = Quarter { year: 2025, quarter: 1 };
        assert_eq!(q1.previous(), Quarter { year: 2024, quarter: 4 });
        let q3 = Quarter { year: 2025, quarter: 3 };
        assert_eq!(q3.previous(), Quarter { year: 2025, quarter: 2 });
    }

    #[test]
    fn test_archive_naming() {
        let q = Quarter { year: 2025, quarter: 3 };
        assert_eq!(q.archive_name(), "3T2025.zip");
        assert_eq!(
            q.archive_url("https://example.org/ftp"),
            "https://example.org/ftp/2025/3T2025.zip"
        );
        assert_eq!(
            q.local_dir(Path::new("data/raw")),
            PathBuf::from("data/raw/2025/Q3")
        );
    }

    // ------------------------------------------------------------------
    // Backward scan
    // ------------------------------------------------------------------

    fn offline_client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(2))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_scan_skips_unavailable_quarters() {
        // The two newest quarters are unreachable (nothing listens on the
        // base URL); the third is already on disk. Requesting one file
        // must land on the third without aborting.
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.archive_base_url = "http://127.0.0.1:9/ftp".to_string();
        config.fetch_quarters = 1;
        config.fetch_max_attempts = 12;

        let start = Quarter { year: 2025, quarter: 3 };
        let third = start.previous().previous();
        let third_dir = third.local_dir(&config.raw_dir());
        std::fs::create_dir_all(&third_dir).unwrap();
        let third_path = third_dir.join(third.archive_name());
        std::fs::write(&third_path, b"zipbytes").unwrap();

        let summary = fetch_archives(&offline_client(), &config, start)
            .await
            .unwrap();

        assert_eq!(summary.obtained, vec![third_path]);
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.already_present, 1);
        assert_eq!(summary.downloaded, 0);
    }

    #[tokio::test]
    async fn test_scan_counts_existing_archives_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.archive_base_url = "http://127.0.0.1:9/ftp".to_string();
        config.fetch_quarters = 2;
        config.fetch_max_attempts = 2;

        let start = Quarter { year: 2024, quarter: 2 };
        for q in [start, start.previous()] {
            let d = q.local_dir(&config.raw_dir());
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join(q.archive_name()), b"x").unwrap();
        }

        let summary = fetch_archives(&offline_client(), &config, start)
            .await
            .unwrap();

        assert_eq!(summary.obtained.len(), 2);
        assert_eq!(summary.already_present, 2);
        assert_eq!(summary.downloaded, 0);
    }

    #[tokio::test]
    async fn test_scan_respects_attempt_budget() {
        // Nothing on disk, nothing reachable: the scan stops at the
        // attempt cap with an empty result rather than looping.
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.archive_base_url = "http://127.0.0.1:9/ftp".to_string();
        config.fetch_quarters = 3;
        config.fetch_max_attempts = 4;

        let start = Quarter { year: 2025, quarter: 1 };
        let summary = fetch_archives(&offline_client(), &config, start)
            .await
            .unwrap();

        assert!(summary.obtained.is_empty());
        assert_eq!(summary.attempts, 4);
    }
}
