//! Machine-readable run reports.

use std::path::Path;

use cmtrace_core::{EncodeStats, ReplayStats};
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::HarnessError;

/// Result of one encode run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeReport {
    pub input: String,
    pub input_sha256: Option<String>,
    pub output: String,
    pub output_sha256: Option<String>,
    /// `binary` or `summary`.
    pub format: String,
    pub lines: u64,
    pub allocations: u64,
    pub resizes: u64,
    pub releases: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub bytes_written: u64,
    pub peak_live: u64,
    /// Allocations never released by the end of the trace.
    pub live_at_end: u64,
    pub highest_tag: u32,
    pub duration_ms: u64,
}

impl EncodeReport {
    #[must_use]
    pub fn from_stats(stats: &EncodeStats, live_at_end: u64, highest_tag: u32) -> Self {
        Self {
            input: String::new(),
            input_sha256: None,
            output: String::new(),
            output_sha256: None,
            format: String::new(),
            lines: stats.lines,
            allocations: stats.allocations,
            resizes: stats.resizes,
            releases: stats.releases,
            skipped: stats.skipped,
            ignored: stats.ignored,
            bytes_written: stats.bytes_written,
            peak_live: stats.peak_live,
            live_at_end,
            highest_tag,
            duration_ms: 0,
        }
    }

    /// Average encoded bytes per allocator call.
    #[must_use]
    pub fn bytes_per_event(&self) -> f64 {
        let events = self.allocations + self.resizes + self.releases;
        if events == 0 {
            0.0
        } else {
            self.bytes_written as f64 / events as f64
        }
    }
}

/// Result of one replay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub input: String,
    pub input_sha256: Option<String>,
    pub allocator: String,
    pub records: u64,
    pub allocations: u64,
    pub resizes: u64,
    pub releases: u64,
    pub bytes_read: u64,
    pub bytes_requested: u64,
    pub peak_live: u64,
    pub live_at_end: u64,
    /// Address space the allocator consumed, where it can tell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footprint_bytes: Option<u64>,
    pub duration_ms: u64,
}

impl ReplayReport {
    #[must_use]
    pub fn from_stats(allocator: &str, stats: &ReplayStats) -> Self {
        Self {
            input: String::new(),
            input_sha256: None,
            allocator: allocator.to_string(),
            records: stats.records,
            allocations: stats.allocations,
            resizes: stats.resizes,
            releases: stats.releases,
            bytes_read: stats.bytes_read,
            bytes_requested: stats.bytes_requested,
            peak_live: stats.peak_live,
            live_at_end: stats.live_at_end,
            footprint_bytes: None,
            duration_ms: 0,
        }
    }
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// SHA-256 of a file's contents, lowercase hex.
pub fn sha256_hex(path: &Path) -> Result<String, HarnessError> {
    let data = std::fs::read(path).map_err(HarnessError::open(path))?;
    Ok(hex_lower(&sha2::Sha256::digest(&data)))
}

/// Write `report` as pretty JSON, creating parent directories.
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<(), HarnessError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json + "\n").map_err(HarnessError::open(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex_lower(&[0x00, 0x0f, 0xab]), "000fab");
    }

    #[test]
    fn bytes_per_event_handles_empty_runs() {
        let report = EncodeReport::from_stats(&EncodeStats::default(), 0, 0);
        assert_eq!(report.bytes_per_event(), 0.0);

        let stats = EncodeStats {
            allocations: 2,
            releases: 2,
            bytes_written: 10,
            ..EncodeStats::default()
        };
        let report = EncodeReport::from_stats(&stats, 0, 2);
        assert_eq!(report.bytes_per_event(), 2.5);
    }

    #[test]
    fn replay_report_omits_unknown_footprint() {
        let report = ReplayReport::from_stats("null", &ReplayStats::default());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["allocator"], "null");
        assert!(json.get("footprint_bytes").is_none());
    }
}
