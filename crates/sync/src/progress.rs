use crate::error::Error;
use std::ops::AddAssign;
use std::time::Duration;

/// Totals for one hashing or transfer run.
///
/// "Processed" is work actually done (bytes hashed, uploaded, downloaded);
/// "skipped" is work avoided (cache hits, blobs already stored, files left in
/// place on download).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SummaryStatistics {
    pub total_time: Duration,
    pub total_files: u64,
    pub total_bytes: u64,
    pub processed_files: u64,
    pub processed_bytes: u64,
    pub skipped_files: u64,
    pub skipped_bytes: u64,
}

impl SummaryStatistics {
    pub(crate) fn processed(&mut self, bytes: u64) {
        self.total_files += 1;
        self.total_bytes += bytes;
        self.processed_files += 1;
        self.processed_bytes += bytes;
    }

    pub(crate) fn skipped(&mut self, bytes: u64) {
        self.total_files += 1;
        self.total_bytes += bytes;
        self.skipped_files += 1;
        self.skipped_bytes += bytes;
    }

    /// Counts toward the totals without being processed or skipped.
    pub(crate) fn failed(&mut self, bytes: u64) {
        self.total_files += 1;
        self.total_bytes += bytes;
    }

    /// Processed bytes per second, zero when no time was recorded.
    pub fn transfer_rate(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs > 0.0 { self.processed_bytes as f64 / secs } else { 0.0 }
    }

    /// Combine the statistics of two runs.
    pub fn aggregate(mut self, other: &Self) -> Self {
        self += *other;
        self
    }
}

impl AddAssign for SummaryStatistics {
    fn add_assign(&mut self, other: Self) {
        self.total_time += other.total_time;
        self.total_files += other.total_files;
        self.total_bytes += other.total_bytes;
        self.processed_files += other.processed_files;
        self.processed_bytes += other.processed_bytes;
        self.skipped_files += other.skipped_files;
        self.skipped_bytes += other.skipped_bytes;
    }
}

/// One file (or blob) a transfer gave up on.
#[derive(Debug)]
pub struct TransferFailure {
    /// Root-relative manifest path. For a blob shared by several entries,
    /// the first of them.
    pub path: String,
    /// Object key the transfer was addressing.
    pub key: String,
    pub error: Error,
}
