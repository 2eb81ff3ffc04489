// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon-wide upload counters, reported by the daily keep-alive alert.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

#[derive(Debug)]
struct StatsInner {
    since: DateTime<Utc>,
    file_count: u64,
    size_count: u64,
}

/// Counters of files and bytes sent since the last report.
#[derive(Debug)]
pub struct Stats {
    inner: Mutex<StatsInner>,
}

impl Stats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                since: Utc::now(),
                file_count: 0,
                size_count: 0,
            }),
        }
    }

    /// Adds one upload of `size` bytes.
    pub fn inc(&self, files: u64, size: u64) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.file_count += files;
        inner.size_count += size;
    }

    /// Current `(files, bytes)` counts.
    pub fn current(&self) -> (u64, u64) {
        let inner = self.inner.lock().expect("stats lock poisoned");
        (inner.file_count, inner.size_count)
    }

    /// Formats a report and resets the counters.
    pub fn report(&self, intro: &str) -> String {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        let report = format!(
            "{intro}: {} file(s) sent for a total of {} since {}",
            inner.file_count,
            format_bytes(inner.size_count),
            inner.since.to_rfc3339(),
        );
        inner.since = Utc::now();
        inner.file_count = 0;
        inner.size_count = 0;
        report
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use barry_test_utils::param_test;

    use super::*;

    #[test]
    fn report_resets_counters() {
        let stats = Stats::new();
        stats.inc(1, 2048);
        stats.inc(1, 1024);

        let report = stats.report("daily");
        assert!(report.contains("2 file(s)"), "unexpected report: {report}");
        assert!(report.contains("3.0 KB"), "unexpected report: {report}");
        assert_eq!(stats.current(), (0, 0));
    }

    param_test! {
        formats_bytes: [
            bytes: (512, "512 B"),
            kilobytes: (10 * 1024, "10.0 KB"),
            megabytes: (5 * 1024 * 1024 + 512 * 1024, "5.5 MB"),
            terabytes: (3 * 1024u64.pow(4), "3.0 TB"),
        ]
    }
    fn formats_bytes(bytes: u64, expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }
}
