//! Transfer accounting for backup and restore operations.
//!
//! Worker tasks update shared atomic counters; coordinators take a
//! [`TransferSnapshot`] for logging and reports.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by concurrent transfer tasks
#[derive(Debug)]
pub struct TransferStats {
    started: Instant,
    files: AtomicUsize,
    bytes: AtomicU64,
    uploaded_chunks: AtomicUsize,
    uploaded_bytes: AtomicU64,
    reused_chunks: AtomicUsize,
    downloaded_bytes: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub files: usize,
    /// Logical size of all processed files
    pub bytes: u64,
    pub uploaded_chunks: usize,
    /// Encoded bytes written to storage
    pub uploaded_bytes: u64,
    pub reused_chunks: usize,
    pub downloaded_bytes: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            files: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            uploaded_chunks: AtomicUsize::new(0),
            uploaded_bytes: AtomicU64::new(0),
            reused_chunks: AtomicUsize::new(0),
            downloaded_bytes: AtomicU64::new(0),
        }
    }

    /// A file whose chunk had to be uploaded
    pub fn record_upload(&self, file_size: u64, stored_size: u64) {
        self.record_file(file_size);
        self.uploaded_chunks.fetch_add(1, Ordering::Relaxed);
        self.uploaded_bytes.fetch_add(stored_size, Ordering::Relaxed);
    }

    /// A file whose chunk was already stored
    pub fn record_reuse(&self, file_size: u64) {
        self.record_file(file_size);
        self.reused_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, file_size: u64) {
        self.record_file(file_size);
        self.downloaded_bytes.fetch_add(file_size, Ordering::Relaxed);
    }

    fn record_file(&self, size: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            files: self.files.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            uploaded_chunks: self.uploaded_chunks.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            reused_chunks: self.reused_chunks.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSnapshot {
    /// Average throughput of the moved bytes since the operation started
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            ((self.uploaded_bytes + self.downloaded_bytes) as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
