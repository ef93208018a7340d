//! Metric names and recording helpers

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!(
        "drivesplit_chunks_written_total",
        "Chunks written to linked accounts"
    );
    describe_counter!(
        "drivesplit_chunks_read_total",
        "Chunks read back from linked accounts"
    );
    describe_counter!(
        "drivesplit_bytes_written_total",
        "Bytes written to linked accounts"
    );
    describe_counter!(
        "drivesplit_bytes_read_total",
        "Bytes read from linked accounts"
    );
    describe_counter!(
        "drivesplit_checksum_failures_total",
        "Chunks whose checksum did not match the recorded value"
    );
    describe_counter!(
        "drivesplit_manifest_write_failures_total",
        "Manifest writes to a linked account that failed"
    );

    describe_counter!("drivesplit_uploads_started_total", "Upload sessions opened");
    describe_counter!(
        "drivesplit_uploads_completed_total",
        "Upload sessions that reached complete"
    );
    describe_counter!(
        "drivesplit_uploads_failed_total",
        "Upload sessions that ended failed"
    );
    describe_counter!(
        "drivesplit_downloads_started_total",
        "Reconstructions started"
    );
    describe_counter!(
        "drivesplit_downloads_completed_total",
        "Reconstructions that produced an artifact"
    );
    describe_counter!(
        "drivesplit_downloads_failed_total",
        "Reconstructions that ended failed"
    );

    describe_gauge!(
        "drivesplit_active_uploads",
        "Upload sessions currently processing"
    );
    describe_gauge!(
        "drivesplit_active_downloads",
        "Reconstructions currently running"
    );

    describe_histogram!(
        "drivesplit_chunk_write_duration_seconds",
        "Time to write one chunk, including retries"
    );
    describe_histogram!(
        "drivesplit_upload_processing_duration_seconds",
        "Time from finalize to complete"
    );
    describe_histogram!(
        "drivesplit_download_duration_seconds",
        "Time to reconstruct a file"
    );
}

pub fn record_chunk_written(account_id: &str, bytes: u64, duration: Duration) {
    counter!("drivesplit_chunks_written_total", "account" => account_id.to_string()).increment(1);
    counter!("drivesplit_bytes_written_total", "account" => account_id.to_string())
        .increment(bytes);
    histogram!("drivesplit_chunk_write_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_chunk_read(account_id: &str, bytes: u64) {
    counter!("drivesplit_chunks_read_total", "account" => account_id.to_string()).increment(1);
    counter!("drivesplit_bytes_read_total", "account" => account_id.to_string())
        .increment(bytes);
}

pub fn record_checksum_failure() {
    counter!("drivesplit_checksum_failures_total").increment(1);
}

pub fn record_manifest_write_failure(account_id: &str) {
    counter!("drivesplit_manifest_write_failures_total", "account" => account_id.to_string())
        .increment(1);
}

pub fn record_upload_started() {
    counter!("drivesplit_uploads_started_total").increment(1);
}

pub fn record_download_started() {
    counter!("drivesplit_downloads_started_total").increment(1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Upload,
    Download,
}

/// Tracks one background job (upload processing or reconstruction) from start
/// to its terminal state
pub struct SessionTimer {
    kind: SessionKind,
    start_time: Instant,
}

impl SessionTimer {
    pub fn upload() -> Self {
        gauge!("drivesplit_active_uploads").increment(1.0);
        Self {
            kind: SessionKind::Upload,
            start_time: Instant::now(),
        }
    }

    pub fn download() -> Self {
        gauge!("drivesplit_active_downloads").increment(1.0);
        Self {
            kind: SessionKind::Download,
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn complete(self) {
        let secs = self.start_time.elapsed().as_secs_f64();
        match self.kind {
            SessionKind::Upload => {
                counter!("drivesplit_uploads_completed_total").increment(1);
                gauge!("drivesplit_active_uploads").decrement(1.0);
                histogram!("drivesplit_upload_processing_duration_seconds").record(secs);
            }
            SessionKind::Download => {
                counter!("drivesplit_downloads_completed_total").increment(1);
                gauge!("drivesplit_active_downloads").decrement(1.0);
                histogram!("drivesplit_download_duration_seconds").record(secs);
            }
        }
    }

    pub fn fail(self, reason: &str) {
        match self.kind {
            SessionKind::Upload => {
                counter!("drivesplit_uploads_failed_total", "reason" => reason.to_string())
                    .increment(1);
                gauge!("drivesplit_active_uploads").decrement(1.0);
            }
            SessionKind::Download => {
                counter!("drivesplit_downloads_failed_total", "reason" => reason.to_string())
                    .increment(1);
                gauge!("drivesplit_active_downloads").decrement(1.0);
            }
        }
    }
}
