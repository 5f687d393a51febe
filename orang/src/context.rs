use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// Why a command stopped before exhausting its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    None,
    /// `max_matching_files` was reached; treated as success.
    MaxReached,
    /// The cancellation signal fired; exit code 2.
    Canceled,
}

impl TerminationReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TerminationReason::MaxReached,
            2 => TerminationReason::Canceled,
            _ => TerminationReason::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TerminationReason::None => 0,
            TerminationReason::MaxReached => 1,
            TerminationReason::Canceled => 2,
        }
    }
}

/// Monotonic counters aggregated into the end-of-command summary. Cloning
/// shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct SearchTelemetry {
    searched_directory_count: Arc<AtomicU64>,
    file_count: Arc<AtomicU64>,
    directory_count: Arc<AtomicU64>,
    matching_file_count: Arc<AtomicU64>,
    matching_directory_count: Arc<AtomicU64>,
    added_count: Arc<AtomicU64>,
    updated_count: Arc<AtomicU64>,
    renamed_count: Arc<AtomicU64>,
    deleted_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    max_file_size: Arc<AtomicU64>,
    total_size: Arc<AtomicU64>,
}

impl SearchTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_searched_directory(&self) {
        self.searched_directory_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file(&self, size: u64) {
        self.file_count.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(size, Ordering::Relaxed);
        let mut peak = self.max_file_size.load(Ordering::Relaxed);
        while size > peak {
            match self.max_file_size.compare_exchange_weak(
                peak,
                size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    pub fn record_directory(&self) {
        self.directory_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_matching_file(&self) {
        self.matching_file_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_matching_directory(&self) {
        self.matching_directory_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_added(&self) {
        self.added_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_updated(&self) {
        self.updated_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_renamed(&self) {
        self.renamed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.deleted_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Matching files plus matching directories, the quantity bounded by
    /// `max_matching_files`.
    pub fn matching_count(&self) -> u64 {
        self.matching_file_count.load(Ordering::Relaxed)
            + self.matching_directory_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            searched_directory_count: self.searched_directory_count.load(Ordering::Relaxed),
            file_count: self.file_count.load(Ordering::Relaxed),
            directory_count: self.directory_count.load(Ordering::Relaxed),
            matching_file_count: self.matching_file_count.load(Ordering::Relaxed),
            matching_directory_count: self.matching_directory_count.load(Ordering::Relaxed),
            added_count: self.added_count.load(Ordering::Relaxed),
            updated_count: self.updated_count.load(Ordering::Relaxed),
            renamed_count: self.renamed_count.load(Ordering::Relaxed),
            deleted_count: self.deleted_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            max_file_size: self.max_file_size.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub searched_directory_count: u64,
    pub file_count: u64,
    pub directory_count: u64,
    pub matching_file_count: u64,
    pub matching_directory_count: u64,
    pub added_count: u64,
    pub updated_count: u64,
    pub renamed_count: u64,
    pub deleted_count: u64,
    pub error_count: u64,
    pub max_file_size: u64,
    pub total_size: u64,
}

impl TelemetrySnapshot {
    pub fn matching_count(&self) -> u64 {
        self.matching_file_count + self.matching_directory_count
    }
}

/// Live progress display over the traversal.
#[derive(Debug)]
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {pos} matches  {wide_msg}")
                .expect("static template"),
        );
        Self { bar }
    }

    pub fn report_directory(&self, path: &Path) {
        self.bar.set_message(path.display().to_string());
        self.bar.tick();
    }

    pub fn report_match(&self) {
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-invocation state shared by the walker, pipeline and executors.
#[derive(Debug)]
pub struct SearchContext {
    pub telemetry: SearchTelemetry,
    pub progress: Option<ProgressReporter>,
    cancel: Arc<AtomicBool>,
    termination: AtomicU8,
    max_matching_files: u64,
    started: Instant,
}

impl SearchContext {
    pub fn new(max_matching_files: u64, progress: bool) -> Self {
        Self {
            telemetry: SearchTelemetry::new(),
            progress: progress.then(ProgressReporter::new),
            cancel: Arc::new(AtomicBool::new(false)),
            termination: AtomicU8::new(0),
            max_matching_files,
            started: Instant::now(),
        }
    }

    /// Handle for an external cancellation source (e.g. a ctrl-c handler).
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn termination(&self) -> TerminationReason {
        TerminationReason::from_u8(self.termination.load(Ordering::Relaxed))
    }

    pub fn set_termination(&self, reason: TerminationReason) {
        self.termination.store(reason.as_u8(), Ordering::Relaxed);
    }

    pub fn max_matching_files(&self) -> u64 {
        self.max_matching_files
    }

    /// True once the matching-count cap has been hit.
    pub fn max_reached(&self) -> bool {
        self.max_matching_files > 0 && self.telemetry.matching_count() >= self.max_matching_files
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log_summary(&self) {
        let s = self.telemetry.snapshot();
        info!(
            "searched {} directories, saw {} files and {} directories, \
             {} matches ({} files, {} directories), {} errors, elapsed {:.2?}",
            s.searched_directory_count,
            s.file_count,
            s.directory_count,
            s.matching_count(),
            s.matching_file_count,
            s.matching_directory_count,
            s.error_count,
            self.elapsed(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let telemetry = SearchTelemetry::new();
        telemetry.record_file(100);
        telemetry.record_file(50);
        telemetry.record_directory();
        telemetry.record_matching_file();
        telemetry.record_matching_directory();

        let s = telemetry.snapshot();
        assert_eq!(s.file_count, 2);
        assert_eq!(s.directory_count, 1);
        assert_eq!(s.total_size, 150);
        assert_eq!(s.max_file_size, 100);
        assert_eq!(s.matching_count(), 2);
    }

    #[test]
    fn max_file_size_keeps_peak() {
        let telemetry = SearchTelemetry::new();
        telemetry.record_file(500);
        telemetry.record_file(100);
        assert_eq!(telemetry.snapshot().max_file_size, 500);
    }

    #[test]
    fn clone_shares_counters() {
        let telemetry = SearchTelemetry::new();
        let other = telemetry.clone();
        other.record_added();
        assert_eq!(telemetry.snapshot().added_count, 1);
    }

    #[test]
    fn max_reached_and_termination() {
        let ctx = SearchContext::new(2, false);
        assert!(!ctx.max_reached());
        ctx.telemetry.record_matching_file();
        ctx.telemetry.record_matching_file();
        assert!(ctx.max_reached());

        assert_eq!(ctx.termination(), TerminationReason::None);
        ctx.set_termination(TerminationReason::MaxReached);
        assert_eq!(ctx.termination(), TerminationReason::MaxReached);
    }

    #[test]
    fn cancellation_flag_round_trips() {
        let ctx = SearchContext::new(0, false);
        let handle = ctx.cancel_handle();
        assert!(!ctx.is_canceled());
        handle.store(true, Ordering::Relaxed);
        assert!(ctx.is_canceled());
    }
}
