//! Backup operation counters.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BackupMetrics {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    pending: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pending: i64,
}

impl BackupMetrics {
    /// Count a new attempt. The outcome is recorded when the returned value is
    /// dropped: as a success if `succeed` was called, as a failure otherwise.
    pub fn start(&self) -> BackupAttempt<'_> {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
        BackupAttempt {
            metrics: self,
            succeeded: false,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

pub struct BackupAttempt<'a> {
    metrics: &'a BackupMetrics,
    succeeded: bool,
}

impl BackupAttempt<'_> {
    pub fn succeed(mut self) {
        self.succeeded = true;
    }
}

impl Drop for BackupAttempt<'_> {
    fn drop(&mut self) {
        self.metrics.pending.fetch_sub(1, Ordering::Relaxed);
        let counter = if self.succeeded {
            &self.metrics.succeeded
        } else {
            &self.metrics.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_recorded_on_drop() {
        let metrics = BackupMetrics::default();

        let attempt = metrics.start();
        assert_eq!(metrics.snapshot().pending, 1);
        attempt.succeed();

        drop(metrics.start());

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                attempted: 2,
                succeeded: 1,
                failed: 1,
                pending: 0,
            }
        );
    }
}
