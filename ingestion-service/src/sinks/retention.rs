use std::{io, sync::Arc};

use time::{Date, Duration};

use crate::clock::Clock;

use super::log_store::{list_log_files, LogStore, LogStoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes log files dated strictly before `today - retention_days`.
pub struct RetentionSweeper {
    log: Arc<LogStore>,
    retention_days: u32,
    clock: Arc<dyn Clock>,
}

impl RetentionSweeper {
    pub fn new(log: Arc<LogStore>, retention_days: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            log,
            retention_days,
            clock,
        }
    }

    pub fn cutoff(&self) -> Date {
        let today = self.clock.now().to_offset(time::UtcOffset::UTC).date();
        today
            .checked_sub(Duration::days(i64::from(self.retention_days)))
            .unwrap_or(Date::MIN)
    }

    /// One pass over the log tree. Per-file failures are counted and the
    /// sweep moves on; only an unreadable root is an error.
    pub async fn sweep(&self) -> Result<SweepReport, LogStoreError> {
        let cutoff = self.cutoff();
        let root = self.log.root();
        let mut report = SweepReport::default();

        let mut devices = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(source) => {
                return Err(LogStoreError::Io {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };

        loop {
            let entry = match devices.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(LogStoreError::Io {
                        path: root.to_path_buf(),
                        source,
                    })
                }
            };
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let dir = entry.path();
            let files = match list_log_files(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable log directory");
                    continue;
                }
            };

            for (path, _, date) in files {
                if date >= cutoff {
                    continue;
                }
                match self.log.remove_file(&path).await {
                    Ok(()) => {
                        report.removed += 1;
                        metrics::counter!("log_files_pruned_total").increment(1);
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(error = %e, path = %path.display(), "failed to delete expired log file");
                    }
                }
            }

            // Fails while the directory still has files.
            let _ = tokio::fs::remove_dir(&dir).await;
        }

        tracing::info!(
            removed = report.removed,
            failed = report.failed,
            %cutoff,
            "log retention sweep finished"
        );
        Ok(report)
    }
}
