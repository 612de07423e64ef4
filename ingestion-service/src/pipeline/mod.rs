use std::sync::Arc;

use telemetry_store::{
    domain::{CanonicalFrame, SensorReadingInput},
    Store, StoreError,
};
use time::OffsetDateTime;

use crate::{
    sinks::log_store::{LogRecord, LogStatus, LogStore, LOG_SCHEMA_VERSION},
    transform::{NormalizeError, NormalizedFrame},
};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid payload: {0}")]
    Validation(#[from] NormalizeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Newly inserted readings.
    pub stored: u64,
    pub duplicates: u64,
    /// Reading entries the normalizer dropped.
    pub defects: usize,
}

/// Reconcile-then-log path shared by the webhook and the poll client.
pub struct Pipeline {
    store: Arc<dyn Store>,
    log: Arc<LogStore>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, log: Arc<LogStore>) -> Self {
        Self { store, log }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    /// Store the frame, then append it to the device log. The log line
    /// records the store outcome; a log failure is only reported.
    pub async fn ingest(&self, normalized: NormalizedFrame) -> Result<IngestOutcome, PipelineError> {
        let NormalizedFrame { frame, defects } = normalized;

        let result = self.store.reconcile(&frame).await;
        match &result {
            Ok(_) => self.write_log(&frame, LogStatus::Success, None).await,
            Err(e) => {
                tracing::error!(error = %e, device_id = frame.device_external_id, "reconcile failed");
                self.write_log(&frame, LogStatus::Error, Some(e.to_string())).await;
            }
        }
        let reconciled = result?;

        metrics::counter!("readings_stored_total").increment(reconciled.stored);
        metrics::counter!("readings_duplicate_total").increment(reconciled.duplicates);
        tracing::debug!(
            device_id = frame.device_external_id,
            stored = reconciled.stored,
            duplicates = reconciled.duplicates,
            defects = defects.len(),
            "frame ingested"
        );

        Ok(IngestOutcome {
            stored: reconciled.stored,
            duplicates: reconciled.duplicates,
            defects: defects.len(),
        })
    }

    /// Record a device whose payload was rejected before reaching the store
    /// as a single `error` line in its log.
    pub async fn log_rejected(&self, device_id: i64, at: OffsetDateTime, message: String) {
        let record = LogRecord {
            v: LOG_SCHEMA_VERSION,
            device_id,
            sensor_id: None,
            sensor_name: None,
            value: None,
            unit: None,
            is_alarm: None,
            is_line: None,
            timestamp: at,
            status: LogStatus::Error,
            message: Some(message),
        };
        let date = at.to_offset(time::UtcOffset::UTC).date();
        if let Err(e) = self.log.append(device_id, date, &[record]).await {
            tracing::warn!(error = %e, device_id, "failed to append device log");
        }
    }

    async fn write_log(&self, frame: &CanonicalFrame, status: LogStatus, message: Option<String>) {
        let records: Vec<LogRecord> = frame
            .readings
            .iter()
            .map(|r| log_record(frame.device_external_id, r, status, message.clone()))
            .collect();
        let date = frame.pushed_at.to_offset(time::UtcOffset::UTC).date();

        if let Err(e) = self.log.append(frame.device_external_id, date, &records).await {
            tracing::warn!(error = %e, device_id = frame.device_external_id, "failed to append device log");
        }
    }
}

fn log_record(device_id: i64, r: &SensorReadingInput, status: LogStatus, message: Option<String>) -> LogRecord {
    LogRecord {
        v: LOG_SCHEMA_VERSION,
        device_id,
        sensor_id: Some(r.sensor_external_id),
        sensor_name: r.sensor_name.clone(),
        value: r.latest_value().map(str::to_string),
        unit: r.unit.clone(),
        is_alarm: r.is_alarm,
        is_line: r.is_line,
        timestamp: r.recorded_at,
        status,
        message,
    }
}
