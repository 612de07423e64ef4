pub mod atg_export;
pub mod log_store;
pub mod retention;

pub use atg_export::{AtgBatch, AtgExporter, ExportError, ExportOutcome, TankExportRecord};
pub use log_store::{LogFilter, LogQuery, LogRecord, LogStatus, LogStore, LogStoreError, TimeRange};
pub use retention::{RetentionSweeper, SweepReport};
