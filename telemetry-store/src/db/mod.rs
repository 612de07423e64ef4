//! Persistence for devices, sensors and readings.
//!
//! Every write path is idempotent: devices and sensors are upserted by their
//! natural keys and readings are insert-only, keyed by
//! `(sensor_id, recorded_at, sensor_timestamp)`. A key conflict on a reading
//! is a duplicate delivery, never an error.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::domain::{CanonicalFrame, Device, Sensor, SensorSnapshot};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Readings inserted by this call; duplicates are not counted.
    pub stored: u64,
    pub duplicates: u64,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Upsert the frame's device and sensors and insert its readings.
    ///
    /// Readings are written one by one without a surrounding transaction, so
    /// an error part-way through keeps what was already stored. Retrying the
    /// same frame is safe.
    async fn reconcile(&self, frame: &CanonicalFrame) -> Result<ReconcileOutcome, StoreError>;

    /// Sensors with a latest value, ordered by sensor external id. `None`
    /// means every sensor.
    async fn latest_snapshots(
        &self,
        sensor_ids: Option<&[i64]>,
    ) -> Result<Vec<SensorSnapshot>, StoreError>;

    async fn device(&self, external_id: i64) -> Result<Option<Device>, StoreError>;

    async fn device_sensors(&self, device_external_id: i64) -> Result<Vec<Sensor>, StoreError>;
}
