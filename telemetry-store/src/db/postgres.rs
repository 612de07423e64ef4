use sqlx::PgPool;

use crate::domain::{CanonicalFrame, Device, Sensor, SensorReadingInput, SensorSnapshot};

use super::{ReconcileOutcome, Store, StoreError};

/// Postgres-backed store. Each statement runs on its own pooled connection
/// and commits immediately.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_device(&self, frame: &CanonicalFrame) -> Result<i64, sqlx::Error> {
        let meta = &frame.device;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO devices (
                external_id, owner_external_id, parent_user_id,
                device_name, device_no, group_id, lat, lng,
                product_id, product_type, protocol_label,
                last_flag, last_raw_payload, last_push_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (external_id) DO UPDATE SET
                owner_external_id = COALESCE(EXCLUDED.owner_external_id, devices.owner_external_id),
                parent_user_id    = COALESCE(EXCLUDED.parent_user_id, devices.parent_user_id),
                device_name       = COALESCE(EXCLUDED.device_name, devices.device_name),
                device_no         = COALESCE(EXCLUDED.device_no, devices.device_no),
                group_id          = COALESCE(EXCLUDED.group_id, devices.group_id),
                lat               = COALESCE(EXCLUDED.lat, devices.lat),
                lng               = COALESCE(EXCLUDED.lng, devices.lng),
                product_id        = COALESCE(EXCLUDED.product_id, devices.product_id),
                product_type      = COALESCE(EXCLUDED.product_type, devices.product_type),
                protocol_label    = COALESCE(EXCLUDED.protocol_label, devices.protocol_label),
                last_flag         = EXCLUDED.last_flag,
                last_raw_payload  = EXCLUDED.last_raw_payload,
                last_push_time    = EXCLUDED.last_push_time,
                updated_at        = now()
            RETURNING id
            "#,
        )
        .bind(frame.device_external_id)
        .bind(&frame.owner_external_id)
        .bind(&meta.parent_user_id)
        .bind(&meta.device_name)
        .bind(&meta.device_no)
        .bind(meta.group_id)
        .bind(&meta.lat)
        .bind(&meta.lng)
        .bind(&meta.product_id)
        .bind(&meta.product_type)
        .bind(&meta.protocol_label)
        .bind(&frame.flag)
        .bind(&frame.raw_payload)
        .bind(frame.pushed_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn upsert_sensor(&self, device_id: i64, r: &SensorReadingInput) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            INSERT INTO sensors (device_id, external_id, sensor_type_id, sensor_name, unit)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, external_id) DO UPDATE SET
                sensor_type_id = COALESCE(EXCLUDED.sensor_type_id, sensors.sensor_type_id),
                sensor_name    = COALESCE(EXCLUDED.sensor_name, sensors.sensor_name),
                unit           = COALESCE(EXCLUDED.unit, sensors.unit),
                updated_at     = now()
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(r.sensor_external_id)
        .bind(r.sensor_type_id)
        .bind(&r.sensor_name)
        .bind(&r.unit)
        .fetch_one(&self.pool)
        .await
    }

    /// Returns `true` when the row is new, `false` on a key conflict.
    async fn insert_reading(
        &self,
        sensor_id: i64,
        r: &SensorReadingInput,
        raw_payload: &Option<String>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO sensor_readings (
                sensor_id, recorded_at, sensor_timestamp, is_alarm, is_line,
                raw_value, scaled_value, raw_payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (sensor_id, recorded_at, sensor_timestamp) DO NOTHING
            "#,
        )
        .bind(sensor_id)
        .bind(r.recorded_at)
        .bind(r.sensor_timestamp_key())
        .bind(r.is_alarm)
        .bind(r.is_line)
        .bind(&r.raw_value)
        .bind(&r.scaled_value)
        .bind(raw_payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set on `latest_recorded_at`: a reading older than the
    /// current latest leaves the projection untouched.
    async fn advance_latest(&self, sensor_id: i64, r: &SensorReadingInput) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sensors SET
                latest_value       = $2,
                latest_recorded_at = $3,
                is_alarm           = COALESCE($4, is_alarm),
                is_line            = COALESCE($5, is_line),
                updated_at         = now()
            WHERE id = $1
              AND (latest_recorded_at IS NULL OR latest_recorded_at <= $3)
            "#,
        )
        .bind(sensor_id)
        .bind(r.latest_value())
        .bind(r.recorded_at)
        .bind(r.is_alarm)
        .bind(r.is_line)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn reconcile(&self, frame: &CanonicalFrame) -> Result<ReconcileOutcome, StoreError> {
        let device_id = self.upsert_device(frame).await?;
        let mut outcome = ReconcileOutcome::default();

        for reading in &frame.readings {
            let sensor_id = self.upsert_sensor(device_id, reading).await?;
            if self.insert_reading(sensor_id, reading, &frame.raw_payload).await? {
                outcome.stored += 1;
            } else {
                outcome.duplicates += 1;
                tracing::debug!(
                    device_id = frame.device_external_id,
                    sensor_id = reading.sensor_external_id,
                    recorded_at = %reading.recorded_at,
                    "duplicate reading ignored"
                );
            }
            self.advance_latest(sensor_id, reading).await?;
        }

        Ok(outcome)
    }

    async fn latest_snapshots(
        &self,
        sensor_ids: Option<&[i64]>,
    ) -> Result<Vec<SensorSnapshot>, StoreError> {
        let filter: Option<Vec<i64>> = sensor_ids.map(<[i64]>::to_vec);
        let rows = sqlx::query_as::<_, SensorSnapshot>(
            r#"
            SELECT
                s.external_id AS sensor_external_id,
                d.external_id AS device_external_id,
                s.sensor_name,
                d.device_name,
                s.latest_value,
                s.latest_recorded_at,
                d.last_push_time
            FROM sensors s
            JOIN devices d ON s.device_id = d.id
            WHERE s.latest_value IS NOT NULL
              AND ($1::BIGINT[] IS NULL OR s.external_id = ANY($1))
            ORDER BY s.external_id
            "#,
        )
        .bind(filter)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn device(&self, external_id: i64) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query_as::<_, Device>(
            r#"
            SELECT
                id, external_id, user_id, owner_external_id, parent_user_id,
                device_name, device_no, group_id, lat, lng,
                product_id, product_type, protocol_label,
                last_flag, last_raw_payload, last_push_time
            FROM devices
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn device_sensors(&self, device_external_id: i64) -> Result<Vec<Sensor>, StoreError> {
        let rows = sqlx::query_as::<_, Sensor>(
            r#"
            SELECT
                s.id, s.device_id, s.external_id, s.sensor_type_id, s.sensor_name,
                s.unit, s.latest_value, s.latest_recorded_at, s.is_alarm, s.is_line
            FROM sensors s
            JOIN devices d ON s.device_id = d.id
            WHERE d.external_id = $1
            ORDER BY s.external_id
            "#,
        )
        .bind(device_external_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
