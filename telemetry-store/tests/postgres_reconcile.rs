use std::env;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use telemetry_store::domain::{CanonicalFrame, DeviceMeta, SensorReadingInput};
use telemetry_store::{PgStore, Store};
use time::macros::datetime;
use time::OffsetDateTime;

fn reading(sensor: i64, at: OffsetDateTime, value: &str) -> SensorReadingInput {
    SensorReadingInput {
        sensor_external_id: sensor,
        sensor_type_id: Some(1),
        is_line: Some(true),
        is_alarm: Some(false),
        unit: Some("mm".to_string()),
        sensor_name: Some("Tank".to_string()),
        recorded_at: at,
        sensor_timestamp: None,
        raw_value: None,
        scaled_value: Some(value.to_string()),
    }
}

fn frame(at: OffsetDateTime, readings: Vec<SensorReadingInput>) -> CanonicalFrame {
    CanonicalFrame {
        device_external_id: 2864,
        owner_external_id: Some("200".to_string()),
        flag: Some("push".to_string()),
        raw_payload: None,
        received_at: at,
        pushed_at: at,
        device: DeviceMeta::default(),
        readings,
    }
}

#[tokio::test]
async fn reconcile_is_idempotent_and_latest_is_monotonic() -> Result<()> {
    let database_url = match env::var("TELEMETRY_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping Postgres reconcile test because TELEMETRY_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let pool = PgPoolOptions::new().max_connections(2).connect(&database_url).await?;
    sqlx::raw_sql(include_str!("../sql/schema/01_telemetry.sql"))
        .execute(&pool)
        .await?;
    sqlx::query("TRUNCATE TABLE sensor_readings, sensors, devices RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await?;

    let store = PgStore::new(pool.clone());
    let newer = datetime!(2024-03-01 10:00:00 UTC);
    let older = datetime!(2024-03-01 09:00:00 UTC);

    let first = store.reconcile(&frame(newer, vec![reading(11922, newer, "812")])).await?;
    let again = store.reconcile(&frame(newer, vec![reading(11922, newer, "812")])).await?;
    assert_eq!(first.stored, 1);
    assert_eq!(again.stored, 0);

    let late = store.reconcile(&frame(older, vec![reading(11922, older, "10")])).await?;
    assert_eq!(late.stored, 1);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
        .fetch_one(&pool)
        .await?;
    assert_eq!(rows, 2);

    let sensors = store.device_sensors(2864).await?;
    assert_eq!(sensors.len(), 1);
    assert_eq!(sensors[0].latest_value.as_deref(), Some("812"));
    assert_eq!(sensors[0].latest_recorded_at, Some(newer));

    let snapshots = store.latest_snapshots(Some(&[11922])).await?;
    assert_eq!(snapshots.len(), 1);

    Ok(())
}
