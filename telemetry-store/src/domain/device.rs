use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub external_id: i64,
    /// Local account the device is bound to; assigned by admins, not by ingestion.
    pub user_id: Option<String>,
    pub owner_external_id: Option<String>,
    pub parent_user_id: Option<String>,
    pub device_name: Option<String>,
    pub device_no: Option<String>,
    pub group_id: Option<i64>,
    pub lat: Option<String>,
    pub lng: Option<String>,
    pub product_id: Option<String>,
    pub product_type: Option<String>,
    pub protocol_label: Option<String>,
    pub last_flag: Option<String>,
    pub last_raw_payload: Option<String>,
    pub last_push_time: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Sensor {
    pub id: i64,
    pub device_id: i64,
    pub external_id: i64,
    pub sensor_type_id: Option<i64>,
    pub sensor_name: Option<String>,
    pub unit: Option<String>,
    pub latest_value: Option<String>,
    pub latest_recorded_at: Option<OffsetDateTime>,
    pub is_alarm: Option<bool>,
    pub is_line: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SensorReading {
    pub id: i64,
    pub sensor_id: i64,
    pub recorded_at: OffsetDateTime,
    pub sensor_timestamp: String,
    pub is_alarm: Option<bool>,
    pub is_line: Option<bool>,
    pub raw_value: Option<String>,
    pub scaled_value: Option<String>,
    pub raw_payload: Option<String>,
}

/// Latest-state view of a sensor joined with its device, as read by the
/// tank export.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SensorSnapshot {
    pub sensor_external_id: i64,
    pub device_external_id: i64,
    pub sensor_name: Option<String>,
    pub device_name: Option<String>,
    pub latest_value: Option<String>,
    pub latest_recorded_at: Option<OffsetDateTime>,
    pub last_push_time: Option<OffsetDateTime>,
}
