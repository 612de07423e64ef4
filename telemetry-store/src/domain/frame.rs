use time::OffsetDateTime;

/// One device's batch of sensor observations, reshaped from whichever vendor
/// payload carried it. Built per ingest call and never persisted as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFrame {
    pub device_external_id: i64,
    pub owner_external_id: Option<String>,
    pub flag: Option<String>,
    pub raw_payload: Option<String>,
    /// When this process received the payload.
    pub received_at: OffsetDateTime,
    /// Vendor-declared frame time; falls back to `received_at`.
    pub pushed_at: OffsetDateTime,
    pub device: DeviceMeta,
    pub readings: Vec<SensorReadingInput>,
}

/// Descriptive device attributes. `None` never overwrites a stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMeta {
    pub parent_user_id: Option<String>,
    pub device_name: Option<String>,
    pub device_no: Option<String>,
    pub group_id: Option<i64>,
    pub lat: Option<String>,
    pub lng: Option<String>,
    pub product_id: Option<String>,
    pub product_type: Option<String>,
    pub protocol_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReadingInput {
    pub sensor_external_id: i64,
    pub sensor_type_id: Option<i64>,
    pub is_line: Option<bool>,
    pub is_alarm: Option<bool>,
    pub unit: Option<String>,
    pub sensor_name: Option<String>,
    pub recorded_at: OffsetDateTime,
    pub sensor_timestamp: Option<String>,
    pub raw_value: Option<String>,
    pub scaled_value: Option<String>,
}

impl SensorReadingInput {
    /// Value written to the sensor's latest projection: the raw vendor value
    /// when present, otherwise the scaled one.
    pub fn latest_value(&self) -> Option<&str> {
        self.raw_value.as_deref().or(self.scaled_value.as_deref())
    }

    /// Key component stored for a missing vendor timestamp.
    pub fn sensor_timestamp_key(&self) -> &str {
        self.sensor_timestamp.as_deref().unwrap_or("")
    }
}
