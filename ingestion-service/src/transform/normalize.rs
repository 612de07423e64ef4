//! Vendor payload -> [`CanonicalFrame`].
//!
//! The push callback and the poll response describe the same device/sensor
//! data with different key names. Each shape gets a [`FieldMap`] naming the
//! vendor keys (first non-blank alias wins) and everything else is shared.

use serde_json::{Map, Value};
use telemetry_store::domain::{CanonicalFrame, DeviceMeta, SensorReadingInput};
use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    OffsetDateTime, PrimitiveDateTime,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no device id")]
    MissingDeviceId,
    #[error("no reading carries both a sensor id and a value")]
    NoUsableReadings,
    #[error("poll response has no dataList array")]
    MissingDataList,
}

/// Why a single reading entry was dropped.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DefectKind {
    #[error("entry is not an object")]
    NotAnObject,
    #[error("missing sensor id")]
    MissingSensorId,
    #[error("missing value")]
    MissingValue,
    #[error("non-numeric value {0:?}")]
    NonNumericValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingDefect {
    /// Position of the entry in the vendor's reading array.
    pub index: usize,
    pub sensor_external_id: Option<i64>,
    pub kind: DefectKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFrame {
    pub frame: CanonicalFrame,
    pub defects: Vec<ReadingDefect>,
}

type Keys = &'static [&'static str];

/// Vendor key aliases for every canonical field of one payload shape.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub device_id: Keys,
    pub owner_id: Keys,
    pub parent_user_id: Keys,
    pub device_name: Keys,
    pub device_no: Keys,
    pub group_id: Keys,
    pub lat: Keys,
    pub lng: Keys,
    pub product_id: Keys,
    pub product_type: Keys,
    pub protocol_label: Keys,
    pub flag: Keys,
    pub default_flag: Option<&'static str>,
    pub raw_payload: Keys,
    pub frame_time: Keys,
    pub readings: Keys,

    pub sensor_id: Keys,
    pub sensor_type_id: Keys,
    pub sensor_name: Keys,
    pub is_line: Keys,
    pub is_alarm: Keys,
    pub unit: Keys,
    pub raw_value: Keys,
    pub scaled_value: Keys,
    pub sensor_timestamp: Keys,
}

/// Push callback body (`sensorsDates[]`).
pub const PUSH_FIELDS: FieldMap = FieldMap {
    device_id: &["deviceId"],
    owner_id: &["deviceUserid"],
    parent_user_id: &["parentUserId"],
    device_name: &["deviceName", "device_name"],
    device_no: &["deviceNo", "device_no"],
    group_id: &["groupId", "group_id"],
    lat: &["lat"],
    lng: &["lng"],
    product_id: &["productId", "product_id"],
    product_type: &["productType", "product_type"],
    protocol_label: &["protocolLabel", "protocol_label"],
    flag: &["flag"],
    default_flag: None,
    raw_payload: &["rawData"],
    frame_time: &["time"],
    readings: &["sensorsDates"],

    sensor_id: &["sensorsId"],
    sensor_type_id: &["sensorsTypeId"],
    sensor_name: &["sensorName", "sensor_name"],
    is_line: &["isLine"],
    is_alarm: &["isAlarm"],
    unit: &["unit"],
    raw_value: &["value"],
    scaled_value: &["reVal"],
    sensor_timestamp: &["times"],
};

/// One `dataList[]` device of the snapshot poll response (`sensorsList[]`).
pub const POLL_FIELDS: FieldMap = FieldMap {
    device_id: &["id", "deviceId"],
    owner_id: &["userId"],
    parent_user_id: &["parentUserId", "parentUser"],
    device_name: &["deviceName", "device_name"],
    device_no: &["deviceNo", "device_no"],
    group_id: &["groupId", "group_id"],
    lat: &["lat"],
    lng: &["lng"],
    product_id: &["productId", "product_id"],
    product_type: &["productType", "product_type"],
    protocol_label: &["protocolLabel", "protocol_label"],
    flag: &["flag"],
    default_flag: Some("sync"),
    raw_payload: &["rawData", "deviceNo"],
    frame_time: &["updateDate", "createDate"],
    readings: &["sensorsList"],

    sensor_id: &["sensorsId", "sensorId", "id"],
    sensor_type_id: &["sensorTypeId", "sensorsTypeId"],
    sensor_name: &["sensorName", "sensor_name"],
    is_line: &["isLine"],
    is_alarm: &["isAlarms", "isAlarm"],
    unit: &["unit"],
    raw_value: &["value"],
    scaled_value: &["send_value"],
    sensor_timestamp: &["updateDate", "heartbeatDate"],
};

impl FieldMap {
    /// Device id of a raw vendor object, if it carries a usable one.
    pub fn device_id_of(&self, obj: &Value) -> Option<i64> {
        lookup(obj.as_object()?, self.device_id).and_then(as_int)
    }
}

pub fn normalize_push(body: &Value, received_at: OffsetDateTime) -> Result<NormalizedFrame, NormalizeError> {
    let obj = body.as_object().ok_or(NormalizeError::NotAnObject)?;
    normalize_with(&PUSH_FIELDS, obj, received_at, None)
}

/// One result per `dataList` device, so one malformed device does not hide
/// the others. `default_owner` is used for devices without a `userId`.
pub fn normalize_poll_response(
    body: &Value,
    received_at: OffsetDateTime,
    default_owner: Option<&str>,
) -> Result<Vec<Result<NormalizedFrame, NormalizeError>>, NormalizeError> {
    let devices = body
        .get("dataList")
        .and_then(Value::as_array)
        .ok_or(NormalizeError::MissingDataList)?;

    Ok(devices
        .iter()
        .map(|device| {
            let obj = device.as_object().ok_or(NormalizeError::NotAnObject)?;
            normalize_with(&POLL_FIELDS, obj, received_at, default_owner)
        })
        .collect())
}

pub fn normalize_with(
    map: &FieldMap,
    obj: &Map<String, Value>,
    received_at: OffsetDateTime,
    default_owner: Option<&str>,
) -> Result<NormalizedFrame, NormalizeError> {
    let device_external_id = lookup(obj, map.device_id)
        .and_then(as_int)
        .ok_or(NormalizeError::MissingDeviceId)?;

    let pushed_at = lookup(obj, map.frame_time)
        .and_then(as_timestamp)
        .unwrap_or(received_at);

    let entries: &[Value] = lookup(obj, map.readings)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut readings = Vec::with_capacity(entries.len());
    let mut defects = Vec::new();
    let mut usable_entries = 0usize;

    for (index, entry) in entries.iter().enumerate() {
        let Some(entry) = entry.as_object() else {
            defects.push(ReadingDefect {
                index,
                sensor_external_id: None,
                kind: DefectKind::NotAnObject,
            });
            continue;
        };

        let sensor_external_id = lookup(entry, map.sensor_id).and_then(as_int);
        let raw_value = text(entry, map.raw_value);
        let scaled_value = text(entry, map.scaled_value);

        let Some(sensor_id) = sensor_external_id else {
            defects.push(ReadingDefect {
                index,
                sensor_external_id,
                kind: DefectKind::MissingSensorId,
            });
            continue;
        };

        let Some(value) = raw_value.as_deref().or(scaled_value.as_deref()) else {
            defects.push(ReadingDefect {
                index,
                sensor_external_id,
                kind: DefectKind::MissingValue,
            });
            continue;
        };
        usable_entries += 1;

        if value.parse::<f64>().map_or(true, |v| !v.is_finite()) {
            defects.push(ReadingDefect {
                index,
                sensor_external_id,
                kind: DefectKind::NonNumericValue(value.to_string()),
            });
            continue;
        }

        readings.push(SensorReadingInput {
            sensor_external_id: sensor_id,
            sensor_type_id: lookup(entry, map.sensor_type_id).and_then(as_int),
            is_line: lookup(entry, map.is_line).and_then(as_bool),
            is_alarm: lookup(entry, map.is_alarm).and_then(as_bool),
            unit: text(entry, map.unit),
            sensor_name: text(entry, map.sensor_name),
            recorded_at: pushed_at,
            sensor_timestamp: text(entry, map.sensor_timestamp),
            raw_value,
            scaled_value,
        });
    }

    if usable_entries == 0 {
        return Err(NormalizeError::NoUsableReadings);
    }

    if !defects.is_empty() {
        metrics::counter!("normalize_defects_total").increment(defects.len() as u64);
    }

    let frame = CanonicalFrame {
        device_external_id,
        owner_external_id: text(obj, map.owner_id).or_else(|| default_owner.map(str::to_string)),
        flag: text(obj, map.flag).or_else(|| map.default_flag.map(str::to_string)),
        raw_payload: text(obj, map.raw_payload),
        received_at,
        pushed_at,
        device: DeviceMeta {
            parent_user_id: text(obj, map.parent_user_id),
            device_name: text(obj, map.device_name),
            device_no: text(obj, map.device_no),
            group_id: lookup(obj, map.group_id).and_then(as_int),
            lat: text(obj, map.lat),
            lng: text(obj, map.lng),
            product_id: text(obj, map.product_id),
            product_type: text(obj, map.product_type),
            protocol_label: text(obj, map.protocol_label),
        },
        readings,
    };

    Ok(NormalizedFrame { frame, defects })
}

/// First alias whose value is neither null nor a blank string.
fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| obj.get(*k)).find(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    lookup(obj, keys).and_then(as_text)
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Strings go through [`parse_timestamp`]; numbers are epoch seconds, or
/// epoch milliseconds when too large to be seconds.
fn as_timestamp(v: &Value) -> Option<OffsetDateTime> {
    match v {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n.abs() >= 100_000_000_000 {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(n) * 1_000_000).ok()
            } else {
                OffsetDateTime::from_unix_timestamp(n).ok()
            }
        }
        _ => None,
    }
}

const NAIVE_FORMATS: &[&[FormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]/[month]/[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
];

/// Vendor timestamps without an offset are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts.to_offset(time::UtcOffset::UTC));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| PrimitiveDateTime::parse(s, *fmt).ok())
        .map(PrimitiveDateTime::assume_utc)
}
