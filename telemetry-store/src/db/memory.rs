use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::domain::{
    CanonicalFrame, Device, Sensor, SensorReading, SensorReadingInput, SensorSnapshot,
};

use super::{ReconcileOutcome, Store, StoreError};

/// In-process store with the same key and merge rules as [`super::PgStore`].
///
/// Backs the service's unit tests. All state sits behind one async mutex, so
/// each `reconcile` call is serialised.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    devices: BTreeMap<i64, Device>,
    sensors: BTreeMap<(i64, i64), Sensor>,
    reading_keys: BTreeSet<(i64, OffsetDateTime, String)>,
    readings: Vec<SensorReading>,
}

fn bump(next_id: &mut i64) -> i64 {
    *next_id += 1;
    *next_id
}

impl Inner {
    fn upsert_device(&mut self, frame: &CanonicalFrame) -> i64 {
        let meta = &frame.device;
        let Inner { next_id, devices, .. } = self;
        let device = devices
            .entry(frame.device_external_id)
            .or_insert_with(|| Device {
                id: bump(next_id),
                external_id: frame.device_external_id,
                user_id: None,
                owner_external_id: None,
                parent_user_id: None,
                device_name: None,
                device_no: None,
                group_id: None,
                lat: None,
                lng: None,
                product_id: None,
                product_type: None,
                protocol_label: None,
                last_flag: None,
                last_raw_payload: None,
                last_push_time: None,
            });

        merge(&mut device.owner_external_id, &frame.owner_external_id);
        merge(&mut device.parent_user_id, &meta.parent_user_id);
        merge(&mut device.device_name, &meta.device_name);
        merge(&mut device.device_no, &meta.device_no);
        merge(&mut device.group_id, &meta.group_id);
        merge(&mut device.lat, &meta.lat);
        merge(&mut device.lng, &meta.lng);
        merge(&mut device.product_id, &meta.product_id);
        merge(&mut device.product_type, &meta.product_type);
        merge(&mut device.protocol_label, &meta.protocol_label);
        device.last_flag = frame.flag.clone();
        device.last_raw_payload = frame.raw_payload.clone();
        device.last_push_time = Some(frame.pushed_at);

        device.id
    }

    fn upsert_sensor(&mut self, device_id: i64, r: &SensorReadingInput) -> i64 {
        let Inner { next_id, sensors, .. } = self;
        let sensor = sensors
            .entry((device_id, r.sensor_external_id))
            .or_insert_with(|| Sensor {
                id: bump(next_id),
                device_id,
                external_id: r.sensor_external_id,
                sensor_type_id: None,
                sensor_name: None,
                unit: None,
                latest_value: None,
                latest_recorded_at: None,
                is_alarm: None,
                is_line: None,
            });
        merge(&mut sensor.sensor_type_id, &r.sensor_type_id);
        merge(&mut sensor.sensor_name, &r.sensor_name);
        merge(&mut sensor.unit, &r.unit);

        let newer = sensor
            .latest_recorded_at
            .map_or(true, |current| current <= r.recorded_at);
        if newer {
            sensor.latest_value = r.latest_value().map(str::to_string);
            sensor.latest_recorded_at = Some(r.recorded_at);
            merge(&mut sensor.is_alarm, &r.is_alarm);
            merge(&mut sensor.is_line, &r.is_line);
        }

        sensor.id
    }

    fn insert_reading(&mut self, sensor_id: i64, r: &SensorReadingInput, raw_payload: &Option<String>) -> bool {
        let key = (sensor_id, r.recorded_at, r.sensor_timestamp_key().to_string());
        if !self.reading_keys.insert(key) {
            return false;
        }

        let id = bump(&mut self.next_id);
        self.readings.push(SensorReading {
            id,
            sensor_id,
            recorded_at: r.recorded_at,
            sensor_timestamp: r.sensor_timestamp_key().to_string(),
            is_alarm: r.is_alarm,
            is_line: r.is_line,
            raw_value: r.raw_value.clone(),
            scaled_value: r.scaled_value.clone(),
            raw_payload: raw_payload.clone(),
        });
        true
    }
}

fn merge<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if let Some(v) = incoming {
        *slot = Some(v.clone());
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn readings(&self) -> Vec<SensorReading> {
        self.inner.lock().await.readings.clone()
    }

    pub async fn sensor(&self, device_external_id: i64, sensor_external_id: i64) -> Option<Sensor> {
        let inner = self.inner.lock().await;
        let device_id = inner.devices.get(&device_external_id)?.id;
        inner.sensors.get(&(device_id, sensor_external_id)).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn reconcile(&self, frame: &CanonicalFrame) -> Result<ReconcileOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let device_id = inner.upsert_device(frame);
        let mut outcome = ReconcileOutcome::default();
        for reading in &frame.readings {
            let sensor_id = inner.upsert_sensor(device_id, reading);
            if inner.insert_reading(sensor_id, reading, &frame.raw_payload) {
                outcome.stored += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        Ok(outcome)
    }

    async fn latest_snapshots(
        &self,
        sensor_ids: Option<&[i64]>,
    ) -> Result<Vec<SensorSnapshot>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;

        let mut rows: Vec<SensorSnapshot> = inner
            .sensors
            .values()
            .filter(|s| s.latest_value.is_some())
            .filter(|s| sensor_ids.map_or(true, |ids| ids.contains(&s.external_id)))
            .filter_map(|s| {
                let device = inner.devices.values().find(|d| d.id == s.device_id)?;
                Some(SensorSnapshot {
                    sensor_external_id: s.external_id,
                    device_external_id: device.external_id,
                    sensor_name: s.sensor_name.clone(),
                    device_name: device.device_name.clone(),
                    latest_value: s.latest_value.clone(),
                    latest_recorded_at: s.latest_recorded_at,
                    last_push_time: device.last_push_time,
                })
            })
            .collect();
        rows.sort_by_key(|r| r.sensor_external_id);

        Ok(rows)
    }

    async fn device(&self, external_id: i64) -> Result<Option<Device>, StoreError> {
        self.check_available()?;
        Ok(self.inner.lock().await.devices.get(&external_id).cloned())
    }

    async fn device_sensors(&self, device_external_id: i64) -> Result<Vec<Sensor>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let Some(device) = inner.devices.get(&device_external_id) else {
            return Ok(Vec::new());
        };

        Ok(inner
            .sensors
            .range((device.id, i64::MIN)..=(device.id, i64::MAX))
            .map(|(_, s)| s.clone())
            .collect())
    }
}
