//! Tank-level export: latest probe readings -> liquid volume batch POSTed
//! to the downstream ATG sink.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use telemetry_store::{domain::SensorSnapshot, Store, StoreError};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    clock::Clock,
    config::ExportConfig,
    transform::tank::{GeometryError, TankGeometry},
};

#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("failed to read latest readings: {0}")]
    Store(#[from] StoreError),
    #[error("export request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("export sink answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TankExportRecord {
    /// 1-based position in the batch.
    pub id: usize,
    pub sensor_id: i64,
    pub sensor_name: String,
    pub state_info: &'static str,
    pub oil_type: String,
    /// Probe depth in mm.
    pub level: f64,
    pub max_volume: f64,
    pub oil_ratio: f64,
    #[serde(rename = "connect")]
    pub is_connected: bool,
    pub temperature: f64,
    pub volume: f64,
    #[serde(rename = "volumeTC")]
    pub volume_tc: f64,
    pub water_level: f64,
    pub water_ratio: f64,
    pub water_volume: f64,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AtgBatch {
    /// Epoch milliseconds.
    pub time: i64,
    pub atg_info: Vec<TankExportRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Disabled,
    Empty,
    Sent { tanks: usize },
}

pub struct AtgExporter {
    cfg: ExportConfig,
    store: Arc<dyn Store>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl AtgExporter {
    pub fn new(cfg: ExportConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self, ExportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            cfg,
            store,
            http,
            clock,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled && !self.cfg.endpoint.trim().is_empty()
    }

    /// Read the latest readings, build a batch and POST it.
    pub async fn export_cycle(&self) -> Result<ExportOutcome, ExportError> {
        if !self.is_enabled() {
            tracing::debug!("tank export disabled");
            return Ok(ExportOutcome::Disabled);
        }

        let filter = (!self.cfg.sensor_ids.is_empty()).then_some(self.cfg.sensor_ids.as_slice());
        let snapshots = self.store.latest_snapshots(filter).await?;
        let batch = self.build_batch(&snapshots, self.clock.now());
        if batch.atg_info.is_empty() {
            tracing::debug!("tank export skipped: no tank data available");
            metrics::counter!("atg_export_total", "outcome" => "empty").increment(1);
            return Ok(ExportOutcome::Empty);
        }

        let tanks = batch.atg_info.len();
        let result = self.post(&batch).await;
        match &result {
            Ok(()) => {
                metrics::counter!("atg_export_total", "outcome" => "sent").increment(1);
                tracing::info!(tanks, endpoint = %self.cfg.endpoint, "tank export posted");
            }
            Err(e) => {
                metrics::counter!("atg_export_total", "outcome" => "failed").increment(1);
                tracing::error!(error = %e, endpoint = %self.cfg.endpoint, "tank export failed");
            }
        }
        result.map(|()| ExportOutcome::Sent { tanks })
    }

    async fn post(&self, batch: &AtgBatch) -> Result<(), ExportError> {
        let response = self.http.post(&self.cfg.endpoint).json(batch).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status(status));
        }
        Ok(())
    }

    pub fn build_batch(&self, snapshots: &[SensorSnapshot], now: OffsetDateTime) -> AtgBatch {
        let mut atg_info = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            match self.tank_record(snapshot, now, atg_info.len() + 1) {
                Ok(Some(record)) => atg_info.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    error = %e,
                    sensor_id = snapshot.sensor_external_id,
                    "skipping sensor with invalid tank geometry"
                ),
            }
        }

        AtgBatch {
            time: (now.unix_timestamp_nanos() / 1_000_000) as i64,
            atg_info,
        }
    }

    fn tank_record(
        &self,
        snapshot: &SensorSnapshot,
        now: OffsetDateTime,
        position: usize,
    ) -> Result<Option<TankExportRecord>, GeometryError> {
        let sensor_id = snapshot.sensor_external_id;
        let Some(probe_mm) = snapshot
            .latest_value
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
        else {
            tracing::debug!(sensor_id, value = ?snapshot.latest_value, "skipping sensor with non-numeric reading");
            return Ok(None);
        };

        let geometry = self.geometry_for(sensor_id)?;
        let volume = geometry.volume_liters(probe_mm);
        let capacity = geometry.capacity_liters();
        let ratio = if capacity > 0.0 {
            (volume / capacity).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let sensor_name = [&snapshot.sensor_name, &snapshot.device_name]
            .into_iter()
            .flatten()
            .map(|n| n.trim())
            .find(|n| !n.is_empty())
            .map_or_else(|| format!("Sensor {sensor_id}"), str::to_string);
        let oil_type = self.oil_type_for(sensor_id);
        let density = self.density_for(&oil_type);

        Ok(Some(TankExportRecord {
            id: position,
            sensor_id,
            sensor_name,
            state_info: state_from_ratio(ratio),
            oil_type,
            level: round_to(probe_mm, 2),
            max_volume: round_to(capacity, 2),
            oil_ratio: round_to(ratio, 4),
            is_connected: is_connected(snapshot.last_push_time, now, self.cfg.connect_ttl_secs),
            temperature: round_to(self.cfg.default_temperature, 2),
            volume: round_to(volume, 2),
            volume_tc: round_to(volume, 2),
            water_level: 0.0,
            water_ratio: 0.0,
            water_volume: 0.0,
            weight: round_to(volume * density, 2),
            timestamp: snapshot.latest_recorded_at.and_then(|ts| ts.format(&Rfc3339).ok()),
        }))
    }

    fn geometry_for(&self, sensor_id: i64) -> Result<TankGeometry, GeometryError> {
        let length = if self.cfg.long_sensor_ids.contains(&sensor_id) {
            self.cfg.long_length_cm
        } else {
            self.cfg.short_length_cm
        };
        TankGeometry::new(self.cfg.width_cm, self.cfg.height_cm, length, self.cfg.wall_thickness_cm)
    }

    fn oil_type_for(&self, sensor_id: i64) -> String {
        self.cfg
            .sensor_oil_types
            .get(&sensor_id.to_string())
            .unwrap_or(&self.cfg.default_oil_type)
            .clone()
    }

    fn density_for(&self, oil_type: &str) -> f64 {
        self.cfg
            .oil_densities
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(oil_type))
            .map_or(self.cfg.default_density, |(_, d)| *d)
    }
}

pub fn state_from_ratio(ratio: f64) -> &'static str {
    if ratio <= 0.1 {
        "Low low level alarm"
    } else if ratio <= 0.3 {
        "Low level alarm"
    } else if ratio >= 0.95 {
        "High level warning"
    } else {
        "Normal"
    }
}

/// A non-positive TTL disables the staleness check.
pub fn is_connected(last_push: Option<OffsetDateTime>, now: OffsetDateTime, ttl_secs: i64) -> bool {
    if ttl_secs <= 0 {
        return true;
    }
    match last_push {
        Some(last) => (now - last).whole_seconds() <= ttl_secs,
        None => false,
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
