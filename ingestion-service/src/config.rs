use serde::Deserialize;
use std::{collections::HashMap, fs};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub bind_addr: String,
    /// HMAC-SHA256 key for `X-TLink-Signature`. Empty disables verification.
    pub secret: String,
    pub max_body_bytes: usize,
    pub history_limit: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            secret: String::new(),
            max_body_bytes: 1024 * 1024,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    pub base_url: String,
    pub sensor_data_path: String,
    pub http_method: HttpMethod,
    /// Vendor account polled each tick; 0 disables the poll.
    pub account_number: i64,
    pub app_id: String,
    pub timeout_secs: u64,
    pub page_size: u32,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://app.dtuip.com".to_string(),
            sensor_data_path: "/api/device/getDeviceSensorDatas".to_string(),
            http_method: HttpMethod::Get,
            account_number: 0,
            app_id: String::new(),
            timeout_secs: 30,
            page_size: 10,
        }
    }
}

impl VendorConfig {
    pub fn snapshot_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.sensor_data_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub scope: Option<String>,
    pub refresh_buffer_secs: i64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: "https://app.dtuip.com/oauth/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            username: String::new(),
            password: String::new(),
            scope: None,
            refresh_buffer_secs: 60,
            max_attempts: 3,
            backoff_ms: 500,
            backoff_cap_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl PollConfig {
    pub const MIN_INTERVAL_SECS: u64 = 5;

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs.max(Self::MIN_INTERVAL_SECS))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    pub dir: String,
    pub retention_days: u32,
    pub sweep_interval_hours: u64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            retention_days: 90,
            sweep_interval_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Sensors to export; empty exports every sensor with a numeric latest value.
    pub sensor_ids: Vec<i64>,
    pub width_cm: f64,
    pub height_cm: f64,
    pub short_length_cm: f64,
    pub long_length_cm: f64,
    pub long_sensor_ids: Vec<i64>,
    pub wall_thickness_cm: f64,
    pub default_oil_type: String,
    /// Sensor external id (as a string key) to oil type.
    pub sensor_oil_types: HashMap<String, String>,
    pub default_density: f64,
    /// Lower-cased oil type to density in kg/L.
    pub oil_densities: HashMap<String, f64>,
    pub connect_ttl_secs: i64,
    pub default_temperature: f64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://supsopha.com/api/upload_atg_record.php".to_string(),
            timeout_secs: 10,
            sensor_ids: Vec::new(),
            width_cm: 155.0,
            height_cm: 155.0,
            short_length_cm: 246.0,
            long_length_cm: 492.0,
            long_sensor_ids: vec![6_026_176],
            wall_thickness_cm: 0.6,
            default_oil_type: "Gasoline".to_string(),
            sensor_oil_types: HashMap::from([("6026176".to_string(), "Diesel".to_string())]),
            default_density: 0.75,
            oil_densities: HashMap::from([
                ("diesel".to_string(), 0.84),
                ("gasoline".to_string(), 0.75),
            ]),
            connect_ttl_secs: 900,
            default_temperature: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub log_store: LogStoreConfig,
    #[serde(default)]
    pub export: ExportConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("INGESTION_CONFIG").unwrap_or_else(|_| "ingestion-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config '{path}': {e}"))?;
        let mut cfg = Self::from_toml_str(&contents)?;
        cfg.apply_env_overrides(|key| env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }

    /// Secrets may come from the environment instead of the config file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PUSH_WEBHOOK_SECRET") {
            self.webhook.secret = v;
        }
        if let Some(v) = lookup("TLINK_OAUTH_CLIENT_SECRET") {
            self.oauth.client_secret = v;
        }
        if let Some(v) = lookup("TLINK_OAUTH_PASSWORD") {
            self.oauth.password = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [database]
            uri = "postgres://localhost/telemetry"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.poll.interval_secs, 60);
        assert_eq!(cfg.log_store.retention_days, 90);
        assert_eq!(cfg.log_store.sweep_interval_hours, 12);
        assert_eq!(cfg.export.connect_ttl_secs, 900);
        assert_eq!(cfg.export.sensor_oil_types.get("6026176").map(String::as_str), Some("Diesel"));
        assert_eq!(cfg.vendor.http_method, HttpMethod::Get);
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [database]
            uri = "postgres://localhost/telemetry"

            [vendor]
            base_url = "http://vendor.test/"
            http_method = "POST"
            account_number = 200

            [export]
            sensor_ids = [1, 2]

            [export.oil_densities]
            kerosene = 0.8
            "#,
        )
        .unwrap();

        assert_eq!(cfg.vendor.http_method, HttpMethod::Post);
        assert_eq!(cfg.vendor.snapshot_url(), "http://vendor.test/api/device/getDeviceSensorDatas");
        assert_eq!(cfg.export.sensor_ids, vec![1, 2]);
        assert_eq!(cfg.export.oil_densities.get("kerosene"), Some(&0.8));
        assert!(cfg.export.oil_densities.get("diesel").is_none());
        // untouched fields of a partially specified section keep their defaults
        assert_eq!(cfg.export.width_cm, 155.0);
    }

    #[test]
    fn env_overrides_replace_secrets() {
        let mut cfg = AppConfig::from_toml_str(
            r#"
            [database]
            uri = "postgres://localhost/telemetry"

            [webhook]
            secret = "from-file"
            "#,
        )
        .unwrap();

        cfg.apply_env_overrides(|key| match key {
            "PUSH_WEBHOOK_SECRET" => Some("from-env".to_string()),
            _ => None,
        });

        assert_eq!(cfg.webhook.secret, "from-env");
        assert_eq!(cfg.oauth.password, "");
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let cfg = PollConfig {
            enabled: true,
            interval_secs: 1,
        };
        assert_eq!(cfg.interval(), std::time::Duration::from_secs(5));
    }
}
