//! Periodic pull of the vendor's device/sensor snapshot.

use std::{sync::Arc, time::Duration};

use reqwest::{header, StatusCode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::{HttpMethod, VendorConfig},
    pipeline::Pipeline,
    scheduler::run_periodic,
    sinks::atg_export::AtgExporter,
    transform::{normalize_poll_response, NormalizeError, POLL_FIELDS},
};

use super::oauth::{TokenError, TokenLease, TokenManager};

const VENDOR_OK_FLAG: &str = "00";

#[derive(thiserror::Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("vendor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vendor answered {0}")]
    Status(StatusCode),
    #[error("vendor returned flag {flag:?}: {message}")]
    Vendor { flag: Option<String>, message: String },
    #[error("vendor response malformed: {0}")]
    Malformed(#[from] NormalizeError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub devices: usize,
    pub readings: u64,
    pub defects: usize,
    /// Devices that failed to normalize or to reconcile.
    pub failed_devices: usize,
}

pub struct PollClient {
    cfg: VendorConfig,
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    pipeline: Arc<Pipeline>,
    exporter: Option<Arc<AtgExporter>>,
    clock: Arc<dyn Clock>,
}

impl PollClient {
    pub fn new(
        cfg: VendorConfig,
        tokens: Arc<TokenManager>,
        pipeline: Arc<Pipeline>,
        exporter: Option<Arc<AtgExporter>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PollError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            cfg,
            http,
            tokens,
            pipeline,
            exporter,
            clock,
        })
    }

    /// Fetch the raw snapshot. A 401 drops the cached token and the request
    /// is retried once with a fresh one.
    pub async fn fetch_snapshot(&self) -> Result<Value, PollError> {
        let lease = self.tokens.get_token().await?;
        let mut response = self.send(&lease).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("vendor rejected the access token; refreshing and retrying");
            self.tokens.invalidate();
            let lease = self.tokens.get_token().await?;
            response = self.send(&lease).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status));
        }

        let body: Value = response.json().await?;
        let flag = body.get("flag").and_then(|f| match f {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        if flag.as_deref() != Some(VENDOR_OK_FLAG) {
            let message = body
                .get("msg")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string();
            return Err(PollError::Vendor { flag, message });
        }

        Ok(body)
    }

    async fn send(&self, lease: &TokenLease) -> Result<reqwest::Response, PollError> {
        let url = self.cfg.snapshot_url();
        let request = match self.cfg.http_method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
        };
        let mut request = request
            .header(header::AUTHORIZATION, lease.authorization())
            .json(&json!({
                "userId": self.cfg.account_number,
                "currPage": 1,
                "pageSize": self.cfg.page_size,
            }));
        if !self.cfg.app_id.is_empty() {
            request = request.header("tlinkAppId", &self.cfg.app_id);
        }
        Ok(request.send().await?)
    }

    /// One poll cycle: fetch, ingest every device, then export when at
    /// least one device reconciled.
    pub async fn tick(&self) -> Result<PollSummary, PollError> {
        let mut summary = PollSummary::default();
        if self.cfg.account_number == 0 {
            tracing::debug!("vendor poll skipped: no account configured");
            return Ok(summary);
        }

        let body = self.fetch_snapshot().await?;
        let owner = self.cfg.account_number.to_string();
        let received_at = self.clock.now();
        let frames = normalize_poll_response(&body, received_at, Some(&owner))?;
        // Present whenever normalization succeeded; results are in `dataList` order.
        let raw_devices = body.get("dataList").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();

        let mut reconciled = 0usize;
        for (index, result) in frames.into_iter().enumerate() {
            summary.devices += 1;
            let normalized = match result {
                Ok(n) => n,
                Err(e) => {
                    summary.failed_devices += 1;
                    let device_id = raw_devices.get(index).and_then(|d| POLL_FIELDS.device_id_of(d));
                    tracing::warn!(error = %e, ?device_id, "skipping malformed vendor device");
                    if let Some(device_id) = device_id {
                        self.pipeline.log_rejected(device_id, received_at, e.to_string()).await;
                    }
                    continue;
                }
            };
            let device_id = normalized.frame.device_external_id;
            match self.pipeline.ingest(normalized).await {
                Ok(outcome) => {
                    reconciled += 1;
                    summary.readings += outcome.stored;
                    summary.defects += outcome.defects;
                }
                Err(e) => {
                    summary.failed_devices += 1;
                    tracing::error!(error = %e, device_id, "failed to ingest polled device");
                }
            }
        }

        if reconciled > 0 {
            if let Some(exporter) = &self.exporter {
                // Export failures are logged by the exporter and never fail the tick.
                let _ = exporter.export_cycle().await;
            }
        }

        Ok(summary)
    }

    /// Poll every `period` until cancelled.
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        run_periodic("vendor-poll", period, cancel, move || {
            let client = self.clone();
            async move {
                match client.tick().await {
                    Ok(summary) => {
                        metrics::counter!("poll_ticks_total", "outcome" => "ok").increment(1);
                        tracing::info!(
                            devices = summary.devices,
                            readings = summary.readings,
                            defects = summary.defects,
                            failed_devices = summary.failed_devices,
                            "vendor poll finished"
                        );
                    }
                    Err(e) => {
                        metrics::counter!("poll_ticks_total", "outcome" => "error").increment(1);
                        tracing::error!(error = %e, "vendor poll failed");
                    }
                }
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use telemetry_store::{MemoryStore, Store};
    use time::macros::datetime;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::{ExportConfig, OAuthConfig},
        sinks::log_store::{LogStatus, LogStore, TimeRange},
        sources::oauth::{Grant, TokenEndpoint, TokenResponse},
    };

    struct CountingEndpoint {
        issued: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn request(&self, _grant: &Grant) -> Result<TokenResponse, TokenError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenResponse {
                access_token: format!("t{n}"),
                expires_in: 3600,
                refresh_token: None,
                token_type: Some("Bearer".to_string()),
            })
        }
    }

    #[derive(Clone)]
    struct Vendor {
        /// Tokens the vendor accepts.
        accept: Arc<Mutex<Vec<String>>>,
        seen: Arc<Mutex<Vec<(String, Value)>>>,
        body: Value,
    }

    async fn snapshot(State(vendor): State<Vendor>, headers: HeaderMap, Json(req): Json<Value>) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        vendor.seen.lock().unwrap().push((auth.clone(), req));
        if !vendor.accept.lock().unwrap().contains(&auth) {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"error": "expired"})));
        }
        (AxumStatus::OK, Json(vendor.body.clone()))
    }

    async fn spawn_vendor(vendor: Vendor) -> String {
        let app = Router::new()
            .route("/api/device/getDeviceSensorDatas", get(snapshot).post(snapshot))
            .with_state(vendor);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn vendor_body() -> Value {
        json!({
            "flag": "00",
            "dataList": [
                {
                    "id": 2864,
                    "deviceName": "Station 1",
                    "updateDate": "2024-03-01 07:59:00",
                    "sensorsList": [
                        {"id": 11922, "value": "812", "unit": "mm"},
                        {"id": 11923, "value": "bad"}
                    ]
                },
                {"id": 2865, "sensorsList": []}
            ]
        })
    }

    async fn spawn_export_sink() -> (String, Arc<Mutex<Vec<Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/atg",
                axum::routing::post(
                    |State(seen): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        seen.lock().unwrap().push(body);
                        AxumStatus::OK
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/atg"), received)
    }

    struct Harness {
        client: PollClient,
        store: Arc<MemoryStore>,
        log: Arc<LogStore>,
        endpoint: Arc<CountingEndpoint>,
        _dir: tempfile::TempDir,
    }

    fn harness(base_url: String, account_number: i64) -> Harness {
        harness_with_export(base_url, account_number, None)
    }

    /// `export_endpoint` enables the tank export against that URL.
    fn harness_with_export(base_url: String, account_number: i64, export_endpoint: Option<String>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 08:00:00 UTC)));
        let endpoint = Arc::new(CountingEndpoint {
            issued: AtomicUsize::new(0),
        });
        let tokens = Arc::new(TokenManager::new(&OAuthConfig::default(), endpoint.clone(), clock.clone()));
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(LogStore::new(dir.path()));
        let pipeline = Arc::new(Pipeline::new(store.clone(), log.clone()));
        let export = ExportConfig {
            enabled: export_endpoint.is_some(),
            endpoint: export_endpoint.unwrap_or_default(),
            ..ExportConfig::default()
        };
        let exporter = Arc::new(AtgExporter::new(export, store.clone(), clock.clone()).unwrap());
        let cfg = VendorConfig {
            base_url,
            account_number,
            app_id: "app-1".to_string(),
            ..VendorConfig::default()
        };
        let client = PollClient::new(cfg, tokens, pipeline, Some(exporter), clock).unwrap();
        Harness {
            client,
            store,
            log,
            endpoint,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn tick_ingests_every_device() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(vec!["Bearer t1".to_string()])),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: vendor_body(),
        };
        let h = harness(spawn_vendor(vendor.clone()).await, 200);

        let summary = h.client.tick().await.unwrap();
        assert_eq!(
            summary,
            PollSummary {
                devices: 2,
                readings: 1,
                defects: 1,
                failed_devices: 1,
            }
        );

        let sensor = h.store.sensor(2864, 11922).await.unwrap();
        assert_eq!(sensor.latest_value.as_deref(), Some("812"));

        let seen = vendor.seen.lock().unwrap();
        assert_eq!(seen[0].1, json!({"userId": 200, "currPage": 1, "pageSize": 10}));
    }

    #[tokio::test]
    async fn rejected_device_is_logged_as_error() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(vec!["Bearer t1".to_string()])),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: vendor_body(),
        };
        let h = harness(spawn_vendor(vendor).await, 200);
        h.client.tick().await.unwrap();

        let q = h.log.read(2865, TimeRange::default(), 10).await.unwrap();
        assert_eq!(q.records.len(), 1);
        assert_eq!(q.records[0].status, LogStatus::Error);
        assert_eq!(q.records[0].timestamp, datetime!(2024-03-01 08:00:00 UTC));
        assert!(q.records[0].message.is_some());

        let ok = h.log.read(2864, TimeRange::default(), 10).await.unwrap();
        assert!(ok.records.iter().all(|r| r.status == LogStatus::Success));
    }

    #[tokio::test]
    async fn successful_tick_posts_one_export() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(vec!["Bearer t1".to_string()])),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: vendor_body(),
        };
        let (sink, posted) = spawn_export_sink().await;
        let h = harness_with_export(spawn_vendor(vendor).await, 200, Some(sink));

        h.client.tick().await.unwrap();

        let posted = posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        let tanks = posted[0]["atgInfo"].as_array().unwrap();
        assert_eq!(tanks.len(), 1);
        assert_eq!(tanks[0]["sensorId"], 11922);
    }

    #[tokio::test]
    async fn tick_without_a_reconciled_device_does_not_export() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(vec!["Bearer t1".to_string()])),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: json!({
                "flag": "00",
                "dataList": [
                    {"id": 2865, "sensorsList": []},
                    {"sensorsList": [{"id": 1, "value": "3"}]},
                    {"id": 2866}
                ]
            }),
        };
        let (sink, posted) = spawn_export_sink().await;
        let h = harness_with_export(spawn_vendor(vendor).await, 200, Some(sink));

        // exportable data already in the store must not trigger an export on its own
        let seed = normalize_poll_response(&vendor_body(), datetime!(2024-03-01 07:59:30 UTC), None).unwrap();
        for frame in seed.into_iter().flatten() {
            h.store.reconcile(&frame.frame).await.unwrap();
        }

        let summary = h.client.tick().await.unwrap();
        assert_eq!(summary.devices, 3);
        assert_eq!(summary.failed_devices, 3);
        assert!(posted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once_and_retries() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(vec!["Bearer t2".to_string()])),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: vendor_body(),
        };
        let h = harness(spawn_vendor(vendor.clone()).await, 200);

        h.client.tick().await.unwrap();
        assert_eq!(h.endpoint.issued.load(Ordering::SeqCst), 2);
        let auths: Vec<String> = vendor.seen.lock().unwrap().iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(auths, vec!["Bearer t1", "Bearer t2"]);
    }

    #[tokio::test]
    async fn persistent_unauthorized_fails_the_tick() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(Vec::new())),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: vendor_body(),
        };
        let h = harness(spawn_vendor(vendor.clone()).await, 200);

        let err = h.client.tick().await.unwrap_err();
        assert!(matches!(err, PollError::Status(s) if s == StatusCode::UNAUTHORIZED));
        assert_eq!(vendor.seen.lock().unwrap().len(), 2);
        assert!(h.store.readings().await.is_empty());
    }

    #[tokio::test]
    async fn vendor_error_flag_is_an_error() {
        let vendor = Vendor {
            accept: Arc::new(Mutex::new(vec!["Bearer t1".to_string()])),
            seen: Arc::new(Mutex::new(Vec::new())),
            body: json!({"flag": "01", "msg": "account locked"}),
        };
        let h = harness(spawn_vendor(vendor).await, 200);

        let err = h.client.tick().await.unwrap_err();
        match err {
            PollError::Vendor { flag, message } => {
                assert_eq!(flag.as_deref(), Some("01"));
                assert_eq!(message, "account locked");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_account_means_no_request() {
        // nothing listens here; a request would fail the tick
        let h = harness("http://127.0.0.1:9".to_string(), 0);
        assert_eq!(h.client.tick().await.unwrap(), PollSummary::default());
        assert_eq!(h.endpoint.issued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_vendor_fails_the_tick() {
        let h = harness("http://127.0.0.1:9".to_string(), 200);
        assert!(matches!(h.client.tick().await, Err(PollError::Http(_))));
    }
}
