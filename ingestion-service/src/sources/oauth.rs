//! Bearer token cache for the vendor API.
//!
//! A cached lease is handed out without I/O while it has more than
//! `refresh_buffer` left. Otherwise exactly one caller refreshes; everyone
//! who queued behind it gets that refresh's lease or its error.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{clock::Clock, config::OAuthConfig};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
    #[error("token endpoint answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed token response: {0}")]
    Malformed(String),
    #[error("token acquisition failed after {attempts} attempt(s): {last}")]
    Acquisition { attempts: u32, last: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: OffsetDateTime,
}

impl TokenLease {
    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Password,
    Refresh(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unset,
    Valid,
    Expiring,
    Refreshing,
    Failed,
}

#[async_trait::async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn request(&self, grant: &Grant) -> Result<TokenResponse, TokenError>;
}

/// OAuth 2.0 token endpoint: client credentials as Basic auth, grant
/// parameters form-encoded.
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    cfg: OAuthConfig,
}

impl HttpTokenEndpoint {
    pub fn new(cfg: OAuthConfig, timeout: Duration) -> Result<Self, TokenError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::Transport(e.to_string()))?;
        Ok(Self { http, cfg })
    }
}

#[async_trait::async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request(&self, grant: &Grant) -> Result<TokenResponse, TokenError> {
        let mut form: Vec<(&str, &str)> = match grant {
            Grant::Password => vec![
                ("grant_type", "password"),
                ("username", self.cfg.username.as_str()),
                ("password", self.cfg.password.as_str()),
            ],
            Grant::Refresh(token) => vec![("grant_type", "refresh_token"), ("refresh_token", token.as_str())],
        };
        if let Some(scope) = self.cfg.scope.as_deref() {
            form.push(("scope", scope));
        }

        let response = self
            .http
            .post(&self.cfg.token_url)
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

struct FailedCycle {
    epoch: u64,
    error: TokenError,
}

pub struct TokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    refresh_buffer: time::Duration,
    max_attempts: u32,
    backoff: Duration,
    backoff_cap: Duration,
    lease: RwLock<Option<Arc<TokenLease>>>,
    /// Held for the whole refresh; remembers the last failed cycle so
    /// callers that queued behind it share its error.
    refresh_gate: Mutex<Option<FailedCycle>>,
    /// Completed refresh cycles, successful or not.
    epoch: AtomicU64,
    refreshing: AtomicBool,
    failed: AtomicBool,
}

impl TokenManager {
    pub fn new(cfg: &OAuthConfig, endpoint: Arc<dyn TokenEndpoint>, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoint,
            clock,
            refresh_buffer: time::Duration::seconds(cfg.refresh_buffer_secs.max(0)),
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms),
            lease: RwLock::new(None),
            refresh_gate: Mutex::new(None),
            epoch: AtomicU64::new(0),
            refreshing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub async fn get_token(&self) -> Result<Arc<TokenLease>, TokenError> {
        if let Some(lease) = self.fresh_lease() {
            return Ok(lease);
        }

        let observed = self.epoch.load(Ordering::SeqCst);
        let mut gate = self.refresh_gate.lock().await;

        if let Some(lease) = self.fresh_lease() {
            return Ok(lease);
        }
        if let Some(failed) = gate.as_ref() {
            if failed.epoch > observed {
                return Err(failed.error.clone());
            }
        }

        self.refreshing.store(true, Ordering::SeqCst);
        let result = self.refresh_with_retry().await;
        self.refreshing.store(false, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        match result {
            Ok(lease) => {
                *self.lease.write().unwrap_or_else(PoisonError::into_inner) = Some(lease.clone());
                *gate = None;
                self.failed.store(false, Ordering::SeqCst);
                metrics::counter!("oauth_refresh_total", "outcome" => "success").increment(1);
                tracing::info!(expires_at = %lease.expires_at, "vendor token refreshed");
                Ok(lease)
            }
            Err(error) => {
                *gate = Some(FailedCycle {
                    epoch,
                    error: error.clone(),
                });
                self.failed.store(true, Ordering::SeqCst);
                metrics::counter!("oauth_refresh_total", "outcome" => "failure").increment(1);
                tracing::error!(error = %error, "vendor token acquisition failed");
                Err(error)
            }
        }
    }

    /// Forget the cached lease, e.g. after the vendor rejected it.
    pub fn invalidate(&self) {
        *self.lease.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn state(&self) -> TokenState {
        if self.refreshing.load(Ordering::SeqCst) {
            return TokenState::Refreshing;
        }
        let lease = self.lease.read().unwrap_or_else(PoisonError::into_inner).clone();
        match lease {
            Some(lease) if self.is_fresh(&lease) => TokenState::Valid,
            _ if self.failed.load(Ordering::SeqCst) => TokenState::Failed,
            Some(_) => TokenState::Expiring,
            None => TokenState::Unset,
        }
    }

    fn is_fresh(&self, lease: &TokenLease) -> bool {
        lease.expires_at - self.clock.now() > self.refresh_buffer
    }

    fn fresh_lease(&self) -> Option<Arc<TokenLease>> {
        let guard = self.lease.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().filter(|l| self.is_fresh(l)).cloned()
    }

    async fn refresh_with_retry(&self) -> Result<Arc<TokenLease>, TokenError> {
        let mut refresh_token = self
            .lease
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|l| l.refresh_token.clone());

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let result = match refresh_token.take() {
                Some(token) => match self.endpoint.request(&Grant::Refresh(token.clone())).await {
                    Ok(response) => Ok((response, Some(token))),
                    Err(e) => {
                        tracing::warn!(error = %e, "refresh grant failed, falling back to password grant");
                        self.endpoint.request(&Grant::Password).await.map(|r| (r, None))
                    }
                },
                None => self.endpoint.request(&Grant::Password).await.map(|r| (r, None)),
            };

            match result {
                Ok((response, previous_refresh)) => return Ok(Arc::new(self.lease_from(response, previous_refresh))),
                Err(e) if attempt < self.max_attempts => {
                    let sleep_for = self.backoff_for(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        backoff_ms = sleep_for.as_millis() as u64,
                        "token request failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    return Err(TokenError::Acquisition {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
            }
        }
    }

    /// `backoff · 2^(attempt-1)`, capped.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.backoff_cap)
    }

    fn lease_from(&self, response: TokenResponse, previous_refresh: Option<String>) -> TokenLease {
        TokenLease {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh),
            token_type: response
                .token_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Bearer".to_string()),
            expires_at: self.clock.now() + time::Duration::seconds(response.expires_in),
        }
    }
}
