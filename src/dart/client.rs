// src/dart/client.rs
use crate::dart::models::{ApiResponse, Division, FetchKey, StatementRow};
use crate::dart::rate_limiter::RateLimiter;
use crate::utils::error::DartError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const DART_API_BASE: &str = "https://opendart.fss.or.kr/api";
const DART_USER_AGENT: &str = "dart_downloader/0.1";

/// `reprt_code` of the annual business report (사업보고서).
pub const REPORT_CODE_ANNUAL: &str = "11011";
const STATUS_OK: &str = "000";
const STATUS_NO_DATA: &str = "013";

/// Phrases DART uses when a key has hit its daily/per-minute allowance.
const QUOTA_KEYWORDS: [&str; 6] = ["일일", "사용량", "제한", "초과", "limit", "트래픽"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Stop issuing requests for this API key.
    Quota,
    /// Anything else; an ordinary miss for the key being fetched.
    Other,
}

/// Classifies the `message` of a non-"000" response.
///
/// Quota detection is plain substring matching on the phrases above (ASCII is
/// compared case-insensitively). Keep every quota rule in this function.
pub fn classify_message(message: &str) -> MessageClass {
    let lowered = message.to_lowercase();
    if QUOTA_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        MessageClass::Quota
    } else {
        MessageClass::Other
    }
}

/// Anything able to return statement rows for one company/year/division.
#[async_trait]
pub trait StatementSource: Send + Sync {
    /// Rows for a single FetchKey. `Ok(vec![])` means "no data".
    async fn fetch_division(
        &self,
        corp_code: &str,
        year: u16,
        division: Division,
    ) -> Result<Vec<StatementRow>, DartError>;

    /// Tries `order` until a division returns rows. Fatal errors stop the
    /// fallback; other errors fall through to the next division and are only
    /// reported if no division produced rows.
    async fn fetch_with_fallback(
        &self,
        corp_code: &str,
        year: u16,
        order: &[Division],
    ) -> Result<Vec<StatementRow>, DartError> {
        let mut last_err = None;
        for &division in order {
            match self.fetch_division(corp_code, year, division).await {
                Ok(rows) if !rows.is_empty() => return Ok(rows),
                Ok(_) => {
                    tracing::debug!("No {} data for {}/{}", division, corp_code, year);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!("{} fetch for {}/{} failed: {}", division, corp_code, year, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// Consolidated first, separate if consolidated has nothing.
    async fn fetch(&self, corp_code: &str, year: u16) -> Result<Vec<StatementRow>, DartError> {
        self.fetch_with_fallback(corp_code, year, &Division::ALL).await
    }
}

#[async_trait]
impl<T: StatementSource + ?Sized> StatementSource for &T {
    async fn fetch_division(
        &self,
        corp_code: &str,
        year: u16,
        division: Division,
    ) -> Result<Vec<StatementRow>, DartError> {
        (**self).fetch_division(corp_code, year, division).await
    }
}

/// Retry policy for one statement request.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Creates a reqwest client configured for DART interaction.
pub fn build_dart_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(DART_USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Statement fetcher backed by the DART `fnlttSinglAcntAll` endpoint.
pub struct DartClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<RateLimiter>,
    policy: FetchPolicy,
}

impl DartClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        limiter: Arc<RateLimiter>,
        policy: FetchPolicy,
    ) -> Result<Self, DartError> {
        let http = build_dart_client(policy.timeout)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            limiter,
            policy,
        })
    }

    /// One rate-limited request, no retries.
    async fn request_once(&self, key: &FetchKey) -> Result<Vec<StatementRow>, DartError> {
        self.limiter.acquire().await;

        let url = format!("{}/fnlttSinglAcntAll.json", self.base_url);
        let year = key.bsns_year.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("crtfc_key", self.api_key.as_str()),
                ("corp_code", key.corp_code.as_str()),
                ("bsns_year", year.as_str()),
                ("reprt_code", REPORT_CODE_ANNUAL),
                ("fs_div", key.fs_div.code()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::error!("Received 429 Too Many Requests for {}", key);
            return Err(DartError::QuotaExceeded(format!("HTTP 429 for {}", key)));
        }
        if !status.is_success() {
            tracing::warn!("HTTP error status: {} for {}", status, key);
            return Err(DartError::Http(status));
        }

        let body = response.text().await?;
        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| DartError::Parse(format!("{} ({})", e, key)))?;
        interpret_response(parsed, key)
    }
}

/// Maps a decoded response body to rows, "no data", or an error.
pub fn interpret_response(response: ApiResponse, key: &FetchKey) -> Result<Vec<StatementRow>, DartError> {
    match response.status.as_str() {
        STATUS_OK => Ok(response
            .list
            .into_iter()
            .filter_map(|item| item.into_row(key))
            .collect()),
        STATUS_NO_DATA => Ok(Vec::new()),
        _ => match classify_message(&response.message) {
            MessageClass::Quota => Err(DartError::QuotaExceeded(format!(
                "status {}: {}",
                response.status, response.message
            ))),
            MessageClass::Other => Err(DartError::Api {
                status: response.status,
                message: response.message,
            }),
        },
    }
}

#[async_trait]
impl StatementSource for DartClient {
    async fn fetch_division(
        &self,
        corp_code: &str,
        year: u16,
        division: Division,
    ) -> Result<Vec<StatementRow>, DartError> {
        let key = FetchKey::new(corp_code, year, division);
        let attempts = self.policy.max_retries + 1;

        for attempt in 1..=attempts {
            match self.request_once(&key).await {
                Ok(rows) => {
                    tracing::debug!("{}: {} rows", key, rows.len());
                    return Ok(rows);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if attempt < attempts && e.is_transient() => {
                    tracing::debug!("{} attempt {}/{} failed: {}", key, attempt, attempts, e);
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                // An unexplained status is an ordinary miss once retries run out.
                Err(DartError::Api { status, message }) => {
                    tracing::debug!("{}: giving up on status {} ({})", key, status, message);
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Vec::new())
    }
}
