//! Site collector contract, the collectors shipped with hrep, and the HTTP client
//! they share.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use hrep_core::{normalize_site_id, HotelConfig, ObservationDraft, RUN_DATE_FORMAT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrep-collectors";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("{0}")]
    Message(String),
    #[error("all {attempted} requests failed for {site}: {last_error}")]
    AllRequestsFailed {
        site: String,
        attempted: usize,
        last_error: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces raw score observations for one review site.
///
/// Implementations own their timeouts and politeness; an `Err` marks the whole site
/// as failed for this run.
#[async_trait]
pub trait SiteCollector: Send + Sync {
    fn site_id(&self) -> &str;

    async fn collect(
        &self,
        hotels: &[HotelConfig],
        run_date: NaiveDate,
    ) -> Result<Vec<ObservationDraft>, CollectorError>;
}

/// How a configured site is collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum CollectorSpec {
    /// Rows captured by hand or by an earlier export.
    Fixture {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    /// One JSON document per hotel; the score sits at `score_pointer`.
    HttpJson {
        #[serde(default)]
        url_template: Option<String>,
        score_pointer: String,
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
}

fn default_delay_ms() -> u64 {
    2_000
}

impl Default for CollectorSpec {
    fn default() -> Self {
        CollectorSpec::Fixture { dir: None }
    }
}

/// Shared resources handed to every collector built for a run.
#[derive(Debug, Clone)]
pub struct CollectorContext {
    pub run_id: Uuid,
    pub fixtures_dir: PathBuf,
    pub http: Arc<HttpFetcher>,
}

impl CollectorContext {
    pub fn new(fixtures_dir: impl Into<PathBuf>, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            run_id: Uuid::new_v4(),
            fixtures_dir: fixtures_dir.into(),
            http: Arc::new(HttpFetcher::new(http)?),
        })
    }
}

pub fn collector_for_site(
    site_id: &str,
    spec: &CollectorSpec,
    ctx: &CollectorContext,
) -> Box<dyn SiteCollector> {
    let site_id = normalize_site_id(site_id);
    match spec {
        CollectorSpec::Fixture { dir } => Box::new(FixtureCollector::new(
            site_id,
            dir.clone().unwrap_or_else(|| ctx.fixtures_dir.clone()),
        )),
        CollectorSpec::HttpJson {
            url_template,
            score_pointer,
            api_key_env,
            delay_ms,
        } => Box::new(HttpJsonCollector {
            site_id,
            run_id: ctx.run_id,
            fetcher: Arc::clone(&ctx.http),
            url_template: url_template.clone(),
            score_pointer: score_pointer.clone(),
            api_key_env: api_key_env.clone(),
            delay: Duration::from_millis(*delay_ms),
        }),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Rows(Vec<ObservationDraft>),
    Bundle(FixtureBundle),
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureBundle {
    #[serde(default)]
    site: Option<String>,
    #[serde(default)]
    captured_from: Option<String>,
    rows: Vec<ObservationDraft>,
}

/// Reads `<dir>/<SITE>/<run_date>.json`, falling back to `<dir>/<SITE>/latest.json`.
///
/// Rows from `latest.json` that carry no run date are stamped with the current one;
/// dated fixtures are passed through untouched.
#[derive(Debug, Clone)]
pub struct FixtureCollector {
    site_id: String,
    dir: PathBuf,
}

impl FixtureCollector {
    pub fn new(site_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            site_id: normalize_site_id(&site_id.into()),
            dir: dir.into(),
        }
    }

    fn site_dir(&self) -> PathBuf {
        self.dir.join(&self.site_id)
    }

    async fn read_fixture(&self, path: &Path) -> Result<Option<Vec<ObservationDraft>>, CollectorError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CollectorError::Message(format!(
                    "reading fixture {}: {err}",
                    path.display()
                )))
            }
        };
        let file: FixtureFile = serde_json::from_str(&text).map_err(|e| {
            CollectorError::Message(format!("parsing fixture {}: {e}", path.display()))
        })?;
        let rows = match file {
            FixtureFile::Rows(rows) => rows,
            FixtureFile::Bundle(bundle) => {
                if let Some(site) = bundle.site.as_deref() {
                    if normalize_site_id(site) != self.site_id {
                        return Err(CollectorError::Message(format!(
                            "fixture site={} does not match collector site={}",
                            site, self.site_id
                        )));
                    }
                }
                if let Some(origin) = &bundle.captured_from {
                    debug!(site = %self.site_id, origin = %origin, "fixture provenance");
                }
                bundle.rows
            }
        };
        Ok(Some(rows))
    }
}

#[async_trait]
impl SiteCollector for FixtureCollector {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    async fn collect(
        &self,
        _hotels: &[HotelConfig],
        run_date: NaiveDate,
    ) -> Result<Vec<ObservationDraft>, CollectorError> {
        let stamp = run_date.format(RUN_DATE_FORMAT).to_string();
        let dated = self.site_dir().join(format!("{stamp}.json"));
        if let Some(rows) = self.read_fixture(&dated).await? {
            info!(site = %self.site_id, path = %dated.display(), rows = rows.len(), "loaded dated fixture");
            return Ok(rows);
        }

        let latest = self.site_dir().join("latest.json");
        let Some(mut rows) = self.read_fixture(&latest).await? else {
            return Err(CollectorError::Message(format!(
                "no fixture for {} at {} or {}",
                self.site_id,
                dated.display(),
                latest.display()
            )));
        };
        for row in &mut rows {
            if row.run_date.is_none() {
                row.run_date = Some(stamp.clone());
            }
        }
        info!(site = %self.site_id, path = %latest.display(), rows = rows.len(), "loaded latest fixture");
        Ok(rows)
    }
}

/// Fetches one JSON document per hotel and reads its score at a JSON pointer.
#[derive(Debug, Clone)]
pub struct HttpJsonCollector {
    site_id: String,
    run_id: Uuid,
    fetcher: Arc<HttpFetcher>,
    url_template: Option<String>,
    score_pointer: String,
    api_key_env: Option<String>,
    delay: Duration,
}

impl HttpJsonCollector {
    fn url_for(&self, identifier: &str, api_key: Option<&str>) -> String {
        match &self.url_template {
            Some(template) => template
                .replace("{id}", identifier)
                .replace("{api_key}", api_key.unwrap_or_default()),
            None => identifier.to_string(),
        }
    }

    fn api_key(&self) -> Result<Option<String>, CollectorError> {
        let Some(var) = &self.api_key_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
            _ => Err(CollectorError::Message(format!(
                "environment variable {var} is not set"
            ))),
        }
    }
}

#[async_trait]
impl SiteCollector for HttpJsonCollector {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    async fn collect(
        &self,
        hotels: &[HotelConfig],
        run_date: NaiveDate,
    ) -> Result<Vec<ObservationDraft>, CollectorError> {
        let api_key = self.api_key()?;
        let mut drafts = Vec::with_capacity(hotels.len());
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_error = String::new();

        for hotel in hotels {
            let Some(identifier) = hotel.identifier_for(&self.site_id) else {
                drafts.push(
                    ObservationDraft::unscored(&hotel.name, run_date)
                        .with_raw_field("note", "no identifier configured"),
                );
                continue;
            };
            if attempted > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            attempted += 1;

            let url = self.url_for(identifier, api_key.as_deref());
            let fetched = self.fetcher.fetch_bytes(self.run_id, &self.site_id, &url).await;
            let outcome = fetched.map_err(|e| e.to_string()).and_then(|resp| {
                serde_json::from_slice::<JsonValue>(&resp.body)
                    .map(|doc| (resp.status, doc))
                    .map_err(|e| format!("invalid JSON response: {e}"))
            });

            match outcome {
                Ok((status, doc)) => {
                    let draft = match extract_score(&doc, &self.score_pointer) {
                        Some(score) => ObservationDraft::scored(&hotel.name, run_date, score),
                        None => ObservationDraft::unscored(&hotel.name, run_date)
                            .with_raw_field("note", "score not found"),
                    };
                    drafts.push(draft.with_raw_field("http_status", status.as_u16()));
                }
                Err(message) => {
                    let message = redact(&message, api_key.as_deref());
                    warn!(site = %self.site_id, hotel = %hotel.name, error = %message, "hotel fetch failed");
                    failed += 1;
                    last_error = message.clone();
                    drafts.push(
                        ObservationDraft::unscored(&hotel.name, run_date).with_raw_field("error", message),
                    );
                }
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(CollectorError::AllRequestsFailed {
                site: self.site_id.clone(),
                attempted,
                last_error,
            });
        }
        Ok(drafts)
    }
}

fn redact(message: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => message.replace(secret, "***"),
        _ => message.to_string(),
    }
}

/// Reads a score at `pointer`. Accepts JSON numbers and strings that start with a
/// number (`"8.6 Very good"`, `"8,6"`).
pub fn extract_score(doc: &JsonValue, pointer: &str) -> Option<f64> {
    match doc.pointer(pointer)? {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => extract_numbers(s).first().copied(),
        _ => None,
    }
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        let next_is_digit = chars.peek().is_some_and(|c| c.is_ascii_digit());
        if (ch == '.' || ch == ',') && !seen_dot && !current.is_empty() && next_is_digit {
            current.push('.');
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1_500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// `requests` per minute, with a burst of at most `requests`.
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        })
    }
}

/// Request budget shared by every collector of a run. One token per request,
/// refilled one at a time.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    next_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: config.capacity.max(1),
                next_refill: Instant::now() + config.refill_every,
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        while state.tokens < self.capacity && state.next_refill <= now {
            state.tokens += 1;
            state.next_refill += self.refill_every;
        }
        if state.tokens == self.capacity {
            state.next_refill = now + self.refill_every;
        }
        if state.tokens == 0 {
            let wake_at = state.next_refill;
            state.next_refill += self.refill_every;
            let wait_ms = wake_at.saturating_duration_since(now).as_millis() as u64;
            debug!(wait_ms, "rate limited");
            // Holding the lock queues later callers behind this one.
            tokio::time::sleep_until(wake_at).await;
            return;
        }
        state.tokens -= 1;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Rate-limited HTTP client with bounded, capped exponential retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("building reqwest client: {e}"))?;
        let token_bucket = config
            .token_bucket
            .map(SimpleTokenBucket::new);

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        site: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        let span = info_span!("http_fetch", %run_id, site);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
