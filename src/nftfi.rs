//! Loan and floor-price ingestion from NFTfi and Reservoir.
//!
//! Upstream JSON is loosely typed (nullable fields, ids that are sometimes
//! numbers). Everything is normalized into [`Loan`] and a plain USD floor
//! price here, so the distribution engine never sees raw shapes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::loan::Loan;

pub const NFTFI_BASE_URL: &str = "https://theta-sdk-api.nftfi.com";
pub const NFTFI_LOANS_BY_COLLECTION_PATH: &str =
    "/data/v0/pipes/loans_due_by_collection_endpoint.json";
pub const RESERVOIR_COLLECTIONS_URL: &str = "https://api.reservoir.tools/collections/v7";
/// Collections requested from Reservoir per listing call.
pub const RESERVOIR_LISTING_LIMIT: usize = 20;
/// Collections offered in the dashboard selector.
pub const TOP_COLLECTIONS_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("invalid request URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("failed to decode {what} response: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("no usable floor price for collection {0}")]
    MissingFloorPrice(String),
    #[error("Reservoir API key is not configured")]
    MissingApiKey,
}

impl IngestError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::HttpRequest { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNftfiLoan {
    #[serde(default, deserialize_with = "lenient_string")]
    pub loan_id: Option<String>,
    #[serde(default)]
    pub protocol_name: Option<String>,
    #[serde(default)]
    pub nft_project_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub nft_id: Option<String>,
    #[serde(default)]
    pub nft_image_small_uri: Option<String>,
    #[serde(default, rename = "principalAmountUSD", deserialize_with = "lenient_f64")]
    pub principal_amount_usd: Option<f64>,
    #[serde(
        default,
        rename = "maximumRepaymentAmountUSD",
        deserialize_with = "lenient_f64"
    )]
    pub maximum_repayment_amount_usd: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub apr: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration_days: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub hours_until_due: Option<f64>,
    #[serde(default)]
    pub borrower_address: Option<String>,
    #[serde(default)]
    pub lender_address: Option<String>,
    #[serde(default)]
    pub due_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NftfiLoansResponse {
    #[serde(default)]
    pub data: Vec<RawNftfiLoan>,
    #[serde(default)]
    pub rows: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReservoirResponse {
    #[serde(default)]
    collections: Vec<ReservoirCollection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservoirCollection {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    floor_ask: Option<ReservoirFloorAsk>,
    #[serde(default)]
    volume: Option<ReservoirVolume>,
    #[serde(default, deserialize_with = "lenient_f64")]
    token_count: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    on_sale_count: Option<f64>,
}

impl ReservoirCollection {
    fn floor_amount(&self) -> Option<&ReservoirAmount> {
        self.floor_ask
            .as_ref()
            .and_then(|ask| ask.price.as_ref())
            .and_then(|price| price.amount.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReservoirVolume {
    #[serde(default, rename = "1day", deserialize_with = "lenient_f64")]
    one_day: Option<f64>,
    #[serde(default, rename = "7day", deserialize_with = "lenient_f64")]
    seven_day: Option<f64>,
    #[serde(default, rename = "30day", deserialize_with = "lenient_f64")]
    thirty_day: Option<f64>,
    #[serde(default, rename = "allTime", deserialize_with = "lenient_f64")]
    all_time: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReservoirFloorAsk {
    price: Option<ReservoirPrice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReservoirPrice {
    amount: Option<ReservoirAmount>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReservoirAmount {
    #[serde(default, deserialize_with = "lenient_f64")]
    usd: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    native: Option<f64>,
}

/// One entry of the collection selector. Volumes are in the chain's native
/// currency, as Reservoir reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub id: String,
    pub name: String,
    pub floor_price_usd: Option<f64>,
    pub floor_price_native: Option<f64>,
    pub volume_1d: f64,
    pub volume_7d: f64,
    pub volume_30d: f64,
    pub volume_all_time: f64,
    pub token_count: Option<u64>,
    pub on_sale_count: Option<u64>,
}

/// Converts raw rows into strict loans. Rows without a loan id are dropped;
/// a missing principal is kept as `None` and handled by the LTV gate.
pub fn normalize_loans(raw: Vec<RawNftfiLoan>) -> Vec<Loan> {
    let input_rows = raw.len();
    let loans: Vec<Loan> = raw.into_iter().filter_map(normalize_loan).collect();

    let dropped = input_rows - loans.len();
    if dropped > 0 {
        debug!(
            component = "nftfi",
            event = "nftfi.normalize.dropped",
            input_rows,
            dropped
        );
    }
    loans
}

fn normalize_loan(raw: RawNftfiLoan) -> Option<Loan> {
    let loan_id = non_empty(raw.loan_id)?;
    Some(Loan {
        loan_id,
        protocol_name: non_empty(raw.protocol_name).unwrap_or_default(),
        nft_id: non_empty(raw.nft_id).unwrap_or_default(),
        nft_image_small_uri: non_empty(raw.nft_image_small_uri),
        principal_amount_usd: raw.principal_amount_usd.filter(|v| v.is_finite()),
        maximum_repayment_amount_usd: raw.maximum_repayment_amount_usd.filter(|v| v.is_finite()),
        apr: raw.apr.filter(|v| v.is_finite()),
        duration_days: raw.duration_days.filter(|v| v.is_finite()),
        hours_until_due: raw.hours_until_due.filter(|v| v.is_finite()),
        borrower_address: non_empty(raw.borrower_address),
        lender_address: non_empty(raw.lender_address),
        due_time: non_empty(raw.due_time),
    })
}

pub fn parse_loans_response(body: &[u8]) -> Result<Vec<Loan>, IngestError> {
    let response: NftfiLoansResponse =
        serde_json::from_slice(body).map_err(|source| IngestError::Decode {
            what: "nftfi loans",
            source,
        })?;
    Ok(normalize_loans(response.data))
}

/// USD floor price of the first collection in a Reservoir `collections/v7` body.
pub fn floor_price_from_reservoir(body: &[u8], collection: &str) -> Result<f64, IngestError> {
    let response: ReservoirResponse =
        serde_json::from_slice(body).map_err(|source| IngestError::Decode {
            what: "reservoir collections",
            source,
        })?;

    response
        .collections
        .into_iter()
        .find(|entry| {
            entry
                .id
                .as_deref()
                .map_or(true, |id| id.eq_ignore_ascii_case(collection))
        })
        .and_then(|entry| entry.floor_ask)
        .and_then(|ask| ask.price)
        .and_then(|price| price.amount)
        .and_then(|amount| amount.usd)
        .filter(|usd| usd.is_finite() && *usd > 0.0)
        .ok_or_else(|| IngestError::MissingFloorPrice(collection.to_string()))
}

/// Collection listing from a Reservoir `collections/v7` body. Entries without
/// a contract id or a name are dropped.
pub fn collections_from_reservoir(body: &[u8]) -> Result<Vec<CollectionSummary>, IngestError> {
    let response: ReservoirResponse =
        serde_json::from_slice(body).map_err(|source| IngestError::Decode {
            what: "reservoir collections",
            source,
        })?;

    let input_rows = response.collections.len();
    let collections: Vec<CollectionSummary> = response
        .collections
        .into_iter()
        .filter_map(|entry| {
            let floor = entry.floor_amount();
            let floor_price_usd = floor
                .and_then(|amount| amount.usd)
                .filter(|usd| usd.is_finite() && *usd > 0.0);
            let floor_price_native = floor
                .and_then(|amount| amount.native)
                .filter(|native| native.is_finite() && *native > 0.0);
            let volume = entry.volume.unwrap_or_default();
            Some(CollectionSummary {
                id: non_empty(entry.id)?,
                name: non_empty(entry.name)?,
                floor_price_usd,
                floor_price_native,
                volume_1d: finite_or_zero(volume.one_day),
                volume_7d: finite_or_zero(volume.seven_day),
                volume_30d: finite_or_zero(volume.thirty_day),
                volume_all_time: finite_or_zero(volume.all_time),
                token_count: whole_count(entry.token_count),
                on_sale_count: whole_count(entry.on_sale_count),
            })
        })
        .collect();

    if collections.len() < input_rows {
        debug!(
            component = "reservoir",
            event = "reservoir.collections.dropped",
            input_rows,
            dropped = input_rows - collections.len()
        );
    }
    Ok(collections)
}

/// Highest all-time volume first, at most `limit` entries. Ties keep the
/// upstream order.
pub fn top_collections(mut collections: Vec<CollectionSummary>, limit: usize) -> Vec<CollectionSummary> {
    collections.sort_by(|a, b| b.volume_all_time.total_cmp(&a.volume_all_time));
    collections.truncate(limit);
    collections
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Sliding-window limiter: at most `max_requests` starts per `window_ms`.
pub struct RateLimiter {
    max_requests: usize,
    window_ms: i64,
    clock: Arc<dyn Clock>,
    recent: VecDeque<i64>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window_ms: window_ms.max(0),
            clock,
            recent: VecDeque::new(),
        }
    }

    /// Reserves the next slot and returns how long the caller must wait
    /// before starting its request.
    pub fn acquire(&mut self) -> u64 {
        let now = self.clock.now_ms();
        while self
            .recent
            .front()
            .is_some_and(|started| *started <= now - self.window_ms)
        {
            self.recent.pop_front();
        }

        if self.recent.len() < self.max_requests {
            self.recent.push_back(now);
            return 0;
        }

        let oldest = self.recent.front().copied().unwrap_or(now);
        let start_at = (oldest + self.window_ms).max(now);
        self.recent.pop_front();
        self.recent.push_back(start_at);
        (start_at - now) as u64
    }
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, IngestError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, IngestError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| IngestError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, IngestError> {
        let mut request = self.client.get(url).header("accept", "application/json");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().map_err(|err| IngestError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| IngestError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_requests_per_window: usize,
    pub window_ms: i64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 200,
            max_requests_per_window: 5,
            window_ms: 1_000,
        }
    }
}

/// Fetcher wrapped with a rate limiter and retry on transient failures.
pub struct LimitedFetcher {
    fetcher: Box<dyn HttpFetcher>,
    limiter: Mutex<RateLimiter>,
    policy: FetchPolicy,
}

impl LimitedFetcher {
    pub fn new(fetcher: Box<dyn HttpFetcher>, clock: Arc<dyn Clock>, policy: FetchPolicy) -> Self {
        Self {
            fetcher,
            limiter: Mutex::new(RateLimiter::new(
                policy.max_requests_per_window,
                policy.window_ms,
                clock,
            )),
            policy,
        }
    }

    pub fn get_bytes(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, IngestError> {
        let mut attempt: u32 = 0;
        loop {
            let wait_ms = self
                .limiter
                .lock()
                .expect("rate limiter lock should not be poisoned")
                .acquire();
            if wait_ms > 0 {
                debug!(
                    component = "ingest",
                    event = "ingest.rate_limited",
                    wait_ms
                );
                std::thread::sleep(std::time::Duration::from_millis(wait_ms));
            }

            match self.fetcher.get_bytes(url, headers) {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!(
                        component = "ingest",
                        event = "ingest.retry",
                        attempt,
                        error = %err
                    );
                    std::thread::sleep(backoff_duration(self.policy.retry_backoff_ms, attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn backoff_duration(base_ms: u64, attempt: u32) -> std::time::Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << shift;
    std::time::Duration::from_millis(base_ms.saturating_mul(factor))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftfiConfig {
    pub base_url: String,
    pub days_from_now: u32,
    pub page_size: u32,
    pub http_timeout_ms: u64,
    pub fetch: FetchPolicy,
}

impl Default for NftfiConfig {
    fn default() -> Self {
        Self {
            base_url: NFTFI_BASE_URL.to_string(),
            days_from_now: 365,
            page_size: 10_000,
            http_timeout_ms: 30_000,
            fetch: FetchPolicy::default(),
        }
    }
}

pub struct NftfiClient {
    cfg: NftfiConfig,
    fetcher: LimitedFetcher,
}

impl NftfiClient {
    pub fn new(cfg: NftfiConfig) -> Result<Self, IngestError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self::with_fetcher(cfg, Box::new(fetcher), Arc::new(SystemClock)))
    }

    pub fn with_fetcher(
        cfg: NftfiConfig,
        fetcher: Box<dyn HttpFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fetcher = LimitedFetcher::new(fetcher, clock, cfg.fetch);
        Self { cfg, fetcher }
    }

    pub fn loans_url(&self, project_name: &str) -> Result<String, IngestError> {
        let base = format!("{}{}", self.cfg.base_url, NFTFI_LOANS_BY_COLLECTION_PATH);
        let days = self.cfg.days_from_now.to_string();
        let page_size = self.cfg.page_size.to_string();
        reqwest::Url::parse_with_params(
            &base,
            &[
                ("nftProjectName", project_name),
                ("daysFromNow", days.as_str()),
                ("page_size", page_size.as_str()),
                ("page", "0"),
            ],
        )
        .map(|url| url.to_string())
        .map_err(|err| IngestError::InvalidUrl {
            url: base,
            message: err.to_string(),
        })
    }

    pub fn fetch_collection_loans(&self, project_name: &str) -> Result<Vec<Loan>, IngestError> {
        info!(
            component = "nftfi",
            event = "nftfi.fetch.start",
            collection = project_name
        );
        let url = self.loans_url(project_name)?;
        let result = self
            .fetcher
            .get_bytes(&url, &[])
            .and_then(|body| parse_loans_response(&body));

        match &result {
            Ok(loans) => info!(
                component = "nftfi",
                event = "nftfi.fetch.finish",
                collection = project_name,
                loans = loans.len()
            ),
            Err(err) => warn!(
                component = "nftfi",
                event = "nftfi.fetch.error",
                collection = project_name,
                error = %err
            ),
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservoirConfig {
    pub collections_url: String,
    pub api_key: Option<String>,
    pub http_timeout_ms: u64,
    pub fetch: FetchPolicy,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            collections_url: RESERVOIR_COLLECTIONS_URL.to_string(),
            api_key: None,
            http_timeout_ms: 30_000,
            fetch: FetchPolicy::default(),
        }
    }
}

pub struct ReservoirClient {
    cfg: ReservoirConfig,
    fetcher: LimitedFetcher,
}

impl ReservoirClient {
    pub fn new(cfg: ReservoirConfig) -> Result<Self, IngestError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Ok(Self::with_fetcher(cfg, Box::new(fetcher), Arc::new(SystemClock)))
    }

    pub fn with_fetcher(
        cfg: ReservoirConfig,
        fetcher: Box<dyn HttpFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fetcher = LimitedFetcher::new(fetcher, clock, cfg.fetch);
        Self { cfg, fetcher }
    }

    pub fn fetch_floor_price_usd(&self, contract: &str) -> Result<f64, IngestError> {
        let body = self.get(&[("id", contract)])?;
        let floor = floor_price_from_reservoir(&body, contract)?;
        info!(
            component = "reservoir",
            event = "reservoir.floor_price",
            collection = contract,
            floor_price_usd = floor
        );
        Ok(floor)
    }

    /// Collections by all-time volume, trimmed to `limit`.
    pub fn fetch_top_collections(
        &self,
        limit: usize,
    ) -> Result<Vec<CollectionSummary>, IngestError> {
        let requested = RESERVOIR_LISTING_LIMIT.max(limit).to_string();
        let result = self
            .get(&[
                ("limit", requested.as_str()),
                ("sortBy", "allTimeVolume"),
                ("sortDirection", "desc"),
            ])
            .and_then(|body| collections_from_reservoir(&body))
            .map(|collections| top_collections(collections, limit));

        match &result {
            Ok(collections) => info!(
                component = "reservoir",
                event = "reservoir.collections.finish",
                collections = collections.len()
            ),
            Err(err) => warn!(
                component = "reservoir",
                event = "reservoir.collections.error",
                error = %err
            ),
        }
        result
    }

    fn get(&self, params: &[(&str, &str)]) -> Result<Vec<u8>, IngestError> {
        let api_key = self
            .cfg
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(IngestError::MissingApiKey)?;

        let url = reqwest::Url::parse_with_params(&self.cfg.collections_url, params).map_err(
            |err| IngestError::InvalidUrl {
                url: self.cfg.collections_url.clone(),
                message: err.to_string(),
            },
        )?;

        self.fetcher
            .get_bytes(url.as_str(), &[("x-api-key", api_key)])
    }
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn whole_count(value: Option<f64>) -> Option<u64> {
    value
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
