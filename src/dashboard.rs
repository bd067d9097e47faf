//! HTTP surface: HTML dashboard, series JSON, click-to-filter loan JSON and
//! the collection selector.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bucket::{BucketPolicyError, PolicyRequest};
use crate::distribution::{
    aggregate, ltv_stats, resolve_policy, DistributionBucket, DistributionSeries, LoanStats,
};
use crate::loan::{Loan, LoanSort, SortField};
use crate::ltv::loan_ltv;
use crate::matcher::{FilterState, LoanFilter, MatchMode, DEFAULT_TOLERANCE_PERCENT};
use crate::nftfi::{
    CollectionSummary, IngestError, NftfiClient, NftfiConfig, ReservoirClient, ReservoirConfig,
    TOP_COLLECTIONS_LIMIT,
};
use crate::observability::log_live_cycle;
use crate::session::{FetchGenerations, FetchOutcome};

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 60_000;

/// Raw inputs for one collection. Everything shown on the dashboard is
/// derived from this per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanSnapshot {
    pub collection: String,
    pub floor_price_usd: f64,
    pub loans: Vec<Loan>,
    pub error: Option<String>,
    /// Set while the first fetch for a newly selected collection is running.
    #[serde(default)]
    pub loading: bool,
}

impl LoanSnapshot {
    pub fn new(collection: impl Into<String>, floor_price_usd: f64, loans: Vec<Loan>) -> Self {
        Self {
            collection: collection.into(),
            floor_price_usd,
            loans,
            error: None,
            loading: false,
        }
    }

    fn pending(collection: &str) -> Self {
        Self {
            loading: true,
            ..Self::new(collection, 0.0, Vec::new())
        }
    }

    fn summary(&self) -> CollectionSummary {
        CollectionSummary {
            id: self.collection.clone(),
            name: self.collection.clone(),
            floor_price_usd: Some(self.floor_price_usd).filter(|floor| *floor > 0.0),
            floor_price_native: None,
            volume_1d: 0.0,
            volume_7d: 0.0,
            volume_30d: 0.0,
            volume_all_time: 0.0,
            token_count: None,
            on_sale_count: None,
        }
    }
}

pub trait DashboardSnapshotSource: Send + Sync + 'static {
    /// Data for the currently selected collection.
    fn snapshot(&self) -> LoanSnapshot;

    /// Collections offered in the selector, best first.
    fn collections(&self) -> Vec<CollectionSummary>;

    /// Makes `name` the served collection. Selecting the current collection
    /// is a no-op.
    fn select_collection(&self, name: &str) -> Result<(), DashboardError>;
}

#[derive(Debug)]
struct InMemoryCatalog {
    snapshots: Vec<LoanSnapshot>,
    selected: usize,
}

/// Fixed set of snapshots; the first one starts selected.
#[derive(Clone)]
pub struct InMemorySnapshotSource {
    inner: Arc<RwLock<InMemoryCatalog>>,
}

impl InMemorySnapshotSource {
    pub fn new(snapshot: LoanSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(InMemoryCatalog {
                snapshots: vec![snapshot],
                selected: 0,
            })),
        }
    }

    /// Adds another selectable collection.
    pub fn with_collection(self, snapshot: LoanSnapshot) -> Self {
        self.inner
            .write()
            .expect("in-memory snapshot lock should not be poisoned")
            .snapshots
            .push(snapshot);
        self
    }

    pub fn demo() -> Self {
        Self::new(demo_snapshot()).with_collection(demo_glyphs_snapshot())
    }

    /// Replaces the data of the selected collection.
    pub fn replace_snapshot(&self, snapshot: LoanSnapshot) {
        let mut catalog = self
            .inner
            .write()
            .expect("in-memory snapshot lock should not be poisoned");
        let selected = catalog.selected;
        catalog.snapshots[selected] = snapshot;
    }
}

impl DashboardSnapshotSource for InMemorySnapshotSource {
    fn snapshot(&self) -> LoanSnapshot {
        let catalog = self
            .inner
            .read()
            .expect("in-memory snapshot lock should not be poisoned");
        catalog.snapshots[catalog.selected].clone()
    }

    fn collections(&self) -> Vec<CollectionSummary> {
        self.inner
            .read()
            .expect("in-memory snapshot lock should not be poisoned")
            .snapshots
            .iter()
            .map(LoanSnapshot::summary)
            .collect()
    }

    fn select_collection(&self, name: &str) -> Result<(), DashboardError> {
        let mut catalog = self
            .inner
            .write()
            .expect("in-memory snapshot lock should not be poisoned");
        let position = catalog
            .snapshots
            .iter()
            .position(|snapshot| snapshot.collection.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| DashboardError::bad_request(format!("unknown collection: {name}")))?;
        catalog.selected = position;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSourceConfig {
    /// Collection served until the user picks another one.
    pub collection: String,
    pub contract: Option<String>,
    pub floor_price_usd: Option<f64>,
    pub refresh_interval_ms: u64,
    pub nftfi: NftfiConfig,
    pub reservoir: ReservoirConfig,
}

impl Default for LiveSourceConfig {
    fn default() -> Self {
        Self {
            collection: "Wrapped Cryptopunks".to_string(),
            contract: None,
            floor_price_usd: None,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            nftfi: NftfiConfig::default(),
            reservoir: ReservoirConfig::default(),
        }
    }
}

impl LiveSourceConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(collection) = env_non_empty("LTV_COLLECTION") {
            cfg.collection = collection;
        }
        cfg.contract = env_non_empty("LTV_COLLECTION_CONTRACT");
        cfg.floor_price_usd = env_non_empty("LTV_FLOOR_PRICE_USD")
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|floor| floor.is_finite() && *floor > 0.0);
        if let Some(interval) =
            env_non_empty("LTV_REFRESH_INTERVAL_MS").and_then(|raw| raw.parse::<u64>().ok())
        {
            cfg.refresh_interval_ms = interval.max(1_000);
        }
        cfg.reservoir.api_key = env_non_empty("RESERVOIR_API_KEY");
        cfg
    }
}

/// Shared between request handlers and the refresh thread. The generation
/// counter decides whether a finished fetch may still replace `snapshot`.
#[derive(Debug)]
struct LiveState {
    generations: FetchGenerations,
    snapshot: LoanSnapshot,
    collections: Vec<CollectionSummary>,
}

impl LiveState {
    fn new(collection: &str) -> Self {
        let mut generations = FetchGenerations::default();
        generations.select(collection);
        Self {
            generations,
            snapshot: LoanSnapshot::pending(collection),
            collections: Vec::new(),
        }
    }
}

type SharedLiveState = Arc<RwLock<LiveState>>;

/// Snapshot source refreshed from NFTfi and Reservoir on a background thread.
/// Selecting a collection wakes the thread instead of waiting for the next
/// refresh tick.
#[derive(Clone)]
pub struct LiveSnapshotSource {
    state: SharedLiveState,
    wake: mpsc::Sender<()>,
}

impl LiveSnapshotSource {
    pub fn spawn(cfg: LiveSourceConfig) -> Self {
        let state = Arc::new(RwLock::new(LiveState::new(&cfg.collection)));
        let shared = Arc::clone(&state);
        let refresh_interval = Duration::from_millis(cfg.refresh_interval_ms);
        let (wake, wakeups) = mpsc::channel();

        let spawned = std::thread::Builder::new()
            .name("ltv-live-source".to_string())
            .spawn(move || {
                let mut refresher = match LiveRefresher::connect(cfg, shared.clone()) {
                    Ok(refresher) => refresher,
                    Err(err) => {
                        warn!(
                            component = "live_source",
                            event = "live_source.init.error",
                            error = %err
                        );
                        record_error(&shared, err.to_string());
                        return;
                    }
                };
                let mut list_collections = true;
                loop {
                    if list_collections {
                        refresher.refresh_collections();
                    }
                    refresher.refresh();
                    match wakeups.recv_timeout(refresh_interval) {
                        Ok(()) => {
                            while wakeups.try_recv().is_ok() {}
                            list_collections = false;
                        }
                        Err(RecvTimeoutError::Timeout) => list_collections = true,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(component = "live_source", event = "live_source.stopped");
            });

        if let Err(err) = spawned {
            warn!(
                component = "live_source",
                event = "live_source.spawn.error",
                error = %err
            );
            record_error(&state, err.to_string());
        }

        Self { state, wake }
    }
}

impl DashboardSnapshotSource for LiveSnapshotSource {
    fn snapshot(&self) -> LoanSnapshot {
        read_live(&self.state).snapshot.clone()
    }

    fn collections(&self) -> Vec<CollectionSummary> {
        read_live(&self.state).collections.clone()
    }

    fn select_collection(&self, name: &str) -> Result<(), DashboardError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DashboardError::bad_request("collection must not be empty"));
        }
        {
            let mut state = write_live(&self.state);
            if state.generations.collection() == Some(name) {
                return Ok(());
            }
            let token = state.generations.select(name);
            state.snapshot = LoanSnapshot::pending(token.collection());
        }
        if self.wake.send(()).is_err() {
            warn!(
                component = "live_source",
                event = "live_source.wake.error",
                collection = name
            );
            record_error(&self.state, "live refresh thread is not running".to_string());
        }
        Ok(())
    }
}

struct LiveRefresher {
    cfg: LiveSourceConfig,
    nftfi: NftfiClient,
    reservoir: ReservoirClient,
    state: SharedLiveState,
}

impl LiveRefresher {
    fn connect(cfg: LiveSourceConfig, state: SharedLiveState) -> Result<Self, IngestError> {
        let nftfi = NftfiClient::new(cfg.nftfi.clone())?;
        let reservoir = ReservoirClient::new(cfg.reservoir.clone())?;
        Ok(Self {
            cfg,
            nftfi,
            reservoir,
            state,
        })
    }

    /// Refetches the selected collection. A failed cycle keeps the last
    /// published loans and only records the error; a result for a selection
    /// that changed mid-fetch is dropped.
    fn refresh(&self) {
        let Some(token) = read_live(&self.state).generations.current() else {
            return;
        };
        let started = Instant::now();
        let result = self.fetch(token.collection());
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut state = write_live(&self.state);
        let action = if result.is_ok() { "complete" } else { "fail" };
        if state.generations.admit(&token, action) == FetchOutcome::Stale {
            return;
        }
        match result {
            Ok((loans, floor_price_usd)) => {
                log_live_cycle(&token, Ok((loans.len(), floor_price_usd)), elapsed_ms);
                state.snapshot = LoanSnapshot::new(token.collection(), floor_price_usd, loans);
            }
            Err(err) => {
                let message = err.to_string();
                log_live_cycle(&token, Err(&message), elapsed_ms);
                state.snapshot.loading = false;
                state.snapshot.error = Some(message);
            }
        }
    }

    /// Reloads the selector listing. Needs a Reservoir key; on failure the
    /// previous listing stays.
    fn refresh_collections(&self) {
        if self.cfg.reservoir.api_key.is_none() {
            debug!(
                component = "live_source",
                event = "live_source.collections.skipped",
                reason = "no reservoir api key"
            );
            return;
        }
        if let Ok(collections) = self.reservoir.fetch_top_collections(TOP_COLLECTIONS_LIMIT) {
            write_live(&self.state).collections = collections;
        }
    }

    fn fetch(&self, collection: &str) -> Result<(Vec<Loan>, f64), IngestError> {
        let loans = self.nftfi.fetch_collection_loans(collection)?;
        let floor_price_usd = self.floor_price_usd(collection)?;
        Ok((loans, floor_price_usd))
    }

    /// Configured override, then the configured contract, then the contract
    /// listed for this collection name.
    fn floor_price_usd(&self, collection: &str) -> Result<f64, IngestError> {
        let configured = collection == self.cfg.collection;
        if configured {
            if let Some(floor) = self.cfg.floor_price_usd {
                return Ok(floor);
            }
        }
        let contract = configured
            .then(|| self.cfg.contract.clone())
            .flatten()
            .or_else(|| {
                read_live(&self.state)
                    .collections
                    .iter()
                    .find(|listed| listed.name.eq_ignore_ascii_case(collection))
                    .map(|listed| listed.id.clone())
            });
        match contract {
            Some(contract) => self.reservoir.fetch_floor_price_usd(&contract),
            None => Err(IngestError::MissingFloorPrice(collection.to_string())),
        }
    }
}

fn read_live(state: &SharedLiveState) -> std::sync::RwLockReadGuard<'_, LiveState> {
    state
        .read()
        .expect("live snapshot lock should not be poisoned")
}

fn write_live(state: &SharedLiveState) -> std::sync::RwLockWriteGuard<'_, LiveState> {
    state
        .write()
        .expect("live snapshot lock should not be poisoned")
}

fn record_error(state: &SharedLiveState, message: String) {
    let mut state = write_live(state);
    state.snapshot.loading = false;
    state.snapshot.error = Some(message);
}

/// Query shared by every dashboard route. Numbers are kept as strings so bad
/// input produces the same 400 body as a bad policy name.
///
/// The same struct serializes the dashboard's own links, so a bucket or sort
/// link carries every parameter the current chart was built with.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DashboardQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl DashboardQuery {
    /// `/dashboard` URL for this query.
    pub fn to_href(&self) -> String {
        match serde_urlencoded::to_string(self) {
            Ok(encoded) if !encoded.is_empty() => format!("/dashboard?{encoded}"),
            _ => "/dashboard".to_string(),
        }
    }

    /// Same chart, filtered to the bucket whose key is `ltv`.
    pub fn selecting(&self, ltv: f64) -> Self {
        Self {
            ltv: Some(ltv.to_string()),
            ..self.clone()
        }
    }

    /// Same chart and filter, ordered by `sort`.
    pub fn sorted_by(&self, sort: LoanSort) -> Self {
        Self {
            sort: Some(sort.field.as_str().to_string()),
            dir: Some(sort.direction.as_str().to_string()),
            ..self.clone()
        }
    }

    /// Same chart, filter reset.
    pub fn cleared(&self) -> Self {
        Self {
            ltv: None,
            ..self.clone()
        }
    }

    fn requested_collection(&self) -> Option<&str> {
        self.collection
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardError {
    pub error: String,
}

impl DashboardError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

impl From<BucketPolicyError> for DashboardError {
    fn from(err: BucketPolicyError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanRow {
    #[serde(flatten)]
    pub loan: Loan,
    pub ltv: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesResponse {
    pub collection: String,
    pub stats: Option<LoanStats>,
    #[serde(flatten)]
    pub series: DistributionSeries,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoansResponse {
    pub collection: String,
    pub floor_price_usd: f64,
    pub total: usize,
    pub matched: usize,
    pub filter: FilterState,
    pub mode: MatchMode,
    /// Chart bucket behind the selection, when the selection is exact.
    pub bucket: Option<DistributionBucket>,
    pub loans: Vec<LoanRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionsResponse {
    pub selected: String,
    pub loading: bool,
    pub collections: Vec<CollectionSummary>,
}

/// Everything one request needs: chart, filter and ordered visible rows.
#[derive(Debug, Clone)]
pub struct DashboardView {
    pub snapshot_collection: String,
    pub error: Option<String>,
    pub loading: bool,
    pub series: DistributionSeries,
    pub stats: Option<LoanStats>,
    pub filter: LoanFilter,
    pub sort: LoanSort,
}

impl DashboardView {
    pub fn build(snapshot: LoanSnapshot, query: &DashboardQuery) -> Result<Self, DashboardError> {
        let width = parse_number("width", query.width.as_deref())?;
        let request = PolicyRequest::parse(query.policy.as_deref(), width)?;
        let sort = LoanSort::parse(query.sort.as_deref(), query.dir.as_deref())
            .ok_or_else(|| DashboardError::bad_request("invalid sort field or direction"))?;

        let LoanSnapshot {
            collection,
            floor_price_usd,
            loans,
            error,
            loading,
        } = snapshot;

        let policy = resolve_policy(&request, &loans, floor_price_usd)?;
        let series = aggregate(&loans, floor_price_usd, &policy);
        let stats = ltv_stats(&loans, floor_price_usd);

        let mut filter = match query.mode.as_deref().map(str::trim) {
            None | Some("") | Some("exact") => LoanFilter::for_series(loans, &series),
            Some("tolerance") => {
                let percent = parse_number("tolerance", query.tolerance.as_deref())?
                    .unwrap_or(DEFAULT_TOLERANCE_PERCENT);
                if !(percent.is_finite() && percent >= 0.0) {
                    return Err(DashboardError::bad_request(format!(
                        "tolerance must be a non-negative number, got {percent}"
                    )));
                }
                LoanFilter::new(loans, floor_price_usd, MatchMode::Tolerance { percent })
            }
            Some(other) => {
                return Err(DashboardError::bad_request(format!(
                    "unknown match mode: {other}"
                )))
            }
        };

        if let Some(target) = parse_number("ltv", query.ltv.as_deref())? {
            filter.select(target);
        }

        Ok(Self {
            snapshot_collection: collection,
            error,
            loading,
            series,
            stats,
            filter,
            sort,
        })
    }

    pub fn visible_rows(&self) -> Vec<LoanRow> {
        let floor = self.filter.floor_price_usd();
        let mut visible = self.filter.visible();
        self.sort.sort_loans(&mut visible, floor);
        visible
            .into_iter()
            .map(|loan| LoanRow {
                loan: loan.clone(),
                ltv: loan_ltv(loan, floor),
            })
            .collect()
    }

    pub fn selected_bucket(&self) -> Option<&DistributionBucket> {
        match (self.filter.state(), self.filter.mode()) {
            (FilterState::Filtered { target_ltv }, MatchMode::ExactBucket { .. }) => {
                self.series.bucket_containing(target_ltv)
            }
            _ => None,
        }
    }

    fn into_loans_response(self) -> LoansResponse {
        let loans = self.visible_rows();
        let bucket = self.selected_bucket().cloned();
        LoansResponse {
            total: self.filter.all_loans().len(),
            matched: loans.len(),
            floor_price_usd: self.filter.floor_price_usd(),
            filter: self.filter.state(),
            mode: self.filter.mode().clone(),
            collection: self.snapshot_collection,
            bucket,
            loans,
        }
    }
}

pub fn dashboard_router(source: Arc<dyn DashboardSnapshotSource>) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/series", get(get_dashboard_series))
        .route("/dashboard/loans", get(get_dashboard_loans))
        .route("/dashboard/collections", get(get_dashboard_collections))
        .with_state(DashboardAppState { source })
}

/// Renders the page. Every link is built from `query` with the served
/// collection pinned, so following a bucket or sort link rebuilds the same
/// chart the user was looking at.
pub fn render_dashboard_html(
    view: &DashboardView,
    query: &DashboardQuery,
    collections: &[CollectionSummary],
) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let rows = view.visible_rows();
    let links = DashboardQuery {
        collection: Some(view.snapshot_collection.clone()),
        ..query.clone()
    };

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>NFT Loan LTV Depth</title>\n");
    out.push_str("<style>:root{--bg:#f4f2ec;--card:#fff;--ink:#182026;--muted:#5f6a73;--line:#d7dce1;--head:#1d2b4a;--bar:#3d6fd6;--sel:#fff5b8}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Space Grotesk\",\"Avenir Next\",\"Segoe UI\",sans-serif;background:var(--bg);min-height:100vh}.shell{max-width:1400px;margin:0 auto;padding:24px 18px}.hero{background:linear-gradient(135deg,#1d2b4a 0%,#35508a 100%);color:#f7fbfc;border-radius:16px;padding:18px 20px}.hero h1{margin:0 0 8px;font-size:1.6rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.92rem;color:#dce3f0}.card{margin-top:16px;background:var(--card);border:1px solid #cbd4db;border-radius:16px;overflow:hidden}.card h2{margin:0;padding:12px 14px;font-size:1rem;border-bottom:1px solid var(--line)}.table-wrap{overflow:auto;max-height:60vh}table{width:100%;border-collapse:collapse}thead th{position:sticky;top:0;background:var(--head);color:#f2f7f9;font-size:.78rem;text-transform:uppercase;padding:9px 10px;text-align:left}thead th a{color:inherit}tbody td{font-size:.84rem;padding:8px 10px;border-bottom:1px solid var(--line);white-space:nowrap}tr.selected{background:var(--sel)}.depth{display:inline-block;height:10px;background:var(--bar);border-radius:3px}.error{margin-top:16px;padding:10px 14px;border-radius:12px;background:#fde2e1;color:#8a1c17}.reset{color:#fff;margin-left:auto}.picker{margin-top:12px;display:flex;gap:8px}.picker select{min-width:260px;padding:4px 6px;border-radius:8px}.notice{margin-top:16px;padding:10px 14px;border-radius:12px;background:#e3ecfb;color:#1d2b4a}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");

    out.push_str("<section class=\"hero\"><h1>");
    out.push_str(&escape_html(&view.snapshot_collection));
    out.push_str("</h1><div class=\"hero-meta\">");
    out.push_str(&format!(
        "<span>Floor: {}</span>",
        format_usd(view.series.floor_price_usd())
    ));
    out.push_str(&format!(
        "<span>Loans: {} ({} without LTV)</span>",
        view.filter.all_loans().len(),
        view.series.skipped_loans()
    ));
    out.push_str(&format!(
        "<span>Buckets: {} ({})</span>",
        view.series.buckets().len(),
        view.series.policy().kind().as_str()
    ));
    if let Some(stats) = &view.stats {
        out.push_str(&format!(
            "<span>LTV median {} / mean {}</span>",
            format_pct(stats.median),
            format_pct(stats.mean)
        ));
    }
    out.push_str(&format!("<span>Generated: {}</span>", escape_html(&now_utc)));
    if matches!(view.filter.state(), FilterState::Filtered { .. }) {
        out.push_str(&format!(
            "<a class=\"reset\" href=\"{}\">Reset filter</a>",
            escape_html(&links.cleared().to_href())
        ));
    }
    out.push_str("</div>");
    render_collection_picker(&mut out, view, &links, collections);
    out.push_str("</section>\n");

    if view.loading {
        out.push_str(&format!(
            "<div class=\"notice\">Loading loans for {}&hellip;</div>\n",
            escape_html(&view.snapshot_collection)
        ));
    }

    if let Some(error) = &view.error {
        out.push_str("<div class=\"error\">");
        out.push_str(&escape_html(error));
        out.push_str("</div>\n");
    }

    let selected_index = view.selected_bucket().map(|bucket| bucket.index);
    let max_cumulative = view
        .series
        .buckets()
        .first()
        .map_or(0.0, |bucket| bucket.cumulative_value_usd);

    out.push_str("<section class=\"card\"><h2>LTV depth</h2><div class=\"table-wrap\"><table id=\"depth-table\">\n");
    out.push_str("<thead><tr><th>LTV</th><th>Loans</th><th>Value</th><th>Loans &ge; LTV</th><th>Value &ge; LTV</th><th></th></tr></thead><tbody>\n");
    for bucket in view.series.buckets() {
        let class = if selected_index == Some(bucket.index) {
            " class=\"selected\""
        } else {
            ""
        };
        let bar = if max_cumulative > 0.0 {
            bucket.cumulative_value_usd / max_cumulative * 200.0
        } else {
            0.0
        };
        out.push_str(&format!(
            "<tr{class}><td><a href=\"{}\">{} &ndash; {}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td><span class=\"depth\" style=\"width:{:.0}px\"></span></td></tr>\n",
            escape_html(&links.selecting(bucket.ltv_key).to_href()),
            format_pct(bucket.ltv_key),
            format_pct(bucket.ltv_upper),
            bucket.loan_count,
            format_usd(bucket.total_value_usd),
            bucket.cumulative_loan_count,
            format_usd(bucket.cumulative_value_usd),
            bar
        ));
    }
    out.push_str("</tbody></table></div></section>\n");

    out.push_str(&format!(
        "<section class=\"card\"><h2>Loans ({} of {})</h2><div class=\"table-wrap\"><table id=\"loan-table\">\n",
        rows.len(),
        view.filter.all_loans().len()
    ));
    out.push_str("<thead><tr>");
    for (label, field) in LOAN_TABLE_COLUMNS {
        let next = view.sort.toggle(field);
        out.push_str(&format!(
            "<th><a href=\"{}\">{label}</a></th>",
            escape_html(&links.sorted_by(next).to_href())
        ));
    }
    out.push_str("<th>Protocol</th></tr></thead><tbody>\n");
    for row in &rows {
        out.push_str("<tr><td>");
        out.push_str(&escape_html(&row.loan.loan_id));
        out.push_str("</td><td>");
        out.push_str(&row.ltv.map(format_pct).unwrap_or_else(|| "-".to_string()));
        out.push_str("</td><td>");
        out.push_str(
            &row.loan
                .principal_amount_usd
                .map(format_usd)
                .unwrap_or_else(|| "-".to_string()),
        );
        out.push_str("</td><td>");
        out.push_str(&row.loan.apr.map(format_pct).unwrap_or_else(|| "-".to_string()));
        out.push_str("</td><td>");
        out.push_str(
            &row.loan
                .hours_until_due
                .map(|hours| format!("{:.0}h", hours))
                .unwrap_or_else(|| "-".to_string()),
        );
        out.push_str("</td><td>");
        out.push_str(&escape_html(&row.loan.protocol_name));
        out.push_str("</td></tr>\n");
    }
    out.push_str("</tbody></table></div></section>");
    out.push_str("</main></body></html>\n");
    out
}

/// Selector form. Switching collections keeps the chart settings and drops
/// the bucket selection.
fn render_collection_picker(
    out: &mut String,
    view: &DashboardView,
    links: &DashboardQuery,
    collections: &[CollectionSummary],
) {
    if collections.is_empty() {
        return;
    }
    out.push_str("<form class=\"picker\" method=\"get\" action=\"/dashboard\"><select name=\"collection\">");
    let current = &view.snapshot_collection;
    if !collections
        .iter()
        .any(|listed| listed.name.eq_ignore_ascii_case(current))
    {
        out.push_str(&format!(
            "<option selected>{}</option>",
            escape_html(current)
        ));
    }
    for listed in collections {
        let selected = if listed.name.eq_ignore_ascii_case(current) {
            " selected"
        } else {
            ""
        };
        let floor = listed
            .floor_price_usd
            .map(|floor| format!(" ({})", format_usd(floor)))
            .unwrap_or_default();
        out.push_str(&format!(
            "<option value=\"{}\"{selected}>{}{}</option>",
            escape_html(&listed.name),
            escape_html(&listed.name),
            floor
        ));
    }
    out.push_str("</select>");
    let kept = [
        ("policy", &links.policy),
        ("width", &links.width),
        ("mode", &links.mode),
        ("tolerance", &links.tolerance),
        ("sort", &links.sort),
        ("dir", &links.dir),
    ];
    for (name, value) in kept {
        if let Some(value) = value {
            out.push_str(&format!(
                "<input type=\"hidden\" name=\"{name}\" value=\"{}\">",
                escape_html(value)
            ));
        }
    }
    out.push_str("<button type=\"submit\">Load</button></form>");
}

const LOAN_TABLE_COLUMNS: [(&str, SortField); 5] = [
    ("Loan", SortField::LoanId),
    ("LTV", SortField::Ltv),
    ("Principal", SortField::Principal),
    ("APR", SortField::Apr),
    ("Due in", SortField::DueIn),
];

/// Deterministic demo collection: a spread of LTVs from 8% to past 140%,
/// plus one loan without a principal.
pub fn demo_snapshot() -> LoanSnapshot {
    let floor_price_usd = 100_000.0;
    let mut loans = demo_loans("demo", floor_price_usd, 48, |i| {
        8.0 + f64::from((i * 37) % 97) * 1.4
    });
    loans.push(Loan::with_principal("demo-missing-principal", None));

    LoanSnapshot::new("Demo Punks", floor_price_usd, loans)
}

/// Second demo collection for the selector: fewer loans, all between 20%
/// and 170% LTV.
fn demo_glyphs_snapshot() -> LoanSnapshot {
    let floor_price_usd = 45_000.0;
    let loans = demo_loans("glyph", floor_price_usd, 30, |i| {
        20.0 + f64::from((i * 53) % 61) * 2.5
    });
    LoanSnapshot::new("Demo Glyphs", floor_price_usd, loans)
}

fn demo_loans(
    prefix: &str,
    floor_price_usd: f64,
    count: u32,
    ltv: impl Fn(u32) -> f64,
) -> Vec<Loan> {
    let protocols = ["NFTfi v2", "NFTfi v2.3", "NFTfi v3"];
    (0..count)
        .map(|i| {
            let mut loan = Loan::with_principal(
                format!("{prefix}-{:03}", i + 1),
                Some(floor_price_usd * ltv(i) / 100.0),
            );
            loan.protocol_name = protocols[(i % 3) as usize].to_string();
            loan.nft_id = format!("{}", 1000 + i * 13);
            loan.apr = Some(12.0 + f64::from(i % 9) * 3.5);
            loan.duration_days = Some(f64::from(30 + (i % 4) * 30));
            loan.hours_until_due = Some(f64::from(6 + (i * 11) % 700));
            loan
        })
        .collect()
}

fn format_usd(value: f64) -> String {
    if !value.is_finite() {
        return "-".to_string();
    }
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("{sign}${grouped}.{:02}", cents % 100)
}

fn format_pct(value: f64) -> String {
    if value.is_infinite() {
        return "&infin;".to_string();
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded}%")
}

fn parse_number(name: &str, raw: Option<&str>) -> Result<Option<f64>, DashboardError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse::<f64>()
            .ok()
            .filter(|parsed| parsed.is_finite())
            .map(Some)
            .ok_or_else(|| {
                DashboardError::bad_request(format!("{name} must be a number, got {value}"))
            }),
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn DashboardSnapshotSource>,
}

fn log_request(route: &'static str, query: &DashboardQuery) {
    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        route,
        collection = query.requested_collection().unwrap_or(""),
        policy = query.policy.as_deref().unwrap_or("fixed"),
        ltv = query.ltv.as_deref().unwrap_or("")
    );
}

/// Applies `collection=` before reading, so the response describes the
/// requested collection.
fn load_snapshot(
    source: &dyn DashboardSnapshotSource,
    query: &DashboardQuery,
) -> Result<LoanSnapshot, DashboardError> {
    if let Some(name) = query.requested_collection() {
        source.select_collection(name)?;
    }
    Ok(source.snapshot())
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Html<String>, DashboardError> {
    log_request("/dashboard", &query);
    let view = DashboardView::build(load_snapshot(state.source.as_ref(), &query)?, &query)?;
    let collections = state.source.collections();
    Ok(Html(render_dashboard_html(&view, &query, &collections)))
}

async fn get_dashboard_series(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<SeriesResponse>, DashboardError> {
    log_request("/dashboard/series", &query);
    let view = DashboardView::build(load_snapshot(state.source.as_ref(), &query)?, &query)?;
    Ok(Json(SeriesResponse {
        collection: view.snapshot_collection,
        stats: view.stats,
        series: view.series,
    }))
}

async fn get_dashboard_loans(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<LoansResponse>, DashboardError> {
    log_request("/dashboard/loans", &query);
    let view = DashboardView::build(load_snapshot(state.source.as_ref(), &query)?, &query)?;
    Ok(Json(view.into_loans_response()))
}

async fn get_dashboard_collections(
    State(state): State<DashboardAppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<CollectionsResponse>, DashboardError> {
    log_request("/dashboard/collections", &query);
    let snapshot = load_snapshot(state.source.as_ref(), &query)?;
    Ok(Json(CollectionsResponse {
        selected: snapshot.collection,
        loading: snapshot.loading,
        collections: state.source.collections(),
    }))
}
