//! LTV distribution engine for NFT-collateralized loans.
//!
//! Loans and a collection floor price go in; a depth-chart series comes out,
//! together with a click-to-filter matcher that is guaranteed to select the
//! same loans the clicked bucket counted. Around that core sit the NFTfi and
//! Reservoir ingestion clients, a session that discards stale fetches, and an
//! axum dashboard.

mod bucket;
mod dashboard;
mod distribution;
mod loan;
mod ltv;
mod matcher;
mod nftfi;
mod observability;
mod session;

pub use bucket::{
    BreakpointRange, BucketPolicy, BucketPolicyError, BucketScheme, PolicyKind, PolicyRequest,
    DEFAULT_BINS_PER_DECADE, DEFAULT_FIXED_WIDTH, DEFAULT_SYMLOG_LINEAR_WIDTH,
    DEFAULT_SYMLOG_STEP, DEFAULT_TIERS, MIN_TABLE_LTV,
};
pub use dashboard::{
    dashboard_router, demo_snapshot, render_dashboard_html, CollectionsResponse,
    DashboardError, DashboardQuery, DashboardSnapshotSource, DashboardView,
    InMemorySnapshotSource, LiveSnapshotSource, LiveSourceConfig, LoanRow, LoanSnapshot,
    LoansResponse, SeriesResponse, DEFAULT_REFRESH_INTERVAL_MS,
};
pub use distribution::{
    aggregate, ltv_range, ltv_stats, modal_center, resolve_policy, DepthPoint,
    DistributionBucket, DistributionSeries, HistogramPoint, LoanStats, LtvRange, SeriesSegment,
    STANDARD_SEGMENTS,
};
pub use loan::{Loan, LoanSort, SortDirection, SortField};
pub use ltv::{calculate_floor_price, calculate_ltv, loan_ltv};
pub use matcher::{
    is_loan_matching_ltv, match_loans, FilterState, LoanFilter, MatchMode,
    DEFAULT_TOLERANCE_PERCENT,
};
pub use nftfi::{
    collections_from_reservoir, floor_price_from_reservoir, normalize_loans,
    parse_loans_response, top_collections, Clock, CollectionSummary, FetchPolicy, HttpFetcher,
    IngestError, LimitedFetcher, ManualClock, NftfiClient, NftfiConfig, NftfiLoansResponse,
    RateLimiter, RawNftfiLoan, ReqwestBlockingFetcher, ReservoirClient, ReservoirConfig,
    SystemClock, NFTFI_BASE_URL, NFTFI_LOANS_BY_COLLECTION_PATH, RESERVOIR_COLLECTIONS_URL,
    RESERVOIR_LISTING_LIMIT, TOP_COLLECTIONS_LIMIT,
};
pub use observability::{
    env_flag, init_logging, log_app_bind, log_app_start, log_live_config, log_live_cycle,
    log_source_selected, logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
    DASHBOARD_ROUTES,
};
pub use session::{DashboardSession, FetchGenerations, FetchOutcome, FetchToken, SessionStatus};
