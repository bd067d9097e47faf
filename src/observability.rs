//! Logging configuration from `LTV_LOG_*`, subscriber setup and the
//! process-level events of the dashboard server.
//!
//! Every event carries a `component` and a dotted `event` name:
//!
//! | component | events |
//! |---|---|
//! | `dashboard_server` | `app.start`, `app.bind`, `source.selected`, `source.live.config` |
//! | `dashboard` | `http.snapshot.request` |
//! | `live_source` | `live_source.cycle.*`, `live_source.init.error`, `live_source.wake.error` |
//! | `session` | `session.collection.selected`, `session.fetch.*` |
//! | `nftfi`, `reservoir`, `ingest` | fetch start/finish/error, retries, rate-limit waits |
//! | `distribution`, `ltv` | skipped loans and aggregation summaries, at `debug` |

use std::env;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::dashboard::LiveSourceConfig;
use crate::session::FetchToken;

/// Routes served by `dashboard_router`, as logged on bind.
pub const DASHBOARD_ROUTES: &str =
    "/dashboard,/dashboard/series,/dashboard/loans,/dashboard/collections";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("LTV_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("LTV_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("LTV_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(config: &LoggingConfig) {
    info!(
        component = "dashboard_server",
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "dashboard_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        routes = DASHBOARD_ROUTES
    );
}

pub fn log_source_selected(source: &str, collection: &str, reason: Option<&str>) {
    match reason {
        Some(reason) => info!(
            component = "dashboard_server",
            event = "source.selected",
            source,
            collection,
            reason
        ),
        None => info!(
            component = "dashboard_server",
            event = "source.selected",
            source,
            collection
        ),
    }
}

/// Live source settings. The Reservoir key itself is never logged.
pub fn log_live_config(cfg: &LiveSourceConfig) {
    info!(
        component = "dashboard_server",
        event = "source.live.config",
        collection = %cfg.collection,
        contract = cfg.contract.as_deref().unwrap_or(""),
        floor_override = ?cfg.floor_price_usd,
        refresh_interval_ms = cfg.refresh_interval_ms,
        reservoir_key = cfg.reservoir.api_key.is_some(),
        nftfi_base_url = %cfg.nftfi.base_url
    );
}

/// One applied live refresh: the loans and floor now served, or the error
/// shown next to the previous data.
pub fn log_live_cycle(token: &FetchToken, outcome: Result<(usize, f64), &str>, elapsed_ms: u64) {
    match outcome {
        Ok((loans, floor_price_usd)) => info!(
            component = "live_source",
            event = "live_source.cycle.applied",
            collection = token.collection(),
            generation = token.generation(),
            loans,
            floor_price_usd,
            elapsed_ms
        ),
        Err(error) => warn!(
            component = "live_source",
            event = "live_source.cycle.failed",
            collection = token.collection(),
            generation = token.generation(),
            error,
            elapsed_ms
        ),
    }
}

/// True when `name` is set to a truthy value (`1`, `true`, `yes`, `on`).
pub fn env_flag(name: &str) -> bool {
    env::var(name)
        .ok()
        .and_then(|raw| parse_bool(&raw))
        .unwrap_or(false)
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
