use std::{net::SocketAddr, sync::Arc};

use nft_ltv_depth::{
    dashboard_router, env_flag, init_logging, log_app_bind, log_app_start, log_live_config,
    log_source_selected, logging_config_from_env, DashboardSnapshotSource,
    InMemorySnapshotSource, LiveSnapshotSource, LiveSourceConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let addr: SocketAddr = std::env::var("LTV_DASHBOARD_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let source: Arc<dyn DashboardSnapshotSource> = source_from_env();
    let app = dashboard_router(source);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn source_from_env() -> Arc<dyn DashboardSnapshotSource> {
    if env_flag("LTV_DASHBOARD_USE_DEMO") {
        let demo = InMemorySnapshotSource::demo();
        let collection = demo.snapshot().collection;
        log_source_selected("demo", &collection, Some("LTV_DASHBOARD_USE_DEMO"));
        return Arc::new(demo);
    }

    let cfg = LiveSourceConfig::from_env();
    log_source_selected("live", &cfg.collection, None);
    log_live_config(&cfg);
    Arc::new(LiveSnapshotSource::spawn(cfg))
}
