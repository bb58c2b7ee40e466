//! HTTP API for bindicator: postcode and property lookups of the next bin collection.

mod config;
mod error;
mod routes;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::net::TcpListener;

use bindicator_core::{
    cache::CacheStore,
    clock::{Clock, SystemClock},
    model::SourceKind,
    service::ResolutionService,
    verifier::JitterPacer,
};
use bindicator_provider_mock as mock;
use bindicator_provider_rbwm as rbwm;

use crate::config::ApiConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ApiConfig::from_env()?;
    telemetry::init(&config.log)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let plugin = match config.datasource {
        SourceKind::Mock => mock::plugin(Arc::clone(&clock)),
        SourceKind::Live => {
            let client = Client::builder()
                .user_agent(&config.user_agent)
                .timeout(config.upstream_timeout)
                .build()?;
            rbwm::plugin(client, &config.rbwm_url, Arc::clone(&clock))
        }
    };

    let store = CacheStore::open(&config.cache_path)
        .await
        .with_context(|| format!("opening cache at {}", config.cache_path.display()))?;
    tracing::info!(
        path = %config.cache_path.display(),
        entries = store.len().await,
        "cache loaded"
    );

    let (min_delay, max_delay) = config.verify_delay;
    let service = ResolutionService::new(
        plugin,
        Arc::new(store),
        clock,
        Arc::new(JitterPacer::new(min_delay, max_delay)),
        config.service_settings(),
    );

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        datasource = %config.datasource,
        debug = config.debug,
        "bindicator listening"
    );

    // warm yesterday's entries without holding up the listener
    let prefetch = service.clone();
    tokio::spawn(async move {
        let report = prefetch.refresh_stale().await;
        tracing::info!(
            refreshed = report.refreshed,
            failed = report.failed,
            "startup prefetch finished"
        );
    });

    let app = routes::router(service, config.debug);
    tokio::select! {
        result = axum::serve(listener, app) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }

    Ok(())
}
