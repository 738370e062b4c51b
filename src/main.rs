use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use rae_sync::{HttpStore, SyncConfig, SyncContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("RAE_SYNC_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    rae_sync::observability::init(metrics_port);

    let url = std::env::var("RAE_SYNC_URL").map_err(|_| "RAE_SYNC_URL must be set")?;
    let request_timeout: u64 = std::env::var("RAE_SYNC_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);
    let report_every: u64 = std::env::var("RAE_SYNC_REPORT_INTERVAL_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let config = SyncConfig::from_env();

    let store = Arc::new(HttpStore::new(
        &url,
        Duration::from_millis(request_timeout),
        config.feed_timeout,
    )?);

    info!("rae-sync against {url}");
    info!("  chunks: {} concurrent, failure policy {:?}", config.max_concurrent_chunks, config.chunk_failure);
    info!("  window granularity: {} min", config.window_granularity_min);
    info!("  claims: {}", if config.track_claims { "tracked" } else { "untracked" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let ctx = SyncContext::create(store, config);
    ctx.start().await?;

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    let mut report = tokio::time::interval(Duration::from_secs(report_every.max(1)));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let progress = ctx.progress();
                let view = ctx.view();
                info!(
                    tasks = ctx.tasks().await.len(),
                    claims = ctx.claims().await.len(),
                    queued = progress.queued,
                    in_flight = progress.in_flight,
                    completed = progress.completed,
                    failed = progress.failed,
                    cursor = ?ctx.cursor(),
                    window = %format!(
                        "{}..{}",
                        rae_sync::model::format_instant(view.window.start),
                        rae_sync::model::format_instant(view.window.end)
                    ),
                    "sync status"
                );
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    ctx.dispose().await;
    info!("rae-sync stopped");
    Ok(())
}
