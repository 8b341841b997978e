use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use mgate_core::dispatch::Dispatcher;
use mgate_core::ledger::{Ledger, PriceTable, QuotaStore};
use mgate_core::relay::{RelayController, RelayOptions};
use mgate_core::transport::{UpstreamClientConfig, WreqUpstreamClient};
use mgate_core::{AuthSnapshot, ChannelRegistry, RelayConfig, TokenAuth};
use mgate_storage::{GatewayStore, RetentionSweeper};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::from_env()?;
    info!(event = "starting", host = %config.host, port = config.port);

    let store = GatewayStore::connect(&config.dsn)
        .await
        .context("connect storage")?;
    store.sync().await.context("schema sync")?;

    let channels = store.load_channels().await.context("load channels")?;
    let auth_rows = store.load_auth().await.context("load tokens and users")?;

    let auth = Arc::new(TokenAuth::new(AuthSnapshot::from_rows(&auth_rows)));
    let registry = Arc::new(ChannelRegistry::new(
        &channels,
        config.auto_disable_channel,
        1,
    ));
    let dispatcher = Dispatcher::new(registry.clone(), config.max_retries, config.retry_cooldown);
    let quota_store: Arc<dyn QuotaStore> = Arc::new(store.clone());
    let ledger = Arc::new(Ledger::new(quota_store, PriceTable::default()));
    let client = Arc::new(WreqUpstreamClient::new(UpstreamClientConfig::default()));

    let controller = Arc::new(RelayController::new(
        config.clone(),
        RelayOptions::default(),
        auth.clone(),
        dispatcher,
        ledger,
        client,
        Some(store.clone()),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Channel + auth snapshots refresh from the store on a timer.
    tokio::spawn(registry.clone().run_refresh(
        store.clone(),
        config.channel_refresh,
        shutdown_rx.clone(),
    ));
    {
        let store = store.clone();
        let auth = auth.clone();
        let interval = config.channel_refresh;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(rows) = store.load_auth().await {
                            auth.replace_snapshot(AuthSnapshot::from_rows(&rows));
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Log-detail retention sweep, hourly.
    let sweeper = RetentionSweeper::new(
        store.clone(),
        config.detailed_log_retention_days,
        std::time::Duration::from_secs(3600),
    );
    tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let app = mgate_router::relay_router(controller);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", addr = %bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    })
    .await?;
    Ok(())
}
