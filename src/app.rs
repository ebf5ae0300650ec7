//! Application struct that encapsulates server assembly and serving logic.

use arc_swap::ArcSwap;
use causeway_core::config::{Config, ConfigWatcher};
use causeway_core::idempotency::IdempotencyStore;
use causeway_server::location::HttpAirportLocations;
use causeway_server::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct Application {
    config: Arc<ArcSwap<Config>>,
    app_router: axum::Router,
    idempotency: Arc<IdempotencyStore>,
    config_path: String,
    shutdown_timeout: u64,
}

impl Application {
    /// Assemble the application from a validated config: idempotency store,
    /// upstream location client, router.
    pub fn build(config: Config, config_path: String) -> anyhow::Result<Self> {
        let shutdown_timeout = config.shutdown_timeout;

        let locations = Arc::new(HttpAirportLocations::new(&config)?);
        let idempotency = Arc::new(IdempotencyStore::new(&config.idempotency));
        let config = Arc::new(ArcSwap::from_pointee(config));

        let state = AppState {
            config: config.clone(),
            idempotency: idempotency.clone(),
            locations,
        };
        let app_router = causeway_server::build_router(state);

        Ok(Self {
            config,
            app_router,
            idempotency,
            config_path,
            shutdown_timeout,
        })
    }

    /// Start serving HTTP, watch the config file, sweep expired idempotency
    /// records, and drain gracefully on ctrl-c.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Self {
            config,
            app_router,
            idempotency,
            config_path,
            shutdown_timeout,
        } = self;

        // Start config file watcher; the store picks up retention/timeout
        // changes without a restart.
        let watcher_store = idempotency.clone();
        let _watcher = ConfigWatcher::start(config_path, config.clone(), move |new_config| {
            watcher_store.update_config(&new_config.idempotency);
        })?;

        // Periodic eviction keeps the store bounded even for keys that are
        // never looked up again.
        let sweep_store = idempotency.clone();
        let sweep_config = config.clone();
        tokio::spawn(async move {
            loop {
                let retention_secs = sweep_config.load().idempotency.retention_secs;
                let interval = retention_secs.clamp(1, 60);
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let purged = sweep_store.purge_expired();
                if purged > 0 {
                    tracing::debug!("Evicted {purged} expired idempotency records");
                }
            }
        });

        let addr = {
            let cfg = config.load();
            format!("{}:{}", cfg.host, cfg.port)
        };
        tracing::info!("Starting HTTP server on {addr}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received, draining connections...");
        };

        axum::serve(
            listener,
            app_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tokio::time::sleep(Duration::from_secs(shutdown_timeout.min(5))).await;
        tracing::info!("Server shut down.");
        Ok(())
    }
}
