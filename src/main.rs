use anyhow::Result;
use axum::Router;
use pool_price_forecaster::{api, config, scheduler, telemetry};

use config::Config;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let _ = dotenvy::dotenv();

    let cfg = Config::load()?;
    let state = scheduler::AppState::new(cfg.clone()).await?;

    #[cfg(feature = "sim")]
    if !cfg.market_data.poll_enabled {
        use pool_price_forecaster::domain::Hyperparameters;

        let seeded =
            pool_price_forecaster::sim::seed_if_empty(state.store.as_ref(), 24 * 120).await?;
        if seeded > 0 {
            let features = state.recalculate_features().await?;
            info!(seeded, features, "bootstrapped synthetic history");
            if let Err(e) = state
                .trainer
                .train(Hyperparameters { l2_penalty: cfg.retraining.l2_penalty })
                .await
            {
                warn!(error = %e, "initial training failed, serving fallback forecasts");
            }
        }
    }

    let app: Router = api::router(state.clone(), &cfg);

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!(
            "Server binding to 0.0.0.0 - service will be accessible from network! \
            For production, bind to 127.0.0.1 unless behind a firewall/reverse proxy."
        );
    }

    info!(%addr, "starting pool price forecaster");

    scheduler::spawn_background_tasks(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
