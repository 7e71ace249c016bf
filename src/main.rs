use std::sync::Arc;
use std::time::Duration;
use tickvault::config::Config;
use tickvault::services::SqliteStore;
use tickvault::sources::{KlineHistoryClient, WsConnector};
use tickvault::AppState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickvault=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!("Starting tickvault server on {}:{}", config.host, config.port);

    let sqlite = Arc::new(SqliteStore::new(&config.database_path)?);
    info!("SQLite store opened at {}", config.database_path);

    let (state, pipelines) = AppState::new(config, sqlite, Arc::new(WsConnector));
    let background = state.spawn_background(pipelines);
    let config = Arc::clone(&state.config);

    // Backfill recent closed bars before going live
    if config.feed.backfill_limit > 0 {
        let history = KlineHistoryClient::new(config.feed.rest_url.clone());
        for key in &config.feed.subscriptions {
            if let Err(e) = history
                .backfill(&state.candles, &key.symbol, &key.interval, config.feed.backfill_limit)
                .await
            {
                warn!("Backfill of {} failed: {}", key, e);
            }
        }
    }

    for key in &config.feed.subscriptions {
        state.supervisor.subscribe(&key.symbol, &key.interval).await;
    }
    if config.feed.subscriptions.is_empty() {
        warn!("No market data subscriptions configured");
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = tickvault::app(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tickvault server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Dropping the state closes the queues so the writer and monitor drain and exit
    state.supervisor.shutdown().await;
    drop(state);
    for task in background {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Background task did not finish in time");
        }
    }

    Ok(())
}
