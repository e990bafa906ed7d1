use std::sync::Arc;

use trapi_throttle::config::{AppConfig, build_http_client};
use trapi_throttle::registry::Registry;
use trapi_throttle::server::{AppState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("trapi-throttle starting");

    let config = AppConfig::from_env();
    let http_client = build_http_client(config.default_upstream_timeout);
    let registry = Arc::new(Registry::new(http_client.clone()));
    let state = AppState {
        registry,
        http_client,
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, router)
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("trapi-throttle shutting down");
    Ok(())
}
