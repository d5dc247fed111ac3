use std::sync::Arc;

use medipaw_api::app::{build_app, AppConfig};
use medipaw_infra::{ExpirySweeper, SweeperConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    medipaw_observability::init();

    let gateway_secret = std::env::var("GATEWAY_SECRET").unwrap_or_else(|_| {
        tracing::warn!("GATEWAY_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let currency = std::env::var("CURRENCY").unwrap_or_else(|_| "INR".to_string());
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let (app, state) = build_app(AppConfig {
        gateway_secret,
        currency,
    });

    let sweeper = ExpirySweeper::spawn(Arc::clone(&state.service), SweeperConfig::default());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the sweep thread before the process exits.
    sweeper.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
