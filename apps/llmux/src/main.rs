use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = cli::load_config()?;
    if config.service_keys.is_empty() {
        tracing::warn!("no credentials configured; every request will fail admission");
    }
    if config.geoblock_enabled {
        tracing::info!(
            countries = ?config.geoblock_allowed_countries,
            "geoblock enabled (enforced by the ingress collaborator)"
        );
    }

    let client = std::sync::Arc::new(llmux_core::WreqUpstreamClient::new(
        llmux_core::UpstreamClientConfig::default(),
    )?);
    let state = llmux_core::AppState::new(config.clone(), client).await;

    let app = axum::Router::new()
        .merge(llmux_router::info_router(state.clone()))
        .merge(llmux_router::proxy_router(state));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
