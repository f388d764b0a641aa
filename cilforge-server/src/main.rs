use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use cilforge_server::config::{CliArgs, LogFormat, ServerConfig};
use cilforge_server::http;
use cilforge_server::pipeline::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = ServerConfig::load(&args).map_err(anyhow::Error::msg)?;
    init_tracing(&config);

    tracing::info!(listen_addr = %config.listen_addr, cache_root = %config.cache_root.display(), "starting cilforge-server");

    let state = Arc::new(AppState::new(config));
    let app = http::router(state.clone()).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(state.config.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
