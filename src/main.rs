use std::sync::Arc;
use std::time::Duration;

use resync::config::ServerConfig;
use resync::demo;
use resync::routes;
use resync::services::channel::ChannelHub;
use resync::state::AppState;
use tracing_subscriber::EnvFilter;

const CLOCK_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let channels = ChannelHub::local(config.channel_backlog);
    let _clock = demo::spawn_clock(channels.clone(), CLOCK_PERIOD);

    let state = AppState::new(config, channels.clone(), demo::apis(channels), Arc::new(demo::DemoInit));
    let app = routes::app(state);

    let port = config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "resync listening");
    axum::serve(listener, app).await?;
    Ok(())
}
