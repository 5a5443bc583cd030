use concierge::server;
use concierge::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("concierge=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    server::serve(config).await
}
