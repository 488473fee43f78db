use anyhow::Result;
use spout::config::Config;
use spout::listener::ListenerController;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "spout.toml".to_string());
    let config = Config::load_or_default(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting spout listener");
    info!("Loaded config from {}", config_path);

    let listener = ListenerController::bind(&config.server, &config.timeouts).await?;
    let handle = listener.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping listener");
            handle.shutdown();
        }
    });

    listener.run().await?;
    Ok(())
}
