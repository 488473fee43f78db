use anyhow::Result;
use futures::future::join_all;
use spout::client::ClientController;
use spout::config::Config;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Runs `client.concurrency` requests against the configured listener at once
/// and reports how each one went.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "spout.toml".to_string());
    let config = Config::load_or_default(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let concurrency = config.client.concurrency.max(1);
    info!(
        "Sending {} concurrent requests to {}:{}",
        concurrency, config.client.host, config.client.port
    );

    let start = Instant::now();
    let token = config.client.token.as_bytes();

    let requests = (0..concurrency).map(|id| {
        let config = &config;
        async move {
            let mut client = ClientController::from_config(&config.client, &config.timeouts)?;
            let response = client.request(token).await?;
            Ok::<_, spout::Error>((id, response.len()))
        }
    });

    let mut completed = 0usize;
    let mut bytes = 0usize;
    for outcome in join_all(requests).await {
        match outcome {
            Ok((id, len)) => {
                info!("Client {} received {} bytes", id, len);
                completed += 1;
                bytes += len;
            }
            Err(e) => error!("Client failed: {}", e),
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    info!(
        "{}/{} clients completed, {} bytes in {:.3}s",
        completed, concurrency, bytes, elapsed
    );

    if completed < concurrency {
        anyhow::bail!("{} of {} clients failed", concurrency - completed, concurrency);
    }
    Ok(())
}
