use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loadgate::config::Config;
use loadgate::server::App;

#[derive(Parser)]
#[command(
    name = "loadgate",
    version,
    about = "HTTP reverse proxy with load balancing and rate limiting"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadgate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).map_err(|err| {
        tracing::error!(path = %args.config.display(), error = %err, "failed to load configuration");
        err
    })?;

    tracing::info!(
        listen = %config.listen_addr(),
        algorithm = %config.algorithm,
        backends = config.servers.len(),
        "configuration loaded"
    );

    let app = App::build(&config).map_err(|err| {
        tracing::error!(error = %err, "initialization failed");
        err
    })?;

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .map_err(|err| {
            tracing::error!(address = %config.listen_addr(), error = %err, "failed to bind listener");
            err
        })?;

    app.run(listener).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
