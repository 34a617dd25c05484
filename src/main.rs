//! examcore binary entry point.

use examcore::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli::default_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
