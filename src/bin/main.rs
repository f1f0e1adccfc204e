use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stanzad::{XmppServer, XmppServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("stanzad starting...");
    info!(version = env!("CARGO_PKG_VERSION"));

    let config = XmppServerConfig::load().context("failed to load server configuration")?;

    let server = XmppServer::bind(config)
        .await
        .context("failed to bind xmpp listeners")?;

    server.run().await.context("xmpp server exited with an error")?;

    Ok(())
}
