use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("duckchat_server=info".parse()?),
        )
        .init();

    let config = duckchat_server::config::ServerConfig::parse();
    tracing::info!("starting duckchat server on {}:{}", config.host, config.port);

    let (server, _topology) = duckchat_server::server::Server::bind(&config).await?;
    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("duckchat server terminated");
            Ok(())
        }
    }
}
