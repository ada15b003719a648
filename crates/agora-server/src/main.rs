use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agora_db::Database;
use agora_gateway::{Hub, HubConfig, JwtVerifier, reaper};
use agora_server::{ServerConfig, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "agora=debug,agora_server=debug,agora_api=debug,agora_gateway=debug,tower_http=debug".into()
            }),
        )
        .init();

    // Config
    let server = ServerConfig::from_env()?;
    let hub_config = HubConfig::from_env()?;
    info!(?hub_config, "hub configuration");

    // Init database
    let db = Database::open(&PathBuf::from(&server.db_path))?;

    let hub = Hub::new(
        hub_config.clone(),
        Arc::new(db),
        Arc::new(JwtVerifier::new(&server.jwt_secret)),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(reaper::run_reaper_loop(
        hub.clone(),
        hub_config.reaper_interval,
        shutdown.clone(),
    ));

    let app = router(hub);

    let addr: SocketAddr = format!("{}:{}", server.host, server.port).parse()?;
    info!("agora listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("agora stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    shutdown.cancel();
}
