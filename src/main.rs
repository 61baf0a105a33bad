use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use slotbook::config::Config;
use slotbook::engine::Engine;
use slotbook::notify::NotifyHub;
use slotbook::server::{self, Server};
use slotbook::{compactor, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    let tls_acceptor = server::load_tls_acceptor(config.tls.as_ref())?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(
        Engine::new(config.wal_path(), Arc::new(NotifyHub::new()))?
            .with_op_timeout(config.op_timeout),
    );
    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_engine, threshold).await;
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  venues: {}", engine.list_venues().len());
    info!("  max_connections: {}", config.max_connections);
    info!("  op_timeout: {}ms", config.op_timeout.as_millis());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    Server::new(engine, config.password.clone(), config.max_connections)
        .with_tls(tls_acceptor)
        .serve(listener, server::shutdown_signal())
        .await;

    info!("slotbook stopped");
    Ok(())
}
