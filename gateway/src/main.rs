use gps_gateway::bus::LapinBus;
use gps_gateway::codec::Codec;
use gps_gateway::config::Config;
use gps_gateway::dispatcher::Dispatcher;
use gps_gateway::listener;
use gps_gateway::metrics::Metrics;
use gps_gateway::registry::Registry;
use gps_gateway::session::SessionContext;
use gps_gateway::store::PgStore;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .json()
        .init();
    info!("gps-gateway starting");

    let store = PgStore::connect(&config.database_url).await.unwrap_or_else(|e| {
        eprintln!("[FATAL] could not connect to DATABASE_URL: {e}");
        std::process::exit(1);
    });
    let store = Arc::new(store);

    let bus = LapinBus::connect(&config.rabbitmq_url).await.unwrap_or_else(|e| {
        eprintln!("[FATAL] could not connect to RABBITMQ_URL: {e}");
        std::process::exit(1);
    });
    let bus = Arc::new(bus);

    let metrics = Arc::new(Metrics::new());
    let codec = Arc::new(Codec::new());
    let registry = Registry::new(store.clone(), metrics.clone());
    registry.spawn_sweeps();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dispatcher = Dispatcher::new(registry.clone(), store.clone(), bus.clone(), codec.clone(), metrics.clone());
    let dispatcher_shutdown = shutdown_rx.clone();
    let dispatcher_task = tokio::spawn(async move {
        if let Err(e) = dispatcher.run(dispatcher_shutdown).await {
            error!(error = %e, "dispatcher_exited");
        }
    });

    let ctx = Arc::new(SessionContext { registry, store, bus, metrics, codec });
    let bind_addr = config.bind_addr();

    tokio::select! {
        res = listener::serve(&bind_addr, ctx, shutdown_rx) => {
            if let Err(e) = res {
                eprintln!("[FATAL] listener exited: {e}");
                std::process::exit(1);
            }
        }
        _ = wait_for_shutdown_signal() => {
            info!("shutdown_signal_received");
        }
    }

    // Spec §5: stop accepting, let sessions/dispatcher observe the signal
    // and drain, then close. Sessions already racing a read will notice
    // `shutdown.changed()` on their next select tick and close their socket.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher_task).await;
    info!("shutdown_complete");
}

/// Spec §6: SIGINT/SIGTERM both trigger the same graceful-stop path.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
