//! Sidecar direct-TCP bridge (spec §4.4 / §6). A separate consumer on
//! `device_commands` that handles deliveries carrying `targetHost`/
//! `targetPort`/`rawCommand` by opening a one-shot TCP connection,
//! instead of going through the session registry like the main
//! dispatcher. Shares the queue but only acks payloads it recognizes.

use gps_gateway::bus::{Bus, LapinBus};
use gps_gateway::config::Config;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarPayload {
    target_host: String,
    target_port: u16,
    raw_command: String,
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .json()
        .init();
    info!(queue = config.queue_name, "gps-gateway-sidecar starting");

    let mut backoff = BACKOFF_MIN;
    loop {
        tokio::select! {
            result = connect_and_run(&config) => {
                match result {
                    Ok(()) => backoff = BACKOFF_MIN,
                    Err(e) => warn!(error = %e, backoff_secs = backoff.as_secs(), "sidecar_connection_lost"),
                }
            }
            _ = wait_for_shutdown_signal() => {
                info!("sidecar_shutdown_signal_received");
                return;
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, BACKOFF_MAX);
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn connect_and_run(config: &Config) -> Result<(), gps_gateway::error::AppError> {
    let bus = LapinBus::connect(&config.rabbitmq_url).await?;
    run_consumer(&bus, &config.queue_name, config.queue_ttl_ms).await
}

async fn run_consumer(bus: &LapinBus, queue_name: &str, queue_ttl_ms: Option<u64>) -> Result<(), gps_gateway::error::AppError> {
    bus.declare_queue_with_ttl(queue_name, queue_ttl_ms).await?;
    let mut consumer = bus.consume(queue_name, "gps-gateway-sidecar").await?;
    while let Some(delivery) = consumer.next().await {
        let parsed: Result<SidecarPayload, _> = serde_json::from_slice(&delivery.payload);
        let Ok(payload) = parsed else {
            // Not a sidecar-shaped payload (likely destined for the
            // in-process dispatcher instead) — leave it for that
            // consumer to ack.
            delivery.nack(true).await?;
            continue;
        };

        match write_raw_command(&payload).await {
            Ok(()) => {
                info!(host = payload.target_host, port = payload.target_port, "sidecar_write_ok");
                delivery.ack().await?;
            }
            Err(e) => {
                warn!(host = payload.target_host, port = payload.target_port, error = %e, "sidecar_write_failed");
                delivery.nack(true).await?;
            }
        }
    }
    Ok(())
}

async fn write_raw_command(payload: &SidecarPayload) -> std::io::Result<()> {
    let addr = format!("{}:{}", payload.target_host, payload.target_port);
    let mut resolved = tokio::net::lookup_host(&addr).await?;
    let target = resolved.next().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "dns resolution returned no addresses"))?;

    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.write_all(payload.raw_command.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
