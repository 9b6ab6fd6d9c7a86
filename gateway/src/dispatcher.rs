//! Command dispatcher (spec §4.4): turns `device_commands` deliveries into
//! socket writes on the session the registry has for the target IMEI.

use crate::bus::{Bus, QUEUE_DEVICE_COMMANDS};
use crate::codec::Codec;
use crate::domain::{CommandKind, CommandStatus};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::store::{CommandStatusFields, Store};
use serde::Deserialize;
use std::sync::Arc;

/// Spec §6/§9 note 5: the producer side is inconsistent about field names
/// (`id` vs `commandId`, `command`/`command_type` vs `kind`, `parameters` vs
/// `params`) — accept all of them on input rather than guess which producer
/// sent the delivery.
#[derive(Debug, Deserialize)]
struct CommandPayload {
    #[serde(alias = "id", alias = "commandId")]
    command_id: String,
    imei: String,
    #[serde(alias = "command", alias = "command_type")]
    kind: CommandKind,
    #[serde(default, alias = "parameters")]
    params: serde_json::Value,
}

/// What to do with the broker delivery once `handle_one` has recorded a
/// terminal store outcome. Spec §4.4 step 4: requeue only for a transient
/// socket error; a permanent one (or any other terminal outcome) is acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Ack,
    Requeue,
}

/// Spec §4.4 step 4 / §7 `command_write`: only transient socket errors are
/// worth a requeue. A reset/broken/aborted connection means this socket is
/// dead for good, so requeuing just burns another delivery against it.
fn is_transient_write_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(e.kind(), WouldBlock | TimedOut | Interrupted)
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    codec: Arc<Codec>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn Store>, bus: Arc<dyn Bus>, codec: Arc<Codec>, metrics: Arc<Metrics>) -> Self {
        Dispatcher { registry, store, bus, codec, metrics }
    }

    /// Spec §5: in-flight deliveries that have not written to the socket
    /// must be nacked with requeue on shutdown. `shutdown` changing to
    /// `true` stops pulling new deliveries; dropping the lapin consumer
    /// leaves already-fetched-but-unacked deliveries for the broker to
    /// redeliver to another consumer.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), crate::error::AppError> {
        self.bus.declare_queue(QUEUE_DEVICE_COMMANDS).await?;
        let mut consumer = self.bus.consume(QUEUE_DEVICE_COMMANDS, "gps-gateway-dispatcher").await?;
        loop {
            let delivery = tokio::select! {
                d = consumer.next() => d,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("dispatcher_stopping_for_shutdown");
                        return Ok(());
                    }
                    continue;
                }
            };
            let Some(delivery) = delivery else { break };
            let payload = delivery.payload.clone();
            let outcome = match self.handle_one(&payload).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "dispatcher_handle_error");
                    DeliveryOutcome::Ack
                }
            };
            let ack_result = match outcome {
                DeliveryOutcome::Ack => delivery.ack().await,
                DeliveryOutcome::Requeue => delivery.nack(true).await,
            };
            if let Err(e) = ack_result {
                tracing::warn!(error = %e, "dispatcher_ack_error");
            }
        }
        Ok(())
    }

    async fn handle_one(&self, payload: &[u8]) -> Result<DeliveryOutcome, crate::error::AppError> {
        let parsed: CommandPayload = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "malformed_command_payload_dropped");
                return Ok(DeliveryOutcome::Ack);
            }
        };

        let handle = match self.registry.lookup(&parsed.imei) {
            Some(h) => h,
            None => {
                self.fail(&parsed.command_id, "Device not connected").await;
                return Ok(DeliveryOutcome::Ack);
            }
        };

        let fingerprint = match self.registry.fingerprint_of(&parsed.imei) {
            Some(fp) => fp,
            None => {
                self.fail(&parsed.command_id, "Device not connected").await;
                return Ok(DeliveryOutcome::Ack);
            }
        };

        let bytes = self.codec.by_fingerprint(fingerprint).encode_command(parsed.kind, &parsed.params);
        let bytes = match bytes {
            Some(b) => b,
            None => {
                self.fail(&parsed.command_id, "Invalid command format").await;
                return Ok(DeliveryOutcome::Ack);
            }
        };

        match handle.write_all(&bytes).await {
            Ok(()) => {
                let fields = CommandStatusFields::default();
                if let Err(e) = self.store.update_command_status(&parsed.command_id, CommandStatus::Sent, fields).await {
                    tracing::warn!(command_id = %parsed.command_id, error = %e, "command_sent_store_error");
                }
                self.registry.note_command_sent(&parsed.imei, &parsed.command_id);
                Metrics::inc(&self.metrics.commands_sent);
                Ok(DeliveryOutcome::Ack)
            }
            Err(e) => {
                let transient = is_transient_write_error(&e);
                self.fail(&parsed.command_id, &e.to_string()).await;
                Ok(if transient { DeliveryOutcome::Requeue } else { DeliveryOutcome::Ack })
            }
        }
    }

    async fn fail(&self, command_id: &str, error: &str) {
        let fields = CommandStatusFields { response: None, error: Some(error.to_string()) };
        if let Err(e) = self.store.update_command_status(command_id, CommandStatus::Failed, fields).await {
            tracing::warn!(command_id, error = %e, "command_fail_store_error");
        }
        Metrics::inc(&self.metrics.commands_failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_support::FakeBus;
    use crate::domain::Fingerprint;
    use crate::registry::SessionHandle;
    use crate::store::test_support::FakeStore;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    async fn loopback() -> (SessionHandle, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_, writer) = server.into_split();
        (SessionHandle { writer: Arc::new(tokio::sync::Mutex::new(writer)) }, client)
    }

    #[tokio::test]
    async fn unknown_imei_fails_command_with_device_not_connected() {
        let store = Arc::new(FakeStore::with_active_device(1, "123456789012345"));
        let cmd = store.create_command(1, "locate", serde_json::json!({})).await.unwrap();
        let registry = Registry::new(store.clone(), Arc::new(Metrics::new()));
        let bus = Arc::new(FakeBus::new());
        let dispatcher = Dispatcher::new(registry, store.clone(), bus, Arc::new(Codec::new()), Arc::new(Metrics::new()));

        let payload = serde_json::to_vec(&serde_json::json!({
            "command_id": cmd.id,
            "imei": "999999999999999",
            "kind": "locate",
            "params": {},
        }))
        .unwrap();
        dispatcher.handle_one(&payload).await.unwrap();

        assert!(store.get_device_by_imei("123456789012345").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn successful_write_marks_command_sent() {
        let store = Arc::new(FakeStore::with_active_device(1, "123456789012345"));
        let cmd = store.create_command(1, "locate", serde_json::json!({})).await.unwrap();
        let registry = Registry::new(store.clone(), Arc::new(Metrics::new()));
        let (handle, mut client) = loopback().await;
        registry.authenticate(1, "123456789012345", handle).await.unwrap();
        registry.set_fingerprint("123456789012345", Fingerprint::Gt06);

        let bus = Arc::new(FakeBus::new());
        let dispatcher = Dispatcher::new(registry, store.clone(), bus, Arc::new(Codec::new()), Arc::new(Metrics::new()));

        let payload = serde_json::to_vec(&serde_json::json!({
            "command_id": cmd.id,
            "imei": "123456789012345",
            "kind": "locate",
            "params": {},
        }))
        .unwrap();
        dispatcher.handle_one(&payload).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert!(n > 0);
    }

    /// Spec §4.4 step 4 / §7 `command_write`: a non-transient socket write
    /// error marks the command failed and the delivery is still acked
    /// (nothing left to retry against a dead socket).
    #[tokio::test]
    async fn non_transient_write_error_fails_command_and_acks() {
        let store = Arc::new(FakeStore::with_active_device(1, "123456789012345"));
        let cmd = store.create_command(1, "locate", serde_json::json!({})).await.unwrap();
        let registry = Registry::new(store.clone(), Arc::new(Metrics::new()));
        let (handle, _client) = loopback().await;
        // Shut down our own write half so the next write deterministically
        // fails with a non-transient error, instead of relying on the peer
        // dropping and the kernel eventually surfacing an RST/EPIPE.
        handle.shutdown().await;
        registry.authenticate(1, "123456789012345", handle).await.unwrap();
        registry.set_fingerprint("123456789012345", Fingerprint::Gt06);

        let bus = Arc::new(FakeBus::new());
        let dispatcher = Dispatcher::new(registry, store.clone(), bus, Arc::new(Codec::new()), Arc::new(Metrics::new()));

        let payload = serde_json::to_vec(&serde_json::json!({
            "command_id": cmd.id,
            "imei": "123456789012345",
            "kind": "locate",
            "params": {},
        }))
        .unwrap();
        let outcome = dispatcher.handle_one(&payload).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Ack);

        assert_eq!(store.command_status(&cmd.id).as_deref(), Some("failed"));
    }

    #[test]
    fn transient_write_errors_requeue_nontransient_do_not() {
        use std::io::{Error, ErrorKind};
        assert!(is_transient_write_error(&Error::new(ErrorKind::WouldBlock, "x")));
        assert!(is_transient_write_error(&Error::new(ErrorKind::TimedOut, "x")));
        assert!(is_transient_write_error(&Error::new(ErrorKind::Interrupted, "x")));
        assert!(!is_transient_write_error(&Error::new(ErrorKind::BrokenPipe, "x")));
        assert!(!is_transient_write_error(&Error::new(ErrorKind::ConnectionReset, "x")));
    }
}
