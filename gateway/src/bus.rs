//! Bus adapter (spec §4.5): typed publish/consume over the durable
//! message bus, backed by `lapin` (AMQP) the way the wider GPS tracking
//! pack wires its `rabbitmq::Rmq` consumer.

use crate::error::AppError;
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties};

pub const QUEUE_DEVICE_COMMANDS: &str = "device_commands";
pub const QUEUE_TRACKER_MESSAGES: &str = "tracker_messages";
pub const QUEUE_DEVICE_ALERTS: &str = "device_alerts";
pub const QUEUE_LOCATION_UPDATES: &str = "location_updates";
const QUEUE_MAX_LENGTH: i64 = 10_000;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A delivery pulled off a queue, carrying enough to ack/nack it without
/// the dispatcher knowing whether it's talking to real AMQP or a fake.
pub struct BusDelivery {
    pub payload: Vec<u8>,
    acker: DeliveryAcker,
}

enum DeliveryAcker {
    Lapin(Box<lapin::message::Delivery>),
    Test(tokio::sync::mpsc::UnboundedSender<(u64, bool, bool)>, u64),
}

impl BusDelivery {
    pub async fn ack(self) -> Result<(), AppError> {
        match self.acker {
            DeliveryAcker::Lapin(d) => Ok(d.ack(BasicAckOptions::default()).await?),
            DeliveryAcker::Test(tx, id) => {
                let _ = tx.send((id, true, false));
                Ok(())
            }
        }
    }

    pub async fn nack(self, requeue: bool) -> Result<(), AppError> {
        match self.acker {
            DeliveryAcker::Lapin(d) => Ok(d.nack(BasicNackOptions { requeue, ..Default::default() }).await?),
            DeliveryAcker::Test(tx, id) => {
                let _ = tx.send((id, false, requeue));
                Ok(())
            }
        }
    }
}

#[async_trait]
pub trait BusConsumer: Send {
    async fn next(&mut self) -> Option<BusDelivery>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn declare_queue(&self, name: &str) -> Result<(), AppError>;
    /// Like `declare_queue`, but with an optional `x-message-ttl` (ms) —
    /// used by the sidecar bridge's configurable `QUEUE_TTL` (spec §6).
    async fn declare_queue_with_ttl(&self, name: &str, ttl_ms: Option<u64>) -> Result<(), AppError> {
        let _ = ttl_ms;
        self.declare_queue(name).await
    }
    async fn publish(&self, queue: &str, payload: &serde_json::Value) -> Result<(), AppError>;
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn BusConsumer>, AppError>;
    async fn purge(&self, queue: &str) -> Result<(), AppError>;
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AppError>;
}

pub struct LapinBus {
    connection: Connection,
}

impl LapinBus {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        Ok(LapinBus { connection })
    }

    fn declare_args(&self, ttl_ms: Option<u64>) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert("x-max-length".into(), AMQPValue::LongInt(QUEUE_MAX_LENGTH as i32));
        if let Some(ttl) = ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl as i32));
        }
        args
    }
}

#[async_trait]
impl Bus for LapinBus {
    async fn declare_queue(&self, name: &str) -> Result<(), AppError> {
        self.declare_queue_with_ttl(name, None).await
    }

    async fn declare_queue_with_ttl(&self, name: &str, ttl_ms: Option<u64>) -> Result<(), AppError> {
        let channel = self.connection.create_channel().await?;
        // Queue declaration is idempotent: if it already exists with
        // incompatible arguments, lapin surfaces a channel-level error on
        // that channel only — treat it as a soft success rather than
        // failing startup (spec §4.5).
        let options = QueueDeclareOptions { durable: true, ..Default::default() };
        if let Err(e) = channel.queue_declare(name, options, self.declare_args(ttl_ms)).await {
            tracing::warn!(queue = name, error = %e, "queue_declare_soft_fail");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &serde_json::Value) -> Result<(), AppError> {
        let channel = self.connection.create_channel().await?;
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &bytes,
                BasicProperties::default().with_delivery_mode(2), // persistent
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn BusConsumer>, AppError> {
        let channel = self.connection.create_channel().await?;
        let consumer = channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;
        Ok(Box::new(LapinConsumer { consumer }))
    }

    async fn purge(&self, queue: &str) -> Result<(), AppError> {
        let channel = self.connection.create_channel().await?;
        channel.queue_purge(queue, QueuePurgeOptions::default()).await?;
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AppError> {
        let channel = self.connection.create_channel().await?;
        let decl = channel
            .queue_declare(queue, QueueDeclareOptions { durable: true, passive: true, ..Default::default() }, FieldTable::default())
            .await?;
        Ok(QueueStats { message_count: decl.message_count(), consumer_count: decl.consumer_count() })
    }
}

struct LapinConsumer {
    consumer: lapin::Consumer,
}

#[async_trait]
impl BusConsumer for LapinConsumer {
    async fn next(&mut self) -> Option<BusDelivery> {
        use futures_util::StreamExt;
        match self.consumer.next().await {
            Some(Ok(delivery)) => {
                let payload = delivery.data.clone();
                Some(BusDelivery { payload, acker: DeliveryAcker::Lapin(Box::new(delivery)) })
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "bus_consume_error");
                None
            }
            None => None,
        }
    }
}

pub mod test_support {
    //! An in-memory `Bus` fake for unit tests (registry/dispatcher tests
    //! run against this instead of a live RabbitMQ).
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[derive(Default)]
    pub struct FakeBus {
        pub published: DashMap<String, Vec<serde_json::Value>>,
        next_id: AtomicU64,
        deliveries: DashMap<String, mpsc::UnboundedSender<BusDelivery>>,
        receivers: DashMap<String, Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BusDelivery>>>>,
    }

    impl FakeBus {
        pub fn new() -> Self {
            Self::default()
        }

        /// Test helper: push a delivery directly into a queue's channel.
        pub fn push(&self, queue: &str, payload: serde_json::Value) {
            self.ensure_channel(queue);
            let bytes = serde_json::to_vec(&payload).unwrap();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
            let delivery = BusDelivery { payload: bytes, acker: DeliveryAcker::Test(ack_tx, id) };
            if let Some(tx) = self.deliveries.get(queue) {
                let _ = tx.send(delivery);
            }
        }

        fn ensure_channel(&self, queue: &str) {
            if !self.deliveries.contains_key(queue) {
                let (tx, rx) = mpsc::unbounded_channel();
                self.deliveries.insert(queue.to_string(), tx);
                self.receivers.insert(queue.to_string(), Arc::new(tokio::sync::Mutex::new(rx)));
            }
        }
    }

    #[async_trait]
    impl Bus for FakeBus {
        async fn declare_queue(&self, _name: &str) -> Result<(), AppError> {
            Ok(())
        }

        async fn publish(&self, queue: &str, payload: &serde_json::Value) -> Result<(), AppError> {
            self.published.entry(queue.to_string()).or_default().push(payload.clone());
            Ok(())
        }

        async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<Box<dyn BusConsumer>, AppError> {
            self.ensure_channel(queue);
            let rx = self.receivers.get(queue).unwrap().clone();
            Ok(Box::new(FakeConsumer { rx }))
        }

        async fn purge(&self, queue: &str) -> Result<(), AppError> {
            self.published.remove(queue);
            Ok(())
        }

        async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AppError> {
            let count = self.published.get(queue).map(|v| v.len()).unwrap_or(0);
            Ok(QueueStats { message_count: count as u32, consumer_count: 0 })
        }
    }

    struct FakeConsumer {
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BusDelivery>>>,
    }

    #[async_trait]
    impl BusConsumer for FakeConsumer {
        async fn next(&mut self) -> Option<BusDelivery> {
            self.rx.lock().await.recv().await
        }
    }
}
