//! AMQP (RabbitMQ) session.
//!
//! One connection and one channel per session. The connection comes from a
//! single-slot deadpool so a dead connection is never handed out again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Object, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    Acker, Binding, BrokerConnector, BrokerSession, BusError, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueHandle, QueueSpec, Result,
};

/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// How often `closed()` re-checks connection status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Opens [`AmqpSession`]s against a RabbitMQ URL.
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerSession>> {
        let manager = Manager::new(url.to_string(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let connection = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to connect: {}", e))
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let on_connection_error = closed.clone();
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection error");
            on_connection_error.send_replace(true);
        });
        let on_channel_error = closed.clone();
        channel.on_error(move |e| {
            error!(error = %e, "AMQP channel error");
            on_channel_error.send_replace(true);
        });

        info!(url = %url, channel_id = channel.id(), "Connected to AMQP");

        Ok(Arc::new(AmqpSession {
            _pool: pool,
            connection,
            channel,
            closed,
        }))
    }
}

/// RabbitMQ session via lapin.
pub struct AmqpSession {
    _pool: Pool,
    connection: Object,
    channel: Channel,
    closed: Arc<watch::Sender<bool>>,
}

impl AmqpSession {
    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let kind = match spec.kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("exchange", &spec.name, e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        self.ensure_open()?;
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("queue", &spec.name, e))?;

        Ok(QueueHandle {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("binding for", &binding.queue, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.ensure_open()?;

        let mut properties =
            BasicProperties::default().with_content_type(message.content_type.as_str().into());
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        // No confirm mode on this channel: resolves to NotRequested at once
        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;

        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "AMQP consumer started");

        let stream = consumer.map(|delivery| {
            let lapin::message::Delivery {
                data,
                redelivered,
                delivery_tag,
                acker,
                properties,
                ..
            } = delivery.map_err(|e| BusError::Subscribe(format!("Delivery failed: {}", e)))?;

            let headers = properties
                .headers()
                .as_ref()
                .map(from_field_table)
                .unwrap_or_default();

            Ok(Delivery::new(
                data,
                headers,
                redelivered,
                delivery_tag,
                Box::new(LapinAcker { acker }),
            ))
        });

        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);
        loop {
            if !self.is_connected() {
                return;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = poll.tick() => {}
            }
        }
    }

    async fn close_channel(&self) -> Result<()> {
        self.closed.send_replace(true);
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))
    }

    async fn close_connection(&self) -> Result<()> {
        self.closed.send_replace(true);
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

/// PRECONDITION_FAILED means an existing entity has other properties.
fn declare_error(what: &str, name: &str, e: lapin::Error) -> BusError {
    if let lapin::Error::ProtocolError(amqp) = &e {
        if matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            warn!(name = %name, error = %e, "Declaration conflicts with existing {}", what);
            return BusError::Topology(format!("{} '{}': {}", what, name, e));
        }
    }
    BusError::Connection(format!("Failed to declare {} '{}': {}", what, name, e))
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            key.clone().into(),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

/// String-valued headers only; others are skipped.
fn from_field_table(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::LongUInt(n) => n.to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_survive_field_table() {
        let mut headers = BTreeMap::new();
        headers.insert("x-orderbus-source-queue".to_string(), "sms_queue".to_string());
        headers.insert("x-orderbus-attempts".to_string(), "5".to_string());

        let table = to_field_table(&headers);
        assert_eq!(table.inner().len(), 2);
        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn test_non_string_headers() {
        let mut table = FieldTable::default();
        table.insert("count".into(), AMQPValue::LongUInt(3));
        table.insert("flag".into(), AMQPValue::Boolean(true));

        let headers = from_field_table(&table);
        assert_eq!(headers.get("count").map(String::as_str), Some("3"));
        assert!(!headers.contains_key("flag"));
    }
}
