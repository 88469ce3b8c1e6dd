//! Broker topology: one durable fanout exchange, one durable queue per service.
//!
//! Declarations are idempotent. Re-declaring with different parameters
//! surfaces as [`BusError::Topology`].

use tracing::info;

use super::{BrokerSession, Result};

/// Suffix of the per-service dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Build the dead-letter queue name for a service queue.
pub fn dead_letter_queue_for(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// Exchange routing behavior.
///
/// Only fanout is used: every bound queue receives every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    /// Ready messages at declaration time.
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Queue-to-exchange binding. Fanout ignores the routing key, so it is
/// always empty here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn unconditional(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: String::new(),
        }
    }
}

/// Everything one process declares before publishing or consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    /// Queues bound to the exchange.
    pub bound_queues: Vec<QueueSpec>,
    /// Queues declared but never bound (dead-letter targets).
    pub unbound_queues: Vec<QueueSpec>,
}

impl Topology {
    /// Producer side: only the exchange.
    pub fn producer(exchange: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeSpec::fanout(exchange),
            bound_queues: Vec::new(),
            unbound_queues: Vec::new(),
        }
    }

    /// Consumer side: exchange, the service queue bound to it, and
    /// optionally the service's dead-letter queue.
    pub fn consumer(exchange: impl Into<String>, queue: &str, dead_letter: bool) -> Self {
        let unbound_queues = if dead_letter {
            vec![QueueSpec::durable(dead_letter_queue_for(queue))]
        } else {
            Vec::new()
        };

        Self {
            exchange: ExchangeSpec::fanout(exchange),
            bound_queues: vec![QueueSpec::durable(queue)],
            unbound_queues,
        }
    }

    /// Declare exchange, queues and bindings. Returns the bound queues'
    /// handles in declaration order.
    pub async fn declare(&self, session: &dyn BrokerSession) -> Result<Vec<QueueHandle>> {
        session.declare_exchange(&self.exchange).await?;
        info!(exchange = %self.exchange.name, "Exchange declared");

        let mut handles = Vec::with_capacity(self.bound_queues.len());
        for spec in &self.bound_queues {
            let handle = session.declare_queue(spec).await?;
            session
                .bind_queue(&Binding::unconditional(&spec.name, &self.exchange.name))
                .await?;
            info!(
                queue = %handle.name,
                exchange = %self.exchange.name,
                ready = handle.message_count,
                "Queue declared and bound"
            );
            handles.push(handle);
        }

        for spec in &self.unbound_queues {
            session.declare_queue(spec).await?;
            info!(queue = %spec.name, "Dead-letter queue declared");
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BrokerConnector, BusError, InMemoryBroker, OutboundMessage};

    #[test]
    fn test_consumer_topology_with_dead_letter() {
        let topology = Topology::consumer("orders_exchange", "email_queue", true);
        assert_eq!(topology.exchange.kind, ExchangeKind::Fanout);
        assert!(topology.exchange.durable);
        assert_eq!(topology.bound_queues, vec![QueueSpec::durable("email_queue")]);
        assert_eq!(
            topology.unbound_queues,
            vec![QueueSpec::durable("email_queue.dlq")]
        );
    }

    #[test]
    fn test_binding_has_empty_routing_key() {
        let binding = Binding::unconditional("sms_queue", "orders_exchange");
        assert_eq!(binding.routing_key, "");
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = InMemoryBroker::new();
        let session = broker.connector().connect("memory://").await.unwrap();
        let topology = Topology::consumer("orders_exchange", "analytics_queue", true);

        topology.declare(session.as_ref()).await.unwrap();
        session
            .publish("orders_exchange", "", OutboundMessage::persistent_json(b"{}".to_vec()))
            .await
            .unwrap();

        // Second declaration keeps the queued message
        let handles = topology.declare(session.as_ref()).await.unwrap();
        assert_eq!(handles[0].name, "analytics_queue");
        assert_eq!(handles[0].message_count, 1);
    }

    #[tokio::test]
    async fn test_durability_conflict_is_configuration_error() {
        let broker = InMemoryBroker::new();
        let session = broker.connector().connect("memory://").await.unwrap();
        Topology::producer("orders_exchange")
            .declare(session.as_ref())
            .await
            .unwrap();

        let transient = ExchangeSpec {
            durable: false,
            ..ExchangeSpec::fanout("orders_exchange")
        };
        let err = session.declare_exchange(&transient).await.unwrap_err();
        assert!(matches!(err, BusError::Topology(_)));
        assert!(err.is_configuration());

        session
            .declare_queue(&QueueSpec::durable("inventory_queue"))
            .await
            .unwrap();
        let err = session
            .declare_queue(&QueueSpec {
                name: "inventory_queue".to_string(),
                durable: false,
            })
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
