//! Broker delivery layer.
//!
//! This module contains:
//! - `BrokerConnector` / `BrokerSession` traits: one connection plus one channel
//! - `Delivery` and `Acker`: a received message and its ack/nack handle
//! - Topology, connection management, publishing and the consumer loop
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod supervisor;
pub mod topology;


// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use connection::{ConnectionManager, RetryPolicy};
pub use consumer::{ConsumerExit, ConsumerLoop, EventHandler, HandlerError, RedeliveryPolicy};
pub use memory::{InMemoryBroker, MemoryConnector};
pub use publisher::Publisher;
pub use supervisor::SessionSupervisor;
pub use topology::{Binding, ExchangeKind, ExchangeSpec, QueueHandle, QueueSpec, Topology};

/// Name of the fanout exchange shared by every service.
pub const ORDERS_EXCHANGE: &str = "orders_exchange";

/// Content type of every envelope body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker unreachable after {attempts} attempts: {last_error}")]
    Unrecoverable { attempts: u32, last_error: String },

    #[error("Topology configuration error: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel closed")]
    Closed,
}

impl BusError {
    /// True for declaration conflicts, which retrying can never fix.
    pub fn is_configuration(&self) -> bool {
        matches!(self, BusError::Topology(_))
    }

    /// True once the connection retry budget is spent.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, BusError::Unrecoverable { .. })
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message handed to the broker for routing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    /// Ask the broker to write the message to stable storage.
    pub persistent: bool,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    /// Persistent JSON message with no headers.
    pub fn persistent_json(payload: Vec<u8>) -> Self {
        Self {
            payload,
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_string(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Ack/nack handle for one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Permanently remove the message from its queue.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Return (`requeue = true`) or drop the message.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A message received from a queue.
///
/// Holding a `Delivery` occupies one prefetch slot until it is acked or nacked.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Set by the broker when this message was delivered before.
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
        delivery_tag: u64,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            payload,
            headers,
            redelivered,
            delivery_tag,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Traits
// ============================================================================

/// Opens sessions against a broker address.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// One connection attempt. Retrying is the caller's concern.
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerSession>>;
}

/// One open connection plus its single multiplexed channel.
///
/// Implementations must be safe to share between tasks.
///
/// Implementations:
/// - `AmqpSession`: RabbitMQ via lapin
/// - `MemorySession`: in-process broker for tests and standalone mode
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle>;

    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    /// Route a message through `exchange`. The empty exchange name addresses
    /// the broker's default exchange, which routes by queue name.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage)
        -> Result<()>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged deliveries.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    /// Connection and channel are both open.
    fn is_connected(&self) -> bool;

    /// Resolves once the session is no longer connected, for any reason.
    async fn closed(&self);

    async fn close_channel(&self) -> Result<()>;

    async fn close_connection(&self) -> Result<()>;
}
