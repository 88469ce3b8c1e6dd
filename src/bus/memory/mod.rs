//! In-memory broker for standalone mode and tests.
//!
//! Mirrors the broker semantics the services rely on:
//! - fanout exchanges copy every message to every bound queue
//! - the default exchange (`""`) routes by queue name
//! - declarations are idempotent, conflicting re-declarations fail
//! - prefetch bounds unacknowledged deliveries per consumer
//! - nack with requeue puts the message back at the head, flagged redelivered
//! - closing or losing a session requeues everything it had not acked

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{
    Acker, Binding, BrokerConnector, BrokerSession, BusError, Delivery, DeliveryStream,
    ExchangeSpec, OutboundMessage, QueueHandle, QueueSpec, Result,
};

// ============================================================================
// Broker state
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
    consumers: u32,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    /// exchange name -> bound queue names
    bindings: HashMap<String, BTreeSet<String>>,
    sessions: Vec<Weak<SessionShared>>,
    next_session: u64,
    next_tag: u64,
}

/// Snapshot of a message waiting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
}

/// Process-local broker. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

enum Take {
    Message(u64, StoredMessage),
    Empty,
    Closed,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening sessions against this broker.
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
            failures_remaining: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        })
    }

    /// Messages ready for delivery in `queue`, head first.
    pub fn queued(&self, queue: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| QueuedMessage {
                        payload: m.payload.clone(),
                        headers: m.headers.clone(),
                        redelivered: m.redelivered,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every open session as if the network went away.
    pub fn sever_connections(&self) {
        let sessions: Vec<_> = {
            let mut state = self.lock();
            state.sessions.retain(|s| s.strong_count() > 0);
            state.sessions.iter().filter_map(Weak::upgrade).collect()
        };
        for session in sessions {
            warn!(session = session.id, "Severing in-memory session");
            self.shutdown_session(&session);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn open_session(&self) -> Arc<SessionShared> {
        let mut state = self.lock();
        state.sessions.retain(|s| s.strong_count() > 0);
        state.next_session += 1;
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(SessionShared {
            id: state.next_session,
            closed,
            in_flight: Mutex::new(BTreeMap::new()),
        });
        state.sessions.push(Arc::downgrade(&shared));
        shared
    }

    fn take_next(&self, session: &SessionShared, queue: &str) -> Take {
        let mut guard = self.lock();
        let state = &mut *guard;
        if session.is_closed() {
            return Take::Closed;
        }
        let Some(q) = state.queues.get_mut(queue) else {
            return Take::Closed;
        };
        let Some(message) = q.ready.pop_front() else {
            return Take::Empty;
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        session
            .in_flight()
            .insert(tag, (queue.to_string(), message.clone()));
        Take::Message(tag, message)
    }

    /// Close a session and requeue its unacknowledged deliveries in order.
    fn shutdown_session(&self, session: &SessionShared) {
        let mut state = self.lock();
        if session.is_closed() {
            return;
        }
        session.closed.send_replace(true);

        let in_flight = std::mem::take(&mut *session.in_flight());
        for (_, (queue, mut message)) in in_flight.into_iter().rev() {
            if let Some(q) = state.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
                q.notify.notify_waiters();
            }
        }
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens [`MemorySession`]s; can be told to refuse the next N attempts.
pub struct MemoryConnector {
    broker: InMemoryBroker,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryConnector {
    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerSession>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BusError::Connection(format!(
                "connection to {} refused",
                url
            )));
        }

        let shared = self.broker.open_session();
        debug!(session = shared.id, "In-memory session opened");
        Ok(Arc::new(MemorySession {
            broker: self.broker.clone(),
            shared,
        }))
    }
}

// ============================================================================
// Session
// ============================================================================

struct SessionShared {
    id: u64,
    closed: watch::Sender<bool>,
    /// delivery tag -> (queue, message)
    in_flight: Mutex<BTreeMap<u64, (String, StoredMessage)>>,
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn in_flight(&self) -> MutexGuard<'_, BTreeMap<u64, (String, StoredMessage)>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Session on an [`InMemoryBroker`].
pub struct MemorySession {
    broker: InMemoryBroker,
    shared: Arc<SessionShared>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BusError::Topology(format!(
                "exchange '{}' already declared as {:?} durable={}, requested {:?} durable={}",
                spec.name, existing.kind, existing.durable, spec.kind, spec.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| MemoryQueue {
                spec: spec.clone(),
                ready: VecDeque::new(),
                notify: Arc::new(Notify::new()),
                consumers: 0,
            });

        if queue.spec != *spec {
            return Err(BusError::Topology(format!(
                "queue '{}' already declared with durable={}, requested durable={}",
                spec.name, queue.spec.durable, spec.durable
            )));
        }

        Ok(QueueHandle {
            name: spec.name.clone(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers,
        })
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BusError::Topology(format!(
                "cannot bind to missing exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::Topology(format!(
                "cannot bind missing queue '{}'",
                binding.queue
            )));
        }
        state
            .bindings
            .entry(binding.exchange.clone())
            .or_default()
            .insert(binding.queue.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut guard = self.broker.lock();
        let state = &mut *guard;

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            if !state.exchanges.contains_key(exchange) {
                return Err(BusError::Publish(format!("no exchange '{}'", exchange)));
            }
            state
                .bindings
                .get(exchange)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default()
        };

        for name in targets {
            // Unroutable messages are dropped, as a broker does without the mandatory flag
            if let Some(q) = state.queues.get_mut(&name) {
                q.ready.push_back(StoredMessage {
                    payload: message.payload.clone(),
                    headers: message.headers.clone(),
                    redelivered: false,
                });
                q.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let notify = {
            let mut state = self.broker.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("no queue '{}'", queue)))?;
            q.consumers += 1;
            q.notify.clone()
        };
        debug!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "In-memory consumer started");

        let cursor = ConsumerCursor {
            broker: self.broker.clone(),
            session: self.shared.clone(),
            queue: queue.to_string(),
            notify,
            prefetch: Arc::new(Semaphore::new(prefetch.max(1) as usize)),
        };

        let stream = futures::stream::unfold(cursor, |cursor| async move {
            let permit = tokio::select! {
                permit = cursor.prefetch.clone().acquire_owned() => permit.ok()?,
                _ = wait_closed(cursor.session.closed.subscribe()) => return None,
            };

            let notify = cursor.notify.clone();
            loop {
                let notified = notify.notified();
                match cursor.broker.take_next(&cursor.session, &cursor.queue) {
                    Take::Message(tag, message) => {
                        let acker = MemoryAcker {
                            broker: cursor.broker.clone(),
                            session: cursor.session.clone(),
                            tag,
                            _permit: permit,
                        };
                        let delivery = Delivery::new(
                            message.payload,
                            message.headers,
                            message.redelivered,
                            tag,
                            Box::new(acker),
                        );
                        return Some((Ok(delivery), cursor));
                    }
                    Take::Closed => return None,
                    Take::Empty => {}
                }

                tokio::select! {
                    _ = notified => {}
                    _ = wait_closed(cursor.session.closed.subscribe()) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    async fn closed(&self) {
        wait_closed(self.shared.closed.subscribe()).await;
    }

    async fn close_channel(&self) -> Result<()> {
        self.broker.shutdown_session(&self.shared);
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.broker.shutdown_session(&self.shared);
        Ok(())
    }
}

struct ConsumerCursor {
    broker: InMemoryBroker,
    session: Arc<SessionShared>,
    queue: String,
    notify: Arc<Notify>,
    prefetch: Arc<Semaphore>,
}

impl Drop for ConsumerCursor {
    fn drop(&mut self) {
        if let Some(q) = self.broker.lock().queues.get_mut(&self.queue) {
            q.consumers = q.consumers.saturating_sub(1);
        }
    }
}

// ============================================================================
// Acknowledgment
// ============================================================================

struct MemoryAcker {
    broker: InMemoryBroker,
    session: Arc<SessionShared>,
    tag: u64,
    /// Released on ack/nack, freeing one prefetch slot.
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        if self.session.is_closed() {
            return Err(BusError::Closed);
        }
        self.session
            .in_flight()
            .remove(&self.tag)
            .map(|_| ())
            .ok_or_else(|| BusError::Ack(format!("unknown delivery tag {}", self.tag)))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        if self.session.is_closed() {
            return Err(BusError::Closed);
        }
        let (queue, mut message) = self
            .session
            .in_flight()
            .remove(&self.tag)
            .ok_or_else(|| BusError::Ack(format!("unknown delivery tag {}", self.tag)))?;

        if requeue {
            if let Some(q) = state.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
                q.notify.notify_waiters();
            }
        }
        Ok(())
    }
}
