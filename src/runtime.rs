//! Process runtimes for the producer and the consumer services.
//!
//! Every binary is a thin wrapper around one of the `launch_*` functions:
//! load config, pick a connector, run until a termination signal, drain.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::{
    BrokerConnector, BusError, ConnectionManager, ConsumerExit, ConsumerLoop, EventHandler,
    InMemoryBroker, Publisher, SessionSupervisor, Topology,
};
use crate::config::{BrokerKind, BrokerConfig, Config, ConfigError};
use crate::http::{self, AppState};
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
use crate::services::ServiceKind;
use crate::utils::bootstrap::spawn_shutdown_listener;

/// Default name of the producer process.
pub const PRODUCER_SERVICE: &str = "producer-api";

/// Default name of the all-in-one process.
pub const STANDALONE_SERVICE: &str = "orderbus-standalone";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Connector for the configured broker kind.
///
/// The memory broker lives inside the process, so it must be handed in.
pub fn connector_for(
    config: &BrokerConfig,
    memory: Option<&InMemoryBroker>,
) -> Result<Arc<dyn BrokerConnector>, RuntimeError> {
    match config.kind {
        #[cfg(feature = "amqp")]
        BrokerKind::Amqp => Ok(Arc::new(crate::bus::AmqpConnector::new())),
        #[cfg(not(feature = "amqp"))]
        BrokerKind::Amqp => Err(ConfigError::Invalid {
            field: "broker.kind",
            reason: "built without the amqp feature".to_string(),
        }
        .into()),
        BrokerKind::Memory => match memory {
            Some(broker) => Ok(broker.connector()),
            None => Err(ConfigError::Invalid {
                field: "broker.kind",
                reason: "the memory broker is only available in orderbus-standalone".to_string(),
            }
            .into()),
        },
    }
}

fn connection_manager(config: &Config, connector: Arc<dyn BrokerConnector>) -> ConnectionManager {
    ConnectionManager::new(connector, config.broker.url.clone(), config.broker.retry_policy())
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

// ============================================================================
// Producer
// ============================================================================

/// Connect, declare the exchange, serve HTTP until shutdown, drain.
pub async fn run_producer(
    config: &Config,
    connector: Arc<dyn BrokerConnector>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RuntimeError> {
    let exchange = config.broker.exchange.clone();
    let supervisor = SessionSupervisor::start(
        connection_manager(config, connector),
        Topology::producer(&exchange),
        lifecycle.clone(),
    )
    .await?;

    let listener = match TcpListener::bind(config.server.bind_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.server.bind_addr(), error = %e, "Failed to bind HTTP listener");
            supervisor.drain().await?;
            return Err(e.into());
        }
    };
    let addr = listener.local_addr()?;

    let (publisher, _writer) = Publisher::spawn(supervisor.clone(), exchange.clone());
    let app = http::router(AppState {
        publisher,
        supervisor: supervisor.clone(),
        service: lifecycle.service().to_string(),
    });

    lifecycle.transition(LifecycleState::Serving)?;
    info!(
        service = %lifecycle.service(),
        %addr,
        broker = %config.broker.url,
        exchange = %exchange,
        "Producer API listening"
    );

    let mut watchdog = supervisor.spawn_watchdog(shutdown.clone());
    let mut server_shutdown = shutdown;
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_requested(&mut server_shutdown).await })
            .await
    });

    let served = tokio::select! {
        served = &mut server => served,
        Ok(Err(e)) = &mut watchdog => {
            error!(service = %lifecycle.service(), error = %e, "Broker session could not be restored");
            server.abort();
            return Err(e);
        }
    };
    watchdog.abort();

    supervisor.drain().await?;
    served??;
    Ok(())
}

// ============================================================================
// Consumers
// ============================================================================

/// Run one consumer service with its own handler.
///
/// Returns the number of messages processed.
pub async fn run_consumer(
    config: &Config,
    kind: ServiceKind,
    connector: Arc<dyn BrokerConnector>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Receiver<bool>,
) -> Result<u64, RuntimeError> {
    let handler = kind.handler(lifecycle.service());
    run_consumer_with(config, kind.queue(), handler, connector, lifecycle, shutdown).await
}

/// Consume `queue` with `handler`, re-subscribing after every lost session.
pub async fn run_consumer_with(
    config: &Config,
    queue: &str,
    handler: Box<dyn EventHandler>,
    connector: Arc<dyn BrokerConnector>,
    lifecycle: Arc<Lifecycle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64, RuntimeError> {
    let policy = config.broker.redelivery_policy();
    let supervisor = SessionSupervisor::start(
        connection_manager(config, connector),
        Topology::consumer(&config.broker.exchange, queue, policy.uses_dead_letter()),
        lifecycle.clone(),
    )
    .await?;
    lifecycle.transition(LifecycleState::Serving)?;
    info!(service = %lifecycle.service(), queue = %queue, "Waiting for events");

    let mut consumer = ConsumerLoop::new(queue, handler, policy);
    let mut session = supervisor.session()?;

    loop {
        match consumer.run(session.as_ref(), &mut shutdown).await {
            Ok(ConsumerExit::Shutdown) => break,
            Ok(ConsumerExit::StreamEnded) => {
                if *shutdown.borrow() {
                    break;
                }
            }
            Err(e) if session.is_connected() => {
                // Connected but unable to subscribe: reconnecting would not help
                error!(queue = %queue, error = %e, "Failed to start consuming");
                supervisor.drain().await?;
                return Err(e.into());
            }
            Err(e) => warn!(queue = %queue, error = %e, "Subscription lost"),
        }

        session = tokio::select! {
            recovered = supervisor.recover() => recovered?,
            _ = shutdown_requested(&mut shutdown) => break,
        };
    }

    consumer.finish().await;
    supervisor.drain().await?;
    info!(service = %lifecycle.service(), processed = consumer.processed(), "Consumer stopped");
    Ok(consumer.processed())
}

// ============================================================================
// Standalone
// ============================================================================

/// Producer and all four consumers in one process on the in-memory broker.
///
/// Consumers outlive the producer: they are stopped once it has drained. A
/// consumer that fails to start stops the whole process before the producer
/// is started.
pub async fn run_standalone(
    config: &Config,
    broker: InMemoryBroker,
    shutdown: watch::Receiver<bool>,
) -> Result<(), RuntimeError> {
    let (stop_consumers, consumer_shutdown) = watch::channel(false);
    let mut consumers = Vec::with_capacity(ServiceKind::ALL.len());
    let mut startup_failed = false;

    for kind in ServiceKind::ALL {
        let lifecycle = Arc::new(Lifecycle::new(kind.default_name()));
        let mut state = lifecycle.subscribe();
        let config = config.clone();
        let connector: Arc<dyn BrokerConnector> = broker.connector();
        let shutdown = consumer_shutdown.clone();

        consumers.push(tokio::spawn(async move {
            run_consumer(&config, kind, connector, lifecycle, shutdown).await
        }));

        // Queues must exist before the first order is published
        let reached = state
            .wait_for(|s| *s == LifecycleState::Serving || s.is_terminal())
            .await
            .map(|s| *s);
        if !matches!(reached, Ok(s) if s != LifecycleState::FailedFatal) {
            error!(service = %kind, "Consumer failed to start");
            startup_failed = true;
            break;
        }
    }

    let mut result = if startup_failed {
        Ok(())
    } else {
        let producer = Arc::new(Lifecycle::new(config.service_name(PRODUCER_SERVICE)));
        run_producer(config, broker.connector(), producer, shutdown).await
    };
    let _ = stop_consumers.send(true);

    for consumer in consumers {
        let outcome = match consumer.await {
            Ok(outcome) => outcome.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            error!(error = %e, "Consumer failed");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

// ============================================================================
// Entry points
// ============================================================================

pub async fn launch_producer() -> Result<(), RuntimeError> {
    let config = Config::load()?;
    let connector = connector_for(&config.broker, None)?;
    let lifecycle = Arc::new(Lifecycle::new(config.service_name(PRODUCER_SERVICE)));
    run_producer(&config, connector, lifecycle, spawn_shutdown_listener()).await
}

pub async fn launch_consumer(kind: ServiceKind) -> Result<(), RuntimeError> {
    let config = Config::load()?;
    let connector = connector_for(&config.broker, None)?;
    let lifecycle = Arc::new(Lifecycle::new(config.service_name(kind.default_name())));
    run_consumer(&config, kind, connector, lifecycle, spawn_shutdown_listener()).await?;
    Ok(())
}

pub async fn launch_standalone() -> Result<(), RuntimeError> {
    let config = Config::load()?;
    info!(service = STANDALONE_SERVICE, "Running every service on the in-memory broker");
    run_standalone(&config, InMemoryBroker::new(), spawn_shutdown_listener()).await
}

/// Log a fatal error and map the outcome to a process exit code.
pub fn exit_code(result: Result<(), RuntimeError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HandlerError, MemoryConnector, OutboundMessage, QueueSpec, ORDERS_EXCHANGE};
    use crate::envelope::{Envelope, EnvelopeFactory};
    use crate::events::ORDER_CREATED;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use LifecycleState::*;

    const QUEUE: &str = "inventory_queue";

    struct Collector {
        seen: mpsc::UnboundedSender<Envelope>,
    }

    #[async_trait]
    impl EventHandler for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn handle(&mut self, envelope: &Envelope) -> Result<(), HandlerError> {
            let _ = self.seen.send(envelope.clone());
            Ok(())
        }
    }

    async fn wait_until(lifecycle: &Lifecycle, done: impl Fn(&[LifecycleState]) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&lifecycle.history()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lifecycle did not reach the expected state");
    }

    fn served_times(history: &[LifecycleState], times: usize) -> bool {
        history.iter().filter(|s| **s == Serving).count() >= times
    }

    async fn publish_order(broker: &InMemoryBroker) -> Envelope {
        let session = broker.connector().connect("memory://").await.unwrap();
        Topology::producer(ORDERS_EXCHANGE)
            .declare(session.as_ref())
            .await
            .unwrap();
        let envelope = EnvelopeFactory::new().build(ORDER_CREATED, json!({ "orderId": "ORD-1" }));
        session
            .publish(
                ORDERS_EXCHANGE,
                "",
                OutboundMessage::persistent_json(envelope.to_vec().unwrap()),
            )
            .await
            .unwrap();
        envelope
    }

    fn spawn_consumer(
        connector: Arc<MemoryConnector>,
        lifecycle: Arc<Lifecycle>,
        shutdown: watch::Receiver<bool>,
    ) -> (
        tokio::task::JoinHandle<Result<u64, RuntimeError>>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let (seen, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            run_consumer_with(
                &Config::for_test(),
                QUEUE,
                Box::new(Collector { seen }),
                connector,
                lifecycle,
                shutdown,
            )
            .await
        });
        (handle, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event delivered")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_consumer_processes_until_shutdown() {
        let broker = InMemoryBroker::new();
        let lifecycle = Arc::new(Lifecycle::new("inventory-service"));
        let (stop, shutdown) = watch::channel(false);
        let (handle, mut seen) =
            spawn_consumer(broker.connector(), lifecycle.clone(), shutdown);

        wait_until(&lifecycle, |h| served_times(h, 1)).await;
        let first = publish_order(&broker).await;
        let second = publish_order(&broker).await;
        assert_eq!(recv(&mut seen).await.event_id, first.event_id);
        assert_eq!(recv(&mut seen).await.event_id, second.event_id);

        stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 2);
        assert_eq!(
            lifecycle.history(),
            vec![Starting, Connecting, Declaring, Serving, Draining, Stopped]
        );
    }

    #[tokio::test]
    async fn test_consumer_startup_exhaustion_is_fatal() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(10);
        let lifecycle = Arc::new(Lifecycle::new("inventory-service"));
        let (_stop, shutdown) = watch::channel(false);

        let (handle, _seen) = spawn_consumer(connector.clone(), lifecycle.clone(), shutdown);
        let err = handle.await.unwrap().unwrap_err();

        assert!(matches!(err, RuntimeError::Bus(BusError::Unrecoverable { attempts: 3, .. })));
        assert_eq!(connector.attempts(), 3);
        assert_eq!(lifecycle.history(), vec![Starting, Connecting, FailedFatal]);
        assert!(!lifecycle.has_served());
    }

    #[tokio::test]
    async fn test_consumer_resubscribes_after_session_loss() {
        let broker = InMemoryBroker::new();
        let lifecycle = Arc::new(Lifecycle::new("inventory-service"));
        let (stop, shutdown) = watch::channel(false);
        let (handle, mut seen) =
            spawn_consumer(broker.connector(), lifecycle.clone(), shutdown);

        wait_until(&lifecycle, |h| served_times(h, 1)).await;
        broker.sever_connections();
        wait_until(&lifecycle, |h| served_times(h, 2)).await;

        let envelope = publish_order(&broker).await;
        assert_eq!(recv(&mut seen).await.event_id, envelope.event_id);

        stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(
            lifecycle.history(),
            vec![
                Starting, Connecting, Declaring, Serving, Connecting, Declaring, Serving, Draining,
                Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_consumer_reconnect_exhaustion_is_fatal() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        let lifecycle = Arc::new(Lifecycle::new("inventory-service"));
        let (_stop, shutdown) = watch::channel(false);
        let (handle, _seen) = spawn_consumer(connector.clone(), lifecycle.clone(), shutdown);

        wait_until(&lifecycle, |h| served_times(h, 1)).await;
        connector.fail_next(10);
        broker.sever_connections();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Bus(BusError::Unrecoverable { .. })));
        assert_eq!(
            lifecycle.history(),
            vec![Starting, Connecting, Declaring, Serving, Connecting, FailedFatal]
        );
    }

    #[tokio::test]
    async fn test_producer_serves_reconnects_and_drains() {
        let broker = InMemoryBroker::new();
        let lifecycle = Arc::new(Lifecycle::new(PRODUCER_SERVICE));
        let (stop, shutdown) = watch::channel(false);

        let handle = {
            let connector: Arc<dyn BrokerConnector> = broker.connector();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                run_producer(&Config::for_test(), connector, lifecycle, shutdown).await
            })
        };

        wait_until(&lifecycle, |h| served_times(h, 1)).await;
        broker.sever_connections();
        wait_until(&lifecycle, |h| served_times(h, 2)).await;

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(
            lifecycle.history(),
            vec![
                Starting, Connecting, Declaring, Serving, Connecting, Declaring, Serving, Draining,
                Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_producer_never_serves_without_broker() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(10);
        let lifecycle = Arc::new(Lifecycle::new(PRODUCER_SERVICE));
        let (_stop, shutdown) = watch::channel(false);

        let err = run_producer(&Config::for_test(), connector, lifecycle.clone(), shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::Bus(BusError::Unrecoverable { attempts: 3, .. })));
        assert_eq!(lifecycle.history(), vec![Starting, Connecting, FailedFatal]);
    }

    #[tokio::test]
    async fn test_standalone_stops_cleanly() {
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(async move {
            run_standalone(&Config::for_test(), InMemoryBroker::new(), shutdown).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_standalone_stops_when_a_consumer_cannot_start() {
        let broker = InMemoryBroker::new();
        let session = broker.connector().connect("memory://").await.unwrap();
        session
            .declare_queue(&QueueSpec {
                name: ServiceKind::Email.queue().to_string(),
                durable: false,
            })
            .await
            .unwrap();
        let (_stop, shutdown) = watch::channel(false);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            run_standalone(&Config::for_test(), broker, shutdown),
        )
        .await
        .expect("standalone kept running after a consumer failed")
        .unwrap_err();

        assert!(matches!(err, RuntimeError::Bus(ref e) if e.is_configuration()));
    }

    #[tokio::test]
    async fn test_consumer_serves_on_last_connect_attempt() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(9);
        let mut config = Config::for_test();
        config.broker.connect_max_attempts = 10;
        let lifecycle = Arc::new(Lifecycle::new("inventory-service"));
        let (stop, shutdown) = watch::channel(false);

        let (seen, mut rx) = mpsc::unbounded_channel();
        let handle = {
            let connector = connector.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                run_consumer_with(
                    &config,
                    QUEUE,
                    Box::new(Collector { seen }),
                    connector,
                    lifecycle,
                    shutdown,
                )
                .await
            })
        };

        wait_until(&lifecycle, |h| served_times(h, 1)).await;
        assert_eq!(connector.attempts(), 10);
        let envelope = publish_order(&broker).await;
        assert_eq!(recv(&mut rx).await.event_id, envelope.event_id);

        stop.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(
            lifecycle.history(),
            vec![Starting, Connecting, Declaring, Serving, Draining, Stopped]
        );
    }

    #[tokio::test]
    async fn test_producer_serves_on_last_connect_attempt() {
        let broker = InMemoryBroker::new();
        let connector = broker.connector();
        connector.fail_next(9);
        let mut config = Config::for_test();
        config.broker.connect_max_attempts = 10;
        let lifecycle = Arc::new(Lifecycle::new(PRODUCER_SERVICE));
        let (stop, shutdown) = watch::channel(false);

        let handle = {
            let connector: Arc<dyn BrokerConnector> = connector.clone();
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { run_producer(&config, connector, lifecycle, shutdown).await })
        };

        wait_until(&lifecycle, |h| served_times(h, 1)).await;
        assert_eq!(connector.attempts(), 10);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(
            lifecycle.history(),
            vec![Starting, Connecting, Declaring, Serving, Draining, Stopped]
        );
    }

    #[test]
    fn test_memory_broker_needs_an_instance() {
        let config = Config::for_test();
        let err = connector_for(&config.broker, None).err().unwrap();
        assert!(matches!(
            err,
            RuntimeError::Config(ConfigError::Invalid {
                field: "broker.kind",
                ..
            })
        ));

        let broker = InMemoryBroker::new();
        assert!(connector_for(&config.broker, Some(&broker)).is_ok());
    }
}
