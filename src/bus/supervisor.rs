//! Session supervision: owns the live session and replaces it when it drops.
//!
//! Startup and reconnection run the same sequence: establish through the
//! [`ConnectionManager`], then re-declare the [`Topology`]. A lost session
//! moves the lifecycle `Serving -> Connecting -> Declaring -> Serving`;
//! exhausting the retry budget is fatal in both cases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{BrokerSession, BusError, ConnectionManager, Topology};
use crate::lifecycle::{self, Lifecycle, LifecycleState};
use crate::runtime::RuntimeError;

pub struct SessionSupervisor {
    manager: ConnectionManager,
    topology: Topology,
    lifecycle: Arc<Lifecycle>,
    current: RwLock<Option<Arc<dyn BrokerSession>>>,
    recovering: Mutex<()>,
    draining: AtomicBool,
}

impl SessionSupervisor {
    /// Connect and declare topology. Leaves the lifecycle in `Declaring`;
    /// the caller moves it to `Serving` once it is actually serving.
    pub async fn start(
        manager: ConnectionManager,
        topology: Topology,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let supervisor = Arc::new(Self {
            manager,
            topology,
            lifecycle,
            current: RwLock::new(None),
            recovering: Mutex::new(()),
            draining: AtomicBool::new(false),
        });

        let session = supervisor.connect_and_declare().await?;
        supervisor.replace(Some(session));
        Ok(supervisor)
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The live session, if any.
    pub fn current(&self) -> Option<Arc<dyn BrokerSession>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The live session, or [`BusError::Closed`] when there is none.
    pub fn session(&self) -> Result<Arc<dyn BrokerSession>, BusError> {
        self.current().ok_or(BusError::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.current().map(|s| s.is_connected()).unwrap_or(false)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Return a connected session, reconnecting first if the current one
    /// is gone. Concurrent callers share one reconnection.
    pub async fn recover(&self) -> Result<Arc<dyn BrokerSession>, RuntimeError> {
        let _guard = self.recovering.lock().await;

        if let Some(session) = self.current() {
            if session.is_connected() {
                return Ok(session);
            }
        }
        if self.is_draining() {
            return Err(BusError::Closed.into());
        }

        warn!(service = %self.lifecycle.service(), "Broker session lost, reconnecting");
        self.replace(None);
        self.lifecycle.transition(LifecycleState::Connecting)?;

        let session = self.connect_and_declare().await?;
        self.replace(Some(session.clone()));
        self.lifecycle.transition(LifecycleState::Serving)?;
        info!(service = %self.lifecycle.service(), "Broker session restored");
        Ok(session)
    }

    /// Watch the session and reconnect whenever it drops, until shutdown.
    ///
    /// The task ends with an error only when reconnection is fatal.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), RuntimeError>> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(session) = supervisor.current() else {
                    return Ok(());
                };
                tokio::select! {
                    _ = session.closed() => {
                        if supervisor.is_draining() || *shutdown.borrow() {
                            return Ok(());
                        }
                        supervisor.recover().await?;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        })
    }

    /// Serving -> Draining -> Stopped, closing channel and connection.
    pub async fn drain(&self) -> Result<(), RuntimeError> {
        self.draining.store(true, Ordering::SeqCst);
        let _guard = self.recovering.lock().await;

        self.lifecycle.transition(LifecycleState::Draining)?;
        if let Some(session) = self.current() {
            lifecycle::drain(session.as_ref()).await;
        }
        self.replace(None);
        self.lifecycle.transition(LifecycleState::Stopped)?;
        Ok(())
    }

    async fn connect_and_declare(&self) -> Result<Arc<dyn BrokerSession>, RuntimeError> {
        if self.lifecycle.state() != LifecycleState::Connecting {
            self.lifecycle.transition(LifecycleState::Connecting)?;
        }

        let session = match self.manager.establish().await {
            Ok(session) => session,
            Err(e) => {
                self.lifecycle.transition(LifecycleState::FailedFatal)?;
                return Err(e.into());
            }
        };

        self.lifecycle.transition(LifecycleState::Declaring)?;
        if let Err(e) = self.topology.declare(session.as_ref()).await {
            self.lifecycle.transition(LifecycleState::FailedFatal)?;
            lifecycle::drain(session.as_ref()).await;
            return Err(e.into());
        }

        Ok(session)
    }

    fn replace(&self, session: Option<Arc<dyn BrokerSession>>) {
        match self.current.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, RetryPolicy};
    use std::time::Duration;
    use LifecycleState::*;

    fn manager(broker: &InMemoryBroker) -> (ConnectionManager, Arc<crate::bus::MemoryConnector>) {
        let connector = broker.connector();
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        };
        (
            ConnectionManager::new(connector.clone(), "memory://", policy),
            connector,
        )
    }

    #[tokio::test]
    async fn test_start_declares_topology() {
        let broker = InMemoryBroker::new();
        let (manager, _) = manager(&broker);
        let lifecycle = Arc::new(Lifecycle::new("test"));

        let supervisor = SessionSupervisor::start(
            manager,
            Topology::consumer("orders_exchange", "sms_queue", true),
            lifecycle.clone(),
        )
        .await
        .unwrap();

        assert!(supervisor.is_connected());
        assert_eq!(lifecycle.history(), vec![Starting, Connecting, Declaring]);
        assert!(broker.queued("sms_queue").is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_fatal() {
        let broker = InMemoryBroker::new();
        let (manager, connector) = manager(&broker);
        connector.fail_next(3);
        let lifecycle = Arc::new(Lifecycle::new("test"));

        let err = SessionSupervisor::start(manager, Topology::producer("orders_exchange"), lifecycle.clone())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, RuntimeError::Bus(BusError::Unrecoverable { attempts: 3, .. })));
        assert_eq!(lifecycle.history(), vec![Starting, Connecting, FailedFatal]);
    }

    #[tokio::test]
    async fn test_recover_after_session_loss() {
        let broker = InMemoryBroker::new();
        let (manager, connector) = manager(&broker);
        let lifecycle = Arc::new(Lifecycle::new("test"));
        let supervisor =
            SessionSupervisor::start(manager, Topology::producer("orders_exchange"), lifecycle.clone())
                .await
                .unwrap();
        lifecycle.transition(Serving).unwrap();

        broker.sever_connections();
        assert!(!supervisor.is_connected());

        let session = supervisor.recover().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(
            lifecycle.history(),
            vec![Starting, Connecting, Declaring, Serving, Connecting, Declaring, Serving]
        );

        // Already connected: no new attempt
        supervisor.recover().await.unwrap();
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_watchdog_reconnects() {
        let broker = InMemoryBroker::new();
        let (manager, connector) = manager(&broker);
        let lifecycle = Arc::new(Lifecycle::new("test"));
        let supervisor =
            SessionSupervisor::start(manager, Topology::producer("orders_exchange"), lifecycle.clone())
                .await
                .unwrap();
        lifecycle.transition(Serving).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watchdog = supervisor.spawn_watchdog(shutdown_rx);

        broker.sever_connections();
        let mut states = lifecycle.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !(connector.attempts() == 2 && *states.borrow_and_update() == Serving) {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(supervisor.is_connected());

        shutdown_tx.send(true).unwrap();
        watchdog.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_closes_and_stops() {
        let broker = InMemoryBroker::new();
        let (manager, _) = manager(&broker);
        let lifecycle = Arc::new(Lifecycle::new("test"));
        let supervisor =
            SessionSupervisor::start(manager, Topology::producer("orders_exchange"), lifecycle.clone())
                .await
                .unwrap();
        lifecycle.transition(Serving).unwrap();
        let session = supervisor.current().unwrap();

        supervisor.drain().await.unwrap();

        assert!(!session.is_connected());
        assert!(supervisor.current().is_none());
        assert_eq!(lifecycle.state(), Stopped);
        assert!(supervisor.recover().await.is_err());
    }
}
