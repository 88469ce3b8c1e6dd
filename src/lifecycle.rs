//! Process lifecycle: startup sequencing and graceful shutdown.
//!
//! ```text
//! Starting -> Connecting -> Declaring -> Serving -> Draining -> Stopped
//!                 |  ^          |           |
//!                 |  +----------(-----------+   (session lost, supervised)
//!                 v             v
//!            FailedFatal   FailedFatal
//! ```

use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{error, info};

use crate::bus::BrokerSession;

/// Where a service process is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Connecting,
    Declaring,
    Serving,
    Draining,
    Stopped,
    FailedFatal,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::FailedFatal)
    }

    /// Allowed edges of the state machine.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Starting, Connecting)
                | (Connecting, Declaring)
                | (Connecting, FailedFatal)
                | (Connecting, Draining)
                | (Declaring, Serving)
                | (Declaring, FailedFatal)
                | (Declaring, Draining)
                | (Serving, Connecting)
                | (Serving, Draining)
                | (Draining, Stopped)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Declaring => "declaring",
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
            LifecycleState::FailedFatal => "failed_fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Lifecycle of one service process.
///
/// Keeps the full transition history so callers (and tests) can tell
/// whether a state was ever entered.
pub struct Lifecycle {
    service: String,
    state: watch::Sender<LifecycleState>,
    history: Mutex<Vec<LifecycleState>>,
}

impl Lifecycle {
    pub fn new(service: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            service: service.into(),
            state,
            history: Mutex::new(vec![LifecycleState::Starting]),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> Vec<LifecycleState> {
        self.lock_history().clone()
    }

    /// True if the process ever reached `Serving`.
    pub fn has_served(&self) -> bool {
        self.lock_history().contains(&LifecycleState::Serving)
    }

    pub fn transition(&self, next: LifecycleState) -> Result<(), LifecycleError> {
        let mut history = self.lock_history();
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        history.push(next);
        self.state.send_replace(next);

        if next == LifecycleState::FailedFatal {
            error!(service = %self.service, from = %current, "Lifecycle failed");
        } else {
            info!(service = %self.service, from = %current, to = %next, "Lifecycle transition");
        }
        Ok(())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<LifecycleState>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Close channel, then connection. Each step runs even if the previous one
/// failed; failures are only logged.
pub async fn drain(session: &dyn BrokerSession) {
    if let Err(e) = session.close_channel().await {
        error!(error = %e, "Failed to close channel");
    }
    if let Err(e) = session.close_connection().await {
        error!(error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_happy_path_transitions() {
        let lifecycle = Lifecycle::new("test");
        for next in [Connecting, Declaring, Serving, Draining, Stopped] {
            lifecycle.transition(next).unwrap();
        }
        assert_eq!(
            lifecycle.history(),
            vec![Starting, Connecting, Declaring, Serving, Draining, Stopped]
        );
        assert!(lifecycle.state().is_terminal());
        assert!(lifecycle.has_served());
    }

    #[test]
    fn test_connecting_can_fail_fatally() {
        let lifecycle = Lifecycle::new("test");
        lifecycle.transition(Connecting).unwrap();
        lifecycle.transition(FailedFatal).unwrap();
        assert_eq!(lifecycle.state(), FailedFatal);
        assert!(!lifecycle.has_served());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let lifecycle = Lifecycle::new("test");
        let err = lifecycle.transition(Serving).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: Starting,
                to: Serving
            }
        ));
        assert_eq!(lifecycle.state(), Starting);

        lifecycle.transition(Connecting).unwrap();
        lifecycle.transition(FailedFatal).unwrap();
        assert!(lifecycle.transition(Connecting).is_err());
    }

    #[test]
    fn test_supervised_reconnect_edge() {
        assert!(Serving.can_transition_to(Connecting));
        assert!(!Draining.can_transition_to(Connecting));
        assert!(!Stopped.can_transition_to(Starting));
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let lifecycle = Lifecycle::new("test");
        let mut rx = lifecycle.subscribe();
        lifecycle.transition(Connecting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
    }
}
