//! Publisher: envelope construction plus a single writer task.
//!
//! HTTP handlers publish concurrently. Rather than sharing the channel, each
//! call sends a request over a bounded queue to one writer task, which owns
//! all broker writes and answers through a oneshot.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{BusError, OutboundMessage, Result, SessionSupervisor};
use crate::envelope::{Envelope, EnvelopeFactory};

/// Publish requests that may wait for the writer.
const PUBLISH_QUEUE_DEPTH: usize = 256;

struct PublishRequest {
    envelope: Envelope,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable publish handle.
#[derive(Clone)]
pub struct Publisher {
    requests: mpsc::Sender<PublishRequest>,
    factory: Arc<EnvelopeFactory>,
}

impl Publisher {
    /// Start the writer task for `exchange`.
    ///
    /// The task exits once every `Publisher` clone is dropped.
    pub fn spawn(
        supervisor: Arc<SessionSupervisor>,
        exchange: impl Into<String>,
    ) -> (Self, JoinHandle<()>) {
        let exchange = exchange.into();
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
        let writer = tokio::spawn(write_loop(supervisor, exchange, rx));
        (
            Self {
                requests: tx,
                factory: Arc::new(EnvelopeFactory::new()),
            },
            writer,
        )
    }

    /// Wrap `data` in an envelope and fan it out to every bound queue.
    ///
    /// Returns the envelope that was written. Fails with a transport error
    /// when no session is available or the broker rejects the write.
    pub async fn publish(&self, event_type: &str, data: Value) -> Result<Envelope> {
        let envelope = self.factory.build(event_type, data);
        let (reply, response) = oneshot::channel();

        self.requests
            .send(PublishRequest {
                envelope: envelope.clone(),
                reply,
            })
            .await
            .map_err(|_| BusError::Closed)?;

        response.await.map_err(|_| BusError::Closed)??;
        Ok(envelope)
    }
}

async fn write_loop(
    supervisor: Arc<SessionSupervisor>,
    exchange: String,
    mut requests: mpsc::Receiver<PublishRequest>,
) {
    while let Some(PublishRequest { envelope, reply }) = requests.recv().await {
        let result = write(&supervisor, &exchange, &envelope).await;
        match &result {
            Ok(()) => info!(
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                exchange = %exchange,
                "Event published"
            ),
            Err(e) => error!(
                event_type = %envelope.event_type,
                event_id = %envelope.event_id,
                error = %e,
                "Event publish failed"
            ),
        }
        if reply.send(result).is_err() {
            debug!(event_id = %envelope.event_id, "Publish caller went away");
        }
    }
    debug!(exchange = %exchange, "Publisher writer stopped");
}

async fn write(supervisor: &SessionSupervisor, exchange: &str, envelope: &Envelope) -> Result<()> {
    let session = supervisor.session()?;
    if !session.is_connected() {
        return Err(BusError::Closed);
    }
    let payload = envelope.to_vec()?;
    session
        .publish(exchange, "", OutboundMessage::persistent_json(payload))
        .await
}
