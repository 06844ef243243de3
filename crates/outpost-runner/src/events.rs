use async_trait::async_trait;
use outpost_rpc::Client;
use outpost_rpc::types::{Event, EventInput, method};

/// Lifecycle events headed for the control plane. Delivery is best-effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event, dispatch: bool);

    async fn send(&self, event: Event) {
        self.publish(event, false).await
    }

    /// Bypasses batching in the relay.
    async fn dispatch(&self, event: Event) {
        self.publish(event, true).await
    }
}

/// Forwards events to the supervisor's relay over the transport.
#[derive(Debug, Clone)]
pub struct SupervisorEvents {
    client: Client,
}

impl SupervisorEvents {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for SupervisorEvents {
    async fn publish(&self, event: Event, dispatch: bool) {
        let input = EventInput { dispatch, event };
        if let Err(e) = self.client.notify(method::STATUS_PUSH, input).await {
            tracing::warn!(error = %e, "failed to push event to supervisor");
        }
    }
}
