use std::sync::{Arc, Mutex};

use outpost_process::ProcessStatus;
use outpost_rpc::types::{EventInput, StateKeyInput, StateSetInput, method};
use outpost_rpc::{Client, Server};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::outbound::OutboundMessage;
use super::proc::StatusBoard;
use super::state::StateStore;
use crate::env::DataRoot;

/// Handlers behind the supervisor endpoint.
pub struct SupervisorApi {
    pub state: Arc<StateStore>,
    pub relay: mpsc::Sender<OutboundMessage>,
    pub board: Arc<StatusBoard>,
    pub data: DataRoot,
    pub cancel: CancellationToken,
    hooks: Mutex<Vec<String>>,
}

impl SupervisorApi {
    pub fn new(
        state: Arc<StateStore>,
        relay: mpsc::Sender<OutboundMessage>,
        board: Arc<StatusBoard>,
        data: DataRoot,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            relay,
            board,
            data,
            cancel,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_stop_hook(&self, role: String) {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if !hooks.contains(&role) {
            tracing::info!(role = %role, "stop hook registered");
            hooks.push(role);
        }
    }

    /// Tells every hooked daemon to stop, then ends the supervisor's scope.
    pub async fn done(&self) {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for role in hooks {
            let client = Client::new(self.data.endpoint(&role));
            if let Err(e) = client.notify(method::BASE_STOP, Value::Null).await {
                tracing::warn!(role = %role, error = %e, "stop hook unreachable");
            }
        }
        tracing::info!("all stop hooks notified; shutting down");
        self.cancel.cancel();
    }

    pub async fn push(&self, input: EventInput) {
        let msg = OutboundMessage {
            event: input.event,
            dispatch: input.dispatch,
        };
        if self.relay.send(msg).await.is_err() {
            tracing::warn!("status relay closed; event dropped");
        }
    }

    pub fn list(&self) -> Vec<ProcessStatus> {
        self.board.snapshot()
    }

    pub fn register(self: Arc<Self>, server: &mut Server) {
        let api = self.clone();
        server.register_notify(method::STATUS_PUSH, move |input: EventInput| {
            let api = api.clone();
            async move {
                api.push(input).await;
                Ok(())
            }
        });

        let api = self.clone();
        server.register_notify(method::PROC_REGISTER_STOP_HOOK, move |role: String| {
            api.register_stop_hook(role);
            async { Ok(()) }
        });

        let api = self.clone();
        server.register_notify(method::PROC_DONE, move |_: Value| {
            let api = api.clone();
            async move {
                api.done().await;
                Ok(())
            }
        });

        let api = self.clone();
        server.register_method(method::STATE_SAVE, move |input: StateSetInput| {
            let api = api.clone();
            async move {
                api.state.set(&input.key, &input.value).await?;
                anyhow::Ok("ok")
            }
        });

        let api = self.clone();
        server.register_method(method::STATE_GET, move |input: StateKeyInput| {
            let api = api.clone();
            async move { Ok(api.state.get(&input.key).await) }
        });

        let api = self.clone();
        server.register_method(method::STATE_REMOVE, move |input: StateKeyInput| {
            let api = api.clone();
            async move {
                api.state.remove(&input.key).await?;
                anyhow::Ok("ok")
            }
        });

        let api = self;
        server.register_method(method::PROC_LIST, move |_: Value| {
            let statuses = api.list();
            async move { Ok(statuses) }
        });
    }
}
