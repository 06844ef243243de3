use std::time::Duration;

use async_trait::async_trait;
use outpost_rpc::Client;
use outpost_rpc::types::{Event, SnapshotInput, method};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control_api::{Action, ActionType, ControlApi};

/// Receives flushed batches of NUL-separated events.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn post_status(&self, batch: Vec<u8>) -> anyhow::Result<()>;
}

#[async_trait]
impl StatusSink for ControlApi {
    async fn post_status(&self, batch: Vec<u8>) -> anyhow::Result<()> {
        ControlApi::post_status(self, batch).await
    }
}

#[async_trait]
pub trait ActionSource: Send + Sync {
    async fn poll_action(&self) -> anyhow::Result<Option<Action>>;
}

#[async_trait]
impl ActionSource for ControlApi {
    async fn poll_action(&self) -> anyhow::Result<Option<Action>> {
        ControlApi::poll_action(self).await
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub event: Event,
    pub dispatch: bool,
}

/// Buffers events and flushes them on a ticker, or at once for dispatches.
/// On cancellation the channel is drained and flushed one last time.
pub async fn run_relay(
    mut rx: mpsc::Receiver<OutboundMessage>,
    sink: std::sync::Arc<dyn StatusSink>,
    flush_every: Duration,
    cancel: CancellationToken,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + flush_every, flush_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => flush(&mut buf, sink.as_ref()).await,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                append(&mut buf, &msg.event);
                if msg.dispatch {
                    flush(&mut buf, sink.as_ref()).await;
                }
            }
        }
    }

    while let Ok(msg) = rx.try_recv() {
        append(&mut buf, &msg.event);
    }
    flush(&mut buf, sink.as_ref()).await;
    tracing::debug!("status relay stopped");
}

fn append(buf: &mut Vec<u8>, event: &Event) {
    match serde_json::to_vec(event) {
        Ok(bytes) => {
            if !buf.is_empty() {
                buf.push(0);
            }
            buf.extend_from_slice(&bytes);
        }
        Err(e) => tracing::warn!(error = %e, "dropping unserializable event"),
    }
}

async fn flush(buf: &mut Vec<u8>, sink: &dyn StatusSink) {
    if buf.is_empty() {
        return;
    }
    let batch = std::mem::take(buf);
    if let Err(e) = sink.post_status(batch).await {
        tracing::warn!(error = %outpost_rpc::format_error_chain(&e), "posting status failed; batch dropped");
    }
}

/// Where a polled action goes: (role, method, params).
pub fn route_action(action: &Action) -> Option<(&'static str, &'static str, Value)> {
    use outpost_rpc::types::role;

    match action.kind {
        ActionType::Stop => Some((role::LAUNCHER, method::GAME_STOP, Value::Null)),
        ActionType::Snapshot | ActionType::Undo => {
            let slot = action.snapshot.map(|s| s.slot)?;
            let m = if action.kind == ActionType::Snapshot {
                method::SNAPSHOT_CREATE
            } else {
                method::SNAPSHOT_UNDO
            };
            let params = serde_json::to_value(SnapshotInput {
                slot,
                actor: action.actor,
            })
            .ok()?;
            Some((role::LAUNCHER, m, params))
        }
        ActionType::Reconfigure => {
            let config = action.config.as_ref()?;
            Some((role::LAUNCHER, method::GAME_RECONFIGURE, json!({ "config": config })))
        }
        ActionType::ConnectionRequest => {
            let params = serde_json::to_value(action.connection_request.as_ref()?).ok()?;
            Some((role::CONNECTOR, method::CONNECTOR_CONNECT, params))
        }
        ActionType::Unknown => None,
    }
}

/// Forwards control-panel actions to the daemon that owns them.
pub async fn run_action_poller(
    source: std::sync::Arc<dyn ActionSource>,
    launcher: Client,
    connector: Client,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let action = match source.poll_action().await {
            Ok(Some(a)) => a,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %outpost_rpc::format_error_chain(&e), "polling actions failed");
                continue;
            }
        };

        let Some((role, m, params)) = route_action(&action) else {
            tracing::warn!(kind = ?action.kind, "ignoring action without a route");
            continue;
        };
        let target = if role == outpost_rpc::types::role::CONNECTOR {
            &connector
        } else {
            &launcher
        };
        tracing::info!(kind = ?action.kind, method = m, "forwarding action");
        if let Err(e) = target.notify(m, params).await {
            tracing::warn!(method = m, error = %e, "forwarding action failed");
        }
    }
    tracing::debug!("action poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_rpc::types::EventCode;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn post_status(&self, batch: Vec<u8>) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn decode(batch: &[u8]) -> Vec<Event> {
        batch
            .split(|b| *b == 0)
            .map(|doc| serde_json::from_slice(doc).unwrap())
            .collect()
    }

    fn msg(code: EventCode, dispatch: bool) -> OutboundMessage {
        OutboundMessage {
            event: Event::status(code),
            dispatch,
        }
    }

    #[tokio::test]
    async fn batches_until_dispatch() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(run_relay(rx, sink.clone(), Duration::from_secs(3600), cancel.clone()));

        tx.send(msg(EventCode::LOADING, false)).await.unwrap();
        tx.send(msg(EventCode::RUNNING, false)).await.unwrap();
        tx.send(msg(EventCode::SHUTDOWN, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let batches = sink.batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            let codes: Vec<_> = decode(&batches[0]).iter().filter_map(Event::status_code).collect();
            assert_eq!(codes, vec![EventCode::LOADING, EventCode::RUNNING, EventCode::SHUTDOWN]);
        }

        cancel.cancel();
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_flushes_pending_events() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tx.send(msg(EventCode::CLEAN, false)).await.unwrap();
        cancel.cancel();
        run_relay(rx, sink.clone(), Duration::from_secs(3600), cancel).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(decode(&batches[0])[0].status_code(), Some(EventCode::CLEAN));
    }

    #[tokio::test]
    async fn ticker_flushes_buffered_events() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(run_relay(rx, sink.clone(), Duration::from_millis(20), cancel.clone()));

        tx.send(msg(EventCode::LOADING, false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.batches.lock().unwrap().len(), 1);

        cancel.cancel();
        relay.await.unwrap();
    }

    fn action(json: &str) -> Action {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn actions_route_to_owning_daemon() {
        let (role, m, _) = route_action(&action(r#"{"type":"stop"}"#)).unwrap();
        assert_eq!((role, m), ("launcher", "game/stop"));

        let (_, m, params) = route_action(&action(r#"{"type":"undo","actor":7,"snapshot":{"slot":2}}"#)).unwrap();
        assert_eq!(m, "snapshot/undo");
        assert_eq!(params, json!({"slot": 2, "actor": 7}));

        let (_, m, params) = route_action(&action(r#"{"type":"reconfigure","config":{"motd":"m"}}"#)).unwrap();
        assert_eq!(m, "game/reconfigure");
        assert_eq!(params["config"]["motd"], "m");

        let (role, m, params) = route_action(&action(
            r#"{"type":"connectionRequest","connectionRequestInfo":{"connectionId":"c-9","endpoint":"panel:25530","serverCert":"PEM"}}"#,
        ))
        .unwrap();
        assert_eq!((role, m), ("connector", "connector/connect"));
        assert_eq!(params["connectionId"], "c-9");
    }

    #[test]
    fn incomplete_or_unknown_actions_are_dropped() {
        assert!(route_action(&action(r#"{"type":"snapshot"}"#)).is_none());
        assert!(route_action(&action(r#"{"type":"reconfigure"}"#)).is_none());
        assert!(route_action(&action(r#"{"type":"connectionRequest"}"#)).is_none());
        assert!(route_action(&action(r#"{"type":"teleport"}"#)).is_none());
    }
}
