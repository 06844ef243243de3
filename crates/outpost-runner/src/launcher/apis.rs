use std::sync::Arc;
use std::time::Duration;

use outpost_rpc::types::{Event, EventCode, InfoCode, SnapshotInfo, SnapshotInput, SnapshotSlotInput, method};
use outpost_rpc::{Client, Server, format_error_chain};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::core::StopIntent;
use super::quick_undo::QuickUndo;
use super::rcon::Console;
use crate::config::GameConfig;
use crate::env::{CONFIG_FILE, DataRoot, EnvProvider, GAMEDATA_DIR};
use crate::events::EventSink;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ReconfigureInput {
    pub config: GameConfig,
}

/// Handlers behind the launcher endpoint.
pub struct LauncherApi {
    pub console: Console,
    pub events: Arc<dyn EventSink>,
    pub helper: Client,
    pub undo: Arc<QuickUndo>,
    pub intent: Arc<StopIntent>,
    pub data: DataRoot,
    pub cancel: CancellationToken,
}

impl LauncherApi {
    /// Asks the game to stop through its console; cancels the run when the
    /// console is unreachable.
    pub async fn stop_game(&self) {
        self.events.send(Event::status(EventCode::STOPPING)).await;
        match tokio::time::timeout(STOP_TIMEOUT, self.console.stop()).await {
            Ok(Ok(())) => tracing::info!("stop sent to game console"),
            Ok(Err(e)) => {
                tracing::warn!(error = %format_error_chain(&e), "console stop failed; cancelling run");
                self.cancel.cancel();
            }
            Err(_) => {
                tracing::warn!(timeout_s = STOP_TIMEOUT.as_secs(), "console stop timed out; cancelling run");
                self.cancel.cancel();
            }
        }
    }

    pub async fn reconfigure(&self, config: GameConfig) -> anyhow::Result<()> {
        crate::config::save_game_config(&self.data.data_path(CONFIG_FILE), &config).await?;
        tracing::info!("game config replaced; restarting");
        self.intent.request_restart();
        self.stop_game().await;
        Ok(())
    }

    pub async fn create_snapshot(&self, input: SnapshotInput) {
        if let Err(e) = self.console.save_all().await {
            tracing::warn!(error = %format_error_chain(&e), "save-all failed; snapshotting anyway");
        }
        let created: Result<SnapshotInfo, _> = self
            .helper
            .call(method::SNAPSHOT_CREATE, SnapshotSlotInput { slot: input.slot })
            .await;
        let event = match created {
            Ok(info) => {
                tracing::info!(slot = input.slot, id = %info.id, "snapshot created");
                Event::info(InfoCode::SNAPSHOT_DONE, input.actor, false)
            }
            Err(e) => {
                tracing::warn!(slot = input.slot, error = %e, "snapshot failed");
                Event::info(InfoCode::SNAPSHOT_ERROR, input.actor, true)
            }
        };
        self.events.dispatch(event).await;
    }

    pub async fn undo(&self, input: SnapshotInput) -> anyhow::Result<()> {
        let world = self
            .data
            .data_path(GAMEDATA_DIR)
            .join(format!("ss@quick{}", input.slot))
            .join("world");
        if !tokio::fs::try_exists(&world).await.unwrap_or(false) {
            tracing::info!(slot = input.slot, "nothing to undo to");
            self.events
                .dispatch(Event::info(InfoCode::NO_SNAPSHOT, input.actor, true))
                .await;
            return Ok(());
        }
        self.undo.restart_with_snapshot(input.slot).await
    }

    pub fn register(self: Arc<Self>, server: &mut Server) {
        let api = self.clone();
        server.register_notify(method::GAME_STOP, move |_: Value| {
            let api = api.clone();
            async move {
                api.stop_game().await;
                Ok(())
            }
        });

        let api = self.clone();
        server.register_notify(method::GAME_RECONFIGURE, move |input: ReconfigureInput| {
            let api = api.clone();
            async move { api.reconfigure(input.config).await }
        });

        let api = self.clone();
        server.register_notify(method::SNAPSHOT_CREATE, move |input: SnapshotInput| {
            let api = api.clone();
            async move {
                api.create_snapshot(input).await;
                Ok(())
            }
        });

        let api = self.clone();
        server.register_notify(method::SNAPSHOT_UNDO, move |input: SnapshotInput| {
            let api = api.clone();
            async move { api.undo(input).await }
        });

        let api = self;
        server.register_notify(method::BASE_STOP, move |_: Value| {
            tracing::info!("stop requested by supervisor");
            api.cancel.cancel();
            async { Ok(()) }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingEvents;
    use crate::launcher::executor::KillableExecutor;
    use crate::launcher::rcon::testing::FakeConsole;

    struct Fixture {
        dir: tempfile::TempDir,
        api: LauncherApi,
        console: Arc<FakeConsole>,
        events: Arc<RecordingEvents>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data = DataRoot::new(dir.path());
        let console = Arc::new(FakeConsole::default());
        let events = Arc::new(RecordingEvents::default());
        let helper = Client::new(data.endpoint("snapshot-helper")).with_timeout(Duration::from_secs(5));
        let api = LauncherApi {
            console: Console::new(console.clone()),
            events: events.clone(),
            helper: helper.clone(),
            undo: Arc::new(QuickUndo::new(
                helper,
                Arc::new(KillableExecutor::new(Duration::from_secs(1))),
            )),
            intent: Arc::default(),
            data,
            cancel: CancellationToken::new(),
        };
        Fixture {
            dir,
            api,
            console,
            events,
        }
    }

    fn infos(events: &RecordingEvents) -> Vec<(InfoCode, i32, bool, bool)> {
        events
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(e, dispatch)| e.info.as_ref().map(|i| (i.info_code, i.actor, i.is_error, *dispatch)))
            .collect()
    }

    #[tokio::test]
    async fn stop_uses_console_when_it_answers() {
        let f = fixture();
        f.api.stop_game().await;
        assert_eq!(f.console.sent(), vec!["stop"]);
        assert!(!f.api.cancel.is_cancelled());
        assert_eq!(f.events.status_codes(), vec![EventCode::STOPPING]);
    }

    #[tokio::test]
    async fn stop_falls_back_to_cancel() {
        let f = fixture();
        f.console.fail("stop", "connection refused");
        f.api.stop_game().await;
        assert!(f.api.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn reconfigure_persists_config_and_marks_restart() {
        let f = fixture();
        let config = GameConfig {
            motd: "fresh".into(),
            ..Default::default()
        };
        f.api.reconfigure(config).await.unwrap();

        let stored = crate::config::load(&f.dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(stored.game_config.motd, "fresh");
        assert!(f.api.intent.is_restart_requested());
        assert_eq!(f.console.sent(), vec!["stop"]);
    }

    #[tokio::test]
    async fn undo_without_snapshot_reports_it() {
        let f = fixture();
        f.api.undo(SnapshotInput { slot: 4, actor: 9 }).await.unwrap();
        assert_eq!(infos(&f.events), vec![(InfoCode::NO_SNAPSHOT, 9, true, true)]);
    }

    #[tokio::test]
    async fn snapshot_reports_done_or_error() {
        let f = fixture();
        // No helper listening yet.
        f.api.create_snapshot(SnapshotInput { slot: 0, actor: 2 }).await;

        let mut helper = Server::new(f.api.data.endpoint("snapshot-helper"));
        helper.register_method(method::SNAPSHOT_CREATE, |input: SnapshotSlotInput| async move {
            anyhow::Ok(SnapshotInfo {
                id: format!("ss@quick{}", input.slot),
                path: String::new(),
            })
        });
        let cancel = CancellationToken::new();
        tokio::spawn(helper.bind().unwrap().serve(cancel.clone()));
        f.api.create_snapshot(SnapshotInput { slot: 0, actor: 2 }).await;

        assert_eq!(f.console.sent(), vec!["save-all", "save-all"]);
        assert_eq!(
            infos(&f.events),
            vec![
                (InfoCode::SNAPSHOT_ERROR, 2, true, true),
                (InfoCode::SNAPSHOT_DONE, 2, false, true)
            ]
        );
        cancel.cancel();
    }
}
