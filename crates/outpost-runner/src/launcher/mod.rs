//! The `--launcher` role: the game-server pipeline and its RPC surface.

pub mod apis;
mod archive;
pub mod core;
pub mod executor;
mod leveldat;
pub mod middleware;
pub mod quick_undo;
pub mod rcon;
pub mod settings;
pub mod state;
pub mod watchdog;
pub mod world_service;

use std::sync::Arc;

use anyhow::Context;
use outpost_process::EXIT_RESTART_REQUESTED;
use outpost_rpc::types::{Event, EventCode, method, role};
use outpost_rpc::{Client, Server, format_error_chain};
use tokio_util::sync::CancellationToken;

use crate::config::GameConfig;
use crate::control_api::ControlApi;
use crate::env::{CONFIG_FILE, DataRoot, EnvProvider};
use crate::events::{EventSink, SupervisorEvents};
use crate::tunables;
use apis::LauncherApi;
use self::core::{LauncherContext, LauncherCore, RetryPolicy, is_restart};
use executor::KillableExecutor;
use middleware::{
    AutoVersionMiddleware, EulaMiddleware, MonitoringMiddleware, ServerJarMiddleware,
    ServerPropertiesMiddleware, WorldMiddleware,
};
use quick_undo::QuickUndo;
use rcon::{Console, RconClient};
use settings::{RunSettings, Settings};
use state::RpcStateRepository;
use world_service::{HttpWorldStorage, WorldStorage};

/// Collaborators the pipeline is assembled from.
pub struct Pipeline {
    pub console: Console,
    pub storage: Arc<dyn WorldStorage>,
    pub http: reqwest::Client,
    pub executor: Arc<KillableExecutor>,
    pub undo: Arc<QuickUndo>,
}

/// Declared innermost first: monitoring wraps only the executor, world sync
/// runs before everything else.
pub fn build_core(p: Pipeline, retry: RetryPolicy) -> LauncherCore {
    let mut core = LauncherCore::new(p.executor, retry);
    core.use_middleware(Arc::new(MonitoringMiddleware::new(
        p.console,
        tunables::watchdog_interval(),
    )));
    core.use_middleware(Arc::new(EulaMiddleware));
    core.use_middleware(Arc::new(ServerPropertiesMiddleware));
    core.use_middleware(Arc::new(ServerJarMiddleware::new(p.http, tunables::manifest_url())));
    core.use_middleware(Arc::new(AutoVersionMiddleware));
    core.use_middleware(Arc::new(WorldMiddleware::new(p.storage)));
    core.add_before_launch(p.undo);
    core
}

fn settings_from(game: &GameConfig) -> RunSettings {
    let memory_mb = settings::host_memory_mb();
    tracing::info!(memory_mb, "game memory budget");
    RunSettings::from_config(game, memory_mb)
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let supervisor = Client::new(data.endpoint(role::SUPERVISOR));
    let events: Arc<dyn EventSink> = Arc::new(SupervisorEvents::new(supervisor.clone()));

    let result = launch(&data, supervisor, events.clone()).await;
    match result {
        Ok(()) => Ok(0),
        Err(e) if is_restart(&e) => {
            tracing::info!("exiting for restart");
            Ok(EXIT_RESTART_REQUESTED)
        }
        Err(e) => {
            tracing::error!(error = %format_error_chain(&e), "launch failed");
            events.dispatch(Event::status(EventCode::LAUNCH_ERR)).await;
            Ok(1)
        }
    }
}

async fn launch(data: &DataRoot, supervisor: Client, events: Arc<dyn EventSink>) -> anyhow::Result<()> {
    let config = crate::config::load(&data.data_path(CONFIG_FILE)).context("load runner config")?;
    let api = ControlApi::new(&config.control_panel, &config.auth_key)?;
    let settings = Arc::new(Settings::new(settings_from(&config.game_config)));

    let console = Console::new(Arc::new(RconClient::new(
        rcon::DEFAULT_ADDR,
        rcon::DEFAULT_PASSWORD,
        tunables::rcon_retry_window(),
    )));
    let helper = Client::new(data.endpoint(role::SNAPSHOT_HELPER));
    let executor = Arc::new(KillableExecutor::new(tunables::shutdown_grace()));
    let undo = Arc::new(QuickUndo::new(helper.clone(), executor.clone()));

    let core = build_core(
        Pipeline {
            console: console.clone(),
            http: api.http().clone(),
            storage: Arc::new(HttpWorldStorage::new(api)),
            executor,
            undo: undo.clone(),
        },
        RetryPolicy::from_env(),
    );

    let cancel = CancellationToken::new();
    let rpc_cancel = CancellationToken::new();
    let launcher_api = Arc::new(LauncherApi {
        console,
        events: events.clone(),
        helper,
        undo,
        intent: core.intent(),
        data: data.clone(),
        cancel: cancel.clone(),
    });
    let mut server = Server::new(data.endpoint(role::LAUNCHER));
    launcher_api.register(&mut server);
    let rpc = tokio::spawn(server.bind().context("bind launcher endpoint")?.serve(rpc_cancel.clone()));

    if let Err(e) = supervisor.notify(method::PROC_REGISTER_STOP_HOOK, role::LAUNCHER).await {
        tracing::warn!(error = %e, "could not register stop hook");
    }
    tokio::spawn(crate::supervisor::wait_for_signal(cancel.clone()));

    let ctx = LauncherContext {
        cancel,
        settings,
        env: Arc::new(data.clone()),
        state: Arc::new(RpcStateRepository::new(supervisor)),
        events,
    };
    let result = core.start(ctx).await;

    rpc_cancel.cancel();
    let _ = rpc.await;
    result
}
