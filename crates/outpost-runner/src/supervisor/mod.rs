//! The root daemon: owns the state store and the telemetry relay, and runs
//! every other role as a supervised child in dependency order.

pub mod apis;
pub mod outbound;
pub mod proc;
pub mod scheduler;
pub mod state;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use outpost_process::{PrivilegeClass, ProcSpec, RestartPolicy, TaskId};
use outpost_rpc::types::role;
use outpost_rpc::{Client, Server};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control_api::ControlApi;
use crate::env::{CONFIG_FILE, DataRoot, EnvProvider, STATES_FILE};
use crate::tunables;
use apis::SupervisorApi;
use proc::{OsChildRunner, StatusBoard, SuperviseContext};
use scheduler::{Scheduler, StartAction, TaskDef};
use state::StateStore;

const RELAY_CAPACITY: usize = 1024;

/// One row of the fixed task graph.
pub struct TaskPlan {
    pub description: &'static str,
    pub spec: ProcSpec,
    pub prerequisites: Vec<TaskId>,
}

pub fn task_plan(exe: &str) -> Vec<TaskPlan> {
    const SETUP: TaskId = TaskId(0);
    const LAUNCHER: TaskId = TaskId(1);

    vec![
        TaskPlan {
            description: "Setup",
            spec: ProcSpec::new(exe).arg("--setup").privileged().gate(),
            prerequisites: vec![],
        },
        TaskPlan {
            description: "Game Monitoring Service",
            spec: ProcSpec::new(exe)
                .arg("--launcher")
                .restart(RestartPolicy::OnFailure)
                .gate(),
            prerequisites: vec![SETUP],
        },
        TaskPlan {
            description: "Snapshot Helper",
            spec: ProcSpec::new(exe)
                .arg("--snapshot-helper")
                .restart(RestartPolicy::OnFailure)
                .privileged(),
            prerequisites: vec![SETUP],
        },
        TaskPlan {
            description: "System Statistics",
            spec: ProcSpec::new(exe)
                .arg("--sysstat")
                .restart(RestartPolicy::OnFailure),
            prerequisites: vec![SETUP],
        },
        TaskPlan {
            description: "Connector",
            spec: ProcSpec::new(exe)
                .arg("--connector")
                .restart(RestartPolicy::OnFailure)
                .fixed_delay(Duration::from_secs(1)),
            prerequisites: vec![SETUP],
        },
        TaskPlan {
            description: "Clean Up",
            spec: ProcSpec::new(exe).arg("--clean").privileged(),
            prerequisites: vec![LAUNCHER],
        },
    ]
}

type LoopHandles = Arc<Mutex<Vec<JoinHandle<()>>>>;

fn start_action(
    ctx: Arc<SuperviseContext>,
    handles: LoopHandles,
    id: TaskId,
    spec: ProcSpec,
) -> StartAction {
    Box::new(move || {
        Box::pin(async move {
            let gate = spec.gate;
            let (tx, rx) = oneshot::channel();
            let finished = gate.then_some(tx);
            let handle = tokio::spawn(proc::supervise(ctx, id, spec, finished));
            handles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
            if gate {
                let _ = rx.await;
            }
        })
    })
}

pub fn build_scheduler(
    plan: Vec<TaskPlan>,
    ctx: Arc<SuperviseContext>,
    handles: LoopHandles,
) -> Result<Scheduler, scheduler::ScheduleError> {
    let tasks = plan
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            let id = TaskId(i);
            ctx.board.register(id, t.description);
            let privileged = t.spec.privilege == PrivilegeClass::Privileged;
            tracing::debug!(task = t.description, privileged, "task planned");
            TaskDef::new(
                t.description,
                t.prerequisites,
                start_action(ctx.clone(), handles.clone(), id, t.spec),
            )
        })
        .collect();
    Scheduler::new(tasks)
}

pub(crate) async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = term.recv() => tracing::info!("SIGTERM received"),
            _ = cancel.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = cancel.cancelled() => return,
        }
    }
    cancel.cancel();
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let config = crate::config::load(&data.data_path(CONFIG_FILE)).context("load runner config")?;
    let api_client = Arc::new(ControlApi::new(&config.control_panel, &config.auth_key)?);
    let state = Arc::new(StateStore::open(data.data_path(STATES_FILE)).await);

    let cancel = CancellationToken::new();
    let relay_cancel = CancellationToken::new();
    let rpc_cancel = CancellationToken::new();

    let (relay_tx, relay_rx) = mpsc::channel(RELAY_CAPACITY);
    let relay = tokio::spawn(outbound::run_relay(
        relay_rx,
        api_client.clone(),
        tunables::status_flush_interval(),
        relay_cancel.clone(),
    ));

    let board = Arc::new(StatusBoard::default());
    let api = Arc::new(SupervisorApi::new(
        state,
        relay_tx,
        board.clone(),
        data.clone(),
        cancel.clone(),
    ));
    let mut server = Server::new(data.endpoint(role::SUPERVISOR));
    api.register(&mut server);
    let rpc = tokio::spawn(server.bind().context("bind supervisor endpoint")?.serve(rpc_cancel.clone()));

    let poller = tokio::spawn(outbound::run_action_poller(
        api_client,
        Client::new(data.endpoint(role::LAUNCHER)),
        Client::new(data.endpoint(role::CONNECTOR)),
        tunables::poll_interval(),
        cancel.clone(),
    ));
    tokio::spawn(wait_for_signal(cancel.clone()));

    let exe = std::env::current_exe().context("resolve own executable")?;
    let exe = exe.to_string_lossy().into_owned();
    let grace = tunables::shutdown_grace();
    let ctx = Arc::new(SuperviseContext {
        runner: Arc::new(OsChildRunner::new(tunables::restricted_ids())),
        board,
        cancel: cancel.clone(),
        grace,
    });
    let handles: LoopHandles = Arc::default();
    let scheduler = build_scheduler(task_plan(&exe), ctx, handles.clone())?;
    tracing::info!(tasks = scheduler.len(), "starting task graph");
    let scheduling = tokio::spawn(scheduler.run());

    cancel.cancelled().await;
    tracing::info!("supervisor shutting down");
    scheduling.abort();

    let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *handles.lock().unwrap_or_else(|e| e.into_inner()));
    let bound = grace + Duration::from_secs(5);
    if tokio::time::timeout(bound, futures_util::future::join_all(loops))
        .await
        .is_err()
    {
        tracing::warn!(bound_ms = bound.as_millis() as u64, "children did not exit in time");
    }
    let _ = poller.await;

    relay_cancel.cancel();
    let _ = relay.await;
    rpc_cancel.cancel();
    let _ = rpc.await;
    Ok(0)
}
