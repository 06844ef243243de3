use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use outpost_process::{
    ExitDisposition, NextStep, PrivilegeClass, ProcSpec, ProcessState, ProcessStatus,
    RestartDelay, TaskId,
};
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Launches children. The OS implementation is the only production one.
#[async_trait]
pub trait ChildRunner: Send + Sync {
    async fn spawn(&self, spec: &ProcSpec) -> anyhow::Result<Box<dyn RunningChild>>;
}

#[async_trait]
pub trait RunningChild: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit code, or `None` when the child died from a signal.
    async fn wait(&mut self) -> anyhow::Result<Option<i32>>;

    /// SIGTERM, then SIGKILL once `grace` elapses.
    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<Option<i32>>;
}

/// Shared table of per-task status, served by `proc/list`.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<Vec<ProcessStatus>>,
}

impl StatusBoard {
    pub fn register(&self, id: TaskId, description: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.retain(|s| s.id != id);
        inner.push(ProcessStatus::pending(id, description));
        inner.sort_by_key(|s| s.id);
    }

    pub fn update(&self, id: TaskId, f: impl FnOnce(&mut ProcessStatus)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = inner.iter_mut().find(|s| s.id == id) {
            f(s);
        }
    }

    pub fn snapshot(&self) -> Vec<ProcessStatus> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct SuperviseContext {
    pub runner: Arc<dyn ChildRunner>,
    pub board: Arc<StatusBoard>,
    pub cancel: CancellationToken,
    pub grace: Duration,
}

pub fn restart_delay(delay: RestartDelay) -> Duration {
    match delay {
        RestartDelay::Fixed(d) => d,
        RestartDelay::Jitter { max } => {
            let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        }
    }
}

/// Runs one task's child until its restart policy says stop or the scope is
/// cancelled. `finished` fires when the loop ends.
pub async fn supervise(
    ctx: Arc<SuperviseContext>,
    id: TaskId,
    spec: ProcSpec,
    finished: Option<oneshot::Sender<()>>,
) {
    let mut restarts: u32 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let disposition = match ctx.runner.spawn(&spec).await {
            Ok(mut child) => {
                let pid = child.pid();
                tracing::info!(?pid, program = %spec.program, "child spawned");
                ctx.board.update(id, |s| {
                    s.state = ProcessState::Running;
                    s.pid = pid;
                });

                let waited = tokio::select! {
                    r = child.wait() => Some(r),
                    _ = ctx.cancel.cancelled() => None,
                };
                let result = match waited {
                    Some(r) => r,
                    None => {
                        tracing::info!(?pid, "stopping child");
                        let r = child.terminate(ctx.grace).await;
                        record_exit(&ctx.board, id, &r, ProcessState::Exited);
                        break;
                    }
                };

                let disposition = match &result {
                    Ok(code) => ExitDisposition::from_code(*code),
                    Err(_) => ExitDisposition::Failure,
                };
                let state = match disposition {
                    ExitDisposition::Failure => ProcessState::Failed,
                    _ => ProcessState::Exited,
                };
                record_exit(&ctx.board, id, &result, state);
                match &result {
                    Ok(code) => tracing::info!(?code, ?disposition, "child exited"),
                    Err(e) => tracing::warn!(error = %e, "waiting for child failed"),
                }
                disposition
            }
            Err(e) => {
                tracing::error!(error = %outpost_rpc::format_error_chain(&e), "spawn failed");
                ctx.board.update(id, |s| s.state = ProcessState::Failed);
                ExitDisposition::Failure
            }
        };

        match spec.restart.next_step(disposition) {
            NextStep::Stop => break,
            NextStep::Relaunch { delayed } => {
                restarts += 1;
                ctx.board.update(id, |s| {
                    s.restarts = restarts;
                    s.state = ProcessState::Waiting;
                });
                if delayed {
                    let wait = restart_delay(spec.delay);
                    tracing::info!(delay_ms = wait.as_millis() as u64, "restarting after delay");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = ctx.cancel.cancelled() => break,
                    }
                }
            }
        }
    }
    tracing::debug!(restarts, "supervision loop ended");
    if let Some(tx) = finished {
        let _ = tx.send(());
    }
}

fn record_exit(board: &StatusBoard, id: TaskId, result: &anyhow::Result<Option<i32>>, state: ProcessState) {
    let code = result.as_ref().ok().copied().flatten();
    board.update(id, |s| {
        s.state = state;
        s.pid = None;
        s.exit_code = code;
    });
}

/// Spawns real processes in their own session, dropping to the restricted
/// user for `PrivilegeClass::Restricted` when running as root.
pub struct OsChildRunner {
    restricted_ids: (u32, u32),
}

impl OsChildRunner {
    pub fn new(restricted_ids: (u32, u32)) -> Self {
        Self { restricted_ids }
    }
}

#[async_trait]
impl ChildRunner for OsChildRunner {
    async fn spawn(&self, spec: &ProcSpec) -> anyhow::Result<Box<dyn RunningChild>> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let parent = outpost_rpc::trace::current()
            .map(str::to_string)
            .unwrap_or_else(outpost_rpc::trace::generate);
        cmd.env(
            outpost_rpc::trace::TRACEPARENT_ENV,
            outpost_rpc::trace::child_of(&parent),
        );
        if let Some(role) = spec.args.first().and_then(|a| a.strip_prefix("--")) {
            cmd.env("OUTPOST_RUNNER_ROLE", role);
        }

        let drop_to = match spec.privilege {
            PrivilegeClass::Restricted if is_root() => Some(self.restricted_ids),
            PrivilegeClass::Restricted => {
                tracing::warn!(program = %spec.program, "not running as root; restricted task keeps current identity");
                None
            }
            PrivilegeClass::Privileged => None,
        };

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(move || {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if let Some((uid, gid)) = drop_to {
                        if libc::setgroups(0, std::ptr::null()) == -1
                            || libc::setgid(gid) == -1
                            || libc::setuid(uid) == -1
                        {
                            return Err(std::io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {} {}", spec.program, spec.args.join(" ")))?;
        let pgid = child.id().and_then(|p| i32::try_from(p).ok());
        Ok(Box::new(OsChild { child, pgid }))
    }
}

fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(target_os = "linux")]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children must not outlive a crashed supervisor.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

struct OsChild {
    child: tokio::process::Child,
    pgid: Option<i32>,
}

impl OsChild {
    fn signal_group(&self, sig: i32) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, sig);
            }
        }
    }
}

#[async_trait]
impl RunningChild for OsChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> anyhow::Result<Option<i32>> {
        let status = self.child.wait().await.context("wait for child")?;
        Ok(status.code())
    }

    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<Option<i32>> {
        self.signal_group(libc::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status.context("wait for child")?.code()),
            Err(_) => {
                tracing::warn!(pgid = ?self.pgid, "child ignored SIGTERM; sending SIGKILL");
                self.signal_group(libc::SIGKILL);
                let status = self.child.wait().await.context("wait for killed child")?;
                Ok(status.code())
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted exit codes per role (first argument), falling back to
    /// the default script. A child with no scripted exit runs forever.
    pub struct ScriptedRunner {
        scripts: Mutex<HashMap<String, VecDeque<Option<i32>>>>,
        spawns: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new(exits: Vec<Option<i32>>) -> Self {
            Self::by_role(vec![("", exits)])
        }

        pub fn by_role(scripts: Vec<(&str, Vec<Option<i32>>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(role, exits)| (role.to_string(), exits.into()))
                        .collect(),
                ),
                spawns: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            }
        }

        pub fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        pub fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    struct ScriptedChild {
        exit: Option<Option<i32>>,
    }

    #[async_trait]
    impl ChildRunner for ScriptedRunner {
        async fn spawn(&self, spec: &ProcSpec) -> anyhow::Result<Box<dyn RunningChild>> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let role = spec.args.first().cloned().unwrap_or_default();
            self.order.lock().unwrap().push(role.clone());
            let mut scripts = self.scripts.lock().unwrap();
            let key = if scripts.contains_key(&role) { role } else { String::new() };
            let exit = scripts.get_mut(&key).and_then(|q| q.pop_front());
            Ok(Box::new(ScriptedChild { exit }))
        }
    }

    #[async_trait]
    impl RunningChild for ScriptedChild {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> anyhow::Result<Option<i32>> {
            match self.exit {
                Some(code) => Ok(code),
                None => std::future::pending().await,
            }
        }

        async fn terminate(&mut self, _grace: Duration) -> anyhow::Result<Option<i32>> {
            Ok(None)
        }
    }
}
