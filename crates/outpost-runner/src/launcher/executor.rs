use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Runs one game-server process to completion.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Exit code, or `None` when the process died from a signal. Cancelling
    /// `cancel` stops the process before returning.
    async fn run(
        &self,
        cmdline: &[String],
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<i32>>;
}

/// Executor whose running child can be killed from outside the run,
/// which is how quick-undo interrupts the game.
pub struct KillableExecutor {
    pgid: Mutex<Option<i32>>,
    grace: Duration,
}

impl KillableExecutor {
    pub fn new(grace: Duration) -> Self {
        Self {
            pgid: Mutex::new(None),
            grace,
        }
    }

    /// SIGKILLs the running process group. Returns false when nothing runs.
    pub fn kill(&self) -> bool {
        let pgid = *self.pgid.lock().unwrap_or_else(|e| e.into_inner());
        match pgid {
            Some(pgid) => {
                tracing::info!(pgid, "killing game process");
                signal_group(pgid, libc::SIGKILL);
                true
            }
            None => false,
        }
    }

    fn set_pgid(&self, pgid: Option<i32>) {
        *self.pgid.lock().unwrap_or_else(|e| e.into_inner()) = pgid;
    }
}

/// Clears the recorded process group however the run ends, including an
/// error from `wait` or the run future being dropped.
struct RecordedGroup<'a>(&'a KillableExecutor);

impl Drop for RecordedGroup<'_> {
    fn drop(&mut self) {
        self.0.set_pgid(None);
    }
}

fn signal_group(pgid: i32, sig: i32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[async_trait]
impl CommandExecutor for KillableExecutor {
    async fn run(
        &self,
        cmdline: &[String],
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<i32>> {
        let (program, args) = cmdline
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty command line"))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                crate::supervisor::proc::set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", cmdline.join(" ")))?;
        let pgid = child.id().and_then(|p| i32::try_from(p).ok());
        self.set_pgid(pgid);
        let _recorded = RecordedGroup(self);
        tracing::info!(pid = ?child.id(), cmd = %cmdline.join(" "), "game process started");

        if let Some(out) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "game", "{line}");
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "game", "{line}");
                }
            });
        }

        let status = tokio::select! {
            status = child.wait() => status.context("wait for game process")?,
            _ = cancel.cancelled() => {
                if let Some(pgid) = pgid {
                    signal_group(pgid, libc::SIGTERM);
                }
                match tokio::time::timeout(self.grace, child.wait()).await {
                    Ok(status) => status.context("wait for game process")?,
                    Err(_) => {
                        tracing::warn!(?pgid, "game ignored SIGTERM; sending SIGKILL");
                        if let Some(pgid) = pgid {
                            signal_group(pgid, libc::SIGKILL);
                        }
                        child.wait().await.context("wait for killed game process")?
                    }
                }
            }
        };
        tracing::info!(code = ?status.code(), "game process exited");
        Ok(status.code())
    }
}
