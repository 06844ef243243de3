use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use outpost_rpc::Client;
use outpost_rpc::types::{SnapshotInfo, SnapshotSlotInput, method};
use tokio::sync::Mutex;

use super::core::{BeforeLaunch, LauncherContext};
use super::executor::KillableExecutor;
use crate::env::WORLD_DIR;

/// Rolls the live world back to a helper snapshot: kill the game, restore
/// before the relaunch.
pub struct QuickUndo {
    helper: Client,
    executor: Arc<KillableExecutor>,
    pending: Mutex<Option<PathBuf>>,
}

impl QuickUndo {
    pub fn new(helper: Client, executor: Arc<KillableExecutor>) -> Self {
        Self {
            helper,
            executor,
            pending: Mutex::new(None),
        }
    }

    pub async fn restart_with_snapshot(&self, slot: i32) -> anyhow::Result<()> {
        let info: SnapshotInfo = self
            .helper
            .call(method::SNAPSHOT_STAT, SnapshotSlotInput { slot })
            .await
            .with_context(|| format!("stat snapshot slot {slot}"))?;
        tracing::info!(slot, id = %info.id, path = %info.path, "restore scheduled");
        *self.pending.lock().await = Some(PathBuf::from(info.path));

        if !self.executor.kill() {
            tracing::info!("no game running; restore applies at next launch");
        }
        Ok(())
    }
}

#[async_trait]
impl BeforeLaunch for QuickUndo {
    fn name(&self) -> &'static str {
        "quick-undo"
    }

    async fn before_launch(&self, c: &LauncherContext) -> anyhow::Result<()> {
        let mut pending = self.pending.lock().await;
        let Some(snapshot) = pending.clone() else {
            return Ok(());
        };

        let world_dir = c.env.data_path(WORLD_DIR);
        let src = snapshot.join("world");
        tracing::info!(from = %src.display(), "restoring world from snapshot");
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if !src.is_dir() {
                anyhow::bail!("snapshot has no world at {}", src.display());
            }
            crate::fs_util::remove_path(&world_dir)
                .with_context(|| format!("remove {}", world_dir.display()))?;
            std::fs::create_dir_all(&world_dir)?;
            crate::fs_util::copy_dir_all(&src, &world_dir)
                .with_context(|| format!("copy {} into {}", src.display(), world_dir.display()))?;
            Ok(())
        })
        .await
        .context("restore task")??;

        *pending = None;
        tracing::info!("world restored");
        Ok(())
    }
}
