//! The `--snapshot-helper` role: privileged point-in-time copies of the game
//! data, one per quick slot.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use outpost_rpc::types::{SnapshotInfo, SnapshotSlotInput, method, role};
use outpost_rpc::{Client, Server};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::env::{DataRoot, EnvProvider, GAMEDATA_DIR};

const SLOT_PREFIX: &str = "ss@";
const TMP_SUFFIX: &str = ".tmp";

/// How snapshots are taken and dropped.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read-only copy of `src` at `dst`. `dst` must not exist.
    async fn create(&self, src: &Path, dst: &Path) -> anyhow::Result<()>;

    /// Removes `path`; a missing path is not an error.
    async fn delete(&self, path: &Path) -> anyhow::Result<()>;

    async fn exists(&self, path: &Path) -> anyhow::Result<bool>;
}

/// Read-only btrfs subvolume snapshots.
pub struct BtrfsBackend;

impl BtrfsBackend {
    async fn btrfs(args: &[&OsStr]) -> anyhow::Result<std::process::Output> {
        tokio::process::Command::new("btrfs")
            .args(args)
            .output()
            .await
            .context("run btrfs")
    }

    async fn checked(args: &[&OsStr]) -> anyhow::Result<()> {
        let out = Self::btrfs(args).await?;
        if !out.status.success() {
            let cmd: Vec<_> = args.iter().map(|a| a.to_string_lossy()).collect();
            anyhow::bail!(
                "btrfs {} failed: {}",
                cmd.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    /// Whether `path` is a subvolume we can snapshot.
    pub async fn supported(path: &Path) -> bool {
        match Self::btrfs(&[OsStr::new("subvolume"), OsStr::new("show"), path.as_os_str()]).await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl SnapshotBackend for BtrfsBackend {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    async fn create(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
        Self::checked(&[
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            OsStr::new("-r"),
            src.as_os_str(),
            dst.as_os_str(),
        ])
        .await
    }

    async fn delete(&self, path: &Path) -> anyhow::Result<()> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        Self::checked(&[OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()]).await
    }

    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(false);
        }
        let out = Self::btrfs(&[OsStr::new("subvolume"), OsStr::new("show"), path.as_os_str()]).await?;
        Ok(out.status.success())
    }
}

/// Plain recursive copy for volumes without snapshot support.
pub struct CopyBackend;

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly(mode & 0o200 == 0);
        std::fs::set_permissions(path, perms)
    }
}

fn copy_excluding_slots(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(SLOT_PREFIX) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            crate::fs_util::copy_dir_all(&from, &to)
                .with_context(|| format!("copy {}", from.display()))?;
        } else {
            std::fs::copy(&from, &to).with_context(|| format!("copy {}", from.display()))?;
        }
    }
    Ok(())
}

#[async_trait]
impl SnapshotBackend for CopyBackend {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn create(&self, src: &Path, dst: &Path) -> anyhow::Result<()> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || {
            copy_excluding_slots(&src, &dst)?;
            set_mode(&dst, 0o555).with_context(|| format!("seal {}", dst.display()))?;
            anyhow::Ok(())
        })
        .await
        .context("snapshot copy task")?
    }

    async fn delete(&self, path: &Path) -> anyhow::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if path.is_dir() {
                set_mode(&path, 0o755)?;
            }
            crate::fs_util::remove_path(&path)
        })
        .await
        .context("snapshot delete task")?
        .context("delete snapshot")
    }

    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(tokio::fs::try_exists(path).await.unwrap_or(false))
    }
}

pub fn slot_id(slot: i32) -> String {
    format!("{SLOT_PREFIX}quick{slot}")
}

fn tmp_of(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(TMP_SUFFIX);
    PathBuf::from(s)
}

/// Slot bookkeeping over a backend. Operations are serialized.
pub struct SnapshotHelper {
    backend: Arc<dyn SnapshotBackend>,
    gamedata: PathBuf,
    lock: Mutex<()>,
}

impl SnapshotHelper {
    pub fn new(backend: Arc<dyn SnapshotBackend>, gamedata: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            gamedata: gamedata.into(),
            lock: Mutex::new(()),
        }
    }

    fn slot_path(&self, slot: i32) -> anyhow::Result<PathBuf> {
        if slot < 0 {
            anyhow::bail!("invalid snapshot slot {slot}");
        }
        Ok(self.gamedata.join(slot_id(slot)))
    }

    fn info(slot: i32, path: &Path) -> SnapshotInfo {
        SnapshotInfo {
            id: slot_id(slot),
            path: path.to_string_lossy().into_owned(),
        }
    }

    /// Settles leftovers of an interrupted replacement: a `.tmp` whose slot
    /// is gone is promoted, any other `.tmp` is dropped.
    async fn recover_locked(&self) -> anyhow::Result<()> {
        let mut rd = match tokio::fs::read_dir(&self.gamedata).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.gamedata.display())),
        };
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(final_name) = name
                .strip_prefix(SLOT_PREFIX)
                .and_then(|_| name.strip_suffix(TMP_SUFFIX))
            else {
                continue;
            };
            let tmp = entry.path();
            let final_path = self.gamedata.join(final_name);
            if self.backend.exists(&final_path).await? {
                tracing::info!(path = %tmp.display(), "dropping stale snapshot temp");
                self.backend.delete(&tmp).await?;
            } else {
                tracing::info!(path = %final_path.display(), "promoting interrupted snapshot");
                tokio::fs::rename(&tmp, &final_path)
                    .await
                    .with_context(|| format!("promote {}", tmp.display()))?;
            }
        }
        Ok(())
    }

    pub async fn recover(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.recover_locked().await
    }

    pub async fn create(&self, slot: i32) -> anyhow::Result<SnapshotInfo> {
        let path = self.slot_path(slot)?;
        let _guard = self.lock.lock().await;
        self.recover_locked().await?;

        let tmp = tmp_of(&path);
        self.backend.delete(&tmp).await?;
        self.backend
            .create(&self.gamedata, &tmp)
            .await
            .with_context(|| format!("snapshot into {}", tmp.display()))?;
        self.backend.delete(&path).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("move {} into place", tmp.display()))?;
        tracing::info!(slot, backend = self.backend.name(), path = %path.display(), "snapshot created");
        Ok(Self::info(slot, &path))
    }

    pub async fn stat(&self, slot: i32) -> anyhow::Result<SnapshotInfo> {
        let path = self.slot_path(slot)?;
        let _guard = self.lock.lock().await;
        self.recover_locked().await?;
        if !self.backend.exists(&path).await? {
            anyhow::bail!("no snapshot in slot {slot}");
        }
        Ok(Self::info(slot, &path))
    }

    pub async fn delete(&self, slot: i32) -> anyhow::Result<()> {
        let path = self.slot_path(slot)?;
        let _guard = self.lock.lock().await;
        self.recover_locked().await?;
        self.backend.delete(&tmp_of(&path)).await?;
        self.backend.delete(&path).await?;
        tracing::info!(slot, "snapshot deleted");
        Ok(())
    }

    pub fn register(self: Arc<Self>, server: &mut Server, cancel: CancellationToken) {
        let helper = self.clone();
        server.register_method(method::SNAPSHOT_CREATE, move |input: SnapshotSlotInput| {
            let helper = helper.clone();
            async move { helper.create(input.slot).await }
        });

        let helper = self.clone();
        server.register_method(method::SNAPSHOT_STAT, move |input: SnapshotSlotInput| {
            let helper = helper.clone();
            async move { helper.stat(input.slot).await }
        });

        let helper = self;
        server.register_method(method::SNAPSHOT_DELETE, move |input: SnapshotSlotInput| {
            let helper = helper.clone();
            async move {
                helper.delete(input.slot).await?;
                anyhow::Ok("ok")
            }
        });

        server.register_notify(method::BASE_STOP, move |_: Value| {
            tracing::info!("stop requested by supervisor");
            cancel.cancel();
            async { Ok(()) }
        });
    }
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let gamedata = data.data_path(GAMEDATA_DIR);
    let backend: Arc<dyn SnapshotBackend> = if BtrfsBackend::supported(&gamedata).await {
        Arc::new(BtrfsBackend)
    } else {
        Arc::new(CopyBackend)
    };
    tracing::info!(backend = backend.name(), path = %gamedata.display(), "snapshot backend selected");

    let helper = Arc::new(SnapshotHelper::new(backend, gamedata));
    if let Err(e) = helper.recover().await {
        tracing::warn!(error = %outpost_rpc::format_error_chain(&e), "snapshot recovery failed");
    }

    let cancel = CancellationToken::new();
    let mut server = Server::new(data.endpoint(role::SNAPSHOT_HELPER));
    helper.register(&mut server, cancel.clone());
    let rpc = tokio::spawn(
        server
            .bind()
            .context("bind snapshot helper endpoint")?
            .serve(cancel.clone()),
    );

    let supervisor = Client::new(data.endpoint(role::SUPERVISOR));
    if let Err(e) = supervisor
        .notify(method::PROC_REGISTER_STOP_HOOK, role::SNAPSHOT_HELPER)
        .await
    {
        tracing::warn!(error = %e, "could not register stop hook");
    }
    tokio::spawn(crate::supervisor::wait_for_signal(cancel.clone()));

    cancel.cancelled().await;
    let _ = rpc.await;
    tracing::info!("snapshot helper stopped");
    Ok(0)
}
