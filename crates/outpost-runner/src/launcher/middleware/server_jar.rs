use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use outpost_rpc::types::{Event, EventCode};
use sha1::Digest;
use tokio::io::AsyncReadExt;

use crate::env::{GAMEDATA_DIR, SERVERS_DIR};
use crate::launcher::core::{Handler, LauncherContext, Middleware};
use crate::launcher::settings::RunSettings;
use crate::launcher::state::VERSION_KEY;

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const DOWNLOAD_ATTEMPTS: u32 = 3;
/// Version alias for the newest release in the manifest.
const LATEST_RELEASE: &str = "latest_release";

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionManifestV2 {
    latest: Latest,
    versions: Vec<VersionRef>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Latest {
    release: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionRef {
    id: String,
    url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionJson {
    downloads: Downloads,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Downloads {
    server: ServerDownload,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ServerDownload {
    sha1: String,
    size: u64,
    url: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ResolvedServer {
    url: String,
    sha1: Option<String>,
    size: Option<u64>,
}

/// Makes sure the server artifact for the configured version is cached
/// under `servers.d/` and points the launch at it.
pub struct ServerJarMiddleware {
    http: reqwest::Client,
    manifest_url: String,
}

impl ServerJarMiddleware {
    pub fn new(http: reqwest::Client, manifest_url: impl Into<String>) -> Self {
        Self {
            http,
            manifest_url: manifest_url.into(),
        }
    }

    async fn manifest(&self, s: &RunSettings) -> anyhow::Result<VersionManifestV2> {
        let manifest_url = s.manifest_url.as_deref().unwrap_or(&self.manifest_url);
        self.http
            .get(manifest_url)
            .send()
            .await
            .context("fetch version manifest")?
            .error_for_status()?
            .json()
            .await
            .context("parse version manifest")
    }

    /// Turns the `latest_release` alias into a concrete version id so the
    /// cache and the version state follow new releases.
    async fn concrete_version(&self, s: &RunSettings) -> anyhow::Result<String> {
        if s.version != LATEST_RELEASE || !s.download_url.is_empty() {
            return Ok(s.version.clone());
        }
        let release = self.manifest(s).await?.latest.release;
        if release.is_empty() {
            anyhow::bail!("version manifest names no latest release");
        }
        Ok(release)
    }

    async fn resolve(&self, s: &RunSettings) -> anyhow::Result<ResolvedServer> {
        if !s.download_url.is_empty() {
            return Ok(ResolvedServer {
                url: s.download_url.clone(),
                sha1: None,
                size: None,
            });
        }
        let vref = self
            .manifest(s)
            .await?
            .versions
            .into_iter()
            .find(|v| v.id == s.version)
            .ok_or_else(|| anyhow::anyhow!("unknown minecraft version: {}", s.version))?;

        let vjson: VersionJson = self
            .http
            .get(&vref.url)
            .send()
            .await
            .context("fetch version json")?
            .error_for_status()?
            .json()
            .await
            .context("parse version json")?;
        Ok(ResolvedServer {
            url: vjson.downloads.server.url,
            sha1: Some(vjson.downloads.server.sha1),
            size: Some(vjson.downloads.server.size),
        })
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let mut last_err = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let res: anyhow::Result<Vec<u8>> = async {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .context("download server")?
                    .error_for_status()
                    .context("download server (status)")?;
                Ok(resp.bytes().await.context("read server body")?.to_vec())
            }
            .await;
            match res {
                Ok(b) => return Ok(b),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "server download failed");
                    last_err = Some(e);
                    if attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed")))
    }

    async fn ensure_cached(&self, c: &LauncherContext, s: &RunSettings) -> anyhow::Result<PathBuf> {
        let path = c
            .env
            .data_path(SERVERS_DIR)
            .join(format!("{}.jar", s.version));
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() && m.len() > 0 => return Ok(path),
            Ok(_) => {
                tracing::warn!(path = %path.display(), "discarding unusable cached server");
                let stale = path.clone();
                tokio::task::spawn_blocking(move || crate::fs_util::remove_path(&stale))
                    .await
                    .context("remove task")?
                    .with_context(|| format!("remove {}", path.display()))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        }

        c.events.send(Event::status(EventCode::GAME_DOWNLOAD)).await;
        let resolved = self.resolve(s).await?;
        tracing::info!(version = %s.version, url = %resolved.url, "downloading server");
        let bytes = self.fetch(&resolved.url).await?;

        if let Some(size) = resolved.size {
            if bytes.len() as u64 != size {
                anyhow::bail!(
                    "server size mismatch: expected {size} bytes, got {} bytes (url={})",
                    bytes.len(),
                    resolved.url
                );
            }
        }
        if let Some(want) = &resolved.sha1 {
            let got = hex::encode(sha1::Sha1::digest(bytes.as_slice()));
            if got != *want {
                anyhow::bail!("server sha1 mismatch: expected {want}, got {got} (url={})", resolved.url);
            }
        }
        crate::fs_util::write_atomic(&path, &bytes).await?;
        Ok(path)
    }
}

async fn is_jar(path: &Path) -> anyhow::Result<bool> {
    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut head = [0u8; 4];
    match f.read_exact(&mut head).await {
        Ok(_) => Ok(head == ZIP_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

/// Clears per-version leftovers, keeping the world, the properties and
/// snapshots.
pub fn purge_gamedata(dir: &Path) -> anyhow::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };
    let mut failed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "world" || name == "server.properties" || name.starts_with("ss@") {
            continue;
        }
        if let Err(e) = crate::fs_util::remove_path(&entry.path()) {
            failed.push(format!("{name}: {e}"));
        }
    }
    if !failed.is_empty() {
        anyhow::bail!("purge {}: {}", dir.display(), failed.join("; "));
    }
    Ok(())
}

#[async_trait]
impl Middleware for ServerJarMiddleware {
    fn name(&self) -> &'static str {
        "server-artifact"
    }

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()> {
        let s = c.settings.get();
        if s.version.is_empty() && !s.custom_command.is_empty() {
            tracing::info!("custom command without a version; skipping server download");
            return next(c).await;
        }
        if s.version.is_empty() {
            c.events.send(Event::status(EventCode::GAME_ERR)).await;
            anyhow::bail!("no server version configured");
        }
        let version = match self.concrete_version(&s).await {
            Ok(v) => v,
            Err(e) => {
                c.events.send(Event::status(EventCode::GAME_ERR)).await;
                return Err(e.context(format!("resolve server version {}", s.version)));
            }
        };
        if version != s.version {
            tracing::info!(alias = %s.version, version = %version, "resolved server version");
            c.settings.update(|s| s.version = version);
        }
        let s = c.settings.get();

        let path = match self.ensure_cached(&c, &s).await {
            Ok(p) => p,
            Err(e) => {
                c.events.send(Event::status(EventCode::GAME_ERR)).await;
                return Err(e.context(format!("prepare server {}", s.version)));
            }
        };
        if is_jar(&path).await? {
            c.settings.update(|s| s.server_path = Some(path));
        } else {
            make_executable(&path).await?;
            let cmd = path.to_string_lossy().into_owned();
            c.settings.update(|s| {
                s.server_path = Some(path);
                s.custom_command = vec![cmd];
            });
        }

        let previous = match c.state.get(VERSION_KEY).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read last version");
                None
            }
        };
        if previous.as_deref() != Some(s.version.as_str()) {
            tracing::info!(from = ?previous, to = %s.version, "server version changed; purging game data");
            let dir = c.env.data_path(GAMEDATA_DIR);
            tokio::task::spawn_blocking(move || purge_gamedata(&dir))
                .await
                .context("purge task")??;
        }
        if let Err(e) = c.state.set(VERSION_KEY, &s.version).await {
            tracing::warn!(error = %e, "cannot persist server version");
        }

        next(c).await
    }
}
