use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::archive::{self, ArchiveKind};
use crate::control_api::ControlApi;
use crate::env::{EnvProvider, WORLD_DIR, make_temp_dir};

/// Where worlds live between runs.
#[async_trait]
pub trait WorldStorage: Send + Sync {
    async fn latest_resource_id(&self, world_name: &str) -> anyhow::Result<String>;

    /// Replaces the live world with the archive stored as `resource_id`.
    async fn download_world(&self, resource_id: &str, env: &dyn EnvProvider) -> anyhow::Result<()>;

    /// Uploads the live world and returns its new resource id.
    async fn upload_world(&self, world_name: &str, env: &dyn EnvProvider) -> anyhow::Result<String>;
}

pub struct HttpWorldStorage {
    api: ControlApi,
}

impl HttpWorldStorage {
    pub fn new(api: ControlApi) -> Self {
        Self { api }
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        let resp = self
            .api
            .http()
            .get(url)
            .send()
            .await
            .context("world download request")?
            .error_for_status()?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("world download interrupted")?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

async fn discard_temp(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        tracing::debug!(path = %dir.display(), error = %e, "temp dir cleanup failed");
    }
}

#[async_trait]
impl WorldStorage for HttpWorldStorage {
    async fn latest_resource_id(&self, world_name: &str) -> anyhow::Result<String> {
        self.api.latest_world_id(world_name).await
    }

    async fn download_world(&self, resource_id: &str, env: &dyn EnvProvider) -> anyhow::Result<()> {
        let kind = ArchiveKind::from_name(resource_id)?;
        let url = self.api.world_download_url(resource_id).await?;
        let tmp = make_temp_dir(env).await?;

        let result = async {
            let archive_path = tmp.join(format!("world{}", kind.suffix()));
            let size = self.fetch_to(&url, &archive_path).await?;
            tracing::info!(resource_id, size, "world archive downloaded");

            let scratch = tmp.join("extract");
            let world_dir = env.data_path(WORLD_DIR);
            tokio::task::spawn_blocking(move || {
                archive::install_world(&archive_path, kind, &scratch, &world_dir)
            })
            .await
            .context("world extract task")?
        }
        .await;

        discard_temp(&tmp).await;
        result
    }

    async fn upload_world(&self, world_name: &str, env: &dyn EnvProvider) -> anyhow::Result<String> {
        let tmp = make_temp_dir(env).await?;

        let result = async {
            let out = tmp.join("world.tar.gz");
            let world_dir = env.data_path(WORLD_DIR);
            let packed = out.clone();
            tokio::task::spawn_blocking(move || archive::pack_world(&world_dir, &packed))
                .await
                .context("world pack task")??;

            let target = self.api.world_upload_url(world_name).await?;
            let file = tokio::fs::File::open(&out).await?;
            let len = file.metadata().await?.len();
            self.api
                .http()
                .put(&target.url)
                .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                .header(reqwest::header::CONTENT_LENGTH, len)
                .body(reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file)))
                .send()
                .await
                .context("world upload request")?
                .error_for_status()?;
            tracing::info!(world = world_name, world_id = %target.world_id, size = len, "world uploaded");
            anyhow::Ok(target.world_id)
        }
        .await;

        discard_temp(&tmp).await;
        result
    }
}
