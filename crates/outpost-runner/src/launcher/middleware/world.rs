use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use outpost_rpc::format_error_chain;
use outpost_rpc::types::{Event, EventCode};

use crate::env::WORLD_DIR;
use crate::launcher::core::{Handler, LauncherContext, Middleware, is_restart};
use crate::launcher::state::WORLD_KEY;
use crate::launcher::world_service::WorldStorage;

const LATEST: &str = "@/latest";

/// Brings the configured world in before the run and uploads it after.
pub struct WorldMiddleware {
    storage: Arc<dyn WorldStorage>,
}

impl WorldMiddleware {
    pub fn new(storage: Arc<dyn WorldStorage>) -> Self {
        Self { storage }
    }

    async fn prepare(&self, c: &LauncherContext) -> anyhow::Result<()> {
        let s = c.settings.get();
        let mut resource_id = s.world_resource_id.clone();
        if resource_id == LATEST {
            resource_id = self
                .storage
                .latest_resource_id(&s.world_name)
                .await
                .with_context(|| format!("resolve latest world for {}", s.world_name))?;
            tracing::info!(world = %s.world_name, resource_id = %resource_id, "resolved latest world");
            let id = resource_id.clone();
            c.settings.update(|s| s.world_resource_id = id);
        }

        let previous = c.state.get(WORLD_KEY).await?;
        if !s.new_world && previous.as_deref() == Some(resource_id.as_str()) {
            tracing::debug!(resource_id = %resource_id, "world already in place");
            return Ok(());
        }

        c.state.remove(WORLD_KEY).await?;
        let world_dir = c.env.data_path(WORLD_DIR);
        tokio::task::spawn_blocking(move || crate::fs_util::remove_path(&world_dir))
            .await
            .context("world removal task")?
            .context("remove old world")?;

        if s.new_world {
            tracing::info!(world = %s.world_name, "starting with a freshly generated world");
            return Ok(());
        }
        c.events.send(Event::status(EventCode::WORLD_DOWNLOAD)).await;
        self.storage
            .download_world(&resource_id, c.env.as_ref())
            .await
            .with_context(|| format!("download world {resource_id}"))?;
        c.state.set(WORLD_KEY, &resource_id).await?;
        Ok(())
    }

    async fn upload(&self, c: &LauncherContext) -> anyhow::Result<()> {
        c.events.send(Event::status(EventCode::WORLD_UPLOAD)).await;
        let world_name = c.settings.get().world_name;
        let id = self.storage.upload_world(&world_name, c.env.as_ref()).await?;
        c.state.set(WORLD_KEY, &id).await?;
        c.settings.update(|s| {
            s.world_resource_id = id;
            s.new_world = false;
        });
        Ok(())
    }
}

#[async_trait]
impl Middleware for WorldMiddleware {
    fn name(&self) -> &'static str {
        "world"
    }

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()> {
        if let Err(e) = self.prepare(&c).await {
            c.events.send(Event::status(EventCode::WORLD_ERR)).await;
            return Err(e);
        }
        c.events.send(Event::status(EventCode::WORLD_PREPARE)).await;

        let result = next(c.clone()).await;
        match &result {
            Err(e) if !is_restart(e) => return result,
            _ => {}
        }

        if let Err(upload_err) = self.upload(&c).await {
            c.events.send(Event::status(EventCode::WORLD_ERR)).await;
            let upload_msg = format_error_chain(&upload_err);
            return Err(match result {
                Err(run_err) => anyhow::anyhow!("{run_err}; world upload failed: {upload_msg}"),
                Ok(()) => upload_err.context("upload world"),
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::core::RestartRequested;
    use crate::launcher::core::handler;
    use crate::launcher::core::testing::{fixture, noop};
    use crate::launcher::settings::RunSettings;
    use crate::launcher::state::StateRepository;
    use crate::launcher::world_service::testing::FakeStorage;

    fn settings(resource_id: &str, new_world: bool) -> RunSettings {
        RunSettings {
            world_name: "survival".into(),
            world_resource_id: resource_id.into(),
            new_world,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_resource_id_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("gamedata/world");
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("level.dat"), b"kept").unwrap();

        let f = fixture(dir.path(), settings("survival/1.tar.gz", false));
        f.state.set(WORLD_KEY, "survival/1.tar.gz").await.unwrap();
        let storage = Arc::new(FakeStorage::default());
        WorldMiddleware::new(storage.clone())
            .handle(f.ctx.clone(), noop())
            .await
            .unwrap();

        assert!(storage.downloads().is_empty());
        assert_eq!(storage.uploads(), vec!["survival"]);
        assert_eq!(f.state.value(WORLD_KEY).as_deref(), Some("survival/1.tar.gz"));
        assert_eq!(f.ctx.settings.get().world_resource_id, "survival/1.tar.gz");
        assert_eq!(
            f.events.status_codes(),
            vec![EventCode::WORLD_PREPARE, EventCode::WORLD_UPLOAD]
        );
    }

    #[tokio::test]
    async fn changed_resource_id_removes_world_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("gamedata/world");
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("stale.mca"), b"old").unwrap();

        let f = fixture(dir.path(), settings("survival/2.tar.gz", false));
        f.state.set(WORLD_KEY, "survival/1.tar.gz").await.unwrap();
        let storage = Arc::new(FakeStorage::default());
        WorldMiddleware::new(storage.clone())
            .handle(f.ctx.clone(), noop())
            .await
            .unwrap();

        assert_eq!(storage.downloads(), vec!["survival/2.tar.gz"]);
        assert_eq!(*storage.world_existed_on_download.lock().unwrap(), vec![false]);
        assert!(!world.join("stale.mca").exists());
        assert_eq!(
            f.events.status_codes()[..2],
            [EventCode::WORLD_DOWNLOAD, EventCode::WORLD_PREPARE]
        );
    }

    #[tokio::test]
    async fn latest_marker_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), settings(LATEST, false));
        let storage = Arc::new(FakeStorage::default());
        *storage.latest.lock().unwrap() = "survival/7.tar.gz".into();
        WorldMiddleware::new(storage.clone())
            .handle(f.ctx.clone(), noop())
            .await
            .unwrap();
        assert_eq!(storage.downloads(), vec!["survival/7.tar.gz"]);
    }

    #[tokio::test]
    async fn new_world_wipes_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("gamedata/world");
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("level.dat"), b"old").unwrap();

        let f = fixture(dir.path(), settings("survival/1.tar.gz", true));
        f.state.set(WORLD_KEY, "survival/1.tar.gz").await.unwrap();
        let storage = Arc::new(FakeStorage::default());
        WorldMiddleware::new(storage.clone())
            .handle(f.ctx.clone(), noop())
            .await
            .unwrap();

        assert!(storage.downloads().is_empty());
        assert!(!world.exists());
        assert!(!f.ctx.settings.get().new_world);
    }

    #[tokio::test]
    async fn restart_still_uploads_but_other_errors_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), settings("survival/1.tar.gz", true));
        let storage = Arc::new(FakeStorage::default());
        let m = WorldMiddleware::new(storage.clone());

        let err = m
            .handle(f.ctx.clone(), handler(|_| async { Err::<(), anyhow::Error>(RestartRequested.into()) }))
            .await
            .unwrap_err();
        assert!(is_restart(&err));
        assert_eq!(storage.uploads().len(), 1);

        let err = m
            .handle(f.ctx.clone(), handler(|_| async { Err::<(), _>(anyhow::anyhow!("crashed hard")) }))
            .await
            .unwrap_err();
        assert!(!is_restart(&err));
        assert_eq!(storage.uploads().len(), 1);
    }

    #[tokio::test]
    async fn failed_upload_reports_world_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), settings("survival/1.tar.gz", true));
        let storage = Arc::new(FakeStorage::default());
        *storage.fail_upload.lock().unwrap() = Some("bucket gone".into());

        let err = WorldMiddleware::new(storage)
            .handle(f.ctx.clone(), noop())
            .await
            .unwrap_err();
        assert!(format_error_chain(&err).contains("bucket gone"));
        assert_eq!(f.events.status_codes().last(), Some(&EventCode::WORLD_ERR));
    }
}
