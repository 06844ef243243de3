use async_trait::async_trait;

use crate::env::WORLD_DIR;
use crate::launcher::core::{Handler, LauncherContext, Middleware};
use crate::launcher::leveldat;

/// Takes the server version from the world when `preferDetected` is set.
pub struct AutoVersionMiddleware;

#[async_trait]
impl Middleware for AutoVersionMiddleware {
    fn name(&self) -> &'static str {
        "auto-version"
    }

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()> {
        if c.settings.get().prefer_detected {
            let path = c.env.data_path(WORLD_DIR).join("level.dat");
            match tokio::task::spawn_blocking(move || leveldat::read_version_name(&path)).await {
                Ok(Ok(version)) => {
                    tracing::info!(version = %version, "using version detected from world");
                    c.settings.update(|s| s.version = version);
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %outpost_rpc::format_error_chain(&e), "version detection failed")
                }
                Err(e) => tracing::warn!(error = %e, "version detection task failed"),
            }
        }
        next(c).await
    }
}
