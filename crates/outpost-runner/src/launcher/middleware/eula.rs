use async_trait::async_trait;

use crate::env::GAMEDATA_DIR;
use crate::launcher::core::{Handler, LauncherContext, Middleware};

pub struct EulaMiddleware;

#[async_trait]
impl Middleware for EulaMiddleware {
    fn name(&self) -> &'static str {
        "eula"
    }

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()> {
        let path = c.env.data_path(GAMEDATA_DIR).join("eula.txt");
        crate::fs_util::write_atomic(&path, b"eula=true\n").await?;
        next(c).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::core::testing::{fixture, noop};

    #[tokio::test]
    async fn accepts_eula_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path(), Default::default());
        EulaMiddleware.handle(f.ctx, noop()).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("gamedata/eula.txt")).unwrap();
        assert_eq!(text, "eula=true\n");
    }
}
