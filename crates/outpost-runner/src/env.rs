use std::path::{Path, PathBuf};

use anyhow::Context;

pub const GAMEDATA_DIR: &str = "gamedata";
pub const WORLD_DIR: &str = "gamedata/world";
pub const SERVERS_DIR: &str = "servers.d";
pub const TMP_DIR: &str = "tmp";
pub const LOGS_DIR: &str = "logs";
pub const CONFIG_FILE: &str = "config.json";
pub const STATES_FILE: &str = "states.json";

/// Resolves paths relative to the runner's data root.
pub trait EnvProvider: Send + Sync {
    fn data_path(&self, rel: &str) -> PathBuf;

    fn temp_dir(&self) -> PathBuf {
        self.data_path(TMP_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let raw = crate::tunables::env_string("OUTPOST_DATA_ROOT")
            .unwrap_or_else(|| "/opt/outpost".to_string());
        let p = PathBuf::from(raw);
        let abs = if p.is_absolute() {
            p
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(p)
        };
        // The directory may not exist yet on first boot.
        Self::new(std::fs::canonicalize(&abs).unwrap_or(abs))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn endpoint(&self, role: &str) -> PathBuf {
        outpost_rpc::endpoint_path(&self.root, role)
    }
}

impl EnvProvider for DataRoot {
    fn data_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

/// Creates a fresh, uniquely named directory under the temp dir.
pub async fn make_temp_dir(env: &dyn EnvProvider) -> anyhow::Result<PathBuf> {
    let dir = env
        .temp_dir()
        .join(uuid::Uuid::new_v4().simple().to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create temp dir {}", dir.display()))?;
    Ok(dir)
}
