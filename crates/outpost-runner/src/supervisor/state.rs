use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::Mutex;

/// Durable key-value store owned by the supervisor. Every mutation rewrites
/// the backing file before it becomes visible.
pub struct StateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl StateStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, String>>(&data) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "state file is corrupt; starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "state file unreadable; starting empty");
                BTreeMap::new()
            }
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "state loaded");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.mutate(|m| {
            m.insert(key.to_string(), value.to_string());
        })
        .await
    }

    pub async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.mutate(|m| {
            m.remove(key);
        })
        .await
    }

    async fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        let mut next = entries.clone();
        f(&mut next);
        let data = serde_json::to_vec_pretty(&next).context("serialize state")?;
        crate::fs_util::write_atomic(&self.path, &data)
            .await
            .with_context(|| format!("persist {}", self.path.display()))?;
        *entries = next;
        Ok(())
    }
}
