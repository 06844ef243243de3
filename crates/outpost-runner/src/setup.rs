//! The `--setup` role: lays out the data root before anything else starts.

use anyhow::Context;
use outpost_rpc::Client;
use outpost_rpc::types::{Event, EventCode, role};

use crate::env::{DataRoot, EnvProvider, GAMEDATA_DIR, LOGS_DIR, SERVERS_DIR, TMP_DIR};
use crate::events::{EventSink, SupervisorEvents};

/// Directories the restricted user must be able to write.
const OWNED_DIRS: &[&str] = &[GAMEDATA_DIR, SERVERS_DIR, TMP_DIR];

/// Creates the layout and, with `owner`, hands the writable parts to it.
pub fn prepare(env: &dyn EnvProvider, owner: Option<(u32, u32)>) -> anyhow::Result<()> {
    for rel in [GAMEDATA_DIR, SERVERS_DIR, TMP_DIR, LOGS_DIR] {
        let dir = env.data_path(rel);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let Some((uid, gid)) = owner else {
        return Ok(());
    };
    for rel in OWNED_DIRS {
        let dir = env.data_path(rel);
        #[cfg(unix)]
        std::os::unix::fs::chown(&dir, Some(uid), Some(gid))
            .with_context(|| format!("chown {} to {uid}:{gid}", dir.display()))?;
        tracing::debug!(path = %dir.display(), uid, gid, "ownership handed over");
    }
    Ok(())
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let owner = crate::tunables::restricted_ids();
    let env = data.clone();
    tokio::task::spawn_blocking(move || prepare(&env, Some(owner)))
        .await
        .context("setup task")??;
    tracing::info!(root = %data.root().display(), uid = owner.0, gid = owner.1, "data root prepared");

    let events = SupervisorEvents::new(Client::new(data.endpoint(role::SUPERVISOR)));
    events.send(Event::status(EventCode::SYS_INIT)).await;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_layout_without_owner_change() {
        let dir = tempfile::tempdir().unwrap();
        let env = DataRoot::new(dir.path().join("root"));
        prepare(&env, None).unwrap();
        for rel in ["gamedata", "servers.d", "tmp", "logs"] {
            assert!(dir.path().join("root").join(rel).is_dir(), "{rel} missing");
        }
        // Idempotent.
        prepare(&env, None).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn hands_dirs_to_current_owner() {
        use std::os::unix::fs::MetadataExt;
        let dir = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let env = DataRoot::new(dir.path());
        // Chowning to ourselves needs no privilege.
        prepare(&env, Some((meta.uid(), meta.gid()))).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("gamedata")).unwrap().uid(), meta.uid());
    }
}
