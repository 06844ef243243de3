//! The `--clean` role: runs once the launcher is gone for good.

use std::time::Duration;

use outpost_rpc::Client;
use outpost_rpc::types::{Event, EventCode, SnapshotSlotInput, method, role};
use serde_json::Value;

use crate::env::{DataRoot, EnvProvider, GAMEDATA_DIR, TMP_DIR};
use crate::events::{EventSink, SupervisorEvents};

const QUICK_SLOTS: std::ops::Range<i32> = 0..10;
const HELPER_TIMEOUT: Duration = Duration::from_secs(60);

fn remove_logged(path: &std::path::Path) {
    #[cfg(unix)]
    if path.is_dir() {
        use std::os::unix::fs::PermissionsExt;
        // Copied snapshots are sealed read-only.
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
    }
    if let Err(e) = crate::fs_util::remove_path(path) {
        tracing::warn!(path = %path.display(), error = %e, "cleanup could not remove path");
    }
}

/// Drops temp files and every snapshot. Best-effort throughout.
pub async fn sweep(env: &dyn EnvProvider, helper: &Client) {
    let tmp = env.data_path(TMP_DIR);
    tokio::task::block_in_place(|| remove_logged(&tmp));

    for slot in QUICK_SLOTS {
        let deleted: Result<String, _> = helper.call(method::SNAPSHOT_DELETE, SnapshotSlotInput { slot }).await;
        if let Err(e) = deleted {
            tracing::debug!(slot, error = %e, "helper did not delete slot");
        }
    }

    let gamedata = env.data_path(GAMEDATA_DIR);
    let leftovers: Vec<_> = match std::fs::read_dir(&gamedata) {
        Ok(rd) => rd
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("ss@"))
            .map(|e| e.path())
            .collect(),
        Err(_) => Vec::new(),
    };
    for path in leftovers {
        tracing::info!(path = %path.display(), "removing leftover snapshot");
        tokio::task::block_in_place(|| remove_logged(&path));
    }
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let supervisor = Client::new(data.endpoint(role::SUPERVISOR));
    let events = SupervisorEvents::new(supervisor.clone());
    events.send(Event::status(EventCode::CLEAN)).await;

    let helper = Client::new(data.endpoint(role::SNAPSHOT_HELPER)).with_timeout(HELPER_TIMEOUT);
    sweep(&data, &helper).await;
    tracing::info!("cleanup finished");

    events.dispatch(Event::status(EventCode::SHUTDOWN)).await;
    if let Err(e) = supervisor.notify(method::PROC_DONE, Value::Null).await {
        tracing::warn!(error = %e, "could not tell supervisor we are done");
    }
    Ok(0)
}
