//! Payloads exchanged between the runner's daemons.

use serde::{Deserialize, Serialize};

pub mod method {
    pub const STATUS_PUSH: &str = "status/push";
    pub const PROC_REGISTER_STOP_HOOK: &str = "proc/registerStopHook";
    pub const PROC_DONE: &str = "proc/done";
    pub const PROC_LIST: &str = "proc/list";
    pub const STATE_SAVE: &str = "state/save";
    pub const STATE_GET: &str = "state/get";
    pub const STATE_REMOVE: &str = "state/remove";

    pub const BASE_STOP: &str = "base/stop";

    pub const GAME_STOP: &str = "game/stop";
    pub const GAME_RECONFIGURE: &str = "game/reconfigure";
    pub const SNAPSHOT_CREATE: &str = "snapshot/create";
    pub const SNAPSHOT_UNDO: &str = "snapshot/undo";
    pub const SNAPSHOT_STAT: &str = "snapshot/stat";
    pub const SNAPSHOT_DELETE: &str = "snapshot/delete";

    pub const CONNECTOR_CONNECT: &str = "connector/connect";
}

pub mod role {
    pub const SUPERVISOR: &str = "supervisor";
    pub const LAUNCHER: &str = "launcher";
    pub const SNAPSHOT_HELPER: &str = "snapshot-helper";
    pub const CONNECTOR: &str = "connector";
    pub const SYSSTAT: &str = "sysstat";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSetInput {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateKeyInput {
    pub key: String,
}

/// Helper-side snapshot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSlotInput {
    pub slot: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub path: String,
}

/// Launcher-side snapshot request, carrying the user who asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInput {
    pub slot: i32,
    #[serde(default)]
    pub actor: i32,
}

/// A control-panel request to open a tunnel to the game port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub connection_id: String,
    pub endpoint: String,
    /// PEM certificate the tunnel endpoint presents.
    pub server_cert: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    #[serde(default)]
    pub dispatch: bool,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCode(pub i32);

impl EventCode {
    pub const SHUTDOWN: Self = Self(1);
    pub const SYS_INIT: Self = Self(2);
    pub const GAME_DOWNLOAD: Self = Self(3);
    pub const WORLD_DOWNLOAD: Self = Self(4);
    pub const WORLD_PREPARE: Self = Self(5);
    pub const WORLD_UPLOAD: Self = Self(6);
    pub const LOADING: Self = Self(7);
    pub const RUNNING: Self = Self(8);
    pub const STOPPING: Self = Self(9);
    pub const CRASHED: Self = Self(10);
    pub const CLEAN: Self = Self(11);

    // Failures the UI offers to retry.
    pub const GAME_ERR: Self = Self(50);
    pub const WORLD_ERR: Self = Self(51);
    pub const LAUNCH_ERR: Self = Self(52);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoCode(pub i32);

impl InfoCode {
    pub const SNAPSHOT_DONE: Self = Self(1);
    pub const SNAPSHOT_ERROR: Self = Self(2);
    pub const NO_SNAPSHOT: Self = Self(3);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Hello,
    Status,
    Sysstat,
    Info,
    Started,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusExtra {
    pub event_code: EventCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SysstatExtra {
    pub cpu_usage: f64,
    /// Unix milliseconds.
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoExtra {
    pub info_code: InfoCode,
    #[serde(default)]
    pub actor: i32,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldInfo {
    pub name: String,
    pub seed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedExtra {
    pub server_version: String,
    pub world: WorldInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub metadata: RequestMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusExtra>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysstat: Option<SysstatExtra>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<InfoExtra>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<StartedExtra>,
}

impl Event {
    fn new(kind: EventType) -> Self {
        Self {
            kind,
            metadata: RequestMeta {
                traceparent: crate::trace::current().map(str::to_string),
            },
            status: None,
            sysstat: None,
            info: None,
            started: None,
        }
    }

    pub fn status(code: EventCode) -> Self {
        let mut ev = Self::new(EventType::Status);
        ev.status = Some(StatusExtra {
            event_code: code,
            progress: None,
        });
        ev
    }

    pub fn progress(code: EventCode, percent: i32) -> Self {
        let mut ev = Self::status(code);
        if let Some(s) = ev.status.as_mut() {
            s.progress = Some(percent.clamp(0, 100));
        }
        ev
    }

    pub fn sysstat(cpu_usage: f64, time: i64) -> Self {
        let mut ev = Self::new(EventType::Sysstat);
        ev.sysstat = Some(SysstatExtra { cpu_usage, time });
        ev
    }

    pub fn info(code: InfoCode, actor: i32, is_error: bool) -> Self {
        let mut ev = Self::new(EventType::Info);
        ev.info = Some(InfoExtra {
            info_code: code,
            actor,
            is_error,
        });
        ev
    }

    pub fn started(server_version: &str, world_name: &str, seed: &str) -> Self {
        let mut ev = Self::new(EventType::Started);
        ev.started = Some(StartedExtra {
            server_version: server_version.to_string(),
            world: WorldInfo {
                name: world_name.to_string(),
                seed: seed.to_string(),
            },
        });
        ev
    }

    pub fn status_code(&self) -> Option<EventCode> {
        self.status.as_ref().map(|s| s.event_code)
    }
}
