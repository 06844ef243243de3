mod cleanup;
mod config;
mod connector;
mod control_api;
mod env;
mod events;
mod fs_util;
mod launcher;
mod logging;
mod setup;
mod snapshot_helper;
mod supervisor;
mod sysstat;
mod tunables;

use env::{DataRoot, EnvProvider, LOGS_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Supervisor,
    Setup,
    Launcher,
    SnapshotHelper,
    Sysstat,
    Connector,
    Clean,
}

impl Role {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "--supervisor" => Some(Self::Supervisor),
            "--setup" => Some(Self::Setup),
            "--launcher" => Some(Self::Launcher),
            "--snapshot-helper" => Some(Self::SnapshotHelper),
            "--sysstat" => Some(Self::Sysstat),
            "--connector" => Some(Self::Connector),
            "--clean" => Some(Self::Clean),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Setup => "setup",
            Self::Launcher => "launcher",
            Self::SnapshotHelper => "snapshot-helper",
            Self::Sysstat => "sysstat",
            Self::Connector => "connector",
            Self::Clean => "clean",
        }
    }
}

async fn run_role(role: Role) -> i32 {
    let data = DataRoot::from_env();
    let _guard = logging::init(role.name(), &data.data_path(LOGS_DIR));
    let traceparent = outpost_rpc::trace::init_from_env();
    tracing::info!(
        role = role.name(),
        root = %data.root().display(),
        traceparent,
        version = env!("CARGO_PKG_VERSION"),
        "runner starting"
    );

    let result = match role {
        Role::Supervisor => supervisor::run(data).await,
        Role::Setup => setup::run(data).await,
        Role::Launcher => launcher::run(data).await,
        Role::SnapshotHelper => snapshot_helper::run(data).await,
        Role::Sysstat => sysstat::run(data).await,
        Role::Connector => connector::run(data).await,
        Role::Clean => cleanup::run(data).await,
    };
    match result {
        Ok(code) => {
            tracing::info!(role = role.name(), code, "runner exiting");
            code
        }
        Err(e) => {
            tracing::error!(role = role.name(), error = %outpost_rpc::format_error_chain(&e), "runner failed");
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let arg = std::env::args().nth(1).unwrap_or_default();
    let Some(role) = Role::from_arg(&arg) else {
        eprintln!("usage: outpost-runner --supervisor|--setup|--launcher|--snapshot-helper|--sysstat|--connector|--clean");
        std::process::exit(2);
    };
    let code = run_role(role).await;
    std::process::exit(code);
}
