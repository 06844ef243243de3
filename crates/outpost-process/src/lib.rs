use std::time::Duration;

/// Exit code a daemon uses to ask its supervisor for an immediate re-run.
pub const EXIT_RESTART_REQUESTED: i32 = 100;

/// Index of a task in the supervisor's task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TaskId(pub usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
}

/// Which identity a child runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeClass {
    Restricted,
    Privileged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDelay {
    Fixed(Duration),
    /// Uniform random delay in `[0, max]`.
    Jitter { max: Duration },
}

impl Default for RestartDelay {
    fn default() -> Self {
        RestartDelay::Jitter {
            max: Duration::from_secs(9),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Clean,
    RestartRequested,
    Failure,
}

impl ExitDisposition {
    /// `None` means the child died from a signal.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitDisposition::Clean,
            Some(EXIT_RESTART_REQUESTED) => ExitDisposition::RestartRequested,
            _ => ExitDisposition::Failure,
        }
    }
}

/// What the supervision loop does after a child exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Stop,
    Relaunch { delayed: bool },
}

impl RestartPolicy {
    pub fn next_step(self, disposition: ExitDisposition) -> NextStep {
        match (self, disposition) {
            (RestartPolicy::Never, _) => NextStep::Stop,
            (RestartPolicy::OnFailure, ExitDisposition::Clean) => NextStep::Stop,
            (RestartPolicy::OnFailure, ExitDisposition::RestartRequested) => {
                NextStep::Relaunch { delayed: false }
            }
            (RestartPolicy::OnFailure, ExitDisposition::Failure) => {
                NextStep::Relaunch { delayed: true }
            }
        }
    }
}

/// How to launch one supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSpec {
    pub program: String,
    pub args: Vec<String>,
    pub restart: RestartPolicy,
    pub privilege: PrivilegeClass,
    pub delay: RestartDelay,
    /// A gate counts as started only once its first run has ended.
    pub gate: bool,
}

impl ProcSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            restart: RestartPolicy::Never,
            privilege: PrivilegeClass::Restricted,
            delay: RestartDelay::default(),
            gate: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privilege = PrivilegeClass::Privileged;
        self
    }

    pub fn fixed_delay(mut self, delay: Duration) -> Self {
        self.delay = RestartDelay::Fixed(delay);
        self
    }

    pub fn gate(mut self) -> Self {
        self.gate = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Pending,
    Running,
    Waiting,
    Exited,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub id: TaskId,
    pub description: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub restarts: u32,
}

impl ProcessStatus {
    pub fn pending(id: TaskId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            state: ProcessState::Pending,
            pid: None,
            exit_code: None,
            restarts: 0,
        }
    }
}
