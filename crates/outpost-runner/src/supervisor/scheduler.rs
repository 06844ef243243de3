use futures_util::future::BoxFuture;
use outpost_process::TaskId;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Resolves once the task counts as started.
pub type StartAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct TaskDef {
    pub description: String,
    pub prerequisites: Vec<TaskId>,
    pub start: StartAction,
}

impl TaskDef {
    pub fn new(description: impl Into<String>, prerequisites: Vec<TaskId>, start: StartAction) -> Self {
        Self {
            description: description.into(),
            prerequisites,
            start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("task {task} depends on unknown task {missing}")]
    UnknownPrerequisite { task: TaskId, missing: TaskId },
    #[error("dependency cycle through task {0}")]
    Cycle(TaskId),
}

struct Node {
    description: String,
    dependents: Vec<usize>,
    pending: usize,
    start: Option<StartAction>,
}

/// Task arena; a task's id is its index in the list it was built from.
pub struct Scheduler {
    nodes: Vec<Node>,
}

impl Scheduler {
    pub fn new(tasks: Vec<TaskDef>) -> Result<Self, ScheduleError> {
        let n = tasks.len();
        let mut prereqs: Vec<Vec<usize>> = Vec::with_capacity(n);
        for (i, task) in tasks.iter().enumerate() {
            let mut deps = Vec::with_capacity(task.prerequisites.len());
            for dep in &task.prerequisites {
                if dep.0 >= n {
                    return Err(ScheduleError::UnknownPrerequisite {
                        task: TaskId(i),
                        missing: *dep,
                    });
                }
                if !deps.contains(&dep.0) {
                    deps.push(dep.0);
                }
            }
            prereqs.push(deps);
        }

        let mut nodes: Vec<Node> = tasks
            .into_iter()
            .zip(prereqs.iter())
            .map(|(t, deps)| Node {
                description: t.description,
                dependents: Vec::new(),
                pending: deps.len(),
                start: Some(t.start),
            })
            .collect();
        for (i, deps) in prereqs.iter().enumerate() {
            for &d in deps {
                nodes[d].dependents.push(i);
            }
        }

        check_acyclic(&nodes)?;
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Fires every start action as soon as all of its prerequisites have
    /// started. Returns when every reachable task has started.
    pub async fn run(mut self) {
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.pending).collect();
        let mut running = JoinSet::new();

        for idx in 0..self.nodes.len() {
            if pending[idx] == 0 {
                self.fire(idx, &mut running);
            }
        }

        while let Some(joined) = running.join_next().await {
            let idx = match joined {
                Ok(idx) => idx,
                Err(e) => {
                    tracing::error!(error = %e, "start action panicked; its dependents will not start");
                    continue;
                }
            };
            tracing::debug!(task = %self.nodes[idx].description, "task started");

            let dependents = std::mem::take(&mut self.nodes[idx].dependents);
            for d in dependents {
                pending[d] -= 1;
                if pending[d] == 0 {
                    self.fire(d, &mut running);
                }
            }
        }
    }

    fn fire(&mut self, idx: usize, running: &mut JoinSet<usize>) {
        let node = &mut self.nodes[idx];
        let Some(start) = node.start.take() else {
            return;
        };
        let span = tracing::info_span!("task", id = idx, task = %node.description);
        tracing::info!(parent: &span, "starting task");
        running.spawn(
            async move {
                start().await;
                idx
            }
            .instrument(span),
        );
    }
}

fn check_acyclic(nodes: &[Node]) -> Result<(), ScheduleError> {
    let mut pending: Vec<usize> = nodes.iter().map(|n| n.pending).collect();
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = ready.pop() {
        visited += 1;
        for &d in &nodes[i].dependents {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.push(d);
            }
        }
    }
    if visited == nodes.len() {
        return Ok(());
    }
    let stuck = pending.iter().position(|&p| p > 0).unwrap_or(0);
    Err(ScheduleError::Cycle(TaskId(stuck)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::seq::SliceRandom;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Fired(usize),
        Started(usize),
    }

    fn recording_action(log: Arc<Mutex<Vec<Mark>>>, id: usize, delay_ms: u64) -> StartAction {
        Box::new(move || {
            Box::pin(async move {
                log.lock().unwrap().push(Mark::Fired(id));
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                } else {
                    tokio::task::yield_now().await;
                }
                log.lock().unwrap().push(Mark::Started(id));
            })
        })
    }

    fn noop() -> StartAction {
        Box::new(|| Box::pin(async {}))
    }

    #[test]
    fn rejects_unknown_prerequisite() {
        let err = Scheduler::new(vec![TaskDef::new("a", vec![TaskId(3)], noop())])
            .err()
            .unwrap();
        assert_eq!(
            err,
            ScheduleError::UnknownPrerequisite {
                task: TaskId(0),
                missing: TaskId(3)
            }
        );
    }

    #[test]
    fn rejects_cycles_including_self_loops() {
        let err = Scheduler::new(vec![
            TaskDef::new("a", vec![TaskId(1)], noop()),
            TaskDef::new("b", vec![TaskId(0)], noop()),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, ScheduleError::Cycle(_)));

        let err = Scheduler::new(vec![TaskDef::new("self", vec![TaskId(0)], noop())])
            .err()
            .unwrap();
        assert_eq!(err, ScheduleError::Cycle(TaskId(0)));
    }

    #[test]
    fn duplicate_prerequisites_are_counted_once() {
        let s = Scheduler::new(vec![
            TaskDef::new("a", vec![], noop()),
            TaskDef::new("b", vec![TaskId(0), TaskId(0)], noop()),
        ])
        .unwrap();
        assert_eq!(s.nodes[1].pending, 1);
    }

    #[tokio::test]
    async fn dependents_wait_for_start_not_completion_of_long_runners() {
        // "daemon" never finishes its own work, but its start action returns.
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_never_tx, never_rx) = tokio::sync::oneshot::channel::<()>();
        let daemon: StartAction = {
            let log = log.clone();
            Box::new(move || {
                Box::pin(async move {
                    tokio::spawn(async move {
                        let _ = never_rx.await;
                    });
                    log.lock().unwrap().push(Mark::Started(0));
                })
            })
        };
        let s = Scheduler::new(vec![
            TaskDef::new("daemon", vec![], daemon),
            TaskDef::new("dependent", vec![TaskId(0)], recording_action(log.clone(), 1, 0)),
        ])
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), s.run()).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![Mark::Started(0), Mark::Fired(1), Mark::Started(1)]
        );
    }

    #[tokio::test]
    async fn random_dags_never_start_before_prerequisites() {
        let mut rng = rand::thread_rng();
        for _ in 0..40 {
            let n = rng.gen_range(1..=24);
            // Random topological labelling so edges don't always point "forward".
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);

            let mut deps: Vec<Vec<TaskId>> = vec![Vec::new(); n];
            for pos in 0..n {
                for earlier in 0..pos {
                    if rng.gen_bool(0.3) {
                        deps[order[pos]].push(TaskId(order[earlier]));
                    }
                }
            }

            let log = Arc::new(Mutex::new(Vec::new()));
            let tasks = (0..n)
                .map(|id| {
                    let delay = rng.gen_range(0..3);
                    TaskDef::new(
                        format!("t{id}"),
                        deps[id].clone(),
                        recording_action(log.clone(), id, delay),
                    )
                })
                .collect();
            let s = Scheduler::new(tasks).unwrap();
            tokio::time::timeout(Duration::from_secs(10), s.run())
                .await
                .unwrap();

            let log = log.lock().unwrap();
            let pos = |m: Mark| log.iter().position(|x| *x == m);
            for id in 0..n {
                let fired = pos(Mark::Fired(id)).expect("every task fires");
                assert_eq!(log.iter().filter(|m| **m == Mark::Fired(id)).count(), 1);
                for dep in &deps[id] {
                    let started = pos(Mark::Started(dep.0)).expect("prerequisite started");
                    assert!(started < fired, "task {id} fired before prerequisite {} started", dep.0);
                }
            }
        }
    }
}
