use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use outpost_rpc::types::{Event, EventCode};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::executor::CommandExecutor;
use super::settings::{Settings, find_java};
use super::state::StateRepository;
use crate::env::{EnvProvider, GAMEDATA_DIR};
use crate::events::EventSink;
use crate::tunables::{self, Backoff};

/// The run ended because a restart was asked for; the launcher maps this to
/// its restart exit code.
#[derive(Debug, thiserror::Error)]
#[error("restart requested")]
pub struct RestartRequested;

pub fn is_restart(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RestartRequested>().is_some()
}

/// Everything one run of the pipeline works with.
#[derive(Clone)]
pub struct LauncherContext {
    pub cancel: CancellationToken,
    pub settings: Arc<Settings>,
    pub env: Arc<dyn EnvProvider>,
    pub state: Arc<dyn StateRepository>,
    pub events: Arc<dyn EventSink>,
}

pub type Handler =
    Arc<dyn Fn(LauncherContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(LauncherContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |c| Box::pin(f(c)))
}

/// One layer of the launch onion. Work before `next` runs on the way in,
/// work after it on the way out.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()>;
}

pub fn wrap(m: Arc<dyn Middleware>, next: Handler) -> Handler {
    Arc::new(move |c| {
        let m = m.clone();
        let next = next.clone();
        Box::pin(async move { m.handle(c, next).await })
    })
}

/// Runs right before every launch attempt. An error aborts the run.
#[async_trait]
pub trait BeforeLaunch: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before_launch(&self, c: &LauncherContext) -> anyhow::Result<()>;
}

/// Whether the next clean stop should come back as a restart.
#[derive(Debug, Default)]
pub struct StopIntent {
    restart: AtomicBool,
}

impl StopIntent {
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn is_restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub jitter_ms: u64,
    /// A run at least this long resets the attempt counter.
    pub stable_after: Duration,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            backoff: tunables::launch_backoff(),
            jitter_ms: 500,
            stable_after: tunables::stable_run_threshold(),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.backoff.delay_ms(attempt).saturating_add(jitter))
    }
}

pub struct LauncherCore {
    executor: Arc<dyn CommandExecutor>,
    middlewares: Vec<Arc<dyn Middleware>>,
    before_launch: Vec<Arc<dyn BeforeLaunch>>,
    intent: Arc<StopIntent>,
    retry: RetryPolicy,
}

impl LauncherCore {
    pub fn new(executor: Arc<dyn CommandExecutor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            middlewares: Vec::new(),
            before_launch: Vec::new(),
            intent: Arc::default(),
            retry,
        }
    }

    /// Declared first is innermost.
    pub fn use_middleware(&mut self, m: Arc<dyn Middleware>) {
        self.middlewares.push(m);
    }

    pub fn add_before_launch(&mut self, l: Arc<dyn BeforeLaunch>) {
        self.before_launch.push(l);
    }

    pub fn intent(&self) -> Arc<StopIntent> {
        self.intent.clone()
    }

    /// Entry order, outermost first.
    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middlewares.iter().rev().map(|m| m.name()).collect()
    }

    pub async fn start(&self, c: LauncherContext) -> anyhow::Result<()> {
        let executor = self.executor.clone();
        let listeners = self.before_launch.clone();
        let intent = self.intent.clone();
        let retry = self.retry;
        let innermost = handler(move |c| {
            let executor = executor.clone();
            let listeners = listeners.clone();
            let intent = intent.clone();
            async move { launch_loop(c, executor.as_ref(), &listeners, &intent, retry).await }
        });

        let chain = self
            .middlewares
            .iter()
            .fold(innermost, |next, m| wrap(m.clone(), next));
        tracing::info!(pipeline = ?self.middleware_names(), "starting launch pipeline");
        chain(c).await
    }
}

fn stopped(intent: &StopIntent) -> anyhow::Result<()> {
    if intent.take_restart() {
        return Err(RestartRequested.into());
    }
    Ok(())
}

async fn launch_loop(
    c: LauncherContext,
    executor: &dyn CommandExecutor,
    listeners: &[Arc<dyn BeforeLaunch>],
    intent: &StopIntent,
    retry: RetryPolicy,
) -> anyhow::Result<()> {
    let java = find_java(c.settings.get().java_version).await;
    let work_dir = c.env.data_path(GAMEDATA_DIR);
    let mut attempt: u32 = 0;

    loop {
        if c.cancel.is_cancelled() {
            return stopped(intent);
        }
        for l in listeners {
            l.before_launch(&c)
                .await
                .with_context(|| format!("before launch: {}", l.name()))?;
        }
        let cmdline = c.settings.get().command_line(&java)?;

        c.events.send(Event::status(EventCode::LOADING)).await;
        let started = Instant::now();
        let result = executor.run(&cmdline, &work_dir, &c.cancel).await;
        if c.cancel.is_cancelled() {
            return stopped(intent);
        }
        match result {
            Ok(Some(0)) => return stopped(intent),
            Ok(code) => tracing::warn!(?code, "game process failed"),
            Err(e) => {
                tracing::warn!(error = %outpost_rpc::format_error_chain(&e), "game process could not run")
            }
        }
        c.events.send(Event::status(EventCode::CRASHED)).await;

        if started.elapsed() >= retry.stable_after {
            attempt = 0;
        }
        attempt += 1;
        let delay = retry.delay(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "relaunching game");
        tokio::select! {
            _ = c.cancel.cancelled() => return stopped(intent),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
