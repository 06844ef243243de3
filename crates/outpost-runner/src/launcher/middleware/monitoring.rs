use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::launcher::core::{Handler, LauncherContext, Middleware};
use crate::launcher::rcon::Console;
use crate::launcher::watchdog::{self, Activeness, Liveness, OneTimeInit, Watchdog};

type WatchdogFactory = Arc<dyn Fn(&LauncherContext) -> Vec<Box<dyn Watchdog>> + Send + Sync>;

/// Runs the watchdogs alongside the wrapped handler for as long as it runs.
pub struct MonitoringMiddleware {
    factory: WatchdogFactory,
    interval: Duration,
}

impl MonitoringMiddleware {
    /// Liveness, activeness and one-time init, built from the settings of
    /// each run.
    pub fn new(console: Console, interval: Duration) -> Self {
        Self::with_factory(
            move |c: &LauncherContext| {
                let s = c.settings.get();
                let watchdogs: Vec<Box<dyn Watchdog>> = vec![
                    Box::new(Liveness::new(watchdog::DEFAULT_GAME_ADDR)),
                    Box::new(Activeness::new(console.clone(), s.inactive_timeout)),
                    Box::new(OneTimeInit::new(
                        console.clone(),
                        c.events.clone(),
                        s.version,
                        s.world_name,
                        s.operators,
                        s.whitelist,
                    )),
                ];
                watchdogs
            },
            interval,
        )
    }

    pub fn with_factory<F>(factory: F, interval: Duration) -> Self
    where
        F: Fn(&LauncherContext) -> Vec<Box<dyn Watchdog>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            interval,
        }
    }
}

#[async_trait]
impl Middleware for MonitoringMiddleware {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()> {
        let watchdogs = (self.factory)(&c);
        let stop = c.cancel.child_token();
        let task = tokio::spawn(watchdog::run_watchdogs(
            watchdogs,
            self.interval,
            c.events.clone(),
            stop.clone(),
        ));

        let result = next(c).await;
        stop.cancel();
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "watchdog task ended abnormally");
        }
        result
    }
}
