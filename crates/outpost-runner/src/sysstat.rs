//! The `--sysstat` role: reports host CPU usage to the control panel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use outpost_rpc::types::{Event, method, role};
use outpost_rpc::{Client, Server};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::env::DataRoot;
use crate::events::{EventSink, SupervisorEvents};

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        // user nice system idle iowait irq softirq steal; guest time is
        // already folded into user.
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|f| f.parse().ok())
            .collect::<Option<_>>()?;
        if fields.len() < 4 {
            return None;
        }
        let total: u64 = fields.iter().sum();
        let idle = fields[3].saturating_add(fields.get(4).copied().unwrap_or(0));
        Some(Self {
            busy: total.saturating_sub(idle),
            total,
        })
    }

    /// Busy share in percent between `prev` and `self`; `None` when no time
    /// passed or the counters went backwards.
    pub fn usage_since(self, prev: Self) -> Option<f64> {
        let total = self.total.checked_sub(prev.total)?;
        if total == 0 {
            return None;
        }
        let busy = self.busy.saturating_sub(prev.busy);
        Some((busy as f64 * 100.0 / total as f64).min(100.0))
    }
}

#[async_trait]
pub trait CpuSource: Send + Sync {
    async fn sample(&self) -> anyhow::Result<CpuTimes>;
}

pub struct ProcStat {
    path: PathBuf,
}

impl Default for ProcStat {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/stat"),
        }
    }
}

#[async_trait]
impl CpuSource for ProcStat {
    async fn sample(&self) -> anyhow::Result<CpuTimes> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read {}", self.path.display()))?;
        CpuTimes::parse(&raw).ok_or_else(|| anyhow::anyhow!("no cpu line in {}", self.path.display()))
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Sends one `sysstat` event per `interval` until cancelled.
pub async fn report(
    source: &dyn CpuSource,
    events: &dyn EventSink,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut prev = match source.sample().await {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!(error = %e, "initial cpu sample failed");
            None
        }
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let cur = match source.sample().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "cpu sample failed");
                continue;
            }
        };
        if let Some(usage) = prev.and_then(|p| cur.usage_since(p)) {
            events.send(Event::sysstat(usage, unix_millis())).await;
        }
        prev = Some(cur);
    }
    tracing::debug!("sysstat reporter stopped");
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let supervisor = Client::new(data.endpoint(role::SUPERVISOR));
    let events = SupervisorEvents::new(supervisor.clone());

    let cancel = CancellationToken::new();
    let mut server = Server::new(data.endpoint(role::SYSSTAT));
    let stop = cancel.clone();
    server.register_notify(method::BASE_STOP, move |_: Value| {
        tracing::info!("stop requested by supervisor");
        stop.cancel();
        async { Ok(()) }
    });
    let rpc = tokio::spawn(
        server
            .bind()
            .context("bind sysstat endpoint")?
            .serve(cancel.clone()),
    );

    if let Err(e) = supervisor
        .notify(method::PROC_REGISTER_STOP_HOOK, role::SYSSTAT)
        .await
    {
        tracing::warn!(error = %e, "could not register stop hook");
    }
    tokio::spawn(crate::supervisor::wait_for_signal(cancel.clone()));

    let source: Arc<dyn CpuSource> = Arc::new(ProcStat::default());
    report(
        source.as_ref(),
        &events,
        crate::tunables::sysstat_interval(),
        cancel.clone(),
    )
    .await;
    let _ = rpc.await;
    Ok(0)
}
