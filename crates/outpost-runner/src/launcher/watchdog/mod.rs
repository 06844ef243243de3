//! Periodic checks that decide whether the game is up, and act on it.

mod activeness;
mod liveness;
mod one_time_init;

pub use activeness::Activeness;
pub use liveness::{DEFAULT_GAME_ADDR, Liveness};
pub use one_time_init::OneTimeInit;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outpost_rpc::types::{Event, EventCode};
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;

/// Aggregate for one tick. Reset to online before the first watchdog runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub online: bool,
}

#[async_trait]
pub trait Watchdog: Send {
    fn name(&self) -> &'static str;

    /// `id` counts ticks from zero.
    async fn check(&mut self, id: u64, status: &mut WatchdogStatus) -> anyhow::Result<()>;
}

async fn tick(watchdogs: &mut [Box<dyn Watchdog>], id: u64) -> WatchdogStatus {
    let mut status = WatchdogStatus { online: true };
    for w in watchdogs.iter_mut() {
        if let Err(e) = w.check(id, &mut status).await {
            tracing::warn!(watchdog = w.name(), error = %outpost_rpc::format_error_chain(&e), "watchdog check failed");
        }
    }
    status
}

/// Emits Loading, then runs every watchdog once per interval until
/// cancelled. Only changes of the aggregate are reported.
pub async fn run_watchdogs(
    mut watchdogs: Vec<Box<dyn Watchdog>>,
    interval: Duration,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
) {
    events.send(Event::status(EventCode::LOADING)).await;

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut id: u64 = 0;
    let mut online = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let status = tokio::select! {
            _ = cancel.cancelled() => break,
            s = tick(&mut watchdogs, id) => s,
        };
        if status.online != online {
            online = status.online;
            tracing::info!(online, "game status changed");
            let code = if online { EventCode::RUNNING } else { EventCode::LOADING };
            events.send(Event::status(code)).await;
        }
        id += 1;
    }
    tracing::debug!("watchdogs stopped");
}
