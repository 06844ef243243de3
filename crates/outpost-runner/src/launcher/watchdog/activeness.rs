use async_trait::async_trait;

use super::{Watchdog, WatchdogStatus};
use crate::launcher::rcon::Console;

/// Ticks between player-list queries; also the tick-to-minute divisor.
const EVALUATE_EVERY: u64 = 60;

/// Stops the server once nobody has been online for the configured number
/// of minutes.
pub struct Activeness {
    console: Console,
    timeout_minutes: i64,
    last_active: Option<u64>,
    stop_sent: bool,
}

impl Activeness {
    pub fn new(console: Console, timeout_minutes: i64) -> Self {
        Self {
            console,
            timeout_minutes,
            last_active: None,
            stop_sent: false,
        }
    }
}

#[async_trait]
impl Watchdog for Activeness {
    fn name(&self) -> &'static str {
        "activeness"
    }

    async fn check(&mut self, id: u64, status: &mut WatchdogStatus) -> anyhow::Result<()> {
        if self.timeout_minutes <= 0 || !status.online {
            return Ok(());
        }
        let last_active = *self.last_active.get_or_insert(id);
        if id % EVALUATE_EVERY != 0 {
            return Ok(());
        }

        let players = self.console.list().await?;
        if !players.is_empty() {
            self.last_active = Some(id);
            self.stop_sent = false;
            return Ok(());
        }

        let idle_minutes = id.saturating_sub(last_active) / EVALUATE_EVERY;
        if idle_minutes as i64 > self.timeout_minutes && !self.stop_sent {
            tracing::info!(idle_minutes, "no players online; stopping server");
            self.console.stop().await?;
            self.stop_sent = true;
        }
        Ok(())
    }
}
