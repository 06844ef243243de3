use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Watchdog, WatchdogStatus};

pub const DEFAULT_GAME_ADDR: &str = "127.0.0.1:32109";
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// While online, check only every this many ticks.
const ONLINE_SAMPLE_EVERY: u64 = 30;

/// Dials the game port.
pub struct Liveness {
    addr: String,
    prev_online: bool,
}

impl Liveness {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            prev_online: false,
        }
    }

    async fn port_open(&self) -> bool {
        matches!(
            tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl Watchdog for Liveness {
    fn name(&self) -> &'static str {
        "liveness"
    }

    async fn check(&mut self, id: u64, status: &mut WatchdogStatus) -> anyhow::Result<()> {
        if self.prev_online && id % ONLINE_SAMPLE_EVERY != 0 {
            return Ok(());
        }
        let online = self.port_open().await;
        if online != self.prev_online {
            tracing::debug!(addr = %self.addr, online, "game port reachability changed");
        }
        self.prev_online = online;
        if !online {
            status.online = false;
        }
        Ok(())
    }
}
