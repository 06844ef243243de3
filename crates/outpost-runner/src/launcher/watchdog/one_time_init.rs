use std::sync::Arc;

use async_trait::async_trait;
use outpost_rpc::types::Event;

use super::{Watchdog, WatchdogStatus};
use crate::events::EventSink;
use crate::launcher::rcon::Console;

/// First-online work for a run: operators, whitelist and the `started`
/// event. Fires once.
pub struct OneTimeInit {
    console: Console,
    events: Arc<dyn EventSink>,
    server_version: String,
    world_name: String,
    operators: Vec<String>,
    whitelist: Vec<String>,
    fired: bool,
}

impl OneTimeInit {
    pub fn new(
        console: Console,
        events: Arc<dyn EventSink>,
        server_version: String,
        world_name: String,
        operators: Vec<String>,
        whitelist: Vec<String>,
    ) -> Self {
        Self {
            console,
            events,
            server_version,
            world_name,
            operators,
            whitelist,
            fired: false,
        }
    }
}

#[async_trait]
impl Watchdog for OneTimeInit {
    fn name(&self) -> &'static str {
        "one-time-init"
    }

    async fn check(&mut self, _id: u64, status: &mut WatchdogStatus) -> anyhow::Result<()> {
        if self.fired || !status.online {
            return Ok(());
        }
        self.fired = true;

        for user in &self.operators {
            if let Err(e) = self.console.op(user).await {
                tracing::warn!(user = %user, error = %e, "op failed");
            }
        }
        for user in &self.whitelist {
            if let Err(e) = self.console.whitelist_add(user).await {
                tracing::warn!(user = %user, error = %e, "whitelist add failed");
            }
        }
        let seed = match self.console.seed().await {
            Ok(seed) => seed,
            Err(e) => {
                tracing::warn!(error = %e, "could not read world seed");
                String::new()
            }
        };

        tracing::info!(version = %self.server_version, world = %self.world_name, "server started");
        self.events
            .send(Event::started(&self.server_version, &self.world_name, &seed))
            .await;
        Ok(())
    }
}
