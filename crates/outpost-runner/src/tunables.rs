use std::time::Duration;

const DEFAULT_RESTRICTED_ID: u32 = 1000;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn watchdog_interval() -> Duration {
    Duration::from_millis(
        env_u64("OUTPOST_WATCHDOG_INTERVAL_MS")
            .map(|v| v.clamp(50, 60_000))
            .unwrap_or(1000),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    /// `attempt` is 1-based.
    pub fn delay_ms(self, attempt: u32) -> u64 {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(mult).min(self.max_ms)
    }
}

pub(crate) fn launch_backoff() -> Backoff {
    let base_ms = env_u64("OUTPOST_LAUNCH_BACKOFF_MS")
        .map(|v| v.clamp(10, 60_000))
        .unwrap_or(2000);
    let max_ms = env_u64("OUTPOST_LAUNCH_BACKOFF_MAX_MS")
        .unwrap_or(60_000)
        .clamp(base_ms, 60 * 60 * 1000);
    Backoff { base_ms, max_ms }
}

/// A run that lasted at least this long resets the launch backoff.
pub(crate) fn stable_run_threshold() -> Duration {
    Duration::from_millis(
        env_u64("OUTPOST_STABLE_RUN_MS")
            .map(|v| v.clamp(1000, 60 * 60 * 1000))
            .unwrap_or(60_000),
    )
}

pub(crate) fn status_flush_interval() -> Duration {
    Duration::from_millis(
        env_u64("OUTPOST_STATUS_FLUSH_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1000),
    )
}

pub(crate) fn poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("OUTPOST_POLL_INTERVAL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1000),
    )
}

pub(crate) fn sysstat_interval() -> Duration {
    Duration::from_millis(
        env_u64("OUTPOST_SYSSTAT_INTERVAL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1000),
    )
}

/// TLS name the control panel's tunnel endpoint is issued for.
pub(crate) fn tunnel_server_name() -> String {
    env_string("OUTPOST_TUNNEL_SERVER_NAME")
        .unwrap_or_else(|| "control.fake.premises.kofuk.org".to_string())
}

pub(crate) fn shutdown_grace() -> Duration {
    Duration::from_millis(
        env_u64("OUTPOST_SHUTDOWN_GRACE_MS")
            .map(|v| v.clamp(500, 10 * 60 * 1000))
            .unwrap_or(10_000),
    )
}

pub(crate) fn rcon_retry_window() -> Duration {
    Duration::from_secs(
        env_u64("OUTPOST_RCON_RETRY_WINDOW_SECS")
            .map(|v| v.clamp(1, 24 * 60 * 60))
            .unwrap_or(20 * 60),
    )
}

pub(crate) fn manifest_url() -> String {
    env_string("OUTPOST_MINECRAFT_MANIFEST_URL").unwrap_or_else(|| {
        "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json".to_string()
    })
}

/// uid/gid for children in the restricted privilege class.
pub(crate) fn restricted_ids() -> (u32, u32) {
    let uid = env_u64("OUTPOST_RESTRICTED_USER_UID")
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_RESTRICTED_ID);
    let gid = env_u64("OUTPOST_RESTRICTED_USER_GID")
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(DEFAULT_RESTRICTED_ID);
    (uid, gid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff {
            base_ms: 2000,
            max_ms: 10_000,
        };
        assert_eq!(b.delay_ms(1), 2000);
        assert_eq!(b.delay_ms(2), 4000);
        assert_eq!(b.delay_ms(3), 8000);
        assert_eq!(b.delay_ms(4), 10_000);
        assert_eq!(b.delay_ms(400), 10_000);
    }

    #[test]
    fn backoff_attempt_zero_is_base() {
        let b = Backoff {
            base_ms: 100,
            max_ms: 1000,
        };
        assert_eq!(b.delay_ms(0), 100);
    }
}
