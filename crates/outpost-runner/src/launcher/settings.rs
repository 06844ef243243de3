use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::config::GameConfig;

const MEMORY_RESERVE_MB: u64 = 1024;
const MIN_MEMORY_MB: u64 = 512;

/// Run configuration as the pipeline sees it. Middlewares refine it on the
/// way in (resolved version, server path, world id).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSettings {
    pub version: String,
    pub prefer_detected: bool,
    pub download_url: String,
    pub manifest_url: Option<String>,
    pub server_path: Option<PathBuf>,
    pub custom_command: Vec<String>,
    pub java_version: u32,
    pub memory_mb: u64,

    pub world_name: String,
    pub world_resource_id: String,
    pub new_world: bool,
    pub seed: String,
    pub level_type: String,
    pub difficulty: String,

    pub motd: String,
    pub property_overrides: BTreeMap<String, String>,
    pub operators: Vec<String>,
    pub whitelist: Vec<String>,
    pub inactive_timeout: i64,
}

impl RunSettings {
    pub fn from_config(game: &GameConfig, memory_mb: u64) -> Self {
        let server = &game.server;
        let world = &game.world;
        Self {
            version: server.version.clone(),
            prefer_detected: server.prefer_detected,
            download_url: server.download_url.clone(),
            manifest_url: Some(server.manifest_override.clone()).filter(|s| !s.is_empty()),
            server_path: None,
            custom_command: server.custom_command.clone(),
            java_version: server.java_version,
            memory_mb,
            world_name: world.name.clone(),
            world_resource_id: world.generation_id.clone(),
            new_world: world.should_generate,
            seed: world.seed.clone(),
            level_type: world.level_type.clone(),
            difficulty: world.difficulty.clone(),
            motd: game.motd.clone(),
            property_overrides: server.server_prop_override.clone(),
            operators: game.operators.clone(),
            whitelist: game.whitelist.clone(),
            inactive_timeout: server.inactive_timeout,
        }
    }

    /// The game's command line: the custom command when set, else the jar
    /// under java.
    pub fn command_line(&self, java: &str) -> anyhow::Result<Vec<String>> {
        if !self.custom_command.is_empty() {
            return Ok(self.custom_command.clone());
        }
        let path = self
            .server_path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no server path resolved"))?;
        Ok(vec![
            java.to_string(),
            format!("-Xmx{}M", self.memory_mb),
            format!("-Xms{}M", self.memory_mb),
            "-jar".to_string(),
            path.to_string_lossy().into_owned(),
            "nogui".to_string(),
        ])
    }
}

/// Shared, mutable view of [`RunSettings`].
#[derive(Debug, Default)]
pub struct Settings {
    inner: RwLock<RunSettings>,
}

impl Settings {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> RunSettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut RunSettings)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|l| l.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

pub fn memory_budget_mb(total_mb: u64) -> u64 {
    total_mb.saturating_sub(MEMORY_RESERVE_MB).max(MIN_MEMORY_MB)
}

/// Heap size for the game: host memory minus a reserve for the OS.
pub fn host_memory_mb() -> u64 {
    let total_mb = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .as_deref()
        .and_then(parse_mem_total_kb)
        .map(|kb| kb / 1024)
        .unwrap_or(0);
    if total_mb == 0 {
        tracing::warn!("cannot read host memory; using minimum heap");
    }
    memory_budget_mb(total_mb)
}

fn pick_java(alternatives: &str, major: u32) -> Option<String> {
    let needle = format!("-{major}-");
    alternatives
        .lines()
        .map(str::trim)
        .find(|l| l.contains(&needle))
        .map(str::to_string)
}

/// Finds a java binary of the requested major version; falls back to
/// `java` on PATH.
pub async fn find_java(major: u32) -> String {
    if major == 0 {
        return "java".to_string();
    }
    let out = tokio::process::Command::new("update-alternatives")
        .args(["--list", "java"])
        .output()
        .await;
    match out {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            match pick_java(&text, major) {
                Some(path) => path,
                None => {
                    tracing::warn!(major, "requested java not installed; using default");
                    "java".to_string()
                }
            }
        }
        Ok(out) => {
            tracing::warn!(status = %out.status, "update-alternatives failed; using default java");
            "java".to_string()
        }
        Err(e) => {
            tracing::warn!(error = %e, "update-alternatives unavailable; using default java");
            "java".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_total_is_parsed() {
        let text = "MemTotal:        8038232 kB\nMemFree:  100 kB\n";
        assert_eq!(parse_mem_total_kb(text), Some(8_038_232));
        assert_eq!(parse_mem_total_kb("nothing here"), None);
    }

    #[test]
    fn memory_budget_keeps_reserve_and_floor() {
        assert_eq!(memory_budget_mb(8192), 7168);
        assert_eq!(memory_budget_mb(1200), 512);
        assert_eq!(memory_budget_mb(0), 512);
    }

    #[test]
    fn java_is_picked_by_major_version() {
        let list = "/usr/lib/jvm/java-17-openjdk-amd64/bin/java\n/usr/lib/jvm/java-21-openjdk-amd64/bin/java\n";
        assert_eq!(
            pick_java(list, 21).as_deref(),
            Some("/usr/lib/jvm/java-21-openjdk-amd64/bin/java")
        );
        assert_eq!(pick_java(list, 8), None);
    }

    #[test]
    fn command_line_prefers_custom_command() {
        let mut s = RunSettings {
            memory_mb: 2048,
            server_path: Some(PathBuf::from("/srv/servers.d/1.20.4.jar")),
            ..Default::default()
        };
        assert_eq!(
            s.command_line("java").unwrap(),
            vec!["java", "-Xmx2048M", "-Xms2048M", "-jar", "/srv/servers.d/1.20.4.jar", "nogui"]
        );

        s.custom_command = vec!["./bedrock_server".into()];
        assert_eq!(s.command_line("java").unwrap(), vec!["./bedrock_server"]);
    }

    #[test]
    fn command_line_needs_a_server() {
        assert!(RunSettings::default().command_line("java").is_err());
    }

    #[test]
    fn config_maps_into_settings() {
        let game: GameConfig = serde_json::from_str(
            r#"{"server":{"name":"1.20.4","preferDetected":true,"inactiveTimeout":15},
                "world":{"name":"survival","generationId":"@/latest","shouldGenerate":false},
                "operators":["op1"]}"#,
        )
        .unwrap();
        let s = RunSettings::from_config(&game, 1024);
        assert_eq!(s.version, "1.20.4");
        assert!(s.prefer_detected);
        assert_eq!(s.world_resource_id, "@/latest");
        assert_eq!(s.inactive_timeout, 15);
        assert_eq!(s.manifest_url, None);
        assert_eq!(s.operators, vec!["op1"]);
    }
}
