use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Document issued by the control panel, stored as `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    pub auth_key: String,
    pub control_panel: String,
    pub game_config: GameConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub server: ServerConfig,
    pub world: WorldConfig,
    pub motd: String,
    pub operators: Vec<String>,
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub prefer_detected: bool,
    #[serde(rename = "name")]
    pub version: String,
    pub download_url: String,
    pub manifest_override: String,
    pub custom_command: Vec<String>,
    pub server_prop_override: BTreeMap<String, String>,
    pub java_version: u32,
    /// Minutes without players before the server is stopped; `<= 0` disables.
    pub inactive_timeout: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorldConfig {
    pub should_generate: bool,
    pub name: String,
    pub generation_id: String,
    pub seed: String,
    pub level_type: String,
    pub difficulty: String,
}

pub fn load(path: &Path) -> anyhow::Result<RunnerConfig> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))
}

/// Replaces the game section of the stored document, keeping credentials.
pub async fn save_game_config(path: &Path, game: &GameConfig) -> anyhow::Result<()> {
    let mut cfg = match tokio::fs::read(path).await {
        Ok(data) => serde_json::from_slice::<RunnerConfig>(&data)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RunnerConfig::default(),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    cfg.game_config = game.clone();

    let data = serde_json::to_vec_pretty(&cfg).context("serialize config")?;
    crate::fs_util::write_atomic(path, &data).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "authKey": "secret",
        "controlPanel": "https://panel.example",
        "gameConfig": {
            "server": {
                "preferDetected": true,
                "name": "1.20.4",
                "customCommand": ["./run.sh"],
                "serverPropOverride": {"pvp": "false"},
                "javaVersion": 17,
                "inactiveTimeout": 30
            },
            "world": {"shouldGenerate": false, "name": "survival", "generationId": "@/latest", "difficulty": "hard"},
            "motd": "hi",
            "operators": ["alice"],
            "whitelist": ["alice", "bob"],
            "futureField": 1
        }
    }"#;

    #[test]
    fn parses_control_panel_document() {
        let cfg: RunnerConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.auth_key, "secret");
        let server = &cfg.game_config.server;
        assert!(server.prefer_detected);
        assert_eq!(server.version, "1.20.4");
        assert_eq!(server.custom_command, vec!["./run.sh".to_string()]);
        assert_eq!(server.server_prop_override.get("pvp").map(String::as_str), Some("false"));
        assert_eq!(server.inactive_timeout, 30);
        assert_eq!(cfg.game_config.world.generation_id, "@/latest");
        assert_eq!(cfg.game_config.whitelist.len(), 2);
        // Absent fields default.
        assert_eq!(cfg.game_config.world.seed, "");
        assert_eq!(server.download_url, "");
    }

    #[tokio::test]
    async fn save_game_config_keeps_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut game = load(&path).unwrap().game_config;
        game.motd = "changed".to_string();
        save_game_config(&path, &game).await.unwrap();

        let reloaded = load(&path).unwrap();
        assert_eq!(reloaded.auth_key, "secret");
        assert_eq!(reloaded.game_config.motd, "changed");
    }
}
