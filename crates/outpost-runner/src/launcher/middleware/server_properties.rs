use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::env::GAMEDATA_DIR;
use crate::launcher::core::{Handler, LauncherContext, Middleware};

const DEFAULTS: &[(&str, &str)] = &[
    ("allow-flight", "false"),
    ("allow-nether", "true"),
    ("broadcast-console-to-ops", "false"),
    ("broadcast-rcon-to-ops", "false"),
    ("difficulty", "easy"),
    ("enable-command-block", "true"),
    ("enable-jmx-monitoring", "false"),
    ("enable-query", "false"),
    ("enable-rcon", "true"),
    ("enable-status", "true"),
    ("enforce-whitelist", "true"),
    ("entity-broadcast-range-percentage", "100"),
    ("force-gamemode", "false"),
    ("function-permission-level", "2"),
    ("gamemode", "survival"),
    ("hardcore", "false"),
    ("hide-online-players", "false"),
    ("level-name", "world"),
    ("max-players", "20"),
    ("max-tick-time", "60000"),
    ("max-world-size", "29999984"),
    ("motd", ""),
    ("network-compression-threshold", "256"),
    ("online-mode", "true"),
    ("op-permission-level", "4"),
    ("player-idle-timeout", "0"),
    ("prevent-proxy-connections", "false"),
    ("pvp", "true"),
    ("query.port", "32109"),
    ("rate-limit", "0"),
    ("rcon.password", "x"),
    ("rcon.port", "25575"),
    ("require-resource-pack", "false"),
    ("resource-pack", ""),
    ("resource-pack-prompt", ""),
    ("resource-pack-sha1", ""),
    ("server-ip", "127.0.0.1"),
    ("server-port", "32109"),
    ("simulation-distance", "10"),
    ("spawn-animals", "true"),
    ("spawn-monsters", "true"),
    ("spawn-npcs", "true"),
    ("spawn-protection", "0"),
    ("sync-chunk-writes", "true"),
    ("text-filtering-config", ""),
    ("use-native-transport", "true"),
    ("view-distance", "10"),
    ("white-list", "true"),
];

/// Keys the runner depends on; user overrides may not touch them.
const DENIED: &[&str] = &[
    "enable-jmx-monitoring",
    "enable-query",
    "enable-rcon",
    "level-name",
    "rcon.password",
    "rcon.port",
    "server-ip",
    "server-port",
    "white-list",
];

const DIFFICULTIES: &[&str] = &["peaceful", "easy", "normal", "hard"];
const LEVEL_TYPES: &[&str] = &["flat", "largebiomes", "amplified", "default"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("property {0} cannot be overridden")]
    Denied(String),
    #[error("invalid property key {0:?}")]
    InvalidKey(String),
    #[error("unknown {kind} {value:?}")]
    UnknownValue { kind: &'static str, value: String },
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// `server.properties` contents, starting from the runner's defaults.
#[derive(Debug, Clone)]
pub struct ServerProperties {
    props: BTreeMap<String, String>,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            props: DEFAULTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ServerProperties {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), PropertyError> {
        if DENIED.contains(&key) {
            return Err(PropertyError::Denied(key.to_string()));
        }
        if !valid_key(key) {
            return Err(PropertyError::InvalidKey(key.to_string()));
        }
        let value = value.replace('\r', "").replace('\n', " ");
        self.props.insert(key.to_string(), value);
        Ok(())
    }

    pub fn set_motd(&mut self, motd: &str) -> Result<(), PropertyError> {
        self.set("motd", motd)
    }

    pub fn set_difficulty(&mut self, difficulty: &str) -> Result<(), PropertyError> {
        if !DIFFICULTIES.contains(&difficulty) {
            return Err(PropertyError::UnknownValue {
                kind: "difficulty",
                value: difficulty.to_string(),
            });
        }
        self.set("difficulty", difficulty)
    }

    pub fn set_level_type(&mut self, level_type: &str) -> Result<(), PropertyError> {
        if !LEVEL_TYPES.contains(&level_type) {
            return Err(PropertyError::UnknownValue {
                kind: "level type",
                value: level_type.to_string(),
            });
        }
        self.set("level-type", level_type)
    }

    pub fn set_seed(&mut self, seed: &str) -> Result<(), PropertyError> {
        self.set("level-seed", seed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.props {
            out.push_str(k);
            out.push('=');
            out.push_str(&v.replace('\\', "\\\\"));
            out.push('\n');
        }
        out
    }
}

fn log_rejected(what: &str, r: Result<(), PropertyError>) {
    if let Err(e) = r {
        tracing::warn!(property = what, error = %e, "property rejected");
    }
}

pub struct ServerPropertiesMiddleware;

#[async_trait]
impl Middleware for ServerPropertiesMiddleware {
    fn name(&self) -> &'static str {
        "server-properties"
    }

    async fn handle(&self, c: LauncherContext, next: Handler) -> anyhow::Result<()> {
        let s = c.settings.get();
        let mut props = ServerProperties::default();
        log_rejected("motd", props.set_motd(&s.motd));
        if !s.difficulty.is_empty() {
            log_rejected("difficulty", props.set_difficulty(&s.difficulty));
        }
        if !s.level_type.is_empty() {
            log_rejected("level-type", props.set_level_type(&s.level_type));
        }
        if !s.seed.is_empty() {
            log_rejected("level-seed", props.set_seed(&s.seed));
        }
        for (k, v) in &s.property_overrides {
            log_rejected(k, props.set(k, v));
        }

        let path = c.env.data_path(GAMEDATA_DIR).join("server.properties");
        crate::fs_util::write_atomic(&path, props.render().as_bytes()).await?;
        tracing::debug!(path = %path.display(), "server.properties written");
        next(c).await
    }
}
