use async_trait::async_trait;
use outpost_rpc::Client;
use outpost_rpc::types::{StateKeyInput, StateSetInput, method};

pub const WORLD_KEY: &str = "WorldKey";
pub const VERSION_KEY: &str = "MinecraftVersion";

/// Durable key-value state kept by the supervisor.
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

pub struct RpcStateRepository {
    client: Client,
}

impl RpcStateRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StateRepository for RpcStateRepository {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value = self
            .client
            .call(method::STATE_GET, StateKeyInput { key: key.to_string() })
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _: String = self
            .client
            .call(
                method::STATE_SAVE,
                StateSetInput {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let _: String = self
            .client
            .call(method::STATE_REMOVE, StateKeyInput { key: key.to_string() })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryState {
        pub entries: Mutex<BTreeMap<String, String>>,
    }

    impl MemoryState {
        pub fn with(entries: &[(&str, &str)]) -> Self {
            Self {
                entries: Mutex::new(
                    entries
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            }
        }

        pub fn value(&self, key: &str) -> Option<String> {
            self.entries.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl StateRepository for MemoryState {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.value(key))
        }

        async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
