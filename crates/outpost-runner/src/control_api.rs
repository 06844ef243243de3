use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use outpost_rpc::types::ConnectionRequest;

use crate::config::GameConfig;

const ERR_AGAIN: i32 = 12;
const MAX_AGAIN_RETRIES: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("control panel asked to retry")]
    Again,
    #[error("control panel returned error code {0}")]
    Remote(i32),
    #[error("malformed control panel response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error_code: i32,
}

fn unwrap_envelope(body: &[u8]) -> Result<Value, ApiError> {
    let env: Envelope = serde_json::from_slice(body).map_err(|e| {
        ApiError::Decode(format!("{e}, body={}", String::from_utf8_lossy(body)))
    })?;
    if env.success {
        return Ok(env.data);
    }
    if env.error_code == ERR_AGAIN {
        return Err(ApiError::Again);
    }
    Err(ApiError::Remote(env.error_code))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    Stop,
    Snapshot,
    Undo,
    Reconfigure,
    ConnectionRequest,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SnapshotConfig {
    pub slot: i32,
}

/// Instruction polled from the control panel.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default)]
    pub actor: i32,
    #[serde(default)]
    pub config: Option<GameConfig>,
    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,
    #[serde(default, rename = "connectionRequestInfo")]
    pub connection_request: Option<ConnectionRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlRequest<'a> {
    world_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlRequest<'a> {
    world_name: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct DownloadUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub url: String,
    pub world_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestWorldId {
    world_id: String,
}

/// Authenticated client for the control panel's runner endpoints.
#[derive(Debug, Clone)]
pub struct ControlApi {
    base: Url,
    auth_key: String,
    http: reqwest::Client,
}

impl ControlApi {
    pub fn new(endpoint: &str, auth_key: &str) -> anyhow::Result<Self> {
        let base = Url::parse(endpoint).with_context(|| format!("parse control panel url {endpoint}"))?;
        let http = reqwest::Client::builder()
            .user_agent("outpost-runner")
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .context("build http client")?;
        Ok(Self {
            base,
            auth_key: auth_key.to_string(),
            http,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<(Vec<u8>, &'static str)>,
    ) -> anyhow::Result<Value> {
        let url = self.base.join(path).with_context(|| format!("build url for {path}"))?;
        let mut req = self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_key);
        if let Some((bytes, content_type)) = body {
            req = req
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes);
        }
        let resp = req.send().await.with_context(|| format!("request {path}"))?;
        let bytes = resp.bytes().await.with_context(|| format!("read {path} response"))?;
        Ok(unwrap_envelope(&bytes)?)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<(Vec<u8>, &'static str)>,
    ) -> anyhow::Result<Value> {
        let mut attempt = 0;
        loop {
            match self.request_once(method.clone(), path, body.clone()).await {
                Err(e)
                    if matches!(e.downcast_ref::<ApiError>(), Some(ApiError::Again))
                        && attempt < MAX_AGAIN_RETRIES =>
                {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                other => return other,
            }
        }
    }

    async fn request_json<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> anyhow::Result<R> {
        let body = match body {
            Some(b) => Some((serde_json::to_vec(b)?, "application/json")),
            None => None,
        };
        let data = self.request(method, path, body).await?;
        serde_json::from_value(data).with_context(|| format!("decode {path} response"))
    }

    /// Posts NUL-separated JSON events.
    pub async fn post_status(&self, batch: Vec<u8>) -> anyhow::Result<()> {
        self.request(Method::POST, "/_/status", Some((batch, "application/octet-stream")))
            .await?;
        Ok(())
    }

    pub async fn poll_action(&self) -> anyhow::Result<Option<Action>> {
        let data = self.request(Method::GET, "/_/poll", None).await?;
        if data.is_null() {
            return Ok(None);
        }
        let action = serde_json::from_value(data).context("decode polled action")?;
        Ok(Some(action))
    }

    pub async fn world_download_url(&self, world_id: &str) -> anyhow::Result<String> {
        let resp: DownloadUrl = self
            .request_json(Method::POST, "/_/world/download-url", Some(&DownloadUrlRequest { world_id }))
            .await?;
        Ok(resp.url)
    }

    pub async fn world_upload_url(&self, world_name: &str) -> anyhow::Result<UploadUrl> {
        self.request_json(Method::POST, "/_/world/upload-url", Some(&UploadUrlRequest { world_name }))
            .await
    }

    pub async fn latest_world_id(&self, world_name: &str) -> anyhow::Result<String> {
        let path = format!("/_/world/latest-id/{world_name}");
        let resp: LatestWorldId = self.request_json::<(), _>(Method::GET, &path, None).await?;
        Ok(resp.world_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_envelope_yields_data() {
        let v = unwrap_envelope(br#"{"success":true,"data":{"worldId":"w.tar.gz"}}"#).unwrap();
        assert_eq!(v["worldId"], "w.tar.gz");
    }

    #[test]
    fn again_code_is_distinguished() {
        let err = unwrap_envelope(br#"{"success":false,"errorCode":12}"#).unwrap_err();
        assert!(matches!(err, ApiError::Again));
        let err = unwrap_envelope(br#"{"success":false,"errorCode":3}"#).unwrap_err();
        assert!(matches!(err, ApiError::Remote(3)));
    }

    #[test]
    fn non_json_body_is_decode_error() {
        let err = unwrap_envelope(b"<html>").unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[test]
    fn actions_decode_with_optional_sections() {
        let a: Action =
            serde_json::from_str(r#"{"type":"snapshot","actor":3,"snapshot":{"slot":2}}"#).unwrap();
        assert_eq!(a.kind, ActionType::Snapshot);
        assert_eq!(a.actor, 3);
        assert_eq!(a.snapshot.unwrap().slot, 2);

        let a: Action = serde_json::from_str(r#"{"type":"reconfigure","config":{"motd":"x"}}"#).unwrap();
        assert_eq!(a.config.unwrap().motd, "x");

        let a: Action = serde_json::from_str(r#"{"type":"dance"}"#).unwrap();
        assert_eq!(a.kind, ActionType::Unknown);
    }

    #[test]
    fn paths_replace_base_path() {
        let api = ControlApi::new("https://panel.example/app/", "k").unwrap();
        let url = api.base.join("/_/poll").unwrap();
        assert_eq!(url.as_str(), "https://panel.example/_/poll");
    }
}
