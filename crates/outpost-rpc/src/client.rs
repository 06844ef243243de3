use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{Request, Response, RpcError, read_packet, write_packet};
use crate::trace;

/// Every connection carries a single request, so a fixed id is enough.
const CALL_ID: u64 = 1;

/// Handle to one daemon's endpoint. Cheap to clone; each call dials anew.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: PathBuf,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Sends a request and waits for its single response.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = match self.timeout {
            Some(t) => tokio::time::timeout(t, self.exchange(method, params))
                .await
                .map_err(|_| RpcError::Timeout)??,
            None => self.exchange(method, params).await?,
        };
        Ok(serde_json::from_value(result)?)
    }

    /// Fire-and-forget. Never reads from the connection.
    pub async fn notify<P>(&self, method: &str, params: P) -> Result<(), RpcError>
    where
        P: Serialize,
    {
        let req = Request::notify(method, serde_json::to_value(params)?);
        let body = serde_json::to_vec(&req)?;

        let mut stream = UnixStream::connect(&self.endpoint).await?;
        write_packet(&mut stream, &body, trace::current()).await?;
        stream.shutdown().await.ok();
        Ok(())
    }

    async fn exchange(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let req = Request::call(CALL_ID, method, params);
        let body = serde_json::to_vec(&req)?;

        let stream = UnixStream::connect(&self.endpoint).await?;
        let (rd, mut wr) = stream.into_split();
        write_packet(&mut wr, &body, trace::current()).await?;

        let mut rd = BufReader::new(rd);
        let packet = read_packet(&mut rd).await?;
        let resp: Response = serde_json::from_slice(&packet.body)?;

        if resp.id != Some(CALL_ID) {
            return Err(RpcError::Protocol(format!(
                "response id mismatch: expected {CALL_ID}, got {:?}",
                resp.id
            )));
        }
        if let Some(err) = resp.error {
            return Err(RpcError::Remote {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}
