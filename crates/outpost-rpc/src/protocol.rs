use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: &str = "2.0";

const MAX_HEADER_LINE_BYTES: u64 = 4 * 1024;
const MAX_HEADER_LINES: usize = 32;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const MAX_ERROR_DATA_BYTES: usize = 8 * 1024;

pub mod error_code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Business error raised by a handler.
    pub const SERVER_ERROR: i32 = -32000;
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before a complete message was received")]
    Closed,
    #[error("malformed message framing: {0}")]
    Framing(String),
    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("call timed out")]
    Timeout,
    #[error("remote error {code}: {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl RpcError {
    /// Detail string attached to a remote error, if any.
    pub fn remote_detail(&self) -> Option<String> {
        match self {
            RpcError::Remote { data: Some(Value::String(s)), .. } => Some(s.clone()),
            RpcError::Remote { data: Some(v), .. } => Some(v.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn call(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notify(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notify(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.data = Some(Value::String(truncate_utf8(detail, MAX_ERROR_DATA_BYTES)));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    /// `None` only when the request id could not be recovered.
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: PROTOCOL_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// One framed message as read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub traceparent: Option<String>,
    pub body: Vec<u8>,
}

pub async fn read_packet<R>(r: &mut R) -> Result<Packet, RpcError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut traceparent = None;
    let mut lines = 0usize;

    loop {
        let mut line = String::new();
        let n = (&mut *r)
            .take(MAX_HEADER_LINE_BYTES)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(RpcError::Closed);
        }
        if !line.ends_with('\n') {
            return Err(RpcError::Framing("header line too long or truncated".into()));
        }
        lines += 1;
        if lines > MAX_HEADER_LINES {
            return Err(RpcError::Framing("too many header lines".into()));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(RpcError::Framing(format!("invalid header line: {line}")));
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<usize>()
                .map_err(|_| RpcError::Framing(format!("invalid content length: {value}")))?;
            content_length = Some(len);
        } else if key.eq_ignore_ascii_case("traceparent") {
            traceparent = Some(value.to_string());
        }
    }

    let len = content_length.ok_or_else(|| RpcError::Framing("missing content length".into()))?;
    if len > MAX_BODY_BYTES {
        return Err(RpcError::Framing(format!("body too large: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => RpcError::Closed,
        _ => RpcError::Io(e),
    })?;

    Ok(Packet { traceparent, body })
}

pub async fn write_packet<W>(
    w: &mut W,
    body: &[u8],
    traceparent: Option<&str>,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = format!("Content-Length: {}\r\n", body.len());
    if let Some(tp) = traceparent {
        header.push_str(&format!("Traceparent: {tp}\r\n"));
    }
    header.push_str("\r\n");

    w.write_all(header.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}
