use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::protocol::{
    ErrorObject, PROTOCOL_VERSION, Request, Response, RpcError, error_code, format_error_chain,
    read_packet, write_packet,
};

enum HandlerError {
    InvalidParams(String),
    Failed(anyhow::Error),
}

type CallHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;
type NotifyHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Dispatcher {
    methods: HashMap<String, CallHandler>,
    notifies: HashMap<String, NotifyHandler>,
}

impl Dispatcher {
    /// Returns the response to write back, or `None` for notifies.
    async fn dispatch(&self, req: Request) -> Option<Response> {
        if req.jsonrpc != PROTOCOL_VERSION {
            return match req.id {
                Some(id) => Some(Response::err(
                    Some(id),
                    ErrorObject::new(error_code::INVALID_REQUEST, "Invalid Request")
                        .with_detail(&format!("unsupported protocol version: {}", req.jsonrpc)),
                )),
                None => {
                    tracing::warn!(method = %req.method, version = %req.jsonrpc, "dropping notify with unsupported protocol version");
                    None
                }
            };
        }

        let Some(id) = req.id else {
            match self.notifies.get(&req.method) {
                Some(handler) => {
                    if let Err(e) = handler(req.params).await {
                        tracing::warn!(method = %req.method, error = %format_error_chain(&e), "notify handler failed");
                    }
                }
                None => tracing::warn!(method = %req.method, "unknown notify method"),
            }
            return None;
        };

        let Some(handler) = self.methods.get(&req.method) else {
            return Some(Response::err(
                Some(id),
                ErrorObject::new(error_code::METHOD_NOT_FOUND, "Method not found")
                    .with_detail(&req.method),
            ));
        };

        let resp = match handler(req.params).await {
            Ok(result) => Response::ok(id, result),
            Err(HandlerError::InvalidParams(detail)) => Response::err(
                Some(id),
                ErrorObject::new(error_code::INVALID_PARAMS, "Invalid params").with_detail(&detail),
            ),
            Err(HandlerError::Failed(e)) => {
                let detail = format_error_chain(&e);
                tracing::debug!(method = %req.method, error = %detail, "call handler failed");
                Response::err(
                    Some(id),
                    ErrorObject::new(error_code::SERVER_ERROR, "Server error").with_detail(&detail),
                )
            }
        };
        Some(resp)
    }
}

/// Dispatch table for one daemon role. Register handlers, then bind.
pub struct Server {
    endpoint: PathBuf,
    dispatcher: Dispatcher,
}

impl Server {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            dispatcher: Dispatcher::default(),
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn register_method<P, R, F, Fut>(&mut self, name: &str, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |params: Value| -> BoxFuture<'static, Result<Value, HandlerError>> {
            let parsed = match serde_json::from_value::<P>(params) {
                Ok(p) => p,
                Err(e) => {
                    let detail = e.to_string();
                    return Box::pin(async move { Err(HandlerError::InvalidParams(detail)) });
                }
            };
            let fut = f(parsed);
            Box::pin(async move {
                let out = fut.await.map_err(HandlerError::Failed)?;
                serde_json::to_value(out).map_err(|e| HandlerError::Failed(e.into()))
            })
        });
        self.dispatcher.methods.insert(name.to_string(), handler);
    }

    pub fn register_notify<P, F, Fut>(&mut self, name: &str, f: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: NotifyHandler = Arc::new(move |params: Value| -> BoxFuture<'static, anyhow::Result<()>> {
            let parsed = match serde_json::from_value::<P>(params) {
                Ok(p) => p,
                Err(e) => {
                    let err = anyhow::Error::new(e).context("decode notify params");
                    return Box::pin(async move { Err(err) });
                }
            };
            Box::pin(f(parsed))
        });
        self.dispatcher.notifies.insert(name.to_string(), handler);
    }

    /// Removes a stale socket, binds, and opens the socket to every local user.
    pub fn bind(self) -> Result<BoundServer, RpcError> {
        if let Some(parent) = self.endpoint.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&self.endpoint) {
            Ok(()) => tracing::debug!(endpoint = %self.endpoint.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.endpoint)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.endpoint)?.permissions();
            perms.set_mode(0o666);
            std::fs::set_permissions(&self.endpoint, perms)?;
        }

        tracing::info!(endpoint = %self.endpoint.display(), "rpc listening");
        Ok(BoundServer {
            endpoint: self.endpoint,
            listener,
            dispatcher: Arc::new(self.dispatcher),
        })
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<(), RpcError> {
        self.bind()?.serve(cancel).await;
        Ok(())
    }
}

pub struct BoundServer {
    endpoint: PathBuf,
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
}

impl BoundServer {
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Accepts until cancelled. Connection failures never end the loop.
    pub async fn serve(self, cancel: CancellationToken) {
        let mut conn_seq: u64 = 0;
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _)) => {
                    conn_seq += 1;
                    let dispatcher = self.dispatcher.clone();
                    let span = tracing::debug_span!("rpc_conn", conn = conn_seq, traceparent = tracing::field::Empty);
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_connection(&dispatcher, stream).await {
                                tracing::warn!(error = %e, "rpc connection failed");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.endpoint)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(endpoint = %self.endpoint.display(), error = %e, "remove socket on shutdown");
        }
        tracing::debug!(endpoint = %self.endpoint.display(), "rpc listener stopped");
    }
}

async fn handle_connection<S>(dispatcher: &Dispatcher, stream: S) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, mut wr) = tokio::io::split(stream);
    let mut rd = BufReader::new(rd);

    let packet = match read_packet(&mut rd).await {
        Ok(p) => p,
        Err(RpcError::Closed) => return Ok(()),
        Err(e @ RpcError::Framing(_)) => {
            let resp = Response::err(
                None,
                ErrorObject::new(error_code::PARSE_ERROR, "Parse error").with_detail(&e.to_string()),
            );
            write_response(&mut wr, &resp).await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if let Some(tp) = packet.traceparent.as_deref() {
        tracing::Span::current().record("traceparent", tp);
    }

    let value: Value = match serde_json::from_slice(&packet.body) {
        Ok(v) => v,
        Err(e) => {
            let resp = Response::err(
                None,
                ErrorObject::new(error_code::PARSE_ERROR, "Parse error").with_detail(&e.to_string()),
            );
            write_response(&mut wr, &resp).await?;
            return Err(e.into());
        }
    };

    let raw_id = value.get("id").and_then(Value::as_u64);
    let has_id = value.get("id").is_some_and(|v| !v.is_null());
    let req: Request = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) if has_id => {
            let resp = Response::err(
                raw_id,
                ErrorObject::new(error_code::INVALID_REQUEST, "Invalid Request")
                    .with_detail(&e.to_string()),
            );
            write_response(&mut wr, &resp).await?;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed notify");
            return Ok(());
        }
    };

    tracing::debug!(method = %req.method, notify = req.is_notify(), "rpc request");
    if let Some(resp) = dispatcher.dispatch(req).await {
        write_response(&mut wr, &resp).await?;
    }
    Ok(())
}

async fn write_response<W>(w: &mut W, resp: &Response) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(resp)?;
    write_packet(w, &body, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(serde::Deserialize)]
    struct Echo {
        text: String,
    }

    fn dispatcher_with(counter: Arc<AtomicUsize>) -> Dispatcher {
        let mut server = Server::new("/unused");
        server.register_method("echo", |p: Echo| async move { Ok(p.text) });
        server.register_method("fail", |_: Value| async move {
            Err::<(), _>(anyhow::anyhow!("boom").context("while failing"))
        });
        let c = counter.clone();
        server.register_notify("bump", move |_: Value| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        server.dispatcher
    }

    /// Writes raw bytes as the client, then returns everything the server wrote.
    async fn exchange_raw(dispatcher: &Dispatcher, input: &[u8]) -> Vec<u8> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(input).await.unwrap();
        let _ = handle_connection(dispatcher, server).await;
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    async fn decode(out: &[u8]) -> Response {
        let mut r = BufReader::new(out);
        let p = read_packet(&mut r).await.unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "more than one response written");
        serde_json::from_slice(&p.body).unwrap()
    }

    #[tokio::test]
    async fn call_gets_exactly_one_matching_response() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(
            &d,
            &frame(r#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"text":"hi"}}"#),
        )
        .await;
        let resp = decode(&out).await;
        assert_eq!(resp.id, Some(7));
        assert_eq!(resp.result, Some(Value::String("hi".into())));
    }

    #[tokio::test]
    async fn notify_never_writes_a_response() {
        let counter = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(counter.clone());
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"2.0","method":"bump","params":null}"#)).await;
        assert!(out.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_notify_is_dropped_silently() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"2.0","method":"nope"}"#)).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn unknown_call_is_method_not_found() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"2.0","id":1,"method":"nope"}"#)).await;
        let resp = decode(&out).await;
        assert_eq!(resp.error.unwrap().code, error_code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn version_mismatch_is_invalid_request_for_calls_only() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"1.0","id":3,"method":"echo","params":{"text":"x"}}"#)).await;
        let resp = decode(&out).await;
        assert_eq!(resp.id, Some(3));
        assert_eq!(resp.error.unwrap().code, error_code::INVALID_REQUEST);

        let counter = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(counter.clone());
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"1.0","method":"bump"}"#)).await;
        assert!(out.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bad_params_are_invalid_params() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"nope":1}}"#)).await;
        let resp = decode(&out).await;
        assert_eq!(resp.error.unwrap().code, error_code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn handler_error_carries_chain_as_detail() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(&d, &frame(r#"{"jsonrpc":"2.0","id":1,"method":"fail"}"#)).await;
        let err = decode(&out).await.error.unwrap();
        assert_eq!(err.code, error_code::SERVER_ERROR);
        assert_eq!(err.message, "Server error");
        assert_eq!(err.data, Some(Value::String("while failing: boom".into())));
    }

    #[tokio::test]
    async fn garbage_body_is_parse_error() {
        let d = dispatcher_with(Arc::new(AtomicUsize::new(0)));
        let out = exchange_raw(&d, &frame("{not json")).await;
        let resp = decode(&out).await;
        assert_eq!(resp.id, None);
        assert_eq!(resp.error.unwrap().code, error_code::PARSE_ERROR);
    }

    #[tokio::test]
    async fn unix_socket_round_trip_and_listener_survives_bad_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc@test");
        // A stale file at the endpoint must not prevent binding.
        std::fs::write(&path, b"stale").unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let server = Server {
            endpoint: path.clone(),
            dispatcher: dispatcher_with(counter.clone()),
        };
        let bound = server.bind().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bound.serve(cancel.clone()));

        // Garbage connection first.
        {
            let mut s = tokio::net::UnixStream::connect(&path).await.unwrap();
            s.write_all(b"nonsense\r\n\r\n").await.unwrap();
        }

        let client = Client::new(&path);
        let got: String = client
            .call("echo", serde_json::json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(got, "hello");

        client.notify("bump", Value::Null).await.unwrap();
        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let err = client.call::<_, Value>("missing", Value::Null).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: error_code::METHOD_NOT_FOUND, .. }));

        cancel.cancel();
        task.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn call_to_missing_endpoint_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(dir.path().join("rpc@nobody"));
        let err = client.call::<_, Value>("echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }
}
