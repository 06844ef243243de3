//! The `--connector` role: opens TLS tunnels from the control panel to the
//! game's local port on request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use outpost_rpc::types::{ConnectionRequest, method, role};
use outpost_rpc::{Client, Server};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::env::DataRoot;
use crate::launcher::watchdog::DEFAULT_GAME_ADDR;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Trusts exactly the certificates in `pem`.
fn client_config(pem: &str) -> anyhow::Result<Arc<ClientConfig>> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("parse tunnel certificate")?;
    if certs.is_empty() {
        anyhow::bail!("connection request carries no certificate");
    }
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).context("trust tunnel certificate")?;
    }
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// One tunnel: announces its connection id to the panel endpoint, then
/// pipes bytes between it and the local game port until either side closes.
pub struct Tunnel {
    pub request: ConnectionRequest,
    pub server_name: String,
    pub upstream: String,
}

impl Tunnel {
    /// Returns bytes copied (panel to game, game to panel).
    pub async fn run(&self) -> anyhow::Result<(u64, u64)> {
        let config = client_config(&self.request.server_cert)?;
        let name = ServerName::try_from(self.server_name.clone())
            .with_context(|| format!("invalid tunnel server name {}", self.server_name))?;

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.request.endpoint))
            .await
            .context("connect to tunnel endpoint timed out")?
            .with_context(|| format!("connect {}", self.request.endpoint))?;
        let mut panel = TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .context("tunnel tls handshake")?;
        panel
            .write_all(self.request.connection_id.as_bytes())
            .await
            .context("send connection id")?;

        let mut game = TcpStream::connect(&self.upstream)
            .await
            .with_context(|| format!("connect game at {}", self.upstream))?;
        tokio::io::copy_bidirectional(&mut panel, &mut game)
            .await
            .context("tunnel copy")
    }
}

pub struct ConnectorApi {
    pub server_name: String,
    pub upstream: String,
    pub cancel: CancellationToken,
}

impl ConnectorApi {
    pub fn register(self: Arc<Self>, server: &mut Server) {
        let api = self.clone();
        server.register_notify(method::CONNECTOR_CONNECT, move |request: ConnectionRequest| {
            let tunnel = Tunnel {
                request,
                server_name: api.server_name.clone(),
                upstream: api.upstream.clone(),
            };
            let cancel = api.cancel.clone();
            tracing::info!(id = %tunnel.request.connection_id, endpoint = %tunnel.request.endpoint, "opening tunnel");
            tokio::spawn(async move {
                let id = tunnel.request.connection_id.clone();
                tokio::select! {
                    res = tunnel.run() => match res {
                        Ok((up, down)) => tracing::info!(%id, up, down, "tunnel closed"),
                        Err(e) => tracing::warn!(%id, error = %outpost_rpc::format_error_chain(&e), "tunnel failed"),
                    },
                    _ = cancel.cancelled() => tracing::debug!(%id, "tunnel dropped on shutdown"),
                }
            });
            async { Ok(()) }
        });

        let cancel = self.cancel.clone();
        server.register_notify(method::BASE_STOP, move |_: Value| {
            tracing::info!("stop requested by supervisor");
            cancel.cancel();
            async { Ok(()) }
        });
    }
}

pub async fn run(data: DataRoot) -> anyhow::Result<i32> {
    let cancel = CancellationToken::new();
    let api = Arc::new(ConnectorApi {
        server_name: crate::tunables::tunnel_server_name(),
        upstream: DEFAULT_GAME_ADDR.to_string(),
        cancel: cancel.clone(),
    });
    let mut server = Server::new(data.endpoint(role::CONNECTOR));
    api.register(&mut server);
    let rpc = tokio::spawn(
        server
            .bind()
            .context("bind connector endpoint")?
            .serve(cancel.clone()),
    );

    let supervisor = Client::new(data.endpoint(role::SUPERVISOR));
    if let Err(e) = supervisor
        .notify(method::PROC_REGISTER_STOP_HOOK, role::CONNECTOR)
        .await
    {
        tracing::warn!(error = %e, "could not register stop hook");
    }
    tokio::spawn(crate::supervisor::wait_for_signal(cancel.clone()));

    cancel.cancelled().await;
    let _ = rpc.await;
    tracing::info!("connector stopped");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::ServerConfig;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    const NAME: &str = "tunnel.outpost.test";

    struct Panel {
        addr: String,
        cert_pem: String,
        acceptor: TlsAcceptor,
        listener: TcpListener,
    }

    async fn panel() -> Panel {
        let certified = rcgen::generate_simple_self_signed(vec![NAME.to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![certified.cert.der().clone()], key)
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Panel {
            addr: listener.local_addr().unwrap().to_string(),
            cert_pem: certified.cert.pem(),
            acceptor: TlsAcceptor::from(Arc::new(config)),
            listener,
        }
    }

    /// Echoes every byte back, like a game that answers pings.
    async fn echo_game() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// Accepts one tunnel, checks its id, and round-trips `payload`.
    async fn expect_tunnel(p: Panel, id: &'static str, payload: &'static [u8]) {
        let (tcp, _) = p.listener.accept().await.unwrap();
        let mut tls = p.acceptor.accept(tcp).await.unwrap();
        let mut got = vec![0u8; id.len()];
        tls.read_exact(&mut got).await.unwrap();
        assert_eq!(got, id.as_bytes());

        tls.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        tls.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        tls.shutdown().await.unwrap();
        // Stay open until the tunnel closes its side too.
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
    }

    #[tokio::test]
    async fn tunnel_announces_id_and_pipes_to_game() {
        let p = panel().await;
        let tunnel = Tunnel {
            request: ConnectionRequest {
                connection_id: "conn-42".into(),
                endpoint: p.addr.clone(),
                server_cert: p.cert_pem.clone(),
            },
            server_name: NAME.into(),
            upstream: echo_game().await,
        };
        let panel_side = tokio::spawn(expect_tunnel(p, "conn-42", b"ping"));

        let (up, down) = tokio::time::timeout(Duration::from_secs(10), tunnel.run())
            .await
            .unwrap()
            .unwrap();
        panel_side.await.unwrap();
        assert_eq!((up, down), (4, 4));
    }

    #[tokio::test]
    async fn untrusted_panel_certificate_is_refused() {
        let p = panel().await;
        let other = rcgen::generate_simple_self_signed(vec![NAME.to_string()]).unwrap();
        let tunnel = Tunnel {
            request: ConnectionRequest {
                connection_id: "conn-1".into(),
                endpoint: p.addr.clone(),
                server_cert: other.cert.pem(),
            },
            server_name: NAME.into(),
            upstream: echo_game().await,
        };
        tokio::spawn(async move {
            if let Ok((tcp, _)) = p.listener.accept().await {
                let _ = p.acceptor.accept(tcp).await;
            }
        });
        let err = tunnel.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("handshake"), "{err:#}");
    }

    #[test]
    fn request_without_certificate_is_rejected() {
        assert!(client_config("").is_err());
        assert!(client_config("not a pem").is_err());
    }

    #[tokio::test]
    async fn connect_notify_opens_tunnel_and_base_stop_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataRoot::new(dir.path());
        let p = panel().await;
        let request = ConnectionRequest {
            connection_id: "conn-7".into(),
            endpoint: p.addr.clone(),
            server_cert: p.cert_pem.clone(),
        };
        let panel_side = tokio::spawn(expect_tunnel(p, "conn-7", b"hello"));

        let cancel = CancellationToken::new();
        let api = Arc::new(ConnectorApi {
            server_name: NAME.into(),
            upstream: echo_game().await,
            cancel: cancel.clone(),
        });
        let mut server = Server::new(data.endpoint(role::CONNECTOR));
        api.register(&mut server);
        tokio::spawn(server.bind().unwrap().serve(cancel.clone()));

        let client = Client::new(data.endpoint(role::CONNECTOR)).with_timeout(Duration::from_secs(5));
        client.notify(method::CONNECTOR_CONNECT, &request).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), panel_side)
            .await
            .unwrap()
            .unwrap();

        client.notify(method::BASE_STOP, Value::Null).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
    }
}
