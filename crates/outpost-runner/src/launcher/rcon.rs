use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub const DEFAULT_ADDR: &str = "127.0.0.1:25575";
pub const DEFAULT_PASSWORD: &str = "x";

const TYPE_RESPONSE: i32 = 0;
const TYPE_COMMAND: i32 = 2;
const TYPE_AUTH_RESPONSE: i32 = 2;
const TYPE_LOGIN: i32 = 3;
const MAX_PACKET: usize = 4096 + 14;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Runs one console command and returns its output.
#[async_trait]
pub trait RconExecutor: Send + Sync {
    async fn exec(&self, command: &str) -> anyhow::Result<String>;
}

pub fn encode_packet(id: i32, kind: i32, body: &str) -> Vec<u8> {
    let len = 4 + 4 + body.len() + 2;
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as i32).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

pub async fn read_packet<R>(r: &mut R) -> anyhow::Result<(i32, i32, String)>
where
    R: AsyncReadExt + Unpin,
{
    let len = r.read_i32_le().await.context("read rcon packet length")?;
    let len = usize::try_from(len).map_err(|_| anyhow::anyhow!("negative rcon packet length"))?;
    if !(10..=MAX_PACKET).contains(&len) {
        anyhow::bail!("rcon packet length {len} out of range");
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.context("read rcon packet")?;
    let id = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body = String::from_utf8_lossy(&buf[8..len - 2]).into_owned();
    Ok((id, kind, body))
}

/// Source RCON client. Commands are serialized; a broken connection is
/// dropped and re-established on the next command.
pub struct RconClient {
    addr: String,
    password: String,
    retry_window: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl RconClient {
    pub fn new(addr: impl Into<String>, password: impl Into<String>, retry_window: Duration) -> Self {
        Self {
            addr: addr.into(),
            password: password.into(),
            retry_window,
            conn: Mutex::new(None),
        }
    }

    async fn login(&self) -> anyhow::Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect rcon {}", self.addr))?;
        stream
            .write_all(&encode_packet(1, TYPE_LOGIN, &self.password))
            .await
            .context("send rcon login")?;
        loop {
            let (id, kind, _) = read_packet(&mut stream).await?;
            if kind != TYPE_AUTH_RESPONSE {
                // Some servers send an empty response ahead of the auth reply.
                continue;
            }
            if id == -1 {
                anyhow::bail!("rcon authentication rejected");
            }
            return Ok(stream);
        }
    }

    async fn connect_with_retry(&self) -> anyhow::Result<TcpStream> {
        let deadline = tokio::time::Instant::now() + self.retry_window;
        let mut delay = Duration::from_secs(1);
        loop {
            match self.login().await {
                Ok(stream) => return Ok(stream),
                Err(e) if tokio::time::Instant::now() + delay < deadline => {
                    tracing::debug!(error = %e, delay_ms = delay.as_millis() as u64, "rcon not ready");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
                Err(e) => return Err(e.context("rcon retry window exhausted")),
            }
        }
    }
}

#[async_trait]
impl RconExecutor for RconClient {
    async fn exec(&self, command: &str) -> anyhow::Result<String> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.connect_with_retry().await?);
        }
        let Some(stream) = conn.as_mut() else {
            anyhow::bail!("rcon connection unavailable");
        };

        let result: anyhow::Result<String> = async {
            stream
                .write_all(&encode_packet(2, TYPE_COMMAND, command))
                .await
                .context("send rcon command")?;
            loop {
                let (id, kind, body) = read_packet(stream).await?;
                if id == 2 && kind == TYPE_RESPONSE {
                    return Ok(body);
                }
            }
        }
        .await;

        if result.is_err() {
            *conn = None;
        }
        result
    }
}

/// Typed console commands on top of an [`RconExecutor`].
#[derive(Clone)]
pub struct Console {
    exec: Arc<dyn RconExecutor>,
}

impl Console {
    pub fn new(exec: Arc<dyn RconExecutor>) -> Self {
        Self { exec }
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.exec.exec("stop").await.map(|_| ())
    }

    pub async fn save_all(&self) -> anyhow::Result<()> {
        self.exec.exec("save-all").await.map(|_| ())
    }

    pub async fn op(&self, user: &str) -> anyhow::Result<()> {
        self.exec.exec(&format!("op {user}")).await.map(|_| ())
    }

    pub async fn whitelist_add(&self, user: &str) -> anyhow::Result<()> {
        self.exec.exec(&format!("whitelist add {user}")).await.map(|_| ())
    }

    pub async fn seed(&self) -> anyhow::Result<String> {
        let out = self.exec.exec("seed").await?;
        parse_seed(&out)
    }

    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let out = self.exec.exec("list").await?;
        parse_list(&out)
    }
}

pub fn parse_seed(out: &str) -> anyhow::Result<String> {
    out.trim()
        .strip_prefix("Seed: [")
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("unexpected seed output: {out}"))
}

fn list_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^There are ([0-9]+) of a max of ([0-9]+) players online: (.*)$").ok())
        .as_ref()
}

pub fn parse_list(out: &str) -> anyhow::Result<Vec<String>> {
    let re = list_re().ok_or_else(|| anyhow::anyhow!("list pattern failed to compile"))?;
    let caps = re
        .captures(out.trim_end_matches(['\r', '\n']))
        .ok_or_else(|| anyhow::anyhow!("unexpected list output: {out}"))?;
    let count: usize = caps[1].parse().context("parse player count")?;
    let players: Vec<String> = caps[3]
        .split(", ")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if players.len() != count {
        anyhow::bail!("player count {count} does not match names {players:?}");
    }
    Ok(players)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn list_output_is_parsed() {
        assert_eq!(
            parse_list("There are 2 of a max of 20 players online: alice, bob").unwrap(),
            vec!["alice", "bob"]
        );
        assert!(parse_list("There are 0 of a max of 20 players online: ").unwrap().is_empty());
        assert!(parse_list("There are 3 of a max of 20 players online: alice").is_err());
        assert!(parse_list("Unknown command").is_err());
    }

    #[test]
    fn seed_output_is_parsed() {
        assert_eq!(parse_seed("Seed: [-4172144997902289642]").unwrap(), "-4172144997902289642");
        assert!(parse_seed("Seed: 12").is_err());
    }

    #[test]
    fn packets_are_little_endian_and_nul_terminated() {
        let p = encode_packet(7, TYPE_COMMAND, "list");
        assert_eq!(&p[0..4], &14i32.to_le_bytes());
        assert_eq!(&p[4..8], &7i32.to_le_bytes());
        assert_eq!(&p[8..12], &2i32.to_le_bytes());
        assert_eq!(&p[12..16], b"list");
        assert_eq!(&p[16..], &[0, 0]);
    }

    async fn fake_server(listener: TcpListener, password: &'static str) {
        let (mut s, _) = listener.accept().await.unwrap();
        let (id, kind, body) = read_packet(&mut s).await.unwrap();
        assert_eq!(kind, TYPE_LOGIN);
        let reply_id = if body == password { id } else { -1 };
        s.write_all(&encode_packet(reply_id, TYPE_RESPONSE, "")).await.unwrap();
        s.write_all(&encode_packet(reply_id, TYPE_AUTH_RESPONSE, "")).await.unwrap();
        if reply_id == -1 {
            return;
        }
        while let Ok((id, _, body)) = read_packet(&mut s).await {
            let out = format!("ran {body}");
            s.write_all(&encode_packet(id, TYPE_RESPONSE, &out)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn client_logs_in_and_runs_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_server(listener, "x"));

        let client = RconClient::new(addr, "x", Duration::from_secs(1));
        assert_eq!(client.exec("list").await.unwrap(), "ran list");
        assert_eq!(client.exec("seed").await.unwrap(), "ran seed");
    }

    #[tokio::test]
    async fn rejected_password_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_server(listener, "secret"));

        let client = RconClient::new(addr, "wrong", Duration::from_millis(10));
        let err = client.exec("list").await.unwrap_err();
        assert!(format!("{err:#}").contains("rejected"));
    }
}
