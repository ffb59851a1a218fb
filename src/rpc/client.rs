//! Client used by the CLI subcommands to talk to a running daemon.

use std::net::SocketAddr;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::methods::{ConfigView, DaemonStatus, StartReply};
use super::protocol::{LOG_ENTRY, LOGS_FOLLOW, Request, Response, RpcError};
use crate::core::{BackupStatus, LogEntry};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Daemon closed the connection without replying")]
    NoReply,

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

pub struct RpcClient {
    addr: SocketAddr,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Send one request on a fresh connection and decode the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let (result, _) = self.open(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Connect, send `method` and read the reply. The connection stays
    /// usable for whatever the server sends next.
    async fn open(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(Value, Connection), ClientError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        let mut payload = serde_json::to_string(&Request::call(method, params, 1))?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;

        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await?.ok_or(ClientError::NoReply)?;

        let response: Response = serde_json::from_str(&line)?;
        let result = response.into_result().map_err(ClientError::Rpc)?;

        Ok((
            result,
            Connection {
                lines,
                _writer: writer,
            },
        ))
    }

    pub async fn daemon_status(&self) -> Result<DaemonStatus, ClientError> {
        self.call("daemon.status", None).await
    }

    pub async fn backup_status(&self) -> Result<BackupStatus, ClientError> {
        self.call("backup.status", None).await
    }

    /// Relative paths are resolved here, against the caller's working
    /// directory, not the daemon's.
    pub async fn start_backup(
        &self,
        source: &Path,
        target: &Path,
    ) -> Result<StartReply, ClientError> {
        let source = std::path::absolute(source)?;
        let target = std::path::absolute(target)?;
        self.call(
            "backup.start",
            Some(json!({ "source": source, "target": target })),
        )
        .await
    }

    pub async fn cancel_backup(&self) -> Result<String, ClientError> {
        self.call("backup.cancel", None).await
    }

    pub async fn logs(&self, since: u64) -> Result<Vec<LogEntry>, ClientError> {
        self.call("logs.list", Some(json!({ "since": since }))).await
    }

    pub async fn config(&self) -> Result<ConfigView, ClientError> {
        self.call("config.get", None).await
    }

    /// Stream activity log entries from `since` onwards, then live ones.
    pub async fn follow_logs(&self, since: u64) -> Result<LogStream, ClientError> {
        let (_, connection) = self
            .open(LOGS_FOLLOW, Some(json!({ "since": since })))
            .await?;
        Ok(LogStream { connection })
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Dropping the write half would signal EOF and end a stream.
    _writer: OwnedWriteHalf,
}

/// Entries pushed by the daemon after a `logs.follow` request.
pub struct LogStream {
    connection: Connection,
}

impl LogStream {
    /// The next entry, or `None` once the daemon closes the stream.
    pub async fn next(&mut self) -> Result<Option<LogEntry>, ClientError> {
        while let Some(line) = self.connection.lines.next_line().await? {
            let message: Request = serde_json::from_str(&line)?;
            if message.method != LOG_ENTRY {
                continue;
            }
            let entry = serde_json::from_value(message.params.unwrap_or(Value::Null))?;
            return Ok(Some(entry));
        }
        Ok(None)
    }
}
