//! TCP transport with newline-delimited JSON framing.
//! Each connection is served on its own task. A `logs.follow` request turns
//! its connection into a one-way stream of `logs.entry` notifications.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{LOG_ENTRY, LOGS_FOLLOW, Request, Response};
use crate::core::LogFollow;

pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub async fn bind(addr: SocketAddr, handler: MethodHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        info!(addr = ?self.local_addr().ok(), "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, handler).await {
                                debug!(%peer, error = %e, "Connection error");
                            }
                            debug!(%peer, "Client disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match parse(line, peer) {
            Ok(request) => request,
            Err(reply) => {
                write_message(&mut writer, &reply).await?;
                continue;
            }
        };

        if request.method == LOGS_FOLLOW && !request.is_notification() {
            match handler.follow_logs(request) {
                Ok((reply, follow)) => {
                    write_message(&mut writer, &reply).await?;
                    return stream_log(follow, lines, writer, peer).await;
                }
                Err(reply) => {
                    write_message(&mut writer, &reply).await?;
                    continue;
                }
            }
        }

        if request.is_notification() {
            debug!(%peer, method = %request.method, "Notification received");
            handler.handle(request).await;
            continue;
        }

        let reply = handler.handle(request).await;
        write_message(&mut writer, &reply).await?;
    }

    Ok(())
}

fn parse(line: &str, peer: SocketAddr) -> Result<Request, Response> {
    let request = serde_json::from_str::<Request>(line).map_err(|e| {
        warn!(%peer, error = %e, "Parse error");
        Response::parse_error()
    })?;

    if let Err(msg) = request.validate() {
        warn!(%peer, error = msg, "Invalid request");
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        return Err(Response::invalid_request(id));
    }

    Ok(request)
}

/// Push log entries to the client until it disconnects. Anything else the
/// client sends is ignored.
async fn stream_log(
    mut follow: LogFollow,
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    debug!(%peer, "Streaming activity log");

    loop {
        tokio::select! {
            entry = follow.next() => match entry {
                Some(entry) => {
                    write_message(&mut writer, &Request::notification(LOG_ENTRY, entry)).await?;
                }
                None => return Ok(()),
            },
            line = lines.next_line() => {
                if !matches!(line, Ok(Some(_))) {
                    debug!(%peer, "Log follower went away");
                    return Ok(());
                }
            }
        }
    }
}

async fn write_message(writer: &mut OwnedWriteHalf, message: &impl Serialize) -> anyhow::Result<()> {
    let mut payload = serde_json::to_string(message)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    Ok(())
}
