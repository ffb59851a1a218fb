//! Command and query surface for external callers.
//!
//! JSON-RPC 2.0 over TCP, one request per line.
//!
//! - `protocol`: request/response types
//! - `transport`: TCP listener and framing
//! - `methods`: method dispatch (`backup.start`, `backup.cancel`,
//!   `backup.status`, `logs.list`, `logs.follow`, `config.get`,
//!   `daemon.status`)
//! - `client`: client used by the CLI

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, LogStream, RpcClient};
pub use methods::{ConfigView, DaemonStatus, MethodHandler, StartReply};
pub use protocol::{BACKUP_IN_PROGRESS, LOG_ENTRY, LOGS_FOLLOW, Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listener. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(ctx: AppContext, addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(addr, MethodHandler::new(ctx)).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            transport,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
