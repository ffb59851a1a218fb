//! RPC method handlers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::context::AppContext;
use crate::core::{BackupError, BackupStatus, LogFollow};
use crate::core::executor::JobInfo;

use super::protocol::{INVALID_REQUEST, LOGS_FOLLOW, Request, Response};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub simulation: bool,
    pub backup: BackupStatus,
    pub job: Option<JobInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReply {
    pub message: String,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigView {
    pub mount_point_template: String,
    pub target_path_template: String,
    pub rpc_bind: SocketAddr,
}

/// Dispatches JSON-RPC calls against the shared daemon context.
pub struct MethodHandler {
    ctx: AppContext,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id),
            "backup.status" => Response::success(id, self.ctx.executor.status()),
            "backup.start" => self.backup_start(id, params),
            "backup.cancel" => self.backup_cancel(id).await,
            "logs.list" => self.logs_list(id, params),
            LOGS_FOLLOW => Response::error(
                id,
                INVALID_REQUEST,
                "logs.follow needs a request id",
            ),
            "config.get" => self.config_get(id),
            _ => Response::method_not_found(id, &request.method),
        }
    }

    fn daemon_status(&self, id: Value) -> Response {
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.ctx.started_at.elapsed().as_secs(),
                simulation: self.ctx.config.simulation,
                backup: self.ctx.executor.status(),
                job: self.ctx.executor.current_job(),
            },
        )
    }

    /// Returns as soon as the job is reserved; the copy runs in the
    /// background.
    fn backup_start(&self, id: Value, params: Value) -> Response {
        let params: StartParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.ctx.manual.submit(params.source, params.target) {
            Ok(job) => Response::success(
                id,
                StartReply {
                    message: "Backup started".to_string(),
                    job_id: job.job_id.to_string(),
                },
            ),
            Err(e @ BackupError::AlreadyRunning { job_id }) => {
                Response::backup_in_progress(id, job_id, e.to_string())
            }
            Err(e) => Response::internal_error(id, format!("Failed to start backup: {}", e)),
        }
    }

    async fn backup_cancel(&self, id: Value) -> Response {
        if self.ctx.manual.cancel().await {
            Response::success(id, "Backup cancelled")
        } else {
            Response::success(id, "No backup to cancel")
        }
    }

    fn logs_list(&self, id: Value, params: Value) -> Response {
        match since_param(params) {
            Ok(since) => Response::success(id, self.ctx.log.since(since)),
            Err(e) => Response::invalid_params(id, e),
        }
    }

    /// Start following the activity log. On success the caller sends the
    /// reply, then forwards every entry from the returned cursor.
    pub fn follow_logs(&self, request: Request) -> Result<(Response, LogFollow), Response> {
        let id = request.id.unwrap_or(Value::Null);
        let since = since_param(request.params.unwrap_or(Value::Null))
            .map_err(|e| Response::invalid_params(id.clone(), e))?;

        Ok((
            Response::success(id, json!({ "since": since })),
            self.ctx.log.follow(since),
        ))
    }

    fn config_get(&self, id: Value) -> Response {
        let config = &self.ctx.config;
        Response::success(
            id,
            ConfigView {
                mount_point_template: config.mount_point_template.clone(),
                target_path_template: config.target_path_template.clone(),
                rpc_bind: config.rpc_bind,
            },
        )
    }
}

/// `{ "since": n }`, with the whole object or the field optional.
fn since_param(params: Value) -> Result<u64, String> {
    #[derive(Deserialize, Default)]
    struct Params {
        #[serde(default)]
        since: Option<u64>,
    }

    if params.is_null() {
        return Ok(0);
    }
    let params: Params = serde_json::from_value(params).map_err(|e| e.to_string())?;
    Ok(params.since.unwrap_or(0))
}
