//! HTTP/JSON 接口
//!
//! 所有集群接口需要 `Authorization: Bearer <token>`,令牌权限按集群划分:
//! - **read**: 集群列表、状态、拓扑视图
//! - **write**: switchover / failover / 维护模式
//! - **arbitration**: 心跳(对端也可以用 `X-Arbitration-Secret` 头访问)
//!
//! `is-master` / `is-slave` 与 `/api/prometheus` 无需认证,供负载均衡器和监控系统探测。
//! 动作类接口把调用方是否具备写权限交给集群的动作闸门判断。

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

use repman_cluster::arbitrator::SECRET_HEADER;
use repman_cluster::{
    Cluster, ClusterError, FailoverError, FailoverErrorKind, FailoverReport, GateRejection,
    ServerState, Supervisor,
};

use crate::auth::{Caller, Permission, TokenRegistry};

/// 路由共享状态
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    pub tokens: Arc<TokenRegistry>,
}

/// 接口错误
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    Cluster(ClusterError),
    Failover(FailoverError),
}

impl From<ClusterError> for ApiError {
    fn from(e: ClusterError) -> Self {
        ApiError::Cluster(e)
    }
}

/// 故障转移错误对应的 HTTP 状态
pub fn failover_status(kind: &FailoverErrorKind) -> StatusCode {
    match kind {
        FailoverErrorKind::AlreadyInProgress
        | FailoverErrorKind::InMaintenance
        | FailoverErrorKind::SplitBrain(_) => StatusCode::CONFLICT,
        FailoverErrorKind::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        FailoverErrorKind::NotPermitted(_) => StatusCode::FORBIDDEN,
        FailoverErrorKind::NoPrimary
        | FailoverErrorKind::PrimaryNotHealthy(_)
        | FailoverErrorKind::PrimaryNotFailed(_)
        | FailoverErrorKind::ReplicationFilterMismatch(_)
        | FailoverErrorKind::ReplicationStopped(_)
        | FailoverErrorKind::NoCandidate
        | FailoverErrorKind::CandidateNotElectable(_) => StatusCode::PRECONDITION_FAILED,
        FailoverErrorKind::WriteDrainTimeout(_)
        | FailoverErrorKind::CandidateUnsynced(_)
        | FailoverErrorKind::StepFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn cluster_status_code(e: &ClusterError) -> StatusCode {
    match e {
        ClusterError::ClusterNotFound(_) | ClusterError::ServerNotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::AlreadyExists(_) => StatusCode::CONFLICT,
        ClusterError::Rejected(GateRejection::NotPermitted(_)) => StatusCode::FORBIDDEN,
        ClusterError::Rejected(_) => StatusCode::CONFLICT,
        ClusterError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing or invalid token"}))).into_response()
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, Json(json!({"error": msg}))).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, Json(json!({"error": msg}))).into_response(),
            ApiError::Cluster(e) => {
                (cluster_status_code(&e), Json(json!({"error": e.to_string()}))).into_response()
            }
            ApiError::Failover(e) => {
                let status = failover_status(&e.kind);
                (
                    status,
                    Json(json!({
                        "error": e.to_string(),
                        "stage": e.stage,
                        "stageReached": e.stage.number(),
                        "detail": e.kind,
                    })),
                )
                    .into_response()
            }
        }
    }
}

impl ApiState {
    pub fn new(supervisor: Arc<Supervisor>, tokens: Arc<TokenRegistry>) -> Self {
        Self { supervisor, tokens }
    }

    fn caller(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        self.tokens.from_header(value).cloned().ok_or(ApiError::Unauthorized)
    }

    fn cluster(&self, name: &str) -> Result<Arc<Cluster>, ApiError> {
        self.supervisor
            .get_cluster(name)
            .ok_or_else(|| ApiError::NotFound(format!("cluster {}", name)))
    }

    /// 具备读权限时返回集群
    fn readable(&self, headers: &HeaderMap, name: &str) -> Result<Arc<Cluster>, ApiError> {
        let caller = self.caller(headers)?;
        if !caller.allows(Some(name), Permission::Read) {
            return Err(ApiError::Forbidden(format!("{} may not read {}", caller.user, name)));
        }
        self.cluster(name)
    }

    /// 动作类接口: 需要认证,写权限交给闸门判断
    fn actionable(&self, headers: &HeaderMap, name: &str) -> Result<(Arc<Cluster>, bool), ApiError> {
        let caller = self.caller(headers)?;
        let permitted = caller.allows(Some(name), Permission::Write);
        let cluster = self.cluster(name)?;
        info!(cluster = %name, user = %caller.user, permitted, "Action requested");
        Ok((cluster, permitted))
    }
}

/// `prefmaster` 表单字段
#[derive(Debug, Default, Deserialize)]
pub struct SwitchoverParams {
    pub prefmaster: Option<String>,
}

async fn list_clusters(State(state): State<ApiState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let caller = state.caller(&headers)?;
    let views: Vec<_> = state
        .supervisor
        .clusters()
        .iter()
        .filter(|c| caller.allows(Some(c.name()), Permission::Read))
        .map(|c| c.view())
        .collect();
    Ok(Json(views).into_response())
}

async fn cluster_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let cluster = state.readable(&headers, &name)?;
    Ok(Json(json!({"alive": cluster.status()})).into_response())
}

async fn topology(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((name, view)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let cluster = state.readable(&headers, &name)?;
    let response = match view.as_str() {
        "servers" => Json(cluster.servers()).into_response(),
        "master" => match cluster.primary() {
            Some(primary) => Json(primary).into_response(),
            None => return Err(ApiError::NotFound(format!("no primary in {}", name))),
        },
        "slaves" => Json(cluster.replicas()).into_response(),
        "alerts" => Json(cluster.alerts()).into_response(),
        "crashes" => Json(cluster.crashes()).into_response(),
        "logs" => Json(cluster.logs()).into_response(),
        other => return Err(ApiError::NotFound(format!("view {}", other))),
    };
    Ok(response)
}

fn promotion_response(result: Result<FailoverReport, FailoverError>) -> Result<Response, ApiError> {
    match result {
        Ok(report) => {
            if report.partial {
                warn!(failed = ?report.failed_replicas, "Promotion returned partial success");
            }
            Ok(Json(report).into_response())
        }
        Err(e) => Err(ApiError::Failover(e)),
    }
}

async fn switchover(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<SwitchoverParams>,
    form: Option<Form<SwitchoverParams>>,
) -> Result<Response, ApiError> {
    let (cluster, permitted) = state.actionable(&headers, &name)?;
    let prefmaster = form
        .and_then(|Form(f)| f.prefmaster)
        .or(query.prefmaster)
        .filter(|p| !p.is_empty());
    promotion_response(cluster.switchover(prefmaster, permitted).await)
}

async fn failover(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let (cluster, permitted) = state.actionable(&headers, &name)?;
    promotion_response(cluster.failover(permitted).await)
}

async fn cluster_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let (cluster, permitted) = state.actionable(&headers, &name)?;
    let on = cluster.toggle_maintenance(permitted).await?;
    Ok(Json(json!({"maintenance": on})).into_response())
}

async fn server_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((name, server)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (cluster, permitted) = state.actionable(&headers, &name)?;
    let on = cluster.toggle_server_maintenance(&server, permitted).await?;
    Ok(Json(json!({"server": server, "maintenance": on})).into_response())
}

async fn is_master(
    State(state): State<ApiState>,
    Path((name, host, port)): Path<(String, String, u16)>,
) -> Response {
    let valid = state
        .supervisor
        .get_cluster(&name)
        .map(|c| c.is_master(&host, port))
        .unwrap_or(false);
    if valid {
        (StatusCode::OK, "200 -Valid Master!").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "503 -Not a Valid Master!").into_response()
    }
}

async fn is_slave(
    State(state): State<ApiState>,
    Path((name, host, port)): Path<(String, String, u16)>,
) -> Response {
    let valid = state
        .supervisor
        .get_cluster(&name)
        .map(|c| c.is_slave(&host, port))
        .unwrap_or(false);
    if valid {
        (StatusCode::OK, "200 -Valid Slave!").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "503 -Not a Valid Slave!").into_response()
    }
}

async fn heartbeat(State(state): State<ApiState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let ctx = state.supervisor.context();
    let secret_ok = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| !ctx.arbitration.secret.is_empty() && s == ctx.arbitration.secret)
        .unwrap_or(false);
    if !secret_ok {
        let caller = state.caller(&headers)?;
        if !caller.allows(None, Permission::Arbitration) {
            return Err(ApiError::Forbidden(format!("{} may not read heartbeats", caller.user)));
        }
    }
    Ok(Json(ctx.heartbeat_record()).into_response())
}

async fn prometheus(State(state): State<ApiState>) -> Response {
    let body = render_prometheus(&state.supervisor.clusters(), chrono::Utc::now().timestamp());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// 按 Prometheus 文本格式输出各节点与集群指标
pub fn render_prometheus(clusters: &[Arc<Cluster>], now: i64) -> String {
    let mut out = String::new();
    let gauges: [(&str, &str); 4] = [
        ("repman_server_up", "Server answered the last probe"),
        ("repman_server_read_only", "Server read_only flag"),
        ("repman_server_replication_delay_seconds", "Replication delay"),
        ("repman_server_fail_count", "Consecutive failed probes"),
    ];
    for (metric, help) in gauges {
        let _ = writeln!(out, "# HELP {} {}", metric, help);
        let _ = writeln!(out, "# TYPE {} gauge", metric);
        for cluster in clusters {
            for server in cluster.servers() {
                let value = match metric {
                    "repman_server_up" => {
                        let down = server.last_error.is_some()
                            || matches!(server.state, ServerState::Failed | ServerState::Suspect);
                        u64::from(!down && server.last_seen.is_some())
                    }
                    "repman_server_read_only" => u64::from(server.read_only),
                    "repman_server_replication_delay_seconds" => server.delay.unwrap_or(0),
                    _ => u64::from(server.fail_count),
                };
                let _ = writeln!(
                    out,
                    "{}{{cluster=\"{}\",server=\"{}\"}} {}",
                    metric,
                    cluster.name(),
                    server.url,
                    value
                );
            }
        }
    }

    let _ = writeln!(out, "# TYPE repman_cluster_failover_total counter");
    for cluster in clusters {
        let _ = writeln!(
            out,
            "repman_cluster_failover_total{{cluster=\"{}\"}} {}",
            cluster.name(),
            cluster.failover_counter()
        );
    }
    let _ = writeln!(out, "# TYPE repman_cluster_uptime_seconds gauge");
    for cluster in clusters {
        let sla = cluster.sla(now).counters;
        for (kind, value) in [
            ("uptime", sla.uptime),
            ("failable", sla.uptime_failable),
            ("semisync", sla.uptime_semisync),
        ] {
            let _ = writeln!(
                out,
                "repman_cluster_uptime_seconds{{cluster=\"{}\",kind=\"{}\"}} {}",
                cluster.name(),
                kind,
                value
            );
        }
    }
    out
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/clusters", get(list_clusters))
        .route("/api/clusters/:cluster/status", get(cluster_status))
        .route("/api/clusters/:cluster/topology/:view", get(topology))
        .route("/api/clusters/:cluster/actions/switchover", post(switchover))
        .route("/api/clusters/:cluster/actions/failover", post(failover))
        .route("/api/clusters/:cluster/actions/maintenance", post(cluster_maintenance))
        .route(
            "/api/clusters/:cluster/servers/:server/actions/maintenance",
            post(server_maintenance),
        )
        .route("/api/clusters/:cluster/servers/:server/:port/is-master", get(is_master))
        .route("/api/clusters/:cluster/servers/:server/:port/is-slave", get(is_slave))
        .route("/api/heartbeat", get(heartbeat))
        .route("/api/prometheus", get(prometheus))
        .with_state(state)
}
