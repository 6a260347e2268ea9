//! 内存仲裁服务
//!
//! 多个监控进程在彼此失联时向这里申请选举。按 (secret, cluster) 分组:
//! - 已有其他进程持有未过期的租约(10 秒)时拒绝
//! - 有其他进程在租约时间内上报过心跳,且它看到的故障节点更少时拒绝
//! - 否则授权,并为申请者记录租约;同一进程重复申请会续租

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use repman_cluster::{ArbitrationRequest, ArbitrationResponse, HeartbeatRecord};

/// 租约时长(秒)
pub const LEASE_SECS: i64 = 10;

type GroupKey = (String, String);

#[derive(Debug, Default)]
struct Group {
    /// uuid -> (上报时间, 心跳)
    reports: HashMap<String, (i64, HeartbeatRecord)>,
    /// (持有者, 授权时间)
    lease: Option<(String, i64)>,
}

/// 仲裁服务
#[derive(Debug, Default)]
pub struct ArbitratorService {
    groups: Mutex<HashMap<GroupKey, Group>>,
}

impl ArbitratorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_heartbeat(&self, record: HeartbeatRecord, now: i64) {
        let key = (record.secret.clone(), record.cluster.clone());
        debug!(cluster = %record.cluster, uuid = %record.uuid, failed = record.failed, "Heartbeat received");
        self.groups
            .lock()
            .entry(key)
            .or_default()
            .reports
            .insert(record.uuid.clone(), (now, record));
    }

    /// 处理一次选举申请
    pub fn elect(&self, request: &ArbitrationRequest, now: i64) -> ArbitrationResponse {
        let mut groups = self.groups.lock();
        let group = groups
            .entry((request.secret.clone(), request.cluster.clone()))
            .or_default();

        if let Some((holder, at)) = &group.lease {
            if holder != &request.uuid && now - at < LEASE_SECS {
                return deny(format!("election held by {}", holder));
            }
        }

        let ours = group.reports.get(&request.uuid).map(|(_, r)| r.failed);
        if let Some(our_failed) = ours {
            let better = group.reports.values().find(|(at, r)| {
                r.uuid != request.uuid && now - at < LEASE_SECS && r.failed < our_failed
            });
            if let Some((_, peer)) = better {
                return deny(format!("{} sees fewer failed servers", peer.uuid));
            }
        }

        group.lease = Some((request.uuid.clone(), now));
        info!(cluster = %request.cluster, uuid = %request.uuid, action = %request.proposed_action, "Election granted");
        ArbitrationResponse {
            grant: true,
            reason: String::new(),
        }
    }
}

fn deny(reason: String) -> ArbitrationResponse {
    info!("Election denied: {}", reason);
    ArbitrationResponse { grant: false, reason }
}

async fn heartbeat_handler(
    State(service): State<Arc<ArbitratorService>>,
    Json(record): Json<HeartbeatRecord>,
) -> Json<serde_json::Value> {
    service.record_heartbeat(record, chrono::Utc::now().timestamp());
    Json(serde_json::json!({}))
}

async fn election_handler(
    State(service): State<Arc<ArbitratorService>>,
    Json(request): Json<ArbitrationRequest>,
) -> Json<ArbitrationResponse> {
    Json(service.elect(&request, chrono::Utc::now().timestamp()))
}

/// 仲裁服务路由: `POST /heartbeat`、`POST /arbitrator`
pub fn router(service: Arc<ArbitratorService>) -> Router {
    Router::new()
        .route("/heartbeat", post(heartbeat_handler))
        .route("/arbitrator", post(election_handler))
        .with_state(service)
}
