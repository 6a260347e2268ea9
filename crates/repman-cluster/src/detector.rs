//! 故障检测模块
//!
//! 根据本次探测结果与历史失败计数给每台节点打状态标签:
//! - 探测失败先标记 `Suspect`,连续达到阈值后升级为 `Failed`
//! - 主库探测失败时额外做一次 TCP ping,ping 通则计数清零
//! - 提升新主库后的冷却期内不会把任何节点标记为 `Failed`
//! - 从库仍然连着主库时视为误报,主库保持 `Suspect`

use indexmap::IndexMap;
use std::collections::BTreeMap;

use repman_common::ClusterConfig;

use crate::driver::IoThreadState;
use crate::server::{Server, ServerRole, ServerState};
use crate::topology::Classification;

/// 主库健康度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryHealth {
    Healthy,
    Suspect,
    Failed,
    /// 没有识别出主库
    Unknown,
}

/// 单台节点的检测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub state: ServerState,
    pub fail_count: u32,
}

/// 一次检测的输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub verdicts: BTreeMap<String, Verdict>,
    pub primary: PrimaryHealth,
    /// 主库探测失败但从库仍在复制
    pub false_positive: bool,
    pub cooldown_active: bool,
}

/// 故障检测器
#[derive(Debug, Clone)]
pub struct FailureDetector {
    threshold: u32,
    cooldown_secs: u64,
    false_positive_check: bool,
}

impl FailureDetector {
    pub fn new(threshold: u32, cooldown_secs: u64, false_positive_check: bool) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown_secs,
            false_positive_check,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(
            config.failover_falsepositive_ping_counter,
            config.failover_time_limit,
            config.failover_falsepositive_heartbeat,
        )
    }

    /// 本次 tick 是否需要对主库做 TCP ping
    pub fn primary_needs_ping<'a>(
        &self,
        servers: &'a IndexMap<String, Server>,
        classification: &Classification,
    ) -> Option<&'a Server> {
        let primary = servers.get(classification.primary.as_deref()?)?;
        match &primary.last_error {
            Some(e) if e.counts_as_failure() => Some(primary),
            _ => None,
        }
    }

    /// 计算所有节点的状态
    ///
    /// # Arguments
    /// * `servers` - 已记录本次探测结果的节点
    /// * `classification` - 本次拓扑识别结果
    /// * `ping_ok` - 主库 TCP ping 的结果(未 ping 时为 None)
    /// * `last_promotion` - 最近一次提升主库的时间
    /// * `now` - 当前 unix 秒
    pub fn evaluate(
        &self,
        servers: &IndexMap<String, Server>,
        classification: &Classification,
        ping_ok: Option<bool>,
        last_promotion: Option<i64>,
        now: i64,
    ) -> Detection {
        let cooldown_active = self.cooldown_secs > 0
            && last_promotion
                .map(|t| now < t + self.cooldown_secs as i64)
                .unwrap_or(false);
        let primary_url = classification.primary.as_deref();
        let false_positive = self.false_positive_check
            && primary_url
                .map(|p| self.replicas_still_connected(servers, p))
                .unwrap_or(false);

        let mut verdicts = BTreeMap::new();
        for (url, server) in servers {
            let is_primary = primary_url == Some(url.as_str());
            let verdict = match &server.last_error {
                None if server.snapshot.is_some() => Verdict {
                    state: state_for_role(classification.role(url)),
                    fail_count: 0,
                },
                None => Verdict {
                    state: ServerState::Unconnected,
                    fail_count: server.fail_count,
                },
                Some(e) if !e.counts_as_failure() => Verdict {
                    state: ServerState::Unconnected,
                    fail_count: server.fail_count,
                },
                Some(_) => {
                    let mut count = server.fail_count.saturating_add(1);
                    if is_primary && ping_ok == Some(true) {
                        count = 0;
                    }
                    let confirmed = count >= self.threshold
                        && !cooldown_active
                        && !(is_primary && false_positive);
                    Verdict {
                        state: if confirmed { ServerState::Failed } else { ServerState::Suspect },
                        fail_count: count,
                    }
                }
            };
            verdicts.insert(url.clone(), verdict);
        }

        let primary = match primary_url.and_then(|p| verdicts.get(p)) {
            None => PrimaryHealth::Unknown,
            Some(v) => match v.state {
                ServerState::Failed => PrimaryHealth::Failed,
                ServerState::Suspect | ServerState::Unconnected => PrimaryHealth::Suspect,
                _ => PrimaryHealth::Healthy,
            },
        };

        Detection {
            verdicts,
            primary,
            false_positive,
            cooldown_active,
        }
    }

    /// 是否还有从库的 IO 线程连在主库上
    fn replicas_still_connected(&self, servers: &IndexMap<String, Server>, primary: &str) -> bool {
        let known = || servers.values().map(|s| (s.url.as_str(), s.server_id()));
        servers.values().any(|s| {
            s.url != primary
                && s.last_error.is_none()
                && s.snapshot
                    .as_ref()
                    .and_then(|snap| snap.replication.as_ref())
                    .map(|r| r.io_state == IoThreadState::Yes)
                    .unwrap_or(false)
                && s.resolved_source(known()).as_deref() == Some(primary)
        })
    }
}

fn state_for_role(role: ServerRole) -> ServerState {
    match role {
        ServerRole::Primary => ServerState::Primary,
        ServerRole::Replica => ServerState::Replica,
        ServerRole::Relay => ServerState::RelayMaster,
        ServerRole::Maintenance => ServerState::MaintenanceMode,
        ServerRole::Unknown | ServerRole::Failed => ServerState::Unconnected,
    }
}
