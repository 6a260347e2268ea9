//! 数据库节点模块

use serde::{Deserialize, Serialize};

use repman_common::{HostPort, ServerSpec};

use crate::driver::ServerSnapshot;
use crate::error::ProbeError;

/// 节点状态标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ServerState {
    /// 探测失败,尚未确认
    Suspect,
    /// 连续失败已确认
    Failed,
    Primary,
    Replica,
    RelayMaster,
    MaintenanceMode,
    /// 可达但不属于拓扑
    #[default]
    Unconnected,
}

/// 拓扑角色,每个快照只有一个
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Primary,
    Replica,
    Relay,
    #[default]
    Unknown,
    Failed,
    Maintenance,
}

/// 被监控的数据库
///
/// 角色与状态只由所属集群的监控任务在 tick 内修改。
#[derive(Debug, Clone)]
pub struct Server {
    /// 名称(配置别名或 `host:port`)
    pub name: String,
    pub addr: HostPort,
    pub url: String,
    pub state: ServerState,
    pub prev_state: ServerState,
    pub role: ServerRole,
    pub snapshot: Option<ServerSnapshot>,
    pub last_error: Option<ProbeError>,
    /// 连续失败次数
    pub fail_count: u32,
    /// 最近一次探测成功的时间(unix 秒)
    pub last_seen: Option<i64>,
    /// 最近一次看到复制线程正常运行的时间
    pub last_replication_ok: Option<i64>,
    pub preferred: bool,
    pub ignored: bool,
    pub maintenance: bool,
}

impl Server {
    /// 创建新节点
    pub fn new(spec: &ServerSpec, preferred: bool, ignored: bool) -> Self {
        Self {
            name: spec.name.clone(),
            url: spec.addr.url(),
            addr: spec.addr.clone(),
            state: ServerState::Unconnected,
            prev_state: ServerState::Unconnected,
            role: ServerRole::Unknown,
            snapshot: None,
            last_error: None,
            fail_count: 0,
            last_seen: None,
            last_replication_ok: None,
            preferred,
            ignored,
            maintenance: false,
        }
    }

    /// 记录一次探测结果
    pub fn record_probe(&mut self, outcome: &Result<ServerSnapshot, ProbeError>, now: i64) {
        match outcome {
            Ok(snapshot) => {
                if snapshot
                    .replication
                    .as_ref()
                    .map(|r| r.threads_running())
                    .unwrap_or(false)
                {
                    self.last_replication_ok = Some(now);
                }
                self.snapshot = Some(snapshot.clone());
                self.last_error = None;
                self.last_seen = Some(now);
            }
            Err(e) => {
                self.last_error = Some(e.clone());
            }
        }
    }

    pub fn set_state(&mut self, state: ServerState) {
        if self.state != state {
            self.prev_state = self.state;
            self.state = state;
        }
    }

    /// 最近一次探测是否成功
    pub fn is_reachable(&self) -> bool {
        self.last_error.is_none() && self.snapshot.is_some()
    }

    pub fn is_down(&self) -> bool {
        matches!(self.state, ServerState::Failed | ServerState::Suspect)
    }

    pub fn read_only(&self) -> bool {
        self.snapshot.as_ref().map(|s| s.read_only).unwrap_or(false)
    }

    pub fn delay(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.delay()).unwrap_or(0)
    }

    pub fn replication_source(&self) -> Option<&HostPort> {
        self.snapshot.as_ref().and_then(|s| s.replication_source())
    }

    /// 最近一次探测到的 server_id,探测失败后仍保留
    pub fn server_id(&self) -> Option<u32> {
        self.snapshot.as_ref().map(|s| s.server_id)
    }

    /// 复制源解析到的已配置节点 url,别名地址按 server_id 匹配
    pub fn resolved_source<'a, I>(&self, known: I) -> Option<String>
    where
        I: IntoIterator<Item = (&'a str, Option<u32>)>,
    {
        let snapshot = self.snapshot.as_ref()?;
        let repl = snapshot.replication.as_ref()?;
        Some(crate::topology::resolve_source(&repl.source, repl.source_server_id, known))
    }

    /// 条件键使用的名称形式
    pub fn key_name(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    /// 对外展示的视图(不含凭据)
    pub fn view(&self) -> ServerView {
        let snapshot = self.snapshot.as_ref();
        let replication = snapshot.and_then(|s| s.replication.as_ref());
        ServerView {
            name: self.name.clone(),
            url: self.url.clone(),
            host: self.addr.host.clone(),
            port: self.addr.port,
            server_id: snapshot.map(|s| s.server_id),
            version: snapshot.map(|s| s.version.clone()),
            state: self.state,
            prev_state: self.prev_state,
            role: self.role,
            read_only: self.read_only(),
            semisync: snapshot
                .map(|s| s.semisync_primary_active || s.semisync_replica_active)
                .unwrap_or(false),
            replication_source: replication.map(|r| r.source.url()),
            io_thread: replication.map(|r| r.io_state),
            sql_thread: replication.map(|r| r.sql_running),
            delay: replication.and_then(|r| r.seconds_behind),
            gtid_binlog_pos: snapshot.map(|s| s.binlog_gtid.to_string()),
            binlog: snapshot
                .and_then(|s| s.binlog_coords.as_ref())
                .map(|c| c.to_string()),
            fail_count: self.fail_count,
            last_seen: self.last_seen,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
            preferred: self.preferred,
            ignored: self.ignored,
            maintenance: self.maintenance,
        }
    }
}

/// 节点视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerView {
    pub name: String,
    pub url: String,
    pub host: String,
    pub port: u16,
    pub server_id: Option<u32>,
    pub version: Option<String>,
    pub state: ServerState,
    pub prev_state: ServerState,
    pub role: ServerRole,
    pub read_only: bool,
    pub semisync: bool,
    pub replication_source: Option<String>,
    pub io_thread: Option<crate::driver::IoThreadState>,
    pub sql_thread: Option<bool>,
    pub delay: Option<u64>,
    pub gtid_binlog_pos: Option<String>,
    pub binlog: Option<String>,
    pub fail_count: u32,
    pub last_seen: Option<i64>,
    pub last_error: Option<String>,
    pub preferred: bool,
    pub ignored: bool,
    pub maintenance: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{IoThreadState, ReplicationStatus};

    fn spec(s: &str) -> ServerSpec {
        ServerSpec::parse(s).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let server = Server::new(&spec("s1=db1:3306"), true, false);
        assert_eq!(server.url, "db1:3306");
        assert_eq!(server.state, ServerState::Unconnected);
        assert_eq!(server.role, ServerRole::Unknown);
        assert!(server.preferred);
        assert!(!server.is_reachable());
    }

    #[test]
    fn test_record_probe() {
        let mut server = Server::new(&spec("db1"), false, false);
        let snapshot = ServerSnapshot {
            replication: Some(ReplicationStatus {
                io_state: IoThreadState::Yes,
                sql_running: true,
                seconds_behind: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };
        server.record_probe(&Ok(snapshot), 100);
        assert!(server.is_reachable());
        assert_eq!(server.last_seen, Some(100));
        assert_eq!(server.last_replication_ok, Some(100));
        assert_eq!(server.delay(), 4);

        server.record_probe(&Err(ProbeError::Unreachable("refused".into())), 102);
        assert!(!server.is_reachable());
        assert_eq!(server.last_seen, Some(100));
    }

    #[test]
    fn test_state_transition_keeps_previous() {
        let mut server = Server::new(&spec("db1"), false, false);
        server.set_state(ServerState::Primary);
        server.set_state(ServerState::Suspect);
        assert_eq!(server.prev_state, ServerState::Primary);
        server.set_state(ServerState::Suspect);
        assert_eq!(server.prev_state, ServerState::Primary);
    }

    #[test]
    fn test_key_name() {
        assert_eq!(Server::new(&spec("S4=db4:3306"), false, false).key_name(), "S4");
        assert_eq!(Server::new(&spec("10.0.0.4:3307"), false, false).key_name(), "10_0_0_4_3307");
    }
}
