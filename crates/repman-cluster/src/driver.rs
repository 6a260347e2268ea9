//! 数据库驱动接口
//!
//! ServerDriver 抽象了监控与拓扑变更所需的全部数据库操作,
//! 生产环境使用 [`crate::mysql::MysqlDriver`],测试使用 [`crate::sim::SimFleet`]。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use repman_common::{BinlogCoords, GtidSet, HostPort, ReplicationPosition};

use crate::error::ProbeError;

/// 数据库发行版
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DbFlavor {
    #[default]
    MariaDb,
    MySql,
}

impl DbFlavor {
    pub fn from_version(version: &str) -> Self {
        if version.to_ascii_lowercase().contains("mariadb") {
            DbFlavor::MariaDb
        } else {
            DbFlavor::MySql
        }
    }
}

/// IO 线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IoThreadState {
    Yes,
    Connecting,
    #[default]
    No,
}

impl IoThreadState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Yes" => IoThreadState::Yes,
            "Connecting" => IoThreadState::Connecting,
            _ => IoThreadState::No,
        }
    }
}

/// 复制过滤规则
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationFilters {
    pub do_db: String,
    pub ignore_db: String,
    pub do_table: String,
    pub ignore_table: String,
    pub wild_do_table: String,
    pub wild_ignore_table: String,
}

/// 复制线程状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub source: HostPort,
    pub source_server_id: Option<u32>,
    pub io_state: IoThreadState,
    pub sql_running: bool,
    pub seconds_behind: Option<u64>,
    pub using_gtid: bool,
    /// 已接收的 GTID
    pub retrieved_gtid: GtidSet,
    /// 已执行的 GTID
    pub executed_gtid: GtidSet,
    /// 已接收到的源端坐标
    pub read_coords: Option<BinlogCoords>,
    /// 已执行到的源端坐标
    pub exec_coords: Option<BinlogCoords>,
    pub last_io_error: String,
    pub last_sql_error: String,
}

impl ReplicationStatus {
    /// IO 线程未停止且 SQL 线程运行
    pub fn threads_running(&self) -> bool {
        self.io_state != IoThreadState::No && self.sql_running
    }

    /// relay log 是否已全部回放
    pub fn relay_applied(&self) -> bool {
        match (&self.read_coords, &self.exec_coords) {
            (Some(read), Some(exec)) => exec >= read,
            _ => self.executed_gtid.is_superset_of(&self.retrieved_gtid),
        }
    }
}

/// Galera 状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsrepStatus {
    pub cluster_size: u32,
    pub synced: bool,
}

/// 单次探测得到的数据库快照,生成后不可变
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub server_id: u32,
    pub version: String,
    pub flavor: DbFlavor,
    pub read_only: bool,
    pub log_bin: bool,
    pub semisync_primary_enabled: bool,
    pub semisync_primary_active: bool,
    pub semisync_replica_active: bool,
    /// 本机 binlog 已写入的 GTID
    pub binlog_gtid: GtidSet,
    pub binlog_coords: Option<BinlogCoords>,
    /// 连接到本机的 binlog dump 线程数
    pub connected_replicas: u32,
    pub replication: Option<ReplicationStatus>,
    pub filters: ReplicationFilters,
    pub wsrep: Option<WsrepStatus>,
    pub is_binlog_server: bool,
}

impl ServerSnapshot {
    pub fn is_replica(&self) -> bool {
        self.replication.is_some()
    }

    pub fn replication_source(&self) -> Option<&HostPort> {
        self.replication.as_ref().map(|r| &r.source)
    }

    pub fn delay(&self) -> u64 {
        self.replication
            .as_ref()
            .and_then(|r| r.seconds_behind)
            .unwrap_or(0)
    }

    /// 本机作为主库时的位点
    pub fn primary_position(&self) -> ReplicationPosition {
        ReplicationPosition::new(self.binlog_gtid.clone(), self.binlog_coords.clone())
    }

    /// 作为从库已接收到的位点(故障转移时比较)
    pub fn retrieved_position(&self) -> ReplicationPosition {
        match &self.replication {
            Some(r) => ReplicationPosition::new(r.retrieved_gtid.clone(), r.read_coords.clone()),
            None => self.primary_position(),
        }
    }

    /// 作为从库已执行的位点(切换时比较)
    pub fn executed_position(&self) -> ReplicationPosition {
        match &self.replication {
            Some(r) => ReplicationPosition::new(r.executed_gtid.clone(), r.exec_coords.clone()),
            None => self.primary_position(),
        }
    }
}

/// 复制源配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub source: HostPort,
    pub user: String,
    pub password: String,
    pub use_gtid: bool,
    pub connect_retry: u64,
    /// 非 GTID 模式下的起始坐标
    pub coords: Option<BinlogCoords>,
}

/// 数据库驱动
///
/// 每个调用都应在内部遵守传入的超时,调用方另有外层超时兜底。
#[async_trait]
pub trait ServerDriver: Send + Sync {
    /// 采集一次快照
    async fn probe(&self, addr: &HostPort, timeout: Duration) -> Result<ServerSnapshot, ProbeError>;

    /// TCP 层连通性检查
    async fn tcp_ping(&self, addr: &HostPort, timeout: Duration) -> bool;

    async fn stop_replication(&self, addr: &HostPort) -> Result<(), ProbeError>;

    async fn start_replication(&self, addr: &HostPort) -> Result<(), ProbeError>;

    /// 清除复制配置
    async fn reset_replication(&self, addr: &HostPort) -> Result<(), ProbeError>;

    async fn set_read_only(&self, addr: &HostPort, read_only: bool) -> Result<(), ProbeError>;

    /// 冻结写入:FLUSH TABLES WITH READ LOCK
    async fn freeze(&self, addr: &HostPort, timeout: Duration) -> Result<(), ProbeError>;

    /// 解除冻结
    async fn unfreeze(&self, addr: &HostPort) -> Result<(), ProbeError>;

    async fn change_source(&self, addr: &HostPort, spec: &SourceSpec) -> Result<(), ProbeError>;

    /// 等待从库执行到指定位点,返回是否到达
    async fn wait_for_position(
        &self,
        addr: &HostPort,
        target: &ReplicationPosition,
        timeout: Duration,
    ) -> Result<bool, ProbeError>;

    /// 运行时间超过 `threshold` 秒的写事务数
    async fn long_running_writes(&self, addr: &HostPort, threshold: u64) -> Result<u32, ProbeError>;

    /// 关闭到该数据库的连接池
    async fn disconnect(&self, _addr: &HostPort) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavor_from_version() {
        assert_eq!(DbFlavor::from_version("10.6.12-MariaDB-log"), DbFlavor::MariaDb);
        assert_eq!(DbFlavor::from_version("8.0.35"), DbFlavor::MySql);
    }

    #[test]
    fn test_threads_running_accepts_connecting() {
        let mut status = ReplicationStatus {
            io_state: IoThreadState::Connecting,
            sql_running: true,
            ..Default::default()
        };
        assert!(status.threads_running());
        status.io_state = IoThreadState::No;
        assert!(!status.threads_running());
    }

    #[test]
    fn test_relay_applied() {
        let status = ReplicationStatus {
            read_coords: Some(BinlogCoords::new("bin.000003", 500)),
            exec_coords: Some(BinlogCoords::new("bin.000003", 400)),
            ..Default::default()
        };
        assert!(!status.relay_applied());
        let status = ReplicationStatus {
            read_coords: Some(BinlogCoords::new("bin.000003", 500)),
            exec_coords: Some(BinlogCoords::new("bin.000003", 500)),
            ..Default::default()
        };
        assert!(status.relay_applied());
    }
}
