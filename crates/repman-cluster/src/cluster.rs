//! 集群模块
//!
//! Cluster 以 URL 为键持有全部节点、条件状态机、SLA 计数器与故障转移计数。
//! 节点与条件只在监控 tick 和故障转移引擎内修改,API 只读取视图,
//! 锁不会跨越任何 I/O。

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use repman_common::{ClusterConfig, HostPort};

use crate::arbitrator::{HeartbeatRecord, SupervisorStatus};
use crate::detector::{FailureDetector, PrimaryHealth};
use crate::driver::ServerDriver;
use crate::error::{ClusterError, ClusterResult, FailoverResult};
use crate::failover::{self, FailoverReport, PromotionKind};
use crate::gate::{Action, ActionGate, GateContext};
use crate::monitor::{self, TickReport};
use crate::persist::{Crash, PersistedState, StateStore};
use crate::proxy::{ProxySet, TopologyChange};
use crate::server::{Server, ServerRole, ServerState, ServerView};
use crate::state::{codes, Condition, ConditionKind, Sla, StateMachine};
use crate::supervisor::SupervisorContext;
use crate::topology::{Classification, TopologyKind};

/// 内存中保留的日志行数
pub const LOG_CAPACITY: usize = 200;

/// 集群运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// 尚未完成第一次 tick
    Starting,
    /// 有打开的 ERROR 条件
    Errors,
    Running,
}

/// 故障转移后仍未重指向成功的从库
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRepoint {
    pub key: String,
    pub new_primary: String,
    pub reason: String,
}

/// 集群可变状态
#[derive(Debug)]
pub struct ClusterState {
    pub servers: IndexMap<String, Server>,
    pub classification: Classification,
    pub primary_health: PrimaryHealth,
    pub sm: StateMachine,
    pub sla: Sla,
    pub failover_ctr: u32,
    pub last_failover: Option<i64>,
    pub last_promotion: Option<i64>,
    pub pending_repoints: BTreeMap<String, PendingRepoint>,
    pub crashes: Vec<Crash>,
    pub logs: VecDeque<String>,
    pub last_primary: Option<String>,
}

impl ClusterState {
    fn persisted(&self) -> PersistedState {
        PersistedState {
            sla: self.sla.clone(),
            failover_ctr: self.failover_ctr,
            last_failover: self.last_failover,
            last_promotion: self.last_promotion,
            conditions: self.sm.previous().clone(),
            crashes: self.crashes.clone(),
        }
    }

    /// 按 URL 或名称查找节点
    pub fn find(&self, id: &str) -> Option<&Server> {
        self.servers
            .get(id)
            .or_else(|| self.servers.values().find(|s| s.name == id))
            .or_else(|| {
                let addr = HostPort::parse(id).ok()?;
                self.servers.get(&addr.url())
            })
    }

    fn find_url(&self, id: &str) -> Option<String> {
        self.find(id).map(|s| s.url.clone())
    }
}

/// 告警条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertView {
    pub key: String,
    pub kind: ConditionKind,
    pub desc: String,
    pub from: String,
    pub server_url: Option<String>,
}

/// `/topology/alerts` 的内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alerts {
    pub errors: Vec<AlertView>,
    pub warnings: Vec<AlertView>,
}

/// SLA 展示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaView {
    pub uptime: String,
    pub uptime_failable: String,
    pub uptime_semisync: String,
    pub counters: Sla,
}

/// 集群概要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub name: String,
    pub status: ClusterStatus,
    pub topology: String,
    pub primary: Option<String>,
    pub in_failover: bool,
    pub in_maintenance: bool,
    pub failover_counter: u32,
    pub last_failover: Option<i64>,
    pub sla: SlaView,
}

/// 一个被监控的集群
pub struct Cluster {
    pub(crate) name: String,
    pub(crate) config: ClusterConfig,
    pub(crate) state: RwLock<ClusterState>,
    pub(crate) gate: ActionGate,
    pub(crate) driver: Arc<dyn ServerDriver>,
    pub(crate) proxies: ProxySet,
    pub(crate) ctx: Arc<SupervisorContext>,
    pub(crate) detector: FailureDetector,
    store: Option<StateStore>,
    /// 最近一次写入(或恢复)的内容,相同时不再写盘
    saved: Mutex<Option<PersistedState>>,
    stop: watch::Sender<bool>,
}

impl Cluster {
    /// 创建集群并恢复持久化状态
    pub fn new(
        name: &str,
        config: ClusterConfig,
        driver: Arc<dyn ServerDriver>,
        ctx: Arc<SupervisorContext>,
    ) -> ClusterResult<Arc<Self>> {
        let proxies = ProxySet::from_configs(&config.proxies)?;
        Self::with_proxies(name, config, driver, proxies, ctx)
    }

    pub fn with_proxies(
        name: &str,
        config: ClusterConfig,
        driver: Arc<dyn ServerDriver>,
        proxies: ProxySet,
        ctx: Arc<SupervisorContext>,
    ) -> ClusterResult<Arc<Self>> {
        config.validate()?;
        let mut servers = IndexMap::new();
        for spec in config.servers()? {
            let url = spec.addr.url();
            let server = Server::new(&spec, config.is_preferred(&url), config.is_ignored(&url));
            servers.insert(url, server);
        }

        let store = ctx.datadir.as_ref().map(|dir| StateStore::new(dir, name));
        let restored = match &store {
            Some(store) => store.load()?,
            None => None,
        };
        let now = chrono::Utc::now().timestamp();
        let saved = restored.clone();
        let state = match restored {
            Some(saved) => {
                info!(cluster = %name, failover_ctr = saved.failover_ctr, "Restored cluster state");
                ClusterState {
                    servers,
                    classification: Classification::default(),
                    primary_health: PrimaryHealth::Unknown,
                    sm: StateMachine::restore(saved.conditions),
                    sla: saved.sla,
                    failover_ctr: saved.failover_ctr,
                    last_failover: saved.last_failover,
                    last_promotion: saved.last_promotion,
                    pending_repoints: BTreeMap::new(),
                    crashes: saved.crashes,
                    logs: VecDeque::with_capacity(LOG_CAPACITY),
                    last_primary: None,
                }
            }
            None => ClusterState {
                servers,
                classification: Classification::default(),
                primary_health: PrimaryHealth::Unknown,
                sm: StateMachine::new(),
                sla: Sla::new(now),
                failover_ctr: 0,
                last_failover: None,
                last_promotion: None,
                pending_repoints: BTreeMap::new(),
                crashes: Vec::new(),
                logs: VecDeque::with_capacity(LOG_CAPACITY),
                last_primary: None,
            },
        };

        let (stop, _) = watch::channel(false);
        Ok(Arc::new(Self {
            name: name.to_string(),
            detector: FailureDetector::from_config(&config),
            config,
            state: RwLock::new(state),
            gate: ActionGate::new(),
            driver,
            proxies,
            ctx,
            store,
            saved: Mutex::new(saved),
            stop,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn gate(&self) -> &ActionGate {
        &self.gate
    }

    /// 执行一次监控 tick
    pub async fn tick_once(self: &Arc<Self>) -> TickReport {
        monitor::tick(self).await
    }

    /// 计划内切换
    ///
    /// # Arguments
    /// * `prefmaster` - 指定的新主库(名称或 `host:port`)
    /// * `permitted` - 调用方是否持有写权限
    pub async fn switchover(
        self: &Arc<Self>,
        prefmaster: Option<String>,
        permitted: bool,
    ) -> FailoverResult<FailoverReport> {
        failover::spawn(self.clone(), PromotionKind::Switchover, prefmaster, permitted).await
    }

    /// 故障转移
    pub async fn failover(self: &Arc<Self>, permitted: bool) -> FailoverResult<FailoverReport> {
        failover::spawn(self.clone(), PromotionKind::Failover, None, permitted).await
    }

    pub(crate) fn gate_context(&self, permitted: bool) -> GateContext {
        GateContext {
            permitted,
            split_brain: self.ctx.split_brain(),
            active: self.ctx.status() == SupervisorStatus::Active,
        }
    }

    /// 切换单台节点的维护标志,返回新值
    pub async fn toggle_server_maintenance(&self, id: &str, permitted: bool) -> ClusterResult<bool> {
        self.gate
            .check(Action::ToggleServerMaintenance, &self.gate_context(permitted))?;
        let _serial = self.gate.serialize().await;
        self.gate
            .check(Action::ToggleServerMaintenance, &self.gate_context(permitted))?;
        let (name, on) = {
            let mut state = self.state.write();
            let url = state
                .find_url(id)
                .ok_or_else(|| ClusterError::ServerNotFound(id.to_string()))?;
            let server = state
                .servers
                .get_mut(&url)
                .ok_or_else(|| ClusterError::ServerNotFound(id.to_string()))?;
            server.maintenance = !server.maintenance;
            (server.name.clone(), server.maintenance)
        };
        self.log(format!("Server {} maintenance set to {}", name, on));
        self.proxies
            .set_maintenance(&name, &self.name, on, self.config.step_timeout())
            .await;
        Ok(on)
    }

    /// 切换集群维护标志,返回新值
    pub async fn toggle_maintenance(&self, permitted: bool) -> ClusterResult<bool> {
        self.gate
            .check(Action::ToggleClusterMaintenance, &self.gate_context(permitted))?;
        let _serial = self.gate.serialize().await;
        self.gate
            .check(Action::ToggleClusterMaintenance, &self.gate_context(permitted))?;
        let on = !self.gate.in_maintenance();
        self.gate.set_maintenance(on);
        self.log(format!("Cluster maintenance set to {}", on));
        Ok(on)
    }

    /// 在下一次 tick 收尾时报告的条件
    pub fn add_condition(&self, key: &str, condition: Condition) {
        self.state.write().sm.add(key, condition);
    }

    /// 记录一条集群日志
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!(cluster = %self.name, "{}", line);
        self.push_log(line);
    }

    pub(crate) fn push_log(&self, line: String) {
        let stamped = format!("{} {}", chrono::Utc::now().format("%Y/%m/%d %H:%M:%S"), line);
        let mut state = self.state.write();
        if state.logs.len() >= LOG_CAPACITY {
            state.logs.pop_front();
        }
        state.logs.push_back(stamped);
    }

    /// 写入状态文件
    pub fn persist(&self) -> ClusterResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.state.read().persisted();
        let mut saved = self.saved.lock();
        if saved.as_ref() == Some(&snapshot) {
            return Ok(());
        }
        store.save(&snapshot)?;
        *saved = Some(snapshot);
        Ok(())
    }

    /// 删除状态文件
    pub(crate) fn purge_state(&self) -> ClusterResult<()> {
        *self.saved.lock() = None;
        match &self.store {
            Some(store) => store.remove(),
            None => Ok(()),
        }
    }

    /// 请求监控循环退出
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub async fn disconnect_all(&self) {
        let addrs: Vec<HostPort> = self.state.read().servers.values().map(|s| s.addr.clone()).collect();
        for addr in addrs {
            self.driver.disconnect(&addr).await;
        }
    }

    pub(crate) fn topology_change(&self) -> TopologyChange {
        let state = self.state.read();
        TopologyChange {
            cluster: self.name.clone(),
            kind: state.classification.kind.to_string(),
            primary: state.classification.primary.clone(),
            replicas: state.classification.replicas.clone(),
        }
    }

    pub fn status(&self) -> ClusterStatus {
        let state = self.state.read();
        if state.sm.ticks() == 0 {
            ClusterStatus::Starting
        } else if state.sm.has_open_errors() {
            ClusterStatus::Errors
        } else {
            ClusterStatus::Running
        }
    }

    pub fn topology_kind(&self) -> TopologyKind {
        self.state.read().classification.kind
    }

    pub fn failover_counter(&self) -> u32 {
        self.state.read().failover_ctr
    }

    pub fn sla(&self, now: i64) -> SlaView {
        let state = self.state.read();
        SlaView {
            uptime: state.sla.uptime_pct(now),
            uptime_failable: state.sla.uptime_failable_pct(now),
            uptime_semisync: state.sla.uptime_semisync_pct(now),
            counters: state.sla.clone(),
        }
    }

    pub fn view(&self) -> ClusterView {
        let now = chrono::Utc::now().timestamp();
        let status = self.status();
        let sla = self.sla(now);
        let state = self.state.read();
        ClusterView {
            name: self.name.clone(),
            status,
            topology: state.classification.kind.to_string(),
            primary: state.classification.primary.clone(),
            in_failover: self.gate.in_failover(),
            in_maintenance: self.gate.in_maintenance(),
            failover_counter: state.failover_ctr,
            last_failover: state.last_failover,
            sla,
        }
    }

    pub fn servers(&self) -> Vec<ServerView> {
        self.state.read().servers.values().map(|s| s.view()).collect()
    }

    pub fn server(&self, id: &str) -> Option<ServerView> {
        self.state.read().find(id).map(|s| s.view())
    }

    pub fn primary(&self) -> Option<ServerView> {
        let state = self.state.read();
        let url = state.classification.primary.as_deref()?;
        state.servers.get(url).map(|s| s.view())
    }

    pub fn replicas(&self) -> Vec<ServerView> {
        self.state
            .read()
            .servers
            .values()
            .filter(|s| matches!(s.role, ServerRole::Replica | ServerRole::Relay))
            .map(|s| s.view())
            .collect()
    }

    pub fn alerts(&self) -> Alerts {
        let state = self.state.read();
        let to_view = |(key, c): (String, Condition)| AlertView {
            key,
            kind: c.kind,
            desc: c.desc,
            from: c.from,
            server_url: c.server_url,
        };
        Alerts {
            errors: state.sm.open_errors().into_iter().map(to_view).collect(),
            warnings: state.sm.open_warnings().into_iter().map(to_view).collect(),
        }
    }

    pub fn crashes(&self) -> Vec<Crash> {
        self.state.read().crashes.clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.state.read().logs.iter().cloned().collect()
    }

    /// 是否为健康的可写主库
    pub fn is_master(&self, host: &str, port: u16) -> bool {
        if self.gate.in_failover() {
            return false;
        }
        let state = self.state.read();
        let url = HostPort::new(host, port).url();
        let Some(server) = state.servers.get(&url) else {
            return false;
        };
        state.classification.primary.as_deref() == Some(url.as_str())
            && server.state == ServerState::Primary
            && server.is_reachable()
            && !server.read_only()
            && !server.maintenance
    }

    /// 是否可以承接读流量
    pub fn is_slave(&self, host: &str, port: u16) -> bool {
        let state = self.state.read();
        let url = HostPort::new(host, port).url();
        let Some(server) = state.servers.get(&url) else {
            return false;
        };
        if !server.is_reachable() || server.maintenance {
            return false;
        }
        match server.state {
            ServerState::Replica | ServerState::RelayMaster => server
                .snapshot
                .as_ref()
                .and_then(|s| s.replication.as_ref())
                .map(|r| r.threads_running())
                .unwrap_or(false),
            ServerState::Primary => self.config.proxy_servers_read_on_master,
            _ => false,
        }
    }

    /// 本集群的心跳记录
    pub fn heartbeat(&self, uuid: &str, uid: u64, secret: &str, status: SupervisorStatus) -> HeartbeatRecord {
        let state = self.state.read();
        let failed = state.servers.values().filter(|s| s.is_down()).count() as u32;
        HeartbeatRecord {
            uuid: uuid.to_string(),
            uid,
            secret: secret.to_string(),
            status,
            cluster: self.name.clone(),
            primary_url: state.classification.primary.clone(),
            healthy: state.servers.len() as u32 - failed,
            failed,
        }
    }

    pub(crate) fn warn_persist_failure(&self, e: &ClusterError) {
        warn!(cluster = %self.name, "Could not save cluster state: {}", e);
    }

    /// 主库地址
    pub(crate) fn server_addr(&self, url: &str) -> Option<HostPort> {
        self.state.read().servers.get(url).map(|s| s.addr.clone())
    }

    pub(crate) fn add(&self, key: &str, kind: ConditionKind, from: &str, desc: String, server: Option<&str>) {
        let mut condition = match kind {
            ConditionKind::Error => Condition::error(from, desc),
            ConditionKind::Warning => Condition::warning(from, desc),
        };
        if let Some(url) = server {
            condition = condition.on_server(url);
        }
        self.add_condition(key, condition);
    }

    pub(crate) fn open_split_brain_avoided(&self, reason: &str) {
        self.add(
            codes::ERR_SPLIT_BRAIN_AVOIDED,
            ConditionKind::Error,
            "arbitrator",
            format!("Arbitrator denied election: {}", reason),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFleet, SimServer};
    use tempfile::tempdir;

    fn fleet() -> Arc<SimFleet> {
        let fleet = Arc::new(SimFleet::new());
        fleet.add("db1:3306", SimServer::primary(1, 10));
        fleet.add("db2:3306", SimServer::replica_of(2, "db1:3306", 10));
        fleet
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            db_servers_hosts: vec!["S1=db1:3306".to_string(), "S2=db2:3306".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_views_after_tick() {
        let cluster = Cluster::new("c1", config(), fleet(), SupervisorContext::standalone()).unwrap();
        assert_eq!(cluster.status(), ClusterStatus::Starting);
        cluster.tick_once().await;
        assert_eq!(cluster.status(), ClusterStatus::Running);
        assert_eq!(cluster.primary().unwrap().name, "S1");
        assert_eq!(cluster.replicas().len(), 1);
        assert!(cluster.is_master("db1", 3306));
        assert!(!cluster.is_master("db2", 3306));
        assert!(cluster.is_slave("db2", 3306));
        assert!(!cluster.is_slave("db1", 3306));
        assert_eq!(cluster.server("S2").unwrap().url, "db2:3306");
        assert!(cluster.server("db9:3306").is_none());
    }

    #[tokio::test]
    async fn test_server_maintenance_toggle() {
        let cluster = Cluster::new("c1", config(), fleet(), SupervisorContext::standalone()).unwrap();
        cluster.tick_once().await;
        assert!(cluster.toggle_server_maintenance("S1", true).await.unwrap());
        assert!(!cluster.is_master("db1", 3306));
        assert!(matches!(
            cluster.toggle_server_maintenance("S1", false).await,
            Err(ClusterError::Rejected(_))
        ));
        assert!(matches!(
            cluster.toggle_server_maintenance("nope", true).await,
            Err(ClusterError::ServerNotFound(_))
        ));
        assert!(!cluster.toggle_server_maintenance("db1:3306", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_cluster_maintenance_blocks_switchover() {
        let cluster = Cluster::new("c1", config(), fleet(), SupervisorContext::standalone()).unwrap();
        cluster.tick_once().await;
        assert!(cluster.toggle_maintenance(true).await.unwrap());
        let err = cluster.switchover(None, true).await.unwrap_err();
        assert_eq!(err.kind, crate::error::FailoverErrorKind::InMaintenance);
        assert!(!cluster.toggle_maintenance(true).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        let ctx = SupervisorContext::with_datadir(dir.path());
        let cluster = Cluster::new("c1", config(), fleet(), ctx.clone()).unwrap();
        cluster.state.write().failover_ctr = 3;
        cluster.tick_once().await;

        let restored = Cluster::new("c1", config(), fleet(), ctx).unwrap();
        assert_eq!(restored.failover_counter(), 3);
    }

    #[test]
    fn test_persist_skips_unchanged_state() {
        let dir = tempdir().unwrap();
        let ctx = SupervisorContext::with_datadir(dir.path());
        let cluster = Cluster::new("c1", config(), fleet(), ctx).unwrap();
        let path = dir.path().join("c1.json");

        cluster.persist().unwrap();
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
        cluster.persist().unwrap();
        assert!(!path.exists());

        cluster.state.write().failover_ctr = 4;
        cluster.persist().unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_maintenance_set_while_switchover_waits() {
        let cluster = Cluster::new("c1", config(), fleet(), SupervisorContext::standalone()).unwrap();
        cluster.tick_once().await;

        let serial = cluster.gate.serialize().await;
        let waiting = {
            let cluster = cluster.clone();
            tokio::spawn(async move { cluster.switchover(None, true).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cluster.gate.set_maintenance(true);
        drop(serial);

        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.kind, crate::error::FailoverErrorKind::InMaintenance);
        assert_eq!(cluster.primary().unwrap().name, "S1");
        assert!(!cluster.gate.in_failover());
    }

    #[test]
    fn test_corrupt_state_is_fatal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("c1.json"), b"garbage").unwrap();
        let ctx = SupervisorContext::with_datadir(dir.path());
        assert!(matches!(
            Cluster::new("c1", config(), fleet(), ctx),
            Err(ClusterError::State(_))
        ));
    }

    #[test]
    fn test_log_ring_is_bounded() {
        let cluster = Cluster::new("c1", config(), fleet(), SupervisorContext::standalone()).unwrap();
        for i in 0..(LOG_CAPACITY + 10) {
            cluster.log(format!("line {}", i));
        }
        let logs = cluster.logs();
        assert_eq!(logs.len(), LOG_CAPACITY);
        assert!(logs[0].ends_with("line 10"));
    }
}
