//! 监控进程
//!
//! 进程级的编排者,持有:
//! - 集群注册表与每个集群的监控任务
//! - 对端心跳循环(Active/Standby 协商与外部仲裁)
//! - 共享上下文: UUID、仲裁配置、split-brain 标志、数据目录
//!
//! 进程内没有其他全局状态,所有组件通过 `Arc<SupervisorContext>` 访问共享部分。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use repman_common::{ArbitrationConfig, ClusterConfig};

use crate::arbitrator::{
    resolve_status, ArbitrationRequest, Arbitrator, HeartbeatRecord, PeerTracker, SupervisorStatus,
};
use crate::cluster::Cluster;
use crate::driver::ServerDriver;
use crate::error::{ClusterError, ClusterResult};
use crate::monitor;
use crate::mysql::MysqlDriver;

/// 各集群共享的进程级上下文
pub struct SupervisorContext {
    pub uuid: String,
    pub arbitration: ArbitrationConfig,
    pub arbitrator: Option<Arc<dyn Arbitrator>>,
    /// 持久化目录,None 时不落盘
    pub datadir: Option<PathBuf>,
    split_brain: AtomicBool,
    standby: AtomicBool,
}

impl SupervisorContext {
    pub fn new(
        arbitration: ArbitrationConfig,
        arbitrator: Option<Arc<dyn Arbitrator>>,
        datadir: Option<PathBuf>,
    ) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            arbitration,
            arbitrator,
            datadir,
            split_brain: AtomicBool::new(false),
            standby: AtomicBool::new(false),
        }
    }

    /// 无仲裁、不落盘
    pub fn standalone() -> Arc<Self> {
        Arc::new(Self::new(ArbitrationConfig::default(), None, None))
    }

    pub fn with_datadir(datadir: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self::new(
            ArbitrationConfig::default(),
            None,
            Some(datadir.as_ref().to_path_buf()),
        ))
    }

    pub fn split_brain(&self) -> bool {
        self.split_brain.load(Ordering::SeqCst)
    }

    pub fn set_split_brain(&self, on: bool) {
        let was = self.split_brain.swap(on, Ordering::SeqCst);
        if was != on {
            info!(split_brain = on, "Split-brain flag changed");
        }
    }

    pub fn status(&self) -> SupervisorStatus {
        if self.standby.load(Ordering::SeqCst) {
            SupervisorStatus::Standby
        } else {
            SupervisorStatus::Active
        }
    }

    pub fn set_status(&self, status: SupervisorStatus) {
        let standby = status == SupervisorStatus::Standby;
        if self.standby.swap(standby, Ordering::SeqCst) != standby {
            info!(status = ?status, "Supervisor status changed");
        }
    }

    /// 本进程的心跳记录
    pub fn heartbeat_record(&self) -> HeartbeatRecord {
        HeartbeatRecord {
            uuid: self.uuid.clone(),
            uid: self.arbitration.uid,
            secret: self.arbitration.secret.clone(),
            status: self.status(),
            ..Default::default()
        }
    }
}

/// 按集群配置创建驱动
pub type DriverFactory = Arc<dyn Fn(&ClusterConfig) -> Arc<dyn ServerDriver> + Send + Sync>;

struct ClusterEntry {
    cluster: Arc<Cluster>,
    handle: JoinHandle<()>,
}

/// 监控进程
pub struct Supervisor {
    ctx: Arc<SupervisorContext>,
    configs: RwLock<BTreeMap<String, ClusterConfig>>,
    clusters: DashMap<String, ClusterEntry>,
    driver_factory: DriverFactory,
    peers: Mutex<PeerTracker>,
    stop: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<SupervisorContext>,
        configs: BTreeMap<String, ClusterConfig>,
        driver_factory: DriverFactory,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            configs: RwLock::new(configs),
            clusters: DashMap::new(),
            driver_factory,
            peers: Mutex::new(PeerTracker::new()),
            stop,
        })
    }

    /// 使用 MySQL/MariaDB 驱动
    pub fn with_mysql(ctx: Arc<SupervisorContext>, configs: BTreeMap<String, ClusterConfig>) -> Arc<Self> {
        Self::new(
            ctx,
            configs,
            Arc::new(|config: &ClusterConfig| Arc::new(MysqlDriver::new(config)) as Arc<dyn ServerDriver>),
        )
    }

    pub fn context(&self) -> &Arc<SupervisorContext> {
        &self.ctx
    }

    /// 启动配置中的全部集群
    pub fn start(&self) -> ClusterResult<()> {
        let names: Vec<String> = self.configs.read().keys().cloned().collect();
        for name in names {
            self.add_cluster(&name, None)?;
        }
        Ok(())
    }

    /// 注册集群并启动其监控任务
    ///
    /// 配置中没有该集群时继承 `parent` 的配置。
    pub fn add_cluster(&self, name: &str, parent: Option<&str>) -> ClusterResult<Arc<Cluster>> {
        let config = {
            let configs = self.configs.read();
            match (configs.get(name), parent) {
                (Some(config), _) => config.clone(),
                (None, Some(parent)) => configs
                    .get(parent)
                    .cloned()
                    .ok_or_else(|| ClusterError::ClusterNotFound(parent.to_string()))?,
                (None, None) => {
                    return Err(ClusterError::Config(format!(
                        "no configuration for cluster '{}'",
                        name
                    )))
                }
            }
        };

        match self.clusters.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ClusterError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                let driver = (self.driver_factory)(&config);
                let cluster = Cluster::new(name, config.clone(), driver, self.ctx.clone())?;
                let handle = tokio::spawn(monitor::run(cluster.clone()));
                slot.insert(ClusterEntry {
                    cluster: cluster.clone(),
                    handle,
                });
                self.configs.write().entry(name.to_string()).or_insert(config);
                info!(cluster = %name, parent = ?parent, "Cluster added");
                Ok(cluster)
            }
        }
    }

    /// 停止监控、等待其退出并删除持久化状态,重复调用无副作用
    pub async fn remove_cluster(&self, name: &str) -> ClusterResult<()> {
        let Some((_, entry)) = self.clusters.remove(name) else {
            debug!(cluster = %name, "Cluster already removed");
            return Ok(());
        };
        entry.cluster.stop();
        if let Err(e) = entry.handle.await {
            warn!(cluster = %name, "Monitor task ended abnormally: {}", e);
        }
        entry.cluster.purge_state()?;
        self.configs.write().remove(name);
        info!(cluster = %name, "Cluster removed");
        Ok(())
    }

    pub fn get_cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|e| e.cluster.clone())
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        let mut clusters: Vec<Arc<Cluster>> = self.clusters.iter().map(|e| e.cluster.clone()).collect();
        clusters.sort_by(|a, b| a.name().cmp(b.name()));
        clusters
    }

    /// 一轮心跳: 拉取对端,必要时向仲裁服务申请
    pub async fn heartbeat(&self) {
        let arbitration = &self.ctx.arbitration;
        let Some(arbitrator) = self.ctx.arbitrator.clone() else {
            return;
        };
        let now = chrono::Utc::now().timestamp();

        let fetches = arbitration.peers.iter().map(|peer| {
            let arbitrator = arbitrator.clone();
            async move { (peer, arbitrator.fetch_peer(peer).await) }
        });
        for (peer, result) in join_all(fetches).await {
            match result {
                Ok(record) if record.secret == arbitration.secret => {
                    self.peers.lock().observe(peer, record, now);
                }
                Ok(_) => warn!(peer = %peer, "Ignoring heartbeat with a different secret"),
                Err(e) => debug!(peer = %peer, "Peer heartbeat failed: {}", e),
            }
        }

        let down_after = arbitration.down_after().as_secs() as i64;
        let live: Vec<HeartbeatRecord> = self
            .peers
            .lock()
            .live(&arbitration.peers, now, down_after)
            .into_iter()
            .cloned()
            .collect();

        if !live.is_empty() {
            let refs: Vec<&HeartbeatRecord> = live.iter().collect();
            self.ctx.set_split_brain(false);
            self.ctx.set_status(resolve_status(&self.ctx.uuid, &refs));
            return;
        }

        if !arbitration.enabled {
            self.ctx.set_split_brain(false);
            self.ctx.set_status(SupervisorStatus::Active);
            return;
        }

        let granted = self.request_active(arbitrator.as_ref()).await;
        if granted {
            self.ctx.set_split_brain(false);
            self.ctx.set_status(SupervisorStatus::Active);
        } else {
            self.ctx.set_split_brain(true);
            self.ctx.set_status(SupervisorStatus::Standby);
        }
    }

    /// 所有对端失联时,逐个集群上报心跳并申请成为 Active
    async fn request_active(&self, arbitrator: &dyn Arbitrator) -> bool {
        let arbitration = &self.ctx.arbitration;
        let status = self.ctx.status();
        let mut granted = true;
        for cluster in self.clusters() {
            let record = cluster.heartbeat(&self.ctx.uuid, arbitration.uid, &arbitration.secret, status);
            if let Err(e) = arbitrator.report(&record).await {
                warn!(cluster = %cluster.name(), "Arbitrator heartbeat failed: {}", e);
            }
            let request = ArbitrationRequest {
                uuid: self.ctx.uuid.clone(),
                cluster: cluster.name().to_string(),
                secret: arbitration.secret.clone(),
                proposed_action: "active".to_string(),
            };
            match arbitrator.request_election(&request).await {
                Ok(response) if response.grant => {}
                Ok(response) => {
                    warn!(cluster = %cluster.name(), "Arbitrator refused: {}", response.reason);
                    granted = false;
                }
                Err(e) => {
                    warn!(cluster = %cluster.name(), "Arbitrator unreachable: {}", e);
                    granted = false;
                }
            }
        }
        granted
    }

    /// 心跳循环,直到 shutdown
    pub async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.ctx.arbitration.ticker());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.heartbeat().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat loop stopped");
    }

    /// 通知所有监控任务停止并等待退出
    pub async fn shutdown(&self) {
        info!("Stopping supervisor...");
        self.stop.send_replace(true);
        for entry in self.clusters.iter() {
            entry.cluster.stop();
        }
        for name in self.cluster_names() {
            if let Some((_, entry)) = self.clusters.remove(&name) {
                if let Err(e) = entry.handle.await {
                    warn!(cluster = %name, "Monitor task ended abnormally: {}", e);
                }
            }
        }
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrator::ArbitrationResponse;
    use crate::error::ArbitrationError;
    use crate::sim::{SimFleet, SimServer};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn configs() -> BTreeMap<String, ClusterConfig> {
        let mut configs = BTreeMap::new();
        configs.insert(
            "c1".to_string(),
            ClusterConfig {
                db_servers_hosts: vec!["db1:3306".to_string(), "db2:3306".to_string()],
                ..Default::default()
            },
        );
        configs
    }

    fn sim_factory() -> DriverFactory {
        Arc::new(|_: &ClusterConfig| {
            let fleet = SimFleet::new();
            fleet.add("db1:3306", SimServer::primary(1, 10));
            fleet.add("db2:3306", SimServer::replica_of(2, "db1:3306", 10));
            Arc::new(fleet) as Arc<dyn ServerDriver>
        })
    }

    #[derive(Default)]
    struct FakeArbitrator {
        peers: HashMap<String, HeartbeatRecord>,
        grant: bool,
        reports: Mutex<Vec<HeartbeatRecord>>,
    }

    #[async_trait]
    impl Arbitrator for FakeArbitrator {
        async fn fetch_peer(&self, peer: &str) -> Result<HeartbeatRecord, ArbitrationError> {
            self.peers
                .get(peer)
                .cloned()
                .ok_or_else(|| ArbitrationError::Transport(peer.to_string(), "refused".to_string()))
        }

        async fn report(&self, heartbeat: &HeartbeatRecord) -> Result<(), ArbitrationError> {
            self.reports.lock().push(heartbeat.clone());
            Ok(())
        }

        async fn request_election(
            &self,
            _request: &ArbitrationRequest,
        ) -> Result<ArbitrationResponse, ArbitrationError> {
            Ok(ArbitrationResponse {
                grant: self.grant,
                reason: "held by another supervisor".to_string(),
            })
        }
    }

    fn arbitrated(arbitrator: FakeArbitrator, uuid: &str) -> Arc<SupervisorContext> {
        let arbitration = ArbitrationConfig {
            enabled: true,
            peers: vec!["repman2:10001".to_string()],
            secret: "s3cret".to_string(),
            ..Default::default()
        };
        let mut ctx = SupervisorContext::new(arbitration, Some(Arc::new(arbitrator)), None);
        ctx.uuid = uuid.to_string();
        Arc::new(ctx)
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let dir = tempdir().unwrap();
        let supervisor = Supervisor::new(SupervisorContext::with_datadir(dir.path()), configs(), sim_factory());
        supervisor.start().unwrap();
        assert_eq!(supervisor.cluster_names(), vec!["c1"]);
        assert!(matches!(
            supervisor.add_cluster("c1", None),
            Err(ClusterError::AlreadyExists(_))
        ));

        let cluster = supervisor.get_cluster("c1").unwrap();
        cluster.tick_once().await;
        assert!(dir.path().join("c1.json").exists());

        supervisor.remove_cluster("c1").await.unwrap();
        supervisor.remove_cluster("c1").await.unwrap();
        assert!(supervisor.get_cluster("c1").is_none());
        assert!(!dir.path().join("c1.json").exists());
    }

    #[tokio::test]
    async fn test_add_with_parent() {
        let supervisor = Supervisor::new(SupervisorContext::standalone(), configs(), sim_factory());
        let child = supervisor.add_cluster("c2", Some("c1")).unwrap();
        assert_eq!(child.config().db_servers_hosts.len(), 2);
        assert!(matches!(
            supervisor.add_cluster("c3", Some("missing")),
            Err(ClusterError::ClusterNotFound(_))
        ));
        assert!(matches!(supervisor.add_cluster("c4", None), Err(ClusterError::Config(_))));
        supervisor.shutdown().await;
        assert!(supervisor.cluster_names().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_denied_means_split_brain() {
        let ctx = arbitrated(FakeArbitrator::default(), "bbbb");
        let supervisor = Supervisor::new(ctx.clone(), configs(), sim_factory());
        supervisor.start().unwrap();
        supervisor.heartbeat().await;
        assert!(ctx.split_brain());
        assert_eq!(ctx.status(), SupervisorStatus::Standby);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_granted() {
        let arbitrator = FakeArbitrator {
            grant: true,
            ..Default::default()
        };
        let ctx = arbitrated(arbitrator, "bbbb");
        ctx.set_split_brain(true);
        let supervisor = Supervisor::new(ctx.clone(), configs(), sim_factory());
        supervisor.start().unwrap();
        supervisor.heartbeat().await;
        assert!(!ctx.split_brain());
        assert_eq!(ctx.status(), SupervisorStatus::Active);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_peer_with_lower_uuid() {
        let mut peers = HashMap::new();
        peers.insert(
            "repman2:10001".to_string(),
            HeartbeatRecord {
                uuid: "aaaa".to_string(),
                secret: "s3cret".to_string(),
                status: SupervisorStatus::Active,
                ..Default::default()
            },
        );
        let ctx = arbitrated(
            FakeArbitrator {
                peers,
                ..Default::default()
            },
            "bbbb",
        );
        let supervisor = Supervisor::new(ctx.clone(), BTreeMap::new(), sim_factory());
        supervisor.heartbeat().await;
        assert_eq!(ctx.status(), SupervisorStatus::Standby);
        assert!(!ctx.split_brain());
    }

    #[tokio::test]
    async fn test_peer_with_wrong_secret_is_ignored() {
        let mut peers = HashMap::new();
        peers.insert(
            "repman2:10001".to_string(),
            HeartbeatRecord {
                uuid: "aaaa".to_string(),
                secret: "other".to_string(),
                status: SupervisorStatus::Active,
                ..Default::default()
            },
        );
        let ctx = arbitrated(
            FakeArbitrator {
                peers,
                grant: true,
                ..Default::default()
            },
            "bbbb",
        );
        let supervisor = Supervisor::new(ctx.clone(), BTreeMap::new(), sim_factory());
        supervisor.heartbeat().await;
        assert_eq!(ctx.status(), SupervisorStatus::Active);
    }
}
