//! 端到端场景: 模拟集群上的切换、故障转移、split primary、限流、仲裁拒绝与部分重指向

use async_trait::async_trait;
use std::sync::Arc;

use repman_cluster::arbitrator::{ArbitrationRequest, ArbitrationResponse, Arbitrator, HeartbeatRecord};
use repman_cluster::persist::{PersistedState, StateStore};
use repman_cluster::sim::{SimFleet, SimServer};
use repman_cluster::state::{codes, ConditionMap, Sla};
use repman_cluster::{
    ArbitrationError, Cluster, FailoverErrorKind, FailoverStage, PromotionKind, ServerRole,
    ServerState, SupervisorContext, TopologyKind,
};
use repman_common::{ArbitrationConfig, ClusterConfig, FailoverMode, HostPort};

fn hosts(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("S{}=db{}:3306", i, i)).collect()
}

fn fleet(replicas: usize) -> Arc<SimFleet> {
    let fleet = Arc::new(SimFleet::new());
    fleet.add("db1:3306", SimServer::primary(1, 100));
    for i in 2..=replicas + 1 {
        fleet.add(
            &format!("db{}:3306", i),
            SimServer::replica_of(i as u32, "db1:3306", 100),
        );
    }
    fleet
}

fn config(n: usize) -> ClusterConfig {
    ClusterConfig {
        db_servers_hosts: hosts(n),
        failover_falsepositive_ping_counter: 2,
        ..Default::default()
    }
}

fn error_keys(cluster: &Cluster) -> Vec<String> {
    cluster.alerts().errors.into_iter().map(|a| a.key).collect()
}

async fn kill_primary(cluster: &Arc<Cluster>, fleet: &SimFleet) {
    fleet.kill("db1:3306");
    cluster.tick_once().await;
    cluster.tick_once().await;
    assert_eq!(cluster.server("S1").unwrap().state, ServerState::Failed);
}

#[tokio::test]
async fn switchover_to_preferred_server() {
    let fleet = fleet(2);
    let cluster = Cluster::new("c1", config(3), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    assert_eq!(cluster.primary().unwrap().name, "S1");

    let report = cluster.switchover(Some("db2:3306".to_string()), true).await.unwrap();
    assert!(report.success);
    assert!(!report.partial);
    assert_eq!(report.kind, PromotionKind::Switchover);
    assert_eq!(report.new_primary.as_deref(), Some("db2:3306"));
    assert_eq!(report.old_primary_role, ServerRole::Replica);

    let s1 = fleet.get("db1:3306").unwrap();
    assert!(s1.read_only);
    assert!(!s1.frozen);
    assert_eq!(s1.source, Some(HostPort::new("db2", 3306)));
    let s2 = fleet.get("db2:3306").unwrap();
    assert!(!s2.read_only);
    assert!(s2.source.is_none());
    assert_eq!(fleet.get("db3:3306").unwrap().source, Some(HostPort::new("db2", 3306)));

    cluster.tick_once().await;
    assert_eq!(cluster.primary().unwrap().name, "S2");
    assert!(cluster.is_slave("db1", 3306));
    assert!(cluster.is_slave("db3", 3306));
    // 切换不计入故障转移次数
    assert_eq!(cluster.failover_counter(), 0);
}

#[tokio::test]
async fn switchover_to_unknown_server_is_rejected() {
    let fleet = fleet(2);
    let cluster = Cluster::new("c1", config(3), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    let err = cluster.switchover(Some("db9:3306".to_string()), true).await.unwrap_err();
    assert_eq!(err.stage, FailoverStage::Election);
    assert!(matches!(err.kind, FailoverErrorKind::CandidateNotElectable(_)));
    assert!(fleet.calls().is_empty());
}

#[tokio::test]
async fn switchover_rolls_back_when_writes_do_not_drain() {
    let fleet = fleet(1);
    let cluster = Cluster::new("c1", config(2), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    fleet.with("db1:3306", |s| s.long_writes = 3);
    let err = cluster.switchover(None, true).await.unwrap_err();
    assert!(matches!(err.kind, FailoverErrorKind::WriteDrainTimeout(_)));
    assert!(!fleet.get("db1:3306").unwrap().read_only);
    assert!(!cluster.gate().in_failover());
}

#[tokio::test]
async fn failover_skips_lagging_replica() {
    let fleet = fleet(2);
    let mut config = config(3);
    config.failover_mode = FailoverMode::Automatic;
    config.failover_max_slave_delay = 30;
    let cluster = Cluster::new("c1", config, fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;

    fleet.with("db3:3306", |s| s.lag = 60);
    fleet.write("db1:3306", 5);
    let report = cluster.tick_once().await;
    assert!(report.delta.opened.iter().any(|(k, _)| k == codes::WARN_DELAY));

    fleet.kill("db1:3306");
    cluster.tick_once().await;
    let report = cluster.tick_once().await;
    let outcome = report.failover.expect("automatic failover").unwrap();
    assert_eq!(outcome.new_primary.as_deref(), Some("db2:3306"));
    assert_eq!(outcome.old_primary_role, ServerRole::Failed);
    assert_eq!(outcome.repointed, vec!["S3".to_string()]);

    let s2 = fleet.get("db2:3306").unwrap();
    assert!(!s2.read_only);
    assert!(s2.source.is_none());
    assert_eq!(fleet.get("db3:3306").unwrap().source, Some(HostPort::new("db2", 3306)));
    assert_eq!(cluster.failover_counter(), 1);
    let crashes = cluster.crashes();
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].old_primary_url, "db1:3306");
    assert_eq!(crashes[0].elected_primary_url, "db2:3306");

    cluster.tick_once().await;
    assert_eq!(cluster.primary().unwrap().name, "S2");
}

#[tokio::test]
async fn failover_requires_failed_primary() {
    let fleet = fleet(1);
    let cluster = Cluster::new("c1", config(2), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    let err = cluster.failover(true).await.unwrap_err();
    assert!(matches!(err.kind, FailoverErrorKind::PrimaryNotFailed(_)));
    assert!(err.is_precondition());
}

#[tokio::test]
async fn split_primary_blocks_automatic_action() {
    let fleet = Arc::new(SimFleet::new());
    fleet.add("db1:3306", SimServer::primary(1, 100));
    fleet.add("db2:3306", SimServer::primary(2, 100));
    let mut config = config(2);
    config.failover_mode = FailoverMode::Automatic;
    let cluster = Cluster::new("c1", config, fleet.clone(), SupervisorContext::standalone()).unwrap();

    for _ in 0..3 {
        let report = cluster.tick_once().await;
        assert!(report.failover.is_none());
    }
    assert_eq!(cluster.topology_kind(), TopologyKind::Unknown);
    assert!(error_keys(&cluster).contains(&codes::ERR_SPLIT_PRIMARY.to_string()));
    assert!(fleet.calls().is_empty());
}

#[tokio::test]
async fn failover_limit_reached() {
    let dir = tempfile::tempdir().unwrap();
    StateStore::new(dir.path(), "c1")
        .save(&PersistedState {
            sla: Sla::new(chrono::Utc::now().timestamp()),
            failover_ctr: 2,
            last_failover: None,
            last_promotion: None,
            conditions: ConditionMap::new(),
            crashes: Vec::new(),
        })
        .unwrap();

    let fleet = fleet(2);
    let mut config = config(3);
    config.failover_limit = 2;
    let cluster = Cluster::new("c1", config, fleet.clone(), SupervisorContext::with_datadir(dir.path())).unwrap();
    cluster.tick_once().await;
    kill_primary(&cluster, &fleet).await;

    let err = cluster.failover(true).await.unwrap_err();
    assert_eq!(err.stage, FailoverStage::LimitCheck);
    assert!(matches!(err.kind, FailoverErrorKind::RateLimited(_)));
    assert!(err.is_precondition());

    cluster.tick_once().await;
    assert!(error_keys(&cluster).contains(&codes::ERR_FAILOVER_LIMIT.to_string()));
    assert_eq!(cluster.failover_counter(), 2);
    assert!(!fleet.calls().iter().any(|c| c.starts_with("stop_replication")));
}

#[tokio::test]
async fn second_failover_too_soon() {
    let fleet = fleet(2);
    let mut config = config(3);
    config.failover_time_limit = 3600;
    let cluster = Cluster::new("c1", config, fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    kill_primary(&cluster, &fleet).await;
    cluster.failover(true).await.unwrap();

    // 新主库随即宕机
    fleet.kill("db2:3306");
    cluster.tick_once().await;
    cluster.tick_once().await;
    cluster.tick_once().await;
    let err = cluster.failover(true).await.unwrap_err();
    assert_eq!(err.stage, FailoverStage::LimitCheck);
    assert!(matches!(err.kind, FailoverErrorKind::RateLimited(_)));
}

struct Denying;

#[async_trait]
impl Arbitrator for Denying {
    async fn fetch_peer(&self, peer: &str) -> Result<HeartbeatRecord, ArbitrationError> {
        Err(ArbitrationError::Transport(peer.to_string(), "refused".to_string()))
    }

    async fn report(&self, _heartbeat: &HeartbeatRecord) -> Result<(), ArbitrationError> {
        Ok(())
    }

    async fn request_election(
        &self,
        _request: &ArbitrationRequest,
    ) -> Result<ArbitrationResponse, ArbitrationError> {
        Ok(ArbitrationResponse {
            grant: false,
            reason: "another supervisor holds the election".to_string(),
        })
    }
}

#[tokio::test]
async fn arbitrator_denies_failover() {
    let arbitration = ArbitrationConfig {
        enabled: true,
        ..Default::default()
    };
    let ctx = Arc::new(SupervisorContext::new(arbitration, Some(Arc::new(Denying)), None));
    let fleet = fleet(2);
    let cluster = Cluster::new("c1", config(3), fleet.clone(), ctx).unwrap();
    cluster.tick_once().await;
    kill_primary(&cluster, &fleet).await;

    let err = cluster.failover(true).await.unwrap_err();
    assert_eq!(err.stage, FailoverStage::Arbitration);
    assert!(matches!(err.kind, FailoverErrorKind::SplitBrain(_)));

    let report = cluster.tick_once().await;
    assert!(!report.skipped);
    assert!(report
        .delta
        .opened
        .iter()
        .any(|(k, _)| k == codes::ERR_SPLIT_BRAIN_AVOIDED));
    assert!(!fleet.calls().iter().any(|c| c.starts_with("stop_replication")));
    assert_eq!(fleet.get("db2:3306").unwrap().source, Some(HostPort::new("db1", 3306)));
}

#[tokio::test]
async fn partial_repoint() {
    let fleet = fleet(3);
    fleet.with("db4:3306", |s| s.fail_change_source = true);
    let cluster = Cluster::new("c1", config(4), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;

    let report = cluster.switchover(Some("S2".to_string()), true).await.unwrap();
    assert!(report.success);
    assert!(report.partial);
    assert_eq!(report.failed_replicas, vec!["S4".to_string()]);
    assert!(report.repointed.contains(&"S3".to_string()));
    assert_eq!(fleet.get("db3:3306").unwrap().source, Some(HostPort::new("db2", 3306)));

    let tick = cluster.tick_once().await;
    let key = format!("{}S4", codes::ERR_REPLICA_REPOINT_PREFIX);
    assert_eq!(key, "ERR_REPLICA_REPOINT_S4");
    assert!(tick.delta.opened.iter().any(|(k, _)| *k == key));

    // 直到 S4 指向新主库之前一直保持
    cluster.tick_once().await;
    assert!(error_keys(&cluster).contains(&key));
}

#[tokio::test]
async fn switchover_rejected_while_failover_runs() {
    let fleet = fleet(1);
    let cluster = Cluster::new("c1", config(2), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    let _guard = cluster.gate().enter_failover().unwrap();
    let err = cluster.switchover(None, true).await.unwrap_err();
    assert_eq!(err.kind, FailoverErrorKind::AlreadyInProgress);
    assert!(fleet.calls().is_empty());
}

#[tokio::test]
async fn switchover_repoints_replica_using_source_alias() {
    let fleet = fleet(2);
    fleet.add_alias("10.0.0.1:3306", "db1:3306");
    fleet.with("db3:3306", |s| s.source = HostPort::parse("10.0.0.1:3306").ok());
    let cluster = Cluster::new("c1", config(3), fleet.clone(), SupervisorContext::standalone()).unwrap();
    let report = cluster.tick_once().await;
    assert!(!report.delta.opened.iter().any(|(k, _)| k == codes::WARN_WRONG_SOURCE));
    assert!(cluster.is_slave("db3", 3306));

    let report = cluster.switchover(Some("db2:3306".to_string()), true).await.unwrap();
    assert!(!report.partial);
    assert!(report.repointed.contains(&"S3".to_string()));
    assert_eq!(fleet.get("db3:3306").unwrap().source, Some(HostPort::new("db2", 3306)));

    let report = cluster.tick_once().await;
    assert!(!report.delta.opened.iter().any(|(k, _)| k == codes::WARN_WRONG_SOURCE));
    assert_eq!(cluster.primary().unwrap().name, "S2");
}

#[tokio::test]
async fn failed_demote_leaves_old_primary_unlocked_and_read_only() {
    let fleet = fleet(2);
    let cluster = Cluster::new("c1", config(3), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    fleet.with("db1:3306", |s| s.fail_change_source = true);

    let report = cluster.switchover(Some("db2:3306".to_string()), true).await.unwrap();
    assert!(report.partial);
    assert_eq!(report.failed_replicas, vec!["S1".to_string()]);
    assert_eq!(report.old_primary_role, ServerRole::Unknown);

    let s1 = fleet.get("db1:3306").unwrap();
    assert!(!s1.frozen);
    assert!(s1.read_only);
    assert!(s1.source.is_none());
    assert!(!cluster.gate().in_failover());
}

#[tokio::test]
async fn failable_uptime_stops_while_replica_lags() {
    let fleet = fleet(1);
    let mut config = config(2);
    config.failover_max_slave_delay = 30;
    let cluster = Cluster::new("c1", config, fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    cluster.tick_once().await;
    let healthy = cluster.sla(chrono::Utc::now().timestamp()).counters;
    assert!(healthy.uptime >= 1);
    assert_eq!(healthy.uptime_failable, healthy.uptime);

    fleet.with("db2:3306", |s| s.lag = 60);
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    cluster.tick_once().await;
    let lagging = cluster.sla(chrono::Utc::now().timestamp()).counters;
    assert!(lagging.uptime > healthy.uptime);
    assert_eq!(lagging.uptime_failable, healthy.uptime_failable);
}

#[tokio::test]
async fn tick_yields_to_switchover_started_mid_tick() {
    let fleet = fleet(1);
    let cluster = Cluster::new("c1", config(2), fleet.clone(), SupervisorContext::standalone()).unwrap();
    cluster.tick_once().await;
    assert_eq!(cluster.server("S1").unwrap().state, ServerState::Primary);

    let permits = fleet.pause_probes();
    fleet.kill("db1:3306");
    let tick = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.tick_once().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let guard = cluster.gate().enter_failover().unwrap();
    permits.add_permits(8);

    let report = tick.await.unwrap();
    assert!(report.skipped);
    assert_eq!(cluster.server("S1").unwrap().state, ServerState::Primary);
    drop(guard);
}
