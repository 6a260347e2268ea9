//! 故障转移引擎
//!
//! 切换(switchover)与故障转移(failover)共用同一条分阶段流水线:
//!
//! 1. **Gate**: CAS 获取 `in_failover`
//! 2. **LimitCheck**: 次数上限与最短间隔(仅故障转移)
//! 3. **ReplicationCheck**: 主库状态、过滤规则一致性、复制线程状态
//! 4. **Arbitration / Election**: 外部仲裁授权,候选排序
//! 5. **SyncWait**: 切换时冻结写入并等待候选追平;故障转移时等待 relay log 回放
//! 6. **Promote**: 停止复制、清除复制配置、关闭只读
//! 7. **Repoint**: 其余从库逐个指向新主库,失败只记录
//! 8. **OldPrimary**: 切换时旧主库降为从库,故障转移时标记为 Failed
//! 9. **Record**: 计数、时间戳、crash 记录与代理通知
//!
//! 第 6 阶段之前的失败不改变拓扑;之后的失败作为部分成功返回。
//! 引擎运行在独立任务中,调用方中途放弃也不会打断。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use repman_common::{ClusterConfig, HostPort, ReplicationPosition};

use crate::arbitrator::ArbitrationRequest;
use crate::cluster::{Cluster, PendingRepoint};
use crate::detector::PrimaryHealth;
use crate::driver::{ReplicationFilters, SourceSpec};
use crate::error::{FailoverError, FailoverErrorKind, FailoverResult, FailoverStage, ProbeError};
use crate::gate::Action;
use crate::persist::Crash;
use crate::server::{Server, ServerRole, ServerState};
use crate::state::{codes, Condition};

/// 提升方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionKind {
    Switchover,
    Failover,
}

impl PromotionKind {
    fn action(&self) -> Action {
        match self {
            PromotionKind::Switchover => Action::Switchover,
            PromotionKind::Failover => Action::Failover,
        }
    }
}

/// 引擎结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverReport {
    pub kind: PromotionKind,
    pub success: bool,
    /// 新主库已生效但有从库未能重指向
    pub partial: bool,
    pub stage_reached: u8,
    pub old_primary: Option<String>,
    pub new_primary: Option<String>,
    pub old_primary_role: ServerRole,
    /// 未能重指向的节点名称
    pub failed_replicas: Vec<String>,
    pub repointed: Vec<String>,
}

/// 候选主库
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub name: String,
    pub addr: HostPort,
    pub preferred: bool,
    pub position: ReplicationPosition,
    pub lag: u64,
}

/// 候选排序: 优先主库 > 位点更靠前 > 延迟更小 > URL 字典序
pub fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.preferred
            .cmp(&a.preferred)
            .then_with(|| b.position.compare_advance(&a.position))
            .then_with(|| a.lag.cmp(&b.lag))
            .then_with(|| a.url.cmp(&b.url))
    });
}

/// 在独立任务中运行引擎并等待结果
pub(crate) async fn spawn(
    cluster: Arc<Cluster>,
    kind: PromotionKind,
    prefmaster: Option<String>,
    permitted: bool,
) -> FailoverResult<FailoverReport> {
    let handle = tokio::spawn(async move {
        let engine = Engine {
            cluster: &cluster,
            kind,
            config: &cluster.config,
        };
        engine.run(prefmaster, permitted).await
    });
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(FailoverError::new(
            FailoverStage::Gate,
            FailoverErrorKind::StepFailed(format!("engine task aborted: {}", e)),
        )),
    }
}

/// 进入引擎时的主库信息
struct PrimaryInfo {
    url: String,
    name: String,
    addr: HostPort,
    position: ReplicationPosition,
    filters: Option<ReplicationFilters>,
}

struct Engine<'a> {
    cluster: &'a Arc<Cluster>,
    kind: PromotionKind,
    config: &'a ClusterConfig,
}

impl Engine<'_> {
    async fn run(&self, prefmaster: Option<String>, permitted: bool) -> FailoverResult<FailoverReport> {
        let cluster = self.cluster;

        // 1. gate: 已有动作在跑时立即拒绝,拿到锁后再判定一次
        let gate_check = || {
            cluster
                .gate
                .check(self.kind.action(), &cluster.gate_context(permitted))
                .map_err(|r| fail(FailoverStage::Gate, r.into()))
        };
        gate_check()?;
        let _serial = cluster.gate.serialize().await;
        gate_check()?;
        let _flag = cluster
            .gate
            .enter_failover()
            .map_err(|r| fail(FailoverStage::Gate, r.into()))?;
        cluster.log(format!("{:?} started", self.kind));

        let now = chrono::Utc::now().timestamp();
        let (servers, primary_url, primary_health) = {
            let state = cluster.state.read();
            (
                state.servers.values().cloned().collect::<Vec<Server>>(),
                state.classification.primary.clone(),
                state.primary_health,
            )
        };

        // 2. limits
        if self.kind == PromotionKind::Failover {
            self.check_limits(now)?;
        }

        // 3. primary and replication state
        let primary = self.check_primary(&servers, primary_url.as_deref(), primary_health, prefmaster.as_deref())?;
        let replicas: Vec<&Server> = servers
            .iter()
            .filter(|s| s.url != primary.url && matches!(s.role, ServerRole::Replica | ServerRole::Relay))
            .collect();
        self.check_replication(&primary, &replicas, now)?;

        // 4. arbitration then election
        if self.kind == PromotionKind::Failover {
            self.arbitrate().await?;
        }
        let candidate = self.elect(&primary, &replicas, prefmaster.as_deref())?;
        info!(cluster = %cluster.name, candidate = %candidate.url, "Elected new primary");

        // 5. sync
        self.sync_wait(&primary, &candidate).await?;

        // 6. promote
        self.promote(&primary, &candidate).await?;
        let promoted_at = chrono::Utc::now().timestamp();
        cluster.state.write().last_promotion = Some(promoted_at);
        cluster.log(format!("Server {} promoted to primary", candidate.name));

        // 7. repoint
        let mut report = FailoverReport {
            kind: self.kind,
            success: true,
            partial: false,
            stage_reached: FailoverStage::Promote.number(),
            old_primary: Some(primary.url.clone()),
            new_primary: Some(candidate.url.clone()),
            old_primary_role: ServerRole::Unknown,
            failed_replicas: Vec::new(),
            repointed: Vec::new(),
        };
        let source = self.source_spec(&candidate, &servers);
        let known: Vec<(&str, Option<u32>)> = servers.iter().map(|s| (s.url.as_str(), s.server_id())).collect();
        for replica in replicas.iter().filter(|r| r.url != candidate.url) {
            if replica.resolved_source(known.iter().copied()).as_deref() != Some(primary.url.as_str()) {
                continue;
            }
            match self.repoint(replica, &source).await {
                Ok(()) => report.repointed.push(replica.name.clone()),
                Err(reason) => {
                    self.repoint_failed(replica, &candidate, &reason);
                    report.failed_replicas.push(replica.name.clone());
                }
            }
        }
        report.stage_reached = FailoverStage::Repoint.number();

        // 8. old primary
        report.old_primary_role = match self.kind {
            PromotionKind::Switchover => {
                let old = servers.iter().find(|s| s.url == primary.url);
                match self.demote(&primary, &source).await {
                    Ok(()) => {
                        report.repointed.push(primary.name.clone());
                        ServerRole::Replica
                    }
                    Err(reason) => {
                        if let Some(old) = old {
                            self.repoint_failed(old, &candidate, &reason);
                        }
                        report.failed_replicas.push(primary.name.clone());
                        ServerRole::Unknown
                    }
                }
            }
            PromotionKind::Failover => ServerRole::Failed,
        };
        report.stage_reached = FailoverStage::OldPrimary.number();

        // 9. record
        self.record(&primary, &candidate, &servers, promoted_at);
        report.partial = !report.failed_replicas.is_empty();
        report.stage_reached = FailoverStage::Record.number();

        let timeout = self.config.step_timeout();
        cluster.proxies.set_primary(&candidate.addr, timeout).await;
        cluster.proxies.notify(&cluster.topology_change(), timeout).await;

        if report.partial {
            warn!(cluster = %cluster.name, failed = ?report.failed_replicas, "Promotion finished with replicas not re-pointed");
        }
        Ok(report)
    }

    fn check_limits(&self, now: i64) -> FailoverResult<()> {
        let (ctr, last) = {
            let state = self.cluster.state.read();
            (state.failover_ctr, state.last_failover)
        };
        let limit = self.config.failover_limit;
        if limit > 0 && ctr >= limit {
            let reason = format!("{} failovers already done, limit is {}", ctr, limit);
            self.cluster.add_condition(
                codes::ERR_FAILOVER_LIMIT,
                Condition::error("failover", format!("Failover limit reached: {}", reason)),
            );
            return Err(fail(FailoverStage::LimitCheck, FailoverErrorKind::RateLimited(reason)));
        }
        let min_interval = self.config.failover_time_limit as i64;
        if let Some(last) = last {
            if min_interval > 0 && now - last < min_interval {
                let reason = format!("last failover {}s ago, minimum is {}s", now - last, min_interval);
                self.cluster.add_condition(
                    codes::ERR_FAILOVER_TOO_SOON,
                    Condition::error("failover", format!("Time between failovers too short: {}", reason)),
                );
                return Err(fail(FailoverStage::LimitCheck, FailoverErrorKind::RateLimited(reason)));
            }
        }
        Ok(())
    }

    fn check_primary(
        &self,
        servers: &[Server],
        primary_url: Option<&str>,
        health: PrimaryHealth,
        prefmaster: Option<&str>,
    ) -> FailoverResult<PrimaryInfo> {
        let stage = FailoverStage::ReplicationCheck;
        let primary = primary_url
            .and_then(|url| servers.iter().find(|s| s.url == url))
            .ok_or_else(|| fail(stage, FailoverErrorKind::NoPrimary))?;
        match self.kind {
            PromotionKind::Switchover => {
                if health != PrimaryHealth::Healthy || !primary.is_reachable() {
                    return Err(fail(stage, FailoverErrorKind::PrimaryNotHealthy(primary.url.clone())));
                }
            }
            PromotionKind::Failover => {
                if primary.state != ServerState::Failed {
                    return Err(fail(stage, FailoverErrorKind::PrimaryNotFailed(primary.url.clone())));
                }
                if prefmaster.is_some() {
                    warn!(cluster = %self.cluster.name, "Preferred server ignored for failover");
                }
            }
        }
        let snapshot = primary.snapshot.as_ref();
        Ok(PrimaryInfo {
            url: primary.url.clone(),
            name: primary.name.clone(),
            addr: primary.addr.clone(),
            position: snapshot.map(|s| s.primary_position()).unwrap_or_default(),
            filters: snapshot.map(|s| s.filters.clone()),
        })
    }

    /// 参照过滤规则: 主库的,主库不可达时取第一个可达从库的
    fn reference_filters(&self, primary: &PrimaryInfo, replicas: &[&Server]) -> Option<ReplicationFilters> {
        match self.kind {
            PromotionKind::Switchover => primary.filters.clone(),
            PromotionKind::Failover => replicas
                .iter()
                .find(|r| r.is_reachable() && !r.ignored && !r.maintenance)
                .and_then(|r| r.snapshot.as_ref())
                .map(|s| s.filters.clone()),
        }
    }

    fn check_replication(&self, primary: &PrimaryInfo, replicas: &[&Server], now: i64) -> FailoverResult<()> {
        let stage = FailoverStage::ReplicationCheck;
        let active: Vec<&&Server> = replicas
            .iter()
            .filter(|r| r.is_reachable() && !r.ignored && !r.maintenance)
            .collect();

        if self.config.check_replication_filters {
            if let Some(reference) = self.reference_filters(primary, replicas) {
                for replica in &active {
                    let differs = replica
                        .snapshot
                        .as_ref()
                        .map(|s| s.filters != reference)
                        .unwrap_or(false);
                    if differs {
                        return Err(fail(
                            stage,
                            FailoverErrorKind::ReplicationFilterMismatch(replica.url.clone()),
                        ));
                    }
                }
            }
        }

        if self.config.check_replication_state {
            let window = 2 * self.config.monitoring_ticker as i64;
            for replica in &active {
                let recent = replica
                    .last_replication_ok
                    .map(|t| now - t <= window)
                    .unwrap_or(false);
                if !recent {
                    return Err(fail(stage, FailoverErrorKind::ReplicationStopped(replica.url.clone())));
                }
            }
        }
        Ok(())
    }

    async fn arbitrate(&self) -> FailoverResult<()> {
        let cluster = self.cluster;
        let ctx = &cluster.ctx;
        if !ctx.arbitration.enabled {
            return Ok(());
        }
        let Some(arbitrator) = ctx.arbitrator.clone() else {
            return Ok(());
        };
        let request = ArbitrationRequest {
            uuid: ctx.uuid.clone(),
            cluster: cluster.name.clone(),
            secret: ctx.arbitration.secret.clone(),
            proposed_action: "failover".to_string(),
        };
        let answer = tokio::time::timeout(self.config.step_timeout(), arbitrator.request_election(&request)).await;
        let reason = match answer {
            Ok(Ok(response)) if response.grant => {
                info!(cluster = %cluster.name, "Arbitrator granted the election");
                return Ok(());
            }
            Ok(Ok(response)) => response.reason,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "arbitrator timed out".to_string(),
        };
        warn!(cluster = %cluster.name, "Election denied: {}", reason);
        cluster.open_split_brain_avoided(&reason);
        Err(fail(FailoverStage::Arbitration, FailoverErrorKind::SplitBrain(reason)))
    }

    fn elect(&self, primary: &PrimaryInfo, replicas: &[&Server], prefmaster: Option<&str>) -> FailoverResult<Candidate> {
        let stage = FailoverStage::Election;
        let reference = self.reference_filters(primary, replicas);
        let at_sync = match self.kind {
            PromotionKind::Switchover => self.config.switchover_at_sync,
            PromotionKind::Failover => self.config.failover_at_sync,
        };

        let mut candidates: Vec<Candidate> = replicas
            .iter()
            .filter(|r| r.is_reachable() && !r.ignored && !r.maintenance && r.role == ServerRole::Replica)
            .filter_map(|r| {
                let snapshot = r.snapshot.as_ref()?;
                if let Some(reference) = &reference {
                    if &snapshot.filters != reference {
                        return None;
                    }
                }
                if self.config.check_replication_state && snapshot.delay() > self.config.failover_max_slave_delay {
                    return None;
                }
                if at_sync && !snapshot.semisync_replica_active {
                    return None;
                }
                let position = match self.kind {
                    PromotionKind::Switchover => snapshot.executed_position(),
                    PromotionKind::Failover => snapshot.retrieved_position(),
                };
                Some(Candidate {
                    url: r.url.clone(),
                    name: r.name.clone(),
                    addr: r.addr.clone(),
                    preferred: r.preferred,
                    position,
                    lag: snapshot.delay(),
                })
            })
            .collect();

        if let Some(wanted) = prefmaster.filter(|_| self.kind == PromotionKind::Switchover) {
            let wanted_url = HostPort::parse(wanted).map(|h| h.url()).ok();
            return candidates
                .into_iter()
                .find(|c| c.name == wanted || Some(&c.url) == wanted_url.as_ref())
                .ok_or_else(|| fail(stage, FailoverErrorKind::CandidateNotElectable(wanted.to_string())));
        }

        order_candidates(&mut candidates);
        match candidates.into_iter().next() {
            Some(c) => Ok(c),
            None => {
                self.cluster.add_condition(
                    codes::ERR_NO_CANDIDATE,
                    Condition::error("failover", "No candidate found in replica list"),
                );
                Err(fail(stage, FailoverErrorKind::NoCandidate))
            }
        }
    }

    async fn sync_wait(&self, primary: &PrimaryInfo, candidate: &Candidate) -> FailoverResult<()> {
        let stage = FailoverStage::SyncWait;
        let driver = &self.cluster.driver;
        match self.kind {
            PromotionKind::Switchover => {
                let threshold = self.config.switchover_wait_write_query;
                let writes = self
                    .step(driver.long_running_writes(&primary.addr, threshold))
                    .await
                    .map_err(|e| fail(stage, FailoverErrorKind::StepFailed(e)))?;
                if writes > 0 {
                    return Err(fail(
                        stage,
                        FailoverErrorKind::WriteDrainTimeout(format!(
                            "{} writes running longer than {}s on {}",
                            writes, threshold, primary.url
                        )),
                    ));
                }

                let wait_trx = Duration::from_secs(self.config.switchover_wait_trx.max(1));
                if let Err(e) = self.step(driver.set_read_only(&primary.addr, true)).await {
                    self.release_primary(primary).await;
                    return Err(fail(stage, FailoverErrorKind::StepFailed(e)));
                }
                if let Err(e) = self.step(driver.freeze(&primary.addr, wait_trx)).await {
                    self.release_primary(primary).await;
                    return Err(fail(stage, FailoverErrorKind::WriteDrainTimeout(e)));
                }

                let target = match self.step(driver.probe(&primary.addr, self.config.connect_timeout())).await {
                    Ok(snapshot) => snapshot.primary_position(),
                    Err(e) => {
                        self.release_primary(primary).await;
                        return Err(fail(stage, FailoverErrorKind::StepFailed(e)));
                    }
                };
                let reached = self
                    .bounded(wait_trx, driver.wait_for_position(&candidate.addr, &target, wait_trx))
                    .await;
                match reached {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        self.release_primary(primary).await;
                        Err(fail(
                            stage,
                            FailoverErrorKind::CandidateUnsynced(format!(
                                "{} did not reach {} within {}s",
                                candidate.url,
                                target.gtid,
                                wait_trx.as_secs()
                            )),
                        ))
                    }
                    Err(e) => {
                        self.release_primary(primary).await;
                        Err(fail(stage, FailoverErrorKind::StepFailed(e)))
                    }
                }
            }
            PromotionKind::Failover => {
                let relay_wait = Duration::from_secs(self.config.failover_relay_wait.max(1));
                let reached = self
                    .bounded(
                        relay_wait,
                        driver.wait_for_position(&candidate.addr, &candidate.position, relay_wait),
                    )
                    .await
                    .unwrap_or(false);
                let caught_up = reached && candidate.position.compare_advance(&primary.position) != Ordering::Less;
                if caught_up {
                    return Ok(());
                }
                let reason = format!("{} may miss transactions from {}", candidate.url, primary.url);
                if self.config.failover_at_sync {
                    return Err(fail(stage, FailoverErrorKind::CandidateUnsynced(reason)));
                }
                warn!(cluster = %self.cluster.name, "Promoting anyway: {}", reason);
                Ok(())
            }
        }
    }

    async fn promote(&self, primary: &PrimaryInfo, candidate: &Candidate) -> FailoverResult<()> {
        let stage = FailoverStage::Promote;
        let driver = &self.cluster.driver;
        let addr = &candidate.addr;

        if let Err(e) = self.step(driver.stop_replication(addr)).await {
            self.rollback_switchover(primary).await;
            return Err(fail(stage, FailoverErrorKind::StepFailed(e)));
        }
        if let Err(e) = self.step(driver.reset_replication(addr)).await {
            if let Err(e) = self.step(driver.start_replication(addr)).await {
                error!(server = %addr, "Could not restart replication during rollback: {}", e);
            }
            self.rollback_switchover(primary).await;
            return Err(fail(stage, FailoverErrorKind::StepFailed(e)));
        }
        if let Err(e) = self.step(driver.set_read_only(addr, false)).await {
            if self.kind == PromotionKind::Switchover {
                let (user, password) = self.config.replication_credentials();
                let back = SourceSpec {
                    source: primary.addr.clone(),
                    user,
                    password,
                    use_gtid: true,
                    connect_retry: self.config.replication_master_connect_retry,
                    coords: None,
                };
                if self.step(driver.change_source(addr, &back)).await.is_ok() {
                    let _ = self.step(driver.start_replication(addr)).await;
                }
            }
            self.rollback_switchover(primary).await;
            return Err(fail(stage, FailoverErrorKind::StepFailed(e)));
        }
        Ok(())
    }

    async fn repoint(&self, replica: &Server, source: &SourceSpec) -> Result<(), String> {
        let driver = &self.cluster.driver;
        if !replica.is_reachable() {
            return Err("server unreachable".to_string());
        }
        self.step(driver.stop_replication(&replica.addr)).await?;
        self.step(driver.change_source(&replica.addr, source)).await?;
        if self.config.failover_readonly_state {
            self.step(driver.set_read_only(&replica.addr, true)).await?;
        }
        self.step(driver.start_replication(&replica.addr)).await?;
        info!(cluster = %self.cluster.name, server = %replica.url, "Re-pointed to {}", source.source);
        Ok(())
    }

    /// 切换时把旧主库降为新主库的从库
    async fn demote(&self, primary: &PrimaryInfo, source: &SourceSpec) -> Result<(), String> {
        let driver = &self.cluster.driver;
        // 旧主库先保持只读再解冻,后续步骤失败也不会留下冻结的节点
        let read_only = self.step(driver.set_read_only(&primary.addr, true)).await;
        if let Err(e) = self.step(driver.unfreeze(&primary.addr)).await {
            error!(server = %primary.url, "Unfreeze of old primary failed: {}", e);
        }
        read_only?;
        self.step(driver.change_source(&primary.addr, source)).await?;
        self.step(driver.start_replication(&primary.addr)).await?;
        self.cluster
            .log(format!("Old primary {} now replicates from {}", primary.name, source.source));
        Ok(())
    }

    fn repoint_failed(&self, replica: &Server, candidate: &Candidate, reason: &str) {
        warn!(cluster = %self.cluster.name, server = %replica.url, "Re-point failed: {}", reason);
        let key = replica.key_name();
        {
            let mut state = self.cluster.state.write();
            state.pending_repoints.insert(
                replica.url.clone(),
                PendingRepoint {
                    key: key.clone(),
                    new_primary: candidate.url.clone(),
                    reason: reason.to_string(),
                },
            );
        }
        self.cluster.add_condition(
            &format!("{}{}", codes::ERR_REPLICA_REPOINT_PREFIX, key),
            Condition::error(
                "failover",
                format!("{} not re-pointed to {}: {}", replica.url, candidate.url, reason),
            )
            .on_server(&replica.url),
        );
    }

    fn source_spec(&self, candidate: &Candidate, servers: &[Server]) -> SourceSpec {
        let (user, password) = self.config.replication_credentials();
        let snapshot = servers
            .iter()
            .find(|s| s.url == candidate.url)
            .and_then(|s| s.snapshot.as_ref());
        let use_gtid = snapshot
            .map(|s| {
                s.replication.as_ref().map(|r| r.using_gtid).unwrap_or(false) || !s.binlog_gtid.is_empty()
            })
            .unwrap_or(false);
        SourceSpec {
            source: candidate.addr.clone(),
            user,
            password,
            use_gtid,
            connect_retry: self.config.replication_master_connect_retry,
            coords: snapshot.and_then(|s| s.binlog_coords.clone()),
        }
    }

    fn record(&self, primary: &PrimaryInfo, candidate: &Candidate, servers: &[Server], now: i64) {
        let cluster = self.cluster;
        let old_snapshot = servers
            .iter()
            .find(|s| s.url == primary.url)
            .and_then(|s| s.snapshot.as_ref());
        {
            let mut state = cluster.state.write();
            if self.kind == PromotionKind::Failover {
                state.failover_ctr += 1;
                state.last_failover = Some(now);
                state.crashes.push(Crash {
                    old_primary_url: primary.url.clone(),
                    old_primary_gtid: old_snapshot.map(|s| s.binlog_gtid.to_string()).unwrap_or_default(),
                    old_primary_coords: old_snapshot
                        .and_then(|s| s.binlog_coords.as_ref())
                        .map(|c| c.to_string()),
                    elected_primary_url: candidate.url.clone(),
                    unixtime: now,
                });
                if let Some(old) = state.servers.get_mut(&primary.url) {
                    old.set_state(ServerState::Failed);
                    old.role = ServerRole::Failed;
                }
            }
            if let Some(new) = state.servers.get_mut(&candidate.url) {
                new.set_state(ServerState::Primary);
                new.role = ServerRole::Primary;
            }
            state.classification.primary = Some(candidate.url.clone());
            state.last_primary = Some(candidate.url.clone());
            state.primary_health = PrimaryHealth::Healthy;
            state.sm.add(
                codes::INFO_FAILOVER_COMPLETE,
                Condition::warning(
                    "failover",
                    format!("{:?} complete: {} -> {}", self.kind, primary.name, candidate.name),
                ),
            );
        }
        cluster.log(format!(
            "{:?} complete, primary moved from {} to {}",
            self.kind, primary.name, candidate.name
        ));
        if let Err(e) = cluster.persist() {
            cluster.warn_persist_failure(&e);
        }
    }

    /// 解除旧主库的冻结并恢复可写
    async fn release_primary(&self, primary: &PrimaryInfo) {
        let driver = &self.cluster.driver;
        if let Err(e) = self.step(driver.unfreeze(&primary.addr)).await {
            error!(server = %primary.url, "Rollback unfreeze failed: {}", e);
        }
        if let Err(e) = self.step(driver.set_read_only(&primary.addr, false)).await {
            error!(server = %primary.url, "Rollback set writable failed: {}", e);
        }
        self.cluster.log(format!("Rolled back: {} writable again", primary.name));
    }

    async fn rollback_switchover(&self, primary: &PrimaryInfo) {
        if self.kind == PromotionKind::Switchover {
            self.release_primary(primary).await;
        }
    }

    /// 以 step-timeout 为上限执行一个驱动调用
    async fn step<T, F>(&self, call: F) -> Result<T, String>
    where
        F: Future<Output = Result<T, ProbeError>>,
    {
        self.bounded(self.config.step_timeout(), call).await
    }

    async fn bounded<T, F>(&self, limit: Duration, call: F) -> Result<T, String>
    where
        F: Future<Output = Result<T, ProbeError>>,
    {
        // 驱动自身的等待之外再留出一个 step-timeout
        match tokio::time::timeout(limit + self.config.step_timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
        }
    }
}

fn fail(stage: FailoverStage, kind: FailoverErrorKind) -> FailoverError {
    FailoverError::new(stage, kind)
}
