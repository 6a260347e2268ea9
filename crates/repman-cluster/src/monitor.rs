//! 集群监控循环
//!
//! 每个集群一个长期任务,按 `monitoring-ticker` 周期执行串行流水线:
//! 1. 并发探测所有节点,每个探测有独立超时
//! 2. 拓扑识别
//! 3. 故障检测(必要时对主库做 TCP ping)
//! 4. 重建条件表、推进 SLA、计算 OPENED/RESOLV 差异并持久化
//! 5. 自动模式下主库确认故障时进入故障转移引擎
//!
//! 相邻两次 tick 不会重叠;停止信号在阶段之间检查。

use futures::future::join_all;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use repman_common::{FailoverMode, HostPort};

use crate::arbitrator::SupervisorStatus;
use crate::cluster::{Cluster, ClusterState};
use crate::detector::{Detection, PrimaryHealth};
use crate::driver::ServerSnapshot;
use crate::error::{FailoverResult, ProbeError};
use crate::failover::FailoverReport;
use crate::server::{ServerRole, ServerState};
use crate::state::{codes, Condition, SlaPredicates, StateDelta};
use crate::topology::{classify, resolve_source, ProbeInput, TopologyFlags};

/// 一次 tick 的结果
#[derive(Debug, Default)]
pub struct TickReport {
    /// 故障转移进行中或收到停止信号时跳过
    pub skipped: bool,
    pub delta: StateDelta,
    /// 自动故障转移的结果
    pub failover: Option<FailoverResult<FailoverReport>>,
}

/// 监控循环,直到收到停止信号
pub async fn run(cluster: Arc<Cluster>) {
    let mut stop = cluster.stop_signal();
    let mut interval = tokio::time::interval(cluster.config.ticker());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(cluster = %cluster.name, ticker = cluster.config.monitoring_ticker, "Cluster monitor started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = tick(&cluster).await;
                if let Some(Err(e)) = &report.failover {
                    warn!(cluster = %cluster.name, "Automatic failover did not run: {}", e);
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    cluster.disconnect_all().await;
    info!(cluster = %cluster.name, "Cluster monitor stopped");
}

fn failover_running(cluster: &Cluster) -> bool {
    let running = cluster.gate.in_failover();
    if running {
        debug!(cluster = %cluster.name, "Failover in progress, tick skipped");
    }
    running
}

/// 执行一次 tick
pub async fn tick(cluster: &Arc<Cluster>) -> TickReport {
    if cluster.is_stopping() {
        return TickReport { skipped: true, ..Default::default() };
    }
    if failover_running(cluster) {
        return TickReport { skipped: true, ..Default::default() };
    }

    // 1. 探测
    let targets: Vec<(String, HostPort)> = cluster
        .state
        .read()
        .servers
        .values()
        .map(|s| (s.url.clone(), s.addr.clone()))
        .collect();
    let timeout = cluster.config.connect_timeout();
    let probes = targets.into_iter().map(|(url, addr)| {
        let driver = cluster.driver.clone();
        async move {
            let outcome = match tokio::time::timeout(timeout, driver.probe(&addr, timeout)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProbeError::Timeout(timeout.as_secs())),
            };
            (url, outcome)
        }
    });
    let outcomes: Vec<(String, Result<ServerSnapshot, ProbeError>)> = join_all(probes).await;
    if cluster.is_stopping() {
        return TickReport { skipped: true, ..Default::default() };
    }

    let now = chrono::Utc::now().timestamp();

    // 2. 拓扑识别
    let flags = TopologyFlags::from(&cluster.config);
    let ping_target = {
        let mut state = cluster.state.write();
        // 探测期间开始的切换已经拿到了状态,不能被这次 tick 覆盖
        if failover_running(cluster) {
            return TickReport { skipped: true, ..Default::default() };
        }
        for (url, outcome) in &outcomes {
            if let Some(server) = state.servers.get_mut(url) {
                server.record_probe(outcome, now);
            }
        }
        let inputs: Vec<ProbeInput<'_>> = state
            .servers
            .values()
            .map(|s| ProbeInput {
                url: &s.url,
                snapshot: if s.is_reachable() { s.snapshot.as_ref() } else { None },
                maintenance: s.maintenance,
            })
            .collect();
        let classification = classify(&inputs, &flags, state.last_primary.as_deref());
        let ping_target = cluster
            .detector
            .primary_needs_ping(&state.servers, &classification)
            .map(|s| s.addr.clone());
        state.classification = classification;
        ping_target
    };

    // 3. 故障检测
    let ping_ok = match ping_target {
        Some(addr) => {
            let ok = cluster.driver.tcp_ping(&addr, timeout).await;
            debug!(cluster = %cluster.name, server = %addr, ok, "Primary TCP ping");
            Some(ok)
        }
        None => None,
    };
    if cluster.is_stopping() {
        return TickReport { skipped: true, ..Default::default() };
    }

    // 4. 条件与 SLA
    let (delta, detection) = {
        let mut state = cluster.state.write();
        if failover_running(cluster) {
            return TickReport { skipped: true, ..Default::default() };
        }
        let detection = cluster.detector.evaluate(
            &state.servers,
            &state.classification,
            ping_ok,
            state.last_promotion,
            now,
        );
        apply_detection(&mut state, &detection);
        collect_conditions(cluster, &mut state, &detection);
        let predicates = sla_predicates(cluster, &state);
        state.sla.advance(now, predicates);
        state.primary_health = detection.primary;
        if let Some(primary) = &state.classification.primary {
            state.last_primary = Some(primary.clone());
        }
        let delta = state.sm.close_tick(&cluster.name);
        (delta, detection)
    };
    for line in delta.lines() {
        cluster.push_log(line);
    }
    if let Err(e) = cluster.persist() {
        cluster.warn_persist_failure(&e);
    }

    // 5. 自动故障转移
    let failover = if should_failover(cluster, &detection) {
        warn!(cluster = %cluster.name, "Primary failure confirmed, starting automatic failover");
        let result = cluster.failover(true).await;
        match &result {
            Ok(report) => info!(cluster = %cluster.name, new_primary = ?report.new_primary, "Automatic failover finished"),
            Err(e) => error!(cluster = %cluster.name, "Automatic failover failed: {}", e),
        }
        Some(result)
    } else {
        None
    };

    TickReport {
        skipped: false,
        delta,
        failover,
    }
}

fn should_failover(cluster: &Cluster, detection: &Detection) -> bool {
    if cluster.config.failover_mode != FailoverMode::Automatic || detection.primary != PrimaryHealth::Failed {
        return false;
    }
    let state = cluster.state.read();
    if !state.classification.split_primary.is_empty() {
        return false;
    }
    if cluster.ctx.status() == SupervisorStatus::Standby {
        debug!(cluster = %cluster.name, "Standby supervisor, automatic failover skipped");
        return false;
    }
    !cluster.ctx.split_brain()
}

fn apply_detection(state: &mut ClusterState, detection: &Detection) {
    let roles = state.classification.roles.clone();
    for (url, server) in state.servers.iter_mut() {
        if let Some(verdict) = detection.verdicts.get(url) {
            server.fail_count = verdict.fail_count;
            server.set_state(verdict.state);
        }
        server.role = match server.state {
            ServerState::Failed => ServerRole::Failed,
            _ => roles.get(url).copied().unwrap_or_default(),
        };
        if server.maintenance {
            server.set_state(ServerState::MaintenanceMode);
            server.role = ServerRole::Maintenance;
        }
    }
}

/// 根据识别与检测结果重建本次 tick 的条件
fn collect_conditions(cluster: &Cluster, state: &mut ClusterState, detection: &Detection) {
    let config = &cluster.config;
    let classification = state.classification.clone();
    let primary_url = classification.primary.clone();
    let primary_filters = primary_url
        .as_deref()
        .and_then(|p| state.servers.get(p))
        .filter(|s| s.is_reachable())
        .and_then(|s| s.snapshot.as_ref())
        .map(|s| s.filters.clone());
    let known: Vec<(String, Option<u32>)> = state.servers.values().map(|s| (s.url.clone(), s.server_id())).collect();
    let known_iter = || known.iter().map(|(u, id)| (u.as_str(), *id));
    let mut found: Vec<(&'static str, Condition)> = Vec::new();

    for server in state.servers.values() {
        let url = server.url.clone();
        if server.maintenance {
            found.push((
                codes::WARN_MAINTENANCE,
                Condition::warning("monitor", format!("Server {} in maintenance", url)).on_server(&url),
            ));
        }
        if let Some(err) = &server.last_error {
            let key = match err {
                ProbeError::Unreachable(_) | ProbeError::Timeout(_) => codes::ERR_UNREACHABLE,
                ProbeError::AuthFailure(_) => codes::ERR_ACCESS_DENIED,
                ProbeError::PermissionDenied(_) => codes::ERR_PERMISSION_DENIED,
                ProbeError::ProtocolError(_) => codes::ERR_PROTOCOL,
            };
            found.push((key, Condition::error("probe", format!("{}: {}", url, err)).on_server(&url)));
            continue;
        }
        if server.maintenance || server.ignored {
            continue;
        }
        let Some(snapshot) = &server.snapshot else { continue };
        let Some(repl) = &snapshot.replication else { continue };
        if !matches!(server.role, ServerRole::Replica | ServerRole::Relay) {
            continue;
        }
        if !repl.threads_running() {
            let detail = if !repl.last_sql_error.is_empty() {
                repl.last_sql_error.clone()
            } else if !repl.last_io_error.is_empty() {
                repl.last_io_error.clone()
            } else {
                "threads stopped".to_string()
            };
            found.push((
                codes::ERR_REPLICATION_STOPPED,
                Condition::error("monitor", format!("Replication not running on {}: {}", url, detail)).on_server(&url),
            ));
        }
        let delay = snapshot.delay();
        if delay > config.failover_max_slave_delay {
            found.push((
                codes::WARN_DELAY,
                Condition::warning("monitor", format!("{} delay {}s", url, delay)).on_server(&url),
            ));
        }
        if let Some(filters) = &primary_filters {
            if &snapshot.filters != filters {
                found.push((
                    codes::WARN_FILTERS,
                    Condition::warning("monitor", format!("{} replication filters differ from primary", url))
                        .on_server(&url),
                ));
            }
        }
        let source = resolve_source(&repl.source, repl.source_server_id, known_iter());
        let expected = primary_url.as_deref() == Some(source.as_str())
            || classification.relays.iter().any(|r| r == &source)
            || classification.primaries.iter().any(|p| p == &source);
        if !expected {
            found.push((
                codes::WARN_WRONG_SOURCE,
                Condition::warning("monitor", format!("{} replicates from {} instead of the primary", url, source))
                    .on_server(&url),
            ));
        }
    }

    if !classification.split_primary.is_empty() {
        found.push((
            codes::ERR_SPLIT_PRIMARY,
            Condition::error(
                "topology",
                format!("Several writable primaries: {}", classification.split_primary.join(", ")),
            ),
        ));
    } else if primary_url.is_none() && !classification.kind.is_multi_primary() {
        found.push((codes::ERR_NO_PRIMARY, Condition::error("topology", "No primary found in topology")));
    }

    let has_replica = state
        .servers
        .values()
        .any(|s| s.is_reachable() && matches!(s.role, ServerRole::Replica | ServerRole::Relay));
    if primary_url.is_some() && state.servers.len() > 1 && !has_replica && !classification.kind.is_multi_primary() {
        found.push((codes::ERR_NO_REPLICA, Condition::error("topology", "No replica found in topology")));
    }

    if let Some(primary) = &primary_url {
        if detection.primary == PrimaryHealth::Suspect {
            found.push((
                codes::WARN_PRIMARY_SUSPECT,
                Condition::warning("detector", format!("Primary {} is suspect", primary)).on_server(primary),
            ));
            if detection.false_positive {
                found.push((
                    codes::ERR_PRIMARY_FALSE_POSITIVE,
                    Condition::error(
                        "detector",
                        format!("Primary {} unreachable but replicas still connected", primary),
                    )
                    .on_server(primary),
                ));
            }
        }
    }

    if cluster.ctx.split_brain() {
        found.push((
            codes::ERR_SPLIT_BRAIN,
            Condition::error("arbitrator", "Peers unreachable and no arbitration grant"),
        ));
    }
    if cluster.ctx.status() == SupervisorStatus::Standby {
        found.push((codes::ERR_PASSIVE_MODE, Condition::warning("arbitrator", "Supervisor is standby")));
    }

    // 故障转移未能重指向的从库,直到复制源正确才解决
    let mut fixed = Vec::new();
    for (url, pending) in &state.pending_repoints {
        let repaired = state
            .servers
            .get(url)
            .filter(|s| s.is_reachable())
            .and_then(|s| {
                let running = s.snapshot.as_ref()?.replication.as_ref()?.threads_running();
                Some(running && s.resolved_source(known_iter()).as_deref() == Some(pending.new_primary.as_str()))
            })
            .unwrap_or(false);
        if repaired {
            fixed.push(url.clone());
        } else {
            let key = format!("{}{}", codes::ERR_REPLICA_REPOINT_PREFIX, pending.key);
            state.sm.add(
                &key,
                Condition::error("failover", format!("{} not re-pointed to {}: {}", url, pending.new_primary, pending.reason))
                    .on_server(url),
            );
        }
    }
    for url in fixed {
        state.pending_repoints.remove(&url);
    }

    for (key, condition) in found {
        state.sm.add(key, condition);
    }
}

fn sla_predicates(cluster: &Cluster, state: &ClusterState) -> SlaPredicates {
    let primary = state
        .classification
        .primary
        .as_deref()
        .and_then(|p| state.servers.get(p));
    let valid_primary = primary
        .map(|p| p.is_reachable() && !p.read_only() && !p.maintenance)
        .unwrap_or(false);
    let semisync = primary
        .and_then(|p| p.snapshot.as_ref())
        .map(|s| s.semisync_primary_active)
        .unwrap_or(false);
    let replicas: Vec<_> = state
        .servers
        .values()
        .filter(|s| s.is_reachable() && matches!(s.role, ServerRole::Replica | ServerRole::Relay))
        .collect();
    let max_delay = replicas.iter().map(|s| s.delay()).max().unwrap_or(0);
    SlaPredicates {
        valid_primary,
        semisync,
        not_delayed: max_delay <= cluster.config.failover_max_slave_delay,
        has_replica: !replicas.is_empty(),
    }
}
