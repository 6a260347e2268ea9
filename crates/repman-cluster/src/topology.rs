//! 拓扑识别模块
//!
//! 根据一组快照推导拓扑类型、主库与从库列表。纯函数,不修改任何状态:
//! - 非多主拓扑出现多个可写主库时返回 `Unknown` 并给出 split 列表
//! - 没有节点呈现为主库时,沿用上一次的主库(若其不可达)并标记为 Failed

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use repman_common::{ClusterConfig, HostPort};

use crate::driver::ServerSnapshot;
use crate::server::ServerRole;

/// 拓扑类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TopologyKind {
    MasterSlave,
    MasterSlaveNoGtid,
    MultiMaster,
    MultiTierSlave,
    MultiMasterRing,
    MultiMasterWsrep,
    BinlogServer,
    #[default]
    Unknown,
}

impl TopologyKind {
    /// 是否允许多个主库
    pub fn is_multi_primary(&self) -> bool {
        matches!(
            self,
            TopologyKind::MultiMaster | TopologyKind::MultiMasterRing | TopologyKind::MultiMasterWsrep
        )
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyKind::MasterSlave => "master-slave",
            TopologyKind::MasterSlaveNoGtid => "master-slave-no-gtid",
            TopologyKind::MultiMaster => "multi-master",
            TopologyKind::MultiTierSlave => "multi-tier-slave",
            TopologyKind::MultiMasterRing => "multi-master-ring",
            TopologyKind::MultiMasterWsrep => "multi-master-wsrep",
            TopologyKind::BinlogServer => "binlog-server",
            TopologyKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 识别开关,来自 `replication-multi-*` 配置
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyFlags {
    pub multi_master: bool,
    pub multi_tier_slave: bool,
    pub ring: bool,
    pub wsrep: bool,
}

impl From<&ClusterConfig> for TopologyFlags {
    fn from(c: &ClusterConfig) -> Self {
        Self {
            multi_master: c.replication_multi_master,
            multi_tier_slave: c.replication_multi_tier_slave,
            ring: c.replication_multi_master_ring,
            wsrep: c.replication_multi_master_wsrep,
        }
    }
}

/// 单台节点的输入
#[derive(Debug, Clone, Copy)]
pub struct ProbeInput<'a> {
    pub url: &'a str,
    /// 探测失败时为 None
    pub snapshot: Option<&'a ServerSnapshot>,
    pub maintenance: bool,
}

/// 识别结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub kind: TopologyKind,
    /// 主库(多主拓扑中为可写的那一个)
    pub primary: Option<String>,
    /// 多主拓扑的主库集合
    pub primaries: Vec<String>,
    /// 叶子从库(不含中继)
    pub replicas: Vec<String>,
    /// 中继节点
    pub relays: Vec<String>,
    pub roles: BTreeMap<String, ServerRole>,
    /// 同时可写的主库
    pub split_primary: Vec<String>,
    /// 主库没有出现,沿用了上一次的主库
    pub primary_retained: bool,
}

impl Classification {
    pub fn role(&self, url: &str) -> ServerRole {
        self.roles.get(url).copied().unwrap_or_default()
    }
}

/// 推导拓扑
///
/// # Arguments
/// * `inputs` - 按配置顺序排列的节点快照
/// * `flags` - 多主相关开关
/// * `last_primary` - 上一次识别出的主库
pub fn classify(inputs: &[ProbeInput<'_>], flags: &TopologyFlags, last_primary: Option<&str>) -> Classification {
    let mut out = Classification::default();
    let by_url: HashMap<&str, &ProbeInput<'_>> = inputs.iter().map(|i| (i.url, i)).collect();

    for input in inputs {
        let role = match input.snapshot {
            None => ServerRole::Failed,
            Some(_) => ServerRole::Unknown,
        };
        out.roles.insert(input.url.to_string(), role);
    }

    let reachable: Vec<(&str, &ServerSnapshot)> = inputs
        .iter()
        .filter_map(|i| i.snapshot.map(|s| (i.url, s)))
        .collect();

    // 每个从库的复制源,解析为已配置节点的 url
    let sources: HashMap<&str, String> = reachable
        .iter()
        .filter_map(|(url, s)| {
            let repl = s.replication.as_ref()?;
            let known = inputs.iter().map(|i| (i.url, i.snapshot.map(|s| s.server_id)));
            Some((*url, resolve_source(&repl.source, repl.source_server_id, known)))
        })
        .collect();

    if flags.wsrep || reachable.iter().any(|(_, s)| s.wsrep.is_some()) {
        classify_wsrep(&mut out, &reachable);
        apply_maintenance(&mut out, inputs);
        return out;
    }

    if flags.multi_master || flags.ring {
        if let Some(cycle) = find_cycle(inputs, &sources) {
            out.kind = if cycle.len() > 2 || flags.ring {
                TopologyKind::MultiMasterRing
            } else {
                TopologyKind::MultiMaster
            };
            for url in &cycle {
                out.roles.insert(url.clone(), ServerRole::Primary);
            }
            out.primary = cycle
                .iter()
                .find(|u| by_url.get(u.as_str()).and_then(|i| i.snapshot).map(|s| !s.read_only).unwrap_or(false))
                .cloned();
            let members: HashSet<&str> = cycle.iter().map(|s| s.as_str()).collect();
            for (url, _) in &reachable {
                if members.contains(url) {
                    continue;
                }
                if let Some(src) = sources.get(url) {
                    if members.contains(src.as_str()) {
                        out.replicas.push(url.to_string());
                        out.roles.insert(url.to_string(), ServerRole::Replica);
                    }
                }
            }
            out.primaries = cycle;
            apply_maintenance(&mut out, inputs);
            return out;
        }
    }

    let roots: Vec<&str> = reachable
        .iter()
        .filter(|(_, s)| !s.is_replica() && !s.is_binlog_server && (!s.read_only || s.connected_replicas > 0))
        .map(|(u, _)| *u)
        .collect();
    let writable_roots: Vec<&str> = roots
        .iter()
        .copied()
        .filter(|u| by_url.get(u).and_then(|i| i.snapshot).map(|s| !s.read_only).unwrap_or(false))
        .collect();

    if writable_roots.len() > 1 {
        if flags.multi_master {
            out.kind = TopologyKind::MultiMaster;
            for url in &writable_roots {
                out.roles.insert(url.to_string(), ServerRole::Primary);
            }
            out.primaries = writable_roots.iter().map(|s| s.to_string()).collect();
            out.primary = out.primaries.first().cloned();
        } else {
            out.kind = TopologyKind::Unknown;
            out.split_primary = writable_roots.iter().map(|s| s.to_string()).collect();
            assign_replicas(&mut out, &reachable, &sources);
        }
        apply_maintenance(&mut out, inputs);
        return out;
    }

    let primary: Option<String> = if let Some(url) = writable_roots.first() {
        Some(url.to_string())
    } else if roots.len() == 1 {
        Some(roots[0].to_string())
    } else if roots.len() > 1 {
        // 多个只读根节点,取被从库引用的那一个
        let referenced: Vec<&str> = roots
            .iter()
            .copied()
            .filter(|r| sources.values().any(|s| s == r))
            .collect();
        if referenced.len() == 1 {
            Some(referenced[0].to_string())
        } else {
            None
        }
    } else {
        retained_primary(inputs, &sources, last_primary)
    };

    if let Some(p) = &primary {
        let reachable_primary = by_url.get(p.as_str()).map(|i| i.snapshot.is_some()).unwrap_or(false);
        if reachable_primary {
            out.roles.insert(p.clone(), ServerRole::Primary);
        } else {
            out.primary_retained = true;
            out.roles.insert(p.clone(), ServerRole::Failed);
        }
        out.primaries = vec![p.clone()];
    }
    out.primary = primary.clone();
    assign_replicas(&mut out, &reachable, &sources);

    out.kind = if primary.is_none() {
        TopologyKind::Unknown
    } else if reachable.iter().any(|(_, s)| s.is_binlog_server) {
        TopologyKind::BinlogServer
    } else if !out.relays.is_empty() {
        TopologyKind::MultiTierSlave
    } else {
        let primary_gtid = primary
            .as_deref()
            .and_then(|p| by_url.get(p))
            .and_then(|i| i.snapshot)
            .map(|s| !s.binlog_gtid.is_empty())
            .unwrap_or(false);
        let replicas_gtid = !out.replicas.is_empty()
            && out.replicas.iter().all(|r| {
                by_url
                    .get(r.as_str())
                    .and_then(|i| i.snapshot)
                    .and_then(|s| s.replication.as_ref())
                    .map(|repl| repl.using_gtid)
                    .unwrap_or(false)
            });
        if primary_gtid || replicas_gtid {
            TopologyKind::MasterSlave
        } else {
            TopologyKind::MasterSlaveNoGtid
        }
    };

    apply_maintenance(&mut out, inputs);
    out
}

fn classify_wsrep(out: &mut Classification, reachable: &[(&str, &ServerSnapshot)]) {
    out.kind = TopologyKind::MultiMasterWsrep;
    for (url, s) in reachable {
        if s.wsrep.as_ref().map(|w| w.synced).unwrap_or(false) {
            out.primaries.push(url.to_string());
            out.roles.insert(url.to_string(), ServerRole::Primary);
        }
    }
    out.primary = reachable
        .iter()
        .find(|(url, s)| !s.read_only && out.primaries.iter().any(|p| p == url))
        .map(|(url, _)| url.to_string());
}

/// 解析复制源为已配置节点,先比地址再比 server_id
///
/// # Arguments
/// * `source` - 从库上配置的复制源地址(可能是别名或 IP)
/// * `source_server_id` - 从库报告的复制源 server_id
/// * `known` - 已配置节点的 (url, 最近一次看到的 server_id)
pub(crate) fn resolve_source<'a, I>(source: &HostPort, source_server_id: Option<u32>, known: I) -> String
where
    I: IntoIterator<Item = (&'a str, Option<u32>)>,
{
    let url = source.url();
    let mut by_id = None;
    for (candidate, id) in known {
        if candidate == url {
            return url;
        }
        if by_id.is_none() && source_server_id.is_some() && id == source_server_id {
            by_id = Some(candidate.to_string());
        }
    }
    by_id.unwrap_or(url)
}

/// 寻找互为复制源的环
fn find_cycle(inputs: &[ProbeInput<'_>], sources: &HashMap<&str, String>) -> Option<Vec<String>> {
    for start in inputs {
        let mut path: Vec<String> = vec![start.url.to_string()];
        let mut current = start.url.to_string();
        while let Some(next) = sources.get(current.as_str()) {
            if next == start.url {
                if path.len() >= 2 {
                    let mut cycle = path;
                    cycle.sort();
                    return Some(cycle);
                }
                break;
            }
            if path.contains(next) {
                break;
            }
            path.push(next.clone());
            current = next.clone();
        }
    }
    None
}

/// 没有节点呈现为主库时,推断仍不可达的原主库
fn retained_primary(
    inputs: &[ProbeInput<'_>],
    sources: &HashMap<&str, String>,
    last_primary: Option<&str>,
) -> Option<String> {
    let unreachable = |url: &str| {
        inputs
            .iter()
            .any(|i| i.url == url && i.snapshot.is_none())
    };
    if let Some(last) = last_primary {
        if unreachable(last) {
            return Some(last.to_string());
        }
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for src in sources.values() {
        if unreachable(src) {
            *counts.entry(src.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(url, _)| url.to_string())
}

fn assign_replicas(
    out: &mut Classification,
    reachable: &[(&str, &ServerSnapshot)],
    sources: &HashMap<&str, String>,
) {
    for (url, snapshot) in reachable {
        if !snapshot.is_replica() && !snapshot.is_binlog_server {
            continue;
        }
        let feeds_others = sources.values().any(|s| s == url);
        if feeds_others || snapshot.is_binlog_server {
            out.relays.push(url.to_string());
            out.roles.insert(url.to_string(), ServerRole::Relay);
        } else {
            out.replicas.push(url.to_string());
            out.roles.insert(url.to_string(), ServerRole::Replica);
        }
    }
}

fn apply_maintenance(out: &mut Classification, inputs: &[ProbeInput<'_>]) {
    for input in inputs {
        if input.maintenance && input.snapshot.is_some() {
            out.roles.insert(input.url.to_string(), ServerRole::Maintenance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{IoThreadState, ReplicationStatus, WsrepStatus};
    use proptest::prelude::*;
    use repman_common::GtidSet;

    fn primary(gtid: &str) -> ServerSnapshot {
        ServerSnapshot {
            read_only: false,
            log_bin: true,
            binlog_gtid: GtidSet::parse(gtid).unwrap(),
            ..Default::default()
        }
    }

    fn replica_of(source: &str, lag: u64) -> ServerSnapshot {
        ServerSnapshot {
            read_only: true,
            log_bin: true,
            replication: Some(ReplicationStatus {
                source: HostPort::parse(source).unwrap(),
                io_state: IoThreadState::Yes,
                sql_running: true,
                seconds_behind: Some(lag),
                using_gtid: true,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn input<'a>(url: &'a str, s: Option<&'a ServerSnapshot>) -> ProbeInput<'a> {
        ProbeInput { url, snapshot: s, maintenance: false }
    }

    #[test]
    fn test_master_slave() {
        let p = primary("0-1-10");
        let r1 = replica_of("db1:3306", 0);
        let r2 = replica_of("db1:3306", 3);
        let inputs = vec![
            input("db1:3306", Some(&p)),
            input("db2:3306", Some(&r1)),
            input("db3:3306", Some(&r2)),
        ];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.kind, TopologyKind::MasterSlave);
        assert_eq!(c.primary.as_deref(), Some("db1:3306"));
        assert_eq!(c.replicas, vec!["db2:3306".to_string(), "db3:3306".to_string()]);
        assert_eq!(c.role("db1:3306"), ServerRole::Primary);
        assert_eq!(c.role("db3:3306"), ServerRole::Replica);
    }

    #[test]
    fn test_no_gtid() {
        let p = primary("");
        let mut r = replica_of("db1:3306", 0);
        if let Some(repl) = r.replication.as_mut() {
            repl.using_gtid = false;
        }
        let inputs = vec![input("db1:3306", Some(&p)), input("db2:3306", Some(&r))];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.kind, TopologyKind::MasterSlaveNoGtid);
    }

    #[test]
    fn test_split_primary() {
        let a = primary("0-1-10");
        let b = primary("0-2-10");
        let r = replica_of("db1:3306", 0);
        let inputs = vec![
            input("db1:3306", Some(&a)),
            input("db2:3306", Some(&b)),
            input("db3:3306", Some(&r)),
        ];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.kind, TopologyKind::Unknown);
        assert!(c.primary.is_none());
        assert_eq!(c.split_primary.len(), 2);
        assert!(c.roles.values().all(|r| *r != ServerRole::Primary));
    }

    #[test]
    fn test_retains_unreachable_primary() {
        let r1 = replica_of("db1:3306", 0);
        let r2 = replica_of("db1:3306", 0);
        let inputs = vec![
            input("db1:3306", None),
            input("db2:3306", Some(&r1)),
            input("db3:3306", Some(&r2)),
        ];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.primary.as_deref(), Some("db1:3306"));
        assert!(c.primary_retained);
        assert_eq!(c.role("db1:3306"), ServerRole::Failed);

        let c = classify(&inputs, &TopologyFlags::default(), Some("db1:3306"));
        assert!(c.primary_retained);
    }

    #[test]
    fn test_relay_is_multi_tier() {
        let p = primary("0-1-10");
        let relay = replica_of("db1:3306", 0);
        let leaf = replica_of("db2:3306", 0);
        let inputs = vec![
            input("db1:3306", Some(&p)),
            input("db2:3306", Some(&relay)),
            input("db3:3306", Some(&leaf)),
        ];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.kind, TopologyKind::MultiTierSlave);
        assert_eq!(c.relays, vec!["db2:3306".to_string()]);
        assert_eq!(c.role("db2:3306"), ServerRole::Relay);
    }

    #[test]
    fn test_multi_master_pair() {
        let mut a = replica_of("db2:3306", 0);
        a.read_only = false;
        let b = replica_of("db1:3306", 0);
        let inputs = vec![input("db1:3306", Some(&a)), input("db2:3306", Some(&b))];
        let flags = TopologyFlags { multi_master: true, ..Default::default() };
        let c = classify(&inputs, &flags, None);
        assert_eq!(c.kind, TopologyKind::MultiMaster);
        assert_eq!(c.primaries.len(), 2);
        assert_eq!(c.primary.as_deref(), Some("db1:3306"));
    }

    #[test]
    fn test_wsrep() {
        let node = ServerSnapshot {
            wsrep: Some(WsrepStatus { cluster_size: 3, synced: true }),
            ..Default::default()
        };
        let inputs = vec![input("g1:3306", Some(&node)), input("g2:3306", Some(&node))];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.kind, TopologyKind::MultiMasterWsrep);
        assert_eq!(c.primaries.len(), 2);
    }

    #[test]
    fn test_maintenance_role() {
        let p = primary("0-1-10");
        let r = replica_of("db1:3306", 0);
        let inputs = vec![
            input("db1:3306", Some(&p)),
            ProbeInput { url: "db2:3306", snapshot: Some(&r), maintenance: true },
        ];
        let c = classify(&inputs, &TopologyFlags::default(), None);
        assert_eq!(c.role("db2:3306"), ServerRole::Maintenance);
        assert_eq!(c.primary.as_deref(), Some("db1:3306"));
    }

    fn arb_snapshot() -> impl Strategy<Value = Option<ServerSnapshot>> {
        prop_oneof![
            Just(None),
            (any::<bool>(), 0u32..3).prop_map(|(ro, dumps)| Some(ServerSnapshot {
                read_only: ro,
                connected_replicas: dumps,
                ..Default::default()
            })),
            (0usize..5, any::<bool>()).prop_map(|(src, ro)| Some(ServerSnapshot {
                read_only: ro,
                replication: Some(ReplicationStatus {
                    source: HostPort::new(format!("db{}", src), 3306),
                    io_state: IoThreadState::Yes,
                    sql_running: true,
                    ..Default::default()
                }),
                ..Default::default()
            })),
        ]
    }

    proptest! {
        #[test]
        fn test_at_most_one_primary(snaps in prop::collection::vec(arb_snapshot(), 1..6), mm in any::<bool>()) {
            let urls: Vec<String> = (0..snaps.len()).map(|i| format!("db{}:3306", i)).collect();
            let inputs: Vec<ProbeInput<'_>> = urls
                .iter()
                .zip(snaps.iter())
                .map(|(u, s)| ProbeInput { url: u, snapshot: s.as_ref(), maintenance: false })
                .collect();
            let flags = TopologyFlags { multi_master: mm, ..Default::default() };
            let c = classify(&inputs, &flags, None);
            let primaries = c.roles.values().filter(|r| **r == ServerRole::Primary).count();
            if !c.kind.is_multi_primary() {
                prop_assert!(primaries <= 1);
            }
            prop_assert_eq!(c.roles.len(), inputs.len());
        }
    }
}
