//! 集群状态机模块
//!
//! 每个集群维护两张条件表:
//! - **current**: 本次 tick 检测到的异常
//! - **previous**: 上一次 tick 的结果
//!
//! tick 结束时计算差异,新出现的以 `OPENED` 前缀记录,消失的以 `RESOLV` 前缀记录,
//! 持续存在的不输出。同时推进 SLA 计数器。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// 条件标识
pub mod codes {
    pub const ERR_UNREACHABLE: &str = "ERR00001";
    pub const ERR_ACCESS_DENIED: &str = "ERR00002";
    pub const ERR_PERMISSION_DENIED: &str = "ERR00003";
    pub const ERR_REPLICATION_STOPPED: &str = "ERR00004";
    pub const ERR_PROTOCOL: &str = "ERR00005";
    pub const ERR_NO_REPLICA: &str = "ERR00010";
    pub const ERR_NO_PRIMARY: &str = "ERR00012";
    pub const ERR_PRIMARY_FALSE_POSITIVE: &str = "ERR00016";
    pub const ERR_PASSIVE_MODE: &str = "ERR00022";
    pub const ERR_FAILOVER_LIMIT: &str = "ERR00027";
    pub const ERR_FAILOVER_TOO_SOON: &str = "ERR00029";
    pub const ERR_NO_CANDIDATE: &str = "ERR00032";
    pub const WARN_DELAY: &str = "WARN0010";
    pub const WARN_FILTERS: &str = "WARN0011";
    pub const WARN_WRONG_SOURCE: &str = "WARN0012";
    pub const WARN_PRIMARY_SUSPECT: &str = "WARN0013";
    pub const WARN_MAINTENANCE: &str = "WARN0014";
    pub const ERR_SPLIT_PRIMARY: &str = "ERR_SPLIT_PRIMARY";
    pub const ERR_SPLIT_BRAIN: &str = "ERR_SPLIT_BRAIN";
    pub const ERR_SPLIT_BRAIN_AVOIDED: &str = "ERR_SPLIT_BRAIN_AVOIDED";
    pub const INFO_FAILOVER_COMPLETE: &str = "INFO_FAILOVER_COMPLETE";
    pub const ERR_REPLICA_REPOINT_PREFIX: &str = "ERR_REPLICA_REPOINT_";
}

/// 条件级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionKind {
    Warning,
    Error,
}

/// 一条打开的条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub kind: ConditionKind,
    pub desc: String,
    /// 产生该条件的组件
    pub from: String,
    pub server_url: Option<String>,
}

impl Condition {
    pub fn error(from: &str, desc: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Error,
            desc: desc.into(),
            from: from.to_string(),
            server_url: None,
        }
    }

    pub fn warning(from: &str, desc: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Warning,
            desc: desc.into(),
            from: from.to_string(),
            server_url: None,
        }
    }

    pub fn on_server(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }
}

/// tick 结束时的差异
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub opened: Vec<(String, Condition)>,
    pub resolved: Vec<(String, Condition)>,
}

impl StateDelta {
    /// 日志行形式
    pub fn lines(&self) -> Vec<String> {
        self.opened
            .iter()
            .map(|(k, c)| format!("OPENED {} : {}", k, c.desc))
            .chain(
                self.resolved
                    .iter()
                    .map(|(k, c)| format!("RESOLV {} : {}", k, c.desc)),
            )
            .collect()
    }
}

pub type ConditionMap = BTreeMap<String, Condition>;

/// 条件状态机
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: ConditionMap,
    previous: ConditionMap,
    ticks: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从持久化的条件表恢复
    pub fn restore(previous: ConditionMap) -> Self {
        Self {
            previous,
            ..Default::default()
        }
    }

    /// 向本次 tick 加入一条条件
    ///
    /// 同一标识只保留一条,多台节点命中时把细节追加到描述中。
    pub fn add(&mut self, key: &str, condition: Condition) {
        match self.current.get_mut(key) {
            Some(existing) => {
                if !existing.desc.contains(&condition.desc) {
                    existing.desc.push_str("; ");
                    existing.desc.push_str(&condition.desc);
                }
            }
            None => {
                self.current.insert(key.to_string(), condition);
            }
        }
    }

    /// 上一次 tick 是否处于该条件
    pub fn is_in_state(&self, key: &str) -> bool {
        self.previous.contains_key(key)
    }

    /// 本次 tick 是否已加入该条件
    pub fn is_in_current(&self, key: &str) -> bool {
        self.current.contains_key(key)
    }

    /// 结束一次 tick: 计算差异并把 current 换入 previous
    pub fn close_tick(&mut self, cluster: &str) -> StateDelta {
        let mut delta = StateDelta::default();
        for (key, cond) in &self.current {
            if !self.previous.contains_key(key) {
                match cond.kind {
                    ConditionKind::Error => warn!(cluster = %cluster, "OPENED {} : {}", key, cond.desc),
                    ConditionKind::Warning => info!(cluster = %cluster, "OPENED {} : {}", key, cond.desc),
                }
                delta.opened.push((key.clone(), cond.clone()));
            }
        }
        for (key, cond) in &self.previous {
            if !self.current.contains_key(key) {
                info!(cluster = %cluster, "RESOLV {} : {}", key, cond.desc);
                delta.resolved.push((key.clone(), cond.clone()));
            }
        }
        self.previous = std::mem::take(&mut self.current);
        self.ticks += 1;
        delta
    }

    /// 已完成的 tick 数
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn previous(&self) -> &ConditionMap {
        &self.previous
    }

    pub fn open_errors(&self) -> Vec<(String, Condition)> {
        self.open_of(ConditionKind::Error)
    }

    pub fn open_warnings(&self) -> Vec<(String, Condition)> {
        self.open_of(ConditionKind::Warning)
    }

    pub fn has_open_errors(&self) -> bool {
        self.previous
            .values()
            .any(|c| c.kind == ConditionKind::Error)
    }

    fn open_of(&self, kind: ConditionKind) -> Vec<(String, Condition)> {
        // BTreeMap 迭代即按键排序
        self.previous
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect()
    }
}

/// SLA 判定条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlaPredicates {
    /// 主库已识别、可达、可写、不在维护
    pub valid_primary: bool,
    /// 主库半同步生效
    pub semisync: bool,
    /// 最大复制延迟未超过阈值
    pub not_delayed: bool,
    /// 至少有一个可达从库
    pub has_replica: bool,
}

/// SLA 累加器,单位秒
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sla {
    pub first_seen: i64,
    pub last_update: i64,
    pub uptime: u64,
    pub uptime_failable: u64,
    pub uptime_semisync: u64,
}

impl Sla {
    pub fn new(now: i64) -> Self {
        Self {
            first_seen: now,
            last_update: now,
            uptime: 0,
            uptime_failable: 0,
            uptime_semisync: 0,
        }
    }

    /// 按判定结果累加自上次更新以来的时间
    pub fn advance(&mut self, now: i64, p: SlaPredicates) {
        let elapsed = if now > self.last_update {
            (now - self.last_update) as u64
        } else {
            0
        };
        if p.valid_primary {
            self.uptime += elapsed;
            if p.not_delayed && p.has_replica {
                self.uptime_failable += elapsed;
            }
            if p.semisync {
                self.uptime_semisync += elapsed;
            }
        }
        if now > self.last_update {
            self.last_update = now;
        }
    }

    pub fn uptime_pct(&self, now: i64) -> String {
        format_pct(self.uptime, now - self.first_seen)
    }

    pub fn uptime_failable_pct(&self, now: i64) -> String {
        format_pct(self.uptime_failable, now - self.first_seen)
    }

    pub fn uptime_semisync_pct(&self, now: i64) -> String {
        format_pct(self.uptime_semisync, now - self.first_seen)
    }
}

/// 百分比格式化,`100.00000` 固定显示为 `99.99999`
pub fn format_pct(counter: u64, elapsed: i64) -> String {
    if elapsed <= 0 {
        return "0.00000".to_string();
    }
    let pct = 100.0 * counter as f64 / elapsed as f64;
    let formatted = format!("{:.5}", pct);
    if pct >= 100.0 || formatted == "100.00000" {
        "99.99999".to_string()
    } else {
        formatted
    }
}
